use serde::Serialize;

use crate::extract::RawRecord;

const UNKNOWN_MEDIA_TYPE: &str = "unknown";

/// A fully-defaulted APOD entry, ready for storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NormalizedRecord {
    pub title: String,
    pub explanation: String,
    pub media_url: String,
    /// `YYYY-MM-DD`; the natural key. Not validated here.
    pub date: String,
    pub media_type: String,
}

/// Fill every absent field with its default. Values are passed through verbatim.
pub fn transform(raw: RawRecord) -> NormalizedRecord {
    NormalizedRecord {
        title: raw.title.unwrap_or_default(),
        explanation: raw.explanation.unwrap_or_default(),
        media_url: raw.url.unwrap_or_default(),
        date: raw.date.unwrap_or_default(),
        media_type: raw
            .media_type
            .unwrap_or_else(|| UNKNOWN_MEDIA_TYPE.to_string()),
    }
}

use std::time::{Duration, Instant};

use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::settings::ApiSettings;

const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// The APOD response as decoded. Every field may be absent; unknown keys are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RawRecord {
    pub title: Option<String>,
    pub explanation: Option<String>,
    pub url: Option<String>,
    pub date: Option<String>,
    pub media_type: Option<String>,
}

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("transport error: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("HTTP status {code}")]
    HttpStatus { code: u16 },
    #[error("malformed response body: {0}")]
    Decode(#[source] serde_json::Error),
}

impl ExtractionError {
    pub fn kind(&self) -> &'static str {
        match self {
            ExtractionError::Transport(_) => "transport",
            ExtractionError::HttpStatus { .. } => "http_status",
            ExtractionError::Decode(_) => "decode",
        }
    }
}

/// Single-shot client for the APOD endpoint.
pub struct ApodClient {
    client: Client,
    endpoint: String,
    api_key: String,
}

impl ApodClient {
    pub fn new(endpoint: &str, api_key: &str, timeout: Duration) -> Result<Self, ExtractionError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(ExtractionError::Transport)?;
        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            api_key: api_key.to_string(),
        })
    }

    pub fn from_settings(api: &ApiSettings, api_key: &str) -> Result<Self, ExtractionError> {
        Self::new(&api.endpoint, api_key, Duration::from_secs(api.timeout_secs))
    }

    /// One GET, no retries. The record is returned exactly as decoded.
    pub async fn extract(&self) -> Result<RawRecord, ExtractionError> {
        info!("Fetching APOD: {}", self.endpoint);
        let start = Instant::now();

        let response = self
            .client
            .get(&self.endpoint)
            .query(&[("api_key", self.api_key.as_str())])
            .send()
            .await
            .map_err(|e| ExtractionError::Transport(e.without_url()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ExtractionError::HttpStatus {
                code: status.as_u16(),
            });
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| ExtractionError::Transport(e.without_url()))?;
        let raw: RawRecord = serde_json::from_slice(&body).map_err(ExtractionError::Decode)?;

        debug!(
            latency_ms = start.elapsed().as_millis() as u64,
            bytes = body.len(),
            "APOD response decoded"
        );
        Ok(raw)
    }
}

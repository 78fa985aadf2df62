use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat, FileSourceFile};
use serde::Deserialize;

use crate::credentials::ConnectionInfo;

pub const DEFAULT_ENDPOINT: &str = "https://api.nasa.gov/planetary/apod";
const DEFAULT_CONFIG_FILE: &str = "apod";

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub api: ApiSettings,
    pub storage: StorageSettings,
    #[serde(default)]
    pub connections: HashMap<String, ConnectionInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiSettings {
    pub endpoint: String,
    /// Connection name holding the `api_key`.
    pub conn_id: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageSettings {
    /// Connection name holding the SQLite `dsn`.
    pub conn_id: String,
    pub busy_timeout_ms: u64,
}

impl Settings {
    /// Defaults, then the TOML file (`apod.toml` unless a path is given), then `APOD_*` env vars.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(p) => File::from(p).required(true),
            None => File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };
        Self::build(Some(file), true)
    }

    fn build(file: Option<File<FileSourceFile, FileFormat>>, env: bool) -> Result<Self> {
        let mut builder = Config::builder()
            .set_default("api.endpoint", DEFAULT_ENDPOINT)?
            .set_default("api.conn_id", "nasa_api")?
            .set_default("api.timeout_secs", 30)?
            .set_default("storage.conn_id", "apod_storage")?
            .set_default("storage.busy_timeout_ms", 5000)?
            .set_default("connections.apod_storage.dsn", "data/apod.sqlite")?;

        if let Some(file) = file {
            builder = builder.add_source(file);
        }
        if env {
            builder = builder.add_source(
                Environment::with_prefix("APOD")
                    .prefix_separator("_")
                    .separator("__"),
            );
        }

        builder
            .build()
            .context("Failed to assemble settings")?
            .try_deserialize()
            .context("Invalid settings")
    }
}

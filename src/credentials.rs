use std::collections::HashMap;

use serde::Deserialize;
use thiserror::Error;

use crate::settings::Settings;

/// A named connection as handed out by the credential store.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConnectionInfo {
    pub api_key: Option<String>,
    /// SQLite database path.
    pub dsn: Option<String>,
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("unknown connection '{0}'")]
    UnknownConnection(String),
    #[error("connection '{name}' has no {field}")]
    MissingField { name: String, field: &'static str },
}

/// Resolves logical connection names to their secrets.
pub trait Credentials {
    fn get_connection(&self, name: &str) -> Result<ConnectionInfo, CredentialError>;

    fn api_key(&self, name: &str) -> Result<String, CredentialError> {
        self.get_connection(name)?
            .api_key
            .filter(|k| !k.is_empty())
            .ok_or_else(|| CredentialError::MissingField {
                name: name.to_string(),
                field: "api_key",
            })
    }

    fn storage_dsn(&self, name: &str) -> Result<String, CredentialError> {
        self.get_connection(name)?
            .dsn
            .filter(|d| !d.is_empty())
            .ok_or_else(|| CredentialError::MissingField {
                name: name.to_string(),
                field: "dsn",
            })
    }
}

impl Credentials for HashMap<String, ConnectionInfo> {
    fn get_connection(&self, name: &str) -> Result<ConnectionInfo, CredentialError> {
        self.get(name)
            .cloned()
            .ok_or_else(|| CredentialError::UnknownConnection(name.to_string()))
    }
}

impl Credentials for Settings {
    fn get_connection(&self, name: &str) -> Result<ConnectionInfo, CredentialError> {
        self.connections.get_connection(name)
    }
}

// src/error.rs

use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Coarse failure class used for recovery decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Parse,
    Network,
    Protocol,
    Persistence,
    Config,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("could not parse url `{input}`: {reason}")]
    Parse { input: String, reason: String },

    #[error("network error talking to {endpoint}: {message}")]
    Network { endpoint: String, message: String },

    #[error("request to {endpoint} timed out after {}ms", .after.as_millis())]
    Timeout { endpoint: String, after: Duration },

    #[error("malformed response from {endpoint}: {message}")]
    Protocol { endpoint: String, message: String },

    #[error("verdict store: {0}")]
    Persistence(String),

    /// The stored record exists but does not decode.
    #[error("verdict store record is unreadable: {0}")]
    CorruptRecord(String),

    #[error("config: {0}")]
    Config(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Parse { .. } => ErrorKind::Parse,
            EngineError::Network { .. } | EngineError::Timeout { .. } => ErrorKind::Network,
            EngineError::Protocol { .. } => ErrorKind::Protocol,
            EngineError::Persistence(_) | EngineError::CorruptRecord(_) => ErrorKind::Persistence,
            EngineError::Config(_) => ErrorKind::Config,
        }
    }

    /// Network and protocol failures recover the same way: keep stale state,
    /// retry later or fall back to the "could not verify" path.
    pub fn is_recoverable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Network | ErrorKind::Protocol)
    }

    pub(crate) fn from_http(endpoint: &str, timeout_secs: u64, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            EngineError::Timeout {
                endpoint: endpoint.to_string(),
                after: Duration::from_secs(timeout_secs),
            }
        } else if err.is_decode() {
            EngineError::Protocol {
                endpoint: endpoint.to_string(),
                message: err.to_string(),
            }
        } else {
            EngineError::Network {
                endpoint: endpoint.to_string(),
                message: err.to_string(),
            }
        }
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(err: rusqlite::Error) -> Self {
        EngineError::Persistence(err.to_string())
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

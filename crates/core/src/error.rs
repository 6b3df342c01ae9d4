//! Error types for batchpilot-core

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for batchpilot-core
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for batchpilot-core
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration file not found
    #[error("Configuration file not found: {0}")]
    ConfigNotFound(PathBuf),

    /// Invalid configuration format
    #[error("Invalid configuration format: {0}")]
    InvalidConfig(String),

    /// Malformed or missing protocol field (fatal, never retried)
    #[error("Protocol validation failed: {0}")]
    Validation(String),

    /// Connection failure or non-2xx answer from the batch API
    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    /// Failure while transferring one file to its upload target
    #[error("Transfer failed: {0}")]
    Transfer(String),

    /// Poll budget exhausted before the master batch reached a terminal status
    #[error("Master batch {master_batch_id} still processing after {}s", .elapsed.as_secs())]
    Timeout {
        master_batch_id: String,
        elapsed: Duration,
    },

    /// Authentication error
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] toml::ser::Error),

    /// Deserialization error
    #[error("Deserialization error: {0}")]
    Deserialization(#[from] toml::de::Error),

    /// HTTP client error
    #[error("HTTP client error: {0}")]
    HttpClient(String),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Cancelled by the caller
    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    /// Whether the operation that produced this error may be attempted again.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::TransientNetwork(_) | Error::Transfer(_))
    }

    /// Whether this error must abort the whole run.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Validation(_) | Error::Authentication(_) | Error::Cancelled
        )
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            Error::TransientNetwork(err.to_string())
        } else if err.is_decode() {
            Error::Validation(err.to_string())
        } else if err.is_builder() {
            Error::HttpClient(err.to_string())
        } else {
            Error::TransientNetwork(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::TransientNetwork("reset".into()).is_transient());
        assert!(Error::Transfer("503".into()).is_transient());
        assert!(!Error::Validation("missing id".into()).is_transient());
        assert!(!Error::Cancelled.is_transient());
        assert!(!Error::Timeout {
            master_batch_id: "mb-1".to_string(),
            elapsed: Duration::from_secs(300),
        }
        .is_transient());
    }

    #[test]
    fn test_fatal_classification() {
        assert!(Error::Validation("missing id".into()).is_fatal());
        assert!(Error::Authentication("401".into()).is_fatal());
        assert!(!Error::TransientNetwork("reset".into()).is_fatal());
    }

    #[test]
    fn test_timeout_message() {
        let err = Error::Timeout {
            master_batch_id: "mb-1".to_string(),
            elapsed: Duration::from_secs(300),
        };
        assert_eq!(err.to_string(), "Master batch mb-1 still processing after 300s");
    }
}

//! Error types for cloudlift

use std::io;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for cloudlift
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // Fingerprint errors
    #[error("Hash worker failed on chunk {index}: {reason}")]
    WorkerFailure { index: usize, reason: String },

    // Transfer errors
    #[error("Transfer of chunk {index} failed: {reason}")]
    TransferFailure { index: usize, reason: String },

    #[error("Upload incomplete: chunk {index} failed with {uploaded}/{total} chunks stored: {reason}")]
    PartialFailure {
        index: usize,
        uploaded: usize,
        total: usize,
        reason: String,
    },

    #[error("Merge failed: {0}")]
    MergeFailure(String),

    #[error("Operation cancelled")]
    Cancelled,

    // Remote service errors
    #[error("Server returned error {code}: {message}")]
    Remote { code: i32, message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    // Registry errors
    #[error("Task not found: {0}")]
    TaskNotFound(u64),

    // Config errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Cancellation is a normal outcome, not a failure
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Whether the transport may retry the request that produced this error
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Http(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.is_request()
                    || e.is_body()
                    || e.status().map(|s| s.is_server_error()).unwrap_or(false)
            }
            Error::Remote { code, .. } => *code >= 500,
            Error::Io(_) => true,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        if e.is_cancelled() {
            Error::Cancelled
        } else {
            Error::Internal(format!("task panicked: {}", e))
        }
    }
}

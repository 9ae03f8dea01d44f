//! Error types for gantry-state

use thiserror::Error;

/// Errors raised by the run ledger and the blob store.
#[derive(Error, Debug)]
pub enum StorageError {
    /// No run with this ID exists.
    #[error("run not found: {run_id}")]
    RunNotFound { run_id: String },

    /// The requested operation is not allowed in the run's current status.
    #[error("run {run_id} is {status}, expected {expected}")]
    InvalidRunState {
        run_id: String,
        status: String,
        expected: String,
    },

    /// A digest string is not 64 hex characters.
    #[error("invalid content digest: {digest}")]
    InvalidDigest { digest: String },

    /// No blob is stored under this digest.
    #[error("blob not found: {digest}")]
    NotFound { digest: String },

    /// Filesystem error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Record (de)serialization error
    #[error("serialization failed: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

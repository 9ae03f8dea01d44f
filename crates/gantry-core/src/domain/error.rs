//! Domain-level error taxonomy for Gantry.

use std::path::PathBuf;

use gantry_state::StorageError;

/// Failures of the remote execution transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("trust store {path}: {source}")]
    TrustStore {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("host key fetch for {host} failed: {message}")]
    HostKeyFetch { host: String, message: String },

    #[error("host {host} is not in the trust store and live key fetch is disabled")]
    UnknownHost { host: String },

    #[error("connection to {host} failed: {message}")]
    Connection { host: String, message: String },

    #[error("remote command timed out after {secs}s")]
    Timeout { secs: u64 },
}

/// Failures reaching the source repository.
#[derive(Debug, thiserror::Error)]
pub enum TriggerError {
    #[error("source check for branch {branch} failed: {message}")]
    SourceUnavailable { branch: String, message: String },

    #[error("malformed source listing for branch {branch}: {line}")]
    MalformedListing { branch: String, line: String },
}

/// Gantry domain errors.
#[derive(Debug, thiserror::Error)]
pub enum GantryError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("validation failed in stage {stage} (exit code {exit_code})")]
    Validation { stage: String, exit_code: i32 },

    #[error("tests failed in stage {stage} (exit code {exit_code})")]
    TestFailure { stage: String, exit_code: i32 },

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("trigger error: {0}")]
    Trigger(#[from] TriggerError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("digest mismatch for {path}: expected {expected}, got {actual}")]
    DigestMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("another run is in progress (lock held on {})", .lock.display())]
    RunInProgress { lock: PathBuf },

    #[error("git error: {0}")]
    Git(String),

    #[error("invalid poll schedule: {0}")]
    Schedule(String),

    #[error("invalid pipeline definition: {0}")]
    PipelineDefinition(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for Gantry domain operations.
pub type Result<T> = std::result::Result<T, GantryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gantry_error_display() {
        let err = GantryError::Configuration("GANTRY_DEPLOY_HOST is not set".to_string());
        assert!(err.to_string().contains("configuration error"));

        let err = GantryError::TestFailure {
            stage: "test".to_string(),
            exit_code: 3,
        };
        assert!(err.to_string().contains("tests failed in stage test"));
        assert!(err.to_string().contains('3'));
    }

    #[test]
    fn test_run_in_progress_names_lock() {
        let err = GantryError::RunInProgress {
            lock: PathBuf::from("/srv/site/.gantry/run.lock"),
        };
        assert_eq!(
            err.to_string(),
            "another run is in progress (lock held on /srv/site/.gantry/run.lock)"
        );
    }

    #[test]
    fn test_digest_mismatch_error() {
        let err = GantryError::DigestMismatch {
            path: "coverage.xml".to_string(),
            expected: "abc123".to_string(),
            actual: "def456".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("coverage.xml"));
        assert!(msg.contains("abc123"));
        assert!(msg.contains("def456"));
    }

    #[test]
    fn test_transport_error_wraps() {
        let err: GantryError = TransportError::Connection {
            host: "203.0.113.7".to_string(),
            message: "exit status 255".to_string(),
        }
        .into();
        assert!(err.to_string().contains("transport error"));
        assert!(err.to_string().contains("203.0.113.7"));
    }
}

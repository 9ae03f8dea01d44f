//! Storage trait definitions for Gantry
//!
//! These traits define the two storage abstractions:
//! - `CasStore`: Content-addressed storage (put/get by digest)
//! - `RunLedger`: Pipeline run persistence (stages, artifacts, terminal status)
//!
//! Both traits are async and backend-agnostic. In-memory fakes are provided
//! for testing via the `fakes` module.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::StorageError;
use crate::schema::{ArtifactRecord, PipelineRunRecord, RunMetadata, RunStatus, StageRecord};

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// CasStore: content-addressed storage
// ---------------------------------------------------------------------------

/// Content digest (SHA-256 hex string).
///
/// The inner field is private to guarantee the string is always valid
/// lowercase hex produced by `from_bytes` or validated via `TryFrom<String>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentDigest(String);

impl ContentDigest {
    /// Compute the SHA-256 digest of the given bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        use sha2::Digest;
        let mut hasher = Sha256::new();
        hasher.update(data);
        ContentDigest(hex::encode(hasher.finalize()))
    }

    /// Return the full hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form (first 12 hex chars).
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl TryFrom<String> for ContentDigest {
    type Error = StorageError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        if s.len() != 64 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StorageError::InvalidDigest { digest: s });
        }
        Ok(ContentDigest(s.to_ascii_lowercase()))
    }
}

impl From<ContentDigest> for String {
    fn from(digest: ContentDigest) -> Self {
        digest.0
    }
}

impl std::fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Content-addressed blob store.
///
/// Guarantees:
/// - `put(data)` always returns the SHA-256 digest of `data`.
/// - `get(digest)` returns the exact bytes previously stored.
/// - Same content always yields the same digest (deduplication).
/// - Blobs are never removed; the store is append-only.
#[async_trait]
pub trait CasStore: Send + Sync {
    /// Store bytes and return their content digest.
    async fn put(&self, data: &[u8]) -> StorageResult<ContentDigest>;

    /// Retrieve bytes by digest. Returns `StorageError::NotFound` if absent.
    async fn get(&self, digest: &ContentDigest) -> StorageResult<Vec<u8>>;

    /// Check whether a digest exists in the store.
    async fn contains(&self, digest: &ContentDigest) -> StorageResult<bool>;
}

// ---------------------------------------------------------------------------
// RunLedger: pipeline run persistence
// ---------------------------------------------------------------------------

/// Unique identifier for a pipeline run
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    /// Generate a new random RunId
    pub fn new() -> Self {
        RunId(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Pipeline run ledger.
///
/// Guarantees:
/// - A run transitions: Pending → Running → Success | Failed | Aborted.
///   Pending may also go straight to Aborted.
/// - Stage records and artifacts are append-only and only accepted while
///   the run is Running.
/// - Terminal runs are immutable.
#[async_trait]
pub trait RunLedger: Send + Sync {
    /// Create a new run in `Pending` status, returning its unique ID.
    async fn create_run(&self, metadata: RunMetadata) -> StorageResult<RunId>;

    /// Move a pending run to `Running`.
    async fn mark_running(&self, run_id: &RunId) -> StorageResult<()>;

    /// Append the result of one stage.
    async fn append_stage(&self, run_id: &RunId, stage: StageRecord) -> StorageResult<()>;

    /// Attach published artifacts to a run.
    async fn attach_artifacts(
        &self,
        run_id: &RunId,
        artifacts: Vec<ArtifactRecord>,
    ) -> StorageResult<()>;

    /// Set the terminal status of a run and return the final record.
    async fn finish_run(&self, run_id: &RunId, status: RunStatus)
        -> StorageResult<PipelineRunRecord>;

    /// Retrieve a run record by ID.
    async fn get_run(&self, run_id: &RunId) -> StorageResult<PipelineRunRecord>;

    /// List runs oldest first, optionally filtered by branch.
    async fn list_runs(&self, branch: Option<&str>) -> StorageResult<Vec<PipelineRunRecord>>;

    /// Most recently created run for a branch, if any.
    async fn latest_run(&self, branch: &str) -> StorageResult<Option<PipelineRunRecord>> {
        Ok(self.list_runs(Some(branch)).await?.pop())
    }

    /// Most recently created run for a branch that ran to completion.
    async fn latest_completed_run(
        &self,
        branch: &str,
    ) -> StorageResult<Option<PipelineRunRecord>> {
        Ok(self
            .list_runs(Some(branch))
            .await?
            .into_iter()
            .rev()
            .find(|run| run.status.is_completed()))
    }

    /// Close every run still `pending` or `running` as `aborted`.
    ///
    /// Only valid while no run is in progress, e.g. at daemon start after a
    /// crash. Returns the IDs that were closed.
    async fn abort_unfinished_runs(&self) -> StorageResult<Vec<RunId>> {
        let mut closed = Vec::new();
        for run in self.list_runs(None).await? {
            if !run.status.is_terminal() {
                self.finish_run(&run.run_id, RunStatus::Aborted).await?;
                closed.push(run.run_id);
            }
        }
        Ok(closed)
    }
}

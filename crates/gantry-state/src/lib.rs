//! Gantry-State: persistence layer for pipeline runs
//!
//! Everything the orchestrator needs to remember between runs lives here:
//! the run ledger (one record per pipeline run, with its ordered stage
//! results and attached artifacts) and the content-addressed blob store that
//! holds captured stage output and published report files.
//!
//! ## Layer 0 - Data/Persistence
//!
//! Focus: append-only records and terminal-state integrity.
//!
//! ## Key Components
//!
//! - `RunLedger`: pipeline run persistence (`FsRunLedger`, `MemoryRunLedger`)
//! - `CasStore`: content-addressed blob storage (`FsCasStore`, `MemoryCasStore`)
//! - `PipelineRunRecord` / `StageRecord` / `ArtifactRecord`: stored schema

mod error;
pub mod fakes;
pub mod fs_cas;
pub mod fs_ledger;
mod schema;
pub mod storage_traits;

pub use error::StorageError;
pub use fs_cas::FsCasStore;
pub use fs_ledger::FsRunLedger;
pub use schema::{
    ArtifactRecord, PipelineRunRecord, PostActionRecord, RunMetadata, RunStatus, StageOutcome,
    StageRecord, TriggerSource,
};
pub use storage_traits::{CasStore, ContentDigest, RunId, RunLedger, StorageResult};

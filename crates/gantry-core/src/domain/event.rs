use gantry_state::{RunMetadata, TriggerSource};
use serde::{Deserialize, Serialize};

/// A request to run the pipeline for one branch at one revision.
///
/// Produced by the poll loop or pushed in from a notification source; both
/// paths go through the same dedup and single-run checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub branch: String,
    pub revision: String,
    pub source: TriggerSource,
}

impl TriggerEvent {
    pub fn poll(branch: impl Into<String>, revision: impl Into<String>) -> Self {
        Self {
            branch: branch.into(),
            revision: revision.into(),
            source: TriggerSource::Poll,
        }
    }

    pub fn push(branch: impl Into<String>, revision: impl Into<String>) -> Self {
        Self {
            branch: branch.into(),
            revision: revision.into(),
            source: TriggerSource::Push,
        }
    }

    /// Started by an operator from the command line.
    pub fn manual(branch: impl Into<String>, revision: impl Into<String>) -> Self {
        Self {
            branch: branch.into(),
            revision: revision.into(),
            source: TriggerSource::Manual,
        }
    }

    /// Ledger metadata for the run this event starts.
    pub fn run_metadata(&self, pipeline_digest: Option<String>) -> RunMetadata {
        RunMetadata {
            branch: Some(self.branch.clone()),
            revision: self.revision.clone(),
            trigger: self.source,
            pipeline_digest,
        }
    }
}

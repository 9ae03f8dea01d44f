//! Stored schema for pipeline runs.
//!
//! A `PipelineRunRecord` owns the ordered list of `StageRecord`s and the
//! `ArtifactRecord`s published during the run. The state-transition rules
//! live on the record itself so every ledger backend enforces them the same
//! way.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::storage_traits::{ContentDigest, RunId, StorageResult};

/// Lifecycle status of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Success,
    Failed,
    Aborted,
}

impl RunStatus {
    /// True when the status represents a terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Aborted)
    }

    /// True when every stage got its chance to run. Aborted runs were cut
    /// short and do not count.
    pub fn is_completed(self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one stage (or post-action) within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageOutcome {
    Success,
    Failed,
    Skipped,
}

impl StageOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for StageOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What caused a run to be created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Poll,
    Push,
    Manual,
}

/// Metadata attached to a run at creation time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunMetadata {
    /// Branch the revision was observed on (None if unknown)
    pub branch: Option<String>,
    /// Source revision (commit SHA) under test
    pub revision: String,
    /// What started the run
    pub trigger: TriggerSource,
    /// Digest of the pipeline definition that ran
    pub pipeline_digest: Option<String>,
}

/// Result of the always-run hook attached to a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostActionRecord {
    pub name: String,
    pub outcome: StageOutcome,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Immutable result of one stage within one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRecord {
    pub name: String,
    pub outcome: StageOutcome,
    /// Process exit code when the stage ran a process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Digest of the captured stdout/stderr blob in the CAS.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_digest: Option<ContentDigest>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Why the stage was skipped or failed without an exit code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_action: Option<PostActionRecord>,
}

impl StageRecord {
    /// A stage that never executed.
    pub fn skipped(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            outcome: StageOutcome::Skipped,
            exit_code: None,
            output_digest: None,
            duration_ms: 0,
            started_at: None,
            reason: Some(reason.into()),
            post_action: None,
        }
    }
}

/// A published file, fingerprinted by its content digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRecord {
    /// Stage whose post-action captured the file.
    pub stage: String,
    /// Path relative to the workspace root.
    pub path: String,
    pub digest: ContentDigest,
    pub size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub captured_at: DateTime<Utc>,
}

/// Full run record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineRunRecord {
    pub run_id: RunId,
    pub metadata: RunMetadata,
    pub status: RunStatus,
    pub stages: Vec<StageRecord>,
    pub artifacts: Vec<ArtifactRecord>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl PipelineRunRecord {
    /// A freshly created, pending run.
    pub fn pending(run_id: RunId, metadata: RunMetadata) -> Self {
        Self {
            run_id,
            metadata,
            status: RunStatus::Pending,
            stages: Vec::new(),
            artifacts: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Look up a stage result by name.
    pub fn stage(&self, name: &str) -> Option<&StageRecord> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Artifacts captured by the named stage.
    pub fn artifacts_for<'a>(&'a self, stage: &'a str) -> impl Iterator<Item = &'a ArtifactRecord> {
        self.artifacts.iter().filter(move |a| a.stage == stage)
    }

    pub(crate) fn start(&mut self) -> StorageResult<()> {
        self.expect_status(&[RunStatus::Pending], "pending")?;
        self.status = RunStatus::Running;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    pub(crate) fn push_stage(&mut self, stage: StageRecord) -> StorageResult<()> {
        self.expect_status(&[RunStatus::Running], "running")?;
        self.stages.push(stage);
        Ok(())
    }

    pub(crate) fn push_artifacts(&mut self, artifacts: Vec<ArtifactRecord>) -> StorageResult<()> {
        self.expect_status(&[RunStatus::Running], "running")?;
        self.artifacts.extend(artifacts);
        Ok(())
    }

    pub(crate) fn finish(&mut self, status: RunStatus) -> StorageResult<()> {
        if !status.is_terminal() {
            return Err(StorageError::InvalidRunState {
                run_id: self.run_id.0.clone(),
                status: status.to_string(),
                expected: "a terminal status".to_string(),
            });
        }
        match (self.status, status) {
            (RunStatus::Running, _) | (RunStatus::Pending, RunStatus::Aborted) => {}
            _ => {
                return Err(StorageError::InvalidRunState {
                    run_id: self.run_id.0.clone(),
                    status: self.status.to_string(),
                    expected: "running".to_string(),
                })
            }
        }
        self.status = status;
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    fn expect_status(&self, allowed: &[RunStatus], expected: &str) -> StorageResult<()> {
        if allowed.contains(&self.status) {
            Ok(())
        } else {
            Err(StorageError::InvalidRunState {
                run_id: self.run_id.0.clone(),
                status: self.status.to_string(),
                expected: expected.to_string(),
            })
        }
    }
}

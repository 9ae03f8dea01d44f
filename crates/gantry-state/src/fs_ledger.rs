//! Filesystem-backed run ledger.
//!
//! Each run is one pretty-printed JSON document at `<root>/runs/<run_id>.json`.
//! Writes go through a temp file in the same directory followed by a rename,
//! so a crash mid-write never leaves a truncated record behind.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::StorageError;
use crate::schema::{ArtifactRecord, PipelineRunRecord, RunMetadata, RunStatus, StageRecord};
use crate::storage_traits::{RunId, RunLedger, StorageResult};

pub struct FsRunLedger {
    runs_dir: PathBuf,
    // Serializes read-modify-write cycles within this process.
    write_lock: Mutex<()>,
}

impl FsRunLedger {
    /// Open (or create) a ledger rooted at `root`.
    pub fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let runs_dir = root.as_ref().join("runs");
        fs::create_dir_all(&runs_dir)?;
        Ok(Self {
            runs_dir,
            write_lock: Mutex::new(()),
        })
    }

    fn record_path(&self, run_id: &RunId) -> PathBuf {
        self.runs_dir.join(format!("{}.json", run_id.0))
    }

    fn read(&self, run_id: &RunId) -> StorageResult<PipelineRunRecord> {
        let path = self.record_path(run_id);
        let bytes = fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::RunNotFound {
                    run_id: run_id.0.clone(),
                }
            } else {
                StorageError::Io(e)
            }
        })?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn write(&self, record: &PipelineRunRecord) -> StorageResult<()> {
        let json = serde_json::to_vec_pretty(record)?;
        let mut tmp = NamedTempFile::new_in(&self.runs_dir)?;
        tmp.write_all(&json)?;
        tmp.persist(self.record_path(&record.run_id))
            .map_err(|e| e.error)?;
        debug!(run_id = %record.run_id, status = %record.status, "run record written");
        Ok(())
    }

    async fn update<T: Send>(
        &self,
        run_id: &RunId,
        f: impl FnOnce(&mut PipelineRunRecord) -> StorageResult<T> + Send,
    ) -> StorageResult<T> {
        let _guard = self.write_lock.lock().await;
        let mut record = self.read(run_id)?;
        let out = f(&mut record)?;
        self.write(&record)?;
        Ok(out)
    }
}

#[async_trait]
impl RunLedger for FsRunLedger {
    async fn create_run(&self, metadata: RunMetadata) -> StorageResult<RunId> {
        let run_id = RunId::new();
        let record = PipelineRunRecord::pending(run_id.clone(), metadata);
        let _guard = self.write_lock.lock().await;
        self.write(&record)?;
        Ok(run_id)
    }

    async fn mark_running(&self, run_id: &RunId) -> StorageResult<()> {
        self.update(run_id, |r| r.start()).await
    }

    async fn append_stage(&self, run_id: &RunId, stage: StageRecord) -> StorageResult<()> {
        self.update(run_id, |r| r.push_stage(stage)).await
    }

    async fn attach_artifacts(
        &self,
        run_id: &RunId,
        artifacts: Vec<ArtifactRecord>,
    ) -> StorageResult<()> {
        self.update(run_id, |r| r.push_artifacts(artifacts)).await
    }

    async fn finish_run(
        &self,
        run_id: &RunId,
        status: RunStatus,
    ) -> StorageResult<PipelineRunRecord> {
        self.update(run_id, |r| {
            r.finish(status)?;
            Ok(r.clone())
        })
        .await
    }

    async fn get_run(&self, run_id: &RunId) -> StorageResult<PipelineRunRecord> {
        self.read(run_id)
    }

    async fn list_runs(&self, branch: Option<&str>) -> StorageResult<Vec<PipelineRunRecord>> {
        let mut records = Vec::new();
        for entry in fs::read_dir(&self.runs_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let record: PipelineRunRecord = serde_json::from_slice(&fs::read(&path)?)?;
            if branch.map_or(true, |b| record.metadata.branch.as_deref() == Some(b)) {
                records.push(record);
            }
        }
        records.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.run_id.cmp(&b.run_id))
        });
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::TriggerSource;

    fn metadata(branch: &str, revision: &str) -> RunMetadata {
        RunMetadata {
            branch: Some(branch.to_string()),
            revision: revision.to_string(),
            trigger: TriggerSource::Poll,
            pipeline_digest: None,
        }
    }

    #[tokio::test]
    async fn record_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let run_id = {
            let ledger = FsRunLedger::new(dir.path()).unwrap();
            let run_id = ledger.create_run(metadata("main", "abc")).await.unwrap();
            ledger.mark_running(&run_id).await.unwrap();
            ledger
                .append_stage(&run_id, StageRecord::skipped("deploy", "gate closed"))
                .await
                .unwrap();
            ledger.finish_run(&run_id, RunStatus::Success).await.unwrap();
            run_id
        };

        let reopened = FsRunLedger::new(dir.path()).unwrap();
        let run = reopened.get_run(&run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Success);
        assert_eq!(run.stages.len(), 1);
        assert_eq!(run.metadata.revision, "abc");
    }

    #[tokio::test]
    async fn missing_run_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = FsRunLedger::new(dir.path()).unwrap();
        let err = ledger.get_run(&RunId::new()).await.unwrap_err();
        assert!(matches!(err, StorageError::RunNotFound { .. }));
    }

    #[tokio::test]
    async fn list_filters_by_branch() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = FsRunLedger::new(dir.path()).unwrap();
        ledger.create_run(metadata("main", "a")).await.unwrap();
        ledger.create_run(metadata("feature/x", "b")).await.unwrap();
        ledger.create_run(metadata("main", "c")).await.unwrap();

        assert_eq!(ledger.list_runs(None).await.unwrap().len(), 3);
        let main = ledger.list_runs(Some("main")).await.unwrap();
        assert_eq!(main.len(), 2);
        assert!(main.iter().all(|r| r.metadata.branch.as_deref() == Some("main")));
    }
}

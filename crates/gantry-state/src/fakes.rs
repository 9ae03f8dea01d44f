//! In-memory fakes for storage traits (testing only)
//!
//! Provides `MemoryCasStore` and `MemoryRunLedger` that satisfy the trait
//! contracts without touching the filesystem.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use crate::error::StorageError;
use crate::schema::{ArtifactRecord, PipelineRunRecord, RunMetadata, RunStatus, StageRecord};
use crate::storage_traits::*;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// MemoryCasStore
// ---------------------------------------------------------------------------

/// In-memory content-addressed store backed by a `HashMap<digest, bytes>`.
#[derive(Debug, Default)]
pub struct MemoryCasStore {
    store: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryCasStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct blobs held.
    pub fn len(&self) -> usize {
        lock(&self.store).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Overwrite the bytes behind a digest. Lets integrity tests simulate
    /// on-disk corruption.
    pub fn corrupt(&self, digest: &ContentDigest, data: &[u8]) {
        lock(&self.store).insert(digest.as_str().to_string(), data.to_vec());
    }
}

#[async_trait]
impl CasStore for MemoryCasStore {
    async fn put(&self, data: &[u8]) -> StorageResult<ContentDigest> {
        let digest = ContentDigest::from_bytes(data);
        lock(&self.store)
            .entry(digest.as_str().to_string())
            .or_insert_with(|| data.to_vec());
        Ok(digest)
    }

    async fn get(&self, digest: &ContentDigest) -> StorageResult<Vec<u8>> {
        lock(&self.store)
            .get(digest.as_str())
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                digest: digest.as_str().to_string(),
            })
    }

    async fn contains(&self, digest: &ContentDigest) -> StorageResult<bool> {
        Ok(lock(&self.store).contains_key(digest.as_str()))
    }
}

// ---------------------------------------------------------------------------
// MemoryRunLedger
// ---------------------------------------------------------------------------

/// In-memory run ledger backed by a `HashMap<RunId, PipelineRunRecord>`.
#[derive(Debug, Default)]
pub struct MemoryRunLedger {
    runs: Mutex<HashMap<String, PipelineRunRecord>>,
}

impl MemoryRunLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn update<T>(
        &self,
        run_id: &RunId,
        f: impl FnOnce(&mut PipelineRunRecord) -> StorageResult<T>,
    ) -> StorageResult<T> {
        let mut runs = lock(&self.runs);
        let record = runs
            .get_mut(&run_id.0)
            .ok_or_else(|| StorageError::RunNotFound {
                run_id: run_id.0.clone(),
            })?;
        f(record)
    }
}

#[async_trait]
impl RunLedger for MemoryRunLedger {
    async fn create_run(&self, metadata: RunMetadata) -> StorageResult<RunId> {
        let run_id = RunId::new();
        let record = PipelineRunRecord::pending(run_id.clone(), metadata);
        lock(&self.runs).insert(run_id.0.clone(), record);
        Ok(run_id)
    }

    async fn mark_running(&self, run_id: &RunId) -> StorageResult<()> {
        self.update(run_id, |r| r.start())
    }

    async fn append_stage(&self, run_id: &RunId, stage: StageRecord) -> StorageResult<()> {
        self.update(run_id, |r| r.push_stage(stage))
    }

    async fn attach_artifacts(
        &self,
        run_id: &RunId,
        artifacts: Vec<ArtifactRecord>,
    ) -> StorageResult<()> {
        self.update(run_id, |r| r.push_artifacts(artifacts))
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
    }

    async fn get_run(&self, run_id: &RunId) -> StorageResult<PipelineRunRecord> {
        lock(&self.runs)
            .get(&run_id.0)
            .cloned()
            .ok_or_else(|| StorageError::RunNotFound {
                run_id: run_id.0.clone(),
            })
    }

    async fn list_runs(&self, branch: Option<&str>) -> StorageResult<Vec<PipelineRunRecord>> {
        let runs = lock(&self.runs);
        let mut records: Vec<PipelineRunRecord> = runs
            .values()
            .filter(|r| branch.map_or(true, |b| r.metadata.branch.as_deref() == Some(b)))
            .cloned()
            .collect();
        records.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.run_id.cmp(&b.run_id))
        });
        Ok(records)
    }
}

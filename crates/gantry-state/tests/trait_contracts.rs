//! Trait contract tests for CasStore and RunLedger.
//!
//! Every contract runs against both the in-memory fakes and the filesystem
//! backends. Any conforming implementation must pass these.

use chrono::Utc;
use gantry_state::fakes::{MemoryCasStore, MemoryRunLedger};
use gantry_state::storage_traits::*;
use gantry_state::{
    ArtifactRecord, FsCasStore, FsRunLedger, PostActionRecord, RunMetadata, RunStatus,
    StageOutcome, StageRecord, StorageError, TriggerSource,
};

fn metadata(branch: &str, revision: &str) -> RunMetadata {
    RunMetadata {
        branch: Some(branch.to_string()),
        revision: revision.to_string(),
        trigger: TriggerSource::Poll,
        pipeline_digest: Some("pipeline-v1".to_string()),
    }
}

fn success_stage(name: &str) -> StageRecord {
    StageRecord {
        name: name.to_string(),
        outcome: StageOutcome::Success,
        exit_code: Some(0),
        output_digest: Some(ContentDigest::from_bytes(name.as_bytes())),
        duration_ms: 12,
        started_at: Some(Utc::now()),
        reason: None,
        post_action: None,
    }
}

fn ledgers() -> Vec<(Box<dyn RunLedger>, Option<tempfile::TempDir>)> {
    let dir = tempfile::tempdir().unwrap();
    let fs_ledger = FsRunLedger::new(dir.path()).unwrap();
    vec![
        (Box::new(MemoryRunLedger::new()), None),
        (Box::new(fs_ledger), Some(dir)),
    ]
}

fn stores() -> Vec<(Box<dyn CasStore>, Option<tempfile::TempDir>)> {
    let dir = tempfile::tempdir().unwrap();
    let fs_store = FsCasStore::new(dir.path()).unwrap();
    vec![
        (Box::new(MemoryCasStore::new()), None),
        (Box::new(fs_store), Some(dir)),
    ]
}

// ===========================================================================
// CasStore contract tests
// ===========================================================================

#[tokio::test]
async fn cas_put_returns_correct_digest() {
    for (store, _dir) in stores() {
        let digest = store.put(b"hello world").await.unwrap();
        assert_eq!(digest, ContentDigest::from_bytes(b"hello world"));
        assert_eq!(store.get(&digest).await.unwrap(), b"hello world");
    }
}

#[tokio::test]
async fn cas_get_not_found() {
    for (store, _dir) in stores() {
        let bogus = ContentDigest::from_bytes(b"nonexistent data for bogus digest");
        let err = store.get(&bogus).await.unwrap_err();
        assert!(matches!(err, StorageError::NotFound { .. }));
        assert!(!store.contains(&bogus).await.unwrap());
    }
}

#[tokio::test]
async fn cas_deduplicates_and_distinguishes() {
    for (store, _dir) in stores() {
        let d1 = store.put(b"identical bytes").await.unwrap();
        let d2 = store.put(b"identical bytes").await.unwrap();
        let d3 = store.put(b"other bytes").await.unwrap();
        assert_eq!(d1, d2);
        assert_ne!(d1, d3);
    }
}

// ===========================================================================
// RunLedger contract tests
// ===========================================================================

#[tokio::test]
async fn ledger_create_run_is_pending() {
    for (ledger, _dir) in ledgers() {
        let run_id = ledger.create_run(metadata("main", "abc")).await.unwrap();
        let run = ledger.get_run(&run_id).await.unwrap();
        assert_eq!(run.status, RunStatus::Pending);
        assert!(run.stages.is_empty());
        assert!(run.started_at.is_none());
        assert_eq!(run.metadata.trigger, TriggerSource::Poll);
    }
}

#[tokio::test]
async fn ledger_stages_are_kept_in_append_order() {
    for (ledger, _dir) in ledgers() {
        let run_id = ledger.create_run(metadata("main", "abc")).await.unwrap();
        ledger.mark_running(&run_id).await.unwrap();
        for name in ["checkout", "setup", "validate", "test"] {
            ledger.append_stage(&run_id, success_stage(name)).await.unwrap();
        }
        ledger
            .append_stage(&run_id, StageRecord::skipped("deploy", "gate closed"))
            .await
            .unwrap();

        let run = ledger.get_run(&run_id).await.unwrap();
        let names: Vec<&str> = run.stages.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["checkout", "setup", "validate", "test", "deploy"]);
        assert_eq!(run.stages[4].outcome, StageOutcome::Skipped);
    }
}

#[tokio::test]
async fn ledger_append_before_running_fails() {
    for (ledger, _dir) in ledgers() {
        let run_id = ledger.create_run(metadata("main", "abc")).await.unwrap();
        let err = ledger
            .append_stage(&run_id, success_stage("checkout"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidRunState { .. }));
    }
}

#[tokio::test]
async fn ledger_terminal_run_rejects_further_writes() {
    for (ledger, _dir) in ledgers() {
        let run_id = ledger.create_run(metadata("main", "abc")).await.unwrap();
        ledger.mark_running(&run_id).await.unwrap();
        let finished = ledger.finish_run(&run_id, RunStatus::Failed).await.unwrap();
        assert_eq!(finished.status, RunStatus::Failed);
        assert!(finished.finished_at.is_some());

        assert!(ledger.append_stage(&run_id, success_stage("late")).await.is_err());
        assert!(ledger.attach_artifacts(&run_id, Vec::new()).await.is_err());
        assert!(ledger.finish_run(&run_id, RunStatus::Success).await.is_err());
        assert_eq!(ledger.get_run(&run_id).await.unwrap().status, RunStatus::Failed);
    }
}

#[tokio::test]
async fn ledger_artifacts_and_post_actions_round_trip() {
    for (ledger, _dir) in ledgers() {
        let run_id = ledger.create_run(metadata("main", "abc")).await.unwrap();
        ledger.mark_running(&run_id).await.unwrap();

        let artifact = ArtifactRecord {
            stage: "test".to_string(),
            path: "coverage.xml".to_string(),
            digest: ContentDigest::from_bytes(b"<coverage/>"),
            size_bytes: 11,
            media_type: Some("application/xml".to_string()),
            captured_at: Utc::now(),
        };
        ledger
            .attach_artifacts(&run_id, vec![artifact.clone()])
            .await
            .unwrap();

        let mut stage = success_stage("test");
        stage.outcome = StageOutcome::Failed;
        stage.exit_code = Some(1);
        stage.post_action = Some(PostActionRecord {
            name: "publish_artifacts".to_string(),
            outcome: StageOutcome::Success,
            duration_ms: 3,
            error: None,
        });
        ledger.append_stage(&run_id, stage.clone()).await.unwrap();

        let run = ledger.get_run(&run_id).await.unwrap();
        assert_eq!(run.artifacts, vec![artifact]);
        assert_eq!(run.stage("test"), Some(&stage));
        assert_eq!(run.artifacts_for("test").count(), 1);
    }
}

#[tokio::test]
async fn ledger_unknown_run_not_found() {
    for (ledger, _dir) in ledgers() {
        let err = ledger.mark_running(&RunId::new()).await.unwrap_err();
        assert!(matches!(err, StorageError::RunNotFound { .. }));
    }
}

#[tokio::test]
async fn ledger_latest_run_per_branch() {
    for (ledger, _dir) in ledgers() {
        assert!(ledger.latest_run("main").await.unwrap().is_none());

        ledger.create_run(metadata("main", "first")).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        ledger.create_run(metadata("feature/x", "other")).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        ledger.create_run(metadata("main", "second")).await.unwrap();

        let latest = ledger.latest_run("main").await.unwrap().unwrap();
        assert_eq!(latest.metadata.revision, "second");
    }
}

#[tokio::test]
async fn ledger_latest_completed_run_ignores_interrupted_runs() {
    for (ledger, _dir) in ledgers() {
        let done = ledger.create_run(metadata("main", "done")).await.unwrap();
        ledger.mark_running(&done).await.unwrap();
        ledger.finish_run(&done, RunStatus::Failed).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        let cut = ledger.create_run(metadata("main", "cut")).await.unwrap();
        ledger.mark_running(&cut).await.unwrap();
        ledger.finish_run(&cut, RunStatus::Aborted).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        ledger.create_run(metadata("main", "stale")).await.unwrap();

        let latest = ledger.latest_completed_run("main").await.unwrap().unwrap();
        assert_eq!(latest.metadata.revision, "done");
        assert!(ledger.latest_completed_run("feature/x").await.unwrap().is_none());
    }
}

#[tokio::test]
async fn ledger_abort_unfinished_runs_closes_pending_and_running() {
    for (ledger, _dir) in ledgers() {
        let pending = ledger.create_run(metadata("main", "a")).await.unwrap();
        let running = ledger.create_run(metadata("main", "b")).await.unwrap();
        ledger.mark_running(&running).await.unwrap();
        let done = ledger.create_run(metadata("main", "c")).await.unwrap();
        ledger.mark_running(&done).await.unwrap();
        ledger.finish_run(&done, RunStatus::Success).await.unwrap();

        let mut closed = ledger.abort_unfinished_runs().await.unwrap();
        closed.sort_by(|a, b| a.0.cmp(&b.0));
        let mut expected = vec![pending.clone(), running.clone()];
        expected.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(closed, expected);

        for id in [&pending, &running] {
            assert_eq!(ledger.get_run(id).await.unwrap().status, RunStatus::Aborted);
        }
        assert_eq!(ledger.get_run(&done).await.unwrap().status, RunStatus::Success);
        assert!(ledger.abort_unfinished_runs().await.unwrap().is_empty());
    }
}

//! Trigger subsystem behaviour with a scripted source and a controllable
//! launcher.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use gantry_core::{
    GantryError, Offer, PipelineRunRecord, PollSchedule, RunId, RunLauncher, RunSlot, SourceProbe,
    Trigger, TriggerError, TriggerEvent, TriggerSource,
};
use gantry_state::fakes::MemoryRunLedger;
use gantry_state::{RunLedger, RunStatus};
use tokio::sync::{mpsc, watch, Semaphore};

/// Branch heads that tests can move; a branch mapped to `Err` fails.
#[derive(Default)]
struct ScriptedProbe {
    heads: Mutex<HashMap<String, Result<String, String>>>,
}

impl ScriptedProbe {
    fn set(&self, branch: &str, head: Result<&str, &str>) {
        self.heads.lock().unwrap().insert(
            branch.to_string(),
            head.map(str::to_string).map_err(str::to_string),
        );
    }
}

#[async_trait]
impl SourceProbe for ScriptedProbe {
    async fn head_revision(&self, branch: &str) -> Result<Option<String>, TriggerError> {
        match self.heads.lock().unwrap().get(branch) {
            None => Ok(None),
            Some(Ok(rev)) => Ok(Some(rev.clone())),
            Some(Err(message)) => Err(TriggerError::SourceUnavailable {
                branch: branch.to_string(),
                message: message.clone(),
            }),
        }
    }
}

/// Records launches; each launch waits for a permit when gated.
struct GatedLauncher {
    launched: Mutex<Vec<TriggerEvent>>,
    gate: Option<Semaphore>,
}

impl GatedLauncher {
    fn open() -> Self {
        Self {
            launched: Mutex::new(Vec::new()),
            gate: None,
        }
    }

    fn gated() -> Self {
        Self {
            launched: Mutex::new(Vec::new()),
            gate: Some(Semaphore::new(0)),
        }
    }

    fn release_one(&self) {
        if let Some(gate) = &self.gate {
            gate.add_permits(1);
        }
    }

    fn revisions(&self) -> Vec<String> {
        self.launched
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.revision.clone())
            .collect()
    }
}

#[async_trait]
impl RunLauncher for GatedLauncher {
    async fn launch(&self, event: TriggerEvent) -> gantry_core::Result<PipelineRunRecord> {
        self.launched.lock().unwrap().push(event.clone());
        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|e| GantryError::Configuration(e.to_string()))?
                .forget();
        }
        Ok(PipelineRunRecord::pending(RunId::new(), event.run_metadata(None)))
    }
}

fn trigger(probe: Arc<ScriptedProbe>, launcher: Arc<GatedLauncher>, branches: &[&str]) -> Trigger {
    Trigger::new(
        branches.iter().map(|b| b.to_string()).collect(),
        PollSchedule::every(Duration::from_secs(30)),
        probe,
        launcher,
    )
}

#[tokio::test]
async fn new_revision_starts_exactly_one_run() {
    let probe = Arc::new(ScriptedProbe::default());
    let launcher = Arc::new(GatedLauncher::open());
    let mut t = trigger(probe.clone(), launcher.clone(), &["main"]);

    probe.set("main", Ok("aaa"));
    assert_eq!(t.poll_once().await, vec![Offer::Started]);
    t.wait_idle().await;
    assert_eq!(t.poll_once().await, vec![Offer::AlreadyProcessed]);
    t.wait_idle().await;

    assert_eq!(launcher.revisions(), ["aaa"]);
    assert_eq!(t.last_processed("main"), Some("aaa"));
}

#[tokio::test]
async fn revision_seen_during_run_is_deferred_not_dropped() {
    let probe = Arc::new(ScriptedProbe::default());
    let launcher = Arc::new(GatedLauncher::gated());
    let mut t = trigger(probe.clone(), launcher.clone(), &["main"]);

    probe.set("main", Ok("aaa"));
    assert_eq!(t.poll_once().await, vec![Offer::Started]);

    probe.set("main", Ok("bbb"));
    assert_eq!(t.poll_once().await, vec![Offer::Deferred]);
    assert!(t.slot().is_busy());
    // a push for the same revision joins the queue entry, not a second one
    assert_eq!(t.offer(TriggerEvent::push("main", "bbb")), Offer::Deferred);
    assert_eq!(t.pending().count(), 1);

    launcher.release_one();
    t.wait_idle().await;
    assert!(!t.slot().is_busy());

    let offers = t.poll_once().await;
    assert_eq!(offers, vec![Offer::Started, Offer::AlreadyProcessed]);
    launcher.release_one();
    t.wait_idle().await;

    assert_eq!(launcher.revisions(), ["aaa", "bbb"]);
    assert_eq!(t.pending().count(), 0);
}

#[tokio::test]
async fn poll_failure_is_retried_next_tick() {
    let probe = Arc::new(ScriptedProbe::default());
    let launcher = Arc::new(GatedLauncher::open());
    let mut t = trigger(probe.clone(), launcher.clone(), &["main", "develop"]);

    probe.set("main", Err("connection refused"));
    probe.set("develop", Ok("ddd"));
    assert_eq!(t.poll_once().await, vec![Offer::Started]);
    t.wait_idle().await;

    probe.set("main", Ok("mmm"));
    assert_eq!(t.poll_once().await, vec![Offer::Started, Offer::AlreadyProcessed]);
    t.wait_idle().await;

    assert_eq!(launcher.revisions(), ["ddd", "mmm"]);
}

#[tokio::test]
async fn push_and_poll_share_dedup() {
    let probe = Arc::new(ScriptedProbe::default());
    let launcher = Arc::new(GatedLauncher::open());
    let mut t = trigger(probe.clone(), launcher.clone(), &["main"]);

    let push = TriggerEvent::push("main", "ccc");
    assert_eq!(push.source, TriggerSource::Push);
    assert_eq!(t.offer(push), Offer::Started);
    t.wait_idle().await;

    probe.set("main", Ok("ccc"));
    assert_eq!(t.poll_once().await, vec![Offer::AlreadyProcessed]);
    assert_eq!(launcher.revisions(), ["ccc"]);
}

#[tokio::test]
async fn seeding_from_ledger_skips_processed_revision() {
    let ledger = MemoryRunLedger::new();
    let run_id = ledger
        .create_run(TriggerEvent::poll("main", "seeded").run_metadata(None))
        .await
        .unwrap();
    ledger.mark_running(&run_id).await.unwrap();
    ledger.finish_run(&run_id, RunStatus::Success).await.unwrap();

    let probe = Arc::new(ScriptedProbe::default());
    let launcher = Arc::new(GatedLauncher::open());
    let mut t = trigger(probe.clone(), launcher.clone(), &["main"]);
    t.seed_from_ledger(&ledger).await.unwrap();

    probe.set("main", Ok("seeded"));
    assert_eq!(t.poll_once().await, vec![Offer::AlreadyProcessed]);
    assert!(launcher.revisions().is_empty());
}

#[tokio::test]
async fn seeding_from_ledger_reruns_interrupted_revisions() {
    let ledger = MemoryRunLedger::new();
    let done = ledger
        .create_run(TriggerEvent::poll("main", "done").run_metadata(None))
        .await
        .unwrap();
    ledger.mark_running(&done).await.unwrap();
    ledger.finish_run(&done, RunStatus::Failed).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;

    let cut = ledger
        .create_run(TriggerEvent::poll("main", "interrupted").run_metadata(None))
        .await
        .unwrap();
    ledger.mark_running(&cut).await.unwrap();
    ledger.finish_run(&cut, RunStatus::Aborted).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;

    // Left running by a crashed process.
    let crashed = ledger
        .create_run(TriggerEvent::poll("release", "crashed").run_metadata(None))
        .await
        .unwrap();
    ledger.mark_running(&crashed).await.unwrap();

    let probe = Arc::new(ScriptedProbe::default());
    let launcher = Arc::new(GatedLauncher::open());
    let mut t = trigger(probe.clone(), launcher.clone(), &["main", "release"]);
    t.seed_from_ledger(&ledger).await.unwrap();
    assert_eq!(t.last_processed("main"), Some("done"));
    assert_eq!(t.last_processed("release"), None);

    probe.set("main", Ok("interrupted"));
    assert_eq!(t.poll_once().await, vec![Offer::Started]);
    t.wait_idle().await;

    probe.set("main", Ok("done"));
    probe.set("release", Ok("crashed"));
    assert_eq!(
        t.poll_once().await,
        vec![Offer::AlreadyProcessed, Offer::Started]
    );
    t.wait_idle().await;
    assert_eq!(launcher.revisions(), ["interrupted", "crashed"]);
}

#[tokio::test]
async fn held_run_lock_defers_instead_of_dropping() {
    let dir = tempfile::tempdir().unwrap();
    let lock = dir.path().join("run.lock");
    let probe = Arc::new(ScriptedProbe::default());
    let launcher = Arc::new(GatedLauncher::open());
    let mut t = trigger(probe.clone(), launcher.clone(), &["main"])
        .with_slot(RunSlot::with_lock_file(&lock));

    // A manual run in another process owns the state directory.
    let other = RunSlot::with_lock_file(&lock).try_acquire().unwrap();
    probe.set("main", Ok("aaa"));
    assert_eq!(t.poll_once().await, vec![Offer::Deferred]);
    assert_eq!(t.last_processed("main"), None);
    assert!(launcher.revisions().is_empty());

    drop(other);
    assert_eq!(
        t.poll_once().await,
        vec![Offer::Started, Offer::AlreadyProcessed]
    );
    t.wait_idle().await;
    assert_eq!(launcher.revisions(), ["aaa"]);
}

#[tokio::test(start_paused = true)]
async fn run_loop_polls_accepts_pushes_and_drains_on_shutdown() {
    let probe = Arc::new(ScriptedProbe::default());
    let launcher = Arc::new(GatedLauncher::open());
    probe.set("main", Ok("first"));

    let t = trigger(probe.clone(), launcher.clone(), &["main"]);
    let (push_tx, push_rx) = mpsc::channel(8);
    let (stop_tx, stop_rx) = watch::channel(false);
    let handle = tokio::spawn(t.run(push_rx, stop_rx));

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(launcher.revisions(), ["first"]);

    push_tx.send(TriggerEvent::push("main", "pushed")).await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(launcher.revisions(), ["first", "pushed"]);

    probe.set("main", Ok("third"));
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(launcher.revisions(), ["first", "pushed", "third"]);

    stop_tx.send(true).unwrap();
    handle.await.unwrap();
}

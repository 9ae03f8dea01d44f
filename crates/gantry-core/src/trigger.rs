//! Trigger subsystem: decides when a pipeline run starts.
//!
//! The trigger polls each watched branch on a fixed interval and also
//! accepts pushed events over a channel. Both paths share one dedup table
//! and one run slot, so at most one run is in progress at a time. A new
//! revision seen while a run is in progress is queued and offered again on
//! the next tick. Source check failures are logged and retried on the next
//! tick; they never stop the loop.

use std::collections::{HashMap, VecDeque};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use fs2::FileExt;
use gantry_state::{PipelineRunRecord, RunLedger};
use tokio::sync::{mpsc, watch, Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::domain::{Result, TriggerError, TriggerEvent};
use crate::metrics::METRICS;
use crate::obs;
use crate::schedule::PollSchedule;

/// Reads the current head revision of a branch from the source repository.
#[async_trait]
pub trait SourceProbe: Send + Sync {
    /// `Ok(None)` when the branch does not exist.
    async fn head_revision(&self, branch: &str) -> std::result::Result<Option<String>, TriggerError>;
}

/// Executes one pipeline run to completion.
#[async_trait]
pub trait RunLauncher: Send + Sync {
    async fn launch(&self, event: TriggerEvent) -> Result<PipelineRunRecord>;
}

/// Single-writer guard for "a run is in progress".
///
/// A slot built with [`RunSlot::with_lock_file`] also holds an exclusive OS
/// lock on that file while a permit is alive, so processes sharing one
/// state directory exclude each other as well.
#[derive(Debug, Clone, Default)]
pub struct RunSlot {
    inner: Arc<Mutex<()>>,
    lock_file: Option<PathBuf>,
}

/// Held for the lifetime of one run.
#[derive(Debug)]
pub struct RunPermit {
    _guard: OwnedMutexGuard<()>,
    // Closing the file releases the OS lock.
    _file: Option<File>,
}

impl RunSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Slot that also locks `path`, creating it and its parent on first use.
    pub fn with_lock_file(path: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::default(),
            lock_file: Some(path.into()),
        }
    }

    pub fn lock_file(&self) -> Option<&Path> {
        self.lock_file.as_deref()
    }

    /// Claim the slot without waiting. None while a run holds it, in this
    /// process or, for a lock-file slot, in any other.
    pub fn try_acquire(&self) -> Option<RunPermit> {
        let guard = self.inner.clone().try_lock_owned().ok()?;
        let file = match &self.lock_file {
            Some(path) => Some(lock_exclusive(path)?),
            None => None,
        };
        Some(RunPermit {
            _guard: guard,
            _file: file,
        })
    }

    /// Whether a run in this process holds the slot.
    pub fn is_busy(&self) -> bool {
        self.inner.try_lock().is_err()
    }
}

fn lock_exclusive(path: &Path) -> Option<File> {
    let opened = path
        .parent()
        .map_or(Ok(()), fs::create_dir_all)
        .and_then(|()| {
            OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(false)
                .open(path)
        });
    let file = match opened {
        Ok(file) => file,
        Err(e) => {
            error!(path = %path.display(), error = %e, "cannot open run lock");
            return None;
        }
    };
    match FileExt::try_lock_exclusive(&file) {
        Ok(()) => Some(file),
        Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
            debug!(path = %path.display(), "run lock held by another process");
            None
        }
        Err(e) => {
            error!(path = %path.display(), error = %e, "cannot take run lock");
            None
        }
    }
}

/// What happened to an offered event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Offer {
    Started,
    Deferred,
    AlreadyProcessed,
}

pub struct Trigger {
    branches: Vec<String>,
    schedule: PollSchedule,
    probe: Arc<dyn SourceProbe>,
    launcher: Arc<dyn RunLauncher>,
    slot: RunSlot,
    /// Last revision a run was started for, per branch.
    processed: HashMap<String, String>,
    pending: VecDeque<TriggerEvent>,
    in_flight: Option<JoinHandle<()>>,
}

impl Trigger {
    pub fn new(
        branches: Vec<String>,
        schedule: PollSchedule,
        probe: Arc<dyn SourceProbe>,
        launcher: Arc<dyn RunLauncher>,
    ) -> Self {
        Self {
            branches,
            schedule,
            probe,
            launcher,
            slot: RunSlot::new(),
            processed: HashMap::new(),
            pending: VecDeque::new(),
            in_flight: None,
        }
    }

    /// Share a run slot with other launch paths, e.g. a sequencer's
    /// lock-file slot.
    pub fn with_slot(mut self, slot: RunSlot) -> Self {
        self.slot = slot;
        self
    }

    pub fn slot(&self) -> &RunSlot {
        &self.slot
    }

    pub fn pending(&self) -> impl Iterator<Item = &TriggerEvent> {
        self.pending.iter()
    }

    pub fn last_processed(&self, branch: &str) -> Option<&str> {
        self.processed.get(branch).map(String::as_str)
    }

    /// Seed the per-branch last revision from the ledger so a restart does
    /// not repeat work. Only runs that completed count; an aborted or
    /// unfinished run leaves its revision to be run again.
    pub async fn seed_from_ledger(&mut self, ledger: &dyn RunLedger) -> Result<()> {
        for branch in &self.branches {
            if let Some(run) = ledger.latest_completed_run(branch).await? {
                debug!(branch = %branch, revision = %run.metadata.revision, status = %run.status, "seeded from ledger");
                self.processed
                    .insert(branch.clone(), run.metadata.revision.clone());
            }
        }
        Ok(())
    }

    /// Offer one event. Starts a run if the slot is free and no earlier
    /// event is waiting; queues it otherwise.
    pub fn offer(&mut self, event: TriggerEvent) -> Offer {
        if self.is_processed(&event) {
            debug!(branch = %event.branch, revision = %event.revision, "revision already processed");
            return Offer::AlreadyProcessed;
        }
        if self
            .pending
            .iter()
            .any(|p| p.branch == event.branch && p.revision == event.revision)
        {
            return Offer::Deferred;
        }
        if self.pending.is_empty() {
            if let Some(permit) = self.slot.try_acquire() {
                self.start(event, permit);
                return Offer::Started;
            }
        }
        obs::emit_trigger_deferred(&event.branch, &event.revision);
        METRICS.inc_triggers_deferred();
        self.pending.push_back(event);
        Offer::Deferred
    }

    /// Start the oldest queued event if the slot is free.
    pub fn retry_pending(&mut self) -> Option<Offer> {
        while let Some(front) = self.pending.front() {
            if self.is_processed(front) {
                self.pending.pop_front();
                continue;
            }
            let permit = self.slot.try_acquire()?;
            let event = self.pending.pop_front()?;
            self.start(event, permit);
            return Some(Offer::Started);
        }
        None
    }

    /// One poll interval: retry the queue, then check every branch.
    pub async fn poll_once(&mut self) -> Vec<Offer> {
        let mut offers: Vec<Offer> = self.retry_pending().into_iter().collect();
        for branch in self.branches.clone() {
            match self.probe.head_revision(&branch).await {
                Ok(Some(revision)) => offers.push(self.offer(TriggerEvent::poll(branch, revision))),
                Ok(None) => debug!(branch = %branch, "branch not found on remote"),
                Err(e) => {
                    obs::emit_poll_failed(&branch, &e);
                    METRICS.inc_poll_failures();
                }
            }
        }
        offers
    }

    /// Wait for the in-flight run, if any.
    pub async fn wait_idle(&mut self) {
        if let Some(handle) = self.in_flight.take() {
            if let Err(e) = handle.await {
                error!(error = %e, "run task panicked");
            }
        }
    }

    /// Run until `shutdown` flips to true or its sender is dropped. An
    /// in-flight run is allowed to finish before this returns.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<TriggerEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(self.schedule.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(branches = ?self.branches, interval = %self.schedule, "trigger loop started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.poll_once().await;
                }
                Some(event) = events.recv() => {
                    self.offer(event);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(pending = self.pending.len(), "trigger loop stopping");
        self.wait_idle().await;
    }

    fn is_processed(&self, event: &TriggerEvent) -> bool {
        self.processed.get(&event.branch) == Some(&event.revision)
    }

    fn start(&mut self, event: TriggerEvent, permit: RunPermit) {
        info!(branch = %event.branch, revision = %event.revision, source = ?event.source, "starting run");
        self.processed
            .insert(event.branch.clone(), event.revision.clone());
        let launcher = Arc::clone(&self.launcher);
        self.in_flight = Some(tokio::spawn(async move {
            let _permit = permit;
            match launcher.launch(event).await {
                Ok(record) => debug!(run_id = %record.run_id, status = %record.status, "run completed"),
                Err(e) => error!(error = %e, "run failed to execute"),
            }
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_is_exclusive() {
        let slot = RunSlot::new();
        let permit = slot.try_acquire().unwrap();
        assert!(slot.is_busy());
        assert!(slot.clone().try_acquire().is_none());
        drop(permit);
        assert!(!slot.is_busy());
        assert!(slot.try_acquire().is_some());
    }

    #[test]
    fn lock_file_slots_exclude_each_other() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("run.lock");
        let first = RunSlot::with_lock_file(&path);
        let second = RunSlot::with_lock_file(&path);

        let permit = first.try_acquire().unwrap();
        assert!(path.exists());
        assert!(second.try_acquire().is_none());
        assert!(!second.is_busy());

        drop(permit);
        assert!(second.try_acquire().is_some());
    }
}

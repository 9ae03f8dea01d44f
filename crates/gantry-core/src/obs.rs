//! Structured observability hooks for pipeline run lifecycle events.
//!
//! This module provides:
//! - Run-scoped tracing spans via `RunSpan` RAII guard
//! - Emission functions for key lifecycle events: run start, stage finish,
//!   gate evaluation, run finish, deferred triggers and failed polls
//!
//! Events are emitted at `info!` level (filter with `RUST_LOG`).
//! For JSON output, start the binaries with `--json`.

use tracing::{info, warn};

/// RAII guard that enters a run-scoped tracing span for the duration of a run.
///
/// # Example
///
/// ```ignore
/// let _span = RunSpan::enter("3f2a...", "main");
/// // every event logged now carries run_id and branch
/// ```
pub struct RunSpan {
    _span: tracing::span::EnteredSpan,
}

impl RunSpan {
    /// Create and enter a span tagged with the run id and branch.
    pub fn enter(run_id: &str, branch: &str) -> Self {
        let span = tracing::info_span!("gantry.run", run_id = %run_id, branch = %branch);
        Self {
            _span: span.entered(),
        }
    }
}

/// Emit event: run started for a branch at a revision.
pub fn emit_run_started(run_id: &str, branch: &str, revision: &str) {
    info!(event = "run.started", run_id = %run_id, branch = %branch, revision = %revision);
}

/// Emit event: one stage reached its final outcome.
pub fn emit_stage_finished(run_id: &str, stage: &str, outcome: &str, duration_ms: u64) {
    info!(
        event = "stage.finished",
        run_id = %run_id,
        stage = %stage,
        outcome = %outcome,
        duration_ms = duration_ms,
    );
}

/// Emit event: deploy gate evaluated.
pub fn emit_gate_evaluated(run_id: &str, allowed: bool, reason: &dyn std::fmt::Display) {
    info!(
        event = "gate.evaluated",
        run_id = %run_id,
        allowed = allowed,
        reason = %reason,
    );
}

/// Emit event: run reached a terminal status.
pub fn emit_run_finished(run_id: &str, status: &str, duration_ms: u64, stages: usize) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        status = %status,
        duration_ms = duration_ms,
        stages = stages,
    );
}

/// Emit event: a new revision arrived while a run was in progress.
pub fn emit_trigger_deferred(branch: &str, revision: &str) {
    info!(event = "trigger.deferred", branch = %branch, revision = %revision);
}

/// Emit event: the source repository could not be checked (warning level).
pub fn emit_poll_failed(branch: &str, error: &dyn std::fmt::Display) {
    warn!(event = "trigger.poll_failed", branch = %branch, error = %error);
}

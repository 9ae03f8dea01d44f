//! Stage sequencer: executes one pipeline run and records it in the ledger.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use gantry_core::{
    emit_gate_evaluated, emit_run_finished, emit_run_started, emit_stage_finished, evaluate_gate,
    ArtifactPublisher, CasStore, EnvResolver, GantryError, PipelineRunRecord, RemoteExecutor,
    RemoteInvocation, Result, RunId, RunLauncher, RunLedger, RunSlot, RunStatus, StageOutcome,
    StageRecord, TriggerEvent, METRICS,
};
use gantry_state::PostActionRecord;
use tracing::{error, info, warn, Instrument};

use crate::runner::{AbortSignal, LocalRunner, StageContext};
use crate::spec::{DeploySettings, PipelineSpec};
use crate::stage::{PostAction, StageConfig};

/// Produces the operator's configuration overrides. Called once per run.
pub type ConfigSnapshot = Arc<dyn Fn() -> EnvResolver + Send + Sync>;

const SKIP_AFTER_FAILURE: &str = "an earlier required stage failed";
const SKIP_AFTER_ABORT: &str = "run aborted";

pub struct PipelineSequencer {
    ledger: Arc<dyn RunLedger>,
    cas: Arc<dyn CasStore>,
    remote: Arc<dyn RemoteExecutor>,
    stages: Vec<StageConfig>,
    workspace: PathBuf,
    pipeline_digest: String,
    deploy: DeploySettings,
    config: ConfigSnapshot,
    abort: AbortSignal,
    slot: RunSlot,
}

impl PipelineSequencer {
    /// Sequencer for `spec`. Overrides are read from the process environment
    /// at the start of every run.
    pub fn new(
        spec: &PipelineSpec,
        ledger: Arc<dyn RunLedger>,
        cas: Arc<dyn CasStore>,
        remote: Arc<dyn RemoteExecutor>,
    ) -> Self {
        Self {
            ledger,
            cas,
            remote,
            stages: spec.stages.clone(),
            workspace: spec.workspace.clone(),
            pipeline_digest: spec.stages_digest(),
            deploy: spec.deploy.clone(),
            config: Arc::new(EnvResolver::from_env),
            abort: AbortSignal::never(),
            slot: RunSlot::with_lock_file(spec.run_lock_path()),
        }
    }

    /// Replace the source of operator overrides.
    pub fn with_config(mut self, config: impl Fn() -> EnvResolver + Send + Sync + 'static) -> Self {
        self.config = Arc::new(config);
        self
    }

    pub fn with_abort(mut self, abort: AbortSignal) -> Self {
        self.abort = abort;
        self
    }

    pub fn stages(&self) -> &[StageConfig] {
        &self.stages
    }

    pub fn pipeline_digest(&self) -> &str {
        &self.pipeline_digest
    }

    /// Run slot backed by the state directory's lock file. A trigger that
    /// launches through this sequencer must share it.
    pub fn slot(&self) -> &RunSlot {
        &self.slot
    }

    /// Execute every stage for `event` and return the terminal record.
    ///
    /// Fails with [`GantryError::RunInProgress`] without touching the ledger
    /// when another run, in this process or another, holds the slot.
    ///
    /// Stage failures end up in the record; `Err` is otherwise reserved for
    /// ledger and store failures, in which case the run is closed as failed
    /// when the ledger still accepts it.
    pub async fn run(&self, event: TriggerEvent) -> Result<PipelineRunRecord> {
        let _permit = self
            .slot
            .try_acquire()
            .ok_or_else(|| GantryError::RunInProgress {
                lock: self.slot.lock_file().map(Path::to_path_buf).unwrap_or_default(),
            })?;
        self.run_exclusive(event).await
    }

    async fn run_exclusive(&self, event: TriggerEvent) -> Result<PipelineRunRecord> {
        let config = self.deploy.apply((self.config)());
        let metadata = event.run_metadata(Some(self.pipeline_digest.clone()));
        let run_id = self.ledger.create_run(metadata).await?;
        let span = tracing::info_span!("gantry.run", run_id = %run_id, branch = %event.branch);
        self.execute(run_id, &event, &config).instrument(span).await
    }

    async fn execute(
        &self,
        run_id: RunId,
        event: &TriggerEvent,
        config: &EnvResolver,
    ) -> Result<PipelineRunRecord> {
        let start = Instant::now();
        self.ledger.mark_running(&run_id).await?;
        METRICS.inc_runs_started();
        emit_run_started(&run_id.0, &event.branch, &event.revision);

        let ctx = StageContext {
            run_id: run_id.0.clone(),
            branch: event.branch.clone(),
            revision: event.revision.clone(),
            workspace: self.workspace.clone(),
        };

        let status = match self.sequence(&run_id, &ctx, config).await {
            Ok(status) => status,
            Err(e) => {
                error!(run_id = %run_id, error = %e, "run interrupted by internal error");
                if let Err(finish) = self.ledger.finish_run(&run_id, RunStatus::Failed).await {
                    warn!(run_id = %run_id, error = %finish, "could not close interrupted run");
                }
                METRICS.inc_runs_failed();
                return Err(e);
            }
        };

        let record = self.ledger.finish_run(&run_id, status).await?;
        if status == RunStatus::Success {
            METRICS.inc_runs_succeeded();
        } else {
            METRICS.inc_runs_failed();
        }
        emit_run_finished(
            &run_id.0,
            status.as_str(),
            start.elapsed().as_millis() as u64,
            record.stages.len(),
        );
        METRICS.flush();
        Ok(record)
    }

    async fn sequence(
        &self,
        run_id: &RunId,
        ctx: &StageContext,
        config: &EnvResolver,
    ) -> Result<RunStatus> {
        let mut failed = false;
        let mut aborted = false;

        for stage in &self.stages {
            if !stage.enabled {
                self.record(run_id, StageRecord::skipped(&stage.name, "disabled"))
                    .await?;
                continue;
            }
            aborted = aborted || self.abort.is_aborted();

            let blocked = if aborted {
                Some(SKIP_AFTER_ABORT)
            } else if failed {
                Some(SKIP_AFTER_FAILURE)
            } else {
                None
            };
            if let Some(reason) = blocked {
                if !stage.always_run {
                    info!(stage = %stage.name, reason, "skipping stage");
                    self.record(run_id, StageRecord::skipped(&stage.name, reason))
                        .await?;
                    continue;
                }
            }

            let record = if stage.is_deploy() {
                self.deploy_stage(stage, ctx, config).await?
            } else {
                // Cleanup stages still run to completion after an abort.
                let mut abort = if aborted {
                    AbortSignal::never()
                } else {
                    self.abort.clone()
                };
                let (record, interrupted) = self.local_stage(run_id, stage, ctx, &mut abort).await?;
                aborted = aborted || interrupted;
                record
            };

            if record.outcome == StageOutcome::Failed {
                if stage.required {
                    failed = true;
                } else {
                    warn!(stage = %stage.name, "optional stage failed");
                }
            }
            self.record(run_id, record).await?;
        }

        Ok(if aborted {
            RunStatus::Aborted
        } else if failed {
            RunStatus::Failed
        } else {
            RunStatus::Success
        })
    }

    async fn record(&self, run_id: &RunId, record: StageRecord) -> Result<()> {
        let (name, outcome, duration_ms) = (record.name.clone(), record.outcome, record.duration_ms);
        self.ledger.append_stage(run_id, record).await?;
        emit_stage_finished(&run_id.0, &name, outcome.as_str(), duration_ms);
        Ok(())
    }

    async fn local_stage(
        &self,
        run_id: &RunId,
        stage: &StageConfig,
        ctx: &StageContext,
        abort: &mut AbortSignal,
    ) -> Result<(StageRecord, bool)> {
        info!(stage = %stage.name, "executing stage");
        let started_at = Utc::now();
        let timeout = stage_timeout(stage);
        let out = LocalRunner::run(&stage.commands, timeout, ctx, abort).await;
        let output_digest = self.cas.put(out.output.as_bytes()).await?;

        let reason = match out.interruption(timeout) {
            Some(reason) => Some(reason),
            None if !out.succeeded() => out
                .exit_code
                .map(|code| stage.kind.failure(&stage.name, code).to_string()),
            None => None,
        };

        let post_action = match &stage.post {
            Some(post) => Some(self.post_action(run_id, stage, post, ctx).await?),
            None => None,
        };

        let record = StageRecord {
            name: stage.name.clone(),
            outcome: if out.succeeded() {
                StageOutcome::Success
            } else {
                StageOutcome::Failed
            },
            exit_code: out.exit_code,
            output_digest: Some(output_digest),
            duration_ms: out.duration_ms,
            started_at: Some(started_at),
            reason,
            post_action,
        };
        Ok((record, out.aborted()))
    }

    /// Report commands then artifact capture. Runs whatever the stage
    /// outcome was; its own failures never change the run status.
    async fn post_action(
        &self,
        run_id: &RunId,
        stage: &StageConfig,
        post: &PostAction,
        ctx: &StageContext,
    ) -> Result<PostActionRecord> {
        let start = Instant::now();
        let timeout = stage_timeout(stage);
        let mut errors = Vec::new();

        for argv in &post.commands {
            let out =
                LocalRunner::run(std::slice::from_ref(argv), timeout, ctx, &mut AbortSignal::never())
                    .await;
            if !out.succeeded() {
                let why = out
                    .interruption(timeout)
                    .or_else(|| out.exit_code.map(|c| format!("exit code {c}")))
                    .unwrap_or_default();
                warn!(stage = %stage.name, command = ?argv, reason = %why, "post-action command failed");
                errors.push(format!("{}: {why}", argv.join(" ")));
            }
        }

        let publisher = ArtifactPublisher::new(self.cas.clone(), post.artifacts.clone())?;
        match publisher.publish(&ctx.workspace, &stage.name).await {
            Ok(report) => {
                info!(
                    stage = %stage.name,
                    captured = report.artifacts.len(),
                    missing = ?report.missing,
                    "artifacts published"
                );
                if !report.artifacts.is_empty() {
                    self.ledger.attach_artifacts(run_id, report.artifacts).await?;
                }
            }
            Err(e) => {
                warn!(stage = %stage.name, error = %e, "artifact capture failed");
                errors.push(format!("artifact capture: {e}"));
            }
        }

        Ok(PostActionRecord {
            name: "publish-artifacts".to_string(),
            outcome: if errors.is_empty() {
                StageOutcome::Success
            } else {
                StageOutcome::Failed
            },
            duration_ms: start.elapsed().as_millis() as u64,
            error: (!errors.is_empty()).then(|| errors.join("; ")),
        })
    }

    /// The gated remote deploy. Not interruptible once the session opens.
    async fn deploy_stage(
        &self,
        stage: &StageConfig,
        ctx: &StageContext,
        config: &EnvResolver,
    ) -> Result<StageRecord> {
        let decision = evaluate_gate(Some(&ctx.branch), config);
        emit_gate_evaluated(&ctx.run_id, decision.allowed, &decision.reason);
        if !decision.allowed {
            return Ok(StageRecord::skipped(&stage.name, decision.reason.to_string()));
        }

        let started_at = Utc::now();
        let start = Instant::now();
        let failed = |reason: String, exit_code, output_digest| StageRecord {
            name: stage.name.clone(),
            outcome: StageOutcome::Failed,
            exit_code,
            output_digest,
            duration_ms: start.elapsed().as_millis() as u64,
            started_at: Some(started_at),
            reason: Some(reason),
            post_action: None,
        };

        let invocation = match RemoteInvocation::from_config(config, stage_timeout(stage)) {
            Ok(invocation) => invocation,
            Err(e) => return Ok(failed(e.to_string(), None, None)),
        };

        METRICS.inc_deploys_attempted();
        info!(stage = %stage.name, target = %invocation.target, "starting remote deploy");
        match self.remote.execute(&invocation).await {
            Ok(outcome) => {
                let digest = self.cas.put(outcome.output.as_bytes()).await?;
                if outcome.succeeded() {
                    Ok(StageRecord {
                        name: stage.name.clone(),
                        outcome: StageOutcome::Success,
                        exit_code: Some(0),
                        output_digest: Some(digest),
                        duration_ms: start.elapsed().as_millis() as u64,
                        started_at: Some(started_at),
                        reason: None,
                        post_action: None,
                    })
                } else {
                    Ok(failed(
                        format!("remote script exited with code {}", outcome.exit_code),
                        Some(outcome.exit_code),
                        Some(digest),
                    ))
                }
            }
            Err(e) => {
                warn!(stage = %stage.name, error = %e, "remote deploy failed");
                Ok(failed(e.to_string(), None, None))
            }
        }
    }
}

fn stage_timeout(stage: &StageConfig) -> Option<Duration> {
    (stage.timeout_secs > 0).then(|| Duration::from_secs(stage.timeout_secs))
}

/// The trigger starts a launch only while holding a permit from its slot,
/// which is this sequencer's [`slot`](PipelineSequencer::slot).
#[async_trait]
impl RunLauncher for PipelineSequencer {
    async fn launch(&self, event: TriggerEvent) -> Result<PipelineRunRecord> {
        self.run_exclusive(event).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::StageKind;

    #[test]
    fn test_stage_timeout_zero_means_none() {
        let stage = StageConfig::custom("x", vec!["true".to_string()], 0);
        assert_eq!(stage_timeout(&stage), None);
        let deploy = StageConfig::from_kind(StageKind::Deploy, 900);
        assert_eq!(stage_timeout(&deploy), Some(Duration::from_secs(900)));
    }
}

//! Gantry Core Library
//!
//! Domain layer of the deployment pipeline orchestrator: configuration
//! resolution, the deploy gate, the remote execution transport, artifact
//! publishing, and the trigger loop that starts runs.
//!
//! ## Layer 1 - Domain
//!
//! Depends only on `gantry-state`. Stage execution lives one layer up in
//! `gantry-ci`, which plugs into the trigger through [`RunLauncher`].

pub mod artifacts;
pub mod config;
pub mod domain;
pub mod gate;
pub mod git;
pub mod metrics;
pub mod obs;
pub mod schedule;
pub mod telemetry;
pub mod transport;
pub mod trigger;

pub use artifacts::{
    validate_artifact_path, verify_artifacts, ArtifactCheck, ArtifactIntegrity, ArtifactPublisher,
    PublishReport, DEFAULT_REPORT_PATHS,
};
pub use config::{ConfigKey, ConfigSource, ConfigValue, EnvResolver};
pub use domain::{GantryError, Result, TransportError, TriggerError, TriggerEvent};
pub use gate::{allow_deploy, evaluate_gate, GateDecision, GateReason, DEPLOY_BRANCH};
pub use git::{capture_head_sha, current_branch, GitRemoteProbe};
pub use metrics::METRICS;
pub use obs::{
    emit_gate_evaluated, emit_poll_failed, emit_run_finished, emit_run_started,
    emit_stage_finished, emit_trigger_deferred, RunSpan,
};
pub use schedule::PollSchedule;
pub use telemetry::init_tracing;
pub use transport::{
    RemoteExecutor, RemoteInvocation, RemoteOutcome, RemoteTarget, SshIdentity, SshTransport,
    TrustStatus, TrustStore,
};
pub use trigger::{Offer, RunLauncher, RunPermit, RunSlot, SourceProbe, Trigger};

pub use gantry_state::{
    ArtifactRecord, CasStore, ContentDigest, PipelineRunRecord, RunId, RunLedger, RunMetadata,
    RunStatus, StageOutcome, StageRecord, TriggerSource,
};

/// Crate version, reported by the binaries.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//! Gantry CI - stage execution for the deployment pipeline
//!
//! Provides:
//! - Stage definitions and the built-in pipeline (checkout, setup,
//!   validate, test with report publishing, gated deploy)
//! - The `gantry.toml` pipeline file
//! - A local command runner with timeouts and abort
//! - The stage sequencer that records every run in the ledger
//!
//! ## Layer 2 - Execution

pub mod pipeline;
pub mod report;
pub mod runner;
pub mod spec;
pub mod stage;

pub use pipeline::{ConfigSnapshot, PipelineSequencer};
pub use report::RunReport;
pub use runner::{
    abort_pair, AbortHandle, AbortSignal, CommandOutput, LocalRunner, StageContext, Termination,
};
pub use spec::{DeploySettings, PipelineSpec, PIPELINE_FILE, RUN_LOCK_FILE};
pub use stage::{default_stages, PostAction, StageConfig, StageKind};

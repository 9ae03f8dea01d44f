//! gantryd: the long-running orchestrator.
//!
//! Polls the configured branches and runs the pipeline for every new
//! revision, one run at a time. Ctrl-C aborts the in-flight run (a remote
//! deploy already under way is allowed to finish) and stops the loop.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use gantry_ci::{abort_pair, PipelineSequencer, PipelineSpec};
use gantry_core::{
    ConfigKey, EnvResolver, GitRemoteProbe, RunLedger, RunSlot, SshTransport, Trigger, TrustStore,
    METRICS,
};
use gantry_state::{FsCasStore, FsRunLedger};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn, Level};

#[derive(Parser)]
#[command(name = "gantryd")]
#[command(version = gantry_core::VERSION)]
#[command(about = "Gantry pipeline orchestrator", long_about = None)]
struct Args {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long)]
    json: bool,

    /// Pipeline file (default: <workspace>/gantry.toml, or the built-in pipeline)
    #[arg(short, long, env = "GANTRY_PIPELINE")]
    config: Option<PathBuf>,

    /// Workspace holding the checked-out repository
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,
}

fn load_spec(args: &Args) -> Result<PipelineSpec> {
    match &args.config {
        Some(path) => PipelineSpec::load(path)
            .with_context(|| format!("Failed to load pipeline file {}", path.display())),
        None => PipelineSpec::discover(&args.workspace).context("Failed to load pipeline file"),
    }
}

fn trust_dir(spec: &PipelineSpec) -> Result<PathBuf> {
    spec.configure(EnvResolver::from_env())
        .resolve_path(ConfigKey::TrustStore)
        .with_context(|| format!("{} is not set", ConfigKey::TrustStore))
}

fn state_path(spec: &PipelineSpec, name: &str) -> PathBuf {
    spec.state_dir.join(name)
}

/// Close runs a previous process left `pending` or `running`, so their
/// revisions are picked up again. Skipped while another process holds the
/// run lock, since its run is still live.
async fn close_stale_runs(slot: &RunSlot, ledger: &dyn RunLedger) -> Result<usize> {
    let Some(_permit) = slot.try_acquire() else {
        warn!("run lock is held by another process; leaving unfinished runs alone");
        return Ok(0);
    };
    let closed = ledger
        .abort_unfinished_runs()
        .await
        .context("Failed to close unfinished runs")?;
    for run_id in &closed {
        warn!(run_id = %run_id, "closed run left unfinished by a previous process");
    }
    Ok(closed.len())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    let level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    gantry_core::init_tracing(args.json, level);

    let spec = load_spec(&args)?;
    info!(
        pipeline = %spec.name,
        digest = %spec.stages_digest(),
        workspace = %spec.workspace.display(),
        "gantryd starting"
    );

    let ledger: Arc<dyn RunLedger> = Arc::new(
        FsRunLedger::new(state_path(&spec, "runs")).context("Failed to open run ledger")?,
    );
    let cas = Arc::new(
        FsCasStore::new(state_path(&spec, "cas")).context("Failed to open artifact store")?,
    );
    let remote = Arc::new(SshTransport::new(TrustStore::new(trust_dir(&spec)?)));

    let (abort, signal) = abort_pair();
    let sequencer =
        Arc::new(PipelineSequencer::new(&spec, ledger.clone(), cas, remote).with_abort(signal));
    let probe = Arc::new(GitRemoteProbe::new(spec.remote.clone()).in_dir(spec.workspace.clone()));
    let slot = sequencer.slot().clone();
    close_stale_runs(&slot, ledger.as_ref()).await?;

    let mut trigger =
        Trigger::new(spec.branches.clone(), spec.poll, probe, sequencer).with_slot(slot);
    trigger
        .seed_from_ledger(ledger.as_ref())
        .await
        .context("Failed to read last processed revisions")?;

    // Push notifications enter through this channel; no receiver for them
    // ships with the daemon, so the sender is only held open.
    let (_push, events) = mpsc::channel(16);
    let (shutdown_tx, shutdown) = watch::channel(false);
    let trigger_loop = tokio::spawn(trigger.run(events, shutdown));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;
    info!("shutdown requested");
    abort.abort();
    shutdown_tx.send_replace(true);
    trigger_loop.await.context("Trigger loop panicked")?;

    METRICS.flush();
    info!("gantryd stopped");
    Ok(())
}

//! Gantry CLI
//!
//! The `gantry` command runs and inspects the deployment pipeline.
//!
//! ## Commands
//!
//! - `run`: run the pipeline once for the workspace's current revision
//! - `gate`: show whether a branch would deploy with the current configuration
//! - `runs`: list recorded runs or show one
//! - `artifacts`: list or verify a run's published artifacts
//! - `trust`: pre-provision a host key in the trust store
//! - `check`: validate the pipeline file

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gantry_ci::{abort_pair, PipelineSequencer, PipelineSpec, RunReport};
use gantry_core::{
    capture_head_sha, current_branch, evaluate_gate, verify_artifacts, ConfigKey, ConfigSource,
    EnvResolver, PipelineRunRecord, RunId, RunLedger, RunSpan, SshTransport, StageOutcome,
    TriggerEvent, TrustStatus, TrustStore,
};
use gantry_state::{FsCasStore, FsRunLedger};
use tracing::{info, Level};

#[derive(Parser)]
#[command(name = "gantry")]
#[command(version = gantry_core::VERSION)]
#[command(about = "Gated deployment pipeline", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Pipeline file (default: <workspace>/gantry.toml, or the built-in pipeline)
    #[arg(short, long, global = true, env = "GANTRY_PIPELINE")]
    config: Option<PathBuf>,

    /// Workspace holding the checked-out repository
    #[arg(short, long, global = true, default_value = ".")]
    workspace: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline once
    Run {
        /// Branch to record (default: the workspace's current branch)
        #[arg(short, long)]
        branch: Option<String>,

        /// Revision to run (default: the workspace HEAD)
        #[arg(short, long)]
        revision: Option<String>,
    },

    /// Evaluate the deploy gate without running anything
    Gate {
        /// Branch to evaluate (default: the workspace's current branch)
        #[arg(short, long)]
        branch: Option<String>,
    },

    /// Inspect recorded runs
    Runs {
        #[command(subcommand)]
        action: RunsAction,
    },

    /// Inspect published artifacts
    Artifacts {
        #[command(subcommand)]
        action: ArtifactsAction,
    },

    /// Fetch and record a host's keys in the trust store
    Trust {
        /// Host name or address (default: the configured deploy host)
        host: Option<String>,

        #[arg(short, long, default_value = "22")]
        port: u16,
    },

    /// Validate the pipeline file and print its stages
    Check,
}

#[derive(Subcommand)]
enum RunsAction {
    /// List runs, oldest first
    List {
        #[arg(short, long)]
        branch: Option<String>,

        /// Show only the most recent runs
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Show one run
    Show {
        run_id: String,

        /// Print the stored record as JSON
        #[arg(long)]
        raw: bool,
    },
}

#[derive(Subcommand)]
enum ArtifactsAction {
    /// List a run's artifacts
    List { run_id: String },

    /// Re-hash a run's artifacts against their recorded digests
    Verify { run_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    gantry_core::init_tracing(cli.json, level);

    let spec = load_spec(cli.config.as_deref(), &cli.workspace)?;

    match cli.command {
        Commands::Run { branch, revision } => cmd_run(&spec, branch, revision).await,
        Commands::Gate { branch } => cmd_gate(&spec, branch),
        Commands::Runs { action } => match action {
            RunsAction::List { branch, limit } => {
                cmd_runs_list(&spec, branch.as_deref(), limit).await
            }
            RunsAction::Show { run_id, raw } => cmd_runs_show(&spec, &run_id, raw).await,
        },
        Commands::Artifacts { action } => match action {
            ArtifactsAction::List { run_id } => cmd_artifacts_list(&spec, &run_id).await,
            ArtifactsAction::Verify { run_id } => cmd_artifacts_verify(&spec, &run_id).await,
        },
        Commands::Trust { host, port } => cmd_trust(&spec, host, port).await,
        Commands::Check => cmd_check(&spec),
    }
}

fn load_spec(config: Option<&Path>, workspace: &Path) -> Result<PipelineSpec> {
    match config {
        Some(path) => PipelineSpec::load(path)
            .with_context(|| format!("Failed to load pipeline file {}", path.display())),
        None => PipelineSpec::discover(workspace).context("Failed to load pipeline file"),
    }
}

fn open_ledger(spec: &PipelineSpec) -> Result<Arc<FsRunLedger>> {
    let dir = spec.state_dir.join("runs");
    Ok(Arc::new(FsRunLedger::new(&dir).with_context(|| {
        format!("Failed to open run ledger at {}", dir.display())
    })?))
}

fn open_cas(spec: &PipelineSpec) -> Result<Arc<FsCasStore>> {
    let dir = spec.state_dir.join("cas");
    Ok(Arc::new(FsCasStore::new(&dir).with_context(|| {
        format!("Failed to open artifact store at {}", dir.display())
    })?))
}

fn trust_store(config: &EnvResolver) -> Result<TrustStore> {
    let dir = config
        .resolve_path(ConfigKey::TrustStore)
        .with_context(|| format!("{} is not set", ConfigKey::TrustStore))?;
    Ok(TrustStore::new(dir))
}

fn workspace_branch(spec: &PipelineSpec, branch: Option<String>) -> Result<String> {
    match branch {
        Some(b) => Ok(b),
        None => current_branch(&spec.workspace)
            .context("Failed to read the workspace branch")?
            .context("Workspace is not on a branch; pass --branch"),
    }
}

async fn cmd_run(
    spec: &PipelineSpec,
    branch: Option<String>,
    revision: Option<String>,
) -> Result<()> {
    let branch = workspace_branch(spec, branch)?;
    let revision = match revision {
        Some(r) => r,
        None => capture_head_sha(&spec.workspace).context("Failed to read workspace HEAD")?,
    };

    let config = spec.configure(EnvResolver::from_env());
    let ledger = open_ledger(spec)?;
    let cas = open_cas(spec)?;
    let remote = Arc::new(SshTransport::new(trust_store(&config)?));

    let (abort, signal) = abort_pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, aborting run");
            abort.abort();
        }
    });

    let sequencer = PipelineSequencer::new(spec, ledger, cas, remote).with_abort(signal);

    println!("Running pipeline {} for {} @ {}", spec.name, branch, revision);
    println!("Workspace: {}", spec.workspace.display());
    println!();

    let record = sequencer
        .run(TriggerEvent::manual(&branch, &revision))
        .await
        .context("Pipeline failed to run")?;

    print_stages(&record);
    let report = RunReport::from_record(&record, spec.deploy_stage().map(|s| s.name.as_str()));
    println!();
    println!("{report}");

    if report.succeeded() {
        println!("\n✓ Pipeline succeeded");
        Ok(())
    } else {
        anyhow::bail!("Pipeline {}", record.status)
    }
}

fn cmd_gate(spec: &PipelineSpec, branch: Option<String>) -> Result<()> {
    let branch = workspace_branch(spec, branch)?;
    let config = spec.configure(EnvResolver::from_env());

    println!("Configuration:");
    for key in ConfigKey::ALL {
        let value = config.resolve(key);
        let shown = match (value.as_str(), key.is_sensitive()) {
            (None, _) => "<absent>".to_string(),
            (Some(_), true) => "<set>".to_string(),
            (Some(v), false) => v.to_string(),
        };
        let source = match value.source {
            ConfigSource::Override => "override",
            ConfigSource::Default => "default",
            ConfigSource::Absent => "absent",
        };
        println!("  {:<24} {} ({})", key.env_var(), shown, source);
    }
    println!();

    let decision = evaluate_gate(Some(&branch), &config);
    if decision.allowed {
        println!("✓ Branch {branch} would deploy");
    } else {
        println!("✗ Branch {branch} would not deploy: {}", decision.reason);
    }
    Ok(())
}

async fn cmd_runs_list(spec: &PipelineSpec, branch: Option<&str>, limit: usize) -> Result<()> {
    let ledger = open_ledger(spec)?;
    let runs = ledger.list_runs(branch).await.context("Failed to list runs")?;
    if runs.is_empty() {
        println!("No runs recorded.");
        return Ok(());
    }

    let skip = runs.len().saturating_sub(limit);
    for run in runs.iter().skip(skip) {
        println!(
            "{}  {:<8} {:<20} {:.12}  {}",
            run.run_id,
            run.status.as_str(),
            run.metadata.branch.as_deref().unwrap_or("-"),
            run.metadata.revision,
            run.created_at.format("%Y-%m-%d %H:%M:%S"),
        );
    }
    Ok(())
}

async fn cmd_runs_show(spec: &PipelineSpec, run_id: &str, raw: bool) -> Result<()> {
    let ledger = open_ledger(spec)?;
    let record = ledger
        .get_run(&RunId(run_id.to_string()))
        .await
        .with_context(|| format!("Run {run_id} not found"))?;

    if raw {
        println!("{}", serde_json::to_string_pretty(&record)?);
        return Ok(());
    }

    let _span = RunSpan::enter(run_id, record.metadata.branch.as_deref().unwrap_or("-"));
    print_stages(&record);
    println!();
    println!(
        "{}",
        RunReport::from_record(&record, spec.deploy_stage().map(|s| s.name.as_str()))
    );
    Ok(())
}

async fn cmd_artifacts_list(spec: &PipelineSpec, run_id: &str) -> Result<()> {
    let ledger = open_ledger(spec)?;
    let record = ledger
        .get_run(&RunId(run_id.to_string()))
        .await
        .with_context(|| format!("Run {run_id} not found"))?;

    if record.artifacts.is_empty() {
        println!("Run {run_id} has no artifacts.");
        return Ok(());
    }
    for artifact in &record.artifacts {
        println!(
            "{:<8} {:<48} {:>10}  {}",
            artifact.stage,
            artifact.path,
            artifact.size_bytes,
            artifact.digest.short()
        );
    }
    Ok(())
}

async fn cmd_artifacts_verify(spec: &PipelineSpec, run_id: &str) -> Result<()> {
    let ledger = open_ledger(spec)?;
    let cas = open_cas(spec)?;
    let record = ledger
        .get_run(&RunId(run_id.to_string()))
        .await
        .with_context(|| format!("Run {run_id} not found"))?;

    let _span = RunSpan::enter(run_id, record.metadata.branch.as_deref().unwrap_or("-"));
    let checks = verify_artifacts(&record, cas.as_ref())
        .await
        .context("Failed to verify artifacts")?;

    let mut broken = 0;
    for check in &checks {
        match check.to_error() {
            None => println!("  ✓ {}", check.path),
            Some(e) => {
                broken += 1;
                println!("  ✗ {}: {}", check.path, e);
            }
        }
    }
    println!();
    if broken == 0 {
        println!("✓ {} artifact(s) intact", checks.len());
        Ok(())
    } else {
        anyhow::bail!("{broken} of {} artifact(s) failed verification", checks.len())
    }
}

async fn cmd_trust(spec: &PipelineSpec, host: Option<String>, port: u16) -> Result<()> {
    let config = spec.configure(EnvResolver::from_env());
    let host = match host {
        Some(h) => h,
        None => config
            .require(ConfigKey::DeployHost)
            .context("No host given and no deploy host configured")?,
    };
    let store = trust_store(&config)?;
    let strict = config.resolve(ConfigKey::StrictHostKeys).is_true();

    let status = store
        .bootstrap(&host, port, strict)
        .await
        .with_context(|| format!("Failed to bootstrap trust for {host}"))?;
    match status {
        TrustStatus::AlreadyTrusted => println!("✓ {host} is already trusted"),
        TrustStatus::Recorded { keys } => println!(
            "✓ Recorded {keys} key(s) for {host} in {}",
            store.known_hosts_path().display()
        ),
        TrustStatus::FetchFailed { message } => {
            anyhow::bail!("Could not fetch host keys for {host}: {message}")
        }
    }
    Ok(())
}

fn cmd_check(spec: &PipelineSpec) -> Result<()> {
    spec.validate().context("Pipeline definition is invalid")?;
    println!("Pipeline: {}", spec.name);
    println!("Watching: {} on {}", spec.branches.join(", "), spec.remote);
    println!("Poll: every {}", spec.poll);
    println!("Digest: {}", spec.stages_digest());
    println!();
    for (i, stage) in spec.stages.iter().enumerate() {
        let mut flags = Vec::new();
        if !stage.required {
            flags.push("optional");
        }
        if stage.always_run {
            flags.push("always-run");
        }
        if !stage.enabled {
            flags.push("disabled");
        }
        if stage.post.is_some() {
            flags.push("publishes");
        }
        println!(
            "  {}. {} [{}] {}",
            i + 1,
            stage.name,
            stage.kind.name(),
            flags.join(", ")
        );
    }
    println!("\n✓ Pipeline definition is valid");
    Ok(())
}

fn print_stages(record: &PipelineRunRecord) {
    println!("Run ID: {}", record.run_id);
    println!("Status: {}", record.status);
    for stage in &record.stages {
        let mark = match stage.outcome {
            StageOutcome::Success => "✓",
            StageOutcome::Failed => "✗",
            StageOutcome::Skipped => "-",
        };
        match &stage.reason {
            Some(reason) => println!(
                "  {} {} ({}ms): {}",
                mark, stage.name, stage.duration_ms, reason
            ),
            None => println!("  {} {} ({}ms)", mark, stage.name, stage.duration_ms),
        }
    }
}

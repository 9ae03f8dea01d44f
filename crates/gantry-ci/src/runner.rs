//! Local stage command execution.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Per-run values exposed to stage commands.
#[derive(Debug, Clone)]
pub struct StageContext {
    pub run_id: String,
    pub branch: String,
    pub revision: String,
    pub workspace: PathBuf,
}

impl StageContext {
    fn vars(&self) -> [(&'static str, &str); 3] {
        [
            ("GANTRY_RUN_ID", self.run_id.as_str()),
            ("GANTRY_BRANCH", self.branch.as_str()),
            ("GANTRY_REVISION", self.revision.as_str()),
        ]
    }

    /// Replace `${GANTRY_*}` placeholders in one argument.
    pub fn expand(&self, arg: &str) -> String {
        let mut out = arg.to_string();
        for (name, value) in self.vars() {
            out = out.replace(&format!("${{{name}}}"), value);
        }
        out
    }
}

/// Requests an abort of the current run.
#[derive(Debug, Clone)]
pub struct AbortHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl AbortHandle {
    pub fn abort(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_aborted(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Observes an [`AbortHandle`].
#[derive(Debug, Clone)]
pub struct AbortSignal {
    rx: watch::Receiver<bool>,
}

/// A connected handle and signal.
pub fn abort_pair() -> (AbortHandle, AbortSignal) {
    let (tx, rx) = watch::channel(false);
    (AbortHandle { tx: Arc::new(tx) }, AbortSignal { rx })
}

impl AbortSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_aborted(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once an abort is requested. Pends forever when the handle
    /// is gone without having aborted.
    pub async fn aborted(&mut self) {
        let fired = self.rx.wait_for(|aborted| *aborted).await.map(|_| ());
        if fired.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// How the last command of a stage ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// Exited on its own; see `exit_code`.
    Exited,
    TimedOut,
    Aborted,
    SpawnFailed(String),
}

#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// None when killed by a signal or never started.
    pub exit_code: Option<i32>,
    /// Combined stdout/stderr of every command that ran, each preceded by
    /// a `$ argv` line.
    pub output: String,
    pub duration_ms: u64,
    pub termination: Termination,
}

impl CommandOutput {
    pub fn succeeded(&self) -> bool {
        self.termination == Termination::Exited && self.exit_code == Some(0)
    }

    pub fn aborted(&self) -> bool {
        self.termination == Termination::Aborted
    }

    /// Failure description for anything other than a plain non-zero exit.
    pub fn interruption(&self, timeout: Option<Duration>) -> Option<String> {
        match &self.termination {
            Termination::Exited if self.exit_code.is_none() => {
                Some("terminated by signal".to_string())
            }
            Termination::Exited => None,
            Termination::TimedOut => Some(match timeout {
                Some(t) => format!("timed out after {}s", t.as_secs()),
                None => "timed out".to_string(),
            }),
            Termination::Aborted => Some("aborted".to_string()),
            Termination::SpawnFailed(e) => Some(format!("failed to start: {e}")),
        }
    }
}

/// Runs stage commands in the workspace.
pub struct LocalRunner;

impl LocalRunner {
    /// Run `commands` in order, stopping at the first one that does not
    /// exit zero. `timeout` bounds the whole list.
    pub async fn run(
        commands: &[Vec<String>],
        timeout: Option<Duration>,
        ctx: &StageContext,
        abort: &mut AbortSignal,
    ) -> CommandOutput {
        let start = Instant::now();
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        let mut output = String::new();
        let mut exit_code = Some(0);
        let mut termination = Termination::Exited;

        for argv in commands {
            let step = Self::run_one(argv, ctx, deadline, abort).await;
            output.push_str(&step.output);
            exit_code = step.exit_code;
            termination = step.termination;
            if !(termination == Termination::Exited && exit_code == Some(0)) {
                break;
            }
        }

        CommandOutput {
            exit_code,
            output,
            duration_ms: start.elapsed().as_millis() as u64,
            termination,
        }
    }

    async fn run_one(
        argv: &[String],
        ctx: &StageContext,
        deadline: Option<tokio::time::Instant>,
        abort: &mut AbortSignal,
    ) -> CommandOutput {
        let start = Instant::now();
        let args: Vec<String> = argv.iter().map(|a| ctx.expand(a)).collect();
        let mut output = format!("$ {}\n", args.join(" "));
        let finish = |output: String, exit_code, termination| CommandOutput {
            exit_code,
            output,
            duration_ms: start.elapsed().as_millis() as u64,
            termination,
        };

        let Some((exe, rest)) = args.split_first() else {
            return finish(output, None, Termination::SpawnFailed("empty command".into()));
        };
        debug!(run_id = %ctx.run_id, command = %exe, "spawning stage command");

        let child = Command::new(exe)
            .args(rest)
            .current_dir(&ctx.workspace)
            .envs(ctx.vars())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let child = match child {
            Ok(child) => child,
            Err(e) => {
                warn!(run_id = %ctx.run_id, command = %exe, error = %e, "stage command failed to start");
                output.push_str(&format!("failed to start {exe}: {e}\n"));
                return finish(output, None, Termination::SpawnFailed(e.to_string()));
            }
        };

        let expiry = async {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        // Dropping the wait future drops the child, which kills it.
        tokio::select! {
            result = child.wait_with_output() => match result {
                Ok(out) => {
                    output.push_str(&String::from_utf8_lossy(&out.stdout));
                    output.push_str(&String::from_utf8_lossy(&out.stderr));
                    finish(output, out.status.code(), Termination::Exited)
                }
                Err(e) => {
                    output.push_str(&format!("wait failed: {e}\n"));
                    finish(output, None, Termination::SpawnFailed(e.to_string()))
                }
            },
            _ = expiry => {
                output.push_str("timed out\n");
                finish(output, None, Termination::TimedOut)
            }
            _ = abort.aborted() => {
                output.push_str("aborted\n");
                finish(output, None, Termination::Aborted)
            }
        }
    }
}

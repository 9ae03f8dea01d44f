//! OpenSSH client transport.

use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{info, warn};

use super::trust::TrustStore;
use super::{RemoteExecutor, RemoteInvocation, RemoteOutcome};
use crate::domain::{Result, TransportError};

/// Exit status OpenSSH reserves for its own failures.
const SSH_ERROR_EXIT: i32 = 255;

/// Runs the deployment script through the system `ssh` client.
#[derive(Debug, Clone)]
pub struct SshTransport {
    trust: TrustStore,
    program: String,
}

impl SshTransport {
    pub fn new(trust: TrustStore) -> Self {
        Self {
            trust,
            program: "ssh".to_string(),
        }
    }

    /// Override the ssh executable.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn trust_store(&self) -> &TrustStore {
        &self.trust
    }

    /// Arguments for one non-interactive session with a forced tty.
    pub fn build_args(&self, invocation: &RemoteInvocation) -> Vec<String> {
        let target = &invocation.target;
        let mut args = vec!["-tt".to_string()];
        for opt in [
            "BatchMode=yes".to_string(),
            "StrictHostKeyChecking=yes".to_string(),
            format!("UserKnownHostsFile={}", self.trust.known_hosts_path().display()),
            "ConnectTimeout=10".to_string(),
            "ServerAliveInterval=15".to_string(),
            "ServerAliveCountMax=3".to_string(),
        ] {
            args.push("-o".to_string());
            args.push(opt);
        }
        if let Some(identity) = &invocation.identity {
            args.push("-o".to_string());
            args.push("IdentitiesOnly=yes".to_string());
            args.push("-i".to_string());
            args.push(identity.path().display().to_string());
        }
        if target.port != 22 {
            args.push("-p".to_string());
            args.push(target.port.to_string());
        }
        args.push(target.destination());
        args.push(remote_command(&invocation.script));
        args
    }
}

#[async_trait]
impl RemoteExecutor for SshTransport {
    async fn execute(&self, invocation: &RemoteInvocation) -> Result<RemoteOutcome> {
        let target = &invocation.target;
        self.trust
            .bootstrap(&target.host, target.port, invocation.strict_host_keys)
            .await?;

        let start = Instant::now();
        info!(target = %target, script = %invocation.script, "opening remote session");
        let child = Command::new(&self.program)
            .args(self.build_args(invocation))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TransportError::Connection {
                host: target.host.clone(),
                message: format!("failed to start {}: {e}", self.program),
            })?;

        let output = match invocation.timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| TransportError::Timeout {
                    secs: limit.as_secs(),
                })?,
            None => child.wait_with_output().await,
        }
        .map_err(|e| TransportError::Connection {
            host: target.host.clone(),
            message: e.to_string(),
        })?;

        let exit_code = output.status.code().unwrap_or(-1);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if exit_code == SSH_ERROR_EXIT {
            warn!(target = %target, "remote session could not be established");
            return Err(TransportError::Connection {
                host: target.host.clone(),
                message: stderr.trim().to_string(),
            }
            .into());
        }

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&stderr);
        Ok(RemoteOutcome {
            exit_code,
            output: combined,
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }
}

/// `bash <script>` with the path quoted for the remote shell. A leading
/// `~/` stays unquoted so the remote side expands it.
fn remote_command(script: &str) -> String {
    match script.strip_prefix("~/") {
        Some(rest) => format!("bash ~/{}", shell_quote(rest)),
        None => format!("bash {}", shell_quote(script)),
    }
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

//! Local host-key trust store (an OpenSSH `known_hosts` file).
//!
//! First contact with a host fetches its keys non-interactively with
//! `ssh-keyscan` and appends them, so the session that follows never stops
//! at a host-verification prompt. The fetch is best effort: when it fails,
//! the session still runs and strict host checking decides.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::domain::TransportError;

/// Bound on the one-time host-key fetch.
pub const KEYSCAN_TIMEOUT: Duration = Duration::from_secs(10);

const KNOWN_HOSTS: &str = "known_hosts";

/// Result of a trust bootstrap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustStatus {
    /// The host already had an entry; nothing was fetched.
    AlreadyTrusted,
    /// Keys were fetched and appended.
    Recorded { keys: usize },
    /// The fetch failed or returned nothing; the store is unchanged.
    FetchFailed { message: String },
}

#[derive(Debug, Clone)]
pub struct TrustStore {
    dir: PathBuf,
    keyscan_program: String,
}

impl TrustStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            keyscan_program: "ssh-keyscan".to_string(),
        }
    }

    /// Override the keyscan executable.
    pub fn with_keyscan_program(mut self, program: impl Into<String>) -> Self {
        self.keyscan_program = program.into();
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn known_hosts_path(&self) -> PathBuf {
        self.dir.join(KNOWN_HOSTS)
    }

    /// Create the store directory if needed and restrict it to the owner.
    pub fn ensure_dir(&self) -> Result<(), TransportError> {
        fs::create_dir_all(&self.dir).map_err(|e| self.io_error(e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&self.dir, fs::Permissions::from_mode(0o700))
                .map_err(|e| self.io_error(e))?;
        }
        Ok(())
    }

    /// True when a plain (unhashed) entry names this host.
    pub fn contains(&self, host: &str, port: u16) -> Result<bool, TransportError> {
        let contents = match fs::read_to_string(self.known_hosts_path()) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(self.io_error(e)),
        };
        let pattern = host_pattern(host, port);
        Ok(contents
            .lines()
            .filter_map(|l| l.split_whitespace().next())
            .any(|hosts| hosts.split(',').any(|h| h == pattern)))
    }

    /// Append keyscan output lines not already present. Comments and blank
    /// lines are dropped. Returns how many entries were written.
    pub fn record_host_keys(&self, scan_output: &str) -> Result<usize, TransportError> {
        let path = self.known_hosts_path();
        let existing = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(self.io_error(e)),
        };
        let mut fresh: Vec<&str> = Vec::new();
        for line in scan_output.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if !existing.lines().any(|l| l.trim() == line) && !fresh.contains(&line) {
                fresh.push(line);
            }
        }
        if fresh.is_empty() {
            return Ok(0);
        }

        let mut options = OpenOptions::new();
        options.create(true).append(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&path).map_err(|e| self.io_error(e))?;
        if !existing.is_empty() && !existing.ends_with('\n') {
            writeln!(file).map_err(|e| self.io_error(e))?;
        }
        for line in &fresh {
            writeln!(file, "{line}").map_err(|e| self.io_error(e))?;
        }
        Ok(fresh.len())
    }

    /// Make sure the host is trusted before a session opens.
    ///
    /// In strict mode nothing is fetched and an unknown host is an error.
    /// Otherwise a failed fetch is reported in the status, not as an error.
    pub async fn bootstrap(
        &self,
        host: &str,
        port: u16,
        strict: bool,
    ) -> Result<TrustStatus, TransportError> {
        self.ensure_dir()?;
        if self.contains(host, port)? {
            debug!(host = %host, "host already trusted");
            return Ok(TrustStatus::AlreadyTrusted);
        }
        if strict {
            return Err(TransportError::UnknownHost {
                host: host.to_string(),
            });
        }

        match self.fetch_host_keys(host, port).await {
            Ok(scan) => {
                let keys = self.record_host_keys(&scan)?;
                if keys == 0 {
                    let message = "no host keys returned".to_string();
                    warn!(host = %host, %message, "host key fetch returned nothing");
                    return Ok(TrustStatus::FetchFailed { message });
                }
                info!(host = %host, keys, "recorded host keys on first contact");
                Ok(TrustStatus::Recorded { keys })
            }
            Err(e) => {
                warn!(host = %host, error = %e, "host key fetch failed, continuing");
                Ok(TrustStatus::FetchFailed {
                    message: e.to_string(),
                })
            }
        }
    }

    async fn fetch_host_keys(&self, host: &str, port: u16) -> Result<String, TransportError> {
        let fetch_error = |message: String| TransportError::HostKeyFetch {
            host: host.to_string(),
            message,
        };

        let mut cmd = Command::new(&self.keyscan_program);
        cmd.arg("-T").arg(KEYSCAN_TIMEOUT.as_secs().to_string());
        if port != 22 {
            cmd.arg("-p").arg(port.to_string());
        }
        cmd.arg(host)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|e| fetch_error(e.to_string()))?;
        // keyscan's own -T bounds each read; this bounds the whole process.
        let output = tokio::time::timeout(KEYSCAN_TIMEOUT * 2, child.wait_with_output())
            .await
            .map_err(|_| fetch_error("timed out".to_string()))?
            .map_err(|e| fetch_error(e.to_string()))?;

        if !output.status.success() && output.stdout.is_empty() {
            return Err(fetch_error(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn io_error(&self, source: std::io::Error) -> TransportError {
        TransportError::TrustStore {
            path: self.dir.clone(),
            source,
        }
    }
}

/// known_hosts host field for a host and port.
fn host_pattern(host: &str, port: u16) -> String {
    if port == 22 {
        host.to_string()
    } else {
        format!("[{host}]:{port}")
    }
}

//! Remote execution transport.
//!
//! One deploy is one short-lived remote session: bootstrap trust for the
//! target host, open a session with a forced tty, run the deployment
//! script, report its exit status. Sessions are never reused and the
//! transport never retries.

pub mod ssh;
pub mod trust;

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{ConfigKey, EnvResolver};
use crate::domain::Result;

pub use ssh::SshTransport;
pub use trust::{TrustStore, TrustStatus};

/// Address of the deploy target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTarget {
    pub host: String,
    pub user: String,
    pub port: u16,
}

impl RemoteTarget {
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            user: user.into(),
            port: 22,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// `user@host` destination string.
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

impl fmt::Display for RemoteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.port == 22 {
            write!(f, "{}", self.destination())
        } else {
            write!(f, "{}:{}", self.destination(), self.port)
        }
    }
}

/// Credential capability for one remote session.
///
/// Only the transport reads the path; formatting never reveals it.
#[derive(Clone, PartialEq, Eq)]
pub struct SshIdentity(PathBuf);

impl SshIdentity {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    pub(crate) fn path(&self) -> &Path {
        &self.0
    }
}

impl fmt::Debug for SshIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SshIdentity(<redacted>)")
    }
}

impl fmt::Display for SshIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

/// A fully resolved request to run the deployment script once.
#[derive(Debug, Clone)]
pub struct RemoteInvocation {
    pub target: RemoteTarget,
    /// Script path on the remote host; a leading `~/` is expanded remotely.
    pub script: String,
    pub identity: Option<SshIdentity>,
    /// Upper bound for the whole session, `None` for no limit.
    pub timeout: Option<Duration>,
    /// Skip the live host-key fetch and require a pre-provisioned entry.
    pub strict_host_keys: bool,
}

impl RemoteInvocation {
    /// Build the invocation from resolved configuration. Fails when the
    /// host or operator account is missing.
    pub fn from_config(config: &EnvResolver, timeout: Option<Duration>) -> Result<Self> {
        let host = config.require(ConfigKey::DeployHost)?;
        let user = config.require(ConfigKey::DeployUser)?;
        let script = config.require(ConfigKey::DeployScript)?;
        let (host, port) = split_host_port(&host);
        Ok(Self {
            target: RemoteTarget::new(host, user).with_port(port),
            script,
            identity: config
                .resolve_path(ConfigKey::SshIdentity)
                .map(SshIdentity::new),
            timeout,
            strict_host_keys: config.resolve(ConfigKey::StrictHostKeys).is_true(),
        })
    }
}

/// Result of a completed remote session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteOutcome {
    pub exit_code: i32,
    /// Combined stdout and stderr of the remote command.
    pub output: String,
    pub duration_ms: u64,
}

impl RemoteOutcome {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}

/// Executes one remote command. `Err` means no usable session was
/// established; a session that ran and exited non-zero is `Ok`.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn execute(&self, invocation: &RemoteInvocation) -> Result<RemoteOutcome>;
}

fn split_host_port(raw: &str) -> (String, u16) {
    match raw.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => match port.parse() {
            Ok(port) => (host.to_string(), port),
            Err(_) => (raw.to_string(), 22),
        },
        _ => (raw.to_string(), 22),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_never_formats_its_path() {
        let id = SshIdentity::new("/home/ci/.ssh/deploy_ed25519");
        assert!(!format!("{id:?}").contains("deploy_ed25519"));
        assert!(!format!("{id}").contains("deploy_ed25519"));
        let inv = RemoteInvocation {
            target: RemoteTarget::new("203.0.113.7", "alice"),
            script: "~/deploy.sh".to_string(),
            identity: Some(id),
            timeout: None,
            strict_host_keys: false,
        };
        assert!(!format!("{inv:?}").contains("deploy_ed25519"));
    }

    #[test]
    fn invocation_from_config() {
        let config = EnvResolver::new()
            .with_default(ConfigKey::DeployHost, "203.0.113.7:2222")
            .with_override(ConfigKey::DeployUser, "alice");
        let inv = RemoteInvocation::from_config(&config, None).unwrap();
        assert_eq!(inv.target.host, "203.0.113.7");
        assert_eq!(inv.target.port, 2222);
        assert_eq!(inv.target.user, "alice");
        assert_eq!(inv.script, "~/deploy.sh");
        assert!(inv.identity.is_none());
        assert!(!inv.strict_host_keys);
    }

    #[test]
    fn invocation_requires_operator() {
        let config = EnvResolver::new().with_default(ConfigKey::DeployHost, "203.0.113.7");
        assert!(RemoteInvocation::from_config(&config, None).is_err());
    }

    #[test]
    fn host_port_parsing() {
        assert_eq!(split_host_port("example.com"), ("example.com".to_string(), 22));
        assert_eq!(split_host_port("example.com:2200"), ("example.com".to_string(), 2200));
        assert_eq!(split_host_port("::1"), ("::1".to_string(), 22));
        assert_eq!(split_host_port("host:abc"), ("host:abc".to_string(), 22));
    }

    #[test]
    fn target_display() {
        assert_eq!(RemoteTarget::new("h", "u").to_string(), "u@h");
        assert_eq!(RemoteTarget::new("h", "u").with_port(2222).to_string(), "u@h:2222");
    }
}

//! Layered resolution of named configuration values.
//!
//! A key resolves to the operator's explicit override if one was supplied,
//! otherwise to a default (compiled in, or registered from the pipeline
//! file), otherwise to an explicit absent value. Overrides are snapshotted
//! when the resolver is built, so a resolver created at the start of a run
//! answers the same way for the whole run and a new run sees fresh values.
//!
//! Environment variables read by [`EnvResolver::from_env`]:
//! - `GANTRY_DEPLOY_HOST` - target host address
//! - `GANTRY_DEPLOY_USER` - operator account (no default)
//! - `GANTRY_DEPLOY_SCRIPT` - remote deployment script (default `~/deploy.sh`)
//! - `GANTRY_SSH_IDENTITY` - private key used for the deploy session
//! - `GANTRY_TRUST_STORE` - directory holding `known_hosts` (default `~/.ssh`)
//! - `GANTRY_STRICT_HOST_KEYS` - `true` disables live host-key fetching

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fmt;
use std::path::PathBuf;

use crate::domain::{GantryError, Result};

/// Named configuration entries used by the gate and the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ConfigKey {
    DeployHost,
    DeployUser,
    DeployScript,
    SshIdentity,
    TrustStore,
    StrictHostKeys,
}

impl ConfigKey {
    pub const ALL: [ConfigKey; 6] = [
        ConfigKey::DeployHost,
        ConfigKey::DeployUser,
        ConfigKey::DeployScript,
        ConfigKey::SshIdentity,
        ConfigKey::TrustStore,
        ConfigKey::StrictHostKeys,
    ];

    /// Environment variable carrying the operator override.
    pub fn env_var(self) -> &'static str {
        match self {
            ConfigKey::DeployHost => "GANTRY_DEPLOY_HOST",
            ConfigKey::DeployUser => "GANTRY_DEPLOY_USER",
            ConfigKey::DeployScript => "GANTRY_DEPLOY_SCRIPT",
            ConfigKey::SshIdentity => "GANTRY_SSH_IDENTITY",
            ConfigKey::TrustStore => "GANTRY_TRUST_STORE",
            ConfigKey::StrictHostKeys => "GANTRY_STRICT_HOST_KEYS",
        }
    }

    /// Compiled-in default, if the key has one.
    pub fn builtin_default(self) -> Option<&'static str> {
        match self {
            ConfigKey::DeployScript => Some("~/deploy.sh"),
            ConfigKey::TrustStore => Some("~/.ssh"),
            ConfigKey::StrictHostKeys => Some("false"),
            ConfigKey::DeployHost | ConfigKey::DeployUser | ConfigKey::SshIdentity => None,
        }
    }

    /// Values of sensitive keys are never rendered.
    pub fn is_sensitive(self) -> bool {
        matches!(self, ConfigKey::SshIdentity)
    }
}

impl fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.env_var())
    }
}

/// Which layer a value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSource {
    Override,
    Default,
    Absent,
}

/// A resolved configuration entry. Resolution is total: every key yields a
/// value, with `Absent` standing in for "nothing configured".
#[derive(Clone, PartialEq, Eq)]
pub struct ConfigValue {
    pub key: ConfigKey,
    pub source: ConfigSource,
    value: Option<String>,
}

impl ConfigValue {
    /// True when a non-blank value resolved.
    pub fn is_present(&self) -> bool {
        self.as_str().is_some()
    }

    /// The trimmed value, or None when absent or blank.
    pub fn as_str(&self) -> Option<&str> {
        self.value
            .as_deref()
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }

    /// Interpret the value as a boolean flag.
    pub fn is_true(&self) -> bool {
        matches!(
            self.as_str().map(str::to_ascii_lowercase).as_deref(),
            Some("1" | "true" | "yes" | "on")
        )
    }
}

impl fmt::Debug for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shown = match (&self.value, self.key.is_sensitive()) {
            (Some(_), true) => Some("<redacted>"),
            (Some(v), false) => Some(v.as_str()),
            (None, _) => None,
        };
        f.debug_struct("ConfigValue")
            .field("key", &self.key)
            .field("source", &self.source)
            .field("value", &shown)
            .finish()
    }
}

/// Resolver over {explicit override, default}.
#[derive(Debug, Clone)]
pub struct EnvResolver {
    overrides: BTreeMap<ConfigKey, String>,
    defaults: BTreeMap<ConfigKey, String>,
    home: Option<PathBuf>,
}

impl Default for EnvResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvResolver {
    /// A resolver with no overrides and only the compiled-in defaults.
    pub fn new() -> Self {
        let defaults = ConfigKey::ALL
            .iter()
            .filter_map(|k| k.builtin_default().map(|v| (*k, v.to_string())))
            .collect();
        Self {
            overrides: BTreeMap::new(),
            defaults,
            home: None,
        }
    }

    /// Snapshot overrides from the process environment. Entries that are
    /// not valid UTF-8 are skipped.
    pub fn from_env() -> Self {
        let mut resolver = Self::from_vars(utf8_vars(std::env::vars_os()));
        resolver.home = std::env::var_os("HOME").map(PathBuf::from);
        resolver
    }

    /// Build overrides from `(NAME, value)` pairs; unknown names are ignored.
    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut resolver = Self::new();
        for (name, value) in vars {
            if let Some(key) = ConfigKey::ALL.iter().find(|k| k.env_var() == name.as_ref()) {
                resolver.overrides.insert(*key, value.into());
            }
        }
        resolver
    }

    /// Register an explicit override.
    pub fn with_override(mut self, key: ConfigKey, value: impl Into<String>) -> Self {
        self.overrides.insert(key, value.into());
        self
    }

    /// Register a default, replacing the compiled-in one.
    pub fn with_default(mut self, key: ConfigKey, value: impl Into<String>) -> Self {
        self.defaults.insert(key, value.into());
        self
    }

    /// Home directory used to expand `~/` in local paths.
    pub fn with_home(mut self, home: impl Into<PathBuf>) -> Self {
        self.home = Some(home.into());
        self
    }

    /// Resolve a key. Blank overrides count as not supplied.
    pub fn resolve(&self, key: ConfigKey) -> ConfigValue {
        let layered = [
            (ConfigSource::Override, self.overrides.get(&key)),
            (ConfigSource::Default, self.defaults.get(&key)),
        ];
        for (source, value) in layered {
            if let Some(v) = value.filter(|v| !v.trim().is_empty()) {
                return ConfigValue {
                    key,
                    source,
                    value: Some(v.clone()),
                };
            }
        }
        ConfigValue {
            key,
            source: ConfigSource::Absent,
            value: None,
        }
    }

    /// Resolve a key that must be present.
    pub fn require(&self, key: ConfigKey) -> Result<String> {
        self.resolve(key)
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| GantryError::Configuration(format!("{key} is not set")))
    }

    /// Resolve a key naming a local path, expanding a leading `~/`.
    pub fn resolve_path(&self, key: ConfigKey) -> Option<PathBuf> {
        let value = self.resolve(key);
        let raw = value.as_str()?;
        match (raw.strip_prefix("~/"), &self.home) {
            (Some(rest), Some(home)) => Some(home.join(rest)),
            _ => Some(PathBuf::from(raw)),
        }
    }
}

fn utf8_vars(
    vars: impl IntoIterator<Item = (OsString, OsString)>,
) -> impl Iterator<Item = (String, String)> {
    vars.into_iter()
        .filter_map(|(name, value)| Some((name.into_string().ok()?, value.into_string().ok()?)))
}

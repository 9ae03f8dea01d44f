//! Pipeline definition file (`gantry.toml`) and pipeline identity.
//!
//! ```toml
//! name = "campus-site"
//! remote = "https://git.example.edu/campus/site.git"
//! branches = ["main", "develop"]
//! poll = "H/2 * * * *"
//!
//! [deploy]
//! host = "203.0.113.7"
//! script = "~/deploy.sh"
//!
//! [[stages]]
//! kind = "validate"
//! commands = [["python", "manage.py", "check"], ["python", "manage.py", "migrate"]]
//! ```
//!
//! Stages of a built-in kind may omit `commands` to get the defaults. A file
//! without `[[stages]]` uses the built-in pipeline.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use gantry_core::{
    validate_artifact_path, ConfigKey, EnvResolver, GantryError, PollSchedule, Result,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::stage::{default_stages, PostAction, StageConfig, StageKind};

/// Conventional file name looked up in the workspace.
pub const PIPELINE_FILE: &str = "gantry.toml";

/// Lock file under the state directory held for the duration of a run.
pub const RUN_LOCK_FILE: &str = "run.lock";

const DEFAULT_STAGE_TIMEOUT_SECS: u64 = 1800;
const DEFAULT_DEPLOY_TIMEOUT_SECS: u64 = 900;

/// Deploy target settings; the environment may override host and script.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeploySettings {
    pub host: Option<String>,
    pub script: Option<String>,
    /// Upper bound for the remote session in seconds (0 = none).
    pub timeout_secs: u64,
}

impl DeploySettings {
    /// Register host and script as defaults under the operator's overrides.
    pub fn apply(&self, resolver: EnvResolver) -> EnvResolver {
        let mut resolver = resolver;
        if let Some(host) = &self.host {
            resolver = resolver.with_default(ConfigKey::DeployHost, host.clone());
        }
        if let Some(script) = &self.script {
            resolver = resolver.with_default(ConfigKey::DeployScript, script.clone());
        }
        resolver
    }
}

impl Default for DeploySettings {
    fn default() -> Self {
        Self {
            host: None,
            script: None,
            timeout_secs: DEFAULT_DEPLOY_TIMEOUT_SECS,
        }
    }
}

/// A fully resolved pipeline definition.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PipelineSpec {
    pub name: String,
    /// Repository URL or path polled for branch heads.
    pub remote: String,
    pub branches: Vec<String>,
    #[serde(serialize_with = "serialize_schedule")]
    pub poll: PollSchedule,
    pub workspace: PathBuf,
    /// Ledger and artifact store root.
    pub state_dir: PathBuf,
    pub deploy: DeploySettings,
    pub stages: Vec<StageConfig>,
}

fn serialize_schedule<S: serde::Serializer>(
    schedule: &PollSchedule,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    serializer.collect_str(schedule)
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PipelineFile {
    name: Option<String>,
    remote: Option<String>,
    branches: Option<Vec<String>>,
    poll: Option<String>,
    workspace: Option<PathBuf>,
    state_dir: Option<PathBuf>,
    #[serde(default)]
    deploy: DeployFile,
    #[serde(default)]
    stages: Vec<StageFile>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct DeployFile {
    host: Option<String>,
    script: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct StageFile {
    name: Option<String>,
    #[serde(default = "command_kind")]
    kind: StageKind,
    command: Option<Vec<String>>,
    commands: Option<Vec<Vec<String>>>,
    required: Option<bool>,
    #[serde(default)]
    always_run: bool,
    timeout_secs: Option<u64>,
    enabled: Option<bool>,
    artifacts: Option<Vec<String>>,
    post_commands: Option<Vec<Vec<String>>>,
}

fn command_kind() -> StageKind {
    StageKind::Command
}

impl StageFile {
    fn into_config(self, index: usize, deploy_timeout_secs: u64) -> Result<StageConfig> {
        let name = self
            .name
            .unwrap_or_else(|| match self.kind {
                StageKind::Command => format!("stage-{}", index + 1),
                kind => kind.name().to_string(),
            });
        let commands = match (self.command, self.commands) {
            (Some(_), Some(_)) => {
                return Err(definition(format!(
                    "stage {name}: use either `command` or `commands`"
                )))
            }
            (Some(one), None) => vec![one],
            (None, Some(many)) => many,
            (None, None) => self.kind.default_commands(),
        };
        let post = match (self.artifacts, self.post_commands) {
            (None, None) => self.kind.default_post(),
            (artifacts, commands) => {
                let default = self.kind.default_post().unwrap_or_default();
                Some(PostAction {
                    commands: commands.unwrap_or(default.commands),
                    artifacts: artifacts.unwrap_or(default.artifacts),
                })
            }
        };
        Ok(StageConfig {
            name,
            kind: self.kind,
            commands,
            required: self.required.unwrap_or(true),
            always_run: self.always_run,
            timeout_secs: self.timeout_secs.unwrap_or(match self.kind {
                StageKind::Deploy => deploy_timeout_secs,
                _ => DEFAULT_STAGE_TIMEOUT_SECS,
            }),
            enabled: self.enabled.unwrap_or(true),
            post,
        })
    }
}

fn definition(message: impl Into<String>) -> GantryError {
    GantryError::PipelineDefinition(message.into())
}

impl PipelineSpec {
    /// The built-in pipeline watching `main` of `origin`.
    pub fn default_pipeline(workspace: impl Into<PathBuf>) -> Self {
        let workspace = workspace.into();
        Self {
            name: "gantry".to_string(),
            remote: "origin".to_string(),
            branches: vec!["main".to_string()],
            poll: PollSchedule::default(),
            state_dir: workspace.join(".gantry"),
            workspace,
            deploy: DeploySettings::default(),
            stages: default_stages(),
        }
    }

    /// Parse a pipeline file. Relative paths resolve against `base_dir`.
    pub fn from_toml_str(contents: &str, base_dir: &Path) -> Result<Self> {
        let file: PipelineFile =
            toml::from_str(contents).map_err(|e| definition(e.to_string()))?;

        let workspace = base_dir.join(file.workspace.unwrap_or_else(|| PathBuf::from(".")));
        let state_dir = match file.state_dir {
            Some(dir) => base_dir.join(dir),
            None => workspace.join(".gantry"),
        };
        let poll = match file.poll {
            Some(expr) => PollSchedule::parse(&expr)?,
            None => PollSchedule::default(),
        };
        let deploy_timeout_secs = file
            .deploy
            .timeout_secs
            .unwrap_or(DEFAULT_DEPLOY_TIMEOUT_SECS);
        let stages = if file.stages.is_empty() {
            default_stages()
                .into_iter()
                .map(|mut stage| {
                    if stage.is_deploy() {
                        stage.timeout_secs = deploy_timeout_secs;
                    }
                    stage
                })
                .collect()
        } else {
            file.stages
                .into_iter()
                .enumerate()
                .map(|(i, s)| s.into_config(i, deploy_timeout_secs))
                .collect::<Result<Vec<_>>>()?
        };

        let spec = Self {
            name: file.name.unwrap_or_else(|| "gantry".to_string()),
            remote: file.remote.unwrap_or_else(|| "origin".to_string()),
            branches: file.branches.unwrap_or_else(|| vec!["main".to_string()]),
            poll,
            workspace,
            state_dir,
            deploy: DeploySettings {
                host: file.deploy.host,
                script: file.deploy.script,
                timeout_secs: deploy_timeout_secs,
            },
            stages,
        };
        spec.validate()?;
        Ok(spec)
    }

    /// Read and parse a pipeline file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_toml_str(&contents, base)
    }

    /// Load `gantry.toml` from `workspace`, or fall back to the built-in
    /// pipeline when the file does not exist.
    pub fn discover(workspace: &Path) -> Result<Self> {
        let path = workspace.join(PIPELINE_FILE);
        if path.is_file() {
            Self::load(&path)
        } else {
            Ok(Self::default_pipeline(workspace))
        }
    }

    /// Structural checks on the stage list.
    pub fn validate(&self) -> Result<()> {
        if self.branches.iter().all(|b| b.trim().is_empty()) {
            return Err(definition("at least one branch must be watched"));
        }
        if !self.stages.iter().any(|s| s.enabled) {
            return Err(definition("pipeline has no enabled stages"));
        }

        let mut names = HashSet::new();
        let mut deploys = 0;
        for stage in &self.stages {
            if !names.insert(stage.name.as_str()) {
                return Err(definition(format!("duplicate stage name {}", stage.name)));
            }
            if stage.is_deploy() {
                deploys += 1;
                if !stage.commands.is_empty() {
                    return Err(definition("the deploy stage runs the remote script and takes no commands"));
                }
                if stage.always_run {
                    return Err(definition("the deploy stage cannot be always_run"));
                }
            } else if stage.commands.is_empty() || stage.commands.iter().any(Vec::is_empty) {
                return Err(definition(format!("stage {} has an empty command", stage.name)));
            }
            if let Some(post) = &stage.post {
                for path in &post.artifacts {
                    validate_artifact_path(path)?;
                }
            }
        }
        if deploys > 1 {
            return Err(definition("at most one deploy stage is allowed"));
        }
        Ok(())
    }

    /// Deterministic digest of the ordered stage definitions.
    pub fn stages_digest(&self) -> String {
        compute_stages_digest(&self.stages)
    }

    /// Resolver with this file's deploy settings as defaults.
    pub fn configure(&self, resolver: EnvResolver) -> EnvResolver {
        self.deploy.apply(resolver)
    }

    pub fn deploy_stage(&self) -> Option<&StageConfig> {
        self.stages.iter().find(|s| s.is_deploy())
    }

    pub fn run_lock_path(&self) -> PathBuf {
        self.state_dir.join(RUN_LOCK_FILE)
    }
}

/// Compute deterministic digest of ordered stage definitions.
fn compute_stages_digest(stages: &[StageConfig]) -> String {
    let mut hasher = Sha256::new();
    for stage in stages {
        // StageConfig serialization cannot fail: no maps with non-string keys.
        let encoded = serde_json::to_vec(stage).unwrap_or_default();
        hasher.update(&encoded);
        hasher.update(b"\0");
    }
    hex::encode(hasher.finalize())
}

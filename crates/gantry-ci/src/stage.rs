//! Stage definitions and configuration.

use gantry_core::{GantryError, DEFAULT_REPORT_PATHS};
use serde::{Deserialize, Serialize};

/// What a stage does. Every kind except `Deploy` runs local commands.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// Bring the workspace to the run's revision.
    Checkout,

    /// Create the environment and install dependencies.
    Setup,

    /// Configuration check and schema migration.
    Validate,

    /// Test run with coverage; reports are published afterwards.
    Test,

    /// Gated remote deployment.
    Deploy,

    /// Any other local command.
    Command,
}

impl StageKind {
    /// Default stage name for this kind.
    pub fn name(&self) -> &'static str {
        match self {
            StageKind::Checkout => "checkout",
            StageKind::Setup => "setup",
            StageKind::Validate => "validate",
            StageKind::Test => "test",
            StageKind::Deploy => "deploy",
            StageKind::Command => "command",
        }
    }

    /// Commands run when the pipeline file names the kind without any.
    pub fn default_commands(&self) -> Vec<Vec<String>> {
        let argv = |parts: &[&str]| parts.iter().map(|p| p.to_string()).collect::<Vec<_>>();
        match self {
            StageKind::Checkout => vec![
                argv(&["git", "fetch", "--force", "origin", "${GANTRY_BRANCH}"]),
                argv(&["git", "checkout", "--force", "${GANTRY_REVISION}"]),
            ],
            StageKind::Setup => vec![
                argv(&["python3", "-m", "venv", ".venv"]),
                argv(&[".venv/bin/pip", "install", "-r", "requirements.txt"]),
            ],
            StageKind::Validate => vec![
                argv(&[".venv/bin/python", "manage.py", "check"]),
                argv(&[".venv/bin/python", "manage.py", "migrate", "--noinput"]),
            ],
            StageKind::Test => vec![argv(&[".venv/bin/coverage", "run", "manage.py", "test"])],
            StageKind::Deploy | StageKind::Command => Vec::new(),
        }
    }

    /// Post-action attached by default (Test only).
    pub fn default_post(&self) -> Option<PostAction> {
        match self {
            StageKind::Test => Some(PostAction {
                commands: vec![
                    vec![".venv/bin/coverage".to_string(), "xml".to_string()],
                    vec![
                        ".venv/bin/coverage".to_string(),
                        "html".to_string(),
                        "--ignore-errors".to_string(),
                    ],
                ],
                artifacts: DEFAULT_REPORT_PATHS.iter().map(|p| p.to_string()).collect(),
            }),
            _ => None,
        }
    }

    /// Error describing a non-zero exit of a stage of this kind.
    pub fn failure(&self, stage: &str, exit_code: i32) -> GantryError {
        match self {
            StageKind::Validate => GantryError::Validation {
                stage: stage.to_string(),
                exit_code,
            },
            StageKind::Test => GantryError::TestFailure {
                stage: stage.to_string(),
                exit_code,
            },
            _ => GantryError::PipelineDefinition(format!(
                "stage {stage} exited with code {exit_code}"
            )),
        }
    }
}

/// Hook that runs after the stage body whatever its outcome.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PostAction {
    /// Report-generating commands, run in order; a failure does not stop
    /// the remaining commands or the artifact capture.
    #[serde(default)]
    pub commands: Vec<Vec<String>>,

    /// Workspace-relative files or directories to publish.
    #[serde(default)]
    pub artifacts: Vec<String>,
}

/// Configuration for one pipeline stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageConfig {
    /// Stage name, unique within a pipeline.
    pub name: String,

    pub kind: StageKind,

    /// Commands run in order; the first non-zero exit fails the stage.
    pub commands: Vec<Vec<String>>,

    /// A failed required stage fails the run.
    pub required: bool,

    /// Runs even after an earlier required stage failed.
    pub always_run: bool,

    /// Timeout in seconds (0 = none).
    pub timeout_secs: u64,

    /// Whether this stage is enabled.
    pub enabled: bool,

    pub post: Option<PostAction>,
}

impl StageConfig {
    /// A stage of the given kind with its default commands and post-action.
    pub fn from_kind(kind: StageKind, timeout_secs: u64) -> Self {
        Self {
            name: kind.name().to_string(),
            kind,
            commands: kind.default_commands(),
            required: true,
            always_run: false,
            timeout_secs,
            enabled: true,
            post: kind.default_post(),
        }
    }

    /// Create a custom single-command stage.
    pub fn custom(name: impl Into<String>, command: Vec<String>, timeout_secs: u64) -> Self {
        Self {
            name: name.into(),
            kind: StageKind::Command,
            commands: vec![command],
            required: true,
            always_run: false,
            timeout_secs,
            enabled: true,
            post: None,
        }
    }

    /// Replace the commands.
    pub fn with_commands(mut self, commands: Vec<Vec<String>>) -> Self {
        self.commands = commands;
        self
    }

    pub fn with_post(mut self, post: PostAction) -> Self {
        self.post = Some(post);
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn always_run(mut self) -> Self {
        self.always_run = true;
        self
    }

    /// Disable this stage.
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn is_deploy(&self) -> bool {
        self.kind == StageKind::Deploy
    }
}

/// The built-in pipeline: checkout, setup, validate, test (with report
/// publishing), and the gated deploy.
pub fn default_stages() -> Vec<StageConfig> {
    vec![
        StageConfig::from_kind(StageKind::Checkout, 300),
        StageConfig::from_kind(StageKind::Setup, 900),
        StageConfig::from_kind(StageKind::Validate, 600),
        StageConfig::from_kind(StageKind::Test, 1800),
        StageConfig::from_kind(StageKind::Deploy, 900),
    ]
}

//! Artifact publishing and integrity checks.
//!
//! The publisher copies a fixed set of report files out of the workspace
//! into the content-addressed store and describes each one with an
//! `ArtifactRecord`. Blobs are only ever added, so earlier runs keep their
//! artifacts.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use gantry_state::{ArtifactRecord, CasStore, ContentDigest, PipelineRunRecord, StorageError};
use tracing::{debug, warn};

use crate::domain::{GantryError, Result};

/// Report paths published after the test stage by default.
pub const DEFAULT_REPORT_PATHS: [&str; 3] = ["coverage.xml", "htmlcov", "test-reports"];

/// Files captured by one publish, plus configured paths that did not exist.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub artifacts: Vec<ArtifactRecord>,
    pub missing: Vec<String>,
}

pub struct ArtifactPublisher {
    cas: Arc<dyn CasStore>,
    paths: Vec<String>,
}

impl ArtifactPublisher {
    /// Publisher for the given workspace-relative paths. Absolute paths and
    /// paths that climb out of the workspace are rejected.
    pub fn new(cas: Arc<dyn CasStore>, paths: Vec<String>) -> Result<Self> {
        for p in &paths {
            validate_artifact_path(p)?;
        }
        Ok(Self { cas, paths })
    }

    pub fn paths(&self) -> &[String] {
        &self.paths
    }

    /// Capture every configured path under `workspace`. Directories are
    /// walked recursively in sorted order; missing paths are reported, not
    /// treated as errors.
    pub async fn publish(&self, workspace: &Path, stage: &str) -> Result<PublishReport> {
        let mut report = PublishReport::default();
        for logical in &self.paths {
            let root = workspace.join(logical);
            if !root.exists() {
                debug!(stage, path = %logical, "artifact path not produced");
                report.missing.push(logical.clone());
                continue;
            }
            let mut files = Vec::new();
            collect_files(&root, &mut files)?;
            for file in files {
                let data = tokio::fs::read(&file).await?;
                let digest = self.cas.put(&data).await?;
                let rel = relative_name(workspace, &file);
                report.artifacts.push(ArtifactRecord {
                    stage: stage.to_string(),
                    media_type: media_type(&rel).map(str::to_string),
                    path: rel,
                    digest,
                    size_bytes: data.len() as u64,
                    captured_at: Utc::now(),
                });
            }
        }
        Ok(report)
    }
}

/// Integrity state of one stored artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactIntegrity {
    Intact,
    Corrupted { actual: ContentDigest },
    Missing,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactCheck {
    pub stage: String,
    pub path: String,
    pub expected: ContentDigest,
    pub integrity: ArtifactIntegrity,
}

impl ArtifactCheck {
    pub fn is_intact(&self) -> bool {
        self.integrity == ArtifactIntegrity::Intact
    }

    /// The failure as an error, or None when intact.
    pub fn to_error(&self) -> Option<GantryError> {
        match &self.integrity {
            ArtifactIntegrity::Intact => None,
            ArtifactIntegrity::Corrupted { actual } => Some(GantryError::DigestMismatch {
                path: self.path.clone(),
                expected: self.expected.to_string(),
                actual: actual.to_string(),
            }),
            ArtifactIntegrity::Missing => Some(GantryError::Storage(StorageError::NotFound {
                digest: self.expected.to_string(),
            })),
        }
    }
}

/// Re-hash every artifact blob of a run against its recorded digest.
pub async fn verify_artifacts(
    run: &PipelineRunRecord,
    cas: &dyn CasStore,
) -> Result<Vec<ArtifactCheck>> {
    let mut checks = Vec::with_capacity(run.artifacts.len());
    for artifact in &run.artifacts {
        let integrity = match cas.get(&artifact.digest).await {
            Ok(bytes) => {
                let actual = ContentDigest::from_bytes(&bytes);
                if actual == artifact.digest {
                    ArtifactIntegrity::Intact
                } else {
                    warn!(run_id = %run.run_id, path = %artifact.path, "artifact digest mismatch");
                    ArtifactIntegrity::Corrupted { actual }
                }
            }
            Err(StorageError::NotFound { .. }) => ArtifactIntegrity::Missing,
            Err(e) => return Err(e.into()),
        };
        checks.push(ArtifactCheck {
            stage: artifact.stage.clone(),
            path: artifact.path.clone(),
            expected: artifact.digest.clone(),
            integrity,
        });
    }
    Ok(checks)
}

/// Reject artifact paths that are absolute or leave the workspace.
pub fn validate_artifact_path(path: &str) -> Result<()> {
    let p = Path::new(path);
    let escapes = p
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if path.trim().is_empty() || p.is_absolute() || escapes {
        return Err(GantryError::Configuration(format!(
            "artifact path must be relative to the workspace: {path:?}"
        )));
    }
    Ok(())
}

fn collect_files(path: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    if path.is_file() {
        out.push(path.to_path_buf());
        return Ok(());
    }
    let mut entries = std::fs::read_dir(path)?
        .map(|e| e.map(|e| e.path()))
        .collect::<std::io::Result<Vec<_>>>()?;
    entries.sort();
    for entry in entries {
        if entry.is_dir() {
            collect_files(&entry, out)?;
        } else if entry.is_file() {
            out.push(entry);
        }
    }
    Ok(())
}

fn relative_name(workspace: &Path, file: &Path) -> String {
    let rel = file.strip_prefix(workspace).unwrap_or(file);
    rel.components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn media_type(path: &str) -> Option<&'static str> {
    let ext = Path::new(path).extension()?.to_str()?.to_ascii_lowercase();
    Some(match ext.as_str() {
        "xml" => "application/xml",
        "json" => "application/json",
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" => "text/javascript",
        "txt" | "log" => "text/plain",
        "png" => "image/png",
        "svg" => "image/svg+xml",
        _ => return None,
    })
}

//! Run report: the user-visible summary of one pipeline run.

use gantry_core::{PipelineRunRecord, RunStatus, StageOutcome};
use serde::{Deserialize, Serialize};

/// Summary of a finished (or in-progress) run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub branch: Option<String>,
    pub revision: String,
    pub status: RunStatus,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,

    /// First stage that failed, in pipeline order.
    pub first_failure: Option<String>,

    /// One line per failed stage or post-action (empty on a clean run).
    pub violations: Vec<String>,

    /// Whether a deploy stage ran to success.
    pub deployed: bool,

    pub artifacts: usize,

    /// Summary message.
    pub message: String,
}

impl RunReport {
    /// Summarise a run record.
    ///
    /// `deploy_stage` names the stage whose success means the remote host
    /// was updated.
    pub fn from_record(record: &PipelineRunRecord, deploy_stage: Option<&str>) -> Self {
        let mut violations = Vec::new();
        let count = |outcome: StageOutcome| {
            record
                .stages
                .iter()
                .filter(|s| s.outcome == outcome)
                .count()
        };

        for stage in &record.stages {
            if stage.outcome == StageOutcome::Failed {
                let detail = stage
                    .reason
                    .clone()
                    .or_else(|| stage.exit_code.map(|c| format!("exit code {c}")))
                    .unwrap_or_else(|| "failed".to_string());
                violations.push(format!("stage '{}' failed: {}", stage.name, detail));
            }
            if let Some(post) = &stage.post_action {
                if post.outcome == StageOutcome::Failed {
                    violations.push(format!(
                        "post-action of '{}' failed: {}",
                        stage.name,
                        post.error.as_deref().unwrap_or("unknown error")
                    ));
                }
            }
        }

        let deployed = deploy_stage
            .and_then(|name| record.stage(name))
            .is_some_and(|s| s.outcome == StageOutcome::Success);

        let message = match record.status {
            RunStatus::Success if deployed => "All stages passed; deployed".to_string(),
            RunStatus::Success => "All stages passed".to_string(),
            RunStatus::Pending | RunStatus::Running => format!("Run is {}", record.status),
            status => format!("Run {} with {} violation(s)", status, violations.len()),
        };

        Self {
            run_id: record.run_id.0.clone(),
            branch: record.metadata.branch.clone(),
            revision: record.metadata.revision.clone(),
            status: record.status,
            passed: count(StageOutcome::Success),
            failed: count(StageOutcome::Failed),
            skipped: count(StageOutcome::Skipped),
            first_failure: record
                .stages
                .iter()
                .find(|s| s.outcome == StageOutcome::Failed)
                .map(|s| s.name.clone()),
            violations,
            deployed,
            artifacts: record.artifacts.len(),
            message,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == RunStatus::Success
    }
}

impl std::fmt::Display for RunReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "run {} ({} @ {}): {}",
            self.run_id,
            self.branch.as_deref().unwrap_or("-"),
            self.revision,
            self.status
        )?;
        writeln!(
            f,
            "  {} passed, {} failed, {} skipped, {} artifact(s)",
            self.passed, self.failed, self.skipped, self.artifacts
        )?;
        for violation in &self.violations {
            writeln!(f, "  - {violation}")?;
        }
        write!(f, "  {}", self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::{RunId, StageRecord, TriggerEvent};
    use gantry_state::PostActionRecord;

    fn record(status: RunStatus, stages: Vec<StageRecord>) -> PipelineRunRecord {
        let mut r = PipelineRunRecord::pending(
            RunId("r1".to_string()),
            TriggerEvent::poll("main", "abc").run_metadata(None),
        );
        r.status = status;
        r.stages = stages;
        r
    }

    fn stage(name: &str, outcome: StageOutcome, exit_code: Option<i32>) -> StageRecord {
        StageRecord {
            outcome,
            exit_code,
            reason: None,
            ..StageRecord::skipped(name, "")
        }
    }

    #[test]
    fn test_clean_run_with_deploy() {
        let r = record(
            RunStatus::Success,
            vec![
                stage("test", StageOutcome::Success, Some(0)),
                stage("deploy", StageOutcome::Success, Some(0)),
            ],
        );
        let report = RunReport::from_record(&r, Some("deploy"));
        assert!(report.succeeded());
        assert!(report.deployed);
        assert_eq!(report.passed, 2);
        assert!(report.violations.is_empty());
        assert_eq!(report.message, "All stages passed; deployed");
    }

    #[test]
    fn test_failed_run_lists_violations() {
        let mut test = stage("test", StageOutcome::Failed, Some(1));
        test.post_action = Some(PostActionRecord {
            name: "publish-artifacts".to_string(),
            outcome: StageOutcome::Failed,
            duration_ms: 3,
            error: Some("coverage xml: exit code 1".to_string()),
        });
        let r = record(
            RunStatus::Failed,
            vec![
                stage("validate", StageOutcome::Success, Some(0)),
                test,
                StageRecord::skipped("deploy", "an earlier required stage failed"),
            ],
        );
        let report = RunReport::from_record(&r, Some("deploy"));
        assert!(!report.succeeded());
        assert!(!report.deployed);
        assert_eq!(report.first_failure.as_deref(), Some("test"));
        assert_eq!(report.skipped, 1);
        assert_eq!(report.violations.len(), 2);
        assert!(report.violations[0].contains("exit code 1"));
        assert!(report.to_string().contains("run r1 (main @ abc): failed"));
    }

    #[test]
    fn test_skipped_deploy_is_not_deployed() {
        let r = record(
            RunStatus::Success,
            vec![StageRecord::skipped("deploy", "branch feature/x is not main")],
        );
        let report = RunReport::from_record(&r, Some("deploy"));
        assert!(report.succeeded());
        assert!(!report.deployed);
        assert_eq!(report.message, "All stages passed");
    }
}

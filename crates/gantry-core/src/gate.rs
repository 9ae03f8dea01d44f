//! Deploy gate: decides whether the Deploy stage executes at all.
//!
//! The decision is a pure function of the run's branch and the resolved
//! operator account. It is recomputed for every run and never stored.

use serde::Serialize;

use crate::config::{ConfigKey, EnvResolver};

/// The only branch that may deploy.
pub const DEPLOY_BRANCH: &str = "main";

/// Why the gate opened or stayed closed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum GateReason {
    Allowed,
    BranchUnknown,
    BranchNotEligible { branch: String },
    OperatorAccountAbsent,
}

impl std::fmt::Display for GateReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GateReason::Allowed => write!(f, "deploy allowed"),
            GateReason::BranchUnknown => write!(f, "branch unknown"),
            GateReason::BranchNotEligible { branch } => {
                write!(f, "branch {branch} is not {DEPLOY_BRANCH}")
            }
            GateReason::OperatorAccountAbsent => {
                write!(f, "{} is not set", ConfigKey::DeployUser)
            }
        }
    }
}

/// Outcome of one gate evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GateDecision {
    pub allowed: bool,
    #[serde(flatten)]
    pub reason: GateReason,
}

/// Evaluate the gate with its reason. Branch refs of the form
/// `refs/heads/<name>` are compared by their short name.
pub fn evaluate_gate(branch: Option<&str>, config: &EnvResolver) -> GateDecision {
    let reason = match branch.map(short_branch_name).filter(|b| !b.is_empty()) {
        None => GateReason::BranchUnknown,
        Some(b) if b != DEPLOY_BRANCH => GateReason::BranchNotEligible {
            branch: b.to_string(),
        },
        Some(_) if !config.resolve(ConfigKey::DeployUser).is_present() => {
            GateReason::OperatorAccountAbsent
        }
        Some(_) => GateReason::Allowed,
    };
    GateDecision {
        allowed: reason == GateReason::Allowed,
        reason,
    }
}

/// True iff the branch is `main` and the operator account resolves to a
/// non-blank value.
pub fn allow_deploy(branch: Option<&str>, config: &EnvResolver) -> bool {
    evaluate_gate(branch, config).allowed
}

fn short_branch_name(branch: &str) -> &str {
    branch.strip_prefix("refs/heads/").unwrap_or(branch)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_user(user: &str) -> EnvResolver {
        EnvResolver::new().with_override(ConfigKey::DeployUser, user)
    }

    #[test]
    fn main_with_operator_is_allowed() {
        let d = evaluate_gate(Some("main"), &with_user("alice"));
        assert!(d.allowed);
        assert_eq!(d.reason, GateReason::Allowed);
    }

    #[test]
    fn other_branches_never_deploy() {
        for branch in ["feature/x", "Main", "main2", "develop", "refs/heads/release"] {
            let d = evaluate_gate(Some(branch), &with_user("alice"));
            assert!(!d.allowed, "{branch} should not deploy");
            assert!(matches!(d.reason, GateReason::BranchNotEligible { .. }));
        }
    }

    #[test]
    fn blank_operator_closes_gate() {
        for user in ["", " ", "\t\n"] {
            let d = evaluate_gate(Some("main"), &with_user(user));
            assert!(!d.allowed);
            assert_eq!(d.reason, GateReason::OperatorAccountAbsent);
        }
        assert!(!allow_deploy(Some("main"), &EnvResolver::new()));
    }

    #[test]
    fn unknown_branch_closes_gate() {
        assert_eq!(
            evaluate_gate(None, &with_user("alice")).reason,
            GateReason::BranchUnknown
        );
        assert!(!allow_deploy(Some("  "), &with_user("alice")));
    }

    #[test]
    fn full_ref_is_accepted() {
        assert!(allow_deploy(Some("refs/heads/main"), &with_user("alice")));
    }

    #[test]
    fn branch_name_must_match_exactly() {
        for branch in [" main ", "main\n", "refs/heads/ main"] {
            let d = evaluate_gate(Some(branch), &with_user("alice"));
            assert!(!d.allowed, "{branch:?} should not deploy");
            assert!(matches!(d.reason, GateReason::BranchNotEligible { .. }));
        }
    }

    #[test]
    fn decision_serializes_with_reason_tag() {
        let d = evaluate_gate(Some("feature/x"), &with_user("alice"));
        let json = serde_json::to_value(&d).unwrap();
        assert_eq!(json["allowed"], false);
        assert_eq!(json["reason"], "branch_not_eligible");
        assert_eq!(json["branch"], "feature/x");
    }
}

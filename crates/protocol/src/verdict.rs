use crate::outcome::{store_name, BuildOutcome, BuildStatus};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Exit codes understood by `git bisect run`.
pub const EXIT_GOOD: i32 = 0;
pub const EXIT_BAD: i32 = 1;
pub const EXIT_SKIP: i32 = 125;
pub const EXIT_ABORT: i32 = 128;

/// The four-way classification of one build attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    Good,
    Bad,
    /// Inconclusive. A named `range` groups the skip with every other skip of
    /// the same name into one skip range.
    Skip {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        range: Option<String>,
        reason: String,
    },
    Abort {
        reason: String,
    },
}

impl Verdict {
    pub fn skip(reason: impl Into<String>) -> Self {
        Self::Skip {
            range: None,
            reason: reason.into(),
        }
    }

    pub fn skip_range(range: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Skip {
            range: Some(range.into()),
            reason: reason.into(),
        }
    }

    pub fn abort(reason: impl Into<String>) -> Self {
        Self::Abort {
            reason: reason.into(),
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Good => EXIT_GOOD,
            Self::Bad => EXIT_BAD,
            Self::Skip { .. } => EXIT_SKIP,
            Self::Abort { .. } => EXIT_ABORT,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Good => "good",
            Self::Bad => "bad",
            Self::Skip { .. } => "skip",
            Self::Abort { .. } => "abort",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Good | Self::Bad => f.write_str(self.label()),
            Self::Skip {
                range: Some(range),
                reason,
            } => write!(f, "skip [{range}]: {reason}"),
            Self::Skip { range: None, reason } => write!(f, "skip: {reason}"),
            Self::Abort { reason } => write!(f, "abort: {reason}"),
        }
    }
}

/// What to do with a given build status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    Good,
    Bad,
    Skip,
    SkipRange,
    Abort,
}

impl FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "good" => Ok(Self::Good),
            "bad" => Ok(Self::Bad),
            "skip" => Ok(Self::Skip),
            "skip-range" => Ok(Self::SkipRange),
            "abort" => Ok(Self::Abort),
            other => Err(format!(
                "unknown action '{other}' (expected good, bad, skip, skip-range or abort)"
            )),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Good => "good",
            Self::Bad => "bad",
            Self::Skip => "skip",
            Self::SkipRange => "skip-range",
            Self::Abort => "abort",
        })
    }
}

/// Maps each build status to a bisection action.
///
/// Interrupts and build tool failures are not configurable: they always abort
/// so that an uninformative attempt never moves the search range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActionPolicy {
    pub on_success: Action,
    pub on_failure: Action,
    pub on_failure_without_line: Action,
    pub on_dependency_failure: Action,
    pub on_instantiation_failure: Action,
    pub on_resource_limit: Action,
}

impl Default for ActionPolicy {
    fn default() -> Self {
        Self {
            on_success: Action::Good,
            on_failure: Action::Bad,
            on_failure_without_line: Action::SkipRange,
            on_dependency_failure: Action::SkipRange,
            on_instantiation_failure: Action::SkipRange,
            on_resource_limit: Action::Abort,
        }
    }
}

impl ActionPolicy {
    pub fn action_for(&self, status: BuildStatus) -> Action {
        match status {
            BuildStatus::Success => self.on_success,
            BuildStatus::Failure => self.on_failure,
            BuildStatus::FailureWithoutLine => self.on_failure_without_line,
            BuildStatus::DependencyFailure => self.on_dependency_failure,
            BuildStatus::InstantiationFailure => self.on_instantiation_failure,
            BuildStatus::ResourceLimit => self.on_resource_limit,
            BuildStatus::Interrupted => Action::Abort,
        }
    }

    pub fn verdict(&self, outcome: &BuildOutcome) -> Verdict {
        let status = outcome.status();
        let reason = outcome.describe();
        match self.action_for(status) {
            Action::Good => Verdict::Good,
            Action::Bad => Verdict::Bad,
            Action::Skip => Verdict::skip(reason),
            Action::SkipRange => Verdict::skip_range(skip_range_name(outcome), reason),
            Action::Abort => Verdict::abort(reason),
        }
    }
}

/// Name of the skip range an outcome belongs to. Dependency failures are
/// grouped per failing dependency so that one unbreak commit can resolve them.
fn skip_range_name(outcome: &BuildOutcome) -> String {
    match outcome {
        BuildOutcome::DependencyFailure { dependency, .. } => {
            format!("dependency:{}", store_name(dependency))
        }
        other => other.status().as_str().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::{AbortReason, LineCheck};
    use pretty_assertions::assert_eq;

    #[test]
    fn default_policy_never_turns_ambiguity_into_bad() {
        let policy = ActionPolicy::default();
        let dependency = BuildOutcome::DependencyFailure {
            dependency: "/nix/store/0c9mdhggxqrh4mgjkfw9ly52rl7kcv0w-zlib-1.3.drv".into(),
            log: None,
        };
        let missing_line = BuildOutcome::TargetFailure {
            drv: "t.drv".into(),
            log: None,
            line: LineCheck::Missing,
        };
        let instantiation = BuildOutcome::InstantiationFailure {
            reason: "undefined variable".into(),
        };

        assert_eq!(
            policy.verdict(&dependency),
            Verdict::skip_range("dependency:zlib-1.3", dependency.describe())
        );
        assert!(matches!(
            policy.verdict(&missing_line),
            Verdict::Skip { range: Some(ref r), .. } if r == "failure-without-line"
        ));
        assert!(matches!(
            policy.verdict(&instantiation),
            Verdict::Skip { range: Some(ref r), .. } if r == "instantiation-failure"
        ));
    }

    #[test]
    fn interrupts_abort_even_when_resource_limits_are_remapped() {
        let policy = ActionPolicy {
            on_resource_limit: Action::Skip,
            ..ActionPolicy::default()
        };
        let budget = BuildOutcome::Aborted {
            reason: AbortReason::BudgetExceeded {
                needed: 10,
                allowed: 1,
            },
        };
        let interrupted = BuildOutcome::Aborted {
            reason: AbortReason::Interrupted,
        };
        assert!(matches!(policy.verdict(&budget), Verdict::Skip { range: None, .. }));
        assert!(matches!(policy.verdict(&interrupted), Verdict::Abort { .. }));
    }

    #[test]
    fn exit_codes_follow_git_bisect_run() {
        assert_eq!(Verdict::Good.exit_code(), 0);
        assert_eq!(Verdict::Bad.exit_code(), 1);
        assert_eq!(Verdict::skip("x").exit_code(), 125);
        assert_eq!(Verdict::abort("x").exit_code(), 128);
    }

    #[test]
    fn actions_parse_from_cli_spelling() {
        assert_eq!("skip-range".parse::<Action>(), Ok(Action::SkipRange));
        assert!("maybe".parse::<Action>().is_err());
    }
}

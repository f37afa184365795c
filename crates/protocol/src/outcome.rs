use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Whether a target failure carried the operator-supplied failure line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineCheck {
    /// No failure line was requested; any target failure counts.
    NotRequired,
    Matched,
    /// The target failed but the log lacks the line. Ambiguous.
    Missing,
}

impl LineCheck {
    /// Judge a failed build's `log` against the requested failure line.
    pub fn against(log: &str, failure_line: Option<&str>) -> Self {
        match failure_line {
            None => Self::NotRequired,
            Some(needle) if log.contains(needle) => Self::Matched,
            Some(_) => Self::Missing,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AbortReason {
    BudgetExceeded { needed: usize, allowed: usize },
    Blacklisted { drv: String },
    Interrupted,
    ToolFailure { message: String },
}

impl AbortReason {
    /// Resource-limit aborts may be remapped by an action policy; interrupts
    /// and tool failures always abort.
    pub fn is_resource_limit(&self) -> bool {
        matches!(self, Self::BudgetExceeded { .. } | Self::Blacklisted { .. })
    }
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BudgetExceeded { needed, allowed } => write!(
                f,
                "rebuild budget exceeded ({needed} derivations to build, {allowed} allowed)"
            ),
            Self::Blacklisted { drv } => write!(f, "rebuild blacklist matched {drv}"),
            Self::Interrupted => f.write_str("interrupted"),
            Self::ToolFailure { message } => write!(f, "build tool failure: {message}"),
        }
    }
}

/// Result of one build attempt of a target at one revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BuildOutcome {
    Success {
        drv: String,
        outputs: Vec<String>,
    },
    TargetFailure {
        drv: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        log: Option<PathBuf>,
        line: LineCheck,
    },
    DependencyFailure {
        dependency: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        log: Option<PathBuf>,
    },
    InstantiationFailure {
        reason: String,
    },
    Aborted {
        reason: AbortReason,
    },
}

/// Flat status names, one per policy slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BuildStatus {
    Success,
    Failure,
    FailureWithoutLine,
    DependencyFailure,
    InstantiationFailure,
    ResourceLimit,
    Interrupted,
}

impl BuildStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::FailureWithoutLine => "failure-without-line",
            Self::DependencyFailure => "dependency-failure",
            Self::InstantiationFailure => "instantiation-failure",
            Self::ResourceLimit => "resource-limit",
            Self::Interrupted => "interrupted",
        }
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl BuildOutcome {
    pub fn status(&self) -> BuildStatus {
        match self {
            Self::Success { .. } => BuildStatus::Success,
            Self::TargetFailure {
                line: LineCheck::Missing,
                ..
            } => BuildStatus::FailureWithoutLine,
            Self::TargetFailure { .. } => BuildStatus::Failure,
            Self::DependencyFailure { .. } => BuildStatus::DependencyFailure,
            Self::InstantiationFailure { .. } => BuildStatus::InstantiationFailure,
            Self::Aborted { reason } if reason.is_resource_limit() => BuildStatus::ResourceLimit,
            Self::Aborted { .. } => BuildStatus::Interrupted,
        }
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted { .. })
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Self::TargetFailure { .. }
                | Self::DependencyFailure { .. }
                | Self::InstantiationFailure { .. }
        )
    }

    pub fn log_path(&self) -> Option<&PathBuf> {
        match self {
            Self::TargetFailure { log, .. } | Self::DependencyFailure { log, .. } => log.as_ref(),
            _ => None,
        }
    }

    pub fn with_log_path(mut self, path: PathBuf) -> Self {
        match &mut self {
            Self::TargetFailure { log, .. } | Self::DependencyFailure { log, .. } => {
                *log = Some(path);
            }
            _ => {}
        }
        self
    }

    /// One-line human description.
    pub fn describe(&self) -> String {
        match self {
            Self::Success { outputs, .. } => match outputs.first() {
                Some(first) => format!("build succeeded ({first})"),
                None => "build succeeded".to_string(),
            },
            Self::TargetFailure { drv, line, .. } => match line {
                LineCheck::Missing => format!("{drv} failed without the failure line"),
                _ => format!("{drv} failed"),
            },
            Self::DependencyFailure { dependency, .. } => {
                format!("dependency {dependency} failed to build")
            }
            Self::InstantiationFailure { reason } => format!("instantiation failed: {reason}"),
            Self::Aborted { reason } => format!("aborted: {reason}"),
        }
    }
}

/// Strip the store directory and hash from a store path, and the `.drv`
/// suffix from derivations: `/nix/store/<hash>-openssl-3.0.drv` becomes
/// `openssl-3.0`.
pub fn store_name(path: &str) -> &str {
    let base = path.rsplit('/').next().unwrap_or(path);
    let base = base.strip_suffix(".drv").unwrap_or(base);
    match base.split_once('-') {
        Some((hash, rest)) if hash.len() == 32 && !rest.is_empty() => rest,
        _ => base,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_check_reads_the_log() {
        let log = "make: *** [all] Error 2\nld: undefined reference to foo";
        assert_eq!(LineCheck::against(log, None), LineCheck::NotRequired);
        assert_eq!(
            LineCheck::against(log, Some("undefined reference")),
            LineCheck::Matched
        );
        assert_eq!(LineCheck::against(log, Some("segfault")), LineCheck::Missing);
    }

    #[test]
    fn store_name_strips_hash_and_suffix() {
        assert_eq!(
            store_name("/nix/store/0c9mdhggxqrh4mgjkfw9ly52rl7kcv0w-openssl-3.0.13.drv"),
            "openssl-3.0.13"
        );
        assert_eq!(store_name("not-a-store-path"), "not-a-store-path");
    }

    #[test]
    fn status_distinguishes_ambiguous_failures() {
        let missing = BuildOutcome::TargetFailure {
            drv: "x.drv".into(),
            log: None,
            line: LineCheck::Missing,
        };
        let matched = BuildOutcome::TargetFailure {
            drv: "x.drv".into(),
            log: None,
            line: LineCheck::Matched,
        };
        assert_eq!(missing.status(), BuildStatus::FailureWithoutLine);
        assert_eq!(matched.status(), BuildStatus::Failure);
    }

    #[test]
    fn aborts_split_into_resource_limits_and_interrupts() {
        let budget = BuildOutcome::Aborted {
            reason: AbortReason::BudgetExceeded {
                needed: 12,
                allowed: 3,
            },
        };
        let interrupted = BuildOutcome::Aborted {
            reason: AbortReason::Interrupted,
        };
        assert_eq!(budget.status(), BuildStatus::ResourceLimit);
        assert_eq!(interrupted.status(), BuildStatus::Interrupted);
        assert!(budget.describe().contains("rebuild budget exceeded"));
    }

    #[test]
    fn outcome_json_is_tagged() {
        let outcome = BuildOutcome::DependencyFailure {
            dependency: "/nix/store/x-dep.drv".into(),
            log: None,
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["kind"], "dependency_failure");
        let back: BuildOutcome = serde_json::from_value(json).unwrap();
        assert_eq!(back, outcome);
    }
}

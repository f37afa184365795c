use crate::cache::{BuildCache, BuildIdentity, BuildMode, CacheEntry, Evidence};
use crate::gcroot::gcroot_name;
use crate::tool::{BuildOptions, BuildTool};
use crate::{NixError, Result};
use nix_bisect_protocol::{AbortReason, BuildOutcome, BuildTarget, CancelToken, LineCheck, Revision};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// What to build and how to judge the result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifyRequest {
    pub target: BuildTarget,
    /// A target failure only counts as bad when its log contains this line.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_line: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_rebuilds: Option<usize>,
    /// Regexes over derivation paths that must never be rebuilt.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rebuild_blacklist: Vec<String>,
    #[serde(default)]
    pub mode: BuildMode,
}

impl ClassifyRequest {
    pub fn new(target: BuildTarget) -> Self {
        Self {
            target,
            failure_line: None,
            max_rebuilds: None,
            rebuild_blacklist: Vec::new(),
            mode: BuildMode::Normal,
        }
    }

    pub fn blacklist(&self) -> Result<Vec<Regex>> {
        self.rebuild_blacklist
            .iter()
            .map(|pattern| Regex::new(pattern).map_err(NixError::from))
            .collect()
    }
}

/// The checked-out tree being classified.
#[derive(Debug, Clone)]
pub struct BuildSubject {
    pub revision: Revision,
    /// Patches actually applied on top of `revision`.
    pub patches: Vec<Revision>,
    /// False when the tree carries local modifications; such builds are not
    /// attributable to a revision and bypass the cache.
    pub cacheable: bool,
}

impl BuildSubject {
    pub fn new(revision: Revision, patches: Vec<Revision>) -> Self {
        Self {
            revision,
            patches,
            cacheable: true,
        }
    }

    pub fn uncached(mut self) -> Self {
        self.cacheable = false;
        self
    }
}

#[derive(Debug, Clone)]
pub struct Classification {
    pub outcome: BuildOutcome,
    /// Served from the cache without building.
    pub cached: bool,
    pub identity: BuildIdentity,
}

/// Outcome of the build pipeline before it is cached.
struct Attempt {
    outcome: BuildOutcome,
    log: Option<String>,
    evidence: Evidence,
}

impl Attempt {
    fn new(outcome: BuildOutcome, log: Option<String>, evidence: Evidence) -> Self {
        Self {
            outcome,
            log,
            evidence,
        }
    }

    fn aborted(reason: AbortReason) -> Self {
        Self::new(BuildOutcome::Aborted { reason }, None, Evidence::Build)
    }
}

/// Builds one target at one revision and classifies the result.
pub struct Classifier {
    tool: Arc<dyn BuildTool>,
    cache: Option<BuildCache>,
}

impl Classifier {
    pub fn new(tool: Arc<dyn BuildTool>) -> Self {
        Self { tool, cache: None }
    }

    pub fn with_cache(mut self, cache: BuildCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn cache(&self) -> Option<&BuildCache> {
        self.cache.as_ref()
    }

    /// Classify `subject` against `request`.
    ///
    /// Only launch failures of the build tool are returned as errors. Every
    /// other problem is folded into the outcome; interrupts become
    /// [`AbortReason::Interrupted`] and are never cached.
    pub async fn classify(
        &self,
        subject: &BuildSubject,
        request: &ClassifyRequest,
        cancel: &CancelToken,
    ) -> Result<Classification> {
        let identity = BuildIdentity::compute(
            &subject.revision,
            &subject.patches,
            &request.target,
            request.mode,
        );
        let cache = self.cache.as_ref().filter(|_| subject.cacheable);

        if let Some(cache) = cache {
            match request.mode {
                BuildMode::Normal => {
                    match cache
                        .lookup(
                            &identity,
                            request.failure_line.as_deref(),
                            self.tool.as_ref(),
                            cancel,
                        )
                        .await
                    {
                        Ok(Some(entry)) => {
                            log::info!(
                                "{}: cached {}",
                                subject.revision.short(),
                                entry.outcome.describe()
                            );
                            return Ok(Classification {
                                outcome: entry.outcome,
                                cached: true,
                                identity,
                            });
                        }
                        Ok(None) => {}
                        Err(err) if err.is_fatal() => return Err(err),
                        Err(err) => log::warn!("cache lookup failed, rebuilding: {err}"),
                    }
                }
                BuildMode::Recheck => {
                    if let Err(err) = cache.invalidate(&identity).await {
                        log::warn!("could not invalidate cache entry {identity}: {err}");
                    }
                }
            }
        }

        let attempt = match self.attempt(request, cancel).await {
            Ok(attempt) => attempt,
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) if err.is_cancelled() || cancel.is_cancelled() => {
                Attempt::aborted(AbortReason::Interrupted)
            }
            Err(err) => Attempt::aborted(AbortReason::ToolFailure {
                message: err.to_string(),
            }),
        };
        log::info!(
            "{}: {}",
            subject.revision.short(),
            attempt.outcome.describe()
        );

        let mut outcome = attempt.outcome;
        if let Some(cache) = cache {
            if !outcome.is_aborted() {
                let mut identities = vec![identity.clone()];
                if request.mode == BuildMode::Recheck {
                    // A recheck supersedes what a normal build recorded.
                    identities.push(BuildIdentity::compute(
                        &subject.revision,
                        &subject.patches,
                        &request.target,
                        BuildMode::Normal,
                    ));
                }
                for id in identities {
                    let entry = CacheEntry::new(
                        id,
                        subject.revision.clone(),
                        subject.patches.clone(),
                        outcome.clone(),
                        request.failure_line.clone(),
                        attempt.evidence,
                    );
                    match cache.store(entry, attempt.log.as_deref()).await {
                        Ok(stored) if stored.identity == identity => outcome = stored.outcome,
                        Ok(_) => {}
                        Err(err) => log::warn!("could not cache outcome: {err}"),
                    }
                }
            }
        }

        Ok(Classification {
            outcome,
            cached: false,
            identity,
        })
    }

    async fn attempt(&self, request: &ClassifyRequest, cancel: &CancelToken) -> Result<Attempt> {
        let drv = match self.tool.instantiate(&request.target, cancel).await {
            Ok(drv) => drv,
            Err(NixError::Instantiation { reason }) => {
                return Ok(Attempt::new(
                    BuildOutcome::InstantiationFailure { reason },
                    None,
                    Evidence::Build,
                ));
            }
            Err(err) => return Err(err),
        };
        log::debug!("instantiated {drv}");
        let _root = self.tool.add_root(&gcroot_name(&drv), &drv);

        let plan = self.tool.dry_run(std::slice::from_ref(&drv), cancel).await?;
        let blacklist = request.blacklist()?;
        if let Some(hit) = plan
            .to_build
            .iter()
            .find(|path| blacklist.iter().any(|re| re.is_match(path)))
        {
            return Ok(Attempt::aborted(AbortReason::Blacklisted { drv: hit.clone() }));
        }
        if let Some(allowed) = request.max_rebuilds {
            if plan.to_build.len() > allowed {
                return Ok(Attempt::aborted(AbortReason::BudgetExceeded {
                    needed: plan.to_build.len(),
                    allowed,
                }));
            }
        }

        let base = BuildOptions {
            options: request.target.options.clone(),
            ..BuildOptions::default()
        };

        if plan.to_build.is_empty() && request.mode == BuildMode::Normal {
            let report = self.tool.build(std::slice::from_ref(&drv), &base, cancel).await?;
            if report.success {
                return Ok(Attempt::new(
                    BuildOutcome::Success {
                        drv,
                        outputs: report.outputs,
                    },
                    None,
                    Evidence::Store,
                ));
            }
            log::debug!("realising valid outputs of {drv} failed, building");
        }

        let deps: Vec<String> = self
            .tool
            .references(&drv, cancel)
            .await?
            .into_iter()
            .filter(|dep| dep != &drv)
            .collect();
        if !deps.is_empty() {
            let keep_going = BuildOptions {
                keep_going: true,
                ..base.clone()
            };
            let report = self.tool.build(&deps, &keep_going, cancel).await?;
            if !report.success {
                let dependency = report
                    .failed
                    .iter()
                    .find(|failed| deps.contains(failed))
                    .or_else(|| report.failed.first())
                    .or_else(|| deps.first())
                    .cloned()
                    .unwrap_or_default();
                return Ok(Attempt::new(
                    BuildOutcome::DependencyFailure {
                        dependency,
                        log: None,
                    },
                    Some(report.log),
                    Evidence::Build,
                ));
            }
        }

        let target_options = BuildOptions {
            check: request.mode == BuildMode::Recheck && !plan.to_build.contains(&drv),
            ..base
        };
        let report = self
            .tool
            .build(std::slice::from_ref(&drv), &target_options, cancel)
            .await?;
        if report.success {
            return Ok(Attempt::new(
                BuildOutcome::Success {
                    drv,
                    outputs: report.outputs,
                },
                None,
                Evidence::Build,
            ));
        }

        let log = match self.tool.read_log(&drv, cancel).await {
            Ok(Some(stored)) => stored,
            Ok(None) => report.log,
            Err(err) if err.is_cancelled() => return Err(err),
            Err(err) => {
                log::debug!("could not read stored log for {drv}: {err}");
                report.log
            }
        };
        let line = LineCheck::against(&log, request.failure_line.as_deref());
        Ok(Attempt::new(
            BuildOutcome::TargetFailure {
                drv,
                log: None,
                line,
            },
            Some(log),
            Evidence::Build,
        ))
    }
}

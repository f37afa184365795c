use crate::judge::{Judge, Judgement};
use crate::state::{BisectState, Conclusion, Step};
use crate::store::StateStore;
use crate::Result;
use nix_bisect_git::{ApplyResult, Patch, PatchError, PatchsetManager};
use nix_bisect_protocol::{CancelToken, Revision, Verdict};
use std::sync::Arc;

/// How a [`BisectRunner::run`] ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEnd {
    Concluded(Conclusion),
    /// Stopped without a conclusion; `run` again to continue.
    Aborted { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub end: RunEnd,
    /// Candidates judged during this run.
    pub tested: usize,
}

/// Observer for the runner's progress, used for verdict banners.
pub trait Progress: Send + Sync {
    fn tested(&self, revision: &Revision, judgement: &Judgement);

    fn unbreak(&self, range: &str, unbreak: &Revision, applied: bool);
}

impl Progress for () {
    fn tested(&self, _revision: &Revision, _judgement: &Judgement) {}

    fn unbreak(&self, _range: &str, _unbreak: &Revision, _applied: bool) {}
}

/// Drives a [`BisectState`] to a conclusion: every candidate is judged
/// inside [`PatchsetManager::with_patches`] and the state is saved after
/// each transition.
pub struct BisectRunner {
    manager: PatchsetManager,
    judge: Arc<dyn Judge>,
    store: StateStore,
    progress: Arc<dyn Progress>,
}

impl BisectRunner {
    pub fn new(manager: PatchsetManager, judge: Arc<dyn Judge>, store: StateStore) -> Self {
        Self {
            manager,
            judge,
            store,
            progress: Arc::new(()),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn Progress>) -> Self {
        self.progress = progress;
        self
    }

    /// Judge `revision` with the persisted patch set applied.
    pub async fn test(&self, revision: &Revision, cancel: &CancelToken) -> Result<Judgement> {
        let patches = self.store.patches().load().await?;
        let judge = self.judge.clone();
        let candidate = revision.clone();
        let token = cancel.clone();
        let judged = self
            .manager
            .with_patches(revision, &patches, move |applied| async move {
                judge.judge(&candidate, &applied, &token).await
            })
            .await;
        match judged {
            Ok(judgement) => judgement,
            Err(PatchError::MandatoryPatch { rev, reason }) => Ok(Judgement::verdict(
                Verdict::skip(format!("mandatory patch {} did not apply: {reason}", rev.short())),
            )),
            Err(err) => Err(err.into()),
        }
    }

    /// Probe whether `unbreak` applies onto `onto` on top of the current picks.
    async fn probe_unbreak(&self, range: &str, onto: &Revision, unbreak: &Revision) -> Result<bool> {
        let mut patches = self.store.patches().load().await?;
        let patch = Patch::unbreak(unbreak.clone(), range);
        patches.push(patch.clone());
        let target = unbreak.clone();
        let applied = self
            .manager
            .with_patches(onto, &patches, move |applied| async move {
                applied.result_for(&target) == Some(&ApplyResult::Applied)
            })
            .await?;
        if applied {
            self.store.patches().add(patch).await?;
        }
        Ok(applied)
    }

    pub async fn run(&self, state: &mut BisectState, cancel: &CancelToken) -> Result<RunSummary> {
        state.resume();
        self.store.save(state).await?;
        let mut tested = 0;
        loop {
            if cancel.is_cancelled() {
                state.abort("interrupted");
                self.store.save(state).await?;
            }
            match state.next_step() {
                Step::Test(revision) => {
                    log::info!(
                        "testing {} ({} candidates left)",
                        revision.short(),
                        state.candidates().len()
                    );
                    let judgement = self.test(&revision, cancel).await?;
                    tested += 1;
                    self.progress.tested(&revision, &judgement);
                    state.record(&revision, &judgement.verdict)?;
                    self.store.save(state).await?;
                }
                Step::ProposePatch {
                    range,
                    onto,
                    unbreak,
                } => {
                    log::info!(
                        "every candidate skips with [{range}]; trying {} as unbreak commit",
                        unbreak.short()
                    );
                    let applied = self.probe_unbreak(&range, &onto, &unbreak).await?;
                    self.progress.unbreak(&range, &unbreak, applied);
                    state.unbreak_outcome(applied)?;
                    self.store.save(state).await?;
                }
                Step::Done(conclusion) => {
                    return Ok(RunSummary {
                        end: RunEnd::Concluded(conclusion),
                        tested,
                    });
                }
                Step::Halted { reason } => {
                    log::warn!("bisection stopped: {reason}");
                    return Ok(RunSummary {
                        end: RunEnd::Aborted { reason },
                        tested,
                    });
                }
            }
        }
    }
}

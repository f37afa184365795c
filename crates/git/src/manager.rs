use crate::patch::Patch;
use crate::vcs::{ApplyResult, Vcs};
use crate::PatchError;
use nix_bisect_protocol::Revision;
use std::future::Future;
use std::sync::Arc;

/// What happened to each patch on top of one candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedPatches {
    pub revision: Revision,
    pub results: Vec<(Patch, ApplyResult)>,
}

impl AppliedPatches {
    /// Patches that changed the tree, in application order.
    pub fn applied(&self) -> Vec<Revision> {
        self.results
            .iter()
            .filter(|(_, result)| *result == ApplyResult::Applied)
            .map(|(patch, _)| patch.rev.clone())
            .collect()
    }

    pub fn result_for(&self, rev: &Revision) -> Option<&ApplyResult> {
        self.results
            .iter()
            .find(|(patch, _)| &patch.rev == rev)
            .map(|(_, result)| result)
    }

    pub fn failed(&self) -> impl Iterator<Item = &Patch> {
        self.results
            .iter()
            .filter(|(_, result)| result.is_failed())
            .map(|(patch, _)| patch)
    }
}

/// Scoped access to the working tree.
///
/// [`with_patches`](Self::with_patches) is the only way the engine touches
/// the tree: it snapshots, checks out, applies the picks, runs the body and
/// restores, whatever the body returned.
#[derive(Clone)]
pub struct PatchsetManager {
    vcs: Arc<dyn Vcs>,
}

impl PatchsetManager {
    pub fn new(vcs: Arc<dyn Vcs>) -> Self {
        Self { vcs }
    }

    pub fn vcs(&self) -> &Arc<dyn Vcs> {
        &self.vcs
    }

    pub async fn with_patches<F, Fut, T>(
        &self,
        revision: &Revision,
        patches: &[Patch],
        body: F,
    ) -> Result<T, PatchError>
    where
        F: FnOnce(AppliedPatches) -> Fut,
        Fut: Future<Output = T>,
    {
        let snapshot = self.vcs.snapshot().await?;
        let result = match self.prepare(revision, patches).await {
            Ok(applied) => Ok(body(applied).await),
            Err(err) => Err(err),
        };
        if let Err(err) = self.vcs.restore(&snapshot).await {
            log::error!("could not restore the working tree: {err}");
            return Err(PatchError::TreeRestore {
                reason: err.to_string(),
            });
        }
        result
    }

    async fn prepare(
        &self,
        revision: &Revision,
        patches: &[Patch],
    ) -> Result<AppliedPatches, PatchError> {
        self.vcs.checkout(revision).await?;
        let mut applied = AppliedPatches {
            revision: revision.clone(),
            results: Vec::with_capacity(patches.len()),
        };
        for patch in patches {
            let result = self.vcs.cherry_pick(&patch.rev).await?;
            if let ApplyResult::Failed { reason } = &result {
                if patch.mandatory {
                    return Err(PatchError::MandatoryPatch {
                        rev: patch.rev.clone(),
                        reason: reason.clone(),
                    });
                }
                log::warn!(
                    "{} does not apply onto {}, continuing without it",
                    patch.rev.short(),
                    revision.short()
                );
            }
            applied.results.push((patch.clone(), result));
        }
        Ok(applied)
    }
}

use crate::Result;
use async_trait::async_trait;
use nix_bisect_git::AppliedPatches;
use nix_bisect_nix::{BuildSubject, Classifier, ClassifyRequest};
use nix_bisect_protocol::{ActionPolicy, BuildOutcome, CancelToken, Revision, Verdict};

#[derive(Debug, Clone)]
pub struct Judgement {
    pub verdict: Verdict,
    /// The build outcome behind the verdict, when a build was involved.
    pub outcome: Option<BuildOutcome>,
    pub cached: bool,
}

impl Judgement {
    pub fn verdict(verdict: Verdict) -> Self {
        Self {
            verdict,
            outcome: None,
            cached: false,
        }
    }
}

/// Decides the verdict for the checked-out candidate.
#[async_trait]
pub trait Judge: Send + Sync {
    async fn judge(
        &self,
        revision: &Revision,
        applied: &AppliedPatches,
        cancel: &CancelToken,
    ) -> Result<Judgement>;
}

/// Builds the candidate with the [`Classifier`] and maps the outcome
/// through an [`ActionPolicy`].
pub struct ClassifierJudge {
    classifier: Classifier,
    request: ClassifyRequest,
    policy: ActionPolicy,
}

impl ClassifierJudge {
    pub fn new(classifier: Classifier, request: ClassifyRequest, policy: ActionPolicy) -> Self {
        Self {
            classifier,
            request,
            policy,
        }
    }
}

#[async_trait]
impl Judge for ClassifierJudge {
    async fn judge(
        &self,
        revision: &Revision,
        applied: &AppliedPatches,
        cancel: &CancelToken,
    ) -> Result<Judgement> {
        let subject = BuildSubject::new(revision.clone(), applied.applied());
        let classification = self
            .classifier
            .classify(&subject, &self.request, cancel)
            .await?;
        Ok(Judgement {
            verdict: self.policy.verdict(&classification.outcome),
            outcome: Some(classification.outcome),
            cached: classification.cached,
        })
    }
}

use crate::Result;
use async_trait::async_trait;
use nix_bisect_protocol::Revision;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum HeadRef {
    Branch(String),
    Detached(Revision),
}

/// Everything needed to put the working tree back the way it was found.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeSnapshot {
    pub head: HeadRef,
    pub commit: Revision,
    /// Stash commit holding staged, unstaged and untracked changes.
    pub stash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ApplyResult {
    Applied,
    /// The change is already part of the tree.
    AlreadyApplied,
    /// The pick conflicted and was aborted.
    Failed { reason: String },
}

impl ApplyResult {
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

/// The version-control operations a bisection needs.
#[async_trait]
pub trait Vcs: Send + Sync {
    /// Resolve `rev` to a full commit id.
    async fn rev_parse(&self, rev: &str) -> Result<Revision>;

    async fn head(&self) -> Result<Revision> {
        self.rev_parse("HEAD").await
    }

    /// Detached checkout of `rev`.
    async fn checkout(&self, rev: &Revision) -> Result<()>;

    /// Cherry-pick `patch` onto the current tree. Conflicts are aborted and
    /// reported as [`ApplyResult::Failed`], not as errors.
    async fn cherry_pick(&self, patch: &Revision) -> Result<ApplyResult>;

    async fn snapshot(&self) -> Result<TreeSnapshot>;

    async fn restore(&self, snapshot: &TreeSnapshot) -> Result<()>;

    async fn is_ancestor(&self, ancestor: &Revision, descendant: &Revision) -> Result<bool>;

    /// Linearized history from `good` to `bad`, oldest first, both included.
    async fn ancestry_path(&self, good: &Revision, bad: &Revision) -> Result<Vec<Revision>>;

    /// True when the tree has staged, unstaged or untracked changes.
    async fn is_dirty(&self) -> Result<bool>;

    /// Directory for nix-bisect state belonging to this repository.
    fn state_dir(&self) -> PathBuf;
}

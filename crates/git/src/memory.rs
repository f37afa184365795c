//! In-memory [`Vcs`] over a linear history, for exercising the engine
//! without a repository.

use crate::vcs::{ApplyResult, HeadRef, TreeSnapshot, Vcs};
use crate::{GitError, Result};
use async_trait::async_trait;
use nix_bisect_protocol::Revision;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Mutex;

#[derive(Debug, Clone)]
struct Tree {
    head: HeadRef,
    commit: Revision,
    picks: Vec<Revision>,
    /// Uncommitted modifications, path to content.
    changes: BTreeMap<String, String>,
    stashes: Vec<(String, BTreeMap<String, String>)>,
}

#[derive(Debug, Default)]
struct Faults {
    conflicts: BTreeSet<Revision>,
    fail_restore: bool,
}

/// Linear history `commits[0] → commits[1] → …`, checked out on `main`.
///
/// Cherry-picking a commit that is an ancestor of the checked-out commit is
/// reported as [`ApplyResult::AlreadyApplied`]; conflicts are injected with
/// [`MemoryVcs::conflict_on`].
#[derive(Debug)]
pub struct MemoryVcs {
    commits: Vec<Revision>,
    state_dir: PathBuf,
    tree: Mutex<Tree>,
    faults: Mutex<Faults>,
    checkouts: Mutex<Vec<Revision>>,
}

impl MemoryVcs {
    pub fn new(commits: Vec<Revision>, state_dir: impl Into<PathBuf>) -> Self {
        let tip = commits
            .last()
            .cloned()
            .unwrap_or_else(|| Revision::new("0000000"));
        Self {
            commits,
            state_dir: state_dir.into(),
            tree: Mutex::new(Tree {
                head: HeadRef::Branch("main".into()),
                commit: tip,
                picks: Vec::new(),
                changes: BTreeMap::new(),
                stashes: Vec::new(),
            }),
            faults: Mutex::new(Faults::default()),
            checkouts: Mutex::new(Vec::new()),
        }
    }

    /// History `c0 … c{n-1}`.
    pub fn linear(n: usize, state_dir: impl Into<PathBuf>) -> Self {
        Self::new((0..n).map(|i| Revision::new(format!("c{i}"))).collect(), state_dir)
    }

    pub fn commits(&self) -> &[Revision] {
        &self.commits
    }

    /// Make every cherry-pick of `patch` conflict.
    pub fn conflict_on(&self, patch: &Revision) {
        self.lock_faults().conflicts.insert(patch.clone());
    }

    pub fn fail_restore(&self, fail: bool) {
        self.lock_faults().fail_restore = fail;
    }

    /// Simulate an uncommitted edit.
    pub fn modify(&self, path: &str, content: &str) {
        self.lock_tree()
            .changes
            .insert(path.to_string(), content.to_string());
    }

    /// Candidates checked out so far, in order.
    pub fn checkouts(&self) -> Vec<Revision> {
        self.checkouts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Stable rendering of the visible tree state.
    pub fn fingerprint(&self) -> String {
        let tree = self.lock_tree();
        let head = match &tree.head {
            HeadRef::Branch(name) => format!("branch:{name}"),
            HeadRef::Detached(rev) => format!("detached:{rev}"),
        };
        let picks: Vec<&str> = tree.picks.iter().map(Revision::as_str).collect();
        format!(
            "{head} commit:{} picks:[{}] changes:{:?} stashes:{}",
            tree.commit,
            picks.join(","),
            tree.changes,
            tree.stashes.len()
        )
    }

    fn lock_tree(&self) -> std::sync::MutexGuard<'_, Tree> {
        self.tree
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_faults(&self) -> std::sync::MutexGuard<'_, Faults> {
        self.faults
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn position(&self, rev: &Revision) -> Result<usize> {
        self.commits
            .iter()
            .position(|c| c == rev)
            .ok_or_else(|| GitError::UnknownRevision(rev.to_string()))
    }
}

#[async_trait]
impl Vcs for MemoryVcs {
    async fn rev_parse(&self, rev: &str) -> Result<Revision> {
        if rev == "HEAD" {
            return Ok(self.lock_tree().commit.clone());
        }
        let mut matches = self.commits.iter().filter(|c| c.as_str().starts_with(rev));
        match (matches.next(), matches.next()) {
            (Some(found), None) => Ok(found.clone()),
            _ => Err(GitError::UnknownRevision(rev.to_string())),
        }
    }

    async fn checkout(&self, rev: &Revision) -> Result<()> {
        self.position(rev)?;
        let mut tree = self.lock_tree();
        if !tree.changes.is_empty() {
            return Err(GitError::Command {
                command: format!("git checkout {rev}"),
                stderr: "local changes would be overwritten".into(),
            });
        }
        tree.head = HeadRef::Detached(rev.clone());
        tree.commit = rev.clone();
        tree.picks.clear();
        drop(tree);
        self.checkouts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(rev.clone());
        Ok(())
    }

    async fn cherry_pick(&self, patch: &Revision) -> Result<ApplyResult> {
        let patch_pos = self.position(patch)?;
        if self.lock_faults().conflicts.contains(patch) {
            return Ok(ApplyResult::Failed {
                reason: format!("conflict while picking {patch}"),
            });
        }
        let mut tree = self.lock_tree();
        let head_pos = self.position(&tree.commit)?;
        if patch_pos <= head_pos || tree.picks.contains(patch) {
            return Ok(ApplyResult::AlreadyApplied);
        }
        tree.picks.push(patch.clone());
        Ok(ApplyResult::Applied)
    }

    async fn snapshot(&self) -> Result<TreeSnapshot> {
        let mut tree = self.lock_tree();
        let stash = if tree.changes.is_empty() {
            None
        } else {
            let id = format!("stash{}", tree.stashes.len());
            let changes = std::mem::take(&mut tree.changes);
            tree.stashes.push((id.clone(), changes));
            Some(id)
        };
        Ok(TreeSnapshot {
            head: tree.head.clone(),
            commit: tree.commit.clone(),
            stash,
        })
    }

    async fn restore(&self, snapshot: &TreeSnapshot) -> Result<()> {
        if self.lock_faults().fail_restore {
            return Err(GitError::Command {
                command: "git reset --hard".into(),
                stderr: "injected restore failure".into(),
            });
        }
        let mut tree = self.lock_tree();
        tree.head = snapshot.head.clone();
        tree.commit = snapshot.commit.clone();
        tree.picks.clear();
        tree.changes.clear();
        if let Some(id) = &snapshot.stash {
            let index = tree
                .stashes
                .iter()
                .position(|(stash, _)| stash == id)
                .ok_or_else(|| GitError::Other(format!("snapshot stash {id} is gone")))?;
            let (_, changes) = tree.stashes.remove(index);
            tree.changes = changes;
        }
        Ok(())
    }

    async fn is_ancestor(&self, ancestor: &Revision, descendant: &Revision) -> Result<bool> {
        Ok(self.position(ancestor)? <= self.position(descendant)?)
    }

    async fn ancestry_path(&self, good: &Revision, bad: &Revision) -> Result<Vec<Revision>> {
        let (lo, hi) = (self.position(good)?, self.position(bad)?);
        if lo > hi {
            return Err(GitError::NotAncestor {
                good: good.clone(),
                bad: bad.clone(),
            });
        }
        Ok(self.commits[lo..=hi].to_vec())
    }

    async fn is_dirty(&self) -> Result<bool> {
        Ok(!self.lock_tree().changes.is_empty())
    }

    fn state_dir(&self) -> PathBuf {
        self.state_dir.clone()
    }
}

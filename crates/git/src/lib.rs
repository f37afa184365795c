//! # nix-bisect git
//!
//! The version-control side of a bisection: the [`Vcs`] trait and its `git`
//! implementation, tree snapshots, the persisted cherry-pick [`Patch`] set
//! and the [`PatchsetManager`] that scopes every mutation of the working
//! tree.

mod cli;
mod error;
mod manager;
#[cfg(any(test, feature = "test-support"))]
pub mod memory;
mod patch;
mod vcs;

pub use cli::{git_prompts, GitCli};
pub use error::{GitError, PatchError, Result};
pub use manager::{AppliedPatches, PatchsetManager};
pub use patch::{Patch, PatchOrigin, PatchSetStore};
pub use vcs::{ApplyResult, HeadRef, TreeSnapshot, Vcs};

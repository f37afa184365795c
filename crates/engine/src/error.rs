use nix_bisect_git::{GitError, PatchError};
use nix_bisect_nix::NixError;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Patch(#[from] PatchError),

    #[error(transparent)]
    Nix(#[from] NixError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Another nix-bisect process owns the working tree.
    #[error("working tree is busy: {} is held by another nix-bisect", path.display())]
    Busy { path: PathBuf },

    #[error("inconsistent bisection: {0}")]
    Inconsistent(String),

    #[error("no bisection in progress")]
    NoSession,

    #[error("{0}")]
    Other(String),
}

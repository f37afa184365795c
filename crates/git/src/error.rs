use nix_bisect_exec::ExecError;
use nix_bisect_protocol::Revision;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, GitError>;

#[derive(Error, Debug)]
pub enum GitError {
    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error("`{command}` failed: {stderr}")]
    Command { command: String, stderr: String },

    #[error("unknown revision: {0}")]
    UnknownRevision(String),

    #[error("{good} is not an ancestor of {bad}")]
    NotAncestor { good: Revision, bad: Revision },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

/// Failures of [`PatchsetManager::with_patches`](crate::PatchsetManager::with_patches).
#[derive(Error, Debug)]
pub enum PatchError {
    #[error(transparent)]
    Git(#[from] GitError),

    /// A patch marked mandatory did not apply; the body was not run.
    #[error("mandatory patch {rev} did not apply: {reason}")]
    MandatoryPatch { rev: Revision, reason: String },

    /// The working tree could not be put back. Always fatal.
    #[error("failed to restore the working tree: {reason}")]
    TreeRestore { reason: String },
}

impl PatchError {
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::TreeRestore { .. } => true,
            Self::Git(GitError::Exec(err)) => err.is_spawn(),
            _ => false,
        }
    }
}

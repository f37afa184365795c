use nix_bisect_exec::ExecError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, NixError>;

#[derive(Error, Debug)]
pub enum NixError {
    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error("instantiation failed: {reason}")]
    Instantiation { reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid rebuild blacklist pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("{0}")]
    Other(String),
}

impl NixError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Exec(err) if err.is_cancelled())
    }

    /// Launch failures mean the build tool is not usable at all.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Exec(err) if err.is_spawn())
    }
}

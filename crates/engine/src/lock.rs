use crate::{EngineError, Result};
use fs2::FileExt;
use std::path::{Path, PathBuf};

const LOCK_FILE_NAME: &str = "worktree.lock";

/// Advisory exclusive lock on a repository's state directory. Held for as
/// long as nix-bisect mutates the working tree.
#[derive(Debug)]
pub struct WorktreeLock {
    file: std::fs::File,
    path: PathBuf,
}

impl WorktreeLock {
    /// Take the lock without waiting; a held lock is [`EngineError::Busy`].
    pub async fn acquire(state_dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(state_dir).await?;
        let path = state_dir.join(LOCK_FILE_NAME);

        tokio::task::spawn_blocking(move || -> Result<WorktreeLock> {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .truncate(false)
                .open(&path)?;
            match file.try_lock_exclusive() {
                Ok(()) => Ok(WorktreeLock { file, path }),
                Err(err) if err.kind() == fs2::lock_contended_error().kind() => {
                    Err(EngineError::Busy { path })
                }
                Err(err) => Err(err.into()),
            }
        })
        .await
        .map_err(|err| EngineError::Other(format!("join worktree lock task: {err}")))?
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for WorktreeLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_holder_is_turned_away() {
        let temp = tempfile::tempdir().unwrap();
        let first = WorktreeLock::acquire(temp.path()).await.unwrap();
        let second = WorktreeLock::acquire(temp.path()).await;
        assert!(matches!(second, Err(EngineError::Busy { .. })));
        drop(first);
        WorktreeLock::acquire(temp.path()).await.unwrap();
    }
}

use crate::state::BisectState;
use crate::Result;
use nix_bisect_git::PatchSetStore;
use nix_bisect_nix::ClassifyRequest;
use nix_bisect_protocol::{ActionPolicy, STATE_SCHEMA_VERSION};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const STATE_FILE_NAME: &str = "state.json";
const SESSION_FILE_NAME: &str = "session.json";
const ACTIVE_FILE_NAME: &str = "active";

/// How candidates of one bisection are built and judged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub request: ClassifyRequest,
    #[serde(default)]
    pub policy: ActionPolicy,
}

/// Persistence for one bisection: `<state-dir>/<target-key>/`.
#[derive(Debug, Clone)]
pub struct StateStore {
    root: PathBuf,
    dir: PathBuf,
}

impl StateStore {
    pub fn new(state_dir: &Path, target_key: &str) -> Self {
        Self {
            root: state_dir.to_path_buf(),
            dir: state_dir.join(target_key),
        }
    }

    /// The store of the bisection last started in `state_dir`.
    pub async fn active(state_dir: &Path) -> Result<Option<Self>> {
        match tokio::fs::read_to_string(state_dir.join(ACTIVE_FILE_NAME)).await {
            Ok(key) if !key.trim().is_empty() => Ok(Some(Self::new(state_dir, key.trim()))),
            Ok(_) => Ok(None),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn patches(&self) -> PatchSetStore {
        PatchSetStore::new(&self.dir)
    }

    pub async fn mark_active(&self) -> Result<()> {
        let key = self
            .dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        write_atomic(&self.root.join(ACTIVE_FILE_NAME), key.as_bytes()).await
    }

    pub async fn load(&self) -> Result<Option<BisectState>> {
        let state: Option<BisectState> = read_json(&self.dir.join(STATE_FILE_NAME)).await?;
        match state {
            Some(state) if state.schema_version != STATE_SCHEMA_VERSION => {
                log::warn!(
                    "ignoring bisect state with schema {} (expected {STATE_SCHEMA_VERSION})",
                    state.schema_version
                );
                Ok(None)
            }
            other => Ok(other),
        }
    }

    pub async fn save(&self, state: &BisectState) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(state)?;
        write_atomic(&self.dir.join(STATE_FILE_NAME), &bytes).await
    }

    pub async fn load_session(&self) -> Result<Option<Session>> {
        read_json(&self.dir.join(SESSION_FILE_NAME)).await
    }

    pub async fn save_session(&self, session: &Session) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(session)?;
        write_atomic(&self.dir.join(SESSION_FILE_NAME), &bytes).await
    }

    /// Forget this bisection: state, session and patch set.
    pub async fn reset(&self) -> Result<()> {
        match tokio::fs::remove_dir_all(&self.dir).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        if let Some(active) = Self::active(&self.root).await? {
            if active.dir == self.dir {
                let pointer = self.root.join(ACTIVE_FILE_NAME);
                match tokio::fs::remove_file(&pointer).await {
                    Ok(()) => {}
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                    Err(err) => {
                        log::warn!("could not remove {}: {err}", pointer.display());
                        return Err(err.into());
                    }
                }
            }
        }
        Ok(())
    }
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension(format!("tmp.{}", std::process::id()));
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

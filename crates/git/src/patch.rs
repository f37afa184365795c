use crate::Result;
use nix_bisect_protocol::Revision;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const PATCHES_FILE_NAME: &str = "patches.json";
const PATCHES_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PatchOrigin {
    #[default]
    User,
    /// Found by resolving the named skip range.
    Unbreak { range: String },
}

/// A commit cherry-picked onto every candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    pub rev: Revision,
    #[serde(default)]
    pub origin: PatchOrigin,
    /// A candidate whose mandatory patch does not apply is not built.
    #[serde(default)]
    pub mandatory: bool,
}

impl Patch {
    pub fn new(rev: Revision) -> Self {
        Self {
            rev,
            origin: PatchOrigin::User,
            mandatory: false,
        }
    }

    pub fn unbreak(rev: Revision, range: impl Into<String>) -> Self {
        Self {
            rev,
            origin: PatchOrigin::Unbreak {
                range: range.into(),
            },
            mandatory: false,
        }
    }

    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedPatchSet {
    schema_version: u32,
    patches: Vec<Patch>,
}

/// The persisted, ordered and duplicate-free patch set of one bisection.
#[derive(Debug, Clone)]
pub struct PatchSetStore {
    path: PathBuf,
}

impl PatchSetStore {
    pub fn new(dir: &Path) -> Self {
        Self {
            path: dir.join(PATCHES_FILE_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> Result<Vec<Patch>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let persisted: PersistedPatchSet = serde_json::from_slice(&bytes)?;
        Ok(persisted.patches)
    }

    pub async fn save(&self, patches: &[Patch]) -> Result<()> {
        let mut unique: Vec<Patch> = Vec::with_capacity(patches.len());
        for patch in patches {
            if !unique.iter().any(|p| p.rev == patch.rev) {
                unique.push(patch.clone());
            }
        }
        let bytes = serde_json::to_vec_pretty(&PersistedPatchSet {
            schema_version: PATCHES_SCHEMA_VERSION,
            patches: unique,
        })?;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self
            .path
            .with_extension(format!("json.tmp.{}", std::process::id()));
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }

    /// Append `patch`; returns false when its revision is already present.
    pub async fn add(&self, patch: Patch) -> Result<bool> {
        let mut patches = self.load().await?;
        if patches.iter().any(|p| p.rev == patch.rev) {
            return Ok(false);
        }
        patches.push(patch);
        self.save(&patches).await?;
        Ok(true)
    }

    pub async fn clear(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

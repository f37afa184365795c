use crate::tool::BuildTool;
use crate::Result;
use nix_bisect_protocol::{BuildOutcome, BuildTarget, CancelToken, LineCheck, Revision};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

pub const CACHE_SCHEMA_VERSION: u32 = 1;

const ENTRIES_DIR: &str = "entries";
const LOGS_DIR: &str = "logs";

/// Whether already-valid outputs are trusted or rebuilt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildMode {
    #[default]
    Normal,
    /// Rebuild the target even when its outputs are valid (`--check`).
    Recheck,
}

impl BuildMode {
    fn tag(self) -> &'static [u8] {
        match self {
            Self::Normal => b"normal",
            Self::Recheck => b"recheck",
        }
    }
}

/// Content hash of everything that determines a build: the revision, the
/// patches cherry-picked on top of it, the target description and the mode.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BuildIdentity(String);

impl BuildIdentity {
    pub fn compute(
        revision: &Revision,
        patches: &[Revision],
        target: &BuildTarget,
        mode: BuildMode,
    ) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"rev\0");
        hasher.update(revision.as_str().as_bytes());
        for patch in patches {
            hasher.update(b"\0pick\0");
            hasher.update(patch.as_str().as_bytes());
        }
        hasher.update(b"\0mode\0");
        hasher.update(mode.tag());
        hasher.update(b"\0target\0");
        target.fingerprint_into(&mut hasher);
        let digest = hasher.finalize();
        Self(digest.iter().map(|b| format!("{b:02x}")).collect())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BuildIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How a cached outcome was established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Evidence {
    /// Outputs were already valid in the store; nothing was built.
    Store,
    /// A build actually ran.
    Build,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub schema_version: u32,
    pub identity: BuildIdentity,
    pub revision: Revision,
    #[serde(default)]
    pub patches: Vec<Revision>,
    pub outcome: BuildOutcome,
    /// Failure line the outcome was classified against.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_line: Option<String>,
    pub evidence: Evidence,
    pub recorded_at_unix_ms: u64,
}

impl CacheEntry {
    pub fn new(
        identity: BuildIdentity,
        revision: Revision,
        patches: Vec<Revision>,
        outcome: BuildOutcome,
        failure_line: Option<String>,
        evidence: Evidence,
    ) -> Self {
        Self {
            schema_version: CACHE_SCHEMA_VERSION,
            identity,
            revision,
            patches,
            outcome,
            failure_line,
            evidence,
            recorded_at_unix_ms: unix_now_ms(),
        }
    }
}

/// On-disk store of classified outcomes.
///
/// Layout: `<dir>/entries/<identity>.json` and `<dir>/logs/<identity>.log`.
/// Entries are written atomically; a torn or unreadable entry is a miss.
#[derive(Debug, Clone)]
pub struct BuildCache {
    dir: PathBuf,
}

impl BuildCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `$XDG_CACHE_HOME/nix-bisect`, or `None` when there is no cache home.
    pub fn default_dir() -> Option<PathBuf> {
        dirs::cache_dir().map(|dir| dir.join("nix-bisect"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, identity: &BuildIdentity) -> PathBuf {
        self.dir
            .join(ENTRIES_DIR)
            .join(format!("{}.json", identity.as_str()))
    }

    fn log_path(&self, identity: &BuildIdentity) -> PathBuf {
        self.dir
            .join(LOGS_DIR)
            .join(format!("{}.log", identity.as_str()))
    }

    async fn read_entry(&self, identity: &BuildIdentity) -> Option<CacheEntry> {
        let path = self.entry_path(identity);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) => {
                if err.kind() != std::io::ErrorKind::NotFound {
                    log::warn!("cache entry {} unreadable: {err}", path.display());
                }
                return None;
            }
        };
        match serde_json::from_slice::<CacheEntry>(&bytes) {
            Ok(entry) if entry.schema_version == CACHE_SCHEMA_VERSION => Some(entry),
            Ok(entry) => {
                log::debug!(
                    "cache entry {} has schema {}, ignoring",
                    path.display(),
                    entry.schema_version
                );
                None
            }
            Err(err) => {
                log::warn!("cache entry {} is corrupt, ignoring: {err}", path.display());
                None
            }
        }
    }

    /// Look up a prior outcome.
    ///
    /// Successes only count while their outputs are still valid in the store.
    /// A target failure recorded under one failure line answers another from
    /// its stored log. One recorded without a line never answers a query that
    /// asks for one.
    pub async fn lookup(
        &self,
        identity: &BuildIdentity,
        failure_line: Option<&str>,
        tool: &dyn BuildTool,
        cancel: &CancelToken,
    ) -> Result<Option<CacheEntry>> {
        let Some(entry) = self.read_entry(identity).await else {
            return Ok(None);
        };
        match &entry.outcome {
            BuildOutcome::Success { outputs, .. } => {
                if tool.is_valid(outputs, cancel).await? {
                    Ok(Some(entry))
                } else {
                    log::debug!("cached success for {identity} was garbage collected");
                    Ok(None)
                }
            }
            BuildOutcome::Aborted { .. } => Ok(None),
            BuildOutcome::TargetFailure { .. } => self.recheck_line(entry, failure_line).await,
            BuildOutcome::DependencyFailure { .. } | BuildOutcome::InstantiationFailure { .. } => {
                Ok(Some(entry))
            }
        }
    }

    async fn recheck_line(
        &self,
        mut entry: CacheEntry,
        failure_line: Option<&str>,
    ) -> Result<Option<CacheEntry>> {
        if entry.failure_line.as_deref() == failure_line {
            return Ok(Some(entry));
        }
        let line = match failure_line {
            None => LineCheck::NotRequired,
            Some(_) if entry.failure_line.is_none() => {
                log::debug!(
                    "cached failure for {} was recorded without a failure line",
                    entry.identity
                );
                return Ok(None);
            }
            Some(needle) => match self.read_log(&entry.identity).await? {
                Some(log) => LineCheck::against(&log, Some(needle)),
                None => {
                    log::debug!("cached failure for {} has no stored log", entry.identity);
                    return Ok(None);
                }
            },
        };
        if let BuildOutcome::TargetFailure { line: check, .. } = &mut entry.outcome {
            *check = line;
        }
        entry.failure_line = failure_line.map(str::to_string);
        Ok(Some(entry))
    }

    /// Persist `entry`, attaching `log` when given. Aborted outcomes are not
    /// conclusions and are never stored.
    pub async fn store(&self, mut entry: CacheEntry, log: Option<&str>) -> Result<CacheEntry> {
        if entry.outcome.is_aborted() {
            return Ok(entry);
        }
        if let Some(log) = log {
            let path = self.log_path(&entry.identity);
            write_atomic(&path, log.as_bytes()).await?;
            entry.outcome = entry.outcome.with_log_path(path);
        }
        let bytes = serde_json::to_vec_pretty(&entry)?;
        write_atomic(&self.entry_path(&entry.identity), &bytes).await?;
        Ok(entry)
    }

    pub async fn invalidate(&self, identity: &BuildIdentity) -> Result<()> {
        for path in [self.entry_path(identity), self.log_path(identity)] {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    pub async fn clear(&self) -> Result<()> {
        for sub in [ENTRIES_DIR, LOGS_DIR] {
            let path = self.dir.join(sub);
            match tokio::fs::remove_dir_all(&path).await {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    /// Stored log for `identity`, if one was recorded.
    pub async fn read_log(&self, identity: &BuildIdentity) -> Result<Option<String>> {
        match tokio::fs::read_to_string(self.log_path(identity)).await {
            Ok(log) => Ok(Some(log)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn entry(&self, identity: &BuildIdentity) -> Option<CacheEntry> {
        self.read_entry(identity).await
    }

    /// Every readable entry recorded for `revision`, newest first.
    pub async fn entries_for(&self, revision: &Revision) -> Result<Vec<CacheEntry>> {
        let mut dir = match tokio::fs::read_dir(self.dir.join(ENTRIES_DIR)).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut entries = Vec::new();
        while let Some(file) = dir.next_entry().await? {
            let path = file.path();
            let Some(stem) = path
                .file_stem()
                .filter(|_| path.extension().is_some_and(|ext| ext == "json"))
                .and_then(|stem| stem.to_str())
            else {
                continue;
            };
            if let Some(entry) = self.read_entry(&BuildIdentity(stem.to_string())).await {
                if &entry.revision == revision {
                    entries.push(entry);
                }
            }
        }
        entries.sort_by(|a, b| b.recorded_at_unix_ms.cmp(&a.recorded_at_unix_ms));
        Ok(entries)
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension(format!("tmp.{}", std::process::id()));
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await
}

fn unix_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

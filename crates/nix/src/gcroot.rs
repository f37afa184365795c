use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Where roots are registered.
///
/// Roots are indirect: `<gcroots>/<name>` points at `<tmp>/nix-bisect-gcroot-<name>`,
/// which points at the store path. A crash leaves only a dangling temp link
/// behind, which the collector ignores once the temp dir is cleaned.
#[derive(Debug, Clone)]
pub struct GcRootDir {
    gcroots: PathBuf,
    tmp: PathBuf,
}

impl GcRootDir {
    pub fn new(gcroots: impl Into<PathBuf>, tmp: impl Into<PathBuf>) -> Self {
        Self {
            gcroots: gcroots.into(),
            tmp: tmp.into(),
        }
    }

    /// `$NIX_STATE_DIR/gcroots/per-user/$USER`, defaulting to `/nix/var/nix`.
    pub fn from_env() -> Self {
        let state_dir = std::env::var_os("NIX_STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/nix/var/nix"));
        let user = std::env::var("USER").unwrap_or_else(|_| "user-unknown".to_string());
        Self::new(
            state_dir.join("gcroots").join("per-user").join(user),
            std::env::temp_dir(),
        )
    }

    pub fn gcroot_path(&self, name: &str) -> PathBuf {
        self.gcroots.join(name)
    }

    pub fn tmp_path(&self, name: &str) -> PathBuf {
        self.tmp.join(format!("nix-bisect-gcroot-{name}"))
    }
}

/// A registered root. Dropping it removes the links.
#[derive(Debug, Default)]
pub struct GcRoot {
    links: Vec<PathBuf>,
}

impl GcRoot {
    /// A root that pins nothing, used when registration is impossible.
    pub fn detached() -> Self {
        Self::default()
    }

    pub fn register(dir: &GcRootDir, name: &str, target: &Path) -> std::io::Result<Self> {
        let tmp_link = dir.tmp_path(name);
        std::os::unix::fs::symlink(target, &tmp_link)?;
        let root_link = dir.gcroot_path(name);
        if let Err(err) = std::os::unix::fs::symlink(&tmp_link, &root_link) {
            let _ = std::fs::remove_file(&tmp_link);
            return Err(err);
        }
        Ok(Self {
            links: vec![root_link, tmp_link],
        })
    }

    pub fn is_registered(&self) -> bool {
        !self.links.is_empty()
    }
}

impl Drop for GcRoot {
    fn drop(&mut self) {
        for link in &self.links {
            if let Err(err) = std::fs::remove_file(link) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    log::warn!("failed to remove gcroot {}: {err}", link.display());
                }
            }
        }
    }
}

/// Unique root name for `drv`.
pub fn gcroot_name(drv: &str) -> String {
    let base = Path::new(drv)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "drv".to_string());
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis());
    format!("nix-bisect-{base}-{millis}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn root_links_are_removed_on_drop() {
        let temp = tempdir().unwrap();
        let gcroots = temp.path().join("gcroots");
        let tmp = temp.path().join("tmp");
        std::fs::create_dir_all(&gcroots).unwrap();
        std::fs::create_dir_all(&tmp).unwrap();
        let target = temp.path().join("hello.drv");
        std::fs::write(&target, "Derive(...)").unwrap();

        let dir = GcRootDir::new(&gcroots, &tmp);
        let root = GcRoot::register(&dir, "r1", &target).unwrap();
        assert!(root.is_registered());
        let root_link = dir.gcroot_path("r1");
        assert_eq!(
            std::fs::read_link(&root_link).unwrap(),
            dir.tmp_path("r1"),
            "gcroot must be indirect"
        );
        assert!(std::fs::metadata(&root_link).is_ok(), "link chain resolves");

        drop(root);
        assert!(std::fs::symlink_metadata(&root_link).is_err());
        assert!(std::fs::symlink_metadata(dir.tmp_path("r1")).is_err());
    }

    #[test]
    fn failed_registration_leaves_no_temp_link() {
        let temp = tempdir().unwrap();
        let dir = GcRootDir::new(temp.path().join("missing"), temp.path());
        let result = GcRoot::register(&dir, "r2", Path::new("/nix/store/x.drv"));
        assert!(result.is_err());
        assert!(std::fs::symlink_metadata(dir.tmp_path("r2")).is_err());
    }

    #[test]
    fn names_embed_the_derivation_basename() {
        let name = gcroot_name("/nix/store/aaaa-hello-2.12.drv");
        assert!(name.starts_with("nix-bisect-aaaa-hello-2.12.drv-"));
    }
}

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// A buildable unit: an attribute path evaluated in the context of a nix file,
/// plus the overrides passed to the evaluator.
///
/// Overrides live in ordered maps so that two targets built from the same
/// flags always hash to the same key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildTarget {
    #[serde(default = "default_nix_file")]
    pub nix_file: PathBuf,
    pub attr: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub argstr: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub args: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, String>,
}

fn default_nix_file() -> PathBuf {
    PathBuf::from(".")
}

impl BuildTarget {
    pub fn new(attr: impl Into<String>) -> Self {
        Self {
            nix_file: default_nix_file(),
            attr: attr.into(),
            argstr: BTreeMap::new(),
            args: BTreeMap::new(),
            options: BTreeMap::new(),
        }
    }

    pub fn with_file(mut self, nix_file: impl Into<PathBuf>) -> Self {
        self.nix_file = nix_file.into();
        self
    }

    pub fn with_argstr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.argstr.insert(name.into(), value.into());
        self
    }

    pub fn with_arg(mut self, name: impl Into<String>, expr: impl Into<String>) -> Self {
        self.args.insert(name.into(), expr.into());
        self
    }

    pub fn with_option(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(name.into(), value.into());
        self
    }

    /// True when the attribute is already an instantiated derivation path
    /// that exists on disk; such targets skip evaluation.
    pub fn is_drv_path(&self) -> bool {
        let path = Path::new(&self.attr);
        self.attr.ends_with(".drv") && path.exists()
    }

    /// Feed the canonical form of this target into `hasher`.
    pub fn fingerprint_into(&self, hasher: &mut Sha256) {
        hasher.update(b"file\0");
        hasher.update(self.nix_file.to_string_lossy().as_bytes());
        hasher.update(b"\0attr\0");
        hasher.update(self.attr.as_bytes());
        for (section, map) in [
            ("argstr", &self.argstr),
            ("arg", &self.args),
            ("option", &self.options),
        ] {
            for (name, value) in map {
                hasher.update(b"\0");
                hasher.update(section.as_bytes());
                hasher.update(b"\0");
                hasher.update(name.as_bytes());
                hasher.update(b"=");
                hasher.update(value.as_bytes());
            }
        }
    }

    /// Short stable key used to name per-target state directories.
    pub fn key(&self) -> String {
        let mut hasher = Sha256::new();
        self.fingerprint_into(&mut hasher);
        let digest = hasher.finalize();
        let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
        let slug: String = self
            .attr
            .chars()
            .rev()
            .take(40)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .map(|c| match c {
                'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
                _ => '_',
            })
            .collect();
        format!("{slug}-{}", &hex[..16])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_stable_across_override_insertion_order() {
        let a = BuildTarget::new("hello")
            .with_argstr("system", "x86_64-linux")
            .with_arg("config", "{}");
        let b = BuildTarget::new("hello")
            .with_arg("config", "{}")
            .with_argstr("system", "x86_64-linux");
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn key_changes_with_overrides() {
        let plain = BuildTarget::new("hello");
        let overridden = BuildTarget::new("hello").with_option("sandbox", "false");
        assert_ne!(plain.key(), overridden.key());
        assert!(plain.key().starts_with("hello-"));
    }

    #[test]
    fn key_slug_is_filesystem_safe() {
        let key = BuildTarget::new("/nix/store/abc-hello.drv").key();
        assert!(!key.contains('/'));
    }
}

use anyhow::{anyhow, bail, Context, Result};
use clap::Args;
use nix_bisect_nix::{BuildCache, BuildMode, ClassifyRequest};
use nix_bisect_protocol::{Action, ActionPolicy, BuildTarget};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE_NAME: &str = "nix-bisect.toml";
pub const CACHE_DIR_ENV: &str = "NIX_BISECT_CACHE_DIR";

/// `nix-bisect.toml`. Every field is optional; flags win over the file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub cache_dir: Option<PathBuf>,
    pub target: TargetConfig,
    pub failure_line: Option<String>,
    pub max_rebuilds: Option<usize>,
    pub rebuild_blacklist: Vec<String>,
    pub policy: PolicyOverrides,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TargetConfig {
    pub file: Option<PathBuf>,
    pub attr: Option<String>,
    pub argstr: BTreeMap<String, String>,
    pub arg: BTreeMap<String, String>,
    pub option: BTreeMap<String, String>,
}

/// Target and classification flags shared by `start` and `build-status`.
#[derive(Args, Debug, Clone, Default)]
pub struct RequestFlags {
    /// Attribute to build, or an existing .drv path
    pub attr: Option<String>,

    /// Nix file the attribute is evaluated in (default: .)
    #[arg(short, long)]
    pub file: Option<PathBuf>,

    /// Pass a string argument to the nix expression
    #[arg(long, num_args = 2, value_names = ["NAME", "VALUE"])]
    pub argstr: Vec<String>,

    /// Pass a nix expression argument
    #[arg(long, num_args = 2, value_names = ["NAME", "EXPR"])]
    pub arg: Vec<String>,

    /// Set a nix option for the build
    #[arg(long, num_args = 2, value_names = ["NAME", "VALUE"])]
    pub option: Vec<String>,

    /// Only count a target failure as bad when its log contains this line
    #[arg(long)]
    pub failure_line: Option<String>,

    /// Give up (abort) when more than this many derivations need building
    #[arg(long)]
    pub max_rebuilds: Option<usize>,

    /// Never rebuild derivations matching this regex (repeatable)
    #[arg(long = "rebuild-blacklist", value_name = "REGEX")]
    pub rebuild_blacklist: Vec<String>,

    /// Rebuild the target even when its outputs are already valid
    #[arg(long)]
    pub recheck: bool,
}

/// Per-status verdict overrides.
#[derive(Args, Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PolicyOverrides {
    /// Action when the target builds
    #[arg(long, value_name = "ACTION")]
    pub on_success: Option<Action>,

    /// Action when the target fails (with the failure line, if one is set)
    #[arg(long, value_name = "ACTION")]
    pub on_failure: Option<Action>,

    /// Action when the target fails without the failure line
    #[arg(long, value_name = "ACTION")]
    pub on_failure_without_line: Option<Action>,

    /// Action when a dependency of the target fails
    #[arg(long, value_name = "ACTION")]
    pub on_dependency_failure: Option<Action>,

    /// Action when the target does not evaluate
    #[arg(long, value_name = "ACTION")]
    pub on_instantiation_failure: Option<Action>,

    /// Action when the rebuild budget or blacklist stops the build
    #[arg(long, value_name = "ACTION")]
    pub on_resource_limit: Option<Action>,
}

impl PolicyOverrides {
    pub fn apply(&self, policy: &mut ActionPolicy) {
        let fields = [
            (self.on_success, &mut policy.on_success),
            (self.on_failure, &mut policy.on_failure),
            (self.on_failure_without_line, &mut policy.on_failure_without_line),
            (self.on_dependency_failure, &mut policy.on_dependency_failure),
            (self.on_instantiation_failure, &mut policy.on_instantiation_failure),
            (self.on_resource_limit, &mut policy.on_resource_limit),
        ];
        for (value, slot) in fields {
            if let Some(action) = value {
                *slot = action;
            }
        }
    }
}

impl FileConfig {
    /// Load `explicit`, or `nix-bisect.toml` in `root` when it exists.
    pub fn load(explicit: Option<&Path>, root: &Path) -> Result<Self> {
        let path = match explicit {
            Some(path) => path.to_path_buf(),
            None => {
                let path = root.join(CONFIG_FILE_NAME);
                if !path.is_file() {
                    return Ok(Self::default());
                }
                path
            }
        };
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        log::debug!("loaded config from {}", path.display());
        Self::parse(&text).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// `--cache-dir`, then `$NIX_BISECT_CACHE_DIR`, then the file, then the
    /// user cache directory.
    pub fn cache_dir(&self, flag: Option<&Path>) -> Result<PathBuf> {
        let env = std::env::var_os(CACHE_DIR_ENV)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);
        flag.map(Path::to_path_buf)
            .or(env)
            .or_else(|| self.cache_dir.clone())
            .or_else(BuildCache::default_dir)
            .ok_or_else(|| anyhow!("no cache directory; pass --cache-dir or set {CACHE_DIR_ENV}"))
    }

    pub fn request(&self, flags: &RequestFlags) -> Result<ClassifyRequest> {
        let Some(attr) = flags.attr.clone().or_else(|| self.target.attr.clone()) else {
            bail!("no attribute to build; pass one or set target.attr in {CONFIG_FILE_NAME}");
        };
        let mut target = BuildTarget::new(attr);
        if let Some(file) = flags.file.clone().or_else(|| self.target.file.clone()) {
            target = target.with_file(file);
        }
        target.argstr.extend(self.target.argstr.clone());
        target.args.extend(self.target.arg.clone());
        target.options.extend(self.target.option.clone());
        target.argstr.extend(pairs(&flags.argstr));
        target.args.extend(pairs(&flags.arg));
        target.options.extend(pairs(&flags.option));

        let mut request = ClassifyRequest::new(target);
        request.failure_line = flags
            .failure_line
            .clone()
            .or_else(|| self.failure_line.clone());
        request.max_rebuilds = flags.max_rebuilds.or(self.max_rebuilds);
        request.rebuild_blacklist = self.rebuild_blacklist.clone();
        request
            .rebuild_blacklist
            .extend(flags.rebuild_blacklist.iter().cloned());
        if flags.recheck {
            request.mode = BuildMode::Recheck;
        }
        request
            .blacklist()
            .context("invalid --rebuild-blacklist pattern")?;
        Ok(request)
    }

    pub fn policy(&self, flags: &PolicyOverrides) -> ActionPolicy {
        let mut policy = ActionPolicy::default();
        self.policy.apply(&mut policy);
        flags.apply(&mut policy);
        policy
    }
}

fn pairs(values: &[String]) -> impl Iterator<Item = (String, String)> + '_ {
    values
        .chunks_exact(2)
        .map(|pair| (pair[0].clone(), pair[1].clone()))
}

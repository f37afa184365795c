use crate::gcroot::GcRoot;
use crate::Result;
use async_trait::async_trait;
use nix_bisect_protocol::{BuildTarget, CancelToken};
use std::collections::BTreeMap;

/// What `nix-store --realise --dry-run` says would happen.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DryRun {
    pub to_build: Vec<String>,
    pub to_fetch: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildOptions {
    /// Keep building independent derivations after one fails.
    pub keep_going: bool,
    /// Rebuild already-valid outputs.
    pub check: bool,
    pub options: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct BuildReport {
    pub success: bool,
    pub outputs: Vec<String>,
    /// Combined build output.
    pub log: String,
    /// Derivations whose builders failed, in the order they were reported.
    pub failed: Vec<String>,
}

/// The build tool as seen by the classifier.
#[async_trait]
pub trait BuildTool: Send + Sync {
    /// Evaluate `target` to a derivation path. Evaluation errors are reported
    /// as [`NixError::Instantiation`](crate::NixError::Instantiation).
    async fn instantiate(&self, target: &BuildTarget, cancel: &CancelToken) -> Result<String>;

    async fn dry_run(&self, drvs: &[String], cancel: &CancelToken) -> Result<DryRun>;

    /// Immediate input derivations of `drv`.
    async fn references(&self, drv: &str, cancel: &CancelToken) -> Result<Vec<String>>;

    async fn build(
        &self,
        drvs: &[String],
        options: &BuildOptions,
        cancel: &CancelToken,
    ) -> Result<BuildReport>;

    /// Stored build log of `drv`, if the tool has one.
    async fn read_log(&self, drv: &str, cancel: &CancelToken) -> Result<Option<String>>;

    /// True when every path is a valid store path.
    async fn is_valid(&self, paths: &[String], cancel: &CancelToken) -> Result<bool>;

    /// Pin `target` against garbage collection until the returned root drops.
    fn add_root(&self, name: &str, target: &str) -> GcRoot;
}

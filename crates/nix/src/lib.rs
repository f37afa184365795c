//! # nix-bisect nix
//!
//! Everything nix-bisect knows about the build tool.
//!
//! ## Pipeline
//!
//! ```text
//! BuildTarget
//!     │
//!     ├──> Cache lookup (identity = revision + picks + target + mode)
//!     │      └─> hit: cached outcome (successes re-verified in the store)
//!     │
//!     ├──> nix-instantiate ──> InstantiationFailure
//!     │
//!     ├──> nix-store --realise --dry-run ──> rebuild budget / blacklist
//!     │
//!     ├──> build immediate input derivations ──> DependencyFailure
//!     │
//!     └──> build target ──> Success | TargetFailure (+ failure line check)
//! ```
//!
//! The [`BuildTool`] trait is the seam to the real `nix` binaries
//! ([`NixCli`]); the [`Classifier`] only talks to the trait.

mod cache;
mod classifier;
mod cli;
mod error;
mod gcroot;
mod parse;
mod tool;

pub use cache::{BuildCache, BuildIdentity, BuildMode, CacheEntry, Evidence, CACHE_SCHEMA_VERSION};
pub use classifier::{BuildSubject, Classification, Classifier, ClassifyRequest};
pub use cli::{nix_prompts, NixCli};
pub use error::{NixError, Result};
pub use gcroot::{gcroot_name, GcRoot, GcRootDir};
pub use parse::{parse_dry_run, parse_failed_builds};
pub use tool::{BuildOptions, BuildReport, BuildTool, DryRun};

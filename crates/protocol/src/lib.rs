//! Data model shared by the nix-bisect crates.
//!
//! Everything here is plain data: revisions, build targets, classified build
//! outcomes and the four-way verdict contract (`good`, `bad`, `skip`,
//! `abort`) that sits between the classifier and the bisection engine.

use anyhow::Result;
use serde::Serialize;

mod cancel;
mod outcome;
mod revision;
mod target;
mod verdict;

pub use cancel::CancelToken;
pub use outcome::{store_name, AbortReason, BuildOutcome, BuildStatus, LineCheck};
pub use revision::Revision;
pub use target::BuildTarget;
pub use verdict::{
    Action, ActionPolicy, Verdict, EXIT_ABORT, EXIT_BAD, EXIT_GOOD, EXIT_SKIP,
};

pub const STATE_SCHEMA_VERSION: u32 = 1;

pub fn serialize_json_pretty<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string_pretty(value).map_err(Into::into)
}

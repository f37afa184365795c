//! # nix-bisect engine
//!
//! The extended bisection: a pure [`BisectState`] over the linearized
//! ancestry path between a good and a bad revision, and the
//! [`BisectRunner`] that drives it against a working tree.
//!
//! ## Phases
//!
//! ```text
//! Searching ──(candidates left)──> Test(midpoint)
//!     │
//!     ├──(good + 1 == bad)──> Converged { first_bad }
//!     │
//!     ├──(only a named skip range below bad)──> ResolvingSkipRange
//!     │        └─> ProposePatch(unbreak) ──> picked | unresolvable
//!     │
//!     └──(only skips left)──> Exhausted { suspects }
//!
//! any phase ──(cancel / abort verdict)──> Aborted ──(resume)──> previous phase
//! ```
//!
//! State is persisted after every transition by the [`StateStore`], under a
//! [`WorktreeLock`] that keeps two bisections off the same tree.

mod error;
mod judge;
mod lock;
mod runner;
mod state;
mod store;

pub use error::{EngineError, Result};
pub use judge::{ClassifierJudge, Judge, Judgement};
pub use lock::WorktreeLock;
pub use runner::{BisectRunner, Progress, RunEnd, RunSummary};
pub use state::{BisectState, Conclusion, Phase, SkipRange, Step, Transition};
pub use store::{Session, StateStore};

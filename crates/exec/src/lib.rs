//! # nix-bisect exec
//!
//! Subprocesses are treated as byte-stream producers. Output is consumed as
//! it arrives so callers can watch progress line by line, interactive
//! prompts are answered from a [`ResponseTable`], and a
//! [`CancelToken`](nix_bisect_protocol::CancelToken) terminates the child
//! promptly.
//!
//! ```no_run
//! use nix_bisect_exec::{run, CommandSpec, ResponseTable};
//! use nix_bisect_protocol::CancelToken;
//!
//! # async fn demo() -> nix_bisect_exec::Result<()> {
//! let table = ResponseTable::new().reply(r"\(y/N\)\?\s*$", "n")?;
//! let spec = CommandSpec::new("nix-store")
//!     .arg("--realise")
//!     .arg("/nix/store/...-hello.drv")
//!     .responses(table);
//! let output = run(&spec, &CancelToken::new()).await?;
//! println!("exit {:?}", output.code);
//! # Ok(())
//! # }
//! ```

mod error;
mod prompt;
mod runner;

pub use error::{ExecError, Result};
pub use prompt::{PromptResponse, PromptRule, ResponseTable};
pub use runner::{run, run_streaming, CommandSpec, Output, Stream};

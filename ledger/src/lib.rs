//! Persistent task ledger and state machine for agent-driven engineering work.
//!
//! A task moves through a fixed state graph (`PLANNING` to `COMPLETED`, with a
//! `FAILED_RETRY`/`ROLLBACK` recovery loop). Every transition, failure and
//! snapshot is recorded in a SQLite store so a new agent session can resume
//! where the last one stopped. The crate keeps a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (state graph, retry policy,
//!   signature normalization, next-action hints). No I/O.
//! - **[`io`]**: The SQLite store, failure memory, canonical tracking, config
//!   and project layout.
//!
//! [`machine`] and [`resume`] compose the two; [`ops`] exposes the closed
//! operation set behind the uniform [`envelope`].

pub mod core;
pub mod envelope;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod machine;
pub mod ops;
pub mod resume;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

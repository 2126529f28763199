//! Deterministic, pure logic shared by the ledger.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod graph;
pub mod invariants;
pub mod policy;
pub mod recommend;
pub mod signature;
pub mod types;

//! Side-effecting layer: the SQLite store, config and project layout.

pub mod canonical;
pub mod config;
pub mod failure_memory;
pub mod init;
pub mod payload;
pub mod store;

//! Safety Guardian - layered safety policy for automated file organization
//!
//! This crate provides:
//! - A seven-layer policy pipeline that judges proposed moves, renames,
//!   deletes and copies before they are executed
//! - A hash-chained, append-only audit log of verdicts
//! - Per-destination locking and last-instant re-validation for executors
//! - TOML configuration with XDG path resolution

pub mod cli;
pub mod concurrency;
pub mod config;
pub mod paths;
pub mod safety;

pub use config::Config;

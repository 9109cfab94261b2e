//! Errors that mean "no verdict can be trusted" or "state changed since the
//! verdict". Ordinary policy violations are findings, never errors.

use std::path::PathBuf;
use thiserror::Error;

/// The guardian could not produce a trustworthy verdict.
///
/// The executor must treat any of these as "do not proceed".
#[derive(Debug, Error)]
pub enum EvaluationInfrastructureError {
    #[error("Invalid guardian configuration: {0}")]
    InvalidConfig(String),

    #[error("Filesystem unreachable at {path}: {reason}")]
    FilesystemUnavailable { path: PathBuf, reason: String },

    #[error("Audit log unwritable: {0}")]
    AuditUnavailable(String),
}

/// The last-instant recheck before execution failed.
#[derive(Debug, Error)]
pub enum RevalidationError {
    #[error("Operation was not approved by the guardian")]
    NotApproved,

    #[error("Source no longer exists: {0}")]
    SourceMissing(PathBuf),

    #[error("Source is locked by another process: {0}")]
    SourceLocked(PathBuf),

    #[error("Destination appeared since evaluation: {0}")]
    DestinationConflict(PathBuf),

    #[error("Not enough space at {path}: need {needed} bytes, {available} available")]
    InsufficientSpace {
        path: PathBuf,
        needed: u64,
        available: u64,
    },

    #[error("Filesystem probe timed out: {0}")]
    ProbeTimeout(String),

    #[error("Failed to acquire destination lock for {path}: {reason}")]
    Lock { path: PathBuf, reason: String },
}

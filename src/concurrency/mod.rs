//! Cross-task and cross-process coordination.

mod destination_lock;

pub use destination_lock::{DestinationLockGuard, DestinationLocks};

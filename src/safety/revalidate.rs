//! Last-instant recheck before the executor touches the filesystem.
//!
//! Only state that can change with time is rechecked: source existence,
//! source lock, new destination conflicts, and free space. Path, system,
//! application and logic verdicts cannot go stale and are not re-run.

use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::error::RevalidationError;
use super::guardian::EvaluationResult;
use super::operation::{Operation, OperationKind};
use super::probe::{self, LockState};
use crate::concurrency::{DestinationLockGuard, DestinationLocks};
use crate::config::GuardianConfig;

/// Proof that an operation passed re-validation. Holds the destination lock
/// until dropped; drop it once the physical operation has completed or
/// failed.
#[derive(Debug)]
pub struct ExecutionPermit {
    guard: DestinationLockGuard,
}

impl ExecutionPermit {
    /// The directory this permit has exclusive use of.
    pub fn directory(&self) -> &Path {
        self.guard.directory()
    }
}

#[derive(Debug)]
struct Current {
    source_exists: bool,
    source_size: Option<u64>,
    source_lock: LockState,
    destination_exists: bool,
    available: Option<u64>,
    same_device: bool,
}

impl Current {
    fn observe(source: &Path, destination: &Path, kind: OperationKind) -> Self {
        let writes = kind.writes_destination();
        Self {
            source_exists: source.exists(),
            source_size: probe::file_size(source),
            source_lock: probe::lock_state(source),
            destination_exists: writes && std::fs::symlink_metadata(destination).is_ok(),
            available: writes
                .then(|| probe::available_space(destination).ok())
                .flatten(),
            same_device: same_device(source, destination),
        }
    }

    /// Compare live state with what the verdict assumed.
    fn check(
        &self,
        operation: &Operation,
        result: &EvaluationResult,
    ) -> Result<(), RevalidationError> {
        if !self.source_exists {
            return Err(RevalidationError::SourceMissing(operation.source().to_path_buf()));
        }
        if self.source_lock == LockState::Held {
            return Err(RevalidationError::SourceLocked(operation.source().to_path_buf()));
        }
        if self.destination_exists && !result.snapshot.destination_exists {
            warn!("Destination appeared after evaluation: {}", operation.destination().display());
            return Err(RevalidationError::DestinationConflict(
                operation.destination().to_path_buf(),
            ));
        }

        let needs_space = match operation.kind() {
            OperationKind::Copy => true,
            OperationKind::Move | OperationKind::Rename => !self.same_device,
            OperationKind::Delete => false,
        };
        if needs_space
            && let (Some(needed), Some(available)) = (self.source_size, self.available)
            && needed > available
        {
            return Err(RevalidationError::InsufficientSpace {
                path: operation.destination().to_path_buf(),
                needed,
                available,
            });
        }
        Ok(())
    }
}

#[cfg(unix)]
fn same_device(source: &Path, destination: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;

    let Some(dest_dir) = crate::safety::pathutil::nearest_existing_ancestor(destination) else {
        return false;
    };
    match (std::fs::metadata(source), std::fs::metadata(dest_dir)) {
        (Ok(a), Ok(b)) => a.dev() == b.dev(),
        _ => false,
    }
}

#[cfg(not(unix))]
fn same_device(_source: &Path, _destination: &Path) -> bool {
    false
}

/// Directory whose lock guards the operation: where the file lands, or
/// where it is removed from for deletes.
fn lock_directory(operation: &Operation) -> PathBuf {
    let target = if operation.kind().writes_destination() {
        operation.destination()
    } else {
        operation.source()
    };
    target
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(target)
        .to_path_buf()
}

/// Rechecks approved operations under the per-destination lock.
#[derive(Clone)]
pub struct Revalidator {
    locks: DestinationLocks,
}

impl Revalidator {
    pub fn new(locks: DestinationLocks) -> Self {
        Self { locks }
    }

    /// Acquire the destination lock and confirm the verdict still holds.
    pub async fn revalidate(
        &self,
        operation: &Operation,
        result: &EvaluationResult,
        config: &GuardianConfig,
    ) -> Result<ExecutionPermit, RevalidationError> {
        if !result.approved {
            return Err(RevalidationError::NotApproved);
        }

        let resolved = operation.resolve_paths(config.base_destination_path().as_deref());
        let operation = &resolved;

        let directory = lock_directory(operation);
        let guard = self
            .locks
            .acquire(&directory)
            .await
            .map_err(|e| RevalidationError::Lock {
                path: directory.clone(),
                reason: format!("{:#}", e),
            })?;

        let kind = operation.kind();
        let source = operation.source().to_path_buf();
        let destination = operation.destination().to_path_buf();
        let current = probe::bounded("revalidation probe", config.probe_timeout(), move || {
            Current::observe(&source, &destination, kind)
        })
        .await
        .map_err(|e| RevalidationError::ProbeTimeout(e.to_string()))?;

        debug!(?current, "revalidating {}", operation);
        current.check(operation, result)?;

        Ok(ExecutionPermit { guard })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::safety::guardian::{FilesystemSnapshot, Guardian};
    use crate::safety::operation::Classification;
    use crate::safety::probe::test_support::StalledPool;
    use crate::safety::threat::Severity;
    use fs2::FileExt;

    struct Fixture {
        _tmp: tempfile::TempDir,
        revalidator: Revalidator,
        source: PathBuf,
        destination: PathBuf,
    }

    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("downloads/report.pdf");
        std::fs::create_dir_all(source.parent().unwrap()).unwrap();
        std::fs::write(&source, b"%PDF-1.4").unwrap();
        let destination = tmp.path().join("documents/report.pdf");
        let locks = DestinationLocks::in_dir(tmp.path().join("locks")).unwrap();
        Fixture {
            revalidator: Revalidator::new(locks),
            source,
            destination,
            _tmp: tmp,
        }
    }

    fn operation(f: &Fixture) -> Operation {
        Operation::new(
            &f.source,
            &f.destination,
            OperationKind::Move,
            Classification::new("documents", 0.95),
        )
    }

    async fn approved(op: &Operation, config: &GuardianConfig) -> EvaluationResult {
        let result = Guardian::new(None).evaluate(op.clone(), config).await.unwrap();
        assert!(result.approved, "{}", result.summary());
        result
    }

    #[tokio::test]
    async fn unchanged_state_yields_permit() {
        let f = fixture();
        let config = GuardianConfig::default();
        let op = operation(&f);
        let result = approved(&op, &config).await;

        let permit = f.revalidator.revalidate(&op, &result, &config).await.unwrap();
        assert_eq!(permit.directory(), f.destination.parent().unwrap());
    }

    #[tokio::test]
    async fn blocked_result_is_rejected() {
        let f = fixture();
        let config = GuardianConfig::default();
        let op = operation(&f);
        let mut result = approved(&op, &config).await;
        result.approved = false;

        let err = f.revalidator.revalidate(&op, &result, &config).await.unwrap_err();
        assert!(matches!(err, RevalidationError::NotApproved));
    }

    #[tokio::test]
    async fn vanished_source_is_rejected() {
        let f = fixture();
        let config = GuardianConfig::default();
        let op = operation(&f);
        let result = approved(&op, &config).await;

        std::fs::remove_file(&f.source).unwrap();
        let err = f.revalidator.revalidate(&op, &result, &config).await.unwrap_err();
        assert!(matches!(err, RevalidationError::SourceMissing(_)));
    }

    #[tokio::test]
    async fn newly_locked_source_is_rejected() {
        let f = fixture();
        let config = GuardianConfig::default();
        let op = operation(&f);
        let result = approved(&op, &config).await;

        let holder = std::fs::File::open(&f.source).unwrap();
        holder.lock_exclusive().unwrap();
        let err = f.revalidator.revalidate(&op, &result, &config).await.unwrap_err();
        assert!(matches!(err, RevalidationError::SourceLocked(_)));
        FileExt::unlock(&holder).unwrap();
    }

    #[tokio::test]
    async fn new_destination_conflict_is_rejected() {
        let f = fixture();
        let config = GuardianConfig::default();
        let op = operation(&f);
        let result = approved(&op, &config).await;

        std::fs::create_dir_all(f.destination.parent().unwrap()).unwrap();
        std::fs::write(&f.destination, b"someone else").unwrap();
        let err = f.revalidator.revalidate(&op, &result, &config).await.unwrap_err();
        assert!(matches!(err, RevalidationError::DestinationConflict(_)));
    }

    #[tokio::test]
    async fn known_conflict_is_not_new() {
        let f = fixture();
        std::fs::create_dir_all(f.destination.parent().unwrap()).unwrap();
        std::fs::write(&f.destination, b"old").unwrap();
        let config = GuardianConfig {
            auto_approve_caution: true,
            ..GuardianConfig::default()
        };
        let op = operation(&f);
        let result = approved(&op, &config).await;
        assert!(result.snapshot.destination_exists);

        assert!(f.revalidator.revalidate(&op, &result, &config).await.is_ok());
    }

    #[tokio::test]
    async fn permit_holds_destination_lock() {
        let f = fixture();
        let config = GuardianConfig::default();
        let op = operation(&f);
        let result = approved(&op, &config).await;

        let permit = f.revalidator.revalidate(&op, &result, &config).await.unwrap();
        assert!(
            f.revalidator
                .locks
                .try_acquire(f.destination.parent().unwrap())
                .unwrap()
                .is_none()
        );
        drop(permit);
        assert!(
            f.revalidator
                .locks
                .try_acquire(f.destination.parent().unwrap())
                .unwrap()
                .is_some()
        );
    }

    fn safe_result() -> EvaluationResult {
        EvaluationResult {
            approved: true,
            risk_level: Severity::Safe,
            findings: Vec::new(),
            blocked: false,
            blocked_reason: None,
            evaluated_at: chrono::Utc::now(),
            elevated: false,
            dry_run: false,
            layers_evaluated: Vec::new(),
            snapshot: FilesystemSnapshot::default(),
        }
    }

    fn live(size: u64, available: u64, same_device: bool) -> Current {
        Current {
            source_exists: true,
            source_size: Some(size),
            source_lock: LockState::Free,
            destination_exists: false,
            available: Some(available),
            same_device,
        }
    }

    fn kind_op(kind: OperationKind) -> Operation {
        Operation::new(
            "/inbox/video.mkv",
            "/archive/video.mkv",
            kind,
            Classification::new("videos", 0.9),
        )
    }

    #[test]
    fn copy_without_room_is_rejected() {
        let err = live(10_000, 500, true)
            .check(&kind_op(OperationKind::Copy), &safe_result())
            .unwrap_err();
        assert!(matches!(
            err,
            RevalidationError::InsufficientSpace {
                needed: 10_000,
                available: 500,
                ..
            }
        ));
    }

    #[test]
    fn moves_need_room_only_across_devices() {
        let result = safe_result();
        let op = kind_op(OperationKind::Move);
        assert!(live(10_000, 500, true).check(&op, &result).is_ok());
        assert!(matches!(
            live(10_000, 500, false).check(&op, &result),
            Err(RevalidationError::InsufficientSpace { .. })
        ));
        assert!(
            live(10_000, 500, false)
                .check(&kind_op(OperationKind::Delete), &result)
                .is_ok()
        );
    }

    #[test]
    fn stalled_filesystem_times_out_revalidation() {
        let f = fixture();
        let op = operation(&f);
        let result = tokio::runtime::Runtime::new()
            .unwrap()
            .block_on(approved(&op, &GuardianConfig::default()));

        let pool = StalledPool::new();
        let config = GuardianConfig {
            probe_timeout_ms: 50,
            ..GuardianConfig::default()
        };
        let err = pool
            .runtime
            .block_on(f.revalidator.revalidate(&op, &result, &config))
            .unwrap_err();
        assert!(matches!(err, RevalidationError::ProbeTimeout(_)));
    }
}

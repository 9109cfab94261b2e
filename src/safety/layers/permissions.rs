//! Layer 6: can the process actually perform the operation right now?

use anyhow::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::{Layer, LayerContext, LayerId, application_protection, system_protection};
use crate::config::GuardianConfig;
use crate::safety::pathutil;
use crate::safety::probe::{self, Access, LockState};
use crate::safety::threat::{Severity, ThreatFinding, ThreatType};

/// Severity for a failed check on `path`: CRITICAL when the protective layers
/// would block the path outright, HIGH_RISK otherwise.
fn failure_severity(path: &Path, config: &GuardianConfig) -> Severity {
    let system_critical = system_protection(path, config)
        .is_some_and(|hit| !hit.built_in || config.block_system_files);
    let app_critical = config.block_app_files && application_protection(path).is_some();
    if system_critical || app_critical {
        Severity::Critical
    } else {
        Severity::HighRisk
    }
}

pub struct PermissionLayer;

impl PermissionLayer {
    /// Run one probe; a timeout or failure is itself a finding.
    async fn check<F>(
        ctx: &LayerContext<'_>,
        what: &str,
        target: &Path,
        findings: &mut Vec<ThreatFinding>,
        probe_fn: F,
    ) -> Option<bool>
    where
        F: FnOnce() -> bool + Send + 'static,
    {
        match probe::bounded(what, ctx.config.probe_timeout(), probe_fn).await {
            Ok(ok) => Some(ok),
            Err(e) => {
                warn!(path = %target.display(), "{}", e);
                findings.push(ThreatFinding::new(
                    LayerId::Permissions,
                    ThreatType::PermissionDenied,
                    failure_severity(target, ctx.config),
                    format!("Could not verify access to {}: {}", target.display(), e),
                ));
                None
            }
        }
    }

    fn denied(ctx: &LayerContext<'_>, target: &Path, message: String) -> ThreatFinding {
        ThreatFinding::new(
            LayerId::Permissions,
            ThreatType::PermissionDenied,
            failure_severity(target, ctx.config),
            message,
        )
    }
}

#[async_trait]
impl Layer for PermissionLayer {
    fn id(&self) -> LayerId {
        LayerId::Permissions
    }

    async fn evaluate(&self, ctx: &LayerContext<'_>) -> Result<Vec<ThreatFinding>> {
        let op = ctx.operation;
        let kind = op.kind();
        let source: PathBuf = op.source().to_path_buf();
        let mut findings = Vec::new();

        let readable = {
            let path = source.clone();
            Self::check(ctx, "source read check", &source, &mut findings, move || {
                probe::has_access(&path, Access::Read)
            })
            .await
        };
        if readable == Some(false) {
            findings.push(Self::denied(
                ctx,
                &source,
                format!("No read permission for source: {}", source.display()),
            ));
        }

        if kind.vacates_source()
            && let Some(parent) = source.parent().filter(|p| !p.as_os_str().is_empty())
        {
            let parent = parent.to_path_buf();
            let path = parent.clone();
            let writable = Self::check(ctx, "source directory write check", &source, &mut findings, move || {
                probe::has_access(&path, Access::Write)
            })
            .await;
            if writable == Some(false) {
                findings.push(Self::denied(
                    ctx,
                    &source,
                    format!(
                        "No write permission for source directory {}; cannot {} the file",
                        parent.display(),
                        kind
                    ),
                ));
            }
        }

        if kind.writes_destination() {
            let destination = op.destination().to_path_buf();
            let path = destination.clone();
            let writable = Self::check(ctx, "destination write check", &destination, &mut findings, move || {
                pathutil::nearest_existing_ancestor(path.parent().unwrap_or(path.as_path()))
                    .is_some_and(|dir| probe::has_access(&dir, Access::Write))
            })
            .await;
            if writable == Some(false) {
                findings.push(Self::denied(
                    ctx,
                    &destination,
                    format!(
                        "No write permission for destination directory of {}",
                        destination.display()
                    ),
                ));
            }
        }

        if readable == Some(true) {
            let path = source.clone();
            let locked = Self::check(ctx, "source lock check", &source, &mut findings, move || {
                probe::lock_state(&path) == LockState::Held
            })
            .await;
            if locked == Some(true) {
                findings.push(Self::denied(
                    ctx,
                    &source,
                    format!("Source is locked by another process: {}", source.display()),
                ));
            }
        }

        debug!(findings = findings.len(), "permissions checked");
        Ok(findings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::safety::layers::test_support::{op, run};
    use crate::safety::operation::OperationKind;
    use crate::safety::probe::test_support::StalledPool;
    use fs2::FileExt;

    #[tokio::test]
    async fn accessible_paths_are_clean() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("a.txt");
        std::fs::write(&source, b"x").unwrap();
        let op = op(&source, &tmp.path().join("new/dir/a.txt"), OperationKind::Move);
        assert!(run(&PermissionLayer, &op, &GuardianConfig::default()).await.is_empty());
    }

    #[tokio::test]
    async fn missing_source_is_denied() {
        let tmp = tempfile::tempdir().unwrap();
        let op = op(&tmp.path().join("gone.txt"), &tmp.path().join("b.txt"), OperationKind::Move);
        let findings = run(&PermissionLayer, &op, &GuardianConfig::default()).await;
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].threat, ThreatType::PermissionDenied);
        assert_eq!(findings[0].severity, Severity::HighRisk);
    }

    #[tokio::test]
    async fn locked_source_is_denied() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("busy.db");
        std::fs::write(&source, b"x").unwrap();
        let holder = std::fs::File::open(&source).unwrap();
        holder.lock_exclusive().unwrap();

        let op = op(&source, &tmp.path().join("out/busy.db"), OperationKind::Move);
        let findings = run(&PermissionLayer, &op, &GuardianConfig::default()).await;
        assert_eq!(findings.len(), 1);
        assert!(findings[0].message.contains("locked"));

        FileExt::unlock(&holder).unwrap();
    }

    #[test]
    fn protected_targets_escalate_to_critical() {
        let config = GuardianConfig::default();
        assert_eq!(failure_severity(Path::new("/etc/shadow"), &config), Severity::Critical);
        assert_eq!(
            failure_severity(Path::new("/opt/acme/acme.exe"), &config),
            Severity::Critical
        );
        assert_eq!(
            failure_severity(Path::new("/home/u/notes.txt"), &config),
            Severity::HighRisk
        );

        let relaxed = GuardianConfig {
            block_system_files: false,
            ..GuardianConfig::default()
        };
        assert_eq!(failure_severity(Path::new("/etc/shadow"), &relaxed), Severity::HighRisk);
    }

    #[test]
    fn stalled_checks_are_permission_findings() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("a.txt");
        std::fs::write(&source, b"x").unwrap();
        let config = GuardianConfig {
            probe_timeout_ms: 50,
            ..GuardianConfig::default()
        };
        let pool = StalledPool::new();

        let ordinary = op(&source, &tmp.path().join("out/a.txt"), OperationKind::Move);
        let findings = pool.runtime.block_on(run(&PermissionLayer, &ordinary, &config));
        assert_eq!(findings.len(), 3);
        assert!(findings.iter().all(|f| {
            f.threat == ThreatType::PermissionDenied
                && f.severity == Severity::HighRisk
                && f.message.contains("timed out")
        }));

        let protected = op(
            Path::new("/etc/shadow"),
            &tmp.path().join("shadow"),
            OperationKind::Move,
        );
        let findings = pool.runtime.block_on(run(&PermissionLayer, &protected, &config));
        assert!(findings.iter().any(|f| f.severity == Severity::Critical));
    }
}

//! Layer 1: traversal segments, control characters, base-directory escape.

use anyhow::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::{Layer, LayerContext, LayerId};
use crate::safety::pathutil::{self, is_within, normalize};
use crate::safety::probe;
use crate::safety::threat::{Severity, ThreatFinding, ThreatType};

pub struct PathSecurityLayer;

impl PathSecurityLayer {
    fn finding(message: String) -> ThreatFinding {
        ThreatFinding::new(
            LayerId::PathSecurity,
            ThreatType::PathTraversal,
            Severity::Critical,
            message,
        )
    }

    fn lexical_checks(label: &str, path: &Path, findings: &mut Vec<ThreatFinding>) {
        if pathutil::has_traversal(path) {
            findings.push(Self::finding(format!(
                "{} contains '..' (path traversal pattern): {}",
                label,
                path.display()
            )));
        }
        if let Some(c) = pathutil::control_char(path) {
            findings.push(Self::finding(format!(
                "{} contains control character {:?}",
                label, c
            )));
        }
    }
}

#[async_trait]
impl Layer for PathSecurityLayer {
    fn id(&self) -> LayerId {
        LayerId::PathSecurity
    }

    async fn evaluate(&self, ctx: &LayerContext<'_>) -> Result<Vec<ThreatFinding>> {
        let op = ctx.operation;
        let mut findings = Vec::new();

        Self::lexical_checks("Source", op.source(), &mut findings);
        if !op.kind().writes_destination() {
            return Ok(findings);
        }
        Self::lexical_checks("Destination", op.destination(), &mut findings);

        let Some(base) = ctx.config.base_destination_path() else {
            return Ok(findings);
        };

        let destination = if op.destination().is_absolute() {
            op.destination().to_path_buf()
        } else {
            base.join(op.destination())
        };

        if !is_within(&destination, &base) {
            findings.push(Self::finding(format!(
                "Destination escapes base directory: {} is outside {}",
                op.destination().display(),
                base.display()
            )));
            return Ok(findings);
        }

        // Lexically inside; make sure no symlink on the existing part of the
        // path points back out.
        let resolved = probe::bounded("resolve destination", ctx.config.probe_timeout(), {
            let destination = destination.clone();
            let base = base.clone();
            move || resolve_real(&destination, &base)
        })
        .await?;

        if let Some((real_ancestor, real_base)) = resolved
            && !real_ancestor.starts_with(&real_base)
        {
            findings.push(Self::finding(format!(
                "Destination resolves outside base directory through a link: {} -> {}",
                destination.display(),
                real_ancestor.display()
            )));
        }

        debug!(findings = findings.len(), "path security checked");
        Ok(findings)
    }
}

/// Canonical forms of the destination's nearest existing ancestor and the
/// base, when both exist and the ancestor sits at or below the base.
fn resolve_real(destination: &Path, base: &Path) -> Option<(PathBuf, PathBuf)> {
    let real_base = base.canonicalize().ok()?;
    let ancestor = pathutil::nearest_existing_ancestor(&normalize(destination))?;
    if !is_within(&ancestor, base) {
        return None;
    }
    let real_ancestor = ancestor.canonicalize().ok()?;
    Some((real_ancestor, real_base))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GuardianConfig;
    use crate::safety::layers::test_support::{op, run};
    use crate::safety::operation::OperationKind;

    fn config_with_base(base: &Path) -> GuardianConfig {
        GuardianConfig {
            base_destination: Some(base.to_string_lossy().to_string()),
            ..GuardianConfig::default()
        }
    }

    #[tokio::test]
    async fn traversal_in_destination_is_critical() {
        let op = op(
            Path::new("/downloads/file.txt"),
            Path::new("/documents/../../etc/passwd"),
            OperationKind::Move,
        );
        let findings = run(&PathSecurityLayer, &op, &GuardianConfig::default()).await;
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].threat, ThreatType::PathTraversal);
        assert_eq!(findings[0].severity, Severity::Critical);
    }

    #[tokio::test]
    async fn null_byte_is_critical() {
        let op = op(
            Path::new("/downloads/file.txt"),
            Path::new("/documents/fi\0le.txt"),
            OperationKind::Move,
        );
        let findings = run(&PathSecurityLayer, &op, &GuardianConfig::default()).await;
        assert!(findings.iter().any(|f| f.message.contains("control character")));
    }

    #[tokio::test]
    async fn clean_paths_pass_without_base() {
        let op = op(
            Path::new("/downloads/invoice.pdf"),
            Path::new("/documents/finance/invoice.pdf"),
            OperationKind::Move,
        );
        assert!(run(&PathSecurityLayer, &op, &GuardianConfig::default()).await.is_empty());
    }

    #[tokio::test]
    async fn destination_outside_base_is_critical() {
        let tmp = tempfile::tempdir().unwrap();
        let base = tmp.path().join("organized");
        std::fs::create_dir_all(&base).unwrap();

        let op = op(
            &tmp.path().join("in.txt"),
            &tmp.path().join("elsewhere/in.txt"),
            OperationKind::Move,
        );
        let findings = run(&PathSecurityLayer, &op, &config_with_base(&base)).await;
        assert_eq!(findings.len(), 1);
        assert!(findings[0].message.contains("escapes base directory"));
    }

    #[tokio::test]
    async fn relative_destination_is_joined_to_base() {
        let tmp = tempfile::tempdir().unwrap();
        let op = op(
            &tmp.path().join("in.txt"),
            Path::new("documents/in.txt"),
            OperationKind::Move,
        );
        assert!(run(&PathSecurityLayer, &op, &config_with_base(tmp.path())).await.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlink_escape_is_critical() {
        let tmp = tempfile::tempdir().unwrap();
        let base = tmp.path().join("organized");
        let outside = tmp.path().join("outside");
        std::fs::create_dir_all(&base).unwrap();
        std::fs::create_dir_all(&outside).unwrap();
        std::os::unix::fs::symlink(&outside, base.join("link")).unwrap();

        let op = op(
            &tmp.path().join("in.txt"),
            &base.join("link/in.txt"),
            OperationKind::Move,
        );
        let findings = run(&PathSecurityLayer, &op, &config_with_base(&base)).await;
        assert_eq!(findings.len(), 1);
        assert!(findings[0].message.contains("through a link"));
    }

    #[tokio::test]
    async fn delete_ignores_destination() {
        let op = op(
            Path::new("/downloads/old.txt"),
            Path::new("../../weird"),
            OperationKind::Delete,
        );
        assert!(run(&PathSecurityLayer, &op, &GuardianConfig::default()).await.is_empty());
    }
}

//! Layer 5: does the proposed destination make sense for this file?

use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;
use tracing::debug;

use super::{Layer, LayerContext, LayerId};
use crate::config::GuardianConfig;
use crate::safety::pathutil;
use crate::safety::threat::{Severity, ThreatFinding, ThreatType};

fn warning(message: String) -> ThreatFinding {
    ThreatFinding::new(
        LayerId::LogicValidation,
        ThreatType::LogicWarning,
        Severity::Caution,
        message,
    )
}

/// Categories the file is being routed to: the classifier's category plus
/// any destination directory named after a known category.
fn target_categories(category: &str, destination: &Path, config: &GuardianConfig) -> Vec<String> {
    let mut targets = Vec::new();
    let category = category.trim().to_lowercase();
    if config.category_extensions.contains_key(&category) {
        targets.push(category);
    }

    if let Some(parent) = destination.parent() {
        for component in parent.components() {
            let name = component.as_os_str().to_string_lossy().to_lowercase();
            if config.category_extensions.contains_key(&name) && !targets.contains(&name) {
                targets.push(name);
            }
        }
    }
    targets
}

/// The category that claims `ext`, if any.
fn owning_category<'a>(ext: &str, config: &'a GuardianConfig) -> Option<&'a str> {
    config
        .category_extensions
        .iter()
        .find(|(_, exts)| exts.iter().any(|e| e.eq_ignore_ascii_case(ext)))
        .map(|(category, _)| category.as_str())
}

pub struct LogicValidationLayer;

#[async_trait]
impl Layer for LogicValidationLayer {
    fn id(&self) -> LayerId {
        LayerId::LogicValidation
    }

    async fn evaluate(&self, ctx: &LayerContext<'_>) -> Result<Vec<ThreatFinding>> {
        let op = ctx.operation;
        let config = ctx.config;
        let classification = op.classification();
        let mut findings = Vec::new();

        if classification.confidence < config.min_confidence_threshold {
            findings.push(warning(format!(
                "Classification confidence is low ({:.2} < {:.2}); the destination may be wrong",
                classification.confidence, config.min_confidence_threshold
            )));
        }

        if !op.kind().writes_destination() {
            return Ok(findings);
        }

        let length = op.destination().to_string_lossy().chars().count();
        if length > config.max_path_length {
            findings.push(warning(format!(
                "Destination path is very long ({} chars, limit {})",
                length, config.max_path_length
            )));
        }

        let ext = pathutil::extension(op.destination()).or_else(|| pathutil::extension(op.source()));
        if let Some(ext) = ext
            && let Some(owner) = owning_category(&ext, config)
        {
            let targets = target_categories(&classification.category, op.destination(), config);
            if let Some(target) = targets.iter().find(|t| t.as_str() != owner) {
                findings.push(warning(format!(
                    ".{} file ({}) routed to {}; verify the classification",
                    ext, owner, target
                )));
            }
        }

        debug!(findings = findings.len(), "logic checked");
        Ok(findings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::safety::layers::test_support::run;
    use crate::safety::operation::{Classification, Operation, OperationKind};

    fn classified(dest: &str, category: &str, confidence: f64) -> Operation {
        Operation::new(
            Path::new("/downloads/file"),
            Path::new(dest),
            OperationKind::Move,
            Classification::new(category, confidence),
        )
    }

    #[tokio::test]
    async fn confident_matching_route_is_clean() {
        let op = classified("/documents/finance/invoice.pdf", "documents", 0.95);
        assert!(run(&LogicValidationLayer, &op, &GuardianConfig::default()).await.is_empty());
    }

    #[tokio::test]
    async fn low_confidence_warns() {
        let op = classified("/documents/invoice.pdf", "documents", 0.4);
        let findings = run(&LogicValidationLayer, &op, &GuardianConfig::default()).await;
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].threat, ThreatType::LogicWarning);
        assert_eq!(findings[0].severity, Severity::Caution);
    }

    #[tokio::test]
    async fn video_routed_to_documents_warns() {
        let op = classified("/home/u/Documents/holiday.mp4", "videos", 0.9);
        let findings = run(&LogicValidationLayer, &op, &GuardianConfig::default()).await;
        assert_eq!(findings.len(), 1);
        assert!(findings[0].message.contains("routed to documents"));
    }

    #[tokio::test]
    async fn classifier_category_mismatch_warns() {
        let op = classified("/sorted/song.mp3", "pictures", 0.9);
        let findings = run(&LogicValidationLayer, &op, &GuardianConfig::default()).await;
        assert_eq!(findings.len(), 1);
    }

    #[tokio::test]
    async fn unknown_extension_is_not_a_mismatch() {
        let op = classified("/documents/data.xyz", "documents", 0.9);
        assert!(run(&LogicValidationLayer, &op, &GuardianConfig::default()).await.is_empty());
    }

    #[tokio::test]
    async fn long_destination_warns() {
        let config = GuardianConfig {
            max_path_length: 20,
            ..GuardianConfig::default()
        };
        let op = classified("/documents/a/very/long/path/report.pdf", "documents", 0.9);
        let findings = run(&LogicValidationLayer, &op, &config).await;
        assert_eq!(findings.len(), 1);
        assert!(findings[0].message.contains("very long"));
    }
}

//! Layer 4: conflicts, destructive overwrites, large deletes, no-op moves.

use anyhow::Result;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::{Layer, LayerContext, LayerId};
use crate::safety::operation::OperationKind;
use crate::safety::pathutil::normalize;
use crate::safety::probe;
use crate::safety::threat::{Severity, ThreatFinding, ThreatType};

const MB: f64 = 1024.0 * 1024.0;
const GB: f64 = MB * 1024.0;

/// Filesystem facts this layer needs, collected in one blocking probe.
#[derive(Debug, Default)]
struct Observed {
    source_size: Option<u64>,
    destination_exists: bool,
    destination_size: Option<u64>,
    destination_free: Option<u64>,
}

impl Observed {
    fn collect(source: &Path, destination: &Path, kind: OperationKind) -> Self {
        let mut observed = Observed {
            source_size: probe::file_size(source),
            ..Observed::default()
        };
        if !kind.writes_destination() {
            return observed;
        }
        observed.destination_exists = std::fs::symlink_metadata(destination).is_ok();
        observed.destination_size = probe::file_size(destination);
        if kind == OperationKind::Copy {
            observed.destination_free = probe::available_space(destination).ok();
        }
        observed
    }
}

fn finding(severity: Severity, message: String) -> ThreatFinding {
    ThreatFinding::new(LayerId::DataLoss, ThreatType::DataLoss, severity, message)
}

pub struct DataLossLayer;

#[async_trait]
impl Layer for DataLossLayer {
    fn id(&self) -> LayerId {
        LayerId::DataLoss
    }

    async fn evaluate(&self, ctx: &LayerContext<'_>) -> Result<Vec<ThreatFinding>> {
        let op = ctx.operation;
        let config = ctx.config;
        let kind = op.kind();
        let mut findings = Vec::new();

        if kind.writes_destination() && normalize(op.source()) == normalize(op.destination()) {
            findings.push(finding(
                Severity::Caution,
                format!(
                    "File is already at destination location (no-op): {}",
                    op.destination().display()
                ),
            ));
            return Ok(findings);
        }

        let observed = probe::bounded("data loss probe", config.probe_timeout(), {
            let source: PathBuf = op.source().to_path_buf();
            let destination: PathBuf = op.destination().to_path_buf();
            move || Observed::collect(&source, &destination, kind)
        })
        .await?;

        if kind == OperationKind::Delete {
            if let Some(size) = observed.source_size
                && size > config.large_delete_threshold_bytes()
            {
                findings.push(finding(
                    Severity::HighRisk,
                    format!(
                        "Deleting large file ({:.1} MB); it cannot be recovered by the organizer",
                        size as f64 / MB
                    ),
                ));
            }
            return Ok(findings);
        }

        if observed.destination_exists {
            findings.push(finding(
                Severity::Caution,
                format!("Destination already exists: {}", op.destination().display()),
            ));
        }

        if let (Some(src), Some(dst)) = (observed.source_size, observed.destination_size)
            && dst as f64 > src as f64 * config.overwrite_size_ratio
        {
            findings.push(finding(
                Severity::HighRisk,
                format!(
                    "Destination file is significantly larger ({} vs {} bytes); overwriting it loses data",
                    dst, src
                ),
            ));
        }

        if let (Some(size), Some(free)) = (observed.source_size, observed.destination_free) {
            let remaining = free.saturating_sub(size);
            if size > free {
                findings.push(finding(
                    Severity::HighRisk,
                    format!(
                        "Not enough space for copy: needs {} bytes, {} available",
                        size, free
                    ),
                ));
            } else if remaining < config.warn_threshold_bytes() {
                findings.push(finding(
                    Severity::Caution,
                    format!(
                        "Copy leaves only {:.2} GB free on the destination volume",
                        remaining as f64 / GB
                    ),
                ));
            }
        }

        debug!(findings = findings.len(), "data loss checked");
        Ok(findings)
    }
}

//! The orchestrator: runs the layers, folds findings, applies the decision
//! matrix and records the verdict.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::audit::AuditLog;
use super::error::EvaluationInfrastructureError;
use super::layers::{Layer, LayerContext, LayerId, default_layers};
use super::operation::Operation;
use super::probe::{self, ProbeError};
use super::reasoner::Reasoner;
use super::threat::{RiskLevel, Severity, ThreatFinding, ThreatType, risk_level};
use crate::config::GuardianConfig;

/// Why an operation was not approved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    ConfirmationRequired,
    ApprovalRequired,
    ElevatedApprovalRequired,
    CriticalThreat,
}

impl BlockReason {
    /// CRITICAL blocks cannot be lifted by re-submitting with approval.
    pub fn is_permanent(&self) -> bool {
        matches!(self, BlockReason::CriticalThreat)
    }
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BlockReason::ConfirmationRequired => "confirmation required",
            BlockReason::ApprovalRequired => "approval required",
            BlockReason::ElevatedApprovalRequired => "elevated approval required",
            BlockReason::CriticalThreat => "critical threat",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedAction {
    Proceed,
    RequestConfirmation,
    RequireExplicitApproval,
    ProceedWithCaution,
    BlockOperation,
}

impl fmt::Display for RecommendedAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RecommendedAction::Proceed => "proceed",
            RecommendedAction::RequestConfirmation => "request_confirmation",
            RecommendedAction::RequireExplicitApproval => "require_explicit_approval",
            RecommendedAction::ProceedWithCaution => "proceed_with_caution",
            RecommendedAction::BlockOperation => "block_operation",
        })
    }
}

/// Filesystem state observed at evaluation time, used by the re-validator
/// to tell new conflicts from ones the verdict already accounted for.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesystemSnapshot {
    pub source_exists: bool,
    pub source_size: Option<u64>,
    pub destination_exists: bool,
}

impl FilesystemSnapshot {
    fn capture(source: &std::path::Path, destination: &std::path::Path, writes: bool) -> Self {
        Self {
            source_exists: source.exists(),
            source_size: probe::file_size(source),
            destination_exists: writes && std::fs::symlink_metadata(destination).is_ok(),
        }
    }
}

/// The guardian's verdict on one operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub approved: bool,
    pub risk_level: RiskLevel,
    /// In layer execution order.
    pub findings: Vec<ThreatFinding>,
    pub blocked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_reason: Option<BlockReason>,
    pub evaluated_at: DateTime<Utc>,
    /// HIGH_RISK approved through an override.
    #[serde(default)]
    pub elevated: bool,
    #[serde(default)]
    pub dry_run: bool,
    pub layers_evaluated: Vec<LayerId>,
    #[serde(default)]
    pub snapshot: FilesystemSnapshot,
}

impl EvaluationResult {
    pub fn recommended_action(&self) -> RecommendedAction {
        match self.risk_level {
            Severity::Critical => RecommendedAction::BlockOperation,
            Severity::HighRisk if self.approved => RecommendedAction::ProceedWithCaution,
            Severity::HighRisk => RecommendedAction::RequireExplicitApproval,
            Severity::Caution if self.approved => RecommendedAction::ProceedWithCaution,
            Severity::Caution => RecommendedAction::RequestConfirmation,
            Severity::Safe => RecommendedAction::Proceed,
        }
    }

    pub fn is_permanently_blocked(&self) -> bool {
        self.blocked_reason.is_some_and(|r| r.is_permanent())
    }

    pub fn has_threat(&self, threat: ThreatType) -> bool {
        self.findings.iter().any(|f| f.threat == threat)
    }

    /// Human-readable explanation of the verdict.
    pub fn summary(&self) -> String {
        let mut lines = vec![format!("Risk level: {}", self.risk_level)];

        if !self.findings.is_empty() {
            lines.push(String::new());
            lines.push(format!("Findings ({}):", self.findings.len()));
            for f in self.findings.iter().take(5) {
                lines.push(format!("  - [{}] {}: {}", f.severity, f.threat, f.message));
            }
            if self.findings.len() > 5 {
                lines.push(format!("  ... and {} more", self.findings.len() - 5));
            }
        }

        lines.push(String::new());
        lines.push(match (self.risk_level, self.blocked_reason) {
            (Severity::Critical, _) => {
                "OPERATION BLOCKED: critical safety concerns detected.".to_string()
            }
            (_, Some(reason)) => format!("BLOCKED: {}.", reason),
            (Severity::HighRisk, None) => "HIGH RISK: approved by explicit override.".to_string(),
            (Severity::Caution, None) => "CAUTION: review recommended before proceeding.".to_string(),
            (Severity::Safe, None) => "Operation appears safe to proceed.".to_string(),
        });

        lines.join("\n")
    }
}

/// Outcome of the decision matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub approved: bool,
    pub elevated: bool,
    pub blocked_reason: Option<BlockReason>,
}

impl Decision {
    fn approve(elevated: bool) -> Self {
        Self {
            approved: true,
            elevated,
            blocked_reason: None,
        }
    }

    fn block(reason: BlockReason) -> Self {
        Self {
            approved: false,
            elevated: false,
            blocked_reason: Some(reason),
        }
    }
}

/// The decision matrix. The only place approval is decided.
pub fn decide(risk: RiskLevel, operation: &Operation, config: &GuardianConfig) -> Decision {
    match risk {
        Severity::Safe => Decision::approve(false),
        Severity::Caution => {
            if operation.user_approved() || config.auto_approve_caution {
                Decision::approve(false)
            } else {
                Decision::block(BlockReason::ConfirmationRequired)
            }
        }
        Severity::HighRisk => {
            if !operation.user_approved() {
                Decision::block(BlockReason::ApprovalRequired)
            } else if config.require_user_approval_high_risk || operation.elevated_approval() {
                Decision::approve(true)
            } else {
                Decision::block(BlockReason::ElevatedApprovalRequired)
            }
        }
        Severity::Critical => Decision::block(BlockReason::CriticalThreat),
    }
}

/// A failed layer becomes a HIGH_RISK finding; probe timeouts are reported
/// as permission problems.
fn layer_failure(id: LayerId, error: &anyhow::Error) -> ThreatFinding {
    warn!(layer = %id, "Layer failed: {:#}", error);
    let threat = match error.downcast_ref::<ProbeError>() {
        Some(ProbeError::Timeout { .. }) => ThreatType::PermissionDenied,
        _ => id.threat_type(),
    };
    ThreatFinding::new(
        id,
        threat,
        Severity::HighRisk,
        format!("{} check could not complete: {:#}", id, error),
    )
}

/// Runs every layer over an operation and renders the verdict.
pub struct Guardian {
    layers: Vec<Box<dyn Layer>>,
    audit: Option<AuditLog>,
}

impl Guardian {
    pub fn new(reasoner: Option<Arc<dyn Reasoner>>) -> Self {
        Self::with_layers(default_layers(reasoner))
    }

    /// Custom layer stack, run in the given order.
    pub fn with_layers(layers: Vec<Box<dyn Layer>>) -> Self {
        Self {
            layers,
            audit: None,
        }
    }

    pub fn with_audit_log(mut self, audit: AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn audit_log(&self) -> Option<&AuditLog> {
        self.audit.as_ref()
    }

    /// Evaluate one operation. Layer failures become findings; only
    /// conditions under which no verdict can be trusted are errors.
    pub async fn evaluate(
        &self,
        operation: Operation,
        config: &GuardianConfig,
    ) -> Result<EvaluationResult, EvaluationInfrastructureError> {
        config
            .validate()
            .map_err(|e| EvaluationInfrastructureError::InvalidConfig(format!("{:#}", e)))?;
        check_base_destination(config).await?;

        let operation = operation.resolve_paths(config.base_destination_path().as_deref());
        debug!("Evaluating {}", operation);
        let snapshot = capture_snapshot(&operation, config).await;

        let mut findings: Vec<ThreatFinding> = Vec::new();
        let mut layers_evaluated = Vec::new();

        for layer in &self.layers {
            let id = layer.id();
            if !config.enabled && !id.is_protective() {
                continue;
            }

            let outcome = {
                let ctx = LayerContext {
                    operation: &operation,
                    config,
                    prior: &findings,
                };
                layer.evaluate(&ctx).await
            };
            layers_evaluated.push(id);

            let produced = match outcome {
                Ok(found) => found,
                Err(e) => vec![layer_failure(id, &e)],
            };
            let critical = produced.iter().any(ThreatFinding::is_critical);
            findings.extend(produced);

            if critical {
                debug!(layer = %id, "Critical finding, skipping remaining layers");
                break;
            }
        }

        let risk = risk_level(&findings);
        let decision = decide(risk, &operation, config);

        let result = EvaluationResult {
            approved: decision.approved,
            risk_level: risk,
            findings,
            blocked: !decision.approved,
            blocked_reason: decision.blocked_reason,
            evaluated_at: Utc::now(),
            elevated: decision.elevated,
            dry_run: config.dry_run,
            layers_evaluated,
            snapshot,
        };

        match result.blocked_reason {
            Some(reason) => warn!(
                risk = %risk,
                findings = result.findings.len(),
                "BLOCKED ({}): {}",
                reason,
                operation
            ),
            None => info!(risk = %risk, elevated = result.elevated, "APPROVED: {}", operation),
        }

        if let Some(audit) = &self.audit
            && (risk >= Severity::Caution || config.log_safe_evaluations)
        {
            audit.record(&operation, &result).await?;
        }

        Ok(result)
    }
}

/// A base destination that exists or is merely missing is fine; anything
/// else means the filesystem cannot be trusted.
async fn check_base_destination(config: &GuardianConfig) -> Result<(), EvaluationInfrastructureError> {
    let Some(base) = config.base_destination_path() else {
        return Ok(());
    };

    let probe_path: PathBuf = base.clone();
    let stat = probe::bounded("stat base destination", config.probe_timeout(), move || {
        std::fs::metadata(&probe_path).map(|_| ())
    })
    .await;

    let reason = match stat {
        Ok(Ok(())) => return Ok(()),
        Ok(Err(e)) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Ok(Err(e)) => e.to_string(),
        Err(e) => e.to_string(),
    };
    Err(EvaluationInfrastructureError::FilesystemUnavailable { path: base, reason })
}

async fn capture_snapshot(operation: &Operation, config: &GuardianConfig) -> FilesystemSnapshot {
    let source = operation.source().to_path_buf();
    let destination = operation.destination().to_path_buf();
    let writes = operation.kind().writes_destination();

    match probe::bounded("snapshot", config.probe_timeout(), move || {
        FilesystemSnapshot::capture(&source, &destination, writes)
    })
    .await
    {
        Ok(snapshot) => snapshot,
        Err(e) => {
            warn!("Could not capture filesystem snapshot: {}", e);
            FilesystemSnapshot::default()
        }
    }
}

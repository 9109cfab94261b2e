//! Policy layers.
//!
//! Each layer is an independent check behind the [`Layer`] trait. Layers
//! only emit findings; the guardian alone decides approval. A layer that
//! returns `Err` is converted into a HIGH_RISK finding of its
//! [`LayerId::threat_type`] by the guardian, so layers can use `?` freely.

mod app_integrity;
mod data_loss;
mod logic;
mod path_security;
mod permissions;
mod reasoning;
mod system_files;

pub use app_integrity::{ApplicationIntegrityLayer, application_protection};
pub use data_loss::DataLossLayer;
pub use logic::LogicValidationLayer;
pub use path_security::PathSecurityLayer;
pub use permissions::PermissionLayer;
pub use reasoning::ReasoningLayer;
pub use system_files::{SystemProtectionLayer, system_protection};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use super::operation::Operation;
use super::reasoner::Reasoner;
use super::threat::{Severity, ThreatFinding, ThreatType, risk_level};
use crate::config::GuardianConfig;

/// Stable identifier of a layer, recorded on every finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerId {
    PathSecurity,
    SystemProtection,
    ApplicationIntegrity,
    DataLoss,
    LogicValidation,
    Permissions,
    AiReasoning,
}

impl LayerId {
    /// Threat type used when the layer itself fails.
    pub fn threat_type(&self) -> ThreatType {
        match self {
            LayerId::PathSecurity => ThreatType::PathTraversal,
            LayerId::SystemProtection => ThreatType::SystemFile,
            LayerId::ApplicationIntegrity => ThreatType::ApplicationFile,
            LayerId::DataLoss => ThreatType::DataLoss,
            LayerId::LogicValidation => ThreatType::LogicWarning,
            LayerId::Permissions => ThreatType::PermissionDenied,
            LayerId::AiReasoning => ThreatType::AiFlagged,
        }
    }

    /// Layers that run even when the guardian is disabled, because they
    /// can produce non-overridable verdicts on their own.
    pub fn is_protective(&self) -> bool {
        matches!(
            self,
            LayerId::PathSecurity | LayerId::SystemProtection | LayerId::ApplicationIntegrity
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LayerId::PathSecurity => "path_security",
            LayerId::SystemProtection => "system_protection",
            LayerId::ApplicationIntegrity => "application_integrity",
            LayerId::DataLoss => "data_loss",
            LayerId::LogicValidation => "logic_validation",
            LayerId::Permissions => "permissions",
            LayerId::AiReasoning => "ai_reasoning",
        }
    }
}

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a layer may look at.
pub struct LayerContext<'a> {
    pub operation: &'a Operation,
    pub config: &'a GuardianConfig,
    /// Findings from layers that already ran, in execution order.
    pub prior: &'a [ThreatFinding],
}

impl LayerContext<'_> {
    pub fn running_risk(&self) -> Severity {
        risk_level(self.prior)
    }
}

#[async_trait]
pub trait Layer: Send + Sync {
    fn id(&self) -> LayerId;

    async fn evaluate(&self, ctx: &LayerContext<'_>) -> Result<Vec<ThreatFinding>>;
}

/// The seven layers in their fixed execution order.
pub fn default_layers(reasoner: Option<Arc<dyn Reasoner>>) -> Vec<Box<dyn Layer>> {
    vec![
        Box::new(PathSecurityLayer),
        Box::new(SystemProtectionLayer),
        Box::new(ApplicationIntegrityLayer),
        Box::new(DataLossLayer),
        Box::new(LogicValidationLayer),
        Box::new(PermissionLayer),
        Box::new(ReasoningLayer::new(reasoner)),
    ]
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_stack_order_is_fixed() {
        let ids: Vec<LayerId> = default_layers(None).iter().map(|l| l.id()).collect();
        assert_eq!(
            ids,
            vec![
                LayerId::PathSecurity,
                LayerId::SystemProtection,
                LayerId::ApplicationIntegrity,
                LayerId::DataLoss,
                LayerId::LogicValidation,
                LayerId::Permissions,
                LayerId::AiReasoning,
            ]
        );
    }

    #[test]
    fn only_first_three_layers_are_protective() {
        let protective: Vec<LayerId> = default_layers(None)
            .iter()
            .map(|l| l.id())
            .filter(LayerId::is_protective)
            .collect();
        assert_eq!(protective.len(), 3);
    }
}

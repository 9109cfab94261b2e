//! Layer 7: escalate already-suspicious operations to the reasoner.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{Layer, LayerContext, LayerId};
use crate::safety::reasoner::{Reasoner, ReasoningRequest};
use crate::safety::threat::{Severity, ThreatFinding, ThreatType};

pub struct ReasoningLayer {
    reasoner: Option<Arc<dyn Reasoner>>,
}

impl ReasoningLayer {
    pub fn new(reasoner: Option<Arc<dyn Reasoner>>) -> Self {
        Self { reasoner }
    }

    fn flagged(severity: Severity, message: String) -> ThreatFinding {
        ThreatFinding::new(LayerId::AiReasoning, ThreatType::AiFlagged, severity, message)
    }
}

#[async_trait]
impl Layer for ReasoningLayer {
    fn id(&self) -> LayerId {
        LayerId::AiReasoning
    }

    async fn evaluate(&self, ctx: &LayerContext<'_>) -> Result<Vec<ThreatFinding>> {
        if !ctx.config.use_ai_reasoning || ctx.running_risk() < Severity::Caution {
            return Ok(Vec::new());
        }

        let Some(reasoner) = &self.reasoner else {
            warn!("AI reasoning enabled but no reasoner is configured");
            return Ok(vec![Self::flagged(
                Severity::HighRisk,
                "AI reasoning is enabled but unavailable; manual review required".to_string(),
            )]);
        };

        let request = ReasoningRequest {
            operation: ctx.operation.clone(),
            findings: ctx.prior.to_vec(),
        };
        let timeout = ctx.config.reasoning_timeout();

        let finding = match tokio::time::timeout(timeout, reasoner.reason(request)).await {
            Ok(Ok(verdict)) => {
                debug!(severity = %verdict.severity, "reasoner verdict");
                let message = if verdict.message.is_empty() {
                    format!("AI review rated the operation {}", verdict.severity)
                } else {
                    format!("AI review: {}", verdict.message)
                };
                Self::flagged(verdict.severity, message)
            }
            Ok(Err(e)) => {
                warn!("Reasoner failed: {:#}", e);
                Self::flagged(
                    Severity::HighRisk,
                    format!("AI reasoning failed ({}); manual review required", e),
                )
            }
            Err(_) => {
                warn!("Reasoner timed out after {}s", timeout.as_secs());
                Self::flagged(
                    Severity::HighRisk,
                    format!(
                        "AI reasoning timed out after {}s; manual review required",
                        timeout.as_secs()
                    ),
                )
            }
        };

        Ok(vec![finding])
    }
}

//! External reasoning collaborator consulted by the last layer.
//!
//! The guardian only depends on the [`Reasoner`] trait. The Ollama backend is
//! the one shipped implementation; tests substitute a mock.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::debug;

use super::operation::Operation;
use super::threat::{Severity, ThreatFinding};
use crate::config::ReasoningConfig;

/// Everything the reasoner gets to see.
#[derive(Debug, Clone, Serialize)]
pub struct ReasoningRequest {
    pub operation: Operation,
    pub findings: Vec<ThreatFinding>,
}

/// The collaborator's judgment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReasoningVerdict {
    pub severity: Severity,
    pub message: String,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Reasoner: Send + Sync {
    async fn reason(&self, request: ReasoningRequest) -> Result<ReasoningVerdict>;
}

/// Build the configured reasoner, `None` when reasoning is not configured.
pub fn create_reasoner(config: &ReasoningConfig) -> Result<Option<Arc<dyn Reasoner>>> {
    match config.provider.trim().to_lowercase().as_str() {
        "" | "none" => Ok(None),
        "ollama" => Ok(Some(Arc::new(OllamaReasoner::new(
            &config.endpoint,
            &config.model,
        )?))),
        other => anyhow::bail!("Unknown reasoning provider: {}", other),
    }
}

pub struct OllamaReasoner {
    client: Client,
    endpoint: String,
    model: String,
}

impl OllamaReasoner {
    pub fn new(endpoint: &str, model: &str) -> Result<Self> {
        Ok(Self {
            client: Client::new(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            model: model.to_string(),
        })
    }

    fn build_prompt(request: &ReasoningRequest) -> String {
        let op = &request.operation;
        let mut findings = String::new();
        for f in &request.findings {
            findings.push_str(&format!(
                "- [{}] {} ({}): {}\n",
                f.severity, f.threat, f.layer, f.message
            ));
        }
        if findings.is_empty() {
            findings.push_str("- none\n");
        }

        format!(
            "You are the final safety reviewer for a file organizer. Decide whether \
this file operation is safe.\n\n\
OPERATION:\n\
- kind: {}\n\
- source: {}\n\
- destination: {}\n\
- category: {} (confidence {:.2})\n\n\
FINDINGS FROM PREVIOUS CHECKS:\n{}\n\
Consider whether the operation could break the operating system or an \
application, cause data loss, or route the file somewhere illogical.\n\n\
Respond with JSON only: {{\"final_risk_level\": \"safe|caution|high_risk|critical\", \
\"reasoning\": \"one or two sentences\"}}",
            op.kind(),
            op.source().display(),
            op.destination().display(),
            op.classification().category,
            op.classification().confidence,
            findings
        )
    }
}

/// Parse the model's reply, tolerating a fenced ```json block.
fn parse_verdict(text: &str) -> Result<ReasoningVerdict> {
    let trimmed = text.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .map(|rest| rest.trim_end().trim_end_matches("```"))
        .unwrap_or(trimmed)
        .trim();

    let value: Value = serde_json::from_str(body).context("Reasoner reply is not JSON")?;
    let level = value["final_risk_level"]
        .as_str()
        .context("Reasoner reply is missing final_risk_level")?;
    let severity = Severity::parse(level)
        .with_context(|| format!("Unknown risk level from reasoner: {}", level))?;
    let message = value["reasoning"].as_str().unwrap_or("").trim().to_string();

    Ok(ReasoningVerdict { severity, message })
}

#[async_trait]
impl Reasoner for OllamaReasoner {
    async fn reason(&self, request: ReasoningRequest) -> Result<ReasoningVerdict> {
        let body = json!({
            "model": self.model,
            "prompt": Self::build_prompt(&request),
            "stream": false,
            "format": "json"
        });

        debug!("Ollama reasoning request for {}", request.operation);

        let response = self
            .client
            .post(format!("{}/api/generate", self.endpoint))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .context("Ollama request failed")?
            .error_for_status()
            .context("Ollama returned an error status")?;

        let response_body: Value = response.json().await?;
        let text = response_body["response"]
            .as_str()
            .context("Ollama reply has no response field")?;

        parse_verdict(text)
    }
}

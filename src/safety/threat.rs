//! Threat taxonomy shared by every layer.
//!
//! Findings are plain values: a layer produces them, the guardian collects
//! them in execution order, and [`risk_level`] folds them into one verdict.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::layers::LayerId;

/// What kind of problem a finding describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ThreatType {
    PathTraversal,
    SystemFile,
    ApplicationFile,
    DataLoss,
    LogicWarning,
    PermissionDenied,
    AiFlagged,
}

impl ThreatType {
    pub const ALL: [ThreatType; 7] = [
        ThreatType::PathTraversal,
        ThreatType::SystemFile,
        ThreatType::ApplicationFile,
        ThreatType::DataLoss,
        ThreatType::LogicWarning,
        ThreatType::PermissionDenied,
        ThreatType::AiFlagged,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ThreatType::PathTraversal => "PATH_TRAVERSAL",
            ThreatType::SystemFile => "SYSTEM_FILE",
            ThreatType::ApplicationFile => "APPLICATION_FILE",
            ThreatType::DataLoss => "DATA_LOSS",
            ThreatType::LogicWarning => "LOGIC_WARNING",
            ThreatType::PermissionDenied => "PERMISSION_DENIED",
            ThreatType::AiFlagged => "AI_FLAGGED",
        }
    }
}

impl fmt::Display for ThreatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity lattice. Variant order is the total order used for aggregation:
/// `Safe < Caution < HighRisk < Critical`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    #[default]
    Safe,
    Caution,
    HighRisk,
    Critical,
}

/// The aggregate of all findings for one operation uses the same lattice.
pub type RiskLevel = Severity;

impl Severity {
    pub const ALL: [Severity; 4] = [
        Severity::Safe,
        Severity::Caution,
        Severity::HighRisk,
        Severity::Critical,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Safe => "safe",
            Severity::Caution => "caution",
            Severity::HighRisk => "high_risk",
            Severity::Critical => "critical",
        }
    }

    /// Lenient parse used for collaborator replies (`"high"` and `"medium"`
    /// are accepted as aliases).
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().replace(['-', ' '], "_").as_str() {
            "safe" | "none" | "low" => Some(Severity::Safe),
            "caution" | "medium" | "warning" => Some(Severity::Caution),
            "high_risk" | "high" => Some(Severity::HighRisk),
            "critical" => Some(Severity::Critical),
            _ => None,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed, severity-tagged observation about an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreatFinding {
    pub threat: ThreatType,
    pub severity: Severity,
    pub message: String,
    pub layer: LayerId,
}

impl ThreatFinding {
    pub fn new(
        layer: LayerId,
        threat: ThreatType,
        severity: Severity,
        message: impl Into<String>,
    ) -> Self {
        Self {
            threat,
            severity,
            message: message.into(),
            layer,
        }
    }

    pub fn is_critical(&self) -> bool {
        self.severity == Severity::Critical
    }
}

/// Aggregate severity: the maximum over all findings, `Safe` when empty.
///
/// Monotonic: adding a finding can only raise or hold the result.
pub fn risk_level(findings: &[ThreatFinding]) -> RiskLevel {
    findings
        .iter()
        .map(|f| f.severity)
        .max()
        .unwrap_or(Severity::Safe)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finding(severity: Severity) -> ThreatFinding {
        ThreatFinding::new(
            LayerId::LogicValidation,
            ThreatType::LogicWarning,
            severity,
            "test",
        )
    }

    #[test]
    fn severity_total_order() {
        assert!(Severity::Safe < Severity::Caution);
        assert!(Severity::Caution < Severity::HighRisk);
        assert!(Severity::HighRisk < Severity::Critical);
    }

    #[test]
    fn empty_findings_are_safe() {
        assert_eq!(risk_level(&[]), Severity::Safe);
    }

    #[test]
    fn risk_level_is_max_severity() {
        let findings = vec![
            finding(Severity::Caution),
            finding(Severity::Critical),
            finding(Severity::HighRisk),
        ];
        assert_eq!(risk_level(&findings), Severity::Critical);
    }

    #[test]
    fn risk_level_is_monotonic() {
        let mut findings = Vec::new();
        let mut previous = risk_level(&findings);
        for severity in [
            Severity::HighRisk,
            Severity::Safe,
            Severity::Caution,
            Severity::Critical,
            Severity::Safe,
        ] {
            findings.push(finding(severity));
            let current = risk_level(&findings);
            assert!(current >= previous, "{current} dropped below {previous}");
            previous = current;
        }
    }

    #[test]
    fn risk_level_ignores_order() {
        let mut findings = vec![
            finding(Severity::Caution),
            finding(Severity::HighRisk),
            finding(Severity::Safe),
        ];
        let forward = risk_level(&findings);
        findings.reverse();
        assert_eq!(forward, risk_level(&findings));
    }

    #[test]
    fn lenient_severity_parse() {
        assert_eq!(Severity::parse("HIGH_RISK"), Some(Severity::HighRisk));
        assert_eq!(Severity::parse("high"), Some(Severity::HighRisk));
        assert_eq!(Severity::parse("medium"), Some(Severity::Caution));
        assert_eq!(Severity::parse(" critical "), Some(Severity::Critical));
        assert_eq!(Severity::parse("bogus"), None);
    }

    #[test]
    fn threat_types_serialize_screaming_snake_case() {
        let json = serde_json::to_string(&ThreatType::PathTraversal).unwrap();
        assert_eq!(json, "\"PATH_TRAVERSAL\"");
        let json = serde_json::to_string(&Severity::HighRisk).unwrap();
        assert_eq!(json, "\"high_risk\"");
    }
}

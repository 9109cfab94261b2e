//! The proposed file mutation handed to the guardian by the classifier.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Kind of file mutation being proposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Move,
    Rename,
    Delete,
    Copy,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Move => "move",
            OperationKind::Rename => "rename",
            OperationKind::Delete => "delete",
            OperationKind::Copy => "copy",
        }
    }

    /// Whether the operation removes the source from its current directory.
    pub fn vacates_source(&self) -> bool {
        !matches!(self, OperationKind::Copy)
    }

    /// Whether the operation writes something at the destination path.
    pub fn writes_destination(&self) -> bool {
        !matches!(self, OperationKind::Delete)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "move" => Ok(OperationKind::Move),
            "rename" => Ok(OperationKind::Rename),
            "delete" => Ok(OperationKind::Delete),
            "copy" => Ok(OperationKind::Copy),
            other => anyhow::bail!("Unknown operation kind: {}", other),
        }
    }
}

/// Classifier output summarised for the guardian.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub category: String,
    /// Confidence score in `0.0..=1.0`; out-of-range input is clamped.
    #[serde(deserialize_with = "deserialize_confidence")]
    pub confidence: f64,
}

impl Classification {
    pub fn new(category: impl Into<String>, confidence: f64) -> Self {
        Self {
            category: category.into(),
            confidence: clamp_confidence(confidence),
        }
    }
}

fn clamp_confidence(confidence: f64) -> f64 {
    if confidence.is_nan() {
        0.0
    } else {
        confidence.clamp(0.0, 1.0)
    }
}

fn deserialize_confidence<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    f64::deserialize(deserializer).map(clamp_confidence)
}

/// A proposed file operation. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    source: PathBuf,
    destination: PathBuf,
    kind: OperationKind,
    classification: Classification,
    user_approved: bool,
    #[serde(default)]
    elevated_approval: bool,
    created_at: DateTime<Utc>,
}

impl Operation {
    pub fn new(
        source: impl Into<PathBuf>,
        destination: impl Into<PathBuf>,
        kind: OperationKind,
        classification: Classification,
    ) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            kind,
            classification,
            user_approved: false,
            elevated_approval: false,
            created_at: Utc::now(),
        }
    }

    /// Mark the operation as explicitly approved by the user.
    pub fn with_user_approval(mut self, approved: bool) -> Self {
        self.user_approved = approved;
        self
    }

    /// Mark the approval as coming from an elevated (admin) principal.
    /// Implies user approval.
    pub fn with_elevated_approval(mut self, elevated: bool) -> Self {
        self.elevated_approval = elevated;
        if elevated {
            self.user_approved = true;
        }
        self
    }

    /// Anchor relative paths: the destination under `base` (or the working
    /// directory when no base is configured), the source under the working
    /// directory. Every check and the executor then see the same paths.
    /// `..` segments are kept for the traversal check.
    pub fn resolve_paths(&self, base: Option<&Path>) -> Operation {
        let cwd = std::env::current_dir().ok();
        let mut resolved = self.clone();
        resolved.source = anchor(&self.source, cwd.as_deref());
        resolved.destination = if self.kind.writes_destination() {
            anchor(&self.destination, base.or(cwd.as_deref()))
        } else {
            anchor(&self.destination, cwd.as_deref())
        };
        resolved
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn classification(&self) -> &Classification {
        &self.classification
    }

    pub fn user_approved(&self) -> bool {
        self.user_approved
    }

    pub fn elevated_approval(&self) -> bool {
        self.elevated_approval
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

fn anchor(path: &Path, root: Option<&Path>) -> PathBuf {
    match root {
        Some(root) if path.is_relative() => root.join(path),
        _ => path.to_path_buf(),
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} -> {}",
            self.kind,
            self.source.display(),
            self.destination.display()
        )
    }
}

//! # Safety Guardian
//!
//! The last checkpoint between a file organizer's proposed operation and
//! the filesystem. Every move, rename, delete or copy is run through seven
//! independent policy layers; the findings are folded into one risk level
//! and a fixed decision matrix renders the verdict.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │  guardian.rs: Guardian::evaluate, decision matrix, verdict       │
//! ├──────────────────────────────────────────────────────────────────┤
//! │  layers/  1 path_security   2 system_files   3 app_integrity     │
//! │           4 data_loss       5 logic          6 permissions       │
//! │           7 reasoning ──► reasoner.rs (Ollama or injected)       │
//! ├────────────────┬─────────────────┬───────────────────────────────┤
//! │  audit.rs      │  revalidate.rs  │  probe.rs / pathutil.rs       │
//! │  Hash-chained  │  Last-instant   │  Bounded filesystem probes,   │
//! │  JSONL, single │  recheck under  │  lexical path helpers         │
//! │  writer task   │  dest. lock     │                               │
//! └────────────────┴─────────────────┴───────────────────────────────┘
//! ```
//!
//! ## Guarantees
//!
//! 1. **CRITICAL is final**: no flag or approval turns a CRITICAL finding
//!    into an approval. Layers 1–3 run even when the guardian is disabled.
//!
//! 2. **Fail conservative**: a layer that errors contributes a HIGH_RISK
//!    finding; a reasoner that is missing, failing or slow contributes a
//!    HIGH_RISK finding. Nothing silently becomes SAFE.
//!
//! 3. **Append-only audit**: every result at CAUTION or above is written
//!    to a hash-chained log before `evaluate` returns.
//!
//! 4. **No stale verdicts**: the executor calls [`Revalidator::revalidate`]
//!    right before acting and holds the returned [`ExecutionPermit`] while
//!    it works.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use safety_guardian::safety::{AuditLog, Guardian, Operation, OperationKind, Classification};
//!
//! let guardian = Guardian::new(None).with_audit_log(AuditLog::open(paths.audit_log()));
//! let op = Operation::new(src, dest, OperationKind::Move, Classification::new("documents", 0.92));
//! let result = guardian.evaluate(op.clone(), &config.guardian).await?;
//! if result.approved {
//!     let _permit = revalidator.revalidate(&op, &result, &config.guardian).await?;
//!     std::fs::rename(op.source(), op.destination())?;
//! }
//! ```

mod audit;
mod error;
mod guardian;
pub mod layers;
mod operation;
pub(crate) mod pathutil;
pub(crate) mod probe;
mod reasoner;
mod revalidate;
mod threat;

// ── Data Model ──────────────────────────────────────────────────────

pub use self::operation::{Classification, Operation, OperationKind};
pub use self::threat::{RiskLevel, Severity, ThreatFinding, ThreatType, risk_level};

// ── Orchestrator ────────────────────────────────────────────────────

pub use self::guardian::{
    BlockReason, Decision, EvaluationResult, FilesystemSnapshot, Guardian, RecommendedAction,
    decide,
};

// ── Reasoning Collaborator ──────────────────────────────────────────

pub use self::reasoner::{
    OllamaReasoner, Reasoner, ReasoningRequest, ReasoningVerdict, create_reasoner,
};

// ── Audit Log ───────────────────────────────────────────────────────

pub use self::audit::{
    AUDIT_FILENAME, AuditEvent, AuditLog, AuditLogEntry, GUARDIAN_ID, GuardianStatistics,
    append_evaluation, blocked, count_by_risk_level, count_by_threat_type, read_audit_log,
    recent, statistics, verify_audit_chain,
};

// ── Execution ───────────────────────────────────────────────────────

pub use self::revalidate::{ExecutionPermit, Revalidator};

// ── Errors ──────────────────────────────────────────────────────────

pub use self::error::{EvaluationInfrastructureError, RevalidationError};

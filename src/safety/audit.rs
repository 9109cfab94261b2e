//! Append-only, hash-chained audit log of guardian verdicts.
//!
//! Stored at `<state_dir>/guardian.audit.jsonl`. Each line is one
//! [`AuditLogEntry`] carrying the SHA-256 of the previous line, forming a
//! tamper-evident chain.
//!
//! # Format
//!
//! | Field | Description |
//! |-------|-------------|
//! | `seq` | Zero-based line number in the log |
//! | `id` | Unique entry id |
//! | `ts` | RFC 3339 timestamp |
//! | `prev_entry_sha256` | SHA-256 of the previous JSONL line (chain link) |
//! | `event` | `evaluation` or `chain_recovery` |
//! | `blocked_by` | Always `safety_guardian` |
//! | `operation` | The evaluated operation (evaluations only) |
//! | `result` | The full evaluation result (evaluations only) |
//!
//! # Chain Integrity
//!
//! The first entry uses `000...000` (64 zeros) as `prev_entry_sha256`.
//! A corrupted trailing line is never rewritten: the next append first
//! writes a `chain_recovery` entry that links to the corrupted bytes.
//!
//! # Writers
//!
//! [`AuditLog`] owns a single writer task. Evaluations enqueue entries over a
//! channel and await the acknowledgement, so lines are never interleaved.
//! Each append also holds an advisory lock on the file for the benefit of
//! other processes writing the same log.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use super::error::EvaluationInfrastructureError;
use super::guardian::EvaluationResult;
use super::operation::Operation;
use super::threat::{RiskLevel, ThreatType};

pub const AUDIT_FILENAME: &str = "guardian.audit.jsonl";

/// Identifier recorded as `blocked_by` on every entry.
pub const GUARDIAN_ID: &str = "safety_guardian";

/// The hash used for the first entry in the chain (no predecessor).
const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

const QUEUE_DEPTH: usize = 256;

/// What an audit line records.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditEvent {
    /// A guardian verdict.
    Evaluation,
    /// Previous line corrupted, new chain segment started.
    ChainRecovery,
}

/// One line of the audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub seq: u64,
    pub id: Uuid,
    pub ts: DateTime<Utc>,
    pub prev_entry_sha256: String,
    pub event: AuditEvent,
    pub blocked_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<Operation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<EvaluationResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl AuditLogEntry {
    fn new(seq: u64, prev_entry_sha256: String, event: AuditEvent) -> Self {
        Self {
            seq,
            id: Uuid::new_v4(),
            ts: Utc::now(),
            prev_entry_sha256,
            event,
            blocked_by: GUARDIAN_ID.to_string(),
            operation: None,
            result: None,
            detail: None,
        }
    }
}

/// Append one evaluation to the log at `path`.
///
/// Reads the existing log under an exclusive advisory lock to find the
/// chain head, inserting a `ChainRecovery` entry first when the last line
/// is corrupted.
pub fn append_evaluation(
    path: &Path,
    operation: &Operation,
    result: &EvaluationResult,
) -> Result<AuditLogEntry> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let mut file = OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .open(path)
        .context("Failed to open audit log")?;
    file.lock_exclusive().context("Failed to lock audit log")?;

    let outcome = (|| -> Result<AuditLogEntry> {
        let mut content = String::new();
        file.read_to_string(&mut content)
            .context("Failed to read audit log")?;
        let lines: Vec<&str> = content.lines().filter(|l| !l.is_empty()).collect();
        let mut seq = lines.len() as u64;

        // A torn write leaves no trailing newline; terminate it so new
        // entries start on their own line.
        if !content.is_empty() && !content.ends_with('\n') {
            writeln!(file).context("Failed to write audit entry")?;
        }

        let prev_hash = match lines.last() {
            Some(last_line) if serde_json::from_str::<AuditLogEntry>(last_line).is_ok() => {
                sha256_hex(last_line.as_bytes())
            }
            Some(last_line) => {
                warn!(
                    "Audit log {} has a corrupted last line, starting new chain segment",
                    path.display()
                );
                let mut recovery = AuditLogEntry::new(
                    seq,
                    sha256_hex(last_line.as_bytes()),
                    AuditEvent::ChainRecovery,
                );
                recovery.detail = Some(format!(
                    "Previous entry corrupted ({} bytes), new chain segment",
                    last_line.len()
                ));
                let recovery_json = serde_json::to_string(&recovery)
                    .context("Failed to serialize recovery entry")?;
                writeln!(file, "{}", recovery_json).context("Failed to write audit entry")?;
                seq += 1;
                sha256_hex(recovery_json.as_bytes())
            }
            None => GENESIS_HASH.to_string(),
        };

        let mut entry = AuditLogEntry::new(seq, prev_hash, AuditEvent::Evaluation);
        entry.operation = Some(operation.clone());
        entry.result = Some(result.clone());

        let json = serde_json::to_string(&entry).context("Failed to serialize audit entry")?;
        writeln!(file, "{}", json).context("Failed to write audit entry")?;
        file.flush().context("Failed to flush audit log")?;
        Ok(entry)
    })();

    let _ = FileExt::unlock(&file);
    outcome
}

/// Read and parse all entries. Corrupted lines are skipped; a missing file
/// is an empty log.
pub fn read_audit_log(path: &Path) -> Result<Vec<AuditLogEntry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let content = fs::read_to_string(path).context("Failed to read audit log")?;
    Ok(content
        .lines()
        .filter(|l| !l.is_empty())
        .filter_map(|l| serde_json::from_str::<AuditLogEntry>(l).ok())
        .collect())
}

/// Line indices where the hash chain is broken. Empty means intact.
pub fn verify_audit_chain(path: &Path) -> Result<Vec<usize>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let content = fs::read_to_string(path).context("Failed to read audit log")?;
    let lines: Vec<&str> = content.lines().filter(|l| !l.is_empty()).collect();
    let mut broken = Vec::new();

    for (i, line) in lines.iter().enumerate() {
        let Ok(entry) = serde_json::from_str::<AuditLogEntry>(line) else {
            broken.push(i);
            continue;
        };
        let expected = if i == 0 {
            GENESIS_HASH.to_string()
        } else {
            sha256_hex(lines[i - 1].as_bytes())
        };
        if entry.prev_entry_sha256 != expected {
            broken.push(i);
        }
    }

    Ok(broken)
}

/// Findings per threat type across all recorded evaluations.
pub fn count_by_threat_type(entries: &[AuditLogEntry]) -> BTreeMap<ThreatType, usize> {
    let mut counts = BTreeMap::new();
    for result in entries.iter().filter_map(|e| e.result.as_ref()) {
        for finding in &result.findings {
            *counts.entry(finding.threat).or_insert(0) += 1;
        }
    }
    counts
}

/// Recorded evaluations per aggregate risk level.
pub fn count_by_risk_level(entries: &[AuditLogEntry]) -> BTreeMap<RiskLevel, usize> {
    let mut counts = BTreeMap::new();
    for result in entries.iter().filter_map(|e| e.result.as_ref()) {
        *counts.entry(result.risk_level).or_insert(0) += 1;
    }
    counts
}

/// The `n` most recent evaluations, newest first.
pub fn recent(entries: &[AuditLogEntry], n: usize) -> Vec<&AuditLogEntry> {
    entries
        .iter()
        .rev()
        .filter(|e| e.event == AuditEvent::Evaluation)
        .take(n)
        .collect()
}

/// Evaluations that were not approved, newest first.
pub fn blocked(entries: &[AuditLogEntry]) -> Vec<&AuditLogEntry> {
    entries
        .iter()
        .rev()
        .filter(|e| e.result.as_ref().is_some_and(|r| r.blocked))
        .collect()
}

/// Aggregate view of the audit log.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct GuardianStatistics {
    pub total_entries: usize,
    pub total_evaluations: usize,
    pub total_blocked: usize,
    pub total_approved: usize,
    pub chain_recoveries: usize,
    pub by_threat_type: BTreeMap<ThreatType, usize>,
    pub by_risk_level: BTreeMap<RiskLevel, usize>,
    /// Blocked evaluations per threat type they contained.
    pub blocked_by_threat_type: BTreeMap<ThreatType, usize>,
    pub last_entry_at: Option<DateTime<Utc>>,
}

pub fn statistics(entries: &[AuditLogEntry]) -> GuardianStatistics {
    let results: Vec<&EvaluationResult> = entries.iter().filter_map(|e| e.result.as_ref()).collect();

    let mut blocked_by_threat_type = BTreeMap::new();
    for result in results.iter().filter(|r| r.blocked) {
        let mut seen: Vec<ThreatType> = result.findings.iter().map(|f| f.threat).collect();
        seen.sort();
        seen.dedup();
        for threat in seen {
            *blocked_by_threat_type.entry(threat).or_insert(0) += 1;
        }
    }

    GuardianStatistics {
        total_entries: entries.len(),
        total_evaluations: results.len(),
        total_blocked: results.iter().filter(|r| r.blocked).count(),
        total_approved: results.iter().filter(|r| r.approved).count(),
        chain_recoveries: entries
            .iter()
            .filter(|e| e.event == AuditEvent::ChainRecovery)
            .count(),
        by_threat_type: count_by_threat_type(entries),
        by_risk_level: count_by_risk_level(entries),
        blocked_by_threat_type,
        last_entry_at: entries.last().map(|e| e.ts),
    }
}

/// Compute hex-encoded SHA-256.
fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

struct WriteRequest {
    operation: Operation,
    result: EvaluationResult,
    ack: oneshot::Sender<Result<AuditLogEntry>>,
}

/// Handle to the single audit writer task. Clones share the writer.
#[derive(Clone)]
pub struct AuditLog {
    path: PathBuf,
    tx: mpsc::Sender<WriteRequest>,
}

impl AuditLog {
    /// Spawn the writer task for the log at `path`. Must be called inside a
    /// tokio runtime.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let (tx, mut rx) = mpsc::channel::<WriteRequest>(QUEUE_DEPTH);

        let writer_path = path.clone();
        tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                let WriteRequest {
                    operation,
                    result,
                    ack,
                } = request;
                let path = writer_path.clone();
                let written = tokio::task::spawn_blocking(move || {
                    append_evaluation(&path, &operation, &result)
                })
                .await
                .unwrap_or_else(|e| Err(anyhow::anyhow!("Audit writer panicked: {}", e)));
                let _ = ack.send(written);
            }
            debug!("Audit writer for {} stopped", writer_path.display());
        });

        Self { path, tx }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Queue an evaluation and wait until it is on disk.
    pub async fn record(
        &self,
        operation: &Operation,
        result: &EvaluationResult,
    ) -> Result<AuditLogEntry, EvaluationInfrastructureError> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(WriteRequest {
                operation: operation.clone(),
                result: result.clone(),
                ack,
            })
            .await
            .map_err(|_| {
                EvaluationInfrastructureError::AuditUnavailable("audit writer stopped".to_string())
            })?;

        done.await
            .map_err(|_| {
                EvaluationInfrastructureError::AuditUnavailable(
                    "audit writer dropped the request".to_string(),
                )
            })?
            .map_err(|e| EvaluationInfrastructureError::AuditUnavailable(format!("{:#}", e)))
    }

    pub fn entries(&self) -> Result<Vec<AuditLogEntry>> {
        read_audit_log(&self.path)
    }

    pub fn statistics(&self) -> Result<GuardianStatistics> {
        Ok(statistics(&self.entries()?))
    }

    pub fn verify(&self) -> Result<Vec<usize>> {
        verify_audit_chain(&self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::safety::guardian::{BlockReason, FilesystemSnapshot};
    use crate::safety::layers::LayerId;
    use crate::safety::operation::{Classification, OperationKind};
    use crate::safety::threat::{Severity, ThreatFinding};

    fn operation() -> Operation {
        Operation::new(
            "/downloads/a.pdf",
            "/documents/a.pdf",
            OperationKind::Move,
            Classification::new("documents", 0.9),
        )
    }

    fn result(severity: Severity, threat: ThreatType) -> EvaluationResult {
        let findings = vec![ThreatFinding::new(
            LayerId::DataLoss,
            threat,
            severity,
            "test finding",
        )];
        let blocked = severity >= Severity::Caution;
        EvaluationResult {
            approved: !blocked,
            risk_level: severity,
            findings,
            blocked,
            blocked_reason: blocked.then_some(BlockReason::ConfirmationRequired),
            evaluated_at: Utc::now(),
            elevated: false,
            dry_run: false,
            layers_evaluated: vec![LayerId::DataLoss],
            snapshot: FilesystemSnapshot::default(),
        }
    }

    #[test]
    fn audit_chain_integrity() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(AUDIT_FILENAME);

        for _ in 0..5 {
            append_evaluation(&path, &operation(), &result(Severity::Caution, ThreatType::DataLoss))
                .unwrap();
        }

        let entries = read_audit_log(&path).unwrap();
        assert_eq!(entries.len(), 5);
        assert_eq!(entries[0].prev_entry_sha256, GENESIS_HASH);
        assert_eq!(entries[4].seq, 4);
        assert!(entries.iter().all(|e| e.blocked_by == GUARDIAN_ID));

        let broken = verify_audit_chain(&path).unwrap();
        assert!(broken.is_empty(), "Chain should be intact: {:?}", broken);
    }

    #[test]
    fn tampering_breaks_chain() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(AUDIT_FILENAME);
        for _ in 0..3 {
            append_evaluation(&path, &operation(), &result(Severity::Caution, ThreatType::DataLoss))
                .unwrap();
        }

        let content = fs::read_to_string(&path).unwrap();
        let mut lines: Vec<String> = content.lines().map(String::from).collect();
        lines[1] = lines[1].replace("\"caution\"", "\"safe\"");
        fs::write(&path, lines.join("\n") + "\n").unwrap();

        let broken = verify_audit_chain(&path).unwrap();
        assert!(broken.contains(&2), "Entry 2 should have broken link: {:?}", broken);
    }

    #[test]
    fn chain_recovery_on_corrupted_line() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(AUDIT_FILENAME);
        append_evaluation(&path, &operation(), &result(Severity::Caution, ThreatType::DataLoss))
            .unwrap();

        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "this is not json").unwrap();
        drop(file);

        append_evaluation(&path, &operation(), &result(Severity::HighRisk, ThreatType::DataLoss))
            .unwrap();

        let entries = read_audit_log(&path).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[1].event, AuditEvent::ChainRecovery);
        assert!(entries[1].detail.as_ref().unwrap().contains("corrupted"));
        assert_eq!(entries[2].seq, 3);

        // Only the garbage line itself is reported.
        assert_eq!(verify_audit_chain(&path).unwrap(), vec![1]);
    }

    #[test]
    fn torn_last_line_gets_its_own_recovery_entry() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(AUDIT_FILENAME);
        append_evaluation(&path, &operation(), &result(Severity::Caution, ThreatType::DataLoss))
            .unwrap();

        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        write!(file, "{{\"seq\":1,\"id\":").unwrap();
        drop(file);

        append_evaluation(&path, &operation(), &result(Severity::HighRisk, ThreatType::DataLoss))
            .unwrap();

        let events: Vec<AuditEvent> = read_audit_log(&path)
            .unwrap()
            .iter()
            .map(|e| e.event)
            .collect();
        assert_eq!(
            events,
            vec![AuditEvent::Evaluation, AuditEvent::ChainRecovery, AuditEvent::Evaluation]
        );
        assert_eq!(verify_audit_chain(&path).unwrap(), vec![1]);
    }

    #[test]
    fn blocked_lists_only_unapproved_newest_first() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(AUDIT_FILENAME);
        append_evaluation(&path, &operation(), &result(Severity::Caution, ThreatType::LogicWarning))
            .unwrap();
        append_evaluation(&path, &operation(), &result(Severity::Safe, ThreatType::LogicWarning))
            .unwrap();
        append_evaluation(&path, &operation(), &result(Severity::Critical, ThreatType::SystemFile))
            .unwrap();

        let entries = read_audit_log(&path).unwrap();
        let seqs: Vec<u64> = blocked(&entries).iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![2, 0]);
    }

    #[test]
    fn empty_log_no_errors() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(AUDIT_FILENAME);
        assert!(read_audit_log(&path).unwrap().is_empty());
        assert!(verify_audit_chain(&path).unwrap().is_empty());
        assert_eq!(statistics(&[]), GuardianStatistics::default());
    }

    #[test]
    fn queries_aggregate_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(AUDIT_FILENAME);
        append_evaluation(&path, &operation(), &result(Severity::Caution, ThreatType::LogicWarning))
            .unwrap();
        append_evaluation(&path, &operation(), &result(Severity::Critical, ThreatType::SystemFile))
            .unwrap();
        append_evaluation(&path, &operation(), &result(Severity::Caution, ThreatType::DataLoss))
            .unwrap();

        let entries = read_audit_log(&path).unwrap();
        let by_type = count_by_threat_type(&entries);
        assert_eq!(by_type[&ThreatType::SystemFile], 1);
        assert_eq!(by_type[&ThreatType::LogicWarning], 1);

        let by_level = count_by_risk_level(&entries);
        assert_eq!(by_level[&Severity::Caution], 2);
        assert_eq!(by_level[&Severity::Critical], 1);

        let latest = recent(&entries, 2);
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].seq, 2);

        let stats = statistics(&entries);
        assert_eq!(stats.total_evaluations, 3);
        assert_eq!(stats.total_blocked, 3);
        assert_eq!(stats.blocked_by_threat_type[&ThreatType::SystemFile], 1);
    }

    #[tokio::test]
    async fn concurrent_records_are_serialized() {
        let tmp = tempfile::tempdir().unwrap();
        let log = AuditLog::open(tmp.path().join(AUDIT_FILENAME));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let log = log.clone();
                tokio::spawn(async move {
                    log.record(&operation(), &result(Severity::Caution, ThreatType::DataLoss))
                        .await
                        .unwrap()
                })
            })
            .collect();
        for h in handles {
            h.await.unwrap();
        }

        let entries = log.entries().unwrap();
        assert_eq!(entries.len(), 16);
        let mut seqs: Vec<u64> = entries.iter().map(|e| e.seq).collect();
        seqs.sort();
        assert_eq!(seqs, (0..16).collect::<Vec<u64>>());
        assert!(log.verify().unwrap().is_empty());
    }

    #[tokio::test]
    async fn entry_count_never_decreases() {
        let tmp = tempfile::tempdir().unwrap();
        let log = AuditLog::open(tmp.path().join(AUDIT_FILENAME));

        let mut previous = 0;
        for severity in [Severity::Caution, Severity::Critical, Severity::HighRisk] {
            log.record(&operation(), &result(severity, ThreatType::DataLoss))
                .await
                .unwrap();
            let entries = log.entries().unwrap();
            assert!(entries.len() > previous);
            assert_eq!(entries[0].result.as_ref().unwrap().risk_level, Severity::Caution);
            previous = entries.len();
        }
    }
}

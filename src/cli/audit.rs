//! CLI subcommand: `safety-guardian audit`
//!
//! Read-only views of the hash-chained guardian audit log.

use anyhow::Result;
use clap::{Args, Subcommand};

use crate::config::Config;
use crate::safety::{self, AuditEvent, AuditLogEntry};

#[derive(Args)]
pub struct AuditArgs {
    #[command(subcommand)]
    pub command: AuditCommands,
}

#[derive(Subcommand)]
pub enum AuditCommands {
    /// Aggregate counts by threat type and risk level
    Stats,

    /// Show the most recent entries
    Tail {
        /// Number of entries
        #[arg(short = 'n', long, default_value_t = 20)]
        count: usize,

        /// Only entries with a finding of this threat type (e.g. SYSTEM_FILE)
        #[arg(long)]
        threat: Option<String>,

        /// Only operations that were blocked
        #[arg(long)]
        blocked: bool,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Check the hash chain for breaks
    Verify,
}

pub async fn run(args: AuditArgs, config_path: Option<&str>) -> Result<()> {
    let config = Config::load_from(config_path.map(std::path::Path::new))?;
    let path = config.paths.audit_log();

    match args.command {
        AuditCommands::Stats => {
            let entries = safety::read_audit_log(&path)?;
            let stats = safety::statistics(&entries);
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        AuditCommands::Tail {
            count,
            threat,
            blocked,
            json,
        } => {
            let mut entries = safety::read_audit_log(&path)?;
            if let Some(ref threat) = threat {
                entries.retain(|e| {
                    e.result.as_ref().is_some_and(|r| {
                        r.findings
                            .iter()
                            .any(|f| f.threat.as_str().eq_ignore_ascii_case(threat))
                    })
                });
            }
            let recent: Vec<&AuditLogEntry> = if blocked {
                safety::blocked(&entries).into_iter().take(count).collect()
            } else {
                safety::recent(&entries, count)
            };

            if json {
                println!("{}", serde_json::to_string_pretty(&recent)?);
            } else if recent.is_empty() {
                println!("No audit log entries.");
            } else {
                println!("Guardian Audit Log ({} of {} entries):", recent.len(), entries.len());
                println!();
                for entry in recent {
                    println!("  {}", describe(entry));
                }
            }
        }
        AuditCommands::Verify => {
            let broken = safety::verify_audit_chain(&path)?;
            if broken.is_empty() {
                println!("Audit chain: INTACT ({})", path.display());
            } else {
                println!("Audit chain: BROKEN at {} entries", broken.len());
                for i in &broken {
                    println!("  - line {}", i + 1);
                }
                anyhow::bail!("Audit chain verification failed");
            }
        }
    }

    Ok(())
}

fn describe(entry: &AuditLogEntry) -> String {
    let ts = entry.ts.format("%Y-%m-%d %H:%M:%S");
    match (entry.event, &entry.result, &entry.operation) {
        (AuditEvent::Evaluation, Some(result), Some(op)) => format!(
            "#{} {} {} {} ({} findings) {}",
            entry.seq,
            ts,
            result.risk_level,
            if result.approved { "approved" } else { "blocked" },
            result.findings.len(),
            op
        ),
        (AuditEvent::ChainRecovery, _, _) => format!(
            "#{} {} chain recovery: {}",
            entry.seq,
            ts,
            entry.detail.as_deref().unwrap_or("corrupted entry")
        ),
        _ => format!("#{} {} {:?}", entry.seq, ts, entry.event),
    }
}

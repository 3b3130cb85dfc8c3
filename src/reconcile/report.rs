//! Reconciliation report
//!
//! What happened to each target, rendered as operator text or JSON.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

use super::state::ReconcileState;
use super::FixMode;
use crate::error::Error;
use crate::replication::{NodeEndpoint, ReplicationDialect, ReplicationStatus, ServerSnapshot};

/// Result of reconciling one target
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TargetOutcome {
    /// Target holds nothing the source lacks
    Clean,
    /// Errant transactions found and left in place
    ErrantFound {
        errant: String,
        log_file: String,
        transactions: u64,
    },
    /// Engine reported an errant set that expands to no transactions
    NothingToInject { errant: String, log_file: String },
    /// Empty transactions committed on the source
    FixedSource {
        errant: String,
        log_file: String,
        applied: usize,
        /// Errant set recomputed after the fix; empty on success
        remaining_errant: String,
    },
    /// Empty transactions committed on the replica
    FixedReplica {
        errant: String,
        log_file: String,
        applied: usize,
        dialect: ReplicationDialect,
        status: ReplicationStatus,
        /// Retrieved but not yet executed transactions after restart
        gaps: String,
    },
}

/// Everything recorded about one target
#[derive(Debug, Serialize)]
pub struct TargetReport {
    pub endpoint: NodeEndpoint,
    pub snapshot: Option<ServerSnapshot>,
    pub states: Vec<ReconcileState>,
    #[serde(serialize_with = "serialize_outcome")]
    pub outcome: Result<TargetOutcome, Error>,
}

impl TargetReport {
    pub fn is_failure(&self) -> bool {
        self.outcome.is_err()
    }
}

fn serialize_outcome<S>(
    outcome: &Result<TargetOutcome, Error>,
    serializer: S,
) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    #[derive(Serialize)]
    #[serde(tag = "kind", rename_all = "snake_case")]
    enum Failed {
        Failed { error: String },
    }

    match outcome {
        Ok(outcome) => outcome.serialize(serializer),
        Err(e) => Failed::Failed {
            error: e.to_string(),
        }
        .serialize(serializer),
    }
}

/// Summary of one run
#[derive(Debug, Serialize)]
pub struct ReconcileReport {
    pub mode: FixMode,
    pub source: NodeEndpoint,
    pub source_snapshot: ServerSnapshot,
    pub targets: Vec<TargetReport>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ReconcileReport {
    /// Check whether any target failed
    pub fn has_failures(&self) -> bool {
        self.targets.iter().any(TargetReport::is_failure)
    }

    pub fn failure_count(&self) -> usize {
        self.targets.iter().filter(|t| t.is_failure()).count()
    }
}

impl fmt::Display for ReconcileReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Source: {} ({})", self.source, self.source_snapshot.server_uuid)?;
        writeln!(
            f,
            "  Executed_Gtid_Set: {}",
            display_set(&self.source_snapshot.executed_gtid_set)
        )?;

        for target in &self.targets {
            writeln!(f)?;
            match &target.snapshot {
                Some(snapshot) => {
                    writeln!(f, "Target: {} ({})", target.endpoint, snapshot.server_uuid)?;
                    writeln!(
                        f,
                        "  Executed_Gtid_Set: {}",
                        display_set(&snapshot.executed_gtid_set)
                    )?;
                }
                None => writeln!(f, "Target: {}", target.endpoint)?,
            }

            match &target.outcome {
                Ok(outcome) => write_outcome(f, &self.source, &target.endpoint, outcome)?,
                Err(e) => writeln!(f, "[!] {}", e)?,
            }
        }

        writeln!(f)?;
        let failures = self.failure_count();
        if failures == 0 {
            write!(f, "{} target(s) checked", self.targets.len())
        } else {
            write!(
                f,
                "{} target(s) checked, {} failed",
                self.targets.len(),
                failures
            )
        }
    }
}

fn write_outcome(
    f: &mut fmt::Formatter<'_>,
    source: &NodeEndpoint,
    target: &NodeEndpoint,
    outcome: &TargetOutcome,
) -> fmt::Result {
    match outcome {
        TargetOutcome::Clean => writeln!(f, "[+] No errant transactions on {}", target),
        TargetOutcome::ErrantFound {
            errant,
            log_file,
            transactions,
        } => {
            writeln!(f, "[-] Errant transactions: {}", errant)?;
            writeln!(f, "    Binary log: {}", log_file)?;
            writeln!(
                f,
                "    {} transaction(s); rerun with --fix to inject them on {} \
                 or --fix-replica to inject them on {}",
                transactions, source, target
            )
        }
        TargetOutcome::NothingToInject { errant, log_file } => {
            writeln!(f, "[-] Errant transactions: {}", errant)?;
            writeln!(f, "    Binary log: {}", log_file)?;
            writeln!(f, "    Nothing to inject")
        }
        TargetOutcome::FixedSource {
            errant,
            log_file,
            applied,
            remaining_errant,
        } => {
            writeln!(f, "[-] Errant transactions: {}", errant)?;
            writeln!(f, "    Binary log: {}", log_file)?;
            writeln!(f, "[+] Injected {} empty transaction(s) on {}", applied, source)?;
            if remaining_errant.is_empty() {
                writeln!(f, "[+] {} is no longer errant", target)
            } else {
                writeln!(f, "[!] Still errant after fix: {}", remaining_errant)
            }
        }
        TargetOutcome::FixedReplica {
            errant,
            log_file,
            applied,
            status,
            gaps,
            ..
        } => {
            writeln!(f, "[-] Errant transactions: {}", errant)?;
            writeln!(f, "    Binary log: {}", log_file)?;
            writeln!(f, "[+] Injected {} empty transaction(s) on {}", applied, target)?;
            writeln!(
                f,
                "    IO thread: {}  SQL thread: {}  Seconds behind: {}",
                status.io_running.as_deref().unwrap_or("-"),
                status.sql_running.as_deref().unwrap_or("-"),
                status
                    .seconds_behind
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "NULL".to_string())
            )?;
            if let Some(state) = &status.sql_running_state {
                writeln!(f, "    SQL state: {}", state)?;
            }
            if !gaps.is_empty() {
                writeln!(f, "    Retrieved but not executed: {}", gaps)?;
            }
            writeln!(
                f,
                "[!] {} stays errant until the same transactions are applied on {}",
                target, source
            )
        }
    }
}

fn display_set(set: &str) -> &str {
    if set.is_empty() {
        "(empty)"
    } else {
        set
    }
}

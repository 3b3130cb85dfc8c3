//! Reconciliation Module
//!
//! Drives one run: snapshot the source, then for each target in order find
//! errant transactions through the server, and optionally neutralize them by
//! committing empty transactions under the same GTIDs on the source or on the
//! replica.
//!
//! Targets are independent. A failure on one target is recorded in its report
//! and the run moves on; only the source connection and run-wide conditions
//! (deadline, cancellation) abort the whole run.

mod report;
mod state;

#[cfg(test)]
mod mock;

pub use report::{ReconcileReport, TargetOutcome, TargetReport};
pub use state::{ReconcileState, TargetStateMachine};

use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::time::Instant;

use crate::config::ReconcileConfig;
use crate::error::{Error, Result};
use crate::gtid::{gaps, FixPlan, GtidSet};
use crate::replication::{
    NodeEndpoint, ReplicationDialect, ReplicationNode, ReplicationStatus, ServerSnapshot,
};
use crate::retry::sleep_within;

/// Where errant transactions get neutralized
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FixMode {
    /// Report only
    None,
    /// Inject on the source so the target stops being errant
    Source,
    /// Inject on the replica itself with replication paused
    Replica,
}

/// Opens nodes for the reconciler
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    type Node: ReplicationNode;

    async fn connect(&self, endpoint: &NodeEndpoint) -> Result<Self::Node>;

    /// Release a node once its target is finished
    async fn disconnect(&self, node: Self::Node) {
        drop(node);
    }
}

/// Timing and mode of one run
#[derive(Debug, Clone)]
pub struct ReconcileOptions {
    pub mode: FixMode,
    /// Wait after restarting replication before the first status poll
    pub settle_delay: Duration,
    pub poll_interval: Duration,
    /// Give up waiting for replication threads after this long
    pub settle_timeout: Duration,
    /// Run deadline shared with the nodes' retry policy
    pub deadline: Option<Instant>,
}

impl ReconcileOptions {
    pub fn from_config(config: &ReconcileConfig, mode: FixMode) -> Self {
        Self {
            mode,
            settle_delay: config.settle_delay(),
            poll_interval: config.poll_interval(),
            settle_timeout: config.settle_timeout(),
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Runs errant-transaction detection and repair for one source and its targets
pub struct Reconciler<C: Connector> {
    connector: C,
    source: NodeEndpoint,
    targets: Vec<NodeEndpoint>,
    options: ReconcileOptions,
}

impl<C: Connector> Reconciler<C> {
    pub fn new(
        connector: C,
        source: NodeEndpoint,
        targets: Vec<NodeEndpoint>,
        options: ReconcileOptions,
    ) -> Self {
        Self {
            connector,
            source,
            targets,
            options,
        }
    }

    /// Reconcile every target in order.
    ///
    /// Fails only when the source cannot be read or a run-wide error occurs;
    /// per-target failures are carried in the report.
    pub async fn run(&self) -> Result<ReconcileReport> {
        let started_at = Utc::now();

        tracing::info!(
            source = %self.source,
            targets = self.targets.len(),
            mode = ?self.options.mode,
            "Starting reconciliation"
        );

        let source = self.connector.connect(&self.source).await?;
        let mut source_snapshot = source.snapshot().await?;

        tracing::info!(
            source = %self.source,
            server_uuid = %source_snapshot.server_uuid,
            executed = %source_snapshot.executed_gtid_set,
            "Source snapshot"
        );

        let mut reports = Vec::with_capacity(self.targets.len());
        let mut fatal = None;

        for endpoint in &self.targets {
            let report = self.reconcile_target(&source, &source_snapshot, endpoint).await;

            if let Err(e) = &report.outcome {
                if e.is_run_fatal() {
                    fatal = Some(e.to_string());
                }
            }

            // Injections on the source stand even when the target failed part
            // way; later targets must compare against the source as it is now
            if fatal.is_none() && report.states.contains(&ReconcileState::FixSource) {
                match source.snapshot().await {
                    Ok(snapshot) => source_snapshot = snapshot,
                    Err(e) => tracing::warn!(
                        source = %self.source,
                        error = %e,
                        "Could not refresh source snapshot"
                    ),
                }
            }

            reports.push(report);
            if fatal.is_some() {
                break;
            }
        }

        self.connector.disconnect(source).await;

        if let Some(reason) = fatal {
            tracing::error!(%reason, "Run aborted");
            for endpoint in self.targets.iter().skip(reports.len()) {
                reports.push(TargetReport {
                    endpoint: endpoint.clone(),
                    snapshot: None,
                    states: vec![ReconcileState::Idle],
                    outcome: Err(Error::Internal(format!("skipped after run abort: {}", reason))),
                });
            }
        }

        let report = ReconcileReport {
            mode: self.options.mode,
            source: self.source.clone(),
            source_snapshot,
            targets: reports,
            started_at,
            finished_at: Utc::now(),
        };

        tracing::info!(
            targets = report.targets.len(),
            failures = report.failure_count(),
            "Reconciliation finished"
        );

        Ok(report)
    }

    async fn reconcile_target(
        &self,
        source: &C::Node,
        source_snapshot: &ServerSnapshot,
        endpoint: &NodeEndpoint,
    ) -> TargetReport {
        let mut machine = TargetStateMachine::new(endpoint.to_string());
        let mut snapshot = None;

        let outcome = match self.connector.connect(endpoint).await {
            Ok(target) => {
                let outcome = self
                    .diff_and_fix(source, source_snapshot, &target, &mut machine, &mut snapshot)
                    .await;
                self.connector.disconnect(target).await;
                outcome
            }
            Err(e) => Err(e),
        };

        if let Err(e) = &outcome {
            tracing::error!(target_node = %endpoint, error = %e, "Target failed");
            machine.fail();
        }

        TargetReport {
            endpoint: endpoint.clone(),
            snapshot,
            states: machine.history().to_vec(),
            outcome,
        }
    }

    async fn diff_and_fix(
        &self,
        source: &C::Node,
        source_snapshot: &ServerSnapshot,
        target: &C::Node,
        machine: &mut TargetStateMachine,
        snapshot_out: &mut Option<ServerSnapshot>,
    ) -> Result<TargetOutcome> {
        let node = target.endpoint();
        machine.transition(ReconcileState::Diffing)?;

        let snapshot = target.snapshot().await?;
        tracing::info!(
            target_node = %node,
            server_uuid = %snapshot.server_uuid,
            executed = %snapshot.executed_gtid_set,
            "Target snapshot"
        );
        *snapshot_out = Some(snapshot.clone());

        let errant = target
            .compute_errant_set(&snapshot.executed_gtid_set, &source_snapshot.executed_gtid_set)
            .await?;
        if errant.is_empty() {
            tracing::info!(target_node = %node, "No errant transactions");
            machine.transition(ReconcileState::Clean)?;
            machine.transition(ReconcileState::Done)?;
            return Ok(TargetOutcome::Clean);
        }

        let binlog = target.binary_log_status().await?;
        let errant = if binlog.executed_gtid_set != snapshot.executed_gtid_set {
            let fresh = target
                .compute_errant_set(&binlog.executed_gtid_set, &source_snapshot.executed_gtid_set)
                .await?;
            if fresh != errant {
                tracing::warn!(
                    target_node = %node,
                    before = %errant,
                    after = %fresh,
                    "Errant set changed while reading binary log status"
                );
            }
            fresh
        } else {
            errant
        };

        if errant.is_empty() {
            machine.transition(ReconcileState::Clean)?;
            machine.transition(ReconcileState::Done)?;
            return Ok(TargetOutcome::Clean);
        }

        machine.transition(ReconcileState::ErrantFound)?;
        tracing::warn!(
            target_node = %node,
            %errant,
            log_file = %binlog.log_file,
            "Errant transactions found"
        );

        let transactions = GtidSet::parse(&errant)?.transaction_count();
        let log_file = binlog.log_file;

        if transactions == 0 {
            tracing::warn!(target_node = %node, %errant, "Errant set expands to no transactions");
            machine.transition(ReconcileState::Done)?;
            return Ok(TargetOutcome::NothingToInject { errant, log_file });
        }

        match self.options.mode {
            FixMode::None => {
                machine.transition(ReconcileState::NoFix)?;
                machine.transition(ReconcileState::Done)?;
                Ok(TargetOutcome::ErrantFound {
                    errant,
                    log_file,
                    transactions,
                })
            }
            FixMode::Source => {
                let plan = FixPlan::from_errant(&errant)?;
                machine.transition(ReconcileState::FixSource)?;
                let applied = inject_all(source, &plan).await?;

                machine.transition(ReconcileState::Verifying)?;
                let target_set = target.executed_gtid_set().await?;
                let source_set = source.executed_gtid_set().await?;
                let remaining_errant = target.compute_errant_set(&target_set, &source_set).await?;
                if remaining_errant.is_empty() {
                    tracing::info!(target_node = %node, applied, "Target no longer errant");
                } else {
                    tracing::warn!(
                        target_node = %node,
                        remaining = %remaining_errant,
                        "Target still errant after fix"
                    );
                }

                machine.transition(ReconcileState::Done)?;
                Ok(TargetOutcome::FixedSource {
                    errant,
                    log_file,
                    applied,
                    remaining_errant,
                })
            }
            FixMode::Replica => {
                let plan = FixPlan::from_errant(&errant)?;
                machine.transition(ReconcileState::FixReplica)?;
                let dialect = target.detect_dialect().await?;
                let applied = self.fix_replica(target, dialect, &plan).await?;

                machine.transition(ReconcileState::Verifying)?;
                let status = self.wait_for_replication(target, dialect).await?;
                let gaps = replication_gaps(&status);
                tracing::warn!(
                    target_node = %node,
                    source = %self.source,
                    %errant,
                    "Replica stays errant until the same transactions are applied on the source"
                );

                machine.transition(ReconcileState::Done)?;
                Ok(TargetOutcome::FixedReplica {
                    errant,
                    log_file,
                    applied,
                    dialect,
                    status,
                    gaps,
                })
            }
        }
    }

    /// Inject on a paused replica with binary logging suppressed.
    ///
    /// Once replication is stopped it is restarted and binary logging is
    /// re-enabled on every exit path.
    async fn fix_replica(
        &self,
        target: &C::Node,
        dialect: ReplicationDialect,
        plan: &FixPlan,
    ) -> Result<usize> {
        let node = target.endpoint().to_string();

        target
            .stop_replication(dialect)
            .await
            .map_err(|e| {
                Error::replication_control(&node, format!("stop replication: {}", e))
            })?;
        tracing::info!(
            target_node = %node,
            command = dialect.stop_command(),
            "Replication stopped"
        );

        if let Err(first) = target.set_binary_log_suppressed(true).await {
            tracing::warn!(
                target_node = %node,
                error = %first,
                "Could not suppress binary logging, retrying once"
            );
            if let Err(second) = target.set_binary_log_suppressed(true).await {
                tracing::warn!(
                    target_node = %node,
                    error = %second,
                    "Continuing with binary logging enabled; \
                     injected transactions will reach downstream replicas"
                );
            }
        }

        let injected = inject_all(target, plan).await;

        let mut restore_errors = Vec::new();
        if let Err(e) = target.set_binary_log_suppressed(false).await {
            restore_errors.push(format!("re-enable binary logging: {}", e));
        }
        match target.start_replication(dialect).await {
            Ok(()) => tracing::info!(
                target_node = %node,
                command = dialect.start_command(),
                "Replication started"
            ),
            Err(e) => restore_errors.push(format!("start replication: {}", e)),
        }

        match injected {
            Ok(applied) if restore_errors.is_empty() => Ok(applied),
            Ok(_) => Err(Error::replication_control(&node, restore_errors.join("; "))),
            Err(e) => {
                for restore_error in &restore_errors {
                    tracing::error!(
                        target_node = %node,
                        error = %restore_error,
                        "Restore failed after injection error; replication may be stopped"
                    );
                }
                Err(e)
            }
        }
    }

    /// Poll replica status until both threads run or the settle timeout passes
    async fn wait_for_replication(
        &self,
        target: &C::Node,
        dialect: ReplicationDialect,
    ) -> Result<ReplicationStatus> {
        let node = target.endpoint().to_string();
        let deadline = self.options.deadline;

        sleep_within(deadline, "settle delay", self.options.settle_delay).await?;
        let give_up = Instant::now() + self.options.settle_timeout;

        loop {
            let status = target.replication_status(dialect).await?.ok_or_else(|| {
                Error::replication_control(&node, "node reports no replica configuration")
            })?;

            if status.is_running() {
                tracing::info!(
                    target_node = %node,
                    seconds_behind = ?status.seconds_behind,
                    "Replication threads running"
                );
                return Ok(status);
            }

            if Instant::now() >= give_up {
                return Err(Error::replication_control(
                    &node,
                    format!(
                        "timed out after {:?} waiting for replication threads (IO: {}, SQL: {}{})",
                        self.options.settle_timeout,
                        status.io_running.as_deref().unwrap_or("-"),
                        status.sql_running.as_deref().unwrap_or("-"),
                        status
                            .last_sql_error
                            .as_deref()
                            .or(status.last_io_error.as_deref())
                            .map(|e| format!(", last error: {}", e))
                            .unwrap_or_default()
                    ),
                ));
            }

            tracing::debug!(
                target_node = %node,
                io = ?status.io_running,
                sql = ?status.sql_running,
                "Waiting for replication threads"
            );
            sleep_within(deadline, "replication status poll", self.options.poll_interval).await?;
        }
    }
}

/// Commit one empty transaction per planned GTID, in order
async fn inject_all<N: ReplicationNode>(node: &N, plan: &FixPlan) -> Result<usize> {
    let total = plan.len();
    for (applied, gtid) in plan.iter().enumerate() {
        if let Err(e) = node.inject_empty_transaction(gtid).await {
            tracing::error!(
                node = %node.endpoint(),
                %gtid,
                applied,
                total,
                "Injection failed"
            );
            return Err(e);
        }
        tracing::info!(node = %node.endpoint(), %gtid, "Injected empty transaction");
    }
    Ok(total)
}

/// Retrieved-but-unexecuted transactions, empty when either set is unreadable
fn replication_gaps(status: &ReplicationStatus) -> String {
    let parsed = GtidSet::parse(&status.retrieved_gtid_set)
        .and_then(|retrieved| Ok((retrieved, GtidSet::parse(&status.executed_gtid_set)?)));
    match parsed {
        Ok((retrieved, executed)) => gaps::find_gaps(&retrieved, &executed).to_string(),
        Err(e) => {
            tracing::warn!(error = %e, "Skipping gap analysis");
            String::new()
        }
    }
}

//! Scripted in-memory nodes for reconciler tests

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::gtid::{gaps, ExplodedGtid, GtidSet};
use crate::replication::{
    BinaryLogStatus, NodeEndpoint, ReplicationDialect, ReplicationNode, ReplicationStatus,
    DEFAULT_PORT,
};
use crate::retry::RetryPolicy;

use super::Connector;

#[derive(Debug)]
struct MockState {
    server_uuid: String,
    executed: String,
    version: String,
    errant_override: Option<String>,
    binlog_executed: Option<String>,
    binlog_suppressed: bool,
    suppression_failures: u32,
    fail_injection_at: Option<String>,
    /// Status polls answered with stopped threads before reporting running
    stopped_polls: Option<u32>,
    injection_latency: Duration,
    commands: Vec<String>,
    injected: Vec<String>,
}

/// A node whose state lives in memory; clones share that state
#[derive(Debug, Clone)]
pub struct MockNode {
    endpoint: NodeEndpoint,
    state: Arc<Mutex<MockState>>,
    /// Applied to control statements and injections, as on a real node
    retry: RetryPolicy,
    restore_timeout: Duration,
}

impl MockNode {
    pub fn new(host: &str, server_uuid: &str, executed: &str) -> Self {
        Self {
            endpoint: NodeEndpoint::new(host, DEFAULT_PORT),
            state: Arc::new(Mutex::new(MockState {
                server_uuid: server_uuid.to_string(),
                executed: executed.to_string(),
                version: "8.0.36".to_string(),
                errant_override: None,
                binlog_executed: None,
                binlog_suppressed: false,
                suppression_failures: 0,
                fail_injection_at: None,
                stopped_polls: Some(0),
                injection_latency: Duration::ZERO,
                commands: Vec::new(),
                injected: Vec::new(),
            })),
            retry: RetryPolicy::new(1, Duration::ZERO),
            restore_timeout: Duration::from_secs(1),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn with_version(self, version: &str) -> Self {
        self.state().version = version.to_string();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Time each injection takes before it commits
    pub fn slow_injection(&self, latency: Duration) {
        self.state().injection_latency = latency;
    }

    /// Answer `GTID_SUBTRACT` with a fixed string
    pub fn override_errant(&self, errant: &str) {
        self.state().errant_override = Some(errant.to_string());
    }

    /// Report a different executed set from binary log status than from the snapshot
    pub fn binlog_executed(&self, executed: &str) {
        self.state().binlog_executed = Some(executed.to_string());
    }

    /// Fail the next `count` attempts to suppress binary logging
    pub fn fail_suppression(&self, count: u32) {
        self.state().suppression_failures = count;
    }

    pub fn fail_injection_at(&self, gtid: &str) {
        self.state().fail_injection_at = Some(gtid.to_string());
    }

    pub fn never_running(&self) {
        self.state().stopped_polls = None;
    }

    pub fn running_after_polls(&self, polls: u32) {
        self.state().stopped_polls = Some(polls);
    }

    /// Control statements issued, in order
    pub fn commands(&self) -> Vec<String> {
        self.state().commands.clone()
    }

    pub fn injected(&self) -> Vec<String> {
        self.state().injected.clone()
    }

    pub fn executed(&self) -> String {
        self.state().executed.clone()
    }

    pub fn binlog_suppressed(&self) -> bool {
        self.state().binlog_suppressed
    }

    /// One round trip under `policy`: the call yields before touching state,
    /// so an expired deadline stops it before anything is applied
    async fn call<T, F>(&self, policy: &RetryPolicy, operation: &str, apply: F) -> Result<T>
    where
        F: Fn(&mut MockState) -> Result<T>,
    {
        let apply = &apply;
        policy
            .run(operation, || async move {
                tokio::task::yield_now().await;
                apply(&mut self.state())
            })
            .await
    }
}

fn subtract(target: &str, source: &str) -> Result<String> {
    let target = GtidSet::parse(target)?;
    let source = GtidSet::parse(source)?;
    Ok(gaps::find_gaps(&target, &source).to_string())
}

#[async_trait::async_trait]
impl ReplicationNode for MockNode {
    fn endpoint(&self) -> &NodeEndpoint {
        &self.endpoint
    }

    async fn server_identity(&self) -> Result<String> {
        Ok(self.state().server_uuid.clone())
    }

    async fn executed_gtid_set(&self) -> Result<String> {
        Ok(self.executed())
    }

    async fn compute_errant_set(&self, target_set: &str, source_set: &str) -> Result<String> {
        if let Some(errant) = self.state().errant_override.clone() {
            return Ok(errant);
        }
        subtract(target_set, source_set)
    }

    async fn binary_log_status(&self) -> Result<BinaryLogStatus> {
        let state = self.state();
        Ok(BinaryLogStatus {
            log_file: "binlog.000001".to_string(),
            position: 157,
            executed_gtid_set: state
                .binlog_executed
                .clone()
                .unwrap_or_else(|| state.executed.clone()),
        })
    }

    async fn server_version(&self) -> Result<String> {
        Ok(self.state().version.clone())
    }

    async fn inject_empty_transaction(&self, gtid: &ExplodedGtid) -> Result<()> {
        gtid.validate()?;
        let text = gtid.to_string();
        let text = text.as_str();

        self.retry
            .run("inject empty transaction", || async move {
                let latency = self.state().injection_latency;
                tokio::time::sleep(latency).await;

                let mut state = self.state();
                if state.fail_injection_at.as_deref() == Some(text) {
                    return Err(Error::query(
                        self.endpoint.to_string(),
                        "inject empty transaction",
                        Error::Internal("commit rejected".into()),
                    ));
                }

                state.commands.push(format!("INJECT {}", text));
                state.injected.push(text.to_string());

                // An already executed GTID leaves the set as it was
                let mut executed = GtidSet::parse(&state.executed)?.explode();
                executed.push(gtid.clone());
                state.executed = gaps::summarize(&executed).to_string();
                Ok(())
            })
            .await
    }

    async fn stop_replication(&self, dialect: ReplicationDialect) -> Result<()> {
        self.call(&self.retry, "stop replication", |state| {
            state.commands.push(dialect.stop_command().to_string());
            Ok(())
        })
        .await
    }

    async fn start_replication(&self, dialect: ReplicationDialect) -> Result<()> {
        let restore = self.retry.detached(self.restore_timeout);
        self.call(&restore, "start replication", |state| {
            state.commands.push(dialect.start_command().to_string());
            Ok(())
        })
        .await
    }

    async fn replication_status(
        &self,
        dialect: ReplicationDialect,
    ) -> Result<Option<ReplicationStatus>> {
        let mut state = self.state();
        state.commands.push(dialect.status_command().to_string());

        let running = match state.stopped_polls.as_mut() {
            Some(0) => true,
            Some(remaining) => {
                *remaining -= 1;
                false
            }
            None => false,
        };

        let executed = state.executed.clone();
        let columns: HashMap<String, String> = [
            ("Source_Host", "db1"),
            ("Replica_IO_Running", if running { "Yes" } else { "Connecting" }),
            ("Replica_SQL_Running", "Yes"),
            ("Seconds_Behind_Source", "0"),
            ("Retrieved_Gtid_Set", executed.as_str()),
            ("Executed_Gtid_Set", executed.as_str()),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        Ok(Some(ReplicationStatus::from_columns(&columns)))
    }

    async fn set_binary_log_suppressed(&self, suppressed: bool) -> Result<()> {
        let policy = if suppressed {
            self.retry.clone()
        } else {
            self.retry.detached(self.restore_timeout)
        };

        self.call(&policy, "set sql_log_bin", |state| {
            state
                .commands
                .push(format!("SET sql_log_bin={}", if suppressed { 0 } else { 1 }));

            if suppressed && state.suppression_failures > 0 {
                state.suppression_failures -= 1;
                return Err(Error::query(
                    self.endpoint.to_string(),
                    "set sql_log_bin",
                    Error::Internal("Access denied; you need the SUPER privilege".into()),
                ));
            }

            state.binlog_suppressed = suppressed;
            Ok(())
        })
        .await
    }
}

/// Hands out registered mock nodes by host
pub struct MockConnector {
    nodes: HashMap<String, MockNode>,
    unreachable: HashSet<String>,
}

impl MockConnector {
    pub fn new(nodes: Vec<MockNode>) -> Self {
        Self {
            nodes: nodes
                .into_iter()
                .map(|n| (n.endpoint.host.clone(), n))
                .collect(),
            unreachable: HashSet::new(),
        }
    }

    pub fn with_unreachable(mut self, host: &str) -> Self {
        self.unreachable.insert(host.to_string());
        self
    }
}

#[async_trait::async_trait]
impl Connector for MockConnector {
    type Node = MockNode;

    async fn connect(&self, endpoint: &NodeEndpoint) -> Result<MockNode> {
        if self.unreachable.contains(&endpoint.host) {
            return Err(Error::Connection {
                endpoint: endpoint.to_string(),
                reason: "connection refused".into(),
            });
        }
        self.nodes
            .get(&endpoint.host)
            .cloned()
            .ok_or_else(|| Error::Connection {
                endpoint: endpoint.to_string(),
                reason: "unknown host".into(),
            })
    }
}

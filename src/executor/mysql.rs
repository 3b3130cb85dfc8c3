//! MySQL Node
//!
//! `ReplicationNode` backed by a single-session sqlx pool.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sqlx::mysql::{MySqlConnectOptions, MySqlConnection, MySqlPoolOptions, MySqlRow};
use sqlx::pool::PoolConnection;
use sqlx::{Column, Executor, MySql, MySqlPool, Row};

use crate::config::ReconcileConfig;
use crate::credentials::Credentials;
use crate::error::{Error, Result};
use crate::gtid::ExplodedGtid;
use crate::reconcile::Connector;
use crate::replication::{
    BinaryLogStatus, NodeEndpoint, ReplicationDialect, ReplicationNode, ReplicationStatus,
};
use crate::retry::RetryPolicy;

const SUPPRESS_BINLOG: &str = "SET SESSION sql_log_bin = 0";
const RESTORE_BINLOG: &str = "SET SESSION sql_log_bin = 1";
const RESET_GTID_NEXT: &str = "SET GTID_NEXT='AUTOMATIC'";

/// One MySQL server reached through a pool holding exactly one session, so
/// session variables (`GTID_NEXT`, `sql_log_bin`) stick between calls.
pub struct MySqlNode {
    endpoint: NodeEndpoint,
    pool: MySqlPool,
    retry: RetryPolicy,
    /// Budget for restore statements, independent of the run deadline
    restore_timeout: Duration,
    /// Desired `sql_log_bin` suppression, re-applied to fresh sessions
    binlog_suppressed: Arc<AtomicBool>,
}

impl MySqlNode {
    /// Connect to `endpoint`, retrying transient failures
    pub async fn connect(
        endpoint: NodeEndpoint,
        credentials: &Credentials,
        config: &ReconcileConfig,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let options = MySqlConnectOptions::new()
            .host(&endpoint.host)
            .port(endpoint.port)
            .username(&credentials.user)
            .password(&credentials.password)
            .database(&config.connection.database);

        let binlog_suppressed = Arc::new(AtomicBool::new(false));

        tracing::info!(node = %endpoint, user = %credentials.user, "Connecting");

        let pool = retry
            .run("connect", || {
                let options = options.clone();
                let builder =
                    pool_options(config.connect_timeout(), Arc::clone(&binlog_suppressed));
                async move {
                    builder
                        .connect_with(options)
                        .await
                        .map_err(Error::Database)
                }
            })
            .await
            .map_err(|e| match e {
                Error::Timeout(_) => e,
                e => Error::Connection {
                    endpoint: endpoint.to_string(),
                    reason: e.to_string(),
                },
            })?;

        tracing::info!(node = %endpoint, "Connection established");

        Ok(Self {
            endpoint,
            pool,
            retry,
            restore_timeout: config.restore_timeout(),
            binlog_suppressed,
        })
    }

    /// Close the connection pool
    pub async fn close(&self) {
        self.pool.close().await;
    }

    fn context(&self, operation: &'static str, e: Error) -> Error {
        Error::query(self.endpoint.to_string(), operation, e)
    }

    /// First column of the first row of a text-protocol query
    async fn fetch_text(&self, operation: &'static str, sql: &'static str) -> Result<String> {
        self.retry
            .run(operation, || async move {
                tracing::debug!(node = %self.endpoint, statement = sql, "Querying");
                let row = (&self.pool).fetch_one(sql).await?;
                Ok(column_text(&row, 0).unwrap_or_default())
            })
            .await
            .map_err(|e| self.context(operation, e))
    }

    /// Run a control statement on the session
    async fn execute_control(&self, operation: &'static str, sql: &'static str) -> Result<()> {
        self.execute_with(&self.retry, operation, sql).await
    }

    /// Run a restore statement under its own budget, so it is still issued
    /// once the run deadline has passed
    async fn execute_restore(&self, operation: &'static str, sql: &'static str) -> Result<()> {
        let policy = self.retry.detached(self.restore_timeout);
        self.execute_with(&policy, operation, sql).await
    }

    async fn execute_with(
        &self,
        policy: &RetryPolicy,
        operation: &'static str,
        sql: &'static str,
    ) -> Result<()> {
        policy
            .run(operation, || async move {
                let mut conn = self.pool.acquire().await?;
                execute(&mut conn, sql).await?;
                Ok(())
            })
            .await
            .map_err(|e| self.context(operation, e))
    }

    async fn fetch_binary_log_row(&self, sql: &'static str) -> Result<Option<MySqlRow>> {
        self.retry
            .run(sql, || async move {
                tracing::debug!(node = %self.endpoint, statement = sql, "Querying");
                Ok((&self.pool).fetch_optional(sql).await?)
            })
            .await
    }
}

fn pool_options(connect_timeout: Duration, binlog_suppressed: Arc<AtomicBool>) -> MySqlPoolOptions {
    MySqlPoolOptions::new()
        .max_connections(1)
        .idle_timeout(None::<Duration>)
        .max_lifetime(None::<Duration>)
        .acquire_timeout(connect_timeout)
        .after_connect(move |conn, _meta| {
            let suppress = binlog_suppressed.load(Ordering::SeqCst);
            Box::pin(async move {
                if suppress {
                    tracing::debug!("Re-applying sql_log_bin suppression to new session");
                    conn.execute(SUPPRESS_BINLOG).await?;
                }
                Ok(())
            })
        })
}

/// Execute one statement over the text protocol
async fn execute(conn: &mut MySqlConnection, sql: &str) -> std::result::Result<(), sqlx::Error> {
    tracing::debug!(statement = sql, "Executing");
    (&mut *conn).execute(sql).await?;
    Ok(())
}

/// Decode a column as text whatever type the server reported
fn column_text(row: &MySqlRow, index: usize) -> Option<String> {
    if let Ok(value) = row.try_get::<Option<String>, _>(index) {
        return value;
    }
    if let Ok(value) = row.try_get::<Option<Vec<u8>>, _>(index) {
        return value.map(|bytes| String::from_utf8_lossy(&bytes).into_owned());
    }
    if let Ok(value) = row.try_get::<Option<i64>, _>(index) {
        return value.map(|n| n.to_string());
    }
    if let Ok(value) = row.try_get::<Option<u64>, _>(index) {
        return value.map(|n| n.to_string());
    }
    None
}

/// Column name to text, NULL columns omitted
fn row_columns(row: &MySqlRow) -> HashMap<String, String> {
    row.columns()
        .iter()
        .filter_map(|column| {
            column_text(row, column.ordinal()).map(|value| (column.name().to_string(), value))
        })
        .collect()
}

fn is_syntax_error(e: &Error) -> bool {
    match e {
        Error::Database(sqlx::Error::Database(db)) => db.code().as_deref() == Some("42000"),
        _ => false,
    }
}

/// Run `primary`, or `fallback` when the server rejects `primary` as a
/// syntax error (statements renamed between server versions)
async fn with_fallback<T, F, Fut>(
    primary: &'static str,
    fallback: &'static str,
    mut fetch: F,
) -> Result<T>
where
    F: FnMut(&'static str) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match fetch(primary).await {
        Err(e) if is_syntax_error(&e) => {
            tracing::debug!(rejected = primary, fallback, "Statement rejected, using fallback");
            fetch(fallback).await
        }
        other => other,
    }
}

/// A session that runs statements one at a time
#[async_trait::async_trait]
trait StatementSession: Send {
    async fn run(&mut self, sql: &str) -> std::result::Result<(), sqlx::Error>;

    /// The session is back in a known state and may be reused
    fn mark_reusable(&mut self);
}

/// Pool connection used for one injection attempt.
///
/// Unless marked reusable it is detached from the pool on drop, including
/// when the attempt is cancelled mid-transaction, so a session with a pinned
/// `GTID_NEXT` is never handed out again.
struct InjectionSession {
    conn: Option<PoolConnection<MySql>>,
    reusable: bool,
}

impl InjectionSession {
    fn new(conn: PoolConnection<MySql>) -> Self {
        Self {
            conn: Some(conn),
            reusable: false,
        }
    }
}

impl Drop for InjectionSession {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if !self.reusable {
                tracing::debug!("Detaching session left with GTID_NEXT set");
                drop(conn.detach());
            }
        }
    }
}

#[async_trait::async_trait]
impl StatementSession for InjectionSession {
    async fn run(&mut self, sql: &str) -> std::result::Result<(), sqlx::Error> {
        match self.conn.as_mut() {
            Some(conn) => execute(conn, sql).await,
            None => Err(sqlx::Error::PoolClosed),
        }
    }

    fn mark_reusable(&mut self) {
        self.reusable = true;
    }
}

/// One injection attempt: pin `GTID_NEXT`, commit an empty transaction, then
/// reset `GTID_NEXT` whatever happened before. A failed reset leaves the
/// session unusable but does not fail an attempt whose COMMIT succeeded.
async fn inject_attempt<S: StatementSession>(session: &mut S, set_next: &str) -> Result<()> {
    let outcome = async {
        session.run(set_next).await?;
        session.run("BEGIN").await?;
        session.run("COMMIT").await
    }
    .await;

    match session.run(RESET_GTID_NEXT).await {
        Ok(()) => session.mark_reusable(),
        Err(e) => tracing::warn!(
            statement = set_next,
            error = %e,
            "Could not reset GTID_NEXT, discarding session"
        ),
    }

    outcome.map_err(Error::Database)
}

#[async_trait::async_trait]
impl ReplicationNode for MySqlNode {
    fn endpoint(&self) -> &NodeEndpoint {
        &self.endpoint
    }

    async fn server_identity(&self) -> Result<String> {
        self.fetch_text("SELECT @@server_uuid", "SELECT @@server_uuid").await
    }

    async fn executed_gtid_set(&self) -> Result<String> {
        self.fetch_text("SELECT @@GLOBAL.GTID_EXECUTED", "SELECT @@GLOBAL.GTID_EXECUTED")
            .await
    }

    async fn compute_errant_set(&self, target_set: &str, source_set: &str) -> Result<String> {
        let operation = "GTID_SUBTRACT";
        self.retry
            .run(operation, || async move {
                let row = sqlx::query("SELECT GTID_SUBTRACT(?, ?)")
                    .bind(target_set)
                    .bind(source_set)
                    .fetch_one(&self.pool)
                    .await?;
                Ok(column_text(&row, 0).unwrap_or_default())
            })
            .await
            .map(|errant| errant.trim().to_string())
            .map_err(|e| self.context(operation, e))
    }

    async fn binary_log_status(&self) -> Result<BinaryLogStatus> {
        let operation = "SHOW MASTER STATUS";
        let row = with_fallback("SHOW MASTER STATUS", "SHOW BINARY LOG STATUS", |sql| {
            self.fetch_binary_log_row(sql)
        })
        .await
        .map_err(|e| self.context(operation, e))?;

        let row = row.ok_or_else(|| {
            self.context(
                operation,
                Error::Internal("binary logging is not enabled".into()),
            )
        })?;
        let columns = row_columns(&row);

        Ok(BinaryLogStatus {
            log_file: columns.get("File").cloned().unwrap_or_default(),
            position: columns
                .get("Position")
                .and_then(|p| p.parse().ok())
                .unwrap_or(0),
            executed_gtid_set: columns
                .get("Executed_Gtid_Set")
                .cloned()
                .unwrap_or_default(),
        })
    }

    async fn server_version(&self) -> Result<String> {
        self.fetch_text("SELECT VERSION()", "SELECT VERSION()").await
    }

    async fn inject_empty_transaction(&self, gtid: &ExplodedGtid) -> Result<()> {
        let operation = "inject empty transaction";
        gtid.validate().map_err(|e| self.context(operation, e))?;
        let set_next = format!("SET GTID_NEXT='{}'", gtid);
        let set_next = set_next.as_str();

        // Retried as a whole; the server skips a GTID it already executed
        self.retry
            .run(operation, || async move {
                let mut session = InjectionSession::new(self.pool.acquire().await?);
                inject_attempt(&mut session, set_next).await
            })
            .await
            .map_err(|e| self.context(operation, e))?;

        tracing::debug!(node = %self.endpoint, %gtid, "Committed empty transaction");
        Ok(())
    }

    async fn stop_replication(&self, dialect: ReplicationDialect) -> Result<()> {
        self.execute_control("stop replication", dialect.stop_command())
            .await
    }

    async fn start_replication(&self, dialect: ReplicationDialect) -> Result<()> {
        self.execute_restore("start replication", dialect.start_command())
            .await
    }

    async fn replication_status(
        &self,
        dialect: ReplicationDialect,
    ) -> Result<Option<ReplicationStatus>> {
        let operation = "replication status";
        let sql = dialect.status_command();
        let row = self
            .retry
            .run(operation, || async move {
                Ok((&self.pool).fetch_optional(sql).await?)
            })
            .await
            .map_err(|e| self.context(operation, e))?;

        Ok(row.map(|row| ReplicationStatus::from_columns(&row_columns(&row))))
    }

    async fn set_binary_log_suppressed(&self, suppressed: bool) -> Result<()> {
        self.binlog_suppressed.store(suppressed, Ordering::SeqCst);
        if suppressed {
            self.execute_control("set sql_log_bin", SUPPRESS_BINLOG).await
        } else {
            self.execute_restore("set sql_log_bin", RESTORE_BINLOG).await
        }
    }
}

/// Opens `MySqlNode`s with shared credentials, settings and retry policy
pub struct MySqlConnector {
    credentials: Credentials,
    config: ReconcileConfig,
    retry: RetryPolicy,
}

impl MySqlConnector {
    pub fn new(credentials: Credentials, config: ReconcileConfig, retry: RetryPolicy) -> Self {
        Self {
            credentials,
            config,
            retry,
        }
    }
}

#[async_trait::async_trait]
impl Connector for MySqlConnector {
    type Node = MySqlNode;

    async fn connect(&self, endpoint: &NodeEndpoint) -> Result<MySqlNode> {
        MySqlNode::connect(
            endpoint.clone(),
            &self.credentials,
            &self.config,
            self.retry.clone(),
        )
        .await
    }

    async fn disconnect(&self, node: MySqlNode) {
        node.close().await;
    }
}

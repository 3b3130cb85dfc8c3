//! Replication Module
//!
//! The operations a reconciliation needs from one database endpoint, and the
//! values they return.

mod dialect;
mod status;

pub use dialect::ReplicationDialect;
pub use status::ReplicationStatus;

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::Result;
use crate::gtid::ExplodedGtid;

/// Default MySQL port
pub const DEFAULT_PORT: u16 = 3306;

/// Network location of one database server
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct NodeEndpoint {
    pub host: String,
    pub port: u16,
}

impl NodeEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for NodeEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Identity and executed GTID set of one node at one point in time
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerSnapshot {
    pub server_uuid: String,
    pub executed_gtid_set: String,
    pub captured_at: DateTime<Utc>,
}

/// Output of `SHOW MASTER STATUS` / `SHOW BINARY LOG STATUS`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BinaryLogStatus {
    pub log_file: String,
    pub position: u64,
    pub executed_gtid_set: String,
}

/// Operations against one replication node.
///
/// Implementations apply their retry policy to every remote call and attach
/// the node and operation to any error they return.
#[async_trait::async_trait]
pub trait ReplicationNode: Send + Sync {
    /// Where this node lives
    fn endpoint(&self) -> &NodeEndpoint;

    /// `@@server_uuid`
    async fn server_identity(&self) -> Result<String>;

    /// `@@GLOBAL.GTID_EXECUTED`
    async fn executed_gtid_set(&self) -> Result<String>;

    /// Capture identity and executed set together
    async fn snapshot(&self) -> Result<ServerSnapshot> {
        let server_uuid = self.server_identity().await?;
        let executed_gtid_set = self.executed_gtid_set().await?;
        Ok(ServerSnapshot {
            server_uuid,
            executed_gtid_set,
            captured_at: Utc::now(),
        })
    }

    /// `target \ source`, computed by the server's own `GTID_SUBTRACT()`
    async fn compute_errant_set(&self, target_set: &str, source_set: &str) -> Result<String>;

    /// Current binary log file and executed GTID set
    async fn binary_log_status(&self) -> Result<BinaryLogStatus>;

    /// `SELECT VERSION()`
    async fn server_version(&self) -> Result<String>;

    /// Resolve which replica control vocabulary the server accepts
    async fn detect_dialect(&self) -> Result<ReplicationDialect> {
        let version = self.server_version().await?;
        let dialect = ReplicationDialect::from_version(&version);
        tracing::debug!(
            node = %self.endpoint(),
            %version,
            ?dialect,
            "Resolved replication dialect"
        );
        Ok(dialect)
    }

    /// Commit an empty transaction under `gtid`.
    ///
    /// `GTID_NEXT` is back to `AUTOMATIC` on every exit path.
    async fn inject_empty_transaction(&self, gtid: &ExplodedGtid) -> Result<()>;

    async fn stop_replication(&self, dialect: ReplicationDialect) -> Result<()>;

    async fn start_replication(&self, dialect: ReplicationDialect) -> Result<()>;

    /// `None` when the node is not configured as a replica
    async fn replication_status(
        &self,
        dialect: ReplicationDialect,
    ) -> Result<Option<ReplicationStatus>>;

    /// Toggle `sql_log_bin` for this node's session
    async fn set_binary_log_suppressed(&self, suppressed: bool) -> Result<()>;
}

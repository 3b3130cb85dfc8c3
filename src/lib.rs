//! gtids - Errant GTID Transaction Detection and Repair
//!
//! Compares the executed GTID set of a MySQL replication source with one or
//! more targets, reports transactions that exist on a target but never ran on
//! the source, and can neutralize them by committing empty transactions under
//! the same GTIDs.
//!
//! # Architecture
//!
//! - [`gtid`] parses GTID set strings and expands errant sets into a fix plan
//! - [`replication`] defines the operations a node must support
//! - [`executor`] implements those operations against MySQL with sqlx
//! - [`reconcile`] drives the per-target diff and repair workflow
//!
//! Set arithmetic that decides errancy is always delegated to the server's
//! `GTID_SUBTRACT()`; local parsing is only used to plan injections.

pub mod config;
pub mod credentials;
pub mod error;
pub mod executor;
pub mod gtid;
pub mod reconcile;
pub mod replication;
pub mod retry;

pub use config::ReconcileConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::ReconcileConfig;
    pub use crate::credentials::Credentials;
    pub use crate::error::{Error, Result};
    pub use crate::executor::{MySqlConnector, MySqlNode};
    pub use crate::gtid::{ExplodedGtid, FixPlan, GtidSet};
    pub use crate::reconcile::{FixMode, ReconcileOptions, ReconcileReport, Reconciler};
    pub use crate::replication::{NodeEndpoint, ReplicationNode};
    pub use crate::retry::RetryPolicy;
}

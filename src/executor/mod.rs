//! Database executors
//!
//! Concrete `ReplicationNode` implementations and the connectors that open them.

mod mysql;

pub use mysql::{MySqlConnector, MySqlNode};

//! Replica status
//!
//! `SHOW SLAVE STATUS` and `SHOW REPLICA STATUS` report the same fields under
//! different column names. This module reads either.

use std::collections::HashMap;

use serde::Serialize;

/// Subset of replica status used to verify a fix
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplicationStatus {
    pub source_host: Option<String>,
    pub io_running: Option<String>,
    pub sql_running: Option<String>,
    /// `None` when the server reports NULL (replication not running)
    pub seconds_behind: Option<i64>,
    pub sql_running_state: Option<String>,
    pub retrieved_gtid_set: String,
    pub executed_gtid_set: String,
    pub last_io_error: Option<String>,
    pub last_sql_error: Option<String>,
}

impl ReplicationStatus {
    /// Build from a column name to text map. NULL columns are simply absent.
    pub fn from_columns(columns: &HashMap<String, String>) -> Self {
        let pick = |names: &[&str]| -> Option<String> {
            names.iter().find_map(|name| columns.get(*name).cloned())
        };
        let non_empty = |value: Option<String>| value.filter(|v| !v.is_empty());

        Self {
            source_host: pick(&["Source_Host", "Master_Host"]),
            io_running: pick(&["Replica_IO_Running", "Slave_IO_Running"]),
            sql_running: pick(&["Replica_SQL_Running", "Slave_SQL_Running"]),
            seconds_behind: pick(&["Seconds_Behind_Source", "Seconds_Behind_Master"])
                .and_then(|v| v.trim().parse().ok()),
            sql_running_state: pick(&["Replica_SQL_Running_State", "Slave_SQL_Running_State"]),
            retrieved_gtid_set: pick(&["Retrieved_Gtid_Set"]).unwrap_or_default(),
            executed_gtid_set: pick(&["Executed_Gtid_Set"]).unwrap_or_default(),
            last_io_error: non_empty(pick(&["Last_IO_Error"])),
            last_sql_error: non_empty(pick(&["Last_SQL_Error"])),
        }
    }

    pub fn io_thread_running(&self) -> bool {
        self.io_running.as_deref() == Some("Yes")
    }

    pub fn sql_thread_running(&self) -> bool {
        self.sql_running.as_deref() == Some("Yes")
    }

    /// Both replication threads report running
    pub fn is_running(&self) -> bool {
        self.io_thread_running() && self.sql_thread_running()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn columns(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_legacy_columns() {
        let status = ReplicationStatus::from_columns(&columns(&[
            ("Master_Host", "db1"),
            ("Slave_IO_Running", "Yes"),
            ("Slave_SQL_Running", "Yes"),
            ("Seconds_Behind_Master", "3"),
            ("Slave_SQL_Running_State", "Waiting for master"),
            ("Retrieved_Gtid_Set", "u1:1-10"),
            ("Executed_Gtid_Set", "u1:1-10,u2:1"),
            ("Last_SQL_Error", ""),
        ]));

        assert_eq!(status.source_host.as_deref(), Some("db1"));
        assert_eq!(status.seconds_behind, Some(3));
        assert_eq!(status.executed_gtid_set, "u1:1-10,u2:1");
        assert_eq!(status.last_sql_error, None);
        assert!(status.is_running());
    }

    #[test]
    fn test_modern_columns() {
        let status = ReplicationStatus::from_columns(&columns(&[
            ("Source_Host", "db1"),
            ("Replica_IO_Running", "Connecting"),
            ("Replica_SQL_Running", "Yes"),
            ("Replica_SQL_Running_State", "Replica has read all relay log"),
            ("Last_IO_Error", "error connecting to source"),
        ]));

        assert_eq!(status.source_host.as_deref(), Some("db1"));
        assert_eq!(status.seconds_behind, None);
        assert!(!status.io_thread_running());
        assert!(status.sql_thread_running());
        assert!(!status.is_running());
        assert_eq!(status.last_io_error.as_deref(), Some("error connecting to source"));
        assert_eq!(status.retrieved_gtid_set, "");
    }
}

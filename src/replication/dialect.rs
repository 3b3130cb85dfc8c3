//! Replication command dialect
//!
//! MySQL 8.0.22 renamed the replica control statements. Both vocabularies do
//! the same thing; the server version decides which one is accepted.

use serde::Serialize;

/// First MySQL release that accepts `STOP REPLICA` and friends
const MODERN_SINCE: (u32, u32, u32) = (8, 0, 22);

/// Replica control vocabulary understood by a server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ReplicationDialect {
    /// `STOP SLAVE` / `START SLAVE` / `SHOW SLAVE STATUS`
    Legacy,
    /// `STOP REPLICA` / `START REPLICA` / `SHOW REPLICA STATUS`
    Modern,
}

impl ReplicationDialect {
    /// Resolve the dialect from a `SELECT VERSION()` string
    pub fn from_version(version: &str) -> Self {
        if version.to_ascii_lowercase().contains("mariadb") {
            return ReplicationDialect::Legacy;
        }
        match parse_version(version) {
            Some(v) if v >= MODERN_SINCE => ReplicationDialect::Modern,
            _ => ReplicationDialect::Legacy,
        }
    }

    pub fn stop_command(self) -> &'static str {
        match self {
            ReplicationDialect::Legacy => "STOP SLAVE",
            ReplicationDialect::Modern => "STOP REPLICA",
        }
    }

    pub fn start_command(self) -> &'static str {
        match self {
            ReplicationDialect::Legacy => "START SLAVE",
            ReplicationDialect::Modern => "START REPLICA",
        }
    }

    pub fn status_command(self) -> &'static str {
        match self {
            ReplicationDialect::Legacy => "SHOW SLAVE STATUS",
            ReplicationDialect::Modern => "SHOW REPLICA STATUS",
        }
    }
}

/// Leading `major.minor.patch` of a version string such as `8.0.36-log`
fn parse_version(version: &str) -> Option<(u32, u32, u32)> {
    let numeric: String = version
        .trim()
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let mut parts = numeric.split('.').map(|p| p.parse::<u32>().ok());
    let major = parts.next()??;
    let minor = parts.next().flatten().unwrap_or(0);
    let patch = parts.next().flatten().unwrap_or(0);
    Some((major, minor, patch))
}

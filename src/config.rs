//! gtids Configuration
//!
//! Tunables for connecting, retrying and driving replication during a
//! reconciliation run. Every field has a default, so the TOML file is
//! optional; hosts come from the command line.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReconcileConfig {
    /// Database connection configuration
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Retry configuration for remote operations
    #[serde(default)]
    pub retry: RetryConfig,

    /// Replica stop/start handling
    #[serde(default)]
    pub replication: ReplicationWaitConfig,

    /// Whole-run limits
    #[serde(default)]
    pub run: RunConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Database connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Default schema for the session
    #[serde(default = "default_database")]
    pub database: String,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Credentials file (`user=` / `password=` lines); defaults to `~/.my.cnf`
    #[serde(default)]
    pub credentials_file: Option<PathBuf>,
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts per remote operation, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Backoff unit in milliseconds
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

/// Replica restart handling after a replica-side fix
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationWaitConfig {
    /// Delay before the first status poll after START REPLICA
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,

    /// Interval between status polls
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Give up waiting for replication threads after this many seconds
    #[serde(default = "default_settle_timeout_secs")]
    pub settle_timeout_secs: u64,

    /// Budget for re-enabling binary logging and restarting replication,
    /// counted from the restore itself rather than from the run start
    #[serde(default = "default_restore_timeout_secs")]
    pub restore_timeout_secs: u64,
}

/// Whole-run limits
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunConfig {
    /// Overall deadline in seconds (0 = none)
    #[serde(default)]
    pub timeout_secs: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_database() -> String {
    "mysql".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_max_attempts() -> u32 {
    4
}

fn default_base_delay_ms() -> u64 {
    100
}

fn default_settle_delay_ms() -> u64 {
    2000
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_settle_timeout_secs() -> u64 {
    30
}

fn default_restore_timeout_secs() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            database: default_database(),
            connect_timeout_secs: default_connect_timeout(),
            credentials_file: None,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

impl Default for ReplicationWaitConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: default_settle_delay_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            settle_timeout_secs: default_settle_timeout_secs(),
            restore_timeout_secs: default_restore_timeout_secs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl ReconcileConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: ReconcileConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.retry.max_attempts == 0 {
            return Err(crate::Error::Config("retry.max_attempts must be at least 1".into()));
        }

        if self.replication.poll_interval_ms == 0 {
            return Err(crate::Error::Config(
                "replication.poll_interval_ms must be greater than 0".into(),
            ));
        }

        if self.replication.restore_timeout_secs == 0 {
            return Err(crate::Error::Config(
                "replication.restore_timeout_secs must be greater than 0".into(),
            ));
        }

        if self.connection.database.is_empty() {
            return Err(crate::Error::Config("connection.database cannot be empty".into()));
        }

        match self.logging.format.as_str() {
            "pretty" | "json" => {}
            other => {
                return Err(crate::Error::Config(format!(
                    "logging.format must be 'pretty' or 'json', got '{}'",
                    other
                )))
            }
        }

        Ok(())
    }

    /// Get connection timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connection.connect_timeout_secs)
    }

    /// Get the settle delay as Duration
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.replication.settle_delay_ms)
    }

    /// Get the status poll interval as Duration
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.replication.poll_interval_ms)
    }

    /// Get the replication start timeout as Duration
    pub fn settle_timeout(&self) -> Duration {
        Duration::from_secs(self.replication.settle_timeout_secs)
    }

    /// Get the restore budget as Duration
    pub fn restore_timeout(&self) -> Duration {
        Duration::from_secs(self.replication.restore_timeout_secs)
    }

    /// Get the overall run timeout, if any
    pub fn run_timeout(&self) -> Option<Duration> {
        match self.run.timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Resolve the credentials file path
    pub fn credentials_path(&self) -> crate::Result<PathBuf> {
        if let Some(path) = &self.connection.credentials_file {
            return Ok(path.clone());
        }
        let home = std::env::var_os("HOME").ok_or_else(|| {
            crate::Error::Credential("HOME is not set and no credentials_file configured".into())
        })?;
        Ok(PathBuf::from(home).join(".my.cnf"))
    }
}

//! gtids Error Types

use thiserror::Error;

/// Result type alias for gtids operations
pub type Result<T> = std::result::Result<T, Error>;

/// Message fragments that mark a failure as transient.
///
/// Matched case-insensitively against the full error text.
const TRANSIENT_SIGNATURES: &[&str] = &[
    "connection",
    "timeout",
    "timed out",
    "broken pipe",
    "connection refused",
];

/// gtids error types
#[derive(Error, Debug)]
pub enum Error {
    // Startup errors
    #[error("Credential error: {0}")]
    Credential(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // GTID errors
    #[error("GTID parse error: {0}")]
    Parse(String),

    // Node errors
    #[error("Connection failed to {endpoint}: {reason}")]
    Connection { endpoint: String, reason: String },

    #[error("{operation} failed on {node}: {source}")]
    Query {
        node: String,
        operation: &'static str,
        #[source]
        source: Box<Error>,
    },

    #[error("{operation} failed after {attempts} attempts: {source}")]
    RetryExhausted {
        operation: String,
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    #[error("Replication control failed on {node}: {reason}")]
    ReplicationControl { node: String, reason: String },

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    /// Check if this error is retryable
    ///
    /// Timeouts raised by the run deadline are terminal: retrying past the
    /// deadline would only fail again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Connection { .. } => true,
            Error::Database(e) => is_transient_message(&e.to_string()),
            Error::Io(e) => is_transient_message(&e.to_string()),
            Error::Query { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// Attach node and operation context to a remote failure
    pub fn query(node: impl Into<String>, operation: &'static str, source: Error) -> Self {
        Error::Query {
            node: node.into(),
            operation,
            source: Box::new(source),
        }
    }

    /// Build a replication control error
    pub fn replication_control(node: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::ReplicationControl {
            node: node.into(),
            reason: reason.into(),
        }
    }

    /// Check if this error must abort the whole run rather than one target
    ///
    /// The run deadline is shared, so a deadline timeout ends every target.
    pub fn is_run_fatal(&self) -> bool {
        match self {
            Error::Credential(_) | Error::Config(_) | Error::Timeout(_) | Error::Cancelled => true,
            Error::Query { source, .. } | Error::RetryExhausted { source, .. } => {
                source.is_run_fatal()
            }
            _ => false,
        }
    }
}

/// Substring classification used for driver errors whose type carries no
/// structured transient marker.
pub fn is_transient_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    TRANSIENT_SIGNATURES.iter().any(|sig| lower.contains(sig))
}

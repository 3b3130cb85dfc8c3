//! gtids - Errant GTID Transaction Detection and Repair
//!
//! Finds transactions executed on replication targets that the source never
//! ran, and optionally injects matching empty transactions to repair them.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use tokio::time::Instant;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gtids::config::ReconcileConfig;
use gtids::credentials::Credentials;
use gtids::error::{Error, Result};
use gtids::executor::MySqlConnector;
use gtids::reconcile::{FixMode, ReconcileOptions, ReconcileReport, Reconciler};
use gtids::replication::{NodeEndpoint, DEFAULT_PORT};
use gtids::retry::RetryPolicy;

/// gtids - find and repair errant GTID transactions
#[derive(Parser)]
#[command(name = "gtids")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Replication source host
    #[arg(short, long)]
    source: String,

    /// Target host(s), comma separated
    #[arg(short, long = "target", value_delimiter = ',', required = true)]
    targets: Vec<String>,

    /// Source port
    #[arg(long, default_value_t = DEFAULT_PORT)]
    source_port: u16,

    /// Port used for every target
    #[arg(long, default_value_t = DEFAULT_PORT)]
    target_port: u16,

    /// Inject errant transactions on the source as empty transactions
    #[arg(long, conflicts_with = "fix_replica")]
    fix: bool,

    /// Inject errant transactions on the replica with replication paused
    #[arg(long)]
    fix_replica: bool,

    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Report format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    /// Abort the whole run after this many seconds
    #[arg(long)]
    timeout: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

impl Cli {
    fn fix_mode(&self) -> FixMode {
        if self.fix {
            FixMode::Source
        } else if self.fix_replica {
            FixMode::Replica
        } else {
            FixMode::None
        }
    }

    fn source_endpoint(&self) -> NodeEndpoint {
        NodeEndpoint::new(self.source.trim(), self.source_port)
    }

    fn target_endpoints(&self) -> Vec<NodeEndpoint> {
        self.targets
            .iter()
            .map(|host| host.trim())
            .filter(|host| !host.is_empty())
            .map(|host| NodeEndpoint::new(host, self.target_port))
            .collect()
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    // Initialize logging
    init_logging(&config.logging.level, &config.logging.format);

    let report = match run(&cli, config).await {
        Ok(report) => report,
        Err(e) => {
            tracing::error!("Reconciliation failed: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = print_report(&report, cli.format) {
        tracing::error!("Failed to render report: {}", e);
        return ExitCode::FAILURE;
    }

    if report.has_failures() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

/// Load the optional config file and apply command line overrides
fn load_config(cli: &Cli) -> Result<ReconcileConfig> {
    let mut config = match &cli.config {
        Some(path) => ReconcileConfig::from_file(path)?,
        None => ReconcileConfig::default(),
    };

    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    if let Some(timeout) = cli.timeout {
        config.run.timeout_secs = timeout;
    }

    config.validate()?;
    Ok(config)
}

/// Initialize logging
fn init_logging(level: &str, format: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

async fn run(cli: &Cli, config: ReconcileConfig) -> Result<ReconcileReport> {
    let targets = cli.target_endpoints();
    if targets.is_empty() {
        return Err(Error::Config("at least one target host is required".into()));
    }

    let credentials_path = config.credentials_path()?;
    let credentials = Credentials::from_file(&credentials_path)?;
    tracing::debug!("Loaded credentials for {} from {:?}", credentials.user, credentials_path);

    let mut retry = RetryPolicy::from_config(&config.retry);
    let mut options = ReconcileOptions::from_config(&config, cli.fix_mode());
    if let Some(timeout) = config.run_timeout() {
        let deadline = Instant::now() + timeout;
        retry = retry.with_deadline(deadline);
        options = options.with_deadline(deadline);
        tracing::info!("Run deadline set to {:?}", timeout);
    }

    let connector = MySqlConnector::new(credentials, config, retry);
    let reconciler = Reconciler::new(connector, cli.source_endpoint(), targets, options);

    tokio::select! {
        result = reconciler.run() => result,
        _ = tokio::signal::ctrl_c() => {
            if cli.fix_replica {
                tracing::error!(
                    "Interrupted; replication on the target being repaired may still be \
                     stopped and binary logging suppressed"
                );
            } else {
                tracing::warn!("Interrupted");
            }
            Err(Error::Cancelled)
        }
    }
}

fn print_report(report: &ReconcileReport, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Text => println!("{}", report),
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(report)
                .map_err(|e| Error::Internal(format!("Failed to serialize report: {}", e)))?;
            println!("{}", json);
        }
    }
    Ok(())
}

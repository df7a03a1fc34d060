//! Operator command surface for the `risk-alerts` binary.
//!
//! Every command prints a single JSON document on stdout; logs go to stderr.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use risk_alert_core::{AlertConfig, AlertStore, RunId, RunStatus};
use risk_alert_delivery::{LogNotifier, ThreadSleeper, UreqTransport};
use risk_alert_orchestrator::{resolve_month, RunOrchestrator};
use risk_alert_source::LocalFileProvider;
use risk_alert_store_sqlite::SqliteAlertStore;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

/// Log filter used when `RUST_LOG` is unset or unparseable.
pub const DEFAULT_SOURCE: &str = "file://monthly_account_status.parquet";
pub const DEFAULT_LOG_DIRECTIVE: &str = "risk_alert=info";

#[derive(Debug, Parser)]
#[command(name = "risk-alerts")]
#[command(about = "Monthly account risk alerts")]
pub struct Cli {
    #[arg(long, env = "RISK_ALERTS_DB", default_value = "./risk_alerts.sqlite3", global = true)]
    db: PathBuf,

    /// JSON configuration file; unset fields keep their defaults.
    #[arg(long, env = "RISK_ALERTS_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(flatten)]
    overrides: ConfigOverrides,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Default, Args)]
pub struct ConfigOverrides {
    #[arg(long, env = "WEBHOOK_BASE_URL", global = true)]
    webhook_base_url: Option<String>,
    #[arg(long, env = "WEBHOOK_URL", global = true)]
    webhook_url: Option<String>,
    #[arg(long, env = "ARR_THRESHOLD", global = true)]
    arr_threshold: Option<i64>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Compute and deliver alerts for a month.
    Run(RunArgs),
    /// Show counters and sample outcomes of a run.
    Status(StatusArgs),
    /// Compute alerts without recording or sending anything.
    Preview(PreviewArgs),
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// `file://` locator or path to a `.parquet` or `.csv` snapshot.
    #[arg(long, env = "SOURCE_URI", default_value = DEFAULT_SOURCE)]
    source: String,
    /// `auto` for the previous calendar month, or a `YYYY-MM-01` date.
    #[arg(long, default_value = "auto")]
    month: String,
    #[arg(long)]
    dry_run: bool,
}

#[derive(Debug, Args)]
pub struct StatusArgs {
    #[arg(long)]
    run_id: String,
}

#[derive(Debug, Args)]
pub struct PreviewArgs {
    #[arg(long, env = "SOURCE_URI", default_value = DEFAULT_SOURCE)]
    source: String,
    #[arg(long, default_value = "auto")]
    month: String,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    Show,
}

/// Filter from `RUST_LOG`, falling back to [`DEFAULT_LOG_DIRECTIVE`].
#[must_use]
pub fn log_filter() -> EnvFilter {
    log_filter_from(std::env::var(EnvFilter::DEFAULT_ENV).ok().as_deref())
}

fn log_filter_from(rust_log: Option<&str>) -> EnvFilter {
    rust_log
        .filter(|raw| !raw.trim().is_empty())
        .and_then(|raw| EnvFilter::try_new(raw).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_LOG_DIRECTIVE))
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when configuration loading, store access or the
/// requested command fails. A run that finishes as `failed` is an error
/// after its summary is printed.
pub fn run_cli(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_deref(), &cli.overrides)?;

    match cli.command {
        Command::Config {
            command: ConfigCommand::Show,
        } => print_json(&serde_json::to_value(&config)?),
        Command::Preview(args) => {
            let month = resolve_month(&args.month)?;
            // Preview never touches the run database.
            let store = SqliteAlertStore::open(Path::new(":memory:"))?;
            let report = with_orchestrator(&config, &store, |orchestrator| {
                orchestrator.preview(&args.source, month)
            })?;
            print_json(&serde_json::to_value(report)?)
        }
        Command::Run(args) => {
            let month = resolve_month(&args.month)?;
            let store = open_store(&cli.db)?;
            let summary = with_orchestrator(&config, &store, |orchestrator| {
                orchestrator.process_run(&args.source, month, args.dry_run)
            })?;
            print_json(&serde_json::to_value(&summary)?)?;
            match summary.status {
                RunStatus::Failed => Err(anyhow!(
                    "run {} failed: {}",
                    summary.run_id,
                    summary.error.unwrap_or_default()
                )),
                RunStatus::Running | RunStatus::Succeeded => Ok(()),
            }
        }
        Command::Status(args) => {
            let run_id: RunId = args.run_id.parse()?;
            let store = open_store(&cli.db)?;
            let report = with_orchestrator(&config, &store, |orchestrator| {
                orchestrator.run_status(run_id)
            })?
            .ok_or_else(|| anyhow!("run {run_id} not found"))?;
            print_json(&serde_json::to_value(report)?)
        }
    }
}

/// Loads the optional JSON config file and applies flag/env overrides.
///
/// # Errors
/// Returns an error when the file cannot be read or the resulting
/// configuration is invalid.
pub fn load_config(path: Option<&Path>, overrides: &ConfigOverrides) -> Result<AlertConfig> {
    let mut config = match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {}", path.display()))?;
            let value: Value = serde_json::from_str(&raw)
                .with_context(|| format!("config file {} is not valid JSON", path.display()))?;
            AlertConfig::from_json(&value)?
        }
        None => AlertConfig::default(),
    };

    if let Some(url) = &overrides.webhook_base_url {
        config.webhook_base_url = Some(url.clone());
    }
    if let Some(url) = &overrides.webhook_url {
        config.webhook_url = Some(url.clone());
    }
    if let Some(threshold) = overrides.arr_threshold {
        config.arr_threshold = threshold;
    }

    config.validate()?;
    Ok(config)
}

fn open_store(path: &Path) -> Result<SqliteAlertStore> {
    let store = SqliteAlertStore::open(path)?;
    store.migrate()?;
    tracing::debug!(db = %path.display(), "alert store ready");
    Ok(store)
}

fn with_orchestrator<T>(
    config: &AlertConfig,
    store: &SqliteAlertStore,
    action: impl FnOnce(&RunOrchestrator<'_>) -> Result<T>,
) -> Result<T> {
    let provider = LocalFileProvider::new();
    let transport = UreqTransport::new(config.request_timeout());
    let sleeper = ThreadSleeper;
    let notifier = LogNotifier::new(&config.support_contact);
    let orchestrator =
        RunOrchestrator::new(config, store, &provider, &transport, &sleeper, &notifier);
    action(&orchestrator)
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

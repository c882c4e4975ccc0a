//! CLI for the tally metric repository.
//!
//! Provides commands for reading, updating, importing and probing metric
//! storage.

use std::path::{Path, PathBuf};
use std::sync::mpsc;

use clap::{Parser, Subcommand, ValueEnum};
use tally::config::{FileConfig, SqliteConfig};
use tally::{
    BatchUpdateService, Metric, MetricKey, MetricKind, MetricRequest, StorageConfig, UpdateService,
};
use tracing_subscriber::{EnvFilter, fmt};

/// Default database file for `--backend sqlite` without `--path`.
const DEFAULT_SQLITE_PATH: &str = "metrics.db";

/// Gauge and counter metric repository CLI.
#[derive(Parser)]
#[command(name = "tally", version, about)]
struct Cli {
    /// JSON storage config file. Overrides the backend flags.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Storage backend.
    #[arg(long, global = true, default_value = "file")]
    backend: Backend,

    /// Snapshot or database path.
    #[arg(long, global = true)]
    path: Option<PathBuf>,

    /// File backend flush interval in seconds (0 = flush on every write).
    #[arg(long, global = true, default_value = "0")]
    flush_interval: i64,

    #[command(subcommand)]
    command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Print one metric as JSON.
    Get {
        /// Metric kind (gauge or counter).
        kind: MetricKind,

        /// Metric id.
        id: String,
    },

    /// List all metrics sorted by kind and id.
    List {
        /// Output format.
        #[arg(long, default_value = "csv")]
        format: OutputFormat,
    },

    /// Apply a single gauge or counter update.
    Update {
        /// Metric kind (gauge or counter).
        kind: MetricKind,

        /// Metric id.
        id: String,

        /// Gauge value or counter delta.
        #[arg(allow_hyphen_values = true)]
        value: String,
    },

    /// Apply a JSON array of update requests as one batch.
    Import {
        /// Path to the request file.
        file: PathBuf,
    },

    /// Check that the backend is reachable.
    Ping,
}

/// Storage backend selected on the command line.
#[derive(Clone, Copy, ValueEnum)]
enum Backend {
    /// In-process only; nothing survives the command.
    Memory,
    /// JSON snapshot file.
    File,
    /// SQLite database.
    Sqlite,
}

/// Output format for listings.
#[derive(Clone, ValueEnum)]
enum OutputFormat {
    /// Comma-separated values.
    Csv,
    /// JSON array of objects.
    Json,
}

fn main() {
    fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

/// Opens storage, runs the command and shuts storage down again.
fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = storage_config(&cli)?;
    let (stop, shutdown) = mpsc::channel();
    let storage = config.open(shutdown)?;
    tracing::debug!(?config, "storage opened");

    let updates = UpdateService::new(storage.repository.clone());
    let result = match cli.command {
        Commands::Get { kind, id } => cmd_get(&updates, kind, id),
        Commands::List { format } => cmd_list(&updates, &format),
        Commands::Update { kind, id, value } => cmd_update(&updates, kind, &id, &value),
        Commands::Import { file } => {
            cmd_import(&BatchUpdateService::new(storage.repository.clone()), &file)
        }
        Commands::Ping => cmd_ping(&updates),
    };

    // Close even when the command failed so pending writes are flushed.
    let closed = storage.shutdown(stop);
    result?;
    closed?;
    Ok(())
}

/// Builds the storage config from `--config` or the backend flags.
fn storage_config(cli: &Cli) -> Result<StorageConfig, Box<dyn std::error::Error>> {
    if let Some(path) = &cli.config {
        return Ok(StorageConfig::load(path)?);
    }

    let config = match cli.backend {
        Backend::Memory => StorageConfig::Memory,
        Backend::File => StorageConfig::File(FileConfig {
            path: cli
                .path
                .clone()
                .unwrap_or_else(|| PathBuf::from(tally::config::DEFAULT_FILE_PATH)),
            flush_interval_secs: cli.flush_interval,
            restore: true,
        }),
        Backend::Sqlite => StorageConfig::Sqlite(SqliteConfig::new(
            cli.path
                .as_deref()
                .unwrap_or_else(|| Path::new(DEFAULT_SQLITE_PATH)),
        )),
    };
    config.validate()?;
    Ok(config)
}

/// Implements `tally get <kind> <id>`.
fn cmd_get(
    updates: &UpdateService,
    kind: MetricKind,
    id: String,
) -> Result<(), Box<dyn std::error::Error>> {
    let metric = updates.find(&MetricKey::new(kind, id))?;
    println!("{}", serde_json::to_string_pretty(&metric)?);
    Ok(())
}

/// Implements `tally list`.
fn cmd_list(updates: &UpdateService, format: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    let metrics = updates.find_all()?;

    match format {
        OutputFormat::Csv => {
            println!("type,id,value,delta");
            for metric in &metrics {
                println!("{}", csv_row(metric));
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&metrics)?);
        }
    }

    Ok(())
}

/// Implements `tally update <kind> <id> <value>`.
fn cmd_update(
    updates: &UpdateService,
    kind: MetricKind,
    id: &str,
    raw: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let request = MetricRequest::parse(kind, id, raw)?;
    let stored = updates.update(&request)?;
    println!("{}", serde_json::to_string_pretty(&stored)?);
    Ok(())
}

/// Implements `tally import <file>`.
fn cmd_import(batch: &BatchUpdateService, file: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let contents = std::fs::read_to_string(file)
        .map_err(|e| format!("cannot read '{}': {e}", file.display()))?;
    let requests: Vec<MetricRequest> = serde_json::from_str(&contents)?;

    let stored = batch.update(&requests)?;
    println!(
        "Imported {} requests into {} metrics",
        requests.len(),
        stored.len()
    );
    Ok(())
}

/// Implements `tally ping`.
fn cmd_ping(updates: &UpdateService) -> Result<(), Box<dyn std::error::Error>> {
    updates.ping()?;
    println!("ok");
    Ok(())
}

/// Formats one metric as a CSV row; absent fields are empty.
fn csv_row(metric: &Metric) -> String {
    let value = metric.value.map(|v| v.to_string()).unwrap_or_default();
    let delta = metric.delta.map(|d| d.to_string()).unwrap_or_default();
    format!("{},{},{value},{delta}", metric.kind, metric.id)
}

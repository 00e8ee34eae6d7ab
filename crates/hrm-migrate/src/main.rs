//! HRM Migrate - Main entry point

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hrm_common::logging::{init_logging, LogConfig, LogLevel};
use hrm_common::types::TableKind;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use hrm_migrate::{
    config::Config,
    db::{self, PgStore, PgValidationLog},
    ingest::{BulkLoader, EnvelopeSource, JsonLinesSource, MigrationOrchestrator, StreamConsumer},
    storage::Storage,
};

#[derive(Parser, Debug)]
#[command(name = "hrm-migrate")]
#[command(author, version, about = "Load, back up and restore HR tables", long_about = None)]
#[command(arg_required_else_help = true)]
struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Truncate-load departments, jobs and hired employees, stopping at the
    /// first table that fails
    Migrate,

    /// Truncate-load every table and print a per-table status
    MigrateAll,

    /// Back up a table to Parquet partitions in object storage
    Backup {
        /// departments, jobs or hired_employees
        table: TableKind,

        /// Rows per partition file
        #[arg(long)]
        chunk_size: Option<usize>,
    },

    /// Replace a table's contents with a backup snapshot
    Restore {
        /// departments, jobs or hired_employees
        table: TableKind,

        /// Snapshot URI, prefix or timestamp (defaults to the latest)
        snapshot: Option<String>,

        /// Rows per load chunk
        #[arg(long)]
        chunk_size: Option<usize>,
    },

    /// Ingest newline-delimited JSON envelopes until EOF or Ctrl+C
    Consume {
        /// Read envelopes from a file instead of stdin
        #[arg(short, long)]
        input: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let mut log_config = LogConfig::builder()
        .level(if cli.verbose { LogLevel::Debug } else { LogLevel::Info })
        .log_file_prefix("hrm-migrate")
        .filter_directives("sqlx=warn,aws_config=warn,aws_smithy_runtime=warn")
        .build();

    // Environment variables take precedence
    if let Err(e) = log_config.apply_env() {
        eprintln!("Ignoring invalid logging configuration: {:#}", e);
    }
    let _guard = match init_logging(&log_config) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {:#}", e);
            None
        }
    };

    if let Err(e) = run(cli.command).await {
        error!(error = %format!("{:#}", e), "Command failed");
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

async fn run(command: Commands) -> Result<()> {
    let config = Config::load().context("Failed to load configuration")?;

    let pool = db::create_pool(&config.database)
        .await
        .context("Failed to connect to database")?;
    db::run_migrations(&pool).await?;
    info!("Database ready");

    let store = Arc::new(PgStore::new(pool.clone()));
    let validation_log = Arc::new(PgValidationLog::new(pool));

    match command {
        Commands::Migrate => {
            let orchestrator = orchestrator(&config, store, validation_log).await?;
            for (table, report) in orchestrator.run_sequential().await? {
                println!(
                    "{}: {} rows loaded, {} of {} records rejected",
                    table, report.load.rows_loaded, report.stats.failed, report.stats.total
                );
            }
        }
        Commands::MigrateAll => {
            let orchestrator = orchestrator(&config, store, validation_log).await?;
            let summary = orchestrator.run_full_migration().await;
            println!("{}", serde_json::to_string_pretty(&summary)?);

            let failed = summary.values().filter(|status| !status.is_success()).count();
            if failed > 0 {
                anyhow::bail!("{} of {} tables did not migrate", failed, summary.len());
            }
        }
        Commands::Backup { table, chunk_size } => {
            let orchestrator = orchestrator(&config, store, validation_log).await?;
            let report = orchestrator.backup_table(table, chunk_size).await?;
            println!(
                "{} ({} partitions, {} rows)",
                report.snapshot_uri, report.partitions, report.rows
            );
        }
        Commands::Restore {
            table,
            snapshot,
            chunk_size,
        } => {
            let orchestrator = orchestrator(&config, store, validation_log).await?;
            let report = orchestrator
                .restore_table(table, snapshot.as_deref(), chunk_size)
                .await?;
            println!(
                "{}: restored {} rows from {}",
                table,
                report.rows_restored(),
                report.snapshot_prefix
            );
        }
        Commands::Consume { input } => {
            let loader = BulkLoader::new(store.clone(), config.pipeline.batch_size);
            let consumer =
                StreamConsumer::from_config(&config.pipeline, loader, store, validation_log)?;

            let mut source: Box<dyn EnvelopeSource> = match input {
                Some(path) => Box::new(
                    JsonLinesSource::open(&path)
                        .await
                        .with_context(|| format!("Failed to open {}", path.display()))?,
                ),
                None => Box::new(JsonLinesSource::stdin()),
            };

            let cancel = CancellationToken::new();
            tokio::spawn(cancel_on_shutdown(cancel.clone()));

            let stats = consumer.run(source.as_mut(), cancel).await?;
            println!(
                "{} messages: {} accepted, {} rejected, {} malformed, {} rows loaded, {} failed loads",
                stats.messages,
                stats.accepted,
                stats.rejected,
                stats.malformed,
                stats.rows_loaded,
                stats.failed_loads
            );
        }
    }

    Ok(())
}

async fn orchestrator(
    config: &Config,
    store: Arc<PgStore>,
    validation_log: Arc<PgValidationLog>,
) -> Result<MigrationOrchestrator> {
    let storage = Storage::new(config.storage.clone())
        .await
        .context("Failed to initialize object storage")?;
    storage.ensure_bucket().await?;

    Ok(MigrationOrchestrator::new(
        &config.pipeline,
        store.clone(),
        store,
        validation_log,
        Arc::new(storage),
    )?)
}

/// Cancel `token` on Ctrl+C or SIGTERM
async fn cancel_on_shutdown(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, flushing and stopping"),
        _ = terminate => info!("Received terminate signal, flushing and stopping"),
    }
    token.cancel();
}

//! HRM Migration Library
//!
//! Loads HR records (departments, jobs, hired employees) from delimited-text
//! files or a stream of envelope messages into PostgreSQL, and snapshots
//! tables to Parquet in S3-compatible object storage.
//!
//! # Overview
//!
//! - **Validation**: business rules per record kind; rejects are values that
//!   go to the `data_migration_logs` table, never errors
//! - **Loading**: COPY-based bulk loads in fixed-size chunks, one transaction
//!   per chunk, with truncate-then-load and append variants
//! - **Streaming**: per-table buffers flushed by size or idle time
//! - **Backups**: cursor-streamed Parquet partitions under
//!   `backups/{table}/{YYYYMMDDTHHMMSS}/`, and restore from them
//! - **Configuration**: environment-based, see [`config::Config`]
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use hrm_migrate::{config::Config, db, ingest::MigrationOrchestrator, storage::Storage};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load()?;
//!     let pool = db::create_pool(&config.database).await?;
//!     let store = Arc::new(db::PgStore::new(pool.clone()));
//!     let orchestrator = MigrationOrchestrator::new(
//!         &config.pipeline,
//!         store.clone(),
//!         store,
//!         Arc::new(db::PgValidationLog::new(pool)),
//!         Arc::new(Storage::new(config.storage).await?),
//!     )?;
//!     let summary = orchestrator.run_full_migration().await;
//!     println!("{}", serde_json::to_string_pretty(&summary)?);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod db;
pub mod error;
pub mod ingest;
pub mod storage;

// Re-export commonly used types
pub use error::{PipelineError, PipelineResult};

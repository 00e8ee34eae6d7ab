//! Ingestion pipeline
//!
//! # Architecture
//!
//! - **validator**: business rules for raw records, returning a verdict value
//! - **accumulator**: per-table buffers flushed by size or idle time
//! - **loader**: chunked bulk loads with truncate-then-load and append variants
//! - **csv_source**: streamed delimited-text files with header detection
//! - **envelope** / **consumer**: streamed `{table, payload}` messages
//! - **backup** / **restore**: Parquet snapshots in object storage
//! - **orchestrator**: per-table migration sequencing and manual operations
//! - **validation_log**: rejected records and batch summaries
//!
//! Data flows raw record → validator → accumulator or file chunk → loader →
//! store, and store → backup → object storage → restore → loader → store.

pub mod accumulator;
pub mod backup;
pub mod consumer;
pub mod csv_source;
pub mod envelope;
pub mod loader;
pub mod orchestrator;
pub mod restore;
pub mod validation_log;
pub mod validator;

#[cfg(test)]
pub mod testing;

pub use accumulator::{AccumulatorConfig, AppendOutcome, BatchAccumulator};
pub use backup::{BackupReport, ColumnarBackupWriter};
pub use consumer::{ConsumerStats, StreamConsumer};
pub use csv_source::{CsvLoadReport, CsvTableLoader};
pub use envelope::{Envelope, EnvelopeSource, JsonLinesSource, Polled};
pub use loader::{BulkLoader, IdMode, LoadReport, TableCursor, TableStore};
pub use orchestrator::{MigrationOrchestrator, MigrationSummary, TableStatus};
pub use restore::{ColumnarBackupReader, RestoreReport};
pub use validation_log::{BatchStats, ValidationLog, ValidationLogEntry};
pub use validator::{RecordValidator, ReferenceLookup, ReplacingTarget, Verdict};

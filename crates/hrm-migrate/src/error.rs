//! Pipeline error types
//!
//! Business-rule violations never show up here; they are
//! [`Rejection`](hrm_common::types::Rejection) values. A `PipelineError` means
//! the store, object storage or local filesystem failed, or a backup is not
//! usable.

use hrm_common::types::TableKind;
use thiserror::Error;

use crate::db::DbError;

/// Result type alias for pipeline operations
pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Object storage error: {0:#}")]
    Storage(anyhow::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv_async::Error),

    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("Blocking task failed: {0}")]
    Blocking(#[from] tokio::task::JoinError),

    #[error("HRM error: {0}")]
    Hrm(#[from] hrm_common::HrmError),

    #[error("Source file not found: {0}")]
    FileNotFound(String),

    #[error("Invalid file structure for {table}: {message}")]
    InvalidStructure { table: TableKind, message: String },

    #[error("Load of {table} failed at chunk {chunk} after {committed_rows} committed rows: {source}")]
    ChunkFailed {
        table: TableKind,
        chunk: usize,
        committed_rows: u64,
        #[source]
        source: DbError,
    },

    #[error("Invalid name pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("Record of table {found} handed to loader for {expected}")]
    KindMismatch { expected: TableKind, found: TableKind },

    #[error("No backup found for table {0}")]
    NoBackupFound(TableKind),

    #[error("Snapshot {0} contains no partitions")]
    NoPartitions(String),

    #[error("Invalid backup data: {0}")]
    InvalidBackup(String),

    #[error("Envelope source error: {0}")]
    Source(String),

    #[error("Migration stopped at {table}: {source}")]
    TableFailed {
        table: TableKind,
        #[source]
        source: Box<PipelineError>,
    },
}

impl PipelineError {
    /// Wrap an object-storage failure
    pub fn storage(err: anyhow::Error) -> Self {
        Self::Storage(err)
    }

    pub fn invalid_backup(message: impl Into<String>) -> Self {
        Self::InvalidBackup(message.into())
    }
}

impl From<sqlx::Error> for PipelineError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database(DbError::from(err))
    }
}

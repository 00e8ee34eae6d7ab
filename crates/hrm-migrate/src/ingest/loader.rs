//! Bulk loading into the relational store
//!
//! Rows are copied in fixed-size chunks, one transaction per chunk. A failing
//! chunk aborts the load but leaves every earlier chunk committed. Employee
//! rows are split into rows carrying an explicit id and rows that let the
//! store assign one; the two groups are loaded one after the other and never
//! share a transaction.

use std::sync::Arc;

use async_trait::async_trait;
use hrm_common::types::{Record, TableKind};
use tracing::{debug, error, info, instrument, warn};

use crate::config::DEFAULT_BATCH_SIZE;
use crate::db::DbResult;
use crate::error::{PipelineError, PipelineResult};

/// Whether the id column is part of a bulk copy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdMode {
    /// Rows carry their id
    Explicit,
    /// The id column is omitted and the store assigns identity values
    StoreAssigned,
}

/// Store primitives used by the loader and by backups
#[async_trait]
pub trait TableStore: Send + Sync {
    /// Remove every row and reset the identity sequence
    async fn truncate(&self, table: TableKind) -> DbResult<()>;

    /// Copy `rows` in a single transaction, returning the number of rows written
    async fn copy_rows(&self, table: TableKind, mode: IdMode, rows: &[Record]) -> DbResult<u64>;

    /// Stream the table ordered by id, `fetch_size` rows per round trip
    async fn open_cursor(&self, table: TableKind, fetch_size: usize) -> DbResult<Box<dyn TableCursor>>;
}

/// Server-side cursor over one table
#[async_trait]
pub trait TableCursor: Send {
    /// Next window of rows, `None` once the table is exhausted
    async fn next_window(&mut self) -> DbResult<Option<Vec<Record>>>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub rows_loaded: u64,
    pub chunks: usize,
    /// Whether a preceding truncate succeeded (always false when appending)
    pub truncated: bool,
}

#[derive(Clone)]
pub struct BulkLoader {
    store: Arc<dyn TableStore>,
    chunk_size: usize,
}

impl BulkLoader {
    pub fn new(store: Arc<dyn TableStore>, chunk_size: usize) -> Self {
        Self {
            store,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn with_default_chunks(store: Arc<dyn TableStore>) -> Self {
        Self::new(store, DEFAULT_BATCH_SIZE)
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn store(&self) -> &Arc<dyn TableStore> {
        &self.store
    }

    /// Loader sharing this store with a different chunk size
    pub fn with_chunk_size(&self, chunk_size: usize) -> Self {
        Self::new(Arc::clone(&self.store), chunk_size)
    }

    /// Truncate `table`. Failure is logged and reported as `false`; it never
    /// stops the load that follows.
    pub async fn truncate_best_effort(&self, table: TableKind) -> bool {
        match self.store.truncate(table).await {
            Ok(()) => {
                info!(table = %table, "Truncated table with RESTART IDENTITY");
                true
            }
            Err(e) => {
                warn!(table = %table, error = %e, "Truncate failed, continuing with load");
                false
            }
        }
    }

    /// Truncate `table`, then load `rows` into it
    #[instrument(skip(self, rows), fields(rows = rows.len()))]
    pub async fn load_replacing(&self, table: TableKind, rows: Vec<Record>) -> PipelineResult<LoadReport> {
        check_kinds(table, &rows)?;
        let truncated = self.truncate_best_effort(table).await;
        let mut report = self.load_appending(table, rows).await?;
        report.truncated = truncated;
        Ok(report)
    }

    /// Load `rows` without truncating. Employee rows without an id get one
    /// from the store.
    #[instrument(skip(self, rows), fields(rows = rows.len()))]
    pub async fn load_appending(&self, table: TableKind, rows: Vec<Record>) -> PipelineResult<LoadReport> {
        let mut report = LoadReport::default();
        self.append_into(table, rows, &mut report).await?;

        info!(
            table = %table,
            rows = report.rows_loaded,
            chunks = report.chunks,
            "Bulk load complete"
        );
        Ok(report)
    }

    /// Append `rows`, adding to a report shared by several calls. Chunk
    /// numbers and committed row counts in errors are relative to `report`.
    pub async fn append_into(
        &self,
        table: TableKind,
        rows: Vec<Record>,
        report: &mut LoadReport,
    ) -> PipelineResult<()> {
        check_kinds(table, &rows)?;

        let (explicit, assigned): (Vec<Record>, Vec<Record>) =
            rows.into_iter().partition(|record| record.id().is_some());

        for (mode, group) in [(IdMode::Explicit, explicit), (IdMode::StoreAssigned, assigned)] {
            if group.is_empty() {
                continue;
            }
            self.load_chunks(table, mode, &group, report).await?;
        }
        Ok(())
    }

    async fn load_chunks(
        &self,
        table: TableKind,
        mode: IdMode,
        rows: &[Record],
        report: &mut LoadReport,
    ) -> PipelineResult<()> {
        let total_chunks = rows.len().div_ceil(self.chunk_size);

        for (index, chunk) in rows.chunks(self.chunk_size).enumerate() {
            debug!(
                table = %table,
                ?mode,
                chunk = index + 1,
                total_chunks,
                rows = chunk.len(),
                "Copying chunk"
            );

            match self.store.copy_rows(table, mode, chunk).await {
                Ok(copied) => {
                    report.rows_loaded += copied;
                    report.chunks += 1;
                }
                Err(source) => {
                    error!(
                        table = %table,
                        chunk = index + 1,
                        committed_rows = report.rows_loaded,
                        error = %source,
                        "Chunk load failed"
                    );
                    return Err(PipelineError::ChunkFailed {
                        table,
                        chunk: report.chunks + 1,
                        committed_rows: report.rows_loaded,
                        source,
                    });
                }
            }
        }

        Ok(())
    }
}

fn check_kinds(table: TableKind, rows: &[Record]) -> PipelineResult<()> {
    match rows.iter().find(|record| record.kind() != table) {
        Some(record) => Err(PipelineError::KindMismatch {
            expected: table,
            found: record.kind(),
        }),
        None => Ok(()),
    }
}

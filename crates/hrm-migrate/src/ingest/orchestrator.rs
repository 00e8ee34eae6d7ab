//! Migration orchestrator
//!
//! Runs the per-table steps in dependency order (departments, jobs, hired
//! employees): check the source file, stage it in object storage, then
//! truncate-load it from the staged copy. Also the entry point for manual
//! backups and restores.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use hrm_common::types::TableKind;
use serde::Serialize;
use tracing::{error, info, instrument, warn};

use crate::config::PipelineConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::ingest::backup::{BackupReport, ColumnarBackupWriter};
use crate::ingest::csv_source::{CsvLoadReport, CsvTableLoader};
use crate::ingest::loader::{BulkLoader, TableStore};
use crate::ingest::restore::{ColumnarBackupReader, RestoreReport};
use crate::ingest::validation_log::ValidationLog;
use crate::ingest::validator::{RecordValidator, ReferenceLookup};
use crate::storage::ObjectStore;

/// Object key a table's source file is staged under
pub fn staging_key(table: TableKind) -> String {
    format!("raw_data/{}/{}", table.table_name(), table.file_name())
}

/// Outcome of one table in a full migration
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TableStatus {
    Success {
        total: u64,
        rejected: u64,
        rows_loaded: u64,
    },
    Failed {
        error: String,
    },
    FileNotFound,
}

impl TableStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TableStatus::Success { .. } => "success",
            TableStatus::Failed { .. } => "failed",
            TableStatus::FileNotFound => "file_not_found",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TableStatus::Success { .. })
    }
}

impl From<&CsvLoadReport> for TableStatus {
    fn from(report: &CsvLoadReport) -> Self {
        TableStatus::Success {
            total: report.stats.total,
            rejected: report.stats.failed,
            rows_loaded: report.load.rows_loaded,
        }
    }
}

/// Per-table outcome of [`MigrationOrchestrator::run_full_migration`]
pub type MigrationSummary = BTreeMap<TableKind, TableStatus>;

pub struct MigrationOrchestrator {
    data_dir: PathBuf,
    validator: RecordValidator,
    loader: BulkLoader,
    lookup: Arc<dyn ReferenceLookup>,
    log: Arc<dyn ValidationLog>,
    objects: Arc<dyn ObjectStore>,
    backup_fetch_size: usize,
    backup_write_chunk_size: usize,
}

impl MigrationOrchestrator {
    pub fn new(
        config: &PipelineConfig,
        store: Arc<dyn TableStore>,
        lookup: Arc<dyn ReferenceLookup>,
        log: Arc<dyn ValidationLog>,
        objects: Arc<dyn ObjectStore>,
    ) -> PipelineResult<Self> {
        Ok(Self {
            data_dir: config.data_dir.clone(),
            validator: RecordValidator::new()?,
            loader: BulkLoader::new(store, config.batch_size),
            lookup,
            log,
            objects,
            backup_fetch_size: config.backup_fetch_size,
            backup_write_chunk_size: config.backup_write_chunk_size,
        })
    }

    /// Stage and truncate-load one table from its source file
    #[instrument(skip(self))]
    pub async fn migrate_table(&self, table: TableKind) -> PipelineResult<CsvLoadReport> {
        let path = self.data_dir.join(table.file_name());
        if !tokio::fs::try_exists(&path).await? {
            return Err(PipelineError::FileNotFound(path.display().to_string()));
        }

        let key = staging_key(table);
        self.objects
            .put_file(&key, &path)
            .await
            .map_err(PipelineError::storage)?;
        info!(table = %table, uri = %self.objects.uri(&key), "Staged source file");

        let reader = self
            .objects
            .open_read(&key)
            .await
            .map_err(PipelineError::storage)?;

        CsvTableLoader {
            validator: &self.validator,
            loader: &self.loader,
            lookup: self.lookup.as_ref(),
            log: self.log.as_ref(),
        }
        .load_replacing(table, reader)
        .await
    }

    /// Migrate every table in load order, stopping at the first failure so
    /// that no table is loaded before the tables it references.
    pub async fn run_sequential(&self) -> PipelineResult<Vec<(TableKind, CsvLoadReport)>> {
        let mut completed = Vec::with_capacity(TableKind::LOAD_ORDER.len());

        for table in TableKind::LOAD_ORDER {
            match self.migrate_table(table).await {
                Ok(report) => completed.push((table, report)),
                Err(e) => {
                    error!(table = %table, error = %e, "Migration stopped");
                    return Err(PipelineError::TableFailed {
                        table,
                        source: Box::new(e),
                    });
                }
            }
        }

        info!(tables = completed.len(), "Sequential migration complete");
        Ok(completed)
    }

    /// Migrate every table in load order and report each table's status,
    /// continuing past failures.
    pub async fn run_full_migration(&self) -> MigrationSummary {
        let mut summary = MigrationSummary::new();

        for table in TableKind::LOAD_ORDER {
            let status = match self.migrate_table(table).await {
                Ok(report) => TableStatus::from(&report),
                Err(PipelineError::FileNotFound(path)) => {
                    warn!(table = %table, path = %path, "Source file not found");
                    TableStatus::FileNotFound
                }
                Err(e) => {
                    error!(table = %table, error = %e, "Table migration failed");
                    TableStatus::Failed { error: e.to_string() }
                }
            };
            summary.insert(table, status);
        }

        summary
    }

    /// Back up `table`, optionally overriding the partition size
    pub async fn backup_table(
        &self,
        table: TableKind,
        write_chunk_size: Option<usize>,
    ) -> PipelineResult<BackupReport> {
        ColumnarBackupWriter::new(Arc::clone(self.loader.store()), Arc::clone(&self.objects))
            .with_fetch_size(self.backup_fetch_size)
            .with_write_chunk_size(write_chunk_size.unwrap_or(self.backup_write_chunk_size))
            .backup(table)
            .await
    }

    /// Restore `table` from `snapshot`, or from its latest snapshot
    pub async fn restore_table(
        &self,
        table: TableKind,
        snapshot: Option<&str>,
        chunk_size: Option<usize>,
    ) -> PipelineResult<RestoreReport> {
        ColumnarBackupReader::new(self.loader.clone(), Arc::clone(&self.objects))
            .restore(table, snapshot, chunk_size.unwrap_or(self.loader.chunk_size()))
            .await
    }
}

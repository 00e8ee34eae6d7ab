//! Delimited-text sources
//!
//! A file is read as a stream of records; nothing beyond one load chunk of
//! validated rows is held in memory. Whether the first line is a header is
//! decided by looking for expected column names in it.

use std::collections::HashSet;

use csv_async::{AsyncReaderBuilder, StringRecord};
use futures::StreamExt;
use hrm_common::types::{RawRecord, Record, Rejection, RejectionKind, TableKind};
use tokio::io::AsyncRead;
use tracing::{info, instrument, warn};

use crate::error::{PipelineError, PipelineResult};
use crate::ingest::loader::{BulkLoader, LoadReport};
use crate::ingest::validation_log::{record_rejection, record_summary, BatchStats, ValidationLog};
use crate::ingest::validator::{RecordValidator, ReferenceLookup, ReplacingTarget, Verdict};

/// Where each expected column sits in a row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnLayout {
    positions: Vec<(&'static str, usize)>,
    pub has_header: bool,
}

impl ColumnLayout {
    /// Fixed positional order, for files without a header
    pub fn positional(table: TableKind) -> Self {
        Self {
            positions: table.columns().iter().enumerate().map(|(i, c)| (*c, i)).collect(),
            has_header: false,
        }
    }

    /// Inspect the first row. If any field names an expected column it is a
    /// header, and every expected column must then be present.
    pub fn detect(table: TableKind, first_row: &StringRecord) -> PipelineResult<Self> {
        let expected = table.columns();
        let header: Vec<String> = first_row.iter().map(|f| f.trim().to_lowercase()).collect();

        if !header.iter().any(|field| expected.contains(&field.as_str())) {
            return Ok(Self::positional(table));
        }

        let mut positions = Vec::with_capacity(expected.len());
        let mut missing = Vec::new();
        for column in expected {
            match header.iter().position(|field| field == column) {
                Some(index) => positions.push((*column, index)),
                None => missing.push(*column),
            }
        }
        if !missing.is_empty() {
            return Err(PipelineError::InvalidStructure {
                table,
                message: format!("header is missing columns: {}", missing.join(", ")),
            });
        }

        let extra: Vec<&str> = header
            .iter()
            .map(String::as_str)
            .filter(|field| !expected.contains(field))
            .collect();
        if !extra.is_empty() {
            warn!(table = %table, columns = ?extra, "Ignoring unexpected columns");
        }

        Ok(Self {
            positions,
            has_header: true,
        })
    }

    pub fn raw_record(&self, table: TableKind, row: &StringRecord) -> RawRecord {
        RawRecord::from_fields(table, |column| {
            self.positions
                .iter()
                .find(|(name, _)| *name == column)
                .and_then(|(_, index)| row.get(*index))
                .map(str::to_string)
        })
    }
}

/// Outcome of loading one file
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CsvLoadReport {
    pub stats: BatchStats,
    pub load: LoadReport,
}

/// Validates file rows and loads the accepted ones
pub struct CsvTableLoader<'a> {
    pub validator: &'a RecordValidator,
    pub loader: &'a BulkLoader,
    pub lookup: &'a dyn ReferenceLookup,
    pub log: &'a dyn ValidationLog,
}

impl CsvTableLoader<'_> {
    /// Replace the contents of `table` with the valid rows read from `reader`.
    ///
    /// The header is checked before anything is truncated. Rows are
    /// validated as they stream in and loaded one chunk at a time.
    #[instrument(skip(self, reader))]
    pub async fn load_replacing<R>(&self, table: TableKind, reader: R) -> PipelineResult<CsvLoadReport>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut csv = AsyncReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .create_reader(reader);
        let mut rows = csv.records();

        let first = rows.next().await.transpose()?;
        let layout = match &first {
            Some(row) => ColumnLayout::detect(table, row)?,
            None => ColumnLayout::positional(table),
        };
        info!(table = %table, has_header = layout.has_header, "Reading CSV");

        let mut report = CsvLoadReport::default();
        report.load.truncated = self.loader.truncate_best_effort(table).await;

        // Until the first chunk commits the table's own ids are checked only
        // against `seen_ids`. After that the store holds ids it assigned
        // itself, so explicit ids are checked against it too.
        let replacing = ReplacingTarget::new(self.lookup, table);
        let mut seen_ids = HashSet::new();
        let mut pending: Vec<Record> = Vec::with_capacity(self.loader.chunk_size());

        let first_data_row = first.filter(|_| !layout.has_header);
        if let Some(row) = first_data_row {
            self.accept_row(table, &layout, &row, &replacing, &mut seen_ids, &mut pending, &mut report)
                .await;
        }
        while let Some(row) = rows.next().await {
            let row = row?;
            let lookup: &dyn ReferenceLookup = if report.load.rows_loaded > 0 {
                self.lookup
            } else {
                &replacing
            };
            self.accept_row(table, &layout, &row, lookup, &mut seen_ids, &mut pending, &mut report)
                .await;

            if pending.len() >= self.loader.chunk_size() {
                let chunk = std::mem::take(&mut pending);
                self.loader.append_into(table, chunk, &mut report.load).await?;
            }
        }
        if !pending.is_empty() {
            self.loader.append_into(table, pending, &mut report.load).await?;
        }

        record_summary(self.log, table.table_name(), &report.stats).await;
        info!(
            table = %table,
            total = report.stats.total,
            valid = report.stats.valid,
            rejected = report.stats.failed,
            loaded = report.load.rows_loaded,
            "CSV load complete"
        );

        Ok(report)
    }

    #[allow(clippy::too_many_arguments)]
    async fn accept_row(
        &self,
        table: TableKind,
        layout: &ColumnLayout,
        row: &StringRecord,
        lookup: &dyn ReferenceLookup,
        seen_ids: &mut HashSet<i32>,
        pending: &mut Vec<Record>,
        report: &mut CsvLoadReport,
    ) {
        let raw = layout.raw_record(table, row);

        let verdict = match self.validator.validate_or_reject(&raw, lookup).await {
            Verdict::Valid(record) => match record.id() {
                Some(id) if !seen_ids.insert(id) => Verdict::Rejected(Rejection::new(
                    RejectionKind::DuplicateId,
                    format!("id {} appears more than once in the file", id),
                    &raw,
                )),
                _ => Verdict::Valid(record),
            },
            rejected => rejected,
        };

        match verdict {
            Verdict::Valid(record) => {
                report.stats.accept();
                pending.push(record);
            }
            Verdict::Rejected(rejection) => {
                report.stats.reject();
                record_rejection(self.log, table.table_name(), &rejection).await;
            }
        }
    }
}

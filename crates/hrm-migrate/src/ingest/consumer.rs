//! Streaming ingestion
//!
//! Envelopes are validated one at a time, buffered per table and loaded when
//! a buffer fills up or has been idle for the configured window. Remaining
//! buffers are flushed when the source is exhausted or the run is cancelled.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use hrm_common::types::{RawRecord, Record, Rejection, RejectionKind, TableKind};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{PipelineConfig, DEFAULT_POLL_TIMEOUT_MS};
use crate::error::{PipelineError, PipelineResult};
use crate::ingest::accumulator::{AccumulatorConfig, AppendOutcome, BatchAccumulator};
use crate::ingest::envelope::{Envelope, EnvelopeSource, Polled};
use crate::ingest::loader::BulkLoader;
use crate::ingest::validation_log::{record_rejection, record_summary, BatchStats, ValidationLog};
use crate::ingest::validator::{RecordValidator, ReferenceLookup, Verdict};

/// Pause before polling again after the source reported an error
const POLL_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Counters for one consumer run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    pub messages: u64,
    pub malformed: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub rows_loaded: u64,
    pub failed_loads: u64,
}

#[derive(Default)]
struct RunState {
    stats: ConsumerStats,
    /// Accepted/rejected counts since each table's last flush
    pending: BTreeMap<TableKind, BatchStats>,
}

impl RunState {
    fn batch(&mut self, table: TableKind) -> &mut BatchStats {
        self.pending.entry(table).or_default()
    }
}

pub struct StreamConsumer {
    validator: RecordValidator,
    accumulator: BatchAccumulator,
    loader: BulkLoader,
    lookup: Arc<dyn ReferenceLookup>,
    log: Arc<dyn ValidationLog>,
    poll_timeout: Duration,
}

impl StreamConsumer {
    pub fn new(
        validator: RecordValidator,
        accumulator: BatchAccumulator,
        loader: BulkLoader,
        lookup: Arc<dyn ReferenceLookup>,
        log: Arc<dyn ValidationLog>,
    ) -> Self {
        Self {
            validator,
            accumulator,
            loader,
            lookup,
            log,
            poll_timeout: Duration::from_millis(DEFAULT_POLL_TIMEOUT_MS),
        }
    }

    /// Consumer with batch size, idle window and poll timeout taken from
    /// `config`. Loads use the batch size as chunk size.
    pub fn from_config(
        config: &PipelineConfig,
        loader: BulkLoader,
        lookup: Arc<dyn ReferenceLookup>,
        log: Arc<dyn ValidationLog>,
    ) -> PipelineResult<Self> {
        let accumulator = BatchAccumulator::new(AccumulatorConfig {
            batch_size: config.batch_size,
            idle_window: config.idle_flush(),
        });
        Ok(Self::new(
            RecordValidator::new()?,
            accumulator,
            loader.with_chunk_size(config.batch_size),
            lookup,
            log,
        )
        .with_poll_timeout(config.poll_timeout()))
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Consume `source` until it is exhausted or `cancel` fires, then flush
    /// whatever is still buffered and close the source.
    ///
    /// Flushes run inline on this loop, so no message is handled while a
    /// table's batch is being loaded.
    #[instrument(skip_all)]
    pub async fn run(
        &self,
        source: &mut dyn EnvelopeSource,
        cancel: CancellationToken,
    ) -> PipelineResult<ConsumerStats> {
        info!(
            batch_size = self.accumulator.config().batch_size,
            idle_window_ms = self.accumulator.config().idle_window.as_millis() as u64,
            "Starting stream consumer"
        );
        let mut state = RunState::default();

        loop {
            let polled = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Cancellation requested, stopping consumer");
                    break;
                }
                polled = source.poll(self.poll_timeout) => polled,
            };

            match polled {
                Ok(Polled::Message(envelope)) => self.handle(envelope, &mut state).await,
                Ok(Polled::Malformed(reason)) => {
                    state.stats.malformed += 1;
                    warn!(reason = %reason, "Skipping message that is not an envelope");
                }
                Ok(Polled::Idle) => {}
                Ok(Polled::Exhausted) => {
                    info!("Envelope source exhausted");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "Polling envelope source failed, retrying");
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(POLL_RETRY_DELAY) => {}
                    }
                }
            }

            for (table, records) in self.accumulator.take_expired(Instant::now()) {
                debug!(table = %table, records = records.len(), "Idle window elapsed");
                self.flush(table, records, &mut state).await;
            }
        }

        for (table, records) in self.accumulator.take_all() {
            self.flush(table, records, &mut state).await;
        }
        for (table, batch) in std::mem::take(&mut state.pending) {
            record_summary(self.log.as_ref(), table.table_name(), &batch).await;
        }
        source.close().await?;

        info!(
            messages = state.stats.messages,
            accepted = state.stats.accepted,
            rejected = state.stats.rejected,
            rows_loaded = state.stats.rows_loaded,
            failed_loads = state.stats.failed_loads,
            "Stream consumer stopped"
        );
        Ok(state.stats)
    }

    async fn handle(&self, envelope: Envelope, state: &mut RunState) {
        state.stats.messages += 1;
        let Envelope {
            table: table_name,
            payload,
        } = envelope;

        let table = match table_name.parse::<TableKind>() {
            Ok(table) => table,
            Err(e) => {
                state.stats.rejected += 1;
                let rejection = Rejection::unparsed(RejectionKind::UnknownTable, e.to_string(), payload);
                record_rejection(self.log.as_ref(), &table_name, &rejection).await;
                return;
            }
        };

        let raw = match RawRecord::from_payload(table, &payload) {
            Ok(raw) => raw,
            Err(e) => {
                self.reject(table, Rejection::unparsed(RejectionKind::Format, e.to_string(), payload), state)
                    .await;
                return;
            }
        };

        let record = match self.validator.validate_or_reject(&raw, self.lookup.as_ref()).await {
            Verdict::Valid(record) => record,
            Verdict::Rejected(rejection) => {
                self.reject(table, rejection, state).await;
                return;
            }
        };

        match self.accumulator.append(record) {
            AppendOutcome::Buffered => self.accept(table, state),
            AppendOutcome::Ready(batch) => {
                self.accept(table, state);
                self.flush(table, batch, state).await;
            }
            AppendOutcome::Duplicate(record) => {
                let message = format!(
                    "id {} is already waiting to be loaded into {}",
                    record.id().unwrap_or_default(),
                    table
                );
                self.reject(table, Rejection::new(RejectionKind::DuplicateId, message, &raw), state)
                    .await;
            }
        }
    }

    fn accept(&self, table: TableKind, state: &mut RunState) {
        state.stats.accepted += 1;
        state.batch(table).accept();
    }

    async fn reject(&self, table: TableKind, rejection: Rejection, state: &mut RunState) {
        state.stats.rejected += 1;
        state.batch(table).reject();
        record_rejection(self.log.as_ref(), table.table_name(), &rejection).await;
    }

    /// Load one buffered batch and write its summary. Failures are logged and
    /// counted; the consumer keeps running.
    async fn flush(&self, table: TableKind, records: Vec<Record>, state: &mut RunState) {
        let batch = state.pending.remove(&table).unwrap_or_default();
        let count = records.len();

        match self.loader.load_appending(table, records).await {
            Ok(report) => {
                state.stats.rows_loaded += report.rows_loaded;
                info!(table = %table, rows = report.rows_loaded, "Flushed batch");
            }
            Err(e) => {
                if let PipelineError::ChunkFailed { committed_rows, .. } = &e {
                    state.stats.rows_loaded += committed_rows;
                }
                state.stats.failed_loads += 1;
                error!(table = %table, records = count, error = %e, "Failed to load batch");
            }
        }

        record_summary(self.log.as_ref(), table.table_name(), &batch).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::testing::{MemoryStore, MemoryValidationLog, ScriptedSource};
    use hrm_common::types::Department;
    use serde_json::{json, Value};

    struct Fixture {
        store: Arc<MemoryStore>,
        log: Arc<MemoryValidationLog>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                store: Arc::new(MemoryStore::default()),
                log: Arc::new(MemoryValidationLog::default()),
            }
        }

        fn consumer(&self, batch_size: usize, idle_window: Duration) -> StreamConsumer {
            StreamConsumer::new(
                RecordValidator::new().unwrap(),
                BatchAccumulator::new(AccumulatorConfig {
                    batch_size,
                    idle_window,
                }),
                BulkLoader::new(self.store.clone(), batch_size),
                self.store.clone(),
                self.log.clone(),
            )
            .with_poll_timeout(Duration::from_millis(10))
        }
    }

    fn message(table: &str, payload: Value) -> PipelineResult<Polled> {
        Ok(Polled::Message(Envelope {
            table: table.to_string(),
            payload,
        }))
    }

    #[tokio::test]
    async fn test_full_batches_are_loaded_and_remainder_flushed_on_exit() {
        let fixture = Fixture::new();
        let consumer = fixture.consumer(2, Duration::from_secs(3600));
        let mut source = ScriptedSource::new(vec![
            message("departments", json!({"id": 1, "name": "Engineering"})),
            message("departments", json!({"id": 2, "name": "Sales"})),
            message("departments", json!({"id": 3, "name": "Legal"})),
        ]);

        let stats = consumer.run(&mut source, CancellationToken::new()).await.unwrap();

        assert_eq!(stats.accepted, 3);
        assert_eq!(stats.rows_loaded, 3);
        assert_eq!(fixture.store.copy_calls(), 2);
        assert_eq!(fixture.store.rows(TableKind::Departments).len(), 3);
        assert!(source.closed);
    }

    #[tokio::test]
    async fn test_rejections_are_logged_per_table() {
        let fixture = Fixture::new();
        fixture.store.seed(vec![Department { id: 1, name: "Engineering".into() }.into()]);
        let consumer = fixture.consumer(100, Duration::from_secs(3600));
        let mut source = ScriptedSource::new(vec![
            message("projects", json!({"id": 1})),
            message("jobs", json!(["not", "an", "object"])),
            message("departments", json!({"id": 1, "name": "Engineering"})),
            message("jobs", json!({"id": 4, "name": "Analyst"})),
            message("jobs", json!({"id": 4, "name": "Analyst Again"})),
            Ok(Polled::Malformed("line 6: expected value".into())),
        ]);

        let stats = consumer.run(&mut source, CancellationToken::new()).await.unwrap();

        assert_eq!(stats.messages, 5);
        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.accepted, 1);
        assert_eq!(stats.rejected, 4);

        let entries = fixture.log.entries();
        let by_table: Vec<(&str, &str)> = entries
            .iter()
            .map(|e| (e.table_name.as_str(), e.error_type.as_str()))
            .collect();
        assert_eq!(
            by_table,
            vec![
                ("projects", "UNKNOWN_TABLE"),
                ("jobs", "FORMAT_ERROR"),
                ("departments", "DUPLICATE_ID"),
                ("jobs", "DUPLICATE_ID"),
                ("jobs", "BATCH_SUMMARY"),
                ("departments", "BATCH_SUMMARY"),
            ]
        );
        assert_eq!(fixture.store.rows(TableKind::Jobs).len(), 1);
    }

    #[tokio::test]
    async fn test_idle_buffers_are_flushed_while_running() {
        let fixture = Fixture::new();
        let consumer = fixture.consumer(100, Duration::ZERO);
        let cancel = CancellationToken::new();
        let mut source = ScriptedSource::cancelling(
            vec![
                message("jobs", json!({"id": 1, "name": "Analyst"})),
                Ok(Polled::Idle),
                message("jobs", json!({"id": 2, "name": "Recruiter"})),
            ],
            cancel.clone(),
        );

        let stats = consumer.run(&mut source, cancel).await.unwrap();

        assert_eq!(stats.rows_loaded, 2);
        assert_eq!(fixture.store.copy_calls(), 2);
        assert!(source.closed);
    }

    #[tokio::test]
    async fn test_cancellation_flushes_buffered_records_once() {
        let fixture = Fixture::new();
        let consumer = fixture.consumer(100, Duration::from_secs(3600));
        let cancel = CancellationToken::new();
        let mut source = ScriptedSource::cancelling(
            vec![
                message("jobs", json!({"id": 1, "name": "Analyst"})),
                message("departments", json!({"id": 4, "name": "Sales"})),
                message("jobs", json!({"id": 2, "name": "Recruiter"})),
            ],
            cancel.clone(),
        );

        let stats = consumer.run(&mut source, cancel).await.unwrap();

        assert_eq!(stats.accepted, 3);
        assert_eq!(stats.rows_loaded, 3);
        assert_eq!(fixture.store.copy_calls(), 2);
        assert_eq!(fixture.store.rows(TableKind::Jobs).len(), 2);
        assert_eq!(
            fixture.store.rows(TableKind::Departments),
            vec![Record::from(Department { id: 4, name: "Sales".into() })]
        );
        assert!(fixture.log.entries().is_empty());
        assert!(source.closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_load_failure_keeps_consumer_running() {
        let fixture = Fixture::new();
        fixture.store.fail_copy_on_call(1);
        let consumer = fixture.consumer(1, Duration::from_secs(3600));
        let mut source = ScriptedSource::new(vec![
            message("jobs", json!({"id": 1, "name": "Analyst"})),
            Err(PipelineError::Source("broker unavailable".into())),
            message("jobs", json!({"id": 2, "name": "Recruiter"})),
        ]);

        let stats = consumer.run(&mut source, CancellationToken::new()).await.unwrap();

        assert_eq!(stats.failed_loads, 1);
        assert_eq!(stats.rows_loaded, 1);
        let ids: Vec<_> = fixture
            .store
            .rows(TableKind::Jobs)
            .iter()
            .filter_map(Record::id)
            .collect();
        assert_eq!(ids, vec![2]);
    }

    #[tokio::test]
    async fn test_employee_references_checked_against_store() {
        let fixture = Fixture::new();
        let consumer = fixture.consumer(10, Duration::from_secs(3600));
        let mut source = ScriptedSource::new(vec![message(
            "hired_employees",
            json!({"name": "Ana Ruiz", "datetime": "2021-11-07T02:48:42Z", "department_id": 1, "job_id": 2}),
        )]);

        let stats = consumer.run(&mut source, CancellationToken::new()).await.unwrap();

        assert_eq!(stats.rejected, 1);
        assert_eq!(
            fixture.log.error_types(),
            vec!["REFERENTIAL_INTEGRITY_ERROR", "BATCH_SUMMARY"]
        );
    }
}

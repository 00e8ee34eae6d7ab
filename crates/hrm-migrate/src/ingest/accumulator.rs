//! Per-table buffering of validated records
//!
//! Each table has its own lock, so appending to one table never waits on a
//! flush of another. Handing a buffer out swaps it for an empty one under the
//! lock: a record is either in the batch being handed out or in the fresh
//! buffer, never both and never neither.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use hrm_common::types::{Record, TableKind};
use parking_lot::Mutex;

use crate::config::{DEFAULT_BATCH_SIZE, DEFAULT_IDLE_FLUSH_MS};

#[derive(Debug, Clone)]
pub struct AccumulatorConfig {
    pub batch_size: usize,
    pub idle_window: Duration,
}

impl Default for AccumulatorConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            idle_window: Duration::from_millis(DEFAULT_IDLE_FLUSH_MS),
        }
    }
}

/// What happened to an appended record
#[derive(Debug, PartialEq)]
pub enum AppendOutcome {
    /// Buffered, no flush due yet
    Buffered,
    /// Buffered, and the buffer reached the batch size. The returned batch
    /// has already been removed from the accumulator.
    Ready(Vec<Record>),
    /// The record's id is already buffered for this table; it was not added
    Duplicate(Record),
}

#[derive(Debug)]
struct TableBuffer {
    records: Vec<Record>,
    ids: HashSet<i32>,
    last_flush: Instant,
}

impl TableBuffer {
    fn new(now: Instant) -> Self {
        Self {
            records: Vec::new(),
            ids: HashSet::new(),
            last_flush: now,
        }
    }

    fn take(&mut self, now: Instant) -> Vec<Record> {
        self.ids.clear();
        self.last_flush = now;
        std::mem::take(&mut self.records)
    }
}

pub struct BatchAccumulator {
    config: AccumulatorConfig,
    buffers: [Mutex<TableBuffer>; 3],
}

impl BatchAccumulator {
    pub fn new(config: AccumulatorConfig) -> Self {
        let now = Instant::now();
        Self {
            config: AccumulatorConfig {
                batch_size: config.batch_size.max(1),
                ..config
            },
            buffers: [
                Mutex::new(TableBuffer::new(now)),
                Mutex::new(TableBuffer::new(now)),
                Mutex::new(TableBuffer::new(now)),
            ],
        }
    }

    pub fn config(&self) -> &AccumulatorConfig {
        &self.config
    }

    fn buffer(&self, table: TableKind) -> &Mutex<TableBuffer> {
        let index = match table {
            TableKind::Departments => 0,
            TableKind::Jobs => 1,
            TableKind::HiredEmployees => 2,
        };
        &self.buffers[index]
    }

    pub fn append(&self, record: Record) -> AppendOutcome {
        let mut buffer = self.buffer(record.kind()).lock();

        if let Some(id) = record.id() {
            if !buffer.ids.insert(id) {
                return AppendOutcome::Duplicate(record);
            }
        }
        buffer.records.push(record);

        if buffer.records.len() >= self.config.batch_size {
            AppendOutcome::Ready(buffer.take(Instant::now()))
        } else {
            AppendOutcome::Buffered
        }
    }

    /// Remove and return every non-empty buffer idle for at least the
    /// configured window as of `now`.
    pub fn take_expired(&self, now: Instant) -> Vec<(TableKind, Vec<Record>)> {
        TableKind::LOAD_ORDER
            .into_iter()
            .filter_map(|table| {
                let mut buffer = self.buffer(table).lock();
                let idle = now.saturating_duration_since(buffer.last_flush);
                if buffer.records.is_empty() || idle < self.config.idle_window {
                    return None;
                }
                Some((table, buffer.take(now)))
            })
            .collect()
    }

    /// Remove and return one table's buffer, whatever its size
    pub fn take(&self, table: TableKind) -> Vec<Record> {
        self.buffer(table).lock().take(Instant::now())
    }

    /// Remove and return all non-empty buffers, in load order
    pub fn take_all(&self) -> Vec<(TableKind, Vec<Record>)> {
        TableKind::LOAD_ORDER
            .into_iter()
            .map(|table| (table, self.take(table)))
            .filter(|(_, records)| !records.is_empty())
            .collect()
    }

    pub fn buffered(&self, table: TableKind) -> usize {
        self.buffer(table).lock().records.len()
    }
}

impl Default for BatchAccumulator {
    fn default() -> Self {
        Self::new(AccumulatorConfig::default())
    }
}

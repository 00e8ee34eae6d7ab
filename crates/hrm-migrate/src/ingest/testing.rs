//! In-memory stand-ins for the store, object storage, validation log and
//! envelope source, used by unit tests.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use hrm_common::types::{Record, TableKind};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::db::{DbError, DbResult};
use crate::error::PipelineResult;
use crate::ingest::envelope::{EnvelopeSource, Polled};
use crate::ingest::loader::{IdMode, TableCursor, TableStore};
use crate::ingest::validation_log::{ValidationLog, ValidationLogEntry};
use crate::ingest::validator::ReferenceLookup;
use crate::storage::{ObjectReader, ObjectStore};

fn injected(what: &str) -> DbError {
    DbError::Sqlx(sqlx::Error::Protocol(format!("injected {} failure", what)))
}

#[derive(Default)]
struct StoreState {
    tables: BTreeMap<TableKind, Vec<Record>>,
    sequences: BTreeMap<TableKind, i32>,
    copy_calls: usize,
    copy_modes: Vec<IdMode>,
    fail_copy_on: Option<usize>,
    fail_truncate: bool,
    fail_lookups: bool,
}

impl StoreState {
    fn insert(&mut self, table: TableKind, mut record: Record) {
        let sequence = self.sequences.entry(table).or_insert(0);
        match record.id() {
            Some(id) => *sequence = (*sequence).max(id),
            None => {
                *sequence += 1;
                if let Record::HiredEmployee(employee) = &mut record {
                    employee.id = Some(*sequence);
                }
            }
        }
        self.tables.entry(table).or_default().push(record);
    }
}

/// Relational store kept in memory. Explicit ids must be unique per table;
/// store-assigned ids continue after the largest id seen.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
}

impl MemoryStore {
    /// Insert rows directly, bypassing call counters and failure injection
    pub fn seed(&self, rows: Vec<Record>) {
        let mut state = self.state.lock();
        for record in rows {
            state.insert(record.kind(), record);
        }
    }

    pub fn rows(&self, table: TableKind) -> Vec<Record> {
        self.state.lock().tables.get(&table).cloned().unwrap_or_default()
    }

    pub fn copy_calls(&self) -> usize {
        self.state.lock().copy_calls
    }

    pub fn copy_modes(&self) -> Vec<IdMode> {
        self.state.lock().copy_modes.clone()
    }

    /// Make the `call`-th copy (1-based, counted from now on) fail
    pub fn fail_copy_on_call(&self, call: usize) {
        let mut state = self.state.lock();
        state.fail_copy_on = Some(state.copy_calls + call);
    }

    pub fn fail_truncate(&self, fail: bool) {
        self.state.lock().fail_truncate = fail;
    }

    pub fn fail_lookups(&self, fail: bool) {
        self.state.lock().fail_lookups = fail;
    }
}

#[async_trait]
impl TableStore for MemoryStore {
    async fn truncate(&self, table: TableKind) -> DbResult<()> {
        let mut state = self.state.lock();
        if state.fail_truncate {
            return Err(injected("truncate"));
        }
        state.tables.remove(&table);
        state.sequences.remove(&table);
        Ok(())
    }

    async fn copy_rows(&self, table: TableKind, mode: IdMode, rows: &[Record]) -> DbResult<u64> {
        let mut state = self.state.lock();
        state.copy_calls += 1;
        state.copy_modes.push(mode);
        if state.fail_copy_on == Some(state.copy_calls) {
            return Err(injected("copy"));
        }

        let existing: BTreeSet<i32> = state
            .tables
            .get(&table)
            .map(|rows| rows.iter().filter_map(Record::id).collect())
            .unwrap_or_default();
        let mut incoming = BTreeSet::new();
        for record in rows {
            if let Some(id) = record.id().filter(|_| mode == IdMode::Explicit) {
                if existing.contains(&id) || !incoming.insert(id) {
                    return Err(DbError::Sqlx(sqlx::Error::Protocol(format!(
                        "duplicate key value violates unique constraint: id={}",
                        id
                    ))));
                }
            }
        }

        for record in rows {
            let mut record = record.clone();
            if mode == IdMode::StoreAssigned {
                if let Record::HiredEmployee(employee) = &mut record {
                    employee.id = None;
                }
            }
            state.insert(table, record);
        }
        Ok(rows.len() as u64)
    }

    async fn open_cursor(&self, table: TableKind, fetch_size: usize) -> DbResult<Box<dyn TableCursor>> {
        let mut rows = self.rows(table);
        rows.sort_by_key(|record| record.id());
        Ok(Box::new(MemoryCursor {
            rows: rows.into(),
            fetch_size: fetch_size.max(1),
        }))
    }
}

#[async_trait]
impl ReferenceLookup for MemoryStore {
    async fn exists(&self, table: TableKind, id: i32) -> DbResult<bool> {
        let state = self.state.lock();
        if state.fail_lookups {
            return Err(injected("lookup"));
        }
        Ok(state
            .tables
            .get(&table)
            .is_some_and(|rows| rows.iter().any(|record| record.id() == Some(id))))
    }
}

struct MemoryCursor {
    rows: VecDeque<Record>,
    fetch_size: usize,
}

#[async_trait]
impl TableCursor for MemoryCursor {
    async fn next_window(&mut self) -> DbResult<Option<Vec<Record>>> {
        if self.rows.is_empty() {
            return Ok(None);
        }
        let take = self.fetch_size.min(self.rows.len());
        Ok(Some(self.rows.drain(..take).collect()))
    }
}

/// Validation log collecting entries in memory
#[derive(Default)]
pub struct MemoryValidationLog {
    entries: Mutex<Vec<ValidationLogEntry>>,
    failing: bool,
}

impl MemoryValidationLog {
    pub fn failing() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            failing: true,
        }
    }

    pub fn entries(&self) -> Vec<ValidationLogEntry> {
        self.entries.lock().clone()
    }

    pub fn error_types(&self) -> Vec<String> {
        self.entries.lock().iter().map(|e| e.error_type.clone()).collect()
    }
}

#[async_trait]
impl ValidationLog for MemoryValidationLog {
    async fn append(&self, entry: ValidationLogEntry) -> DbResult<()> {
        if self.failing {
            return Err(injected("log"));
        }
        self.entries.lock().push(entry);
        Ok(())
    }
}

/// Object storage kept in memory, keys sorted
pub struct MemoryObjectStore {
    bucket: String,
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    puts: Mutex<usize>,
    fail_put_on: Mutex<Option<usize>>,
    fail_get_suffix: Mutex<Option<String>>,
}

impl Default for MemoryObjectStore {
    fn default() -> Self {
        Self {
            bucket: "hrm-test".to_string(),
            objects: Mutex::new(BTreeMap::new()),
            puts: Mutex::new(0),
            fail_put_on: Mutex::new(None),
            fail_get_suffix: Mutex::new(None),
        }
    }
}

impl MemoryObjectStore {
    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().keys().cloned().collect()
    }

    pub fn insert(&self, key: &str, bytes: Vec<u8>) {
        self.objects.lock().insert(key.to_string(), bytes);
    }

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.objects.lock().get(key).cloned()
    }

    /// Make the `call`-th upload (1-based) fail
    pub fn fail_put_on_call(&self, call: usize) {
        *self.fail_put_on.lock() = Some(call);
    }

    /// Make downloads of keys ending with `suffix` fail
    pub fn fail_get_for(&self, suffix: &str) {
        *self.fail_get_suffix.lock() = Some(suffix.to_string());
    }

    fn read(&self, key: &str) -> Result<Vec<u8>> {
        if let Some(suffix) = self.fail_get_suffix.lock().as_deref() {
            if key.ends_with(suffix) {
                return Err(anyhow!("injected download failure for {}", key));
            }
        }
        self.objects
            .lock()
            .get(key)
            .cloned()
            .ok_or_else(|| anyhow!("NoSuchKey: {}", key))
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn put_file(&self, key: &str, path: &Path) -> Result<()> {
        let call = {
            let mut puts = self.puts.lock();
            *puts += 1;
            *puts
        };
        if *self.fail_put_on.lock() == Some(call) {
            return Err(anyhow!("injected upload failure for {}", key));
        }
        let bytes = tokio::fs::read(path).await?;
        self.insert(key, bytes);
        Ok(())
    }

    async fn get_to_file(&self, key: &str, path: &Path) -> Result<u64> {
        let bytes = self.read(key)?;
        tokio::fs::write(path, &bytes).await?;
        Ok(bytes.len() as u64)
    }

    async fn open_read(&self, key: &str) -> Result<ObjectReader> {
        let bytes = self.read(key)?;
        Ok(Box::pin(std::io::Cursor::new(bytes)))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .objects
            .lock()
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn list_prefixes(&self, prefix: &str, delimiter: &str) -> Result<Vec<String>> {
        let prefixes: BTreeSet<String> = self
            .objects
            .lock()
            .keys()
            .filter_map(|key| {
                let rest = key.strip_prefix(prefix)?;
                let end = rest.find(delimiter)?;
                Some(format!("{}{}{}", prefix, &rest[..end], delimiter))
            })
            .collect();
        Ok(prefixes.into_iter().collect())
    }
}

/// Envelope source replaying a fixed script. Once the script is used up it
/// either reports `Exhausted` or cancels `token` and idles.
pub struct ScriptedSource {
    script: VecDeque<PipelineResult<Polled>>,
    cancel_when_drained: Option<CancellationToken>,
    pub closed: bool,
}

impl ScriptedSource {
    pub fn new(script: Vec<PipelineResult<Polled>>) -> Self {
        Self {
            script: script.into(),
            cancel_when_drained: None,
            closed: false,
        }
    }

    pub fn cancelling(script: Vec<PipelineResult<Polled>>, token: CancellationToken) -> Self {
        Self {
            cancel_when_drained: Some(token),
            ..Self::new(script)
        }
    }
}

#[async_trait]
impl EnvelopeSource for ScriptedSource {
    async fn poll(&mut self, timeout: Duration) -> PipelineResult<Polled> {
        if let Some(next) = self.script.pop_front() {
            return next;
        }
        match &self.cancel_when_drained {
            Some(token) => {
                token.cancel();
                tokio::time::sleep(timeout).await;
                Ok(Polled::Idle)
            }
            None => Ok(Polled::Exhausted),
        }
    }

    async fn close(&mut self) -> PipelineResult<()> {
        self.closed = true;
        Ok(())
    }
}

//! PostgreSQL implementation of the pipeline's store primitives
//!
//! Bulk loads go through `COPY ... FROM STDIN` in text format, one
//! transaction per call. Backups read through a `NO SCROLL` server-side
//! cursor held open inside a read transaction.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use hrm_common::types::{Department, HiredEmployee, Job, Record, TableKind};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Executor, Postgres, Row, Transaction};
use tracing::{debug, instrument};

use super::DbResult;
use crate::ingest::loader::{IdMode, TableCursor, TableStore};
use crate::ingest::validator::ReferenceLookup;

const CURSOR_NAME: &str = "hrm_backup_cursor";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn count(&self, table: TableKind) -> DbResult<i64> {
        let sql = format!("SELECT COUNT(*) FROM {}", table.table_name());
        Ok(sqlx::query_scalar(&sql).fetch_one(&self.pool).await?)
    }
}

/// Columns written by a COPY for `table`
pub fn copy_columns(table: TableKind, mode: IdMode) -> &'static [&'static str] {
    match (table, mode) {
        (TableKind::HiredEmployees, IdMode::StoreAssigned) => {
            &["name", "datetime", "department_id", "job_id"]
        }
        _ => table.columns(),
    }
}

/// Render rows as COPY text format: tab separated, newline terminated
pub fn encode_copy_rows(rows: &[Record], mode: IdMode) -> String {
    let mut out = String::with_capacity(rows.len() * 64);

    for record in rows {
        let mut fields: Vec<String> = Vec::with_capacity(5);
        if mode == IdMode::Explicit {
            fields.push(match record.id() {
                Some(id) => id.to_string(),
                None => "\\N".to_string(),
            });
        }
        fields.push(escape_copy_text(record.name()));
        if let Record::HiredEmployee(employee) = record {
            fields.push(format_timestamp(&employee.hired_at));
            fields.push(employee.department_id.to_string());
            fields.push(employee.job_id.to_string());
        }
        out.push_str(&fields.join("\t"));
        out.push('\n');
    }

    out
}

fn escape_copy_text(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '\t' => escaped.push_str("\\t"),
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            other => escaped.push(other),
        }
    }
    escaped
}

fn format_timestamp(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn select_columns(table: TableKind) -> String {
    table.columns().join(", ")
}

fn decode_row(table: TableKind, row: &PgRow) -> DbResult<Record> {
    let id: i32 = row.try_get("id")?;
    let name: String = row.try_get("name")?;

    Ok(match table {
        TableKind::Departments => Department { id, name }.into(),
        TableKind::Jobs => Job { id, name }.into(),
        TableKind::HiredEmployees => HiredEmployee {
            id: Some(id),
            name,
            hired_at: row.try_get("datetime")?,
            department_id: row.try_get("department_id")?,
            job_id: row.try_get("job_id")?,
        }
        .into(),
    })
}

#[async_trait]
impl TableStore for PgStore {
    #[instrument(skip(self))]
    async fn truncate(&self, table: TableKind) -> DbResult<()> {
        let sql = format!("TRUNCATE TABLE {} RESTART IDENTITY CASCADE", table.table_name());
        sqlx::query(&sql).execute(&self.pool).await?;
        Ok(())
    }

    async fn copy_rows(&self, table: TableKind, mode: IdMode, rows: &[Record]) -> DbResult<u64> {
        if rows.is_empty() {
            return Ok(0);
        }

        let statement = format!(
            "COPY {} ({}) FROM STDIN",
            table.table_name(),
            copy_columns(table, mode).join(", ")
        );
        let payload = encode_copy_rows(rows, mode);

        let mut tx = self.pool.begin().await?;

        let mut copy = tx.copy_in_raw(&statement).await?;
        let sent = copy.send(payload.into_bytes()).await.map(|_| ());
        if let Err(e) = sent {
            // Leaves the connection usable; the transaction rolls back on drop
            let _ = copy.abort(e.to_string()).await;
            return Err(e.into());
        }
        let copied = copy.finish().await?;

        if table == TableKind::HiredEmployees && mode == IdMode::Explicit {
            sqlx::query(
                "SELECT setval(pg_get_serial_sequence('hired_employees', 'id'), \
                 (SELECT COALESCE(MAX(id), 1) FROM hired_employees))",
            )
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        debug!(table = %table, rows = copied, "COPY committed");
        Ok(copied)
    }

    async fn open_cursor(&self, table: TableKind, fetch_size: usize) -> DbResult<Box<dyn TableCursor>> {
        let mut tx = self.pool.begin().await?;

        let declare = format!(
            "DECLARE {} NO SCROLL CURSOR FOR SELECT {} FROM {} ORDER BY id",
            CURSOR_NAME,
            select_columns(table),
            table.table_name()
        );
        (&mut *tx).execute(sqlx::raw_sql(&declare)).await?;

        Ok(Box::new(PgCursor {
            tx: Some(tx),
            table,
            fetch: format!("FETCH FORWARD {} FROM {}", fetch_size.max(1), CURSOR_NAME),
        }))
    }
}

#[async_trait]
impl ReferenceLookup for PgStore {
    async fn exists(&self, table: TableKind, id: i32) -> DbResult<bool> {
        let sql = format!("SELECT EXISTS(SELECT 1 FROM {} WHERE id = $1)", table.table_name());
        Ok(sqlx::query_scalar(&sql).bind(id).fetch_one(&self.pool).await?)
    }
}

/// Cursor declared inside its own transaction. The transaction is committed
/// once the cursor is exhausted and rolled back if the cursor is dropped early.
struct PgCursor {
    tx: Option<Transaction<'static, Postgres>>,
    table: TableKind,
    fetch: String,
}

#[async_trait]
impl TableCursor for PgCursor {
    async fn next_window(&mut self) -> DbResult<Option<Vec<Record>>> {
        let Some(tx) = self.tx.as_mut() else {
            return Ok(None);
        };

        let rows = sqlx::query(&self.fetch)
            .persistent(false)
            .fetch_all(&mut **tx)
            .await?;

        if rows.is_empty() {
            if let Some(mut tx) = self.tx.take() {
                (&mut *tx)
                    .execute(sqlx::raw_sql(&format!("CLOSE {}", CURSOR_NAME)))
                    .await?;
                tx.commit().await?;
            }
            return Ok(None);
        }

        let records = rows
            .iter()
            .map(|row| decode_row(self.table, row))
            .collect::<DbResult<Vec<_>>>()?;
        Ok(Some(records))
    }
}

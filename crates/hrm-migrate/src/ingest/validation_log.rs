//! Append-only log of rejected records and batch summaries

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hrm_common::types::Rejection;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{error, warn};

use crate::db::DbResult;

/// Error type recorded for per-load statistics
pub const BATCH_SUMMARY: &str = "BATCH_SUMMARY";

/// One row of `data_migration_logs`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationLogEntry {
    pub timestamp: DateTime<Utc>,
    pub table_name: String,
    pub record_id: Option<String>,
    pub error_type: String,
    pub error_message: String,
    pub raw_data: Option<Value>,
}

impl ValidationLogEntry {
    pub fn rejection(table_name: &str, rejection: &Rejection) -> Self {
        Self {
            timestamp: Utc::now(),
            table_name: table_name.to_string(),
            record_id: rejection.record_id.clone(),
            error_type: rejection.kind.as_str().to_string(),
            error_message: rejection.message.clone(),
            raw_data: Some(rejection.raw.clone()),
        }
    }

    pub fn batch_summary(table_name: &str, stats: &BatchStats) -> Self {
        Self {
            timestamp: Utc::now(),
            table_name: table_name.to_string(),
            record_id: None,
            error_type: BATCH_SUMMARY.to_string(),
            error_message: format!(
                "{} of {} records rejected ({:.2}% accepted)",
                stats.failed,
                stats.total,
                stats.success_rate()
            ),
            raw_data: Some(json!({
                "total_records": stats.total,
                "valid_records": stats.valid,
                "failed_records": stats.failed,
                "success_rate": stats.success_rate(),
            })),
        }
    }
}

/// Sink for validation log entries
#[async_trait]
pub trait ValidationLog: Send + Sync {
    async fn append(&self, entry: ValidationLogEntry) -> DbResult<()>;
}

/// Accepted/rejected counters for one file load or flush
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchStats {
    pub total: u64,
    pub valid: u64,
    pub failed: u64,
}

impl BatchStats {
    pub fn accept(&mut self) {
        self.total += 1;
        self.valid += 1;
    }

    pub fn reject(&mut self) {
        self.total += 1;
        self.failed += 1;
    }

    /// Percentage of accepted records, 100 for an empty batch
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        (self.valid as f64 / self.total as f64) * 100.0
    }
}

/// Log a rejected record. A failing sink is reported and otherwise ignored.
pub async fn record_rejection(log: &dyn ValidationLog, table_name: &str, rejection: &Rejection) {
    warn!(
        table = table_name,
        record_id = rejection.record_id.as_deref().unwrap_or("-"),
        kind = %rejection.kind,
        "Record rejected: {}",
        rejection.message
    );

    if let Err(e) = log
        .append(ValidationLogEntry::rejection(table_name, rejection))
        .await
    {
        error!(table = table_name, error = %e, "Failed to write validation log entry");
    }
}

/// Write a `BATCH_SUMMARY` entry when the batch had at least one reject
pub async fn record_summary(log: &dyn ValidationLog, table_name: &str, stats: &BatchStats) {
    if stats.failed == 0 {
        return;
    }

    if let Err(e) = log
        .append(ValidationLogEntry::batch_summary(table_name, stats))
        .await
    {
        error!(table = table_name, error = %e, "Failed to write batch summary");
    }
}

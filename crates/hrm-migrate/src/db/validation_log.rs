use async_trait::async_trait;
use sqlx::postgres::PgPool;
use sqlx::types::Json;

use super::DbResult;
use crate::ingest::validation_log::{ValidationLog, ValidationLogEntry};

/// Writes validation log entries to `data_migration_logs`
#[derive(Clone)]
pub struct PgValidationLog {
    pool: PgPool,
}

impl PgValidationLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ValidationLog for PgValidationLog {
    async fn append(&self, entry: ValidationLogEntry) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO data_migration_logs
                (timestamp, table_name, record_id, error_type, error_message, raw_data)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(entry.timestamp)
        .bind(&entry.table_name)
        .bind(&entry.record_id)
        .bind(&entry.error_type)
        .bind(&entry.error_message)
        .bind(entry.raw_data.map(Json))
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

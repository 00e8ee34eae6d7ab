//! Shared setup for integration tests
//!
//! Database tests run against `DATABASE_URL` and object-storage tests against
//! `S3_ENDPOINT` (MinIO works). When a variable is unset the test prints a
//! note and returns early.

#![allow(dead_code)]

use chrono::{TimeZone, Utc};
use hrm_common::types::{Department, HiredEmployee, Job, Record};
use hrm_migrate::db::{self, DbConfig};
use hrm_migrate::storage::{config::StorageConfig, Storage};
use sqlx::PgPool;

/// Connect, apply migrations and empty every table
pub async fn test_pool() -> Option<PgPool> {
    if std::env::var("DATABASE_URL").is_err() {
        eprintln!("DATABASE_URL not set, skipping");
        return None;
    }

    let config = DbConfig::from_env().expect("Failed to read database config");
    let pool = db::create_pool(&config)
        .await
        .expect("Failed to connect to test database");
    db::run_migrations(&pool)
        .await
        .expect("Failed to run migrations");

    sqlx::raw_sql(
        "TRUNCATE TABLE hired_employees, departments, jobs, data_migration_logs \
         RESTART IDENTITY CASCADE",
    )
    .execute(&pool)
    .await
    .expect("Failed to reset tables");

    Some(pool)
}

/// Storage client for the configured endpoint with its bucket created
pub async fn test_storage() -> Option<Storage> {
    if std::env::var("S3_ENDPOINT").is_err() {
        eprintln!("S3_ENDPOINT not set, skipping");
        return None;
    }

    let config = StorageConfig::from_env().expect("Failed to read storage config");
    let storage = Storage::new(config)
        .await
        .expect("Failed to create storage client");
    storage
        .ensure_bucket()
        .await
        .expect("Failed to create test bucket");

    Some(storage)
}

pub async fn count_rows(pool: &PgPool, table: &str) -> i64 {
    sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
        .fetch_one(pool)
        .await
        .expect("Failed to count rows")
}

pub fn department(id: i32, name: &str) -> Record {
    Record::Department(Department {
        id,
        name: name.to_string(),
    })
}

pub fn job(id: i32, name: &str) -> Record {
    Record::Job(Job {
        id,
        name: name.to_string(),
    })
}

pub fn employee(id: Option<i32>, name: &str, department_id: i32, job_id: i32) -> Record {
    Record::HiredEmployee(HiredEmployee {
        id,
        name: name.to_string(),
        hired_at: Utc.with_ymd_and_hms(2021, 7, 27, 16, 2, 8).unwrap(),
        department_id,
        job_id,
    })
}

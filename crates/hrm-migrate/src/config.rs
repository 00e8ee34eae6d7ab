//! Configuration management

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::db::DbConfig;
use crate::storage::config::StorageConfig;

// ============================================================================
// Pipeline Configuration Constants
// ============================================================================

/// Default number of records per accumulator batch and per load chunk.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Default idle window after which a non-empty buffer is flushed.
pub const DEFAULT_IDLE_FLUSH_MS: u64 = 2000;

/// Default upper bound on a single poll of the envelope source.
pub const DEFAULT_POLL_TIMEOUT_MS: u64 = 500;

/// Default number of rows fetched per cursor round trip during backup.
pub const DEFAULT_BACKUP_FETCH_SIZE: usize = 10_000;

/// Default number of rows per backup partition file.
pub const DEFAULT_BACKUP_WRITE_CHUNK_SIZE: usize = 1000;

/// Default directory holding the upstream CSV files.
pub const DEFAULT_DATA_DIR: &str = "./data";

/// Migration configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub pipeline: PipelineConfig,
    pub database: DbConfig,
    pub storage: StorageConfig,
}

/// Batching, backup and source settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub batch_size: usize,
    pub idle_flush_ms: u64,
    pub poll_timeout_ms: u64,
    pub backup_fetch_size: usize,
    pub backup_write_chunk_size: usize,
    pub data_dir: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            idle_flush_ms: DEFAULT_IDLE_FLUSH_MS,
            poll_timeout_ms: DEFAULT_POLL_TIMEOUT_MS,
            backup_fetch_size: DEFAULT_BACKUP_FETCH_SIZE,
            backup_write_chunk_size: DEFAULT_BACKUP_WRITE_CHUNK_SIZE,
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self {
            batch_size: env_or("HRM_BATCH_SIZE", DEFAULT_BATCH_SIZE),
            idle_flush_ms: env_or("HRM_IDLE_FLUSH_MS", DEFAULT_IDLE_FLUSH_MS),
            poll_timeout_ms: env_or("HRM_POLL_TIMEOUT_MS", DEFAULT_POLL_TIMEOUT_MS),
            backup_fetch_size: env_or("HRM_BACKUP_FETCH_SIZE", DEFAULT_BACKUP_FETCH_SIZE),
            backup_write_chunk_size: env_or(
                "HRM_BACKUP_WRITE_CHUNK_SIZE",
                DEFAULT_BACKUP_WRITE_CHUNK_SIZE,
            ),
            data_dir: std::env::var("HRM_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_DATA_DIR)),
        }
    }

    pub fn idle_flush(&self) -> Duration {
        Duration::from_millis(self.idle_flush_ms)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

impl Config {
    /// Load configuration from environment and defaults
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Config {
            pipeline: PipelineConfig::from_env(),
            database: DbConfig::from_env_or_default(),
            storage: StorageConfig::from_env()?,
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let pipeline = &self.pipeline;
        if pipeline.batch_size == 0 {
            anyhow::bail!("Batch size must be greater than 0");
        }
        if pipeline.idle_flush_ms == 0 {
            anyhow::bail!("Idle flush window must be greater than 0");
        }
        if pipeline.poll_timeout_ms == 0 {
            anyhow::bail!("Poll timeout must be greater than 0");
        }
        if pipeline.backup_fetch_size == 0 || pipeline.backup_write_chunk_size == 0 {
            anyhow::bail!("Backup fetch and write chunk sizes must be greater than 0");
        }

        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }
        if self.database.max_connections == 0 {
            anyhow::bail!("Database max_connections must be greater than 0");
        }
        if self.database.min_connections > self.database.max_connections {
            anyhow::bail!(
                "Database min_connections ({}) cannot exceed max_connections ({})",
                self.database.min_connections,
                self.database.max_connections
            );
        }

        if self.storage.bucket.is_empty() {
            anyhow::bail!("S3 bucket cannot be empty");
        }

        Ok(())
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Config {
        Config {
            pipeline: PipelineConfig::default(),
            database: DbConfig::default(),
            storage: StorageConfig::for_minio("http://localhost:9000", "hrm-data"),
        }
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = sample();
        assert!(config.validate().is_ok());
        assert_eq!(config.pipeline.batch_size, 1000);
        assert_eq!(config.pipeline.idle_flush(), Duration::from_secs(2));
        assert_eq!(config.pipeline.backup_fetch_size, 10_000);
        assert_eq!(config.pipeline.backup_write_chunk_size, 1000);
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let mut config = sample();
        config.pipeline.batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_min_connections_above_max_rejected() {
        let mut config = sample();
        config.database.min_connections = 50;
        config.database.max_connections = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_bucket_rejected() {
        let mut config = sample();
        config.storage.bucket.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_or_falls_back_on_garbage() {
        std::env::set_var("HRM_TEST_ENV_OR", "not-a-number");
        assert_eq!(env_or("HRM_TEST_ENV_OR", 7usize), 7);
        std::env::set_var("HRM_TEST_ENV_OR", " 42 ");
        assert_eq!(env_or("HRM_TEST_ENV_OR", 7usize), 42);
        std::env::remove_var("HRM_TEST_ENV_OR");
    }
}

use serde::{Deserialize, Serialize};
use std::env;

/// Default bucket for staged files and backups.
pub const DEFAULT_BUCKET: &str = "hrm-data";

/// Default region; S3-compatible servers such as MinIO ignore it.
pub const DEFAULT_REGION: &str = "us-east-1";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub endpoint: Option<String>,
    pub region: String,
    pub bucket: String,
    pub access_key: String,
    #[serde(skip_serializing)]
    pub secret_key: String,
    pub path_style: bool,
}

impl StorageConfig {
    /// Read S3 settings. Without `S3_ACCESS_KEY`/`AWS_ACCESS_KEY_ID` the
    /// client falls back to the default AWS credential chain.
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            endpoint: env::var("S3_ENDPOINT").ok().filter(|e| !e.is_empty()),
            region: env::var("S3_REGION").unwrap_or_else(|_| DEFAULT_REGION.to_string()),
            bucket: env::var("S3_BUCKET").unwrap_or_else(|_| DEFAULT_BUCKET.to_string()),
            access_key: env::var("S3_ACCESS_KEY")
                .or_else(|_| env::var("AWS_ACCESS_KEY_ID"))
                .unwrap_or_default(),
            secret_key: env::var("S3_SECRET_KEY")
                .or_else(|_| env::var("AWS_SECRET_ACCESS_KEY"))
                .unwrap_or_default(),
            path_style: env::var("S3_PATH_STYLE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(false),
        })
    }

    pub fn for_minio(endpoint: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            endpoint: Some(endpoint.into()),
            region: DEFAULT_REGION.to_string(),
            bucket: bucket.into(),
            access_key: "minioadmin".to_string(),
            secret_key: "minioadmin".to_string(),
            path_style: true,
        }
    }

    pub fn has_static_credentials(&self) -> bool {
        !self.access_key.is_empty() && !self.secret_key.is_empty()
    }
}

use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_s3::{
    config::{BehaviorVersion, Credentials, Region},
    primitives::ByteStream,
    Client,
};
use std::path::Path;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tracing::{debug, info, instrument};

pub mod config;

/// Streaming reader over an object's body
pub type ObjectReader = Pin<Box<dyn AsyncRead + Send>>;

/// The object-storage operations the pipeline needs
#[async_trait]
pub trait ObjectStore: Send + Sync {
    fn bucket(&self) -> &str;

    /// Upload a local file under `key`
    async fn put_file(&self, key: &str, path: &Path) -> Result<()>;

    /// Download `key` into a local file, returning the number of bytes written
    async fn get_to_file(&self, key: &str, path: &Path) -> Result<u64>;

    /// Open `key` for streaming reads
    async fn open_read(&self, key: &str) -> Result<ObjectReader>;

    /// Every object key under `prefix`, across all result pages
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Common prefixes directly under `prefix`, e.g. the "directories"
    async fn list_prefixes(&self, prefix: &str, delimiter: &str) -> Result<Vec<String>>;

    fn uri(&self, key: &str) -> String {
        format!("s3://{}/{}", self.bucket(), key)
    }
}

#[derive(Clone)]
pub struct Storage {
    client: Client,
    bucket: String,
}

impl Storage {
    pub async fn new(config: config::StorageConfig) -> Result<Self> {
        debug!(
            endpoint = ?config.endpoint,
            region = %config.region,
            bucket = %config.bucket,
            "Initializing storage"
        );

        let mut s3_config_builder = if config.has_static_credentials() {
            let credentials = Credentials::new(
                &config.access_key,
                &config.secret_key,
                None,
                None,
                "hrm-storage",
            );
            aws_sdk_s3::Config::builder()
                .behavior_version(BehaviorVersion::latest())
                .credentials_provider(credentials)
                .region(Region::new(config.region.clone()))
        } else {
            let shared = aws_config::defaults(BehaviorVersion::latest())
                .region(Region::new(config.region.clone()))
                .load()
                .await;
            aws_sdk_s3::config::Builder::from(&shared)
        };

        s3_config_builder = s3_config_builder.force_path_style(config.path_style);
        if let Some(endpoint) = &config.endpoint {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint);
        }

        let client = Client::from_conf(s3_config_builder.build());

        info!("Storage client initialized for bucket: {}", config.bucket);

        Ok(Self {
            client,
            bucket: config.bucket,
        })
    }

    /// Create the bucket if it does not exist yet
    pub async fn ensure_bucket(&self) -> Result<()> {
        if self.client.head_bucket().bucket(&self.bucket).send().await.is_ok() {
            return Ok(());
        }

        info!("Creating bucket: {}", self.bucket);
        self.client
            .create_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .with_context(|| format!("Failed to create S3 bucket {}", self.bucket))?;
        Ok(())
    }

    async fn get_body(&self, key: &str) -> Result<ByteStream> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .with_context(|| format!("Failed to download from S3: {}", key))?;
        Ok(response.body)
    }
}

#[async_trait]
impl ObjectStore for Storage {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    #[instrument(skip(self))]
    async fn put_file(&self, key: &str, path: &Path) -> Result<()> {
        let body = ByteStream::from_path(path)
            .await
            .with_context(|| format!("Failed to open {} for upload", path.display()))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .send()
            .await
            .with_context(|| format!("Failed to upload to S3: {}", key))?;

        info!("Successfully uploaded to s3://{}/{}", self.bucket, key);

        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_to_file(&self, key: &str, path: &Path) -> Result<u64> {
        let body = self.get_body(key).await?;
        let mut reader = Box::pin(body.into_async_read());
        let mut file = tokio::fs::File::create(path)
            .await
            .with_context(|| format!("Failed to create {}", path.display()))?;

        let written = tokio::io::copy(&mut reader, &mut file)
            .await
            .context("Failed to read S3 response body")?;
        file.flush().await?;

        debug!("Downloaded {} bytes from s3://{}/{}", written, self.bucket, key);

        Ok(written)
    }

    #[instrument(skip(self))]
    async fn open_read(&self, key: &str) -> Result<ObjectReader> {
        let body = self.get_body(key).await?;
        Ok(Box::pin(body.into_async_read()))
    }

    #[instrument(skip(self))]
    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .context("Failed to list S3 objects")?;

            keys.extend(
                response
                    .contents()
                    .iter()
                    .filter_map(|obj| obj.key().map(|k| k.to_string())),
            );

            match response.next_continuation_token() {
                Some(token) if response.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }

        debug!("Listed {} objects under s3://{}/{}", keys.len(), self.bucket, prefix);

        Ok(keys)
    }

    #[instrument(skip(self))]
    async fn list_prefixes(&self, prefix: &str, delimiter: &str) -> Result<Vec<String>> {
        let mut prefixes = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .delimiter(delimiter)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .context("Failed to list S3 prefixes")?;

            prefixes.extend(
                response
                    .common_prefixes()
                    .iter()
                    .filter_map(|p| p.prefix().map(|s| s.to_string())),
            );

            match response.next_continuation_token() {
                Some(token) if response.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }

        Ok(prefixes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uri() {
        let storage = Storage {
            client: Client::from_conf(
                aws_sdk_s3::Config::builder()
                    .behavior_version(BehaviorVersion::latest())
                    .build(),
            ),
            bucket: "hrm-data".to_string(),
        };

        assert_eq!(
            storage.uri("backups/jobs/20240101T000000/"),
            "s3://hrm-data/backups/jobs/20240101T000000/"
        );
    }
}

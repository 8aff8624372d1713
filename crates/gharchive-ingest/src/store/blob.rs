//! S3-compatible object storage client for fallback blobs

use crate::config::StorageConfig;
use crate::error::StoreError;
use crate::store::BlobId;
use aws_sdk_s3::{
    config::{Credentials, Region},
    error::DisplayErrorContext,
    primitives::ByteStream,
    Client,
};
use tracing::{debug, info, instrument};

/// Key prefix under which raw lines are parked
pub const FALLBACK_PREFIX: &str = "fallback";

#[derive(Clone)]
pub struct BlobStorage {
    client: Client,
    bucket: String,
}

impl BlobStorage {
    pub fn new(config: &StorageConfig) -> Self {
        let credentials = Credentials::new(
            &config.access_key,
            &config.secret_key,
            None,
            None,
            "gharchive-fallback",
        );

        let mut s3_config_builder = aws_sdk_s3::Config::builder()
            .credentials_provider(credentials)
            .region(Region::new(config.region.clone()))
            .force_path_style(config.path_style);

        if let Some(endpoint) = &config.endpoint {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint);
        }

        let client = Client::from_conf(s3_config_builder.build());

        info!(bucket = %config.bucket, "Object storage client initialized");

        Self {
            client,
            bucket: config.bucket.clone(),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Object key of a fallback blob
    pub fn key_for(id: BlobId) -> String {
        format!("{}/{}", FALLBACK_PREFIX, id)
    }

    #[instrument(skip(self, data), fields(size = data.len()))]
    pub async fn upload(&self, key: &str, data: Vec<u8>) -> Result<(), StoreError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type("application/octet-stream")
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| {
                StoreError::Object(format!("upload of {} failed: {}", key, DisplayErrorContext(&e)))
            })?;

        debug!("Uploaded s3://{}/{}", self.bucket, key);
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn download(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                StoreError::Object(format!("download of {} failed: {}", key, DisplayErrorContext(&e)))
            })?;

        let data = response
            .body
            .collect()
            .await
            .map_err(|e| StoreError::Object(format!("reading {} failed: {}", key, e)))?
            .into_bytes()
            .to_vec();

        Ok(data)
    }

    #[instrument(skip(self))]
    pub async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                StoreError::Object(format!("delete of {} failed: {}", key, DisplayErrorContext(&e)))
            })?;

        debug!("Deleted s3://{}/{}", self.bucket, key);
        Ok(())
    }
}

//! Read access to uploaded objects.

use crate::config::S3Config;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::Client as S3Client;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, info, instrument};

#[derive(Error, Debug)]
pub enum ObjectStoreError {
    #[error("Object {bucket}/{key} not found")]
    NotFound { bucket: String, key: String },

    #[error("Object store request failed: {0}")]
    Request(String),
}

/// Fetches uploaded objects by bucket and decoded key
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, bucket: &str, key: &str) -> Result<Bytes, ObjectStoreError>;
}

/// S3-backed object store
pub struct S3ObjectStore {
    client: S3Client,
}

impl S3ObjectStore {
    pub async fn new(config: &S3Config) -> Self {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(region = %config.region, "S3 object store initialized");

        Self { client }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    #[instrument(skip(self))]
    async fn get(&self, bucket: &str, key: &str) -> Result<Bytes, ObjectStoreError> {
        let response = match self.client.get_object().bucket(bucket).key(key).send().await {
            Ok(response) => response,
            Err(e) => {
                if e.as_service_error()
                    .map(|e| e.is_no_such_key())
                    .unwrap_or(false)
                {
                    return Err(ObjectStoreError::NotFound {
                        bucket: bucket.to_string(),
                        key: key.to_string(),
                    });
                }
                return Err(ObjectStoreError::Request(e.to_string()));
            }
        };

        let data = response
            .body
            .collect()
            .await
            .map_err(|e| ObjectStoreError::Request(e.to_string()))?
            .into_bytes();

        debug!(size_bytes = data.len(), "Object fetched");
        Ok(data)
    }
}

/// In-process object store for local runs and tests
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: RwLock<HashMap<(String, String), Bytes>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, bucket: impl Into<String>, key: impl Into<String>, data: impl Into<Bytes>) {
        self.objects
            .write()
            .insert((bucket.into(), key.into()), data.into());
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn get(&self, bucket: &str, key: &str) -> Result<Bytes, ObjectStoreError> {
        self.objects
            .read()
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| ObjectStoreError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_lookup() {
        let store = MemoryObjectStore::new();
        store.put("images", "vacation photo.png", vec![1u8, 2, 3]);

        let data = tokio_test::assert_ok!(store.get("images", "vacation photo.png").await);
        assert_eq!(data.as_ref(), &[1, 2, 3]);

        let missing = store.get("images", "vacation+photo.png").await;
        assert!(matches!(missing, Err(ObjectStoreError::NotFound { .. })));
    }
}

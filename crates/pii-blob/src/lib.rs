//! Blob-store abstraction (§1 "assumed: put-object with content type"),
//! the sole write path for an [`pii_core::types::ArchivalArtifact`] (§3).
//!
//! No GCS crate exists anywhere in the retrieved example pack, so this
//! substitutes `aws-sdk-s3` (seen in several pack manifests) — bucket/key/
//! content-type put-object semantics map directly onto the GCS operations
//! the source actually performs; this is noted as a substitution in
//! DESIGN.md, not presented as a GCS-equivalent client.

use async_trait::async_trait;

use pii_core::error::{PiiError, Result};

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Write `body` to `bucket/key` with the given content type, overwriting
    /// any existing object (the aggregator writes each transcript exactly
    /// once per conversation id, but retries must be safe to repeat, §5
    /// "Cancellation and timeouts").
    async fn put_object(&self, bucket: &str, key: &str, body: Vec<u8>, content_type: &str) -> Result<()>;

    /// Read an object back. Used by the uploader to resolve a GCS-style
    /// `gs://bucket/key` source URI into bytes it can forward, and by tests
    /// exercising round-trip R1.
    async fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>>;
}

pub struct S3BlobStore {
    client: aws_sdk_s3::Client,
}

impl S3BlobStore {
    pub fn new(client: aws_sdk_s3::Client) -> Self {
        Self { client }
    }

    pub async fn from_env() -> Self {
        let config = aws_config::load_from_env().await;
        Self::new(aws_sdk_s3::Client::new(&config))
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn put_object(&self, bucket: &str, key: &str, body: Vec<u8>, content_type: &str) -> Result<()> {
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(body.into())
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| PiiError::Transient(format!("put_object failed: {e}")))?;
        Ok(())
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        let output = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| PiiError::Transient(format!("get_object failed: {e}")))?;
        let bytes = output
            .body
            .collect()
            .await
            .map_err(|e| PiiError::Transient(format!("reading object body failed: {e}")))?;
        Ok(bytes.into_bytes().to_vec())
    }
}

/// In-process fake used by binaries' own test suites.
#[cfg(any(test, feature = "test-util"))]
pub mod fake {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakeBlobStore {
        objects: Mutex<HashMap<(String, String), Vec<u8>>>,
    }

    impl FakeBlobStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn contains(&self, bucket: &str, key: &str) -> bool {
            self.objects
                .lock()
                .unwrap()
                .contains_key(&(bucket.to_string(), key.to_string()))
        }
    }

    #[async_trait]
    impl BlobStore for FakeBlobStore {
        async fn put_object(&self, bucket: &str, key: &str, body: Vec<u8>, _content_type: &str) -> Result<()> {
            self.objects
                .lock()
                .unwrap()
                .insert((bucket.to_string(), key.to_string()), body);
            Ok(())
        }

        async fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
            self.objects
                .lock()
                .unwrap()
                .get(&(bucket.to_string(), key.to_string()))
                .cloned()
                .ok_or_else(|| PiiError::NotFound(format!("{bucket}/{key}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakeBlobStore;
    use super::*;

    #[tokio::test]
    async fn put_then_get_round_trips_bytes() {
        let store = FakeBlobStore::new();
        store
            .put_object("bucket", "c1_transcript.json", b"{\"entries\":[]}".to_vec(), "application/json")
            .await
            .unwrap();
        let body = store.get_object("bucket", "c1_transcript.json").await.unwrap();
        assert_eq!(body, b"{\"entries\":[]}".to_vec());
    }

    #[tokio::test]
    async fn missing_object_is_not_found() {
        let store = FakeBlobStore::new();
        assert!(store.get_object("bucket", "missing.json").await.is_err());
    }
}

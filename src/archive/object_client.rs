//! Object Store Client
//!
//! Deadline-bounded uploads and downloads on top of an [`ObjectStore`]
//! backend. Each call is wrapped in `tokio::time::timeout`; on expiry the
//! backend future is dropped, which aborts the in-flight request, and a
//! [`ClientError::Timeout`] is returned. The client never retries: retry
//! policy belongs to the upload scheduler.

use crate::archive::config::ClientConfig;
use crate::archive::keys::{extension_for_content_type, infer_content_type, StoredObjectKey};
use crate::archive::object_store::{ObjectStore, ObjectStoreError};
use crate::archive::record::PartitionKey;
use crate::archive::render::ExportFormat;
use bytes::Bytes;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("{op} of {key} timed out after {after:?}")]
    Timeout {
        op: &'static str,
        key: String,
        after: Duration,
    },
    #[error("{op} of {key} failed: {source}")]
    Store {
        op: &'static str,
        key: String,
        source: ObjectStoreError,
    },
    #[error("local I/O on {path}: {source}")]
    LocalIo {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl ClientError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::Store { source, .. } if source.is_not_found())
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ClientError::Timeout { .. })
    }

    fn local(path: &Path, source: std::io::Error) -> Self {
        ClientError::LocalIo {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Where an upload landed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReceipt {
    pub key: String,
    pub url: String,
    pub size_bytes: u64,
    pub content_type: String,
    /// CRC32 of the uploaded bytes
    pub checksum: u32,
}

#[derive(Clone)]
pub struct ObjectStoreClient {
    store: Arc<dyn ObjectStore>,
    config: ClientConfig,
}

impl ObjectStoreClient {
    pub fn new(store: Arc<dyn ObjectStore>, config: ClientConfig) -> Self {
        ObjectStoreClient { store, config }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Public URL of a stored object
    pub fn url_for(&self, key: &str) -> String {
        let base = match &self.config.public_base_url {
            Some(base) => base.trim_end_matches('/').to_string(),
            None => self.store.base_url(),
        };
        format!("{}/{}", base, key)
    }

    async fn bounded<T, F>(
        &self,
        op: &'static str,
        key: &str,
        after: Duration,
        fut: F,
    ) -> Result<T, ClientError>
    where
        F: Future<Output = Result<T, ObjectStoreError>>,
    {
        match tokio::time::timeout(after, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(source)) => Err(ClientError::Store {
                op,
                key: key.to_string(),
                source,
            }),
            Err(_) => {
                warn!(op, key, timeout_ms = after.as_millis() as u64, "object store call timed out, aborted");
                Err(ClientError::Timeout {
                    op,
                    key: key.to_string(),
                    after,
                })
            }
        }
    }

    /// Upload a buffer under `key`. The content type is inferred from the
    /// bytes and the key's extension when not given.
    pub async fn upload_buffer(
        &self,
        data: Bytes,
        key: &str,
        content_type: Option<&str>,
    ) -> Result<UploadReceipt, ClientError> {
        let content_type = content_type
            .map(str::to_string)
            .unwrap_or_else(|| infer_content_type(Some(Path::new(key)), &data).to_string());
        let size_bytes = data.len() as u64;
        let checksum = crc32fast::hash(&data);

        self.bounded(
            "upload",
            key,
            self.config.upload_timeout,
            self.store.put(key, data, Some(&content_type)),
        )
        .await?;

        debug!(key, size_bytes, content_type = %content_type, "uploaded object");
        Ok(UploadReceipt {
            key: key.to_string(),
            url: self.url_for(key),
            size_bytes,
            content_type,
            checksum,
        })
    }

    /// Upload a local file under `key`
    pub async fn upload_file(&self, path: &Path, key: &str) -> Result<UploadReceipt, ClientError> {
        let data = tokio::fs::read(path)
            .await
            .map_err(|e| ClientError::local(path, e))?;
        let content_type = infer_content_type(Some(path), &data);
        self.upload_buffer(Bytes::from(data), key, Some(content_type))
            .await
    }

    /// Download `key` to `local_path`.
    ///
    /// Bytes go to `<local_path>.part` first and are renamed into place, so
    /// a failed download never leaves a partial file at `local_path`.
    pub async fn download_to_file(&self, key: &str, local_path: &Path) -> Result<u64, ClientError> {
        let data = self
            .bounded("download", key, self.config.download_timeout, self.store.get(key))
            .await?;

        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ClientError::local(parent, e))?;
        }
        let mut part = local_path.as_os_str().to_owned();
        part.push(".part");
        let part = PathBuf::from(part);

        if let Err(e) = tokio::fs::write(&part, &data).await {
            let _ = tokio::fs::remove_file(&part).await;
            return Err(ClientError::local(&part, e));
        }
        tokio::fs::rename(&part, local_path)
            .await
            .map_err(|e| ClientError::local(local_path, e))?;

        debug!(key, path = %local_path.display(), bytes = data.len(), "downloaded object");
        Ok(data.len() as u64)
    }

    /// Every key under `prefix`, following pagination
    pub async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, ClientError> {
        let listing = async {
            let mut keys = Vec::new();
            let mut token: Option<String> = None;
            loop {
                let page = self.store.list(prefix, token.as_deref()).await?;
                keys.extend(page.objects.into_iter().map(|o| o.key));
                match page.continuation_token {
                    Some(next) => token = Some(next),
                    None => return Ok::<_, ObjectStoreError>(keys),
                }
            }
        };
        self.bounded("list", prefix, self.config.list_timeout, listing)
            .await
    }

    pub async fn exists(&self, key: &str) -> Result<bool, ClientError> {
        self.bounded("exists", key, self.config.list_timeout, self.store.exists(key))
            .await
    }

    /// Mirror one media attachment of a record
    pub async fn upload_media(
        &self,
        partition: &PartitionKey,
        record_id: &str,
        index: usize,
        data: Bytes,
        content_type: Option<&str>,
    ) -> Result<UploadReceipt, ClientError> {
        let content_type = content_type
            .map(str::to_string)
            .unwrap_or_else(|| infer_content_type(None, &data).to_string());
        let ext = extension_for_content_type(&content_type);
        let key = StoredObjectKey::for_media(partition, record_id, index, ext).to_string();
        self.upload_buffer(data, &key, Some(&content_type)).await
    }

    /// Publish a rendered export report
    pub async fn upload_report(
        &self,
        partition: &PartitionKey,
        format: ExportFormat,
        body: Bytes,
        generated_at_ms: i64,
    ) -> Result<UploadReceipt, ClientError> {
        let key = StoredObjectKey::for_export(partition, generated_at_ms, format.extension()).to_string();
        let receipt = self
            .upload_buffer(body, &key, Some(format.content_type()))
            .await?;
        info!(partition = %partition, key = %receipt.key, "published export report");
        Ok(receipt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::object_store::InMemoryObjectStore;
    use crate::archive::simulated_store::{FaultRule, SimulatedObjectStore, StoreOp};
    use chrono::NaiveDate;

    fn client_with(store: Arc<dyn ObjectStore>) -> ObjectStoreClient {
        ObjectStoreClient::new(
            store,
            ClientConfig {
                upload_timeout: Duration::from_millis(100),
                download_timeout: Duration::from_millis(100),
                list_timeout: Duration::from_millis(100),
                public_base_url: Some("https://cdn.example/".to_string()),
            },
        )
    }

    #[tokio::test]
    async fn test_upload_buffer_receipt() {
        let store = InMemoryObjectStore::new();
        let client = client_with(Arc::new(store.clone()));

        let receipt = client
            .upload_buffer(Bytes::from_static(b"{\"id\":\"m1\"}\n"), "logs/2024-01-01/g1/g1_2024-01-01.jsonl", None)
            .await
            .unwrap();

        assert_eq!(receipt.url, "https://cdn.example/logs/2024-01-01/g1/g1_2024-01-01.jsonl");
        assert_eq!(receipt.size_bytes, 12);
        assert_eq!(receipt.content_type, "application/x-ndjson");
        assert_eq!(receipt.checksum, crc32fast::hash(b"{\"id\":\"m1\"}\n"));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_upload_timeout_aborts_transfer() {
        let sim = SimulatedObjectStore::new(InMemoryObjectStore::new());
        sim.add_rule(FaultRule::delay(StoreOp::Put, "slow", Duration::from_secs(5)));
        let client = client_with(Arc::new(sim.clone()));

        let started = std::time::Instant::now();
        let err = client
            .upload_buffer(Bytes::from_static(b"x"), "logs/slow.jsonl", None)
            .await
            .unwrap_err();

        assert!(err.is_timeout());
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(sim.stats().aborted_puts, 1);
        assert!(sim.inner().is_empty());
    }

    #[tokio::test]
    async fn test_download_writes_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let store = InMemoryObjectStore::new();
        let client = client_with(Arc::new(store.clone()));
        client
            .upload_buffer(Bytes::from_static(b"line\n"), "logs/a.jsonl", None)
            .await
            .unwrap();

        let target = dir.path().join("nested").join("a.jsonl");
        let n = client.download_to_file("logs/a.jsonl", &target).await.unwrap();
        assert_eq!(n, 5);
        assert_eq!(std::fs::read(&target).unwrap(), b"line\n");

        let missing = dir.path().join("missing.jsonl");
        let err = client.download_to_file("logs/missing.jsonl", &missing).await.unwrap_err();
        assert!(err.is_not_found());
        assert!(!missing.exists());
        assert!(!dir.path().join("missing.jsonl.part").exists());
    }

    #[tokio::test]
    async fn test_list_keys_follows_pages() {
        let store = InMemoryObjectStore::new().with_page_size(2);
        let client = client_with(Arc::new(store));
        for i in 0..5 {
            client
                .upload_buffer(Bytes::from_static(b"x"), &format!("logs/2024-01-01/g{}/f.jsonl", i), None)
                .await
                .unwrap();
        }
        let keys = client.list_keys("logs/2024-01-01/").await.unwrap();
        assert_eq!(keys.len(), 5);
    }

    #[tokio::test]
    async fn test_upload_media_and_report_keys() {
        let store = InMemoryObjectStore::new();
        let client = client_with(Arc::new(store.clone()));
        let partition = PartitionKey::new(Some("g1"), NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());

        let media = client
            .upload_media(&partition, "m1", 0, Bytes::from_static(b"\x89PNG\r\n\x1a\n...."), None)
            .await
            .unwrap();
        assert_eq!(media.key, "media/2024-01-01/g1/m1.png");
        assert_eq!(media.content_type, "image/png");

        let report = client
            .upload_report(&partition, ExportFormat::Csv, Bytes::from_static(b"id\n"), 42)
            .await
            .unwrap();
        assert_eq!(report.key, "exports/2024-01-01/g1/42.csv");
    }

    #[test]
    fn test_url_falls_back_to_backend_base() {
        let client = ObjectStoreClient::new(Arc::new(InMemoryObjectStore::new()), ClientConfig::default());
        assert_eq!(client.url_for("logs/a.jsonl"), "memory://archive/logs/a.jsonl");
    }
}

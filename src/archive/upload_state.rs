//! Upload State Store
//!
//! The single source of truth for "has this partition already been
//! shipped". One [`UploadRecord`] per [`PartitionKey`], kept in a keyed table
//! so a second record for the same key cannot exist.
//!
//! ## Status Machine
//!
//! ```text
//!            claim            upload ok
//! pending ─────────► uploading ─────────► uploaded   (terminal, re-marking is a no-op)
//!                      │   ▲
//!          upload err  │   │ claim (retry)
//!                      ▼   │
//!                     failed
//! ```
//!
//! ## Persistence
//!
//! The table is written as a versioned JSON document after every mutation:
//!
//! 1. Serialize the table to `<path>.tmp`
//! 2. fsync, then rename over `<path>` (atomic on POSIX)
//! 3. On failure the in-memory change is rolled back and the old document
//!    stays intact

use crate::archive::clock::ArchiveClock;
use crate::archive::object_client::UploadReceipt;
use crate::archive::record::PartitionKey;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Version of the persisted document format
pub const STATE_FORMAT_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("I/O error on upload state {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("corrupt upload state {path}: {source}")]
    Corrupt {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("upload state {path} has unsupported version {version}")]
    UnsupportedVersion { path: PathBuf, version: u32 },
    #[error("upload state holds two records for {0}")]
    DuplicateRecord(PartitionKey),
    #[error("invalid upload status transition for {key}: {from} -> {to}")]
    InvalidTransition {
        key: PartitionKey,
        from: UploadStatus,
        to: UploadStatus,
    },
    #[error("no upload record for {0}")]
    NotFound(PartitionKey),
    #[error("failed to encode upload state: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    Pending,
    Uploading,
    Uploaded,
    Failed,
}

impl UploadStatus {
    pub fn can_transition_to(self, next: UploadStatus) -> bool {
        use UploadStatus::*;
        matches!(
            (self, next),
            (Pending, Uploading)
                | (Uploading, Uploaded)
                | (Uploading, Failed)
                | (Failed, Uploading)
                | (Uploaded, Uploaded)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStatus::Pending => "pending",
            UploadStatus::Uploading => "uploading",
            UploadStatus::Uploaded => "uploaded",
            UploadStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of one partition's upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadRecord {
    pub key: PartitionKey,
    pub status: UploadStatus,
    pub local_path: PathBuf,
    pub remote_key: Option<String>,
    pub remote_url: Option<String>,
    pub size_bytes: u64,
    pub record_count: u64,
    /// CRC32 of the uploaded bytes
    pub checksum: Option<u32>,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub uploaded_at: Option<DateTime<Utc>>,
}

impl UploadRecord {
    fn new(key: PartitionKey, status: UploadStatus, local_path: PathBuf, now: DateTime<Utc>) -> Self {
        UploadRecord {
            key,
            status,
            local_path,
            remote_key: None,
            remote_url: None,
            size_bytes: 0,
            record_count: 0,
            checksum: None,
            attempts: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
            uploaded_at: None,
        }
    }

    fn transition(&mut self, to: UploadStatus, now: DateTime<Utc>) -> Result<(), StateError> {
        if !self.status.can_transition_to(to) {
            return Err(StateError::InvalidTransition {
                key: self.key.clone(),
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.updated_at = now;
        Ok(())
    }
}

/// Result of trying to take ownership of an upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The caller now owns the upload; the record is `uploading`
    Claimed(UploadRecord),
    /// Nothing to do
    AlreadyUploaded(UploadRecord),
    /// Another upload of the key is running
    InProgress(UploadRecord),
}

/// Number of records per status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub uploading: usize,
    pub uploaded: usize,
    pub failed: usize,
}

#[derive(Serialize)]
struct StateDocumentRef<'a> {
    version: u32,
    records: Vec<&'a UploadRecord>,
}

#[derive(Deserialize)]
struct StateDocument {
    version: u32,
    records: Vec<UploadRecord>,
}

type Table = BTreeMap<PartitionKey, UploadRecord>;

pub struct UploadStateStore {
    /// `None` keeps the table in memory only
    path: Option<PathBuf>,
    table: Mutex<Table>,
    clock: Arc<dyn ArchiveClock>,
}

impl UploadStateStore {
    /// Load the table from `path`, starting empty when the file is absent.
    pub async fn open(path: impl Into<PathBuf>, clock: Arc<dyn ArchiveClock>) -> Result<Self, StateError> {
        let path = path.into();
        let table = match tokio::fs::read(&path).await {
            Ok(data) => Self::decode(&path, &data)?,
            Err(e) if e.kind() == ErrorKind::NotFound => Table::new(),
            Err(source) => return Err(StateError::Io { path, source }),
        };
        info!(path = %path.display(), records = table.len(), "upload state loaded");
        Ok(UploadStateStore {
            path: Some(path),
            table: Mutex::new(table),
            clock,
        })
    }

    /// Non-persistent store (for tests)
    pub fn in_memory(clock: Arc<dyn ArchiveClock>) -> Self {
        UploadStateStore {
            path: None,
            table: Mutex::new(Table::new()),
            clock,
        }
    }

    fn decode(path: &Path, data: &[u8]) -> Result<Table, StateError> {
        let doc: StateDocument = serde_json::from_slice(data).map_err(|source| StateError::Corrupt {
            path: path.to_path_buf(),
            source,
        })?;
        if doc.version != STATE_FORMAT_VERSION {
            return Err(StateError::UnsupportedVersion {
                path: path.to_path_buf(),
                version: doc.version,
            });
        }
        let mut table = Table::new();
        for record in doc.records {
            let key = record.key.clone();
            if table.insert(key.clone(), record).is_some() {
                return Err(StateError::DuplicateRecord(key));
            }
        }
        Ok(table)
    }

    async fn persist(&self, table: &Table) -> Result<(), StateError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let doc = StateDocumentRef {
            version: STATE_FORMAT_VERSION,
            records: table.values().collect(),
        };
        let data = serde_json::to_vec_pretty(&doc)?;

        let mut temp = path.as_os_str().to_owned();
        temp.push(".tmp");
        let temp = PathBuf::from(temp);

        let write = async {
            let mut file = tokio::fs::File::create(&temp).await?;
            file.write_all(&data).await?;
            file.sync_all().await?;
            tokio::fs::rename(&temp, path).await
        };
        write.await.map_err(|source| StateError::Io {
            path: path.clone(),
            source,
        })
    }

    /// Persist after changing `key`; restore `previous` if that fails.
    async fn commit(
        &self,
        table: &mut Table,
        key: &PartitionKey,
        previous: Option<UploadRecord>,
    ) -> Result<(), StateError> {
        if let Err(e) = self.persist(table).await {
            match previous {
                Some(record) => {
                    table.insert(key.clone(), record);
                }
                None => {
                    table.remove(key);
                }
            }
            warn!(partition = %key, error = %e, "upload state not persisted, change rolled back");
            return Err(e);
        }
        Ok(())
    }

    pub async fn get(&self, key: &PartitionKey) -> Option<UploadRecord> {
        self.table.lock().await.get(key).cloned()
    }

    pub async fn is_uploaded(&self, key: &PartitionKey) -> bool {
        self.table
            .lock()
            .await
            .get(key)
            .is_some_and(|r| r.status == UploadStatus::Uploaded)
    }

    /// Insert or replace the record for `record.key`. A status change must be
    /// an allowed transition; an uploaded record is never overwritten.
    pub async fn upsert(&self, mut record: UploadRecord) -> Result<(), StateError> {
        let mut table = self.table.lock().await;
        let key = record.key.clone();
        let previous = table.get(&key).cloned();
        if let Some(existing) = &previous {
            if existing.status == UploadStatus::Uploaded && record.status == UploadStatus::Uploaded {
                return Ok(());
            }
            if existing.status != record.status && !existing.status.can_transition_to(record.status) {
                return Err(StateError::InvalidTransition {
                    key,
                    from: existing.status,
                    to: record.status,
                });
            }
            record.created_at = existing.created_at;
        }
        record.updated_at = self.clock.now();
        table.insert(key.clone(), record);
        self.commit(&mut table, &key, previous).await
    }

    /// Make sure a record exists for a partition that is due for upload.
    /// Existing records are returned unchanged.
    pub async fn mark_pending(&self, key: &PartitionKey, local_path: &Path) -> Result<UploadRecord, StateError> {
        let mut table = self.table.lock().await;
        if let Some(existing) = table.get(key) {
            return Ok(existing.clone());
        }
        let record = UploadRecord::new(key.clone(), UploadStatus::Pending, local_path.to_path_buf(), self.clock.now());
        table.insert(key.clone(), record.clone());
        self.commit(&mut table, key, None).await?;
        Ok(record)
    }

    /// Atomically move the record to `uploading` unless it is already
    /// uploaded or being uploaded. Creates the record when absent.
    pub async fn claim(&self, key: &PartitionKey, local_path: &Path) -> Result<ClaimOutcome, StateError> {
        let now = self.clock.now();
        let mut table = self.table.lock().await;
        let previous = table.get(key).cloned();

        let mut record = match &previous {
            Some(r) if r.status == UploadStatus::Uploaded => return Ok(ClaimOutcome::AlreadyUploaded(r.clone())),
            Some(r) if r.status == UploadStatus::Uploading => return Ok(ClaimOutcome::InProgress(r.clone())),
            Some(r) => r.clone(),
            None => UploadRecord::new(key.clone(), UploadStatus::Pending, local_path.to_path_buf(), now),
        };
        record.transition(UploadStatus::Uploading, now)?;
        record.local_path = local_path.to_path_buf();
        record.attempts += 1;

        table.insert(key.clone(), record.clone());
        self.commit(&mut table, key, previous).await?;
        debug!(partition = %key, attempt = record.attempts, "upload claimed");
        Ok(ClaimOutcome::Claimed(record))
    }

    /// Record a successful upload. Re-marking an uploaded record is a no-op.
    pub async fn mark_uploaded(
        &self,
        key: &PartitionKey,
        receipt: &UploadReceipt,
        record_count: u64,
    ) -> Result<UploadRecord, StateError> {
        let now = self.clock.now();
        let mut table = self.table.lock().await;
        let previous = table.get(key).cloned().ok_or_else(|| StateError::NotFound(key.clone()))?;
        if previous.status == UploadStatus::Uploaded {
            return Ok(previous);
        }

        let mut record = previous.clone();
        record.transition(UploadStatus::Uploaded, now)?;
        record.remote_key = Some(receipt.key.clone());
        record.remote_url = Some(receipt.url.clone());
        record.size_bytes = receipt.size_bytes;
        record.checksum = Some(receipt.checksum);
        record.record_count = record_count;
        record.last_error = None;
        record.uploaded_at = Some(now);

        table.insert(key.clone(), record.clone());
        self.commit(&mut table, key, Some(previous)).await?;
        Ok(record)
    }

    /// Record a failed upload attempt
    pub async fn mark_failed(&self, key: &PartitionKey, error: &str) -> Result<UploadRecord, StateError> {
        let now = self.clock.now();
        let mut table = self.table.lock().await;
        let previous = table.get(key).cloned().ok_or_else(|| StateError::NotFound(key.clone()))?;

        let mut record = previous.clone();
        record.transition(UploadStatus::Failed, now)?;
        record.last_error = Some(error.to_string());

        table.insert(key.clone(), record.clone());
        self.commit(&mut table, key, Some(previous)).await?;
        Ok(record)
    }

    /// Fail every `uploading` record untouched for longer than `stale_after`
    /// (the process died mid-upload), so the next pass retries it.
    pub async fn recover_interrupted(&self, stale_after: Duration) -> Result<Vec<PartitionKey>, StateError> {
        let now = self.clock.now();
        let stale_after = ChronoDuration::from_std(stale_after).unwrap_or_else(|_| ChronoDuration::days(36_500));
        let cutoff = now - stale_after;

        let mut table = self.table.lock().await;
        let snapshot = table.clone();
        let mut recovered = Vec::new();
        for record in table.values_mut() {
            if record.status == UploadStatus::Uploading && record.updated_at <= cutoff {
                record.last_error = Some(format!(
                    "upload interrupted: still uploading since {}",
                    record.updated_at.format("%Y-%m-%d %H:%M:%S UTC")
                ));
                record.status = UploadStatus::Failed;
                record.updated_at = now;
                recovered.push(record.key.clone());
            }
        }
        if recovered.is_empty() {
            return Ok(recovered);
        }

        if let Err(e) = self.persist(&table).await {
            *table = snapshot;
            return Err(e);
        }
        for key in &recovered {
            warn!(partition = %key, "interrupted upload marked failed");
        }
        Ok(recovered)
    }

    /// Records still to ship for one date
    pub async fn pending_or_failed_for_date(&self, date: NaiveDate) -> Vec<UploadRecord> {
        self.table
            .lock()
            .await
            .values()
            .filter(|r| r.key.date == date)
            .filter(|r| matches!(r.status, UploadStatus::Pending | UploadStatus::Failed))
            .cloned()
            .collect()
    }

    /// Records whose date lies in `from..=to`, ordered by (group, date)
    pub async fn records_between(&self, from: NaiveDate, to: NaiveDate) -> Vec<UploadRecord> {
        self.table
            .lock()
            .await
            .values()
            .filter(|r| r.key.date >= from && r.key.date <= to)
            .cloned()
            .collect()
    }

    pub async fn all(&self) -> Vec<UploadRecord> {
        self.table.lock().await.values().cloned().collect()
    }

    pub async fn counts(&self) -> StatusCounts {
        let table = self.table.lock().await;
        let mut counts = StatusCounts::default();
        for record in table.values() {
            match record.status {
                UploadStatus::Pending => counts.pending += 1,
                UploadStatus::Uploading => counts.uploading += 1,
                UploadStatus::Uploaded => counts.uploaded += 1,
                UploadStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::clock::ManualClock;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn key(group: &str) -> PartitionKey {
        PartitionKey::new(Some(group), date(2024, 1, 1))
    }

    fn receipt(key: &PartitionKey) -> UploadReceipt {
        UploadReceipt {
            key: format!("logs/2024-01-01/{}/{}.jsonl", key.group, key.file_stem()),
            url: "https://archive.test/x".to_string(),
            size_bytes: 10,
            content_type: "application/x-ndjson".to_string(),
            checksum: 7,
        }
    }

    fn clock() -> ManualClock {
        ManualClock::at_noon(date(2024, 1, 2))
    }

    #[test]
    fn test_transitions() {
        use UploadStatus::*;
        assert!(Pending.can_transition_to(Uploading));
        assert!(Failed.can_transition_to(Uploading));
        assert!(Uploaded.can_transition_to(Uploaded));
        assert!(!Uploaded.can_transition_to(Uploading));
        assert!(!Pending.can_transition_to(Uploaded));
        assert!(!Failed.can_transition_to(Uploaded));
    }

    #[tokio::test]
    async fn test_claim_upload_cycle() {
        let store = UploadStateStore::in_memory(Arc::new(clock()));
        let k = key("g1");
        let path = PathBuf::from("/data/g1_2024-01-01.jsonl");

        let ClaimOutcome::Claimed(record) = store.claim(&k, &path).await.unwrap() else {
            panic!("expected claim");
        };
        assert_eq!(record.status, UploadStatus::Uploading);
        assert_eq!(record.attempts, 1);
        assert!(matches!(store.claim(&k, &path).await.unwrap(), ClaimOutcome::InProgress(_)));

        let uploaded = store.mark_uploaded(&k, &receipt(&k), 3).await.unwrap();
        assert_eq!(uploaded.status, UploadStatus::Uploaded);
        assert_eq!(uploaded.checksum, Some(7));
        assert!(store.is_uploaded(&k).await);
        assert!(store.is_uploaded(&k).await);

        // Re-marking is a no-op
        let again = store.mark_uploaded(&k, &receipt(&k), 99).await.unwrap();
        assert_eq!(again.record_count, 3);
        assert!(matches!(store.claim(&k, &path).await.unwrap(), ClaimOutcome::AlreadyUploaded(_)));
        assert_eq!(store.all().await.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_then_retry() {
        let store = UploadStateStore::in_memory(Arc::new(clock()));
        let k = key("g1");
        let path = PathBuf::from("/data/x");

        store.mark_pending(&k, &path).await.unwrap();
        assert_eq!(store.pending_or_failed_for_date(date(2024, 1, 1)).await.len(), 1);

        store.claim(&k, &path).await.unwrap();
        let failed = store.mark_failed(&k, "timed out").await.unwrap();
        assert_eq!(failed.last_error.as_deref(), Some("timed out"));
        assert_eq!(store.pending_or_failed_for_date(date(2024, 1, 1)).await.len(), 1);

        let ClaimOutcome::Claimed(retry) = store.claim(&k, &path).await.unwrap() else {
            panic!("expected claim");
        };
        assert_eq!(retry.attempts, 2);
        let done = store.mark_uploaded(&k, &receipt(&k), 1).await.unwrap();
        assert!(done.last_error.is_none());
        assert_eq!(store.counts().await.uploaded, 1);
    }

    #[tokio::test]
    async fn test_invalid_transitions_rejected() {
        let store = UploadStateStore::in_memory(Arc::new(clock()));
        let k = key("g1");

        assert!(matches!(
            store.mark_uploaded(&k, &receipt(&k), 1).await,
            Err(StateError::NotFound(_))
        ));

        store.mark_pending(&k, Path::new("/x")).await.unwrap();
        assert!(matches!(
            store.mark_uploaded(&k, &receipt(&k), 1).await,
            Err(StateError::InvalidTransition { from: UploadStatus::Pending, .. })
        ));
        assert!(matches!(
            store.mark_failed(&k, "x").await,
            Err(StateError::InvalidTransition { .. })
        ));

        let mut record = store.get(&k).await.unwrap();
        record.status = UploadStatus::Uploaded;
        assert!(store.upsert(record).await.is_err());
    }

    #[tokio::test]
    async fn test_upsert_leaves_uploaded_record_alone() {
        let store = UploadStateStore::in_memory(Arc::new(clock()));
        let k = key("g1");
        store.claim(&k, Path::new("/x")).await.unwrap();
        let uploaded = store.mark_uploaded(&k, &receipt(&k), 3).await.unwrap();

        let mut rewrite = uploaded.clone();
        rewrite.remote_key = Some("logs/elsewhere.jsonl".to_string());
        rewrite.size_bytes = 999;
        store.upsert(rewrite).await.unwrap();
        assert_eq!(store.get(&k).await.unwrap(), uploaded);
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let clock: Arc<dyn ArchiveClock> = Arc::new(clock());
        let k = key("g1");

        {
            let store = UploadStateStore::open(&path, clock.clone()).await.unwrap();
            store.claim(&k, Path::new("/data/x")).await.unwrap();
            store.mark_uploaded(&k, &receipt(&k), 4).await.unwrap();
            store.mark_pending(&key("g2"), Path::new("/data/y")).await.unwrap();
        }

        let reopened = UploadStateStore::open(&path, clock).await.unwrap();
        assert!(reopened.is_uploaded(&k).await);
        assert_eq!(reopened.get(&k).await.unwrap().record_count, 4);
        assert_eq!(reopened.counts().await.pending, 1);
        assert!(!dir.path().join("state.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_duplicate_records_rejected_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let record = UploadRecord::new(key("g1"), UploadStatus::Pending, PathBuf::from("/x"), Utc::now());
        let doc = serde_json::json!({ "version": 1, "records": [record, record] });
        std::fs::write(&path, serde_json::to_vec(&doc).unwrap()).unwrap();

        let err = UploadStateStore::open(&path, Arc::new(clock())).await.err().unwrap();
        assert!(matches!(err, StateError::DuplicateRecord(_)));
    }

    #[tokio::test]
    async fn test_failed_persist_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        // Parent directory does not exist, so every save fails
        let path = dir.path().join("missing").join("state.json");
        let store = UploadStateStore::open(&path, Arc::new(clock())).await.unwrap();

        let err = store.mark_pending(&key("g1"), Path::new("/x")).await.unwrap_err();
        assert!(matches!(err, StateError::Io { .. }));
        assert!(store.get(&key("g1")).await.is_none());
    }

    #[tokio::test]
    async fn test_recover_interrupted() {
        let clock = clock();
        let store = UploadStateStore::in_memory(Arc::new(clock.clone()));
        let stuck = key("stuck");
        let fresh = key("fresh");

        store.claim(&stuck, Path::new("/a")).await.unwrap();
        clock.advance(ChronoDuration::hours(3));
        store.claim(&fresh, Path::new("/b")).await.unwrap();

        let recovered = store.recover_interrupted(Duration::from_secs(2 * 3600)).await.unwrap();
        assert_eq!(recovered, vec![stuck.clone()]);

        let record = store.get(&stuck).await.unwrap();
        assert_eq!(record.status, UploadStatus::Failed);
        assert!(record.last_error.unwrap().contains("interrupted"));
        assert_eq!(store.get(&fresh).await.unwrap().status, UploadStatus::Uploading);
    }
}

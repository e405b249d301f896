//! Archive service: the entry points the command surface calls
//!
//! Wires the writer, upload state, object client, scheduler, sweeper and
//! export engine together from one [`ArchiveConfig`].

use crate::archive::clock::ArchiveClock;
use crate::archive::config::{ArchiveConfig, ConfigError, GroupFilter, StoreConfig};
use crate::archive::export::{ExportEngine, ExportError, ExportResult, MissingReason};
use crate::archive::layout::PartitionLayout;
use crate::archive::object_client::{ClientError, ObjectStoreClient, UploadReceipt};
use crate::archive::object_store::{InMemoryObjectStore, LocalFsObjectStore, ObjectStore, ObjectStoreError};
use crate::archive::partition_writer::{PartitionWriter, UpdateOutcome, WriterError, WriterStats};
use crate::archive::record::{ContentFilter, LogRecord, PartitionKey, RecordError};
use crate::archive::render::ExportFormat;
use crate::archive::retention::{RetentionSweeper, SweepReport};
use crate::archive::scheduler::{BatchSummary, SchedulerError, UploadScheduler};
use crate::archive::upload_state::{StateError, StatusCounts, UploadStateStore, UploadStatus};
use bytes::Bytes;
use chrono::{Duration as ChronoDuration, NaiveDate};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Writer(#[from] WriterError),
    #[error(transparent)]
    Record(#[from] RecordError),
    #[error(transparent)]
    Export(#[from] ExportError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("object store setup failed: {0}")]
    Store(#[from] ObjectStoreError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("partition {0} is already uploaded and can no longer be modified")]
    Sealed(PartitionKey),
}

/// A partition-date that is not safely in the object store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingPartition {
    pub date: NaiveDate,
    /// `None` when nothing at all is known for the date
    pub group: Option<String>,
    pub reason: MissingReason,
    /// A local copy still exists
    pub local_copy: bool,
}

/// Counters for the status command
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchiveStatus {
    pub uploads: StatusCounts,
    pub writer: WriterStats,
    pub local_partitions: usize,
    pub local_bytes: u64,
    pub oldest_local_date: Option<NaiveDate>,
    pub store_url: String,
}

/// Build the object store named by the config
pub fn build_store(config: &StoreConfig) -> Result<Arc<dyn ObjectStore>, ServiceError> {
    match config {
        StoreConfig::InMemory => Ok(Arc::new(InMemoryObjectStore::new())),
        StoreConfig::LocalFs { path } => Ok(Arc::new(LocalFsObjectStore::new(path.clone()))),
        #[cfg(feature = "s3")]
        StoreConfig::S3 { .. } => {
            use crate::archive::s3_store::{S3Config, S3ObjectStore};
            let s3 = S3Config::from_store_config(config)
                .ok_or_else(|| ObjectStoreError::Backend("not an s3 store config".to_string()))?;
            Ok(Arc::new(S3ObjectStore::new(s3)?))
        }
        #[cfg(not(feature = "s3"))]
        StoreConfig::S3 { .. } => Err(ServiceError::Store(ObjectStoreError::Backend(
            "built without the `s3` feature".to_string(),
        ))),
    }
}

pub struct ArchiveService {
    config: ArchiveConfig,
    clock: Arc<dyn ArchiveClock>,
    filter: GroupFilter,
    writer: PartitionWriter,
    state: Arc<UploadStateStore>,
    client: ObjectStoreClient,
    scheduler: Arc<UploadScheduler>,
    sweeper: Arc<RetentionSweeper>,
    export: ExportEngine,
}

impl ArchiveService {
    pub async fn open(
        config: ArchiveConfig,
        store: Arc<dyn ObjectStore>,
        clock: Arc<dyn ArchiveClock>,
    ) -> Result<Self, ServiceError> {
        config.validate()?;
        let layout = PartitionLayout::new(config.data_dir.clone());
        layout.ensure_root().await?;

        let state = Arc::new(UploadStateStore::open(config.state_path(), clock.clone()).await?);
        let writer = PartitionWriter::new(layout, config.writer.clone());
        let client = ObjectStoreClient::new(store, config.client.clone());
        let filter = config.group_filter();

        let scheduler = Arc::new(UploadScheduler::new(
            writer.clone(),
            state.clone(),
            client.clone(),
            clock.clone(),
            filter.clone(),
            config.scheduler.clone(),
        ));
        let sweeper = Arc::new(RetentionSweeper::new(writer.clone(), state.clone(), clock.clone()));
        let export = ExportEngine::new(
            writer.clone(),
            state.clone(),
            client.clone(),
            clock.clone(),
            config.scratch_dir(),
        );

        info!(
            data_dir = %config.data_dir.display(),
            store = %client.url_for(""),
            retention_days = config.retention_days,
            "archive service opened"
        );
        Ok(ArchiveService {
            config,
            clock,
            filter,
            writer,
            state,
            client,
            scheduler,
            sweeper,
            export,
        })
    }

    pub fn config(&self) -> &ArchiveConfig {
        &self.config
    }

    pub fn writer(&self) -> &PartitionWriter {
        &self.writer
    }

    pub fn state(&self) -> &Arc<UploadStateStore> {
        &self.state
    }

    pub fn client(&self) -> &ObjectStoreClient {
        &self.client
    }

    pub fn scheduler(&self) -> &Arc<UploadScheduler> {
        &self.scheduler
    }

    pub fn export_engine(&self) -> &ExportEngine {
        &self.export
    }

    /// Durably append one normalized record; returns its partition.
    ///
    /// A record for an already uploaded partition is still written locally
    /// (it is never dropped) but will not reach the object store.
    pub async fn ingest(&self, record: LogRecord) -> Result<PartitionKey, ServiceError> {
        let key = record.partition_key(self.clock.offset())?;
        if self.state.is_uploaded(&key).await {
            warn!(partition = %key, record_id = %record.id, "late record for an uploaded partition");
        }
        self.writer.append(&key, record).await?;
        Ok(key)
    }

    /// Replace a record in place (or append it) before its partition ships
    pub async fn update_record(&self, record: LogRecord) -> Result<UpdateOutcome, ServiceError> {
        let key = record.partition_key(self.clock.offset())?;
        self.ensure_unsealed(&key).await?;
        let id = record.id.clone();
        Ok(self.writer.update_record(&key, &id, record).await?)
    }

    /// Record where a media item ended up; only allowed before upload
    pub async fn backfill_media(
        &self,
        key: &PartitionKey,
        record_id: &str,
        original_url: &str,
        stored_url: &str,
    ) -> Result<UpdateOutcome, ServiceError> {
        self.ensure_unsealed(key).await?;
        Ok(self
            .writer
            .backfill_media(key, record_id, original_url, stored_url)
            .await?)
    }

    /// Upload one media item of a record and backfill its stored URL
    pub async fn archive_media(
        &self,
        key: &PartitionKey,
        record_id: &str,
        original_url: &str,
        index: usize,
        data: Bytes,
        content_type: Option<&str>,
    ) -> Result<UploadReceipt, ServiceError> {
        self.ensure_unsealed(key).await?;
        let receipt = self
            .client
            .upload_media(key, record_id, index, data, content_type)
            .await?;
        self.writer
            .backfill_media(key, record_id, original_url, &receipt.url)
            .await?;
        Ok(receipt)
    }

    pub async fn export(
        &self,
        group: Option<&str>,
        range: &str,
        formats: &[ExportFormat],
        filter: Option<ContentFilter>,
    ) -> Result<ExportResult, ServiceError> {
        Ok(self.export.export_range(group, range, formats, filter).await?)
    }

    /// Upload an export render under the `exports` kind
    pub async fn publish_export(&self, result: &ExportResult, format: ExportFormat) -> Result<UploadReceipt, ServiceError> {
        Ok(self.export.publish_report(result, format).await?)
    }

    /// Manually (re)run the upload of one date, optionally one group
    pub async fn retry_upload(&self, date: NaiveDate, group: Option<&str>) -> Result<BatchSummary, ServiceError> {
        info!(date = %date, group = group.unwrap_or("*"), "manual upload retry");
        Ok(self.scheduler.run_for_date(date, group).await?)
    }

    pub async fn run_daily_batch(&self) -> Result<Vec<BatchSummary>, ServiceError> {
        Ok(self.scheduler.run_daily_batch().await?)
    }

    pub async fn sweep(&self) -> Result<SweepReport, ServiceError> {
        Ok(self.sweeper.sweep(self.config.retention_days).await?)
    }

    /// Fail uploads left `uploading` by a crashed run so they are retried
    pub async fn recover_interrupted(&self) -> Result<Vec<PartitionKey>, ServiceError> {
        Ok(self
            .state
            .recover_interrupted(self.config.scheduler.stale_upload_after)
            .await?)
    }

    /// Partition-dates from `days_back` days ago through yesterday that are
    /// not uploaded, each with the reason read from the upload state.
    pub async fn check_missing(&self, days_back: u32) -> Result<Vec<MissingPartition>, ServiceError> {
        let yesterday = self.clock.yesterday();
        let from = self.clock.today() - ChronoDuration::days(i64::from(days_back.max(1)));

        let mut missing = Vec::new();
        for date in from.iter_days().take_while(|d| *d <= yesterday) {
            // group -> (local copy, recorded status)
            let mut groups: BTreeMap<String, (bool, Option<(UploadStatus, Option<String>)>)> = BTreeMap::new();
            for partition in self.writer.layout().scan_date(date).await? {
                groups.entry(partition.key.group).or_default().0 = true;
            }
            for record in self.state.records_between(date, date).await {
                groups.entry(record.key.group).or_default().1 = Some((record.status, record.last_error));
            }

            if groups.is_empty() {
                missing.push(MissingPartition {
                    date,
                    group: None,
                    reason: MissingReason::NoData,
                    local_copy: false,
                });
                continue;
            }

            for (group, (local_copy, recorded)) in groups {
                if !self.filter.allows(&group) {
                    continue;
                }
                let reason = match recorded {
                    Some((UploadStatus::Uploaded, _)) => continue,
                    Some((UploadStatus::Failed, error)) => MissingReason::UploadFailed(error.unwrap_or_default()),
                    Some((status, _)) => MissingReason::NotUploaded(status),
                    None => MissingReason::NotUploaded(UploadStatus::Pending),
                };
                missing.push(MissingPartition {
                    date,
                    group: Some(group),
                    reason,
                    local_copy,
                });
            }
        }
        Ok(missing)
    }

    pub async fn status(&self) -> Result<ArchiveStatus, ServiceError> {
        let local = self.writer.layout().scan().await?;
        Ok(ArchiveStatus {
            uploads: self.state.counts().await,
            writer: self.writer.stats(),
            local_partitions: local.len(),
            local_bytes: local.iter().map(|p| p.size_bytes).sum(),
            oldest_local_date: local.iter().map(|p| p.key.date).min(),
            store_url: self.client.url_for(""),
        })
    }

    /// Start the daily upload, state recovery and retention timers
    pub fn spawn_background(&self, token: CancellationToken) -> Result<Vec<JoinHandle<()>>, ServiceError> {
        let upload_time = self.config.upload_time()?;
        Ok(self.scheduler.clone().spawn_workers(
            self.sweeper.clone(),
            self.config.retention_days,
            upload_time,
            token,
        ))
    }

    /// Drain every partition queue; no writes are accepted afterwards
    pub async fn shutdown(&self) {
        self.writer.shutdown().await;
        info!("archive service shut down");
    }

    async fn ensure_unsealed(&self, key: &PartitionKey) -> Result<(), ServiceError> {
        if self.state.is_uploaded(key).await {
            return Err(ServiceError::Sealed(key.clone()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::clock::ManualClock;
    use crate::archive::record::{Author, ContentKind, MediaKind, MediaRef};
    use std::path::Path;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn record(id: &str, group: &str, day: u32) -> LogRecord {
        let ts = date(2024, 1, day).and_hms_opt(10, 0, 0).unwrap().and_utc();
        LogRecord {
            id: id.to_string(),
            group_id: Some(group.to_string()),
            author: Author {
                id: "u1".to_string(),
                name: "alice".to_string(),
            },
            timestamp_ms: ts.timestamp_millis(),
            content: ContentKind::Text,
            body: "hi".to_string(),
            media: Vec::new(),
        }
    }

    async fn open(root: &Path) -> ArchiveService {
        let clock: Arc<dyn ArchiveClock> = Arc::new(ManualClock::at_noon(date(2024, 1, 4)));
        let config = ArchiveConfig::test(root);
        let store = build_store(&config.store).unwrap();
        ArchiveService::open(config, store, clock).await.unwrap()
    }

    #[tokio::test]
    async fn test_ingest_upload_then_sealed() {
        let dir = tempfile::tempdir().unwrap();
        let service = open(dir.path()).await;
        let key = service.ingest(record("a", "g1", 3)).await.unwrap();
        assert_eq!(key, PartitionKey::new(Some("g1"), date(2024, 1, 3)));

        let summary = service.retry_upload(date(2024, 1, 3), Some("g1")).await.unwrap();
        assert_eq!(summary.uploaded, 1);

        let err = service.update_record(record("a", "g1", 3)).await.unwrap_err();
        assert!(matches!(err, ServiceError::Sealed(_)));
        // Late appends still land locally
        service.ingest(record("late", "g1", 3)).await.unwrap();
        let parsed = service.writer().read_all(&key).await.unwrap();
        assert_eq!(parsed.records.len(), 2);
    }

    #[tokio::test]
    async fn test_check_missing_explains_reasons() {
        let dir = tempfile::tempdir().unwrap();
        let service = open(dir.path()).await;
        service.ingest(record("a", "g1", 3)).await.unwrap();
        service.ingest(record("b", "g2", 2)).await.unwrap();
        service.retry_upload(date(2024, 1, 2), None).await.unwrap();

        let missing = service.check_missing(3).await.unwrap();
        assert_eq!(
            missing,
            vec![
                MissingPartition {
                    date: date(2024, 1, 1),
                    group: None,
                    reason: MissingReason::NoData,
                    local_copy: false,
                },
                MissingPartition {
                    date: date(2024, 1, 3),
                    group: Some("g1".to_string()),
                    reason: MissingReason::NotUploaded(UploadStatus::Pending),
                    local_copy: true,
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_archive_media_backfills_url() {
        let dir = tempfile::tempdir().unwrap();
        let service = open(dir.path()).await;
        let mut rec = record("m1", "g1", 3);
        rec.content = ContentKind::Media;
        rec.media.push(MediaRef {
            kind: MediaKind::Image,
            original_url: "https://cdn/x.png".to_string(),
            stored_url: None,
        });
        let key = service.ingest(rec).await.unwrap();

        let png = Bytes::from_static(b"\x89PNG\r\n\x1a\n0000");
        let receipt = service
            .archive_media(&key, "m1", "https://cdn/x.png", 0, png, None)
            .await
            .unwrap();
        assert_eq!(receipt.content_type, "image/png");

        let parsed = service.writer().read_all(&key).await.unwrap();
        assert_eq!(parsed.records[0].media[0].stored_url.as_deref(), Some(receipt.url.as_str()));
    }

    #[tokio::test]
    async fn test_status_counts() {
        let dir = tempfile::tempdir().unwrap();
        let service = open(dir.path()).await;
        service.ingest(record("a", "g1", 2)).await.unwrap();
        service.ingest(record("b", "g2", 3)).await.unwrap();
        service.retry_upload(date(2024, 1, 2), None).await.unwrap();

        let status = service.status().await.unwrap();
        assert_eq!(status.uploads.uploaded, 1);
        assert_eq!(status.local_partitions, 2);
        assert_eq!(status.oldest_local_date, Some(date(2024, 1, 2)));
        assert_eq!(status.writer.appends, 2);
    }
}

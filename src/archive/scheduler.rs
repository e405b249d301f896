//! Upload Scheduler
//!
//! Ships closed partitions (yesterday or earlier) to the object store and
//! keeps the background timers: the daily batch, stale-claim recovery and
//! the retention sweep.
//!
//! Per partition a run drives:
//!
//! ```text
//! drain writer queue ─► claim (pending/failed ─► uploading) ─► upload file
//!                                                            │
//!                                  mark uploaded ◄── ok ─────┤
//!                                  mark failed   ◄── err ────┘
//! ```
//!
//! Partitions of one run upload concurrently; an error in one never stops
//! the others and shows up in the [`BatchSummary`].

use crate::archive::clock::ArchiveClock;
use crate::archive::config::{GroupFilter, SchedulerConfig};
use crate::archive::keys::StoredObjectKey;
use crate::archive::layout::LocalPartition;
use crate::archive::object_client::ObjectStoreClient;
use crate::archive::partition_writer::PartitionWriter;
use crate::archive::record::PartitionKey;
use crate::archive::retention::RetentionSweeper;
use crate::archive::upload_state::{ClaimOutcome, UploadStateStore};
use chrono::{DateTime, Duration as ChronoDuration, FixedOffset, NaiveDate, NaiveTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("partition date {date} is not closed yet (today is {today})")]
    DateNotClosed { date: NaiveDate, today: NaiveDate },
    #[error("failed to scan local partitions: {0}")]
    Scan(#[from] std::io::Error),
}

/// Aggregated result of one upload run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub date: NaiveDate,
    pub attempted: usize,
    pub uploaded: usize,
    /// Already uploaded or claimed by a concurrent run
    pub skipped: usize,
    pub failed: usize,
    pub failures: Vec<(PartitionKey, String)>,
}

impl BatchSummary {
    fn new(date: NaiveDate) -> Self {
        BatchSummary {
            date,
            attempted: 0,
            uploaded: 0,
            skipped: 0,
            failed: 0,
            failures: Vec::new(),
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failed == 0
    }
}

enum PartitionOutcome {
    Uploaded,
    Skipped,
    Failed(PartitionKey, String),
}

pub struct UploadScheduler {
    writer: PartitionWriter,
    state: Arc<UploadStateStore>,
    client: ObjectStoreClient,
    clock: Arc<dyn ArchiveClock>,
    filter: GroupFilter,
    config: SchedulerConfig,
}

impl UploadScheduler {
    pub fn new(
        writer: PartitionWriter,
        state: Arc<UploadStateStore>,
        client: ObjectStoreClient,
        clock: Arc<dyn ArchiveClock>,
        filter: GroupFilter,
        config: SchedulerConfig,
    ) -> Self {
        UploadScheduler {
            writer,
            state,
            client,
            clock,
            filter,
            config,
        }
    }

    /// Upload yesterday's partitions, then retry anything pending or failed
    /// within the lookback window.
    pub async fn run_daily_batch(&self) -> Result<Vec<BatchSummary>, SchedulerError> {
        let yesterday = self.clock.yesterday();
        let mut summaries = vec![self.run_for_date(yesterday, None).await?];

        for back in 1..=i64::from(self.config.retry_lookback_days) {
            let date = yesterday - ChronoDuration::days(back);
            if self.state.pending_or_failed_for_date(date).await.is_empty() {
                continue;
            }
            info!(date = %date, "retrying unfinished uploads");
            summaries.push(self.run_for_date(date, None).await?);
        }
        Ok(summaries)
    }

    /// Upload every local partition of `date`, optionally only `group`.
    pub async fn run_for_date(&self, date: NaiveDate, group: Option<&str>) -> Result<BatchSummary, SchedulerError> {
        let today = self.clock.today();
        if date >= today {
            return Err(SchedulerError::DateNotClosed { date, today });
        }
        let wanted = group.map(|g| PartitionKey::new(Some(g), date).group);

        let mut partitions = Vec::new();
        let mut outcomes = Vec::new();
        for partition in self.writer.layout().scan_date(date).await? {
            if let Some(wanted) = &wanted {
                if &partition.key.group != wanted {
                    continue;
                }
            }
            if !self.filter.allows(&partition.key.group) {
                debug!(partition = %partition.key, "partition excluded by group filter");
                continue;
            }
            if let Err(e) = self.state.mark_pending(&partition.key, &partition.path).await {
                error!(partition = %partition.key, error = %e, "failed to record pending upload");
                outcomes.push(PartitionOutcome::Failed(partition.key, e.to_string()));
                continue;
            }
            partitions.push(partition);
        }

        let mut summary = BatchSummary::new(date);
        summary.attempted = partitions.len() + outcomes.len();
        let uploads: Vec<PartitionOutcome> = stream::iter(partitions)
            .map(|partition| self.upload_partition(partition))
            .buffer_unordered(self.config.max_concurrent_uploads.max(1))
            .collect()
            .await;
        outcomes.extend(uploads);

        for outcome in outcomes {
            match outcome {
                PartitionOutcome::Uploaded => summary.uploaded += 1,
                PartitionOutcome::Skipped => summary.skipped += 1,
                PartitionOutcome::Failed(key, error) => {
                    summary.failed += 1;
                    summary.failures.push((key, error));
                }
            }
        }
        summary.failures.sort();

        info!(
            date = %date,
            attempted = summary.attempted,
            uploaded = summary.uploaded,
            skipped = summary.skipped,
            failed = summary.failed,
            "upload run finished"
        );
        Ok(summary)
    }

    async fn upload_partition(&self, partition: LocalPartition) -> PartitionOutcome {
        let key = partition.key;
        self.writer.drain(&key).await;

        match self.state.claim(&key, &partition.path).await {
            Ok(ClaimOutcome::Claimed(record)) => {
                debug!(partition = %key, attempt = record.attempts, "uploading partition");
            }
            Ok(ClaimOutcome::AlreadyUploaded(_)) => return PartitionOutcome::Skipped,
            Ok(ClaimOutcome::InProgress(_)) => {
                debug!(partition = %key, "upload already in progress");
                return PartitionOutcome::Skipped;
            }
            Err(e) => {
                error!(partition = %key, error = %e, "failed to claim upload");
                return PartitionOutcome::Failed(key, e.to_string());
            }
        }

        let result = async {
            let parsed = self.writer.read_all(&key).await.map_err(|e| e.to_string())?;
            let remote_key = StoredObjectKey::for_partition_log(&key).to_string();
            let receipt = self
                .client
                .upload_file(&partition.path, &remote_key)
                .await
                .map_err(|e| e.to_string())?;
            Ok::<_, String>((receipt, parsed.records.len() as u64))
        }
        .await;

        match result {
            Ok((receipt, record_count)) => match self.state.mark_uploaded(&key, &receipt, record_count).await {
                Ok(_) => {
                    info!(partition = %key, url = %receipt.url, bytes = receipt.size_bytes, records = record_count, "partition uploaded");
                    PartitionOutcome::Uploaded
                }
                Err(e) => {
                    error!(partition = %key, error = %e, "upload succeeded but state was not saved");
                    PartitionOutcome::Failed(key, e.to_string())
                }
            },
            Err(message) => {
                warn!(partition = %key, error = %message, "partition upload failed");
                if let Err(e) = self.state.mark_failed(&key, &message).await {
                    error!(partition = %key, error = %e, "failed to record upload failure");
                }
                PartitionOutcome::Failed(key, message)
            }
        }
    }

    /// Start the background timers. Each stops when `token` is cancelled;
    /// a run already underway finishes first.
    pub fn spawn_workers(
        self: Arc<Self>,
        sweeper: Arc<RetentionSweeper>,
        retention_days: u32,
        upload_time: NaiveTime,
        token: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        let daily = {
            let scheduler = self.clone();
            let token = token.clone();
            tokio::spawn(async move {
                loop {
                    let delay = next_run_delay(scheduler.clock.now(), upload_time, scheduler.clock.offset());
                    debug!(delay_secs = delay.as_secs(), "next daily upload scheduled");
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    if let Err(e) = scheduler.run_daily_batch().await {
                        error!(error = %e, "daily upload batch failed");
                    }
                }
                debug!("daily upload worker stopped");
            })
        };

        let recovery = {
            let scheduler = self.clone();
            let token = token.clone();
            tokio::spawn(async move {
                let mut tick = interval(scheduler.config.state_recovery_interval);
                tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tick.tick() => {}
                    }
                    match scheduler.state.recover_interrupted(scheduler.config.stale_upload_after).await {
                        Ok(recovered) if !recovered.is_empty() => {
                            warn!(count = recovered.len(), "recovered interrupted uploads");
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "upload state recovery failed"),
                    }
                }
                debug!("state recovery worker stopped");
            })
        };

        let sweep = {
            let sweep_interval = self.config.sweep_interval;
            tokio::spawn(async move {
                let mut tick = interval(sweep_interval);
                tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tick.tick() => {}
                    }
                    if let Err(e) = sweeper.sweep(retention_days).await {
                        error!(error = %e, "retention sweep failed");
                    }
                }
                debug!("retention worker stopped");
            })
        };

        vec![daily, recovery, sweep]
    }
}

/// Time from `now` until the next `upload_time` in `offset`
pub fn next_run_delay(now: DateTime<Utc>, upload_time: NaiveTime, offset: FixedOffset) -> Duration {
    let local = now.with_timezone(&offset).naive_local();
    let mut target = local.date().and_time(upload_time);
    if target <= local {
        target += ChronoDuration::days(1);
    }
    (target - local).to_std().unwrap_or(Duration::ZERO)
}

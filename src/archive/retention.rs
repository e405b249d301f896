//! Retention Sweeper
//!
//! Deletes local partition files once they are both uploaded and older than
//! the retention window. A file that is not `uploaded` is never deleted,
//! whatever its age, and neither is one that grew after its upload (late
//! appends that exist nowhere else). Today's partitions are never touched.
//!
//! Deletions go through the partition's writer queue, which rechecks the
//! size right before unlinking, so an append acknowledged during the sweep
//! keeps its file.

use crate::archive::clock::ArchiveClock;
use crate::archive::partition_writer::{PartitionWriter, RemoveOutcome};
use crate::archive::record::PartitionKey;
use crate::archive::upload_state::{UploadStateStore, UploadStatus};
use chrono::Duration as ChronoDuration;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Outcome of one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: usize,
    pub deleted: Vec<PartitionKey>,
    pub kept_not_uploaded: usize,
    pub kept_recent: usize,
    /// Uploaded, but the local file no longer matches the uploaded size
    pub kept_diverged: usize,
    pub failures: Vec<(PartitionKey, String)>,
}

pub struct RetentionSweeper {
    writer: PartitionWriter,
    state: Arc<UploadStateStore>,
    clock: Arc<dyn ArchiveClock>,
}

impl RetentionSweeper {
    pub fn new(writer: PartitionWriter, state: Arc<UploadStateStore>, clock: Arc<dyn ArchiveClock>) -> Self {
        RetentionSweeper { writer, state, clock }
    }

    /// Delete uploaded partition files last modified more than
    /// `retention_days` ago. A failed deletion is logged and the sweep
    /// continues; only a failed directory scan aborts it.
    pub async fn sweep(&self, retention_days: u32) -> std::io::Result<SweepReport> {
        let now = self.clock.now();
        let today = self.clock.today();
        let cutoff = now - ChronoDuration::days(i64::from(retention_days));

        let mut report = SweepReport::default();
        for partition in self.writer.layout().scan().await? {
            if partition.key.date >= today {
                continue;
            }
            report.scanned += 1;

            let record = match self.state.get(&partition.key).await {
                Some(record) if record.status == UploadStatus::Uploaded => record,
                _ => {
                    report.kept_not_uploaded += 1;
                    continue;
                }
            };
            if partition.modified > cutoff {
                report.kept_recent += 1;
                continue;
            }
            if partition.size_bytes != record.size_bytes {
                warn!(
                    partition = %partition.key,
                    local_bytes = partition.size_bytes,
                    uploaded_bytes = record.size_bytes,
                    "local partition changed after upload, keeping it"
                );
                report.kept_diverged += 1;
                continue;
            }

            match self.writer.remove_if_unchanged(&partition.key, record.size_bytes).await {
                Ok(RemoveOutcome::Removed) => {
                    debug!(partition = %partition.key, "deleted uploaded partition file");
                    report.deleted.push(partition.key);
                }
                Ok(RemoveOutcome::Missing) => {
                    report.deleted.push(partition.key);
                }
                Ok(RemoveOutcome::Changed { size_bytes }) => {
                    warn!(
                        partition = %partition.key,
                        local_bytes = size_bytes,
                        uploaded_bytes = record.size_bytes,
                        "partition grew during sweep, keeping it"
                    );
                    report.kept_diverged += 1;
                }
                Err(e) => {
                    error!(partition = %partition.key, error = %e, "failed to delete partition file");
                    report.failures.push((partition.key, e.to_string()));
                }
            }
        }

        info!(
            scanned = report.scanned,
            deleted = report.deleted.len(),
            kept_not_uploaded = report.kept_not_uploaded,
            kept_recent = report.kept_recent,
            kept_diverged = report.kept_diverged,
            failures = report.failures.len(),
            "retention sweep finished"
        );
        Ok(report)
    }
}

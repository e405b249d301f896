//! Export Engine
//!
//! Serves historical range queries for one group by merging local partition
//! files with uploaded copies, and refuses to answer when any day of the
//! range is unavailable.
//!
//! ## Flow
//!
//! ```text
//! range ──► dates ──► locate each date ──► any missing? ──► Incomplete (no records)
//!                        │
//!                        ├─ local file      (preferred, writer queue drained first)
//!                        ├─ remote object   (downloaded once into a scratch dir)
//!                        └─ both            (uploaded, local file changed since:
//!                                            merged by record id, local wins)
//!                                  │
//!                                  ▼
//!              parse ──► filter ──► stable sort by timestamp ──► render
//! ```

use crate::archive::clock::ArchiveClock;
use crate::archive::keys::{ObjectKind, StoredObjectKey};
use crate::archive::layout::PartitionLayout;
use crate::archive::object_client::{ClientError, ObjectStoreClient, UploadReceipt};
use crate::archive::partition_writer::PartitionWriter;
use crate::archive::range::{RangeError, RangeSpec};
use crate::archive::record::{parse_lines, ContentFilter, LogRecord, ParsedLines, PartitionKey};
use crate::archive::render::{render, ExportFormat, RenderedExport};
use crate::archive::upload_state::{UploadStateStore, UploadStatus};
use bytes::Bytes;
use chrono::NaiveDate;
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error(transparent)]
    Range(#[from] RangeError),
    #[error("incomplete data for {group}: {}", describe_missing(.missing))]
    Incomplete {
        group: String,
        missing: Vec<MissingDate>,
    },
    #[error("no records of {group} match the filter ({records_before_filter} records in range)")]
    NoMatchingRecords {
        group: String,
        records_before_filter: usize,
    },
    #[error("failed to download {date}: {source}")]
    Download { date: NaiveDate, source: ClientError },
    #[error("failed to check remote copy of {date}: {source}")]
    Lookup { date: NaiveDate, source: ClientError },
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to render export: {0}")]
    Render(#[from] serde_json::Error),
    #[error("failed to publish export report: {0}")]
    Publish(ClientError),
}

fn describe_missing(missing: &[MissingDate]) -> String {
    missing
        .iter()
        .map(|m| format!("{} ({})", m.date, m.reason))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Why a date cannot be served
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MissingReason {
    /// No local file and nothing was ever recorded for the date
    NoData,
    /// Recorded but not shipped yet (and the local file is gone)
    NotUploaded(UploadStatus),
    /// The last upload attempt failed
    UploadFailed(String),
}

impl fmt::Display for MissingReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MissingReason::NoData => f.write_str("no data that day"),
            MissingReason::NotUploaded(status) => write!(f, "never uploaded (status {})", status),
            MissingReason::UploadFailed(error) => write!(f, "upload failed: {}", error),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingDate {
    pub date: NaiveDate,
    pub reason: MissingReason,
}

/// Where one partition-date can be read from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Availability {
    Local(PathBuf),
    Remote(String),
    /// Uploaded, but the local file no longer matches what was shipped
    /// (late records, possibly written after the original was swept)
    Merged { local: PathBuf, remote: String },
    Missing(MissingReason),
}

/// A completed export
#[derive(Debug, Clone)]
pub struct ExportResult {
    pub group: String,
    pub dates: Vec<NaiveDate>,
    pub records: Vec<LogRecord>,
    pub record_count: usize,
    /// Malformed lines skipped while reading
    pub skipped_lines: usize,
    pub local_files: usize,
    pub remote_files: usize,
    pub renders: Vec<RenderedExport>,
}

impl ExportResult {
    pub fn rendered(&self, format: ExportFormat) -> Option<&RenderedExport> {
        self.renders.iter().find(|r| r.format == format)
    }
}

pub struct ExportEngine {
    layout: PartitionLayout,
    writer: PartitionWriter,
    state: Arc<UploadStateStore>,
    client: ObjectStoreClient,
    clock: Arc<dyn ArchiveClock>,
    scratch_dir: PathBuf,
}

impl ExportEngine {
    pub fn new(
        writer: PartitionWriter,
        state: Arc<UploadStateStore>,
        client: ObjectStoreClient,
        clock: Arc<dyn ArchiveClock>,
        scratch_dir: PathBuf,
    ) -> Self {
        ExportEngine {
            layout: writer.layout().clone(),
            writer,
            state,
            client,
            clock,
            scratch_dir,
        }
    }

    /// Expand a range relative to today in the archive's offset
    pub fn resolve_range(&self, input: &str) -> Result<Vec<NaiveDate>, RangeError> {
        let today = self.clock.today();
        RangeSpec::parse(input, today)?.dates(today)
    }

    /// Find the source for one partition-date. A local file wins over a
    /// remote copy unless it diverged from what was uploaded; the remote side
    /// is consulted through the upload state first and the object listing
    /// second.
    pub async fn locate(&self, key: &PartitionKey) -> Result<Availability, ExportError> {
        let local = self.layout.path_for(key);
        let local_size = match tokio::fs::metadata(&local).await {
            Ok(meta) if meta.is_file() => Some(meta.len()),
            Ok(_) => None,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(source) => return Err(ExportError::Io { path: local, source }),
        };

        let record = self.state.get(key).await;
        let uploaded = record.as_ref().filter(|r| r.status == UploadStatus::Uploaded);
        if let Some(uploaded) = uploaded {
            let remote = uploaded
                .remote_key
                .clone()
                .unwrap_or_else(|| StoredObjectKey::for_partition_log(key).to_string());
            return Ok(match local_size {
                Some(size) if size == uploaded.size_bytes => Availability::Local(local),
                Some(size) => {
                    debug!(partition = %key, local_bytes = size, uploaded_bytes = uploaded.size_bytes, "local partition diverged from upload");
                    Availability::Merged { local, remote }
                }
                None => Availability::Remote(remote),
            });
        }
        if local_size.is_some() {
            return Ok(Availability::Local(local));
        }

        let derived = StoredObjectKey::for_partition_log(key).to_string();
        let listed = self
            .client
            .list_keys(&StoredObjectKey::prefix(ObjectKind::Logs, key))
            .await
            .map_err(|source| ExportError::Lookup {
                date: key.date,
                source,
            })?;
        if listed.contains(&derived) {
            return Ok(Availability::Remote(derived));
        }

        let reason = match record {
            None => MissingReason::NoData,
            Some(r) if r.status == UploadStatus::Failed => {
                MissingReason::UploadFailed(r.last_error.unwrap_or_default())
            }
            Some(r) => MissingReason::NotUploaded(r.status),
        };
        Ok(Availability::Missing(reason))
    }

    /// Export every record of `group` in `range`.
    ///
    /// Fails with [`ExportError::Incomplete`] when any date has neither a
    /// local nor a remote copy, and with [`ExportError::NoMatchingRecords`]
    /// when all dates exist but nothing survives the filter.
    pub async fn export_range(
        &self,
        group: Option<&str>,
        range: &str,
        formats: &[ExportFormat],
        filter: Option<ContentFilter>,
    ) -> Result<ExportResult, ExportError> {
        let dates = self.resolve_range(range)?;
        let keys: Vec<PartitionKey> = dates.iter().map(|d| PartitionKey::new(group, *d)).collect();
        let group = keys
            .first()
            .map(|k| k.group.clone())
            .unwrap_or_default();

        let mut sources = Vec::with_capacity(keys.len());
        let mut missing = Vec::new();
        for key in &keys {
            self.writer.drain(key).await;
            match self.locate(key).await? {
                Availability::Missing(reason) => missing.push(MissingDate {
                    date: key.date,
                    reason,
                }),
                found => sources.push((key, found)),
            }
        }
        if !missing.is_empty() {
            warn!(group = %group, range, missing = missing.len(), "export rejected, incomplete range");
            return Err(ExportError::Incomplete { group, missing });
        }

        let scratch = self.scratch().await?;
        let mut records = Vec::new();
        let (mut local_files, mut remote_files, mut skipped_lines) = (0, 0, 0);
        for (key, source) in sources {
            match source {
                Availability::Local(path) => {
                    local_files += 1;
                    let parsed = read_partition(&path).await?;
                    skipped_lines += parsed.skipped;
                    records.extend(parsed.records);
                }
                Availability::Remote(remote_key) => {
                    remote_files += 1;
                    let path = self.download(key, &remote_key, scratch.path()).await?;
                    let parsed = read_partition(&path).await?;
                    skipped_lines += parsed.skipped;
                    records.extend(parsed.records);
                }
                Availability::Merged { local, remote } => {
                    local_files += 1;
                    remote_files += 1;
                    let path = self.download(key, &remote, scratch.path()).await?;
                    let shipped = read_partition(&path).await?;
                    let late = read_partition(&local).await?;
                    skipped_lines += shipped.skipped + late.skipped;
                    let late_ids: HashSet<&str> = late.records.iter().map(|r| r.id.as_str()).collect();
                    records.extend(
                        shipped
                            .records
                            .into_iter()
                            .filter(|r| !late_ids.contains(r.id.as_str())),
                    );
                    records.extend(late.records);
                }
                Availability::Missing(_) => {}
            }
        }
        drop(scratch);

        let records_before_filter = records.len();
        if let Some(filter) = filter {
            records.retain(|r| filter.matches(r.content));
        }
        if records.is_empty() {
            return Err(ExportError::NoMatchingRecords {
                group,
                records_before_filter,
            });
        }
        records.sort_by_key(|r| r.timestamp_ms);

        let offset = self.clock.offset();
        let renders = formats
            .iter()
            .map(|format| render(&records, *format, offset))
            .collect::<Result<Vec<_>, _>>()?;

        info!(
            group = %group,
            range,
            records = records.len(),
            local_files,
            remote_files,
            skipped_lines,
            "export finished"
        );
        Ok(ExportResult {
            group,
            dates,
            record_count: records.len(),
            records,
            skipped_lines,
            local_files,
            remote_files,
            renders,
        })
    }

    /// Upload one rendered form of an export under the `exports` kind
    pub async fn publish_report(
        &self,
        result: &ExportResult,
        format: ExportFormat,
    ) -> Result<UploadReceipt, ExportError> {
        let rendered = result.rendered(format).ok_or_else(|| {
            ExportError::Publish(ClientError::LocalIo {
                path: PathBuf::from(format.extension()),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "format was not rendered"),
            })
        })?;
        let date = result.dates.last().copied().unwrap_or_else(|| self.clock.today());
        let key = PartitionKey::new(Some(&result.group), date);
        self.client
            .upload_report(
                &key,
                format,
                Bytes::from(rendered.body.clone()),
                self.clock.now().timestamp_millis(),
            )
            .await
            .map_err(ExportError::Publish)
    }

    async fn download(&self, key: &PartitionKey, remote_key: &str, scratch: &Path) -> Result<PathBuf, ExportError> {
        let target = scratch.join(key.file_name());
        self.client
            .download_to_file(remote_key, &target)
            .await
            .map_err(|source| ExportError::Download {
                date: key.date,
                source,
            })?;
        Ok(target)
    }

    async fn scratch(&self) -> Result<tempfile::TempDir, ExportError> {
        let io_err = |path: &Path, source| ExportError::Io {
            path: path.to_path_buf(),
            source,
        };
        tokio::fs::create_dir_all(&self.scratch_dir)
            .await
            .map_err(|e| io_err(&self.scratch_dir, e))?;
        let dir = tempfile::Builder::new()
            .prefix("chatlog-export-")
            .tempdir_in(&self.scratch_dir)
            .map_err(|e| io_err(&self.scratch_dir, e))?;
        debug!(path = %dir.path().display(), "export scratch dir created");
        Ok(dir)
    }
}

async fn read_partition(path: &Path) -> Result<ParsedLines, ExportError> {
    let contents = tokio::fs::read(path).await.map_err(|source| ExportError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(parse_lines(&contents, &path.display().to_string()))
}

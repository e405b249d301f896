//! Partition Writer - Per-Partition Serialized Writes
//!
//! Every [`PartitionKey`] owns one FIFO queue served by its own tokio task.
//! Operations for the same key run strictly in submission order; different
//! keys proceed concurrently. Callers get an ack only after the operation is
//! on disk.
//!
//! ## Architecture
//!
//! ```text
//! append(g1) ──┐                 ┌──► queue g1 ──► open/append/fsync ──► ack
//! update(g1) ──┤──► Registry ────┤
//! append(g2) ──┘                 └──► queue g2 ──► read/rewrite/rename ──► ack
//! ```
//!
//! Queues are spawned lazily on first use and reap themselves after
//! `idle_timeout` without work. Submission and reaping both happen under the
//! registry lock, and a queue only reaps after `try_recv` confirms it is
//! empty, so a submitted operation is never lost to a reap.

use crate::archive::config::WriterConfig;
use crate::archive::layout::PartitionLayout;
use crate::archive::record::{
    parse_lines, probe_record_id, split_lines, LogRecord, ParsedLines, PartitionKey, RecordError,
};
use chrono::FixedOffset;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum WriterError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error(transparent)]
    Encode(#[from] RecordError),
    #[error("partition writer is closed")]
    Closed,
    #[error("partition queue for {0} stopped before acknowledging")]
    Unavailable(PartitionKey),
}

impl WriterError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        WriterError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// What an in-place rewrite did to the file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The first line with the record id was replaced
    Replaced,
    /// No line had the record id; the record was appended
    Appended,
    /// Nothing needed to change
    Unchanged,
}

/// What a conditional removal found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    Removed,
    /// The file was already gone
    Missing,
    /// The file no longer has the expected size; it was kept
    Changed { size_bytes: u64 },
}

/// Snapshot of writer counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct WriterStats {
    pub appends: u64,
    pub updates: u64,
    pub failures: u64,
    pub active_queues: usize,
}

#[derive(Default)]
struct Counters {
    appends: AtomicU64,
    updates: AtomicU64,
    failures: AtomicU64,
}

type Ack<T> = oneshot::Sender<Result<T, WriterError>>;

/// Operations accepted by a partition queue
enum WriteOp {
    Append {
        record: Box<LogRecord>,
        ack_tx: Ack<()>,
    },
    Update {
        record_id: String,
        record: Box<LogRecord>,
        ack_tx: Ack<UpdateOutcome>,
    },
    BackfillMedia {
        record_id: String,
        original_url: String,
        stored_url: String,
        ack_tx: Ack<UpdateOutcome>,
    },
    RemoveIfUnchanged {
        expected_size: u64,
        ack_tx: Ack<RemoveOutcome>,
    },
    /// Resolves once every earlier operation on the queue has finished
    Barrier { ack_tx: oneshot::Sender<()> },
}

struct QueueSlot {
    tx: mpsc::UnboundedSender<WriteOp>,
    generation: u64,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Registry {
    queues: HashMap<PartitionKey, QueueSlot>,
    closed: bool,
    next_generation: u64,
}

/// Task owning one partition file
struct PartitionQueue {
    key: PartitionKey,
    path: PathBuf,
    generation: u64,
    rx: mpsc::UnboundedReceiver<WriteOp>,
    registry: Arc<Mutex<Registry>>,
    counters: Arc<Counters>,
    idle_timeout: Duration,
    /// Whether the file is known to end on a line boundary
    boundary_checked: bool,
}

impl PartitionQueue {
    async fn run(mut self) {
        debug!(partition = %self.key, "partition queue started");
        loop {
            let op = match tokio::time::timeout(self.idle_timeout, self.rx.recv()).await {
                Ok(Some(op)) => op,
                // All senders gone: shutdown took the slot
                Ok(None) => break,
                Err(_) => match self.try_reap() {
                    Some(op) => op,
                    None => {
                        debug!(partition = %self.key, "partition queue idle, reaped");
                        return;
                    }
                },
            };
            self.handle(op).await;
        }
        debug!(partition = %self.key, "partition queue stopped");
    }

    /// Remove this queue from the registry unless work arrived meanwhile.
    fn try_reap(&mut self) -> Option<WriteOp> {
        let mut registry = self.registry.lock();
        match self.rx.try_recv() {
            Ok(op) => Some(op),
            Err(_) => {
                let ours = registry
                    .queues
                    .get(&self.key)
                    .is_some_and(|slot| slot.generation == self.generation);
                if ours {
                    registry.queues.remove(&self.key);
                }
                None
            }
        }
    }

    async fn handle(&mut self, op: WriteOp) {
        match op {
            WriteOp::Append { record, ack_tx } => {
                let result = self.append(&record).await;
                self.count(&result, &self.counters.appends);
                let _ = ack_tx.send(result);
            }
            WriteOp::Update {
                record_id,
                record,
                ack_tx,
            } => {
                let result = self.update(&record_id, &record).await;
                self.count(&result, &self.counters.updates);
                let _ = ack_tx.send(result);
            }
            WriteOp::BackfillMedia {
                record_id,
                original_url,
                stored_url,
                ack_tx,
            } => {
                let result = self
                    .backfill(&record_id, &original_url, &stored_url)
                    .await;
                self.count(&result, &self.counters.updates);
                let _ = ack_tx.send(result);
            }
            WriteOp::RemoveIfUnchanged { expected_size, ack_tx } => {
                let result = self.remove_if_unchanged(expected_size).await;
                if let Err(e) = &result {
                    self.counters.failures.fetch_add(1, Ordering::Relaxed);
                    error!(partition = %self.key, error = %e, "partition removal failed");
                }
                let _ = ack_tx.send(result);
            }
            WriteOp::Barrier { ack_tx } => {
                let _ = ack_tx.send(());
            }
        }
    }

    fn count<T>(&self, result: &Result<T, WriterError>, success: &AtomicU64) {
        match result {
            Ok(_) => {
                success.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                error!(partition = %self.key, error = %e, "partition write failed");
            }
        }
    }

    async fn append(&mut self, record: &LogRecord) -> Result<(), WriterError> {
        let mut line = record.encode_line()?;
        line.push('\n');

        if !self.boundary_checked {
            ensure_line_boundary(&self.path)
                .await
                .map_err(|e| WriterError::io(&self.path, e))?;
            self.boundary_checked = true;
        }

        let result = append_line(&self.path, line.as_bytes()).await;
        if result.is_err() {
            // A partial write may have left a torn line
            self.boundary_checked = false;
        }
        result.map_err(|e| WriterError::io(&self.path, e))
    }

    async fn update(
        &mut self,
        record_id: &str,
        record: &LogRecord,
    ) -> Result<UpdateOutcome, WriterError> {
        let line = record.encode_line()?;
        let outcome = rewrite_line(&self.path, record_id, |_| Ok(Some(line))).await?;
        self.boundary_checked = true;
        Ok(outcome)
    }

    /// Runs on the queue, so no append can slip in between the size check
    /// and the unlink.
    async fn remove_if_unchanged(&mut self, expected_size: u64) -> Result<RemoveOutcome, WriterError> {
        let size_bytes = match tokio::fs::metadata(&self.path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(RemoveOutcome::Missing),
            Err(e) => return Err(WriterError::io(&self.path, e)),
        };
        if size_bytes != expected_size {
            return Ok(RemoveOutcome::Changed { size_bytes });
        }
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(RemoveOutcome::Missing),
            Err(e) => return Err(WriterError::io(&self.path, e)),
        }
        self.boundary_checked = false;
        Ok(RemoveOutcome::Removed)
    }

    async fn backfill(
        &mut self,
        record_id: &str,
        original_url: &str,
        stored_url: &str,
    ) -> Result<UpdateOutcome, WriterError> {
        let outcome = rewrite_line(&self.path, record_id, |existing| {
            let Some(existing) = existing else {
                return Ok(None);
            };
            let mut record = LogRecord::decode_line(existing)?;
            if !record.backfill_media(original_url, stored_url) {
                return Ok(None);
            }
            Ok(Some(record.encode_line()?))
        })
        .await?;
        if outcome == UpdateOutcome::Unchanged {
            debug!(partition = %self.key, record_id, original_url, "no media entry to backfill");
        }
        Ok(outcome)
    }
}

async fn append_line(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(bytes).await?;
    file.sync_data().await
}

/// Terminate a torn last line (crash mid-append) so the next append starts
/// on its own line.
async fn ensure_line_boundary(path: &Path) -> std::io::Result<()> {
    let mut file = match tokio::fs::OpenOptions::new()
        .read(true)
        .append(true)
        .open(path)
        .await
    {
        Ok(file) => file,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    let len = file.metadata().await?.len();
    if len == 0 {
        return Ok(());
    }
    file.seek(SeekFrom::Start(len - 1)).await?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last).await?;
    if last[0] != b'\n' {
        warn!(path = %path.display(), "partition file ends mid-line, terminating torn line");
        file.write_all(b"\n").await?;
        file.sync_data().await?;
    }
    Ok(())
}

/// Rewrite the first line carrying `record_id` through `edit`.
///
/// `edit` receives the existing line (or `None` when absent) and returns the
/// replacement, or `None` to leave the file alone. An absent record with a
/// replacement is appended. All other lines are kept byte-for-byte. The new
/// file is written to `<file>.tmp`, synced and renamed over the original.
async fn rewrite_line<F>(
    path: &Path,
    record_id: &str,
    edit: F,
) -> Result<UpdateOutcome, WriterError>
where
    F: FnOnce(Option<&str>) -> Result<Option<String>, WriterError>,
{
    let contents = match tokio::fs::read(path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == ErrorKind::NotFound => Vec::new(),
        Err(e) => return Err(WriterError::io(path, e)),
    };

    // Lines stay raw bytes so undecodable ones are carried over untouched
    let mut lines: Vec<&[u8]> = split_lines(&contents);
    let existing = lines.iter().enumerate().find_map(|(i, raw)| {
        let line = std::str::from_utf8(raw).ok()?;
        (probe_record_id(line).as_deref() == Some(record_id)).then_some((i, line))
    });

    let replacement = edit(existing.map(|(_, line)| line))?;
    let Some(replacement) = replacement else {
        return Ok(UpdateOutcome::Unchanged);
    };

    let outcome = match existing {
        Some((_, line)) if line == replacement => return Ok(UpdateOutcome::Unchanged),
        Some((i, _)) => {
            lines[i] = replacement.as_bytes();
            UpdateOutcome::Replaced
        }
        None => {
            lines.push(replacement.as_bytes());
            UpdateOutcome::Appended
        }
    };

    let mut rewritten = lines.join(&b'\n');
    rewritten.push(b'\n');

    let temp_path = temp_path_for(path);
    write_synced(&temp_path, &rewritten)
        .await
        .map_err(|e| WriterError::io(&temp_path, e))?;
    if let Err(e) = tokio::fs::rename(&temp_path, path).await {
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Err(WriterError::io(path, e));
    }
    Ok(outcome)
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

async fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await
}

// ============================================================================
// PartitionWriter - public handle
// ============================================================================

/// Serialized, durable writer for all partition files of one directory
#[derive(Clone)]
pub struct PartitionWriter {
    layout: PartitionLayout,
    config: WriterConfig,
    registry: Arc<Mutex<Registry>>,
    counters: Arc<Counters>,
}

impl PartitionWriter {
    pub fn new(layout: PartitionLayout, config: WriterConfig) -> Self {
        PartitionWriter {
            layout,
            config,
            registry: Arc::new(Mutex::new(Registry::default())),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn layout(&self) -> &PartitionLayout {
        &self.layout
    }

    /// Append one record line to the partition file, durably.
    pub async fn append(&self, key: &PartitionKey, record: LogRecord) -> Result<(), WriterError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.submit(
            key,
            WriteOp::Append {
                record: Box::new(record),
                ack_tx,
            },
        )?;
        ack_rx
            .await
            .unwrap_or_else(|_| Err(WriterError::Unavailable(key.clone())))
    }

    /// Append a record to the partition derived from its group and timestamp.
    pub async fn append_record(
        &self,
        record: LogRecord,
        offset: FixedOffset,
    ) -> Result<PartitionKey, WriterError> {
        let key = record.partition_key(offset)?;
        self.append(&key, record).await?;
        Ok(key)
    }

    /// Replace the first line whose id is `record_id`, or append when absent.
    pub async fn update_record(
        &self,
        key: &PartitionKey,
        record_id: &str,
        record: LogRecord,
    ) -> Result<UpdateOutcome, WriterError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.submit(
            key,
            WriteOp::Update {
                record_id: record_id.to_string(),
                record: Box::new(record),
                ack_tx,
            },
        )?;
        ack_rx
            .await
            .unwrap_or_else(|_| Err(WriterError::Unavailable(key.clone())))
    }

    /// Set the stored URL of one media entry of a record, in place.
    pub async fn backfill_media(
        &self,
        key: &PartitionKey,
        record_id: &str,
        original_url: &str,
        stored_url: &str,
    ) -> Result<UpdateOutcome, WriterError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.submit(
            key,
            WriteOp::BackfillMedia {
                record_id: record_id.to_string(),
                original_url: original_url.to_string(),
                stored_url: stored_url.to_string(),
                ack_tx,
            },
        )?;
        ack_rx
            .await
            .unwrap_or_else(|_| Err(WriterError::Unavailable(key.clone())))
    }

    /// Delete the partition file if it still has `expected_size` bytes.
    /// Queued behind every earlier operation on the key.
    pub async fn remove_if_unchanged(
        &self,
        key: &PartitionKey,
        expected_size: u64,
    ) -> Result<RemoveOutcome, WriterError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.submit(key, WriteOp::RemoveIfUnchanged { expected_size, ack_tx })?;
        ack_rx
            .await
            .unwrap_or_else(|_| Err(WriterError::Unavailable(key.clone())))
    }

    /// Read every record of a partition file.
    ///
    /// Does not wait for queued operations: it sees the latest committed
    /// write. Call [`drain`](Self::drain) first for a stable snapshot.
    pub async fn read_all(&self, key: &PartitionKey) -> Result<ParsedLines, WriterError> {
        let path = self.layout.path_for(key);
        match tokio::fs::read(&path).await {
            Ok(contents) => Ok(parse_lines(&contents, &key.file_name())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(ParsedLines::default()),
            Err(e) => Err(WriterError::io(&path, e)),
        }
    }

    /// Wait for every operation queued so far on `key`.
    pub async fn drain(&self, key: &PartitionKey) {
        let barrier = {
            let registry = self.registry.lock();
            registry.queues.get(key).and_then(|slot| {
                let (ack_tx, ack_rx) = oneshot::channel();
                slot.tx.send(WriteOp::Barrier { ack_tx }).ok().map(|_| ack_rx)
            })
        };
        if let Some(ack_rx) = barrier {
            let _ = ack_rx.await;
        }
    }

    /// Wait for every operation queued so far on all keys.
    pub async fn drain_all(&self) {
        let barriers: Vec<_> = {
            let registry = self.registry.lock();
            registry
                .queues
                .values()
                .filter_map(|slot| {
                    let (ack_tx, ack_rx) = oneshot::channel();
                    slot.tx.send(WriteOp::Barrier { ack_tx }).ok().map(|_| ack_rx)
                })
                .collect()
        };
        for ack_rx in barriers {
            let _ = ack_rx.await;
        }
    }

    /// Refuse new operations and wait until every queue has finished.
    pub async fn shutdown(&self) {
        let slots: Vec<QueueSlot> = {
            let mut registry = self.registry.lock();
            registry.closed = true;
            registry.queues.drain().map(|(_, slot)| slot).collect()
        };
        let count = slots.len();
        for slot in slots {
            // Dropping the sender lets the queue finish its backlog and exit
            drop(slot.tx);
            if let Err(e) = slot.task.await {
                error!(error = %e, "partition queue task failed");
            }
        }
        info!(queues = count, "partition writer shut down");
    }

    pub fn active_queues(&self) -> usize {
        self.registry.lock().queues.len()
    }

    pub fn stats(&self) -> WriterStats {
        WriterStats {
            appends: self.counters.appends.load(Ordering::Relaxed),
            updates: self.counters.updates.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
            active_queues: self.active_queues(),
        }
    }

    /// Hand an operation to the key's queue, spawning the queue if needed.
    /// The send happens under the registry lock so it cannot race a reap.
    fn submit(&self, key: &PartitionKey, op: WriteOp) -> Result<(), WriterError> {
        let mut registry = self.registry.lock();
        if registry.closed {
            return Err(WriterError::Closed);
        }

        let op = match registry.queues.get(key) {
            Some(slot) => match slot.tx.send(op) {
                Ok(()) => return Ok(()),
                // Queue task died; replace it below
                Err(mpsc::error::SendError(op)) => op,
            },
            None => op,
        };

        let generation = registry.next_generation;
        registry.next_generation += 1;

        let (tx, rx) = mpsc::unbounded_channel();
        let queue = PartitionQueue {
            key: key.clone(),
            path: self.layout.path_for(key),
            generation,
            rx,
            registry: self.registry.clone(),
            counters: self.counters.clone(),
            idle_timeout: self.config.idle_timeout,
            boundary_checked: false,
        };
        // Fresh channel with the receiver alive in `queue`: cannot fail
        let _ = tx.send(op);
        let task = tokio::spawn(queue.run());
        registry.queues.insert(
            key.clone(),
            QueueSlot {
                tx,
                generation,
                task,
            },
        );
        Ok(())
    }
}

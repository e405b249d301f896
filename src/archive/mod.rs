//! Chat Log Archive
//!
//! Durable per-partition chat logs that ship to object storage and serve
//! complete historical exports.
//!
//! ## Architecture
//!
//! ```text
//! LogRecord ─► PartitionWriter ─► {group}_{date}.jsonl
//!                                        │ (daily, yesterday and older)
//!                                        ▼
//!                UploadScheduler ─► ObjectStoreClient ─► ObjectStore
//!                       │
//!                       ▼
//!                UploadStateStore ◄── RetentionSweeper (deletes uploaded + old)
//!                       ▲
//!                       │
//!                 ExportEngine (local first, remote fallback, all-or-nothing)
//! ```

pub mod clock;
pub mod config;
pub mod export;
pub mod keys;
pub mod layout;
pub mod object_client;
pub mod object_store;
pub mod partition_writer;
pub mod range;
pub mod record;
pub mod render;
pub mod retention;
#[cfg(feature = "s3")]
pub mod s3_store;
pub mod scheduler;
pub mod service;
pub mod simulated_store;
pub mod upload_state;

pub use clock::{ArchiveClock, ManualClock, SystemClock};
pub use config::{ArchiveConfig, ClientConfig, ConfigError, GroupFilter, SchedulerConfig, StoreConfig, WriterConfig};
pub use export::{Availability, ExportEngine, ExportError, ExportResult, MissingDate, MissingReason};
pub use keys::{ObjectKind, StoredObjectKey};
pub use layout::{LocalPartition, PartitionLayout};
pub use object_client::{ClientError, ObjectStoreClient, UploadReceipt};
pub use self::object_store::{InMemoryObjectStore, ListResult, LocalFsObjectStore, ObjectMeta, ObjectStore, ObjectStoreError};
pub use partition_writer::{PartitionWriter, RemoveOutcome, UpdateOutcome, WriterError, WriterStats};
pub use range::{resolve_range, RangeError, RangeSpec};
pub use record::{Author, ContentFilter, ContentKind, LogRecord, MediaKind, MediaRef, PartitionKey, RecordError};
pub use render::{ExportFormat, RenderedExport};
pub use retention::{RetentionSweeper, SweepReport};
#[cfg(feature = "s3")]
pub use s3_store::{S3Config, S3ObjectStore};
pub use scheduler::{BatchSummary, SchedulerError, UploadScheduler};
pub use service::{build_store, ArchiveService, ArchiveStatus, MissingPartition, ServiceError};
pub use simulated_store::{Fault, FaultRule, SimulatedObjectStore, SimulatedStoreStats, StoreOp};
pub use upload_state::{ClaimOutcome, StateError, StatusCounts, UploadRecord, UploadStateStore, UploadStatus};

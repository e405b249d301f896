pub mod archive;
pub mod observability;

pub use archive::{ArchiveConfig, ArchiveService, ExportFormat, LogRecord, PartitionKey};

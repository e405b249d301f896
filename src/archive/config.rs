//! Configuration for the Archive Pipeline
//!
//! Loaded from TOML by the daemon and then overridden from `CHATLOG_*`
//! environment variables. Durations are written as milliseconds.
//!
//! ```toml
//! data_dir = "/var/lib/chatlog/partitions"
//! retention_days = 7
//! upload_time = "03:00"
//! exclude_groups = ["sandbox"]
//!
//! [store]
//! type = "s3"
//! bucket = "chat-archive"
//! region = "eu-west-1"
//! prefix = "prod"
//! ```

use crate::archive::clock::offset_from_minutes;
use chrono::{FixedOffset, NaiveTime};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Directory holding partition files
    pub data_dir: PathBuf,
    /// Directory for export downloads; defaults to the system temp dir
    pub scratch_dir: Option<PathBuf>,
    /// Path of the upload state document; defaults to `{data_dir}/upload-state.json`
    pub state_path: Option<PathBuf>,
    /// Offset used to cut calendar dates, minutes east of UTC
    pub utc_offset_minutes: i32,
    /// Days an uploaded partition file is kept locally
    pub retention_days: u32,
    /// Local time-of-day of the daily upload batch, "HH:MM"
    pub upload_time: String,
    /// When non-empty, only these groups are uploaded
    pub include_groups: Vec<String>,
    /// Groups never uploaded
    pub exclude_groups: Vec<String>,
    pub writer: WriterConfig,
    pub client: ClientConfig,
    pub scheduler: SchedulerConfig,
    pub store: StoreConfig,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        ArchiveConfig {
            data_dir: PathBuf::from("data/partitions"),
            scratch_dir: None,
            state_path: None,
            utc_offset_minutes: 0,
            retention_days: 7,
            upload_time: "03:00".to_string(),
            include_groups: Vec::new(),
            exclude_groups: Vec::new(),
            writer: WriterConfig::default(),
            client: ClientConfig::default(),
            scheduler: SchedulerConfig::default(),
            store: StoreConfig::LocalFs {
                path: PathBuf::from("data/object-store"),
            },
        }
    }
}

impl ArchiveConfig {
    /// Configuration for tests: everything under `root`, in-memory store
    pub fn test(root: &Path) -> Self {
        ArchiveConfig {
            data_dir: root.join("partitions"),
            scratch_dir: Some(root.join("scratch")),
            state_path: Some(root.join("upload-state.json")),
            writer: WriterConfig::test(),
            client: ClientConfig::test(),
            scheduler: SchedulerConfig::test(),
            store: StoreConfig::InMemory,
            ..Default::default()
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: ArchiveConfig = toml::from_str(text)?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Apply `CHATLOG_*` overrides from the process environment
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides from an arbitrary variable source
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("CHATLOG_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(dir) = lookup("CHATLOG_SCRATCH_DIR") {
            self.scratch_dir = Some(PathBuf::from(dir));
        }
        if let Some(days) = lookup("CHATLOG_RETENTION_DAYS") {
            self.retention_days = days.parse().map_err(|_| ConfigError::Invalid {
                field: "retention_days",
                reason: format!("not a number: {}", days),
            })?;
        }
        if let Some(time) = lookup("CHATLOG_UPLOAD_TIME") {
            self.upload_time = time;
        }
        if let Some(minutes) = lookup("CHATLOG_UTC_OFFSET_MINUTES") {
            self.utc_offset_minutes = minutes.parse().map_err(|_| ConfigError::Invalid {
                field: "utc_offset_minutes",
                reason: format!("not a number: {}", minutes),
            })?;
        }
        if let Some(url) = lookup("CHATLOG_PUBLIC_BASE_URL") {
            self.client.public_base_url = Some(url);
        }
        if let Some(groups) = lookup("CHATLOG_INCLUDE_GROUPS") {
            self.include_groups = split_list(&groups);
        }
        if let Some(groups) = lookup("CHATLOG_EXCLUDE_GROUPS") {
            self.exclude_groups = split_list(&groups);
        }
        if let StoreConfig::S3 {
            bucket,
            prefix,
            endpoint,
            ..
        } = &mut self.store
        {
            if let Some(value) = lookup("CHATLOG_S3_BUCKET") {
                *bucket = value;
            }
            if let Some(value) = lookup("CHATLOG_S3_PREFIX") {
                *prefix = value;
            }
            if let Some(value) = lookup("CHATLOG_S3_ENDPOINT") {
                *endpoint = Some(value);
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.upload_time()?;
        self.utc_offset()?;
        if self.client.upload_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                field: "client.upload_timeout",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.client.download_timeout.is_zero() {
            return Err(ConfigError::Invalid {
                field: "client.download_timeout",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.scheduler.max_concurrent_uploads == 0 {
            return Err(ConfigError::Invalid {
                field: "scheduler.max_concurrent_uploads",
                reason: "must be at least 1".to_string(),
            });
        }
        if let Some(group) = self
            .include_groups
            .iter()
            .find(|g| self.exclude_groups.contains(g))
        {
            return Err(ConfigError::Invalid {
                field: "include_groups",
                reason: format!("group {} is both included and excluded", group),
            });
        }
        if let StoreConfig::S3 { bucket, .. } = &self.store {
            if bucket.is_empty() {
                return Err(ConfigError::Invalid {
                    field: "store.bucket",
                    reason: "must not be empty".to_string(),
                });
            }
        }
        Ok(())
    }

    pub fn upload_time(&self) -> Result<NaiveTime, ConfigError> {
        NaiveTime::parse_from_str(&self.upload_time, "%H:%M").map_err(|e| ConfigError::Invalid {
            field: "upload_time",
            reason: format!("{} ({})", self.upload_time, e),
        })
    }

    pub fn utc_offset(&self) -> Result<FixedOffset, ConfigError> {
        offset_from_minutes(self.utc_offset_minutes).ok_or_else(|| ConfigError::Invalid {
            field: "utc_offset_minutes",
            reason: format!("{} is out of range", self.utc_offset_minutes),
        })
    }

    pub fn state_path(&self) -> PathBuf {
        self.state_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("upload-state.json"))
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.scratch_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }

    pub fn group_filter(&self) -> GroupFilter {
        GroupFilter {
            include: self.include_groups.clone(),
            exclude: self.exclude_groups.clone(),
        }
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Per-group inclusion/exclusion for uploads
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupFilter {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

impl GroupFilter {
    pub fn allows(&self, group: &str) -> bool {
        if self.exclude.iter().any(|g| g == group) {
            return false;
        }
        self.include.is_empty() || self.include.iter().any(|g| g == group)
    }
}

/// Object store backend
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreConfig {
    /// In-memory store (for tests)
    InMemory,
    /// Local filesystem
    LocalFs { path: PathBuf },
    /// Amazon S3 or compatible
    S3 {
        bucket: String,
        #[serde(default)]
        prefix: String,
        #[serde(default = "default_region")]
        region: String,
        /// Custom endpoint (for S3-compatible services like MinIO)
        #[serde(default)]
        endpoint: Option<String>,
    },
}

fn default_region() -> String {
    "us-east-1".to_string()
}

/// Partition writer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    /// Idle time after which a partition queue is reaped
    #[serde(with = "duration_millis")]
    pub idle_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        WriterConfig {
            idle_timeout: Duration::from_secs(60),
        }
    }
}

impl WriterConfig {
    pub fn test() -> Self {
        WriterConfig {
            idle_timeout: Duration::from_millis(200),
        }
    }
}

/// Object store client settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Deadline for a single upload (default: 60s)
    #[serde(with = "duration_millis")]
    pub upload_timeout: Duration,
    /// Deadline for a single download (default: 60s)
    #[serde(with = "duration_millis")]
    pub download_timeout: Duration,
    /// Deadline for listing / existence checks (default: 15s)
    #[serde(with = "duration_millis")]
    pub list_timeout: Duration,
    /// Public URL prefix for stored objects
    pub public_base_url: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            upload_timeout: Duration::from_secs(60),
            download_timeout: Duration::from_secs(60),
            list_timeout: Duration::from_secs(15),
            public_base_url: None,
        }
    }
}

impl ClientConfig {
    pub fn test() -> Self {
        ClientConfig {
            upload_timeout: Duration::from_millis(500),
            download_timeout: Duration::from_millis(500),
            list_timeout: Duration::from_millis(500),
            public_base_url: Some("https://archive.test".to_string()),
        }
    }
}

/// Background worker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Uploads in flight at once within one batch
    pub max_concurrent_uploads: usize,
    /// How far back failed/pending partitions are retried by the daily batch
    pub retry_lookback_days: u32,
    /// Interval of the interrupted-upload recovery pass (default: 1h)
    #[serde(with = "duration_millis")]
    pub state_recovery_interval: Duration,
    /// Age after which an `uploading` record is considered interrupted
    #[serde(with = "duration_millis")]
    pub stale_upload_after: Duration,
    /// Interval of the retention sweep (default: 6h)
    #[serde(with = "duration_millis")]
    pub sweep_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            max_concurrent_uploads: 4,
            retry_lookback_days: 7,
            state_recovery_interval: Duration::from_secs(3600),
            stale_upload_after: Duration::from_secs(2 * 3600),
            sweep_interval: Duration::from_secs(6 * 3600),
        }
    }
}

impl SchedulerConfig {
    pub fn test() -> Self {
        SchedulerConfig {
            max_concurrent_uploads: 4,
            retry_lookback_days: 7,
            state_recovery_interval: Duration::from_millis(100),
            stale_upload_after: Duration::from_secs(60),
            sweep_interval: Duration::from_millis(100),
        }
    }
}

/// Serde helper for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

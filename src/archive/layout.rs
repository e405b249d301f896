//! Local Partition Directory
//!
//! All partition files of a deployment live flat in one directory, named
//! `{group}_{YYYY-MM-DD}.jsonl`. Anything else in the directory (temp files
//! from interrupted rewrites, stray files) is ignored by scans.

use crate::archive::record::PartitionKey;
use chrono::{DateTime, NaiveDate, Utc};
use std::io::{ErrorKind, Result as IoResult};
use std::path::{Path, PathBuf};

/// A partition file found on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalPartition {
    pub key: PartitionKey,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub modified: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct PartitionLayout {
    root: PathBuf,
}

impl PartitionLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        PartitionLayout { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, key: &PartitionKey) -> PathBuf {
        self.root.join(key.file_name())
    }

    pub async fn ensure_root(&self) -> IoResult<()> {
        tokio::fs::create_dir_all(&self.root).await
    }

    pub async fn exists(&self, key: &PartitionKey) -> IoResult<bool> {
        match tokio::fs::metadata(self.path_for(key)).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// All partition files, sorted by (group, date)
    pub async fn scan(&self) -> IoResult<Vec<LocalPartition>> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut partitions = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(key) = name.to_str().and_then(PartitionKey::parse_file_name) else {
                continue;
            };
            let meta = match entry.metadata().await {
                Ok(meta) if meta.is_file() => meta,
                Ok(_) => continue,
                // Deleted between read_dir and stat
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            };
            partitions.push(LocalPartition {
                key,
                path: entry.path(),
                size_bytes: meta.len(),
                modified: meta.modified().map(DateTime::<Utc>::from)?,
            });
        }

        partitions.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(partitions)
    }

    /// Partition files for one date
    pub async fn scan_date(&self, date: NaiveDate) -> IoResult<Vec<LocalPartition>> {
        let mut partitions = self.scan().await?;
        partitions.retain(|p| p.key.date == date);
        Ok(partitions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[tokio::test]
    async fn test_scan_missing_root_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let layout = PartitionLayout::new(dir.path().join("absent"));
        assert!(layout.scan().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_scan_filters_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        let layout = PartitionLayout::new(dir.path());

        let b = PartitionKey::new(Some("b"), date(2024, 1, 1));
        let a2 = PartitionKey::new(Some("a"), date(2024, 1, 2));
        let a1 = PartitionKey::new(Some("a"), date(2024, 1, 1));
        for key in [&b, &a2, &a1] {
            std::fs::write(layout.path_for(key), b"{}\n").unwrap();
        }
        std::fs::write(dir.path().join("a_2024-01-01.jsonl.tmp"), b"x").unwrap();
        std::fs::write(dir.path().join("README"), b"x").unwrap();

        let keys: Vec<_> = layout.scan().await.unwrap().into_iter().map(|p| p.key).collect();
        assert_eq!(keys, vec![a1.clone(), a2, b.clone()]);

        let day1: Vec<_> = layout
            .scan_date(date(2024, 1, 1))
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.key)
            .collect();
        assert_eq!(day1, vec![a1.clone(), b]);

        assert!(layout.exists(&a1).await.unwrap());
        assert!(!layout
            .exists(&PartitionKey::new(Some("zzz"), date(2024, 1, 1)))
            .await
            .unwrap());
    }
}

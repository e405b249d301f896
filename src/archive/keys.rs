//! Deterministic Object Keys
//!
//! Every stored object lives at
//!
//! ```text
//! {kind}/{YYYY-MM-DD}/{group}/{name}.{ext}
//! ```
//!
//! Log batches are named after the partition file stem, so the key of an
//! uploaded partition can be re-derived from `(group, date)` alone when
//! checking what the remote side already holds.

use crate::archive::record::{PartitionKey, PARTITION_FILE_EXT};
use chrono::NaiveDate;
use std::fmt;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Logs,
    Media,
    Exports,
}

impl ObjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Logs => "logs",
            ObjectKind::Media => "media",
            ObjectKind::Exports => "exports",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "logs" => Some(ObjectKind::Logs),
            "media" => Some(ObjectKind::Media),
            "exports" => Some(ObjectKind::Exports),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StoredObjectKey {
    pub kind: ObjectKind,
    pub date: NaiveDate,
    pub group: String,
    /// Record id, timestamp or file stem
    pub name: String,
    pub ext: String,
}

impl StoredObjectKey {
    /// Key of the uploaded copy of a partition file
    pub fn for_partition_log(key: &PartitionKey) -> Self {
        StoredObjectKey {
            kind: ObjectKind::Logs,
            date: key.date,
            group: key.group.clone(),
            name: key.file_stem(),
            ext: PARTITION_FILE_EXT.to_string(),
        }
    }

    /// Key of the `index`-th media attachment of a record
    pub fn for_media(key: &PartitionKey, record_id: &str, index: usize, ext: &str) -> Self {
        let name = if index == 0 {
            sanitize_segment(record_id)
        } else {
            format!("{}-{}", sanitize_segment(record_id), index)
        };
        StoredObjectKey {
            kind: ObjectKind::Media,
            date: key.date,
            group: key.group.clone(),
            name,
            ext: ext.to_string(),
        }
    }

    /// Key of an export report generated at `timestamp_ms`
    pub fn for_export(key: &PartitionKey, timestamp_ms: i64, ext: &str) -> Self {
        StoredObjectKey {
            kind: ObjectKind::Exports,
            date: key.date,
            group: key.group.clone(),
            name: timestamp_ms.to_string(),
            ext: ext.to_string(),
        }
    }

    /// `{kind}/{date}/{group}/`: everything stored for one partition
    pub fn prefix(kind: ObjectKind, key: &PartitionKey) -> String {
        format!("{}/{}/{}/", kind.as_str(), key.date.format("%Y-%m-%d"), key.group)
    }

    pub fn parse(key: &str) -> Option<Self> {
        let mut parts = key.splitn(4, '/');
        let kind = ObjectKind::parse(parts.next()?)?;
        let date = NaiveDate::parse_from_str(parts.next()?, "%Y-%m-%d").ok()?;
        let group = parts.next()?;
        let file = parts.next()?;
        if group.is_empty() || file.contains('/') {
            return None;
        }
        let (name, ext) = file.rsplit_once('.')?;
        if name.is_empty() || ext.is_empty() {
            return None;
        }
        Some(StoredObjectKey {
            kind,
            date,
            group: group.to_string(),
            name: name.to_string(),
            ext: ext.to_string(),
        })
    }

    pub fn partition(&self) -> PartitionKey {
        PartitionKey {
            group: self.group.clone(),
            date: self.date,
        }
    }
}

impl fmt::Display for StoredObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}.{}",
            self.kind.as_str(),
            self.date.format("%Y-%m-%d"),
            self.group,
            self.name,
            self.ext
        )
    }
}

fn sanitize_segment(s: &str) -> String {
    let cleaned: String = s
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}

/// Guess a content type from leading magic bytes, then from the file
/// extension.
pub fn infer_content_type(path: Option<&Path>, data: &[u8]) -> &'static str {
    if let Some(sniffed) = sniff_magic(data) {
        return sniffed;
    }
    let ext = path
        .and_then(|p| p.extension())
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("jsonl") | Some("ndjson") => "application/x-ndjson",
        Some("json") => "application/json",
        Some("txt") | Some("log") => "text/plain; charset=utf-8",
        Some("csv") => "text/csv; charset=utf-8",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("mp4") => "video/mp4",
        Some("mp3") => "audio/mpeg",
        Some("ogg") => "audio/ogg",
        Some("pdf") => "application/pdf",
        _ => "application/octet-stream",
    }
}

fn sniff_magic(data: &[u8]) -> Option<&'static str> {
    const PNG: &[u8] = b"\x89PNG\r\n\x1a\n";
    if data.starts_with(PNG) {
        Some("image/png")
    } else if data.starts_with(b"\xFF\xD8\xFF") {
        Some("image/jpeg")
    } else if data.starts_with(b"GIF87a") || data.starts_with(b"GIF89a") {
        Some("image/gif")
    } else if data.len() >= 12 && &data[..4] == b"RIFF" && &data[8..12] == b"WEBP" {
        Some("image/webp")
    } else if data.len() >= 8 && &data[4..8] == b"ftyp" {
        Some("video/mp4")
    } else if data.starts_with(b"%PDF-") {
        Some("application/pdf")
    } else if data.starts_with(b"OggS") {
        Some("audio/ogg")
    } else if data.starts_with(b"ID3") {
        Some("audio/mpeg")
    } else {
        None
    }
}

/// File extension for a content type, used when naming media objects
pub fn extension_for_content_type(content_type: &str) -> &'static str {
    let essence = content_type.split(';').next().unwrap_or("").trim();
    match essence {
        "image/png" => "png",
        "image/jpeg" => "jpg",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "video/mp4" => "mp4",
        "audio/mpeg" => "mp3",
        "audio/ogg" => "ogg",
        "application/pdf" => "pdf",
        "application/json" => "json",
        "application/x-ndjson" => "jsonl",
        "text/csv" => "csv",
        "text/plain" => "txt",
        _ => "bin",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn partition() -> PartitionKey {
        PartitionKey::new(Some("team_chat"), NaiveDate::from_ymd_opt(2024, 1, 1).unwrap())
    }

    #[test]
    fn test_partition_log_key_is_derivable() {
        let key = StoredObjectKey::for_partition_log(&partition());
        assert_eq!(
            key.to_string(),
            "logs/2024-01-01/team_chat/team_chat_2024-01-01.jsonl"
        );
        assert_eq!(StoredObjectKey::parse(&key.to_string()), Some(key.clone()));
        assert_eq!(key.partition(), partition());
        assert!(key.to_string().starts_with(&StoredObjectKey::prefix(ObjectKind::Logs, &partition())));
    }

    #[test]
    fn test_media_and_export_keys() {
        let media = StoredObjectKey::for_media(&partition(), "msg/42", 1, "png");
        assert_eq!(media.to_string(), "media/2024-01-01/team_chat/msg_42-1.png");

        let export = StoredObjectKey::for_export(&partition(), 1_704_103_200_000, "csv");
        assert_eq!(export.to_string(), "exports/2024-01-01/team_chat/1704103200000.csv");
    }

    #[test]
    fn test_parse_rejects_foreign_keys() {
        assert!(StoredObjectKey::parse("segments/2024-01-01/g/x.bin").is_none());
        assert!(StoredObjectKey::parse("logs/2024-1-1/g/x.jsonl").is_none());
        assert!(StoredObjectKey::parse("logs/2024-01-01/g/noext").is_none());
        assert!(StoredObjectKey::parse("logs/2024-01-01/g/a/b.jsonl").is_none());
    }

    #[test]
    fn test_infer_content_type() {
        assert_eq!(infer_content_type(None, b"\x89PNG\r\n\x1a\nrest"), "image/png");
        // Magic wins over a misleading extension
        assert_eq!(
            infer_content_type(Some(Path::new("a.txt")), b"GIF89a..."),
            "image/gif"
        );
        assert_eq!(
            infer_content_type(Some(Path::new("g_2024-01-01.jsonl")), b"{\"id\":1}"),
            "application/x-ndjson"
        );
        assert_eq!(infer_content_type(None, b"plain"), "application/octet-stream");
        assert_eq!(extension_for_content_type("text/csv; charset=utf-8"), "csv");
        assert_eq!(extension_for_content_type("application/x-unknown"), "bin");
    }
}

//! Normalized Log Records and Partition Keys
//!
//! A [`LogRecord`] is one chat event as handed over by the message-source
//! adapter. Records are stored one JSON object per line, grouped into
//! partitions identified by a [`PartitionKey`] (group + calendar date).
//!
//! ## Line Format
//!
//! ```text
//! {"id":"m1","group_id":"g1","author":{"id":"u1","name":"alice"},"timestamp_ms":...,"content":"text","body":"hi","media":[]}
//! ```
//!
//! Every line parses on its own; a torn or corrupted line never prevents the
//! rest of the file from being read.

use crate::archive::clock::date_of_millis;
use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::warn;

/// File extension of partition files
pub const PARTITION_FILE_EXT: &str = "jsonl";

/// Group name used for records that carry no group
pub const NO_GROUP: &str = "none";

#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("malformed record line: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("record {id} has out-of-range timestamp {timestamp_ms}")]
    InvalidTimestamp { id: String, timestamp_ms: i64 },
}

/// Classified content of a record
///
/// Closed set: filters and renderers match on it exhaustively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    /// Plain text only
    Text,
    /// Media attachments only
    Media,
    /// Text together with media
    Mixed,
    /// Structured quote/reply of another message
    Quote,
    /// Anything the adapter could not classify
    Other,
}

impl ContentKind {
    /// Classification rule used by adapters that only know body and media
    pub fn classify(body: &str, media: &[MediaRef]) -> Self {
        match (body.trim().is_empty(), media.is_empty()) {
            (false, true) => ContentKind::Text,
            (true, false) => ContentKind::Media,
            (false, false) => ContentKind::Mixed,
            (true, true) => ContentKind::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ContentKind::Text => "text",
            ContentKind::Media => "media",
            ContentKind::Mixed => "mixed",
            ContentKind::Quote => "quote",
            ContentKind::Other => "other",
        }
    }
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Content-type filter applied by exports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentFilter {
    Only(ContentKind),
    /// Anything carrying media (`media` or `mixed`)
    WithMedia,
}

impl ContentFilter {
    pub fn matches(&self, kind: ContentKind) -> bool {
        match self {
            ContentFilter::Only(wanted) => *wanted == kind,
            ContentFilter::WithMedia => match kind {
                ContentKind::Media | ContentKind::Mixed => true,
                ContentKind::Text | ContentKind::Quote | ContentKind::Other => false,
            },
        }
    }
}

impl FromStr for ContentFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(ContentFilter::Only(ContentKind::Text)),
            "media" => Ok(ContentFilter::Only(ContentKind::Media)),
            "mixed" => Ok(ContentFilter::Only(ContentKind::Mixed)),
            "quote" => Ok(ContentFilter::Only(ContentKind::Quote)),
            "other" => Ok(ContentFilter::Only(ContentKind::Other)),
            "with_media" | "any_media" => Ok(ContentFilter::WithMedia),
            other => Err(format!("unknown content filter: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Video,
    Audio,
    File,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
            MediaKind::File => "file",
        }
    }
}

/// A media attachment: where it came from and, once mirrored, where it lives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    pub kind: MediaKind,
    pub original_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stored_url: Option<String>,
}

impl MediaRef {
    /// The best URL to show a reader
    pub fn display_url(&self) -> &str {
        self.stored_url.as_deref().unwrap_or(&self.original_url)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    pub id: String,
    pub name: String,
}

/// One normalized chat event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Stable id assigned by the source platform
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    pub author: Author,
    /// Unix milliseconds
    pub timestamp_ms: i64,
    pub content: ContentKind,
    #[serde(default)]
    pub body: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub media: Vec<MediaRef>,
}

impl LogRecord {
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        DateTime::<Utc>::from_timestamp_millis(self.timestamp_ms)
    }

    /// Partition this record belongs to when dates are cut in `offset`
    pub fn partition_key(&self, offset: FixedOffset) -> Result<PartitionKey, RecordError> {
        let date = date_of_millis(self.timestamp_ms, offset).ok_or_else(|| {
            RecordError::InvalidTimestamp {
                id: self.id.clone(),
                timestamp_ms: self.timestamp_ms,
            }
        })?;
        Ok(PartitionKey::new(self.group_id.as_deref(), date))
    }

    /// Encode as a single line (no trailing newline)
    pub fn encode_line(&self) -> Result<String, RecordError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode_line(line: &str) -> Result<Self, RecordError> {
        Ok(serde_json::from_str(line)?)
    }

    /// Fill in the stored URL of the media entry pointing at `original_url`.
    /// Returns false when no entry matches.
    pub fn backfill_media(&mut self, original_url: &str, stored_url: &str) -> bool {
        match self
            .media
            .iter_mut()
            .find(|m| m.original_url == original_url)
        {
            Some(media) => {
                media.stored_url = Some(stored_url.to_string());
                true
            }
            None => false,
        }
    }
}

#[derive(Deserialize)]
struct IdProbe {
    id: String,
}

/// Extract just the record id of a line without decoding the whole record.
pub fn probe_record_id(line: &str) -> Option<String> {
    serde_json::from_str::<IdProbe>(line).ok().map(|p| p.id)
}

/// Records parsed from one partition file
#[derive(Debug, Default)]
pub struct ParsedLines {
    pub records: Vec<LogRecord>,
    /// Non-empty lines that failed to parse
    pub skipped: usize,
}

/// Split raw partition file bytes into lines, without the trailing `\n`.
/// A final line lacking its newline is still yielded.
pub fn split_lines(contents: &[u8]) -> Vec<&[u8]> {
    if contents.is_empty() {
        return Vec::new();
    }
    let body = contents.strip_suffix(b"\n").unwrap_or(contents);
    body.split(|b| *b == b'\n').collect()
}

/// Parse partition file contents line by line, skipping malformed lines.
/// A line that is not valid UTF-8 (a torn multibyte character) counts as
/// malformed like any other.
pub fn parse_lines(contents: &[u8], source: &str) -> ParsedLines {
    let mut parsed = ParsedLines::default();
    for (lineno, raw) in split_lines(contents).into_iter().enumerate() {
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        let line = match std::str::from_utf8(raw) {
            Ok(line) => line,
            Err(e) => {
                parsed.skipped += 1;
                warn!(source, line = lineno + 1, error = %e, "skipping record line with invalid UTF-8");
                continue;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match LogRecord::decode_line(line) {
            Ok(record) => parsed.records.push(record),
            Err(e) => {
                parsed.skipped += 1;
                warn!(source, line = lineno + 1, error = %e, "skipping malformed record line");
            }
        }
    }
    parsed
}

/// `(group | "none", calendar date)`: the unit of batching, naming and upload
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionKey {
    pub group: String,
    pub date: NaiveDate,
}

impl PartitionKey {
    pub fn new(group: Option<&str>, date: NaiveDate) -> Self {
        PartitionKey {
            group: sanitize_group(group.unwrap_or(NO_GROUP)),
            date,
        }
    }

    /// `{group}_{YYYY-MM-DD}`
    pub fn file_stem(&self) -> String {
        format!("{}_{}", self.group, self.date.format("%Y-%m-%d"))
    }

    /// `{group}_{YYYY-MM-DD}.jsonl`
    pub fn file_name(&self) -> String {
        format!("{}.{}", self.file_stem(), PARTITION_FILE_EXT)
    }

    /// Inverse of [`file_name`](Self::file_name). Splits on the last `_`, so
    /// group ids may themselves contain underscores.
    pub fn parse_file_name(name: &str) -> Option<Self> {
        let stem = name.strip_suffix(PARTITION_FILE_EXT)?.strip_suffix('.')?;
        let (group, date) = stem.rsplit_once('_')?;
        if group.is_empty() {
            return None;
        }
        let date = NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()?;
        Some(PartitionKey {
            group: group.to_string(),
            date,
        })
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.group, self.date)
    }
}

/// Make a group id safe for file names and object keys.
pub fn sanitize_group(group: &str) -> String {
    let cleaned: String = group
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' => '-',
            c if c.is_whitespace() || c.is_control() => '-',
            c => c,
        })
        .collect();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        NO_GROUP.to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Offset;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn record(id: &str, body: &str) -> LogRecord {
        LogRecord {
            id: id.to_string(),
            group_id: Some("g1".to_string()),
            author: Author {
                id: "u1".to_string(),
                name: "alice".to_string(),
            },
            timestamp_ms: 1_704_103_200_000, // 2024-01-01T10:00:00Z
            content: ContentKind::Text,
            body: body.to_string(),
            media: Vec::new(),
        }
    }

    #[test]
    fn test_partition_file_name_roundtrip_with_underscores() {
        let key = PartitionKey::new(Some("team_chat"), date(2024, 1, 1));
        assert_eq!(key.file_name(), "team_chat_2024-01-01.jsonl");
        assert_eq!(PartitionKey::parse_file_name(&key.file_name()), Some(key));
    }

    #[test]
    fn test_parse_file_name_rejects_foreign_files() {
        assert!(PartitionKey::parse_file_name("g1_2024-01-01.jsonl.tmp").is_none());
        assert!(PartitionKey::parse_file_name("g1_2024-13-01.jsonl").is_none());
        assert!(PartitionKey::parse_file_name("_2024-01-01.jsonl").is_none());
        assert!(PartitionKey::parse_file_name("notes.txt").is_none());
    }

    #[test]
    fn test_missing_group_maps_to_none() {
        let key = PartitionKey::new(None, date(2024, 1, 1));
        assert_eq!(key.group, NO_GROUP);
        assert_eq!(key.file_stem(), "none_2024-01-01");
    }

    #[test]
    fn test_sanitize_group() {
        assert_eq!(sanitize_group("a/b\\c"), "a-b-c");
        assert_eq!(sanitize_group("my group"), "my-group");
        assert_eq!(sanitize_group(".."), NO_GROUP);
        assert_eq!(sanitize_group("  "), NO_GROUP);
    }

    #[test]
    fn test_record_partition_key() {
        let rec = record("m1", "hi");
        let key = rec.partition_key(Utc.fix()).unwrap();
        assert_eq!(key, PartitionKey::new(Some("g1"), date(2024, 1, 1)));
    }

    #[test]
    fn test_line_roundtrip_and_probe() {
        let rec = record("m1", "line with \"quotes\"\nand newline");
        let line = rec.encode_line().unwrap();
        assert!(!line.contains('\n'));
        assert_eq!(probe_record_id(&line).as_deref(), Some("m1"));
        assert_eq!(LogRecord::decode_line(&line).unwrap(), rec);
    }

    #[test]
    fn test_parse_lines_skips_malformed() {
        let good = record("m1", "a").encode_line().unwrap();
        let contents = format!("{}\n{{not json\n\n{}\n", good, good);
        let parsed = parse_lines(contents.as_bytes(), "test");
        assert_eq!(parsed.records.len(), 2);
        assert_eq!(parsed.skipped, 1);
    }

    #[test]
    fn test_parse_lines_skips_invalid_utf8_line() {
        let a = record("a", "first").encode_line().unwrap();
        let b = record("b", "second").encode_line().unwrap();
        let mut contents = format!("{}\n", a).into_bytes();
        // Torn three-byte character
        contents.extend_from_slice(b"{\"id\":\"x\",\"body\":\"\xe4\xbd\"}\n");
        contents.extend_from_slice(format!("{}\n", b).as_bytes());

        let parsed = parse_lines(&contents, "test");
        let ids: Vec<_> = parsed.records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(parsed.skipped, 1);
    }

    #[test]
    fn test_split_lines_keeps_unterminated_tail() {
        assert!(split_lines(b"").is_empty());
        assert_eq!(split_lines(b"a\nb\n"), vec![&b"a"[..], &b"b"[..]]);
        assert_eq!(split_lines(b"a\nb"), vec![&b"a"[..], &b"b"[..]]);
        assert_eq!(split_lines(b"\n"), vec![&b""[..]]);
    }

    #[test]
    fn test_classify() {
        let media = vec![MediaRef {
            kind: MediaKind::Image,
            original_url: "https://cdn/x.png".to_string(),
            stored_url: None,
        }];
        assert_eq!(ContentKind::classify("hi", &[]), ContentKind::Text);
        assert_eq!(ContentKind::classify("", &media), ContentKind::Media);
        assert_eq!(ContentKind::classify("look", &media), ContentKind::Mixed);
        assert_eq!(ContentKind::classify(" ", &[]), ContentKind::Other);
    }

    #[test]
    fn test_content_filter() {
        let filter: ContentFilter = "with_media".parse().unwrap();
        assert!(filter.matches(ContentKind::Media));
        assert!(filter.matches(ContentKind::Mixed));
        assert!(!filter.matches(ContentKind::Text));

        let text: ContentFilter = "TEXT".parse().unwrap();
        assert!(text.matches(ContentKind::Text));
        assert!(!text.matches(ContentKind::Quote));
        assert!("bogus".parse::<ContentFilter>().is_err());
    }

    #[test]
    fn test_backfill_media() {
        let mut rec = record("m1", "");
        rec.media.push(MediaRef {
            kind: MediaKind::Image,
            original_url: "https://cdn/a.png".to_string(),
            stored_url: None,
        });
        assert!(rec.backfill_media("https://cdn/a.png", "https://store/a.png"));
        assert_eq!(rec.media[0].display_url(), "https://store/a.png");
        assert!(!rec.backfill_media("https://cdn/missing.png", "x"));
    }
}

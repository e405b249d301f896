//! Export Renderers
//!
//! - `Json`: pretty JSON array of records, as stored
//! - `Text`: one `[YYYY-MM-DD HH:MM:SS] author: body` line per record
//! - `Csv`: RFC 4180, header `id,timestamp,author_id,author,content,body,media`

use crate::archive::record::{ContentKind, LogRecord, MediaRef};
use chrono::{DateTime, FixedOffset};
use std::fmt::Write as _;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExportFormat {
    Json,
    Text,
    Csv,
}

impl ExportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Text => "txt",
            ExportFormat::Csv => "csv",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            ExportFormat::Json => "application/json",
            ExportFormat::Text => "text/plain; charset=utf-8",
            ExportFormat::Csv => "text/csv; charset=utf-8",
        }
    }
}

impl FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "text" | "txt" => Ok(ExportFormat::Text),
            "csv" => Ok(ExportFormat::Csv),
            other => Err(format!("unknown export format: {}", other)),
        }
    }
}

/// One rendered payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedExport {
    pub format: ExportFormat,
    pub body: String,
}

/// Render records in `format`; timestamps are shown in `offset`.
pub fn render(
    records: &[LogRecord],
    format: ExportFormat,
    offset: FixedOffset,
) -> Result<RenderedExport, serde_json::Error> {
    let body = match format {
        ExportFormat::Json => serde_json::to_string_pretty(records)?,
        ExportFormat::Text => render_text(records, offset),
        ExportFormat::Csv => render_csv(records, offset),
    };
    Ok(RenderedExport { format, body })
}

fn local_time(record: &LogRecord, offset: FixedOffset) -> Option<DateTime<FixedOffset>> {
    record.timestamp().map(|ts| ts.with_timezone(&offset))
}

fn media_summary(media: &[MediaRef]) -> String {
    media
        .iter()
        .map(|m| format!("[{}: {}]", m.kind.as_str(), m.display_url()))
        .collect::<Vec<_>>()
        .join(" ")
}

fn render_text(records: &[LogRecord], offset: FixedOffset) -> String {
    let mut out = String::new();
    for record in records {
        let when = local_time(record, offset)
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "????-??-?? ??:??:??".to_string());
        let body = record.body.replace('\n', " ");
        let text = match record.content {
            ContentKind::Text => body,
            ContentKind::Media => media_summary(&record.media),
            ContentKind::Mixed => format!("{} {}", body, media_summary(&record.media)),
            ContentKind::Quote => format!("> {}", body),
            ContentKind::Other if body.trim().is_empty() => "[unsupported message]".to_string(),
            ContentKind::Other => body,
        };
        let _ = writeln!(out, "[{}] {}: {}", when, record.author.name, text.trim_end());
    }
    out
}

fn csv_field(out: &mut String, value: &str) {
    if value.contains([',', '"', '\n', '\r']) {
        out.push('"');
        out.push_str(&value.replace('"', "\"\""));
        out.push('"');
    } else {
        out.push_str(value);
    }
}

fn render_csv(records: &[LogRecord], offset: FixedOffset) -> String {
    let mut out = String::from("id,timestamp,author_id,author,content,body,media\r\n");
    for record in records {
        let when = local_time(record, offset)
            .map(|t| t.to_rfc3339())
            .unwrap_or_default();
        let media = record
            .media
            .iter()
            .map(MediaRef::display_url)
            .collect::<Vec<_>>()
            .join(" ");
        let fields = [
            record.id.as_str(),
            when.as_str(),
            record.author.id.as_str(),
            record.author.name.as_str(),
            record.content.as_str(),
            record.body.as_str(),
            media.as_str(),
        ];
        for (i, field) in fields.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            csv_field(&mut out, field);
        }
        out.push_str("\r\n");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::record::{Author, MediaKind};
    use chrono::Offset;

    fn record(id: &str, content: ContentKind, body: &str) -> LogRecord {
        LogRecord {
            id: id.to_string(),
            group_id: Some("g1".to_string()),
            author: Author {
                id: "u1".to_string(),
                name: "alice".to_string(),
            },
            timestamp_ms: 1_704_103_200_000, // 2024-01-01T10:00:00Z
            content,
            body: body.to_string(),
            media: Vec::new(),
        }
    }

    #[test]
    fn test_text_lines() {
        let mut pic = record("m2", ContentKind::Media, "");
        pic.media.push(MediaRef {
            kind: MediaKind::Image,
            original_url: "https://cdn/a.png".to_string(),
            stored_url: Some("https://store/a.png".to_string()),
        });
        let records = vec![record("m1", ContentKind::Text, "hello\nworld"), pic];

        let out = render(&records, ExportFormat::Text, chrono::Utc.fix()).unwrap();
        let lines: Vec<_> = out.body.lines().collect();
        assert_eq!(lines[0], "[2024-01-01 10:00:00] alice: hello world");
        assert_eq!(lines[1], "[2024-01-01 10:00:00] alice: [image: https://store/a.png]");
    }

    #[test]
    fn test_text_uses_offset() {
        let records = vec![record("m1", ContentKind::Text, "hi")];
        let offset = FixedOffset::east_opt(8 * 3600).unwrap();
        let out = render(&records, ExportFormat::Text, offset).unwrap();
        assert!(out.body.starts_with("[2024-01-01 18:00:00]"));
    }

    #[test]
    fn test_csv_quoting() {
        let records = vec![record("m1", ContentKind::Text, "a, \"quoted\"\nline")];
        let out = render(&records, ExportFormat::Csv, chrono::Utc.fix()).unwrap();
        let mut rows = out.body.split("\r\n");
        assert_eq!(rows.next(), Some("id,timestamp,author_id,author,content,body,media"));
        assert_eq!(
            rows.next(),
            Some("m1,2024-01-01T10:00:00+00:00,u1,alice,text,\"a, \"\"quoted\"\"\nline\",")
        );
    }

    #[test]
    fn test_json_is_array_of_records() {
        let records = vec![record("m1", ContentKind::Quote, "re: hi")];
        let out = render(&records, ExportFormat::Json, chrono::Utc.fix()).unwrap();
        let parsed: Vec<LogRecord> = serde_json::from_str(&out.body).unwrap();
        assert_eq!(parsed, records);
    }

    #[test]
    fn test_format_parse() {
        assert_eq!("CSV".parse::<ExportFormat>().unwrap(), ExportFormat::Csv);
        assert_eq!("txt".parse::<ExportFormat>().unwrap(), ExportFormat::Text);
        assert!("xml".parse::<ExportFormat>().is_err());
        assert_eq!(ExportFormat::Json.extension(), "json");
    }
}

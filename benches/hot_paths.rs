//! Hot path benchmarks for the archive.
//!
//! Run with: `cargo bench --bench hot_paths`
//!
//! Covers what every export and upload touches: encoding a record line,
//! parsing a partition file and rendering an export.

use chatlog_archive::archive::record::parse_lines;
use chatlog_archive::archive::render::render;
use chatlog_archive::archive::{Author, ContentKind, ExportFormat, LogRecord, MediaKind, MediaRef};
use chrono::FixedOffset;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

fn record(n: usize) -> LogRecord {
    let media = if n % 5 == 0 {
        vec![MediaRef {
            kind: MediaKind::Image,
            original_url: format!("https://cdn.example/{}.png", n),
            stored_url: None,
        }]
    } else {
        Vec::new()
    };
    LogRecord {
        id: format!("msg-{}", n),
        group_id: Some("bench-group".to_string()),
        author: Author {
            id: format!("u{}", n % 17),
            name: format!("user, \"{}\"", n % 17),
        },
        timestamp_ms: 1_704_067_200_000 + n as i64 * 1_000,
        content: if media.is_empty() { ContentKind::Text } else { ContentKind::Mixed },
        body: "the quick brown fox jumps over the lazy dog ".repeat(1 + n % 4),
        media,
    }
}

fn partition_file(records: usize) -> String {
    let mut out = String::new();
    for n in 0..records {
        out.push_str(&record(n).encode_line().unwrap());
        out.push('\n');
    }
    out
}

fn bench_encode_line(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode_line");
    group.throughput(Throughput::Elements(1));
    let text = record(1);
    let mixed = record(5);
    group.bench_function("text", |b| b.iter(|| black_box(&text).encode_line()));
    group.bench_function("mixed", |b| b.iter(|| black_box(&mixed).encode_line()));
    group.finish();
}

fn bench_parse_lines(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse_lines");
    for records in [100, 10_000] {
        let contents = partition_file(records);
        group.throughput(Throughput::Bytes(contents.len() as u64));
        group.bench_function(format!("records_{}", records), |b| {
            b.iter(|| parse_lines(black_box(contents.as_bytes()), "bench"))
        });
    }
    group.finish();
}

fn bench_render(c: &mut Criterion) {
    let mut group = c.benchmark_group("render");
    let records: Vec<LogRecord> = (0..5_000).map(record).collect();
    let offset = FixedOffset::east_opt(8 * 3600).unwrap();
    group.throughput(Throughput::Elements(records.len() as u64));
    for format in [ExportFormat::Json, ExportFormat::Text, ExportFormat::Csv] {
        group.bench_function(format.extension(), |b| {
            b.iter(|| render(black_box(&records), format, offset))
        });
    }
    group.finish();
}

criterion_group!(benches, bench_encode_line, bench_parse_lines, bench_render);
criterion_main!(benches);

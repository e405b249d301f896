//! Chat Log Archiver
//!
//! Reads normalized records as JSON lines on stdin, appends them to the
//! local partition logs and runs the upload, recovery and retention timers
//! until Ctrl+C.
//!
//! ## Configuration
//!
//! The first argument (or `CHATLOG_CONFIG`) names a TOML file; without one
//! the defaults apply. Environment overrides:
//!
//! | Variable | Description |
//! |----------|-------------|
//! | CHATLOG_DATA_DIR | Partition directory |
//! | CHATLOG_SCRATCH_DIR | Scratch space for export downloads |
//! | CHATLOG_RETENTION_DAYS | Days an uploaded partition stays local |
//! | CHATLOG_UPLOAD_TIME | Daily upload time, `HH:MM` |
//! | CHATLOG_UTC_OFFSET_MINUTES | Offset used for partition dates |
//! | CHATLOG_INCLUDE_GROUPS / CHATLOG_EXCLUDE_GROUPS | Comma separated group lists |
//! | CHATLOG_S3_BUCKET / CHATLOG_S3_PREFIX / CHATLOG_S3_ENDPOINT | S3 backend |
//! | CHATLOG_PUBLIC_BASE_URL | Base of returned object URLs |
//! | AWS_ACCESS_KEY_ID / AWS_SECRET_ACCESS_KEY / AWS_REGION | S3 credentials |
//! | RUST_LOG / CHATLOG_LOG_FORMAT | Logging |

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use chatlog_archive::archive::{build_store, ArchiveConfig, ArchiveService, LogRecord, SystemClock};
use chatlog_archive::observability::{init_tracing, LogConfig};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(e) = init_tracing(&LogConfig::from_env()) {
        eprintln!("failed to initialize tracing: {}", e);
        return ExitCode::FAILURE;
    }
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "archiver failed");
            ExitCode::FAILURE
        }
    }
}

fn load_config() -> Result<ArchiveConfig, BoxError> {
    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("CHATLOG_CONFIG").ok())
        .map(PathBuf::from);
    let mut config = match &path {
        Some(path) => ArchiveConfig::load(path)?,
        None => ArchiveConfig::default(),
    };
    config.apply_env()?;
    config.validate()?;
    info!(config = ?path, data_dir = %config.data_dir.display(), "configuration loaded");
    Ok(config)
}

async fn run() -> Result<(), BoxError> {
    let config = load_config()?;
    let clock = Arc::new(SystemClock::new(config.utc_offset()?));
    let store = build_store(&config.store)?;
    let service = ArchiveService::open(config, store, clock).await?;

    let recovered = service.recover_interrupted().await?;
    if !recovered.is_empty() {
        warn!(count = recovered.len(), "uploads interrupted by the previous run will be retried");
    }

    let token = CancellationToken::new();
    let workers = service.spawn_background(token.clone())?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let (mut ingested, mut rejected) = (0u64, 0u64);
    let mut input_open = true;
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("shutdown signal received");
                break;
            }
            line = lines.next_line(), if input_open => match line? {
                Some(line) if line.trim().is_empty() => {}
                Some(line) => match LogRecord::decode_line(&line) {
                    Ok(record) => match service.ingest(record).await {
                        Ok(_) => ingested += 1,
                        Err(e) => {
                            rejected += 1;
                            error!(error = %e, "failed to store record");
                        }
                    },
                    Err(e) => {
                        rejected += 1;
                        warn!(error = %e, "skipping malformed input line");
                    }
                },
                None => {
                    info!(ingested, rejected, "input closed, background work continues until Ctrl+C");
                    input_open = false;
                }
            }
        }
    }

    token.cancel();
    for worker in workers {
        if let Err(e) = worker.await {
            error!(error = %e, "background worker failed");
        }
    }
    service.shutdown().await;
    info!(ingested, rejected, "archiver stopped");
    Ok(())
}

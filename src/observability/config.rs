//! Logging Configuration
//!
//! Loaded from environment variables:
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | RUST_LOG | info | `EnvFilter` directives |
//! | CHATLOG_LOG_FORMAT | text | `text` or `json` |
//! | CHATLOG_SERVICE | chatlog-archive | Service name attached to startup logs |

use std::str::FromStr;

/// Output format of the log subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" | "pretty" | "" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format: {}", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub format: LogFormat,
    /// Filter used when `RUST_LOG` is unset
    pub default_filter: String,
    pub service_name: String,
    pub version: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl LogConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable lookup; unknown formats fall back to text
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        LogConfig {
            format: lookup("CHATLOG_LOG_FORMAT")
                .and_then(|v| v.parse().ok())
                .unwrap_or_default(),
            default_filter: "info".to_string(),
            service_name: lookup("CHATLOG_SERVICE").unwrap_or_else(|| "chatlog-archive".to_string()),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

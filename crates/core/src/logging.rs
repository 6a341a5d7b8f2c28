//! Logging setup for binaries and tests that embed the decoder.
//!
//! Two modes:
//! - Development: pretty-printed human-readable logs
//! - Production: JSON-formatted logs for log aggregation
//!
//! Set `VLM_LOG_FORMAT=json` for JSON logs.
//! Set `RUST_LOG` to control log levels (default: info). Per-step search
//! decisions are logged at `trace` under the `vlm_core` target.

use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
    EnvFilter,
};

pub const LOG_FORMAT_ENV: &str = "VLM_LOG_FORMAT";

/// Log format mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Pretty-printed human-readable logs (default).
    #[default]
    Pretty,
    /// JSON-formatted logs for production.
    Json,
}

impl LogFormat {
    /// Detect log format from environment.
    pub fn from_env() -> Self {
        Self::parse(&std::env::var(LOG_FORMAT_ENV).unwrap_or_default())
    }

    fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "json" => Self::Json,
            _ => Self::Pretty,
        }
    }
}

/// Initialize logging from `RUST_LOG` and `VLM_LOG_FORMAT`.
///
/// Does nothing if a global subscriber is already installed.
pub fn init() {
    let _ = try_init(None, LogFormat::from_env());
}

/// Initialize logging with a fallback level used when `RUST_LOG` is unset
/// (e.g. `"debug"`, `"vlm_core=trace"`).
pub fn init_with_level(level: &str) {
    let _ = try_init(Some(level), LogFormat::from_env());
}

/// Initialize logging with an explicit level and format.
pub fn init_with_level_and_format(level: Option<&str>, format: LogFormat) {
    let _ = try_init(level, format);
}

/// Install the global subscriber, failing if one is already set.
pub fn try_init(level: Option<&str>, format: LogFormat) -> Result<(), TryInitError> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.unwrap_or("info")));

    match format {
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .with_span_events(FmtSpan::CLOSE)
                    .with_current_span(true)
                    .with_target(true)
                    .with_file(true)
                    .with_line_number(true),
            )
            .try_init(),
    }
}

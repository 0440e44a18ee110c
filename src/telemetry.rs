//! Tracing setup for taskbus processes.
//!
//! Installs a `tracing-subscriber` registry once per process. The filter comes
//! from `RUST_LOG` and the output format from `TASKBUS_LOG_FORMAT`.

use std::str::FromStr;
use std::sync::OnceLock;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::error::BusError;

// ============================================================================
// Span Constants
// ============================================================================

/// Span wrapping one handler execution
pub const SPAN_EXECUTE: &str = "taskbus.execute";

/// Environment variable selecting the log format
pub const LOG_FORMAT_ENV: &str = "TASKBUS_LOG_FORMAT";

static INSTALLED: OnceLock<LogFormat> = OnceLock::new();

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "text" | "compact" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(BusError::ConfigError(format!(
                "{}: unknown log format '{}' (expected text or json)",
                LOG_FORMAT_ENV, other
            ))),
        }
    }
}

impl LogFormat {
    /// Format from `TASKBUS_LOG_FORMAT`, text when unset
    pub fn from_env() -> Result<Self, BusError> {
        match std::env::var(LOG_FORMAT_ENV) {
            Ok(raw) => raw.parse(),
            Err(_) => Ok(LogFormat::Text),
        }
    }
}

/// Install the global subscriber using the environment.
///
/// Safe to call multiple times; only the first call takes effect. Returns the
/// format that is active.
pub fn init_tracing() -> Result<LogFormat, BusError> {
    let format = LogFormat::from_env()?;
    Ok(init_tracing_with(format, "info"))
}

/// Install the global subscriber with an explicit format and default filter
/// (used when `RUST_LOG` is unset)
pub fn init_tracing_with(format: LogFormat, default_filter: &str) -> LogFormat {
    *INSTALLED.get_or_init(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
        let registry = tracing_subscriber::registry().with(filter);

        // Another subscriber may already be installed (tests, embedding apps)
        let _ = match format {
            LogFormat::Text => registry.with(fmt::layer().compact()).try_init(),
            LogFormat::Json => registry
                .with(fmt::layer().json().flatten_event(true))
                .try_init(),
        };
        format
    })
}

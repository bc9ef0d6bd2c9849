//! Tracing/logging initialization shared by every binary and test suite.
//!
//! - `RUST_LOG` selects what is recorded (default `info`)
//! - `ACCESSGATE_LOG_FORMAT=json|pretty` selects the output format (default `json`)

use std::str::FromStr;

use anyhow::bail;
use tracing_subscriber::EnvFilter;

pub const ENV_LOG_FORMAT: &str = "ACCESSGATE_LOG_FORMAT";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" => Ok(LogFormat::Pretty),
            other => bail!("unknown log format '{other}' (expected json or pretty)"),
        }
    }
}

fn filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initialize tracing/logging for the process.
///
/// Safe to call multiple times (subsequent calls are no-ops). An unknown
/// `ACCESSGATE_LOG_FORMAT` falls back to JSON with a warning.
pub fn init() {
    let requested = std::env::var(ENV_LOG_FORMAT).ok();
    let parsed = requested.as_deref().map(LogFormat::from_str).transpose();
    let (format, bad_format) = match parsed {
        Ok(format) => (format.unwrap_or_default(), None),
        Err(err) => (LogFormat::default(), Some(err)),
    };

    let installed = match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter())
            .json()
            .with_timer(tracing_subscriber::fmt::time::SystemTime)
            .with_target(false)
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::fmt().with_env_filter(filter()).pretty().try_init(),
    };

    if let (Ok(()), Some(err)) = (installed, bad_format) {
        tracing::warn!("{err:#}; using json logs");
    }
}

/// Route logs through the test harness's captured output.
///
/// Call at the top of any test; only the first call installs a subscriber.
pub fn init_for_tests() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")))
        .with_test_writer()
        .try_init();
}

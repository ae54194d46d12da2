//! Tracing subscriber setup.

use serde::{Deserialize, Serialize};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Pretty,
    /// One JSON object per event.
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directives used when `RUST_LOG` is unset.
    #[serde(default = "default_filter")]
    pub filter: String,

    /// Output format.
    #[serde(default)]
    pub format: LogFormat,

    /// Include the event target (module path).
    #[serde(default = "default_with_target")]
    pub with_target: bool,
}

fn default_filter() -> String {
    "info,courier_jobs=debug".to_string()
}

fn default_with_target() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_filter(),
            format: LogFormat::default(),
            with_target: default_with_target(),
        }
    }
}

/// Install the global tracing subscriber.
///
/// Returns `false` if a subscriber was already installed, which leaves the
/// existing one in place.
pub fn init_tracing(config: &LoggingConfig) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.filter));

    let installed = match config.format {
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(config.with_target))
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(config.with_target),
            )
            .try_init(),
    };

    if installed.is_ok() {
        tracing::info!(format = ?config.format, filter = %config.filter, "Tracing initialized");
    }
    installed.is_ok()
}

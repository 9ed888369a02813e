// Logging
// Installs a tracing-subscriber once per process; `RUST_LOG` applies unless a level is configured

use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static LOGGING_INITIALIZED: OnceLock<()> = OnceLock::new();

const DEFAULT_FILTER: &str = "query_engine=warn";

/// Logging section of the engine configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// "off", "error", "warn", "info", "debug" or "trace"
    pub level: Option<String>,
    /// Log file path; stderr when unset
    pub file: Option<String>,
}

impl LogConfig {
    /// Filter directive for the configured level, if any
    fn directive(&self) -> Option<String> {
        self.level
            .as_deref()
            .map(|level| format!("query_engine={}", level.trim().to_lowercase()))
    }

    fn is_off(&self) -> bool {
        self.level
            .as_deref()
            .is_some_and(|level| level.trim().eq_ignore_ascii_case("off"))
    }
}

/// Initialize the tracing subscriber. Only the first call has any effect.
pub fn init_logging(config: &LogConfig) {
    LOGGING_INITIALIZED.get_or_init(|| {
        if config.is_off() {
            return;
        }

        let filter = match config.directive() {
            Some(directive) => EnvFilter::new(directive),
            None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)),
        };

        match &config.file {
            Some(path) => {
                let file = match std::fs::OpenOptions::new().create(true).append(true).open(path) {
                    Ok(file) => file,
                    Err(e) => {
                        eprintln!("query-engine: failed to open log file {}: {}", path, e);
                        return;
                    }
                };
                tracing_subscriber::registry()
                    .with(filter)
                    .with(fmt::layer().with_writer(file).with_ansi(false))
                    .try_init()
                    .ok();
            }
            None => {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(fmt::layer().with_writer(std::io::stderr))
                    .try_init()
                    .ok();
            }
        }
    });
}

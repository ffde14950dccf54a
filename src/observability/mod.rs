//! Observability and telemetry.
//!
//! Structured logging via `tracing`; counters and histograms are recorded
//! inline at sync and merge sites with the `metrics` macros
//! (`memsync_sync_sessions_total`, `memsync_merge_total`,
//! `memsync_merge_batch_size`). Exporter wiring is left to the embedding
//! application.

use std::sync::OnceLock;
use tracing_subscriber::EnvFilter;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable text.
    #[default]
    Text,
    /// Newline-delimited JSON.
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Default)]
pub struct LoggingConfig {
    /// Output format.
    pub format: LogFormat,
    /// Filter directive, e.g. `memsync=debug`. Falls back to `RUST_LOG`,
    /// then to `info`.
    pub filter: Option<String>,
}

static LOGGING_INIT: OnceLock<()> = OnceLock::new();

/// Initializes the global tracing subscriber. Idempotent.
pub fn init_logging(config: &LoggingConfig) {
    LOGGING_INIT.get_or_init(|| {
        let filter = config.filter.as_ref().map_or_else(
            || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            |directive| EnvFilter::new(directive.clone()),
        );

        let builder = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr);

        let result = match config.format {
            LogFormat::Json => builder.json().try_init(),
            LogFormat::Text => builder.try_init(),
        };
        // A subscriber installed by the host application wins.
        drop(result);
    });
}

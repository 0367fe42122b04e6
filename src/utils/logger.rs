use std::env;
use std::sync::Once;
use tracing::Level;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

/// Output format of the fmt layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable lines
    Plain,
    /// One JSON object per event
    Json,
}

/// Maps a LOGLEVEL value to a level; unknown values fall back to INFO
pub fn parse_level(value: Option<&str>) -> Level {
    match value.map(str::to_uppercase).as_deref() {
        Some("DEBUG") => Level::DEBUG,
        Some("ERROR") => Level::ERROR,
        Some("WARN") => Level::WARN,
        Some("TRACE") => Level::TRACE,
        _ => Level::INFO,
    }
}

/// Maps a LOG_FORMAT value to a format; only `json` selects JSON
pub fn parse_format(value: Option<&str>) -> LogFormat {
    match value {
        Some(v) if v.eq_ignore_ascii_case("json") => LogFormat::Json,
        _ => LogFormat::Plain,
    }
}

/// Sets up the global tracing subscriber once per process
///
/// Environment variables:
/// - LOGLEVEL: Sets the log level (DEBUG, INFO, WARN, ERROR, TRACE)
/// - LOG_FORMAT: `json` for structured output, plain text otherwise
/// - RUST_LOG: Extra per-target directives, merged into the filter
pub fn setup_logger() -> Result<(), Box<dyn std::error::Error>> {
    INIT.call_once(|| {
        let level = parse_level(env::var("LOGLEVEL").ok().as_deref());
        let format = parse_format(env::var("LOG_FORMAT").ok().as_deref());
        let filter = tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into());

        let registry = tracing_subscriber::registry().with(filter);
        let installed = match format {
            LogFormat::Json => registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_target(true)
                        .with_thread_ids(true),
                )
                .try_init(),
            LogFormat::Plain => registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_target(false)
                        .with_thread_ids(true),
                )
                .try_init(),
        };
        if installed.is_err() {
            // Another subscriber (e.g. a test harness) is already global
            return;
        }

        tracing::debug!("Log level set to: {}, format {:?}", level, format);
    });

    Ok(())
}

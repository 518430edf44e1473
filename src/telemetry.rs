//! Tracing subscriber setup.

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use crate::config::{LogFormat, LoggingSection};

/// Environment variable holding a filter directive; wins over the config.
pub const LOG_ENV: &str = "FLOW_LOG";

/// Filter directive: `FLOW_LOG`, then `verbose`, then the configured level.
pub fn filter_directive(logging: &LoggingSection, verbose: bool) -> String {
    match std::env::var(LOG_ENV) {
        Ok(directive) if !directive.trim().is_empty() => directive,
        _ if verbose => "debug".to_string(),
        _ => logging.level.clone(),
    }
}

/// Install the global subscriber. Console output goes to stderr; when
/// `logging.dir` is set a daily-rolling JSON file is written as well. Keep
/// the returned guard alive for the life of the process so buffered file
/// output is flushed.
pub fn init_tracing(logging: &LoggingSection, verbose: bool) -> Result<Option<WorkerGuard>> {
    let directive = filter_directive(logging, verbose);
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match &logging.dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "flow.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().json().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let registry = tracing_subscriber::registry().with(filter).with(file_layer);
    match logging.format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
        LogFormat::Pretty => registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .try_init(),
    }
    .context("Failed to install tracing subscriber")?;

    Ok(guard)
}

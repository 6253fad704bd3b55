//! Tracing initialization
//!
//! File output rotates daily under the configured log directory; stdout gets
//! a human-readable layer unless JSON output is selected. Context fields are
//! attached per log call by the workers, never through globals.

use crate::config::Settings;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

pub fn init_logging(settings: &Settings) -> WorkerGuard {
    let file_appender = tracing_appender::rolling::daily(
        &settings.log.dir,
        format!("{}.log", settings.service_name),
    );

    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.log.level.clone()));

    let registry = tracing_subscriber::registry().with(filter);

    if settings.log.json {
        let file_layer = fmt::layer()
            .json()
            .with_target(true) // Keep target in JSON for structured queries
            .with_writer(non_blocking)
            .with_ansi(false);
        registry.with(file_layer).init();
    } else {
        let file_layer = fmt::layer()
            .with_target(false)
            .with_writer(non_blocking)
            .with_ansi(false);
        let stdout_layer = fmt::layer().with_target(false).with_ansi(true);
        registry.with(file_layer).with(stdout_layer).init();
    }

    guard
}

//! Logging for the registration coordinator
//!
//! Structured `tracing` output with per-component filtering, an optional
//! JSON file layer, run-scoped spans and sinks for the engine output stream.

pub mod config;
pub mod sink;
pub mod spans;

use anyhow::{anyhow, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

pub use config::LoggingConfig;
pub use sink::{CallbackSink, LogSink, MemorySink, TracingSink};
pub use spans::{EvaluationSpan, RunSpan};

const CRATE_TARGET: &str = "image_registration";

/// Filter directives derived from the configuration, one per component.
pub fn filter_directives(config: &LoggingConfig) -> String {
    [
        format!("{}={}", CRATE_TARGET, config.global_level),
        format!("{}::engine={}", CRATE_TARGET, config.get_component_level("engine")),
        format!("{}::registration={}", CRATE_TARGET, config.get_component_level("orchestration")),
        format!("{}::process={}", CRATE_TARGET, config.get_component_level("orchestration")),
        format!("{}::analysis={}", CRATE_TARGET, config.get_component_level("evaluation")),
    ]
    .join(",")
}

/// Initialize the global subscriber.
///
/// `RUST_LOG` overrides the configured levels. The returned guard flushes the
/// JSON file writer and must be held until the program exits.
pub fn init_logging(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    config.validate().map_err(|e| anyhow!(e))?;

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(filter_directives(config)))?;

    let mut layers = Vec::new();

    if config.console_output {
        let console_layer = fmt::layer()
            .with_target(true)
            .with_thread_names(true)
            .with_line_number(config.include_file_location)
            .with_file(config.include_file_location);
        layers.push(console_layer.boxed());
    }

    let mut guard = None;
    if let Some(ref log_dir) = config.log_directory {
        let file_appender = tracing_appender::rolling::daily(log_dir, "registration.log");
        let (non_blocking, worker_guard) = tracing_appender::non_blocking(file_appender);
        guard = Some(worker_guard);

        let file_layer = fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .json();
        layers.push(file_layer.boxed());
    }

    tracing_subscriber::registry()
        .with(env_filter)
        .with(layers)
        .try_init()?;

    tracing::debug!(directives = %filter_directives(config), "Logging initialized");
    Ok(guard)
}

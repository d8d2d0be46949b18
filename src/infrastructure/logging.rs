//! Logging system configuration and initialization
//!
//! - Console output on stderr, so stdout stays free for reports
//! - Optional file output through a non-blocking writer
//! - Optional JSON formatting for the file layer
//! - Verbose dependency targets suppressed unless TRACE is requested
//!
//! Initialization is process-wide and idempotent.

use anyhow::{Result, anyhow};
use once_cell::sync::{Lazy, OnceCell};
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub use crate::infrastructure::config::LoggingConfig;

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

// Keeps file writers flushing for the lifetime of the process
static LOG_GUARDS: Lazy<Mutex<Vec<WorkerGuard>>> = Lazy::new(|| Mutex::new(Vec::new()));
static INITIALIZED: OnceCell<()> = OnceCell::new();

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Directory the log file is written to
#[must_use]
pub fn get_log_directory(config: &LoggingConfig) -> PathBuf {
    config.log_dir.clone().unwrap_or_else(|| {
        std::env::current_dir()
            .unwrap_or_default()
            .join("logs")
    })
}

/// Initialize the logging system with default configuration
pub fn init_logging() -> Result<()> {
    init_logging_with_config(&LoggingConfig::default())
}

/// Builds the filter used when `RUST_LOG` is not set.
///
/// Below TRACE, SQL statements, HTTP client internals and runtime chatter are
/// kept at warn/info. Module filters from the configuration are applied last.
fn default_filter_directives(config: &LoggingConfig) -> String {
    let level = config.level.to_lowercase();
    let mut directives = vec![level.clone()];

    if !level.contains("trace") {
        directives.extend(
            [
                "sqlx::query=warn",
                "sqlx::sqlite=warn",
                "reqwest=info",
                "hyper=warn",
                "hyper_util=warn",
                "h2=warn",
                "rustls=warn",
                "html5ever=warn",
                "selectors=warn",
                "tokio=info",
            ]
            .map(str::to_string),
        );
        directives.push(format!("serp_harvest={level}"));
    }

    let mut module_filters: Vec<_> = config.module_filters.iter().collect();
    module_filters.sort();
    directives.extend(module_filters.into_iter().map(|(module, level)| format!("{module}={level}")));

    directives.join(",")
}

/// Initialize logging with custom configuration
///
/// # Environment Variable Override
/// `RUST_LOG` replaces the configured filter entirely:
/// ```bash
/// RUST_LOG="debug,sqlx::query=debug" serp-harvest --keyword rust
/// ```
pub fn init_logging_with_config(config: &LoggingConfig) -> Result<()> {
    if INITIALIZED.get().is_some() {
        return Ok(());
    }

    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_filter_directives(config))
            .map_err(|e| anyhow!("Invalid log filter configuration: {e}"))?,
    };

    let mut layers: Vec<BoxedLayer> = Vec::new();

    if config.console_output {
        layers.push(
            fmt::Layer::new()
                .with_writer(std::io::stderr)
                .with_timer(ChronoLocal::new(TIME_FORMAT.to_string()))
                .with_target(false)
                .boxed(),
        );
    }

    let log_dir = get_log_directory(config);
    if config.file_output {
        std::fs::create_dir_all(&log_dir)
            .map_err(|e| anyhow!("Failed to create log directory {:?}: {}", log_dir, e))?;

        let (file_writer, file_guard) = non_blocking(rolling::never(&log_dir, &config.file_name));
        LOG_GUARDS
            .lock()
            .map_err(|_| anyhow!("Log guard registry poisoned"))?
            .push(file_guard);

        let file_layer = if config.json_format {
            fmt::Layer::new()
                .json()
                .with_writer(file_writer)
                .with_timer(ChronoLocal::new(TIME_FORMAT.to_string()))
                .with_target(true)
                .with_thread_ids(true)
                .with_ansi(false)
                .boxed()
        } else {
            fmt::Layer::new()
                .with_writer(file_writer)
                .with_timer(ChronoLocal::new(TIME_FORMAT.to_string()))
                .with_target(false)
                .with_ansi(false)
                .boxed()
        };
        layers.push(file_layer);
    }

    if layers.is_empty() {
        return Err(anyhow!("No logging output configured"));
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(env_filter)
        .try_init()
        .map_err(|e| anyhow!("Failed to install global subscriber: {e}"))?;
    let _ = INITIALIZED.set(());

    info!(
        level = %config.level,
        json = config.json_format,
        console = config.console_output,
        file = config.file_output,
        "Logging system initialized"
    );
    if config.file_output {
        info!("Log file: {:?}", log_dir.join(&config.file_name));
    }

    Ok(())
}

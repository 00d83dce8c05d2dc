//! Logging bootstrap shared by AquaWatch services
//!
//! One console layer and an optional daily-rolling file layer, each with its
//! own level filter. `RUST_LOG` overrides the configured level when set.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level or filter directive (e.g. `info`, `alarmsrv=debug,info`)
    pub level: String,
    /// Enable console output
    pub console: bool,
    /// Optional log file path; rotated daily
    pub file: Option<String>,
    /// Output format
    pub format: LogFormat,
    /// Enable ANSI colors in console output
    pub ansi: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
    Compact,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            console: true,
            file: None,
            format: LogFormat::Compact,
            ansi: true,
        }
    }
}

fn build_filter(level: &str) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(level)
        .or_else(|_| EnvFilter::try_new("info"))
        .map_err(|e| Error::config(format!("Invalid log level: {}", e)))
}

/// Initialize logging with the given configuration
///
/// Returns a guard that must be kept alive for file logging to work.
/// Calling this twice is an error (the global subscriber is already set).
pub fn init_logging(config: &LogConfig) -> Result<Option<WorkerGuard>> {
    let mut layers = Vec::new();
    let mut guard = None;

    if config.console {
        let filter = build_filter(&config.level)?;
        let console_layer = match config.format {
            LogFormat::Json => fmt::layer()
                .json()
                .with_ansi(false)
                .with_target(true)
                .boxed(),
            LogFormat::Pretty => fmt::layer()
                .pretty()
                .with_ansi(config.ansi)
                .with_target(true)
                .with_thread_names(true)
                .boxed(),
            LogFormat::Compact => fmt::layer()
                .compact()
                .with_ansi(config.ansi)
                .with_target(true)
                .boxed(),
        };
        layers.push(console_layer.with_filter(filter).boxed());
    }

    if let Some(file_path) = &config.file {
        let filter = build_filter(&config.level)?;
        let path = Path::new(file_path);
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir)?;

        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("alarmsrv.log");
        let appender = tracing_appender::rolling::daily(dir, file_name);
        let (non_blocking, file_guard) = tracing_appender::non_blocking(appender);
        guard = Some(file_guard);

        let file_layer = match config.format {
            LogFormat::Json => fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true)
                .boxed(),
            LogFormat::Pretty | LogFormat::Compact => fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true)
                .boxed(),
        };
        layers.push(file_layer.with_filter(filter).boxed());
    }

    tracing_subscriber::registry()
        .with(layers)
        .try_init()
        .map_err(|e| Error::config(format!("Failed to initialize logging: {}", e)))?;

    Ok(guard)
}

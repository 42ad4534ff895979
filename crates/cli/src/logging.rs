// Console + rotated-file tracing setup for the launcher.

use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

pub const LOG_FILE_PREFIX: &str = "launch.log";

#[derive(Debug, Clone, Default)]
pub struct LoggingOptions {
    /// `--log-level`
    pub cli_level: Option<String>,
    /// `logging.level` from the config file.
    pub config_level: Option<String>,
    pub quiet: bool,
    /// Directory for the rotated debug log; `None` disables it.
    pub file_dir: Option<PathBuf>,
    pub retain_files: usize,
}

/// Console filter precedence: `--quiet`, `--log-level`, `RUST_LOG`, config, then `warn`.
pub fn console_filter(options: &LoggingOptions, rust_log: Option<&str>) -> EnvFilter {
    if options.quiet {
        return EnvFilter::new("error");
    }
    if let Some(level) = options.cli_level.as_deref() {
        return level_filter(level);
    }
    if let Some(directives) = rust_log.filter(|d| !d.trim().is_empty()) {
        if let Ok(filter) = EnvFilter::try_new(directives) {
            return filter;
        }
        eprintln!("Warning: Invalid RUST_LOG '{}', ignoring", directives);
    }
    options
        .config_level
        .as_deref()
        .map(level_filter)
        .unwrap_or_else(|| EnvFilter::new("warn"))
}

fn level_filter(level: &str) -> EnvFilter {
    match level.to_lowercase().as_str() {
        "off" => EnvFilter::new("off"),
        "error" => EnvFilter::new("error"),
        "warn" | "warning" => EnvFilter::new("warn"),
        "info" => EnvFilter::new("info"),
        "debug" => EnvFilter::new("debug"),
        "trace" => EnvFilter::new("trace"),
        _ => {
            eprintln!("Warning: Invalid log level '{}', using 'warn'", level);
            EnvFilter::new("warn")
        }
    }
}

/// Install the global subscriber. Keep the returned guard alive until exit so
/// buffered file output is flushed.
pub fn init_logging(options: &LoggingOptions) -> Result<Option<WorkerGuard>> {
    let rust_log = std::env::var("RUST_LOG").ok();
    let console = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(console_filter(options, rust_log.as_deref()));

    let (file_layer, guard) = match &options.file_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create log directory {}", dir.display()))?;
            let appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .filename_prefix(LOG_FILE_PREFIX)
                .max_log_files(options.retain_files.max(1))
                .build(dir)
                .context("failed to create rolling log file")?;
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(LevelFilter::DEBUG);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(console)
        .with(file_layer)
        .try_init()
        .context("failed to install tracing subscriber")?;

    Ok(guard)
}

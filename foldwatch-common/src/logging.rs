//! Tracing subscriber setup shared by foldwatch binaries.
//!
//! Builds a `tracing_subscriber::registry()` with an `EnvFilter`, a console
//! layer (compact or JSON) and an optional daily-rolling log file.

use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Output format for the console layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Filter directive (e.g. `info`, `foldwatchd=debug`).
    pub level: String,
    /// Console output format.
    pub format: LogFormat,
    /// Write console output to stderr instead of stdout.
    pub stderr: bool,
    /// Directory for a daily-rolling log file, if any.
    pub file_dir: Option<PathBuf>,
    /// File name prefix for the rolling log.
    pub file_prefix: String,
}

impl LogConfig {
    /// Start from `FOLDWATCH_LOG` (or `RUST_LOG`), falling back to `default_level`.
    pub fn from_env(default_level: &str) -> Self {
        let level = std::env::var("FOLDWATCH_LOG")
            .or_else(|_| std::env::var("RUST_LOG"))
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| default_level.to_string());

        let format = match std::env::var("FOLDWATCH_LOG_FORMAT").as_deref() {
            Ok("json") => LogFormat::Json,
            _ => LogFormat::Compact,
        };

        Self {
            level,
            format,
            stderr: false,
            file_dir: None,
            file_prefix: "foldwatch.log".to_string(),
        }
    }

    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    pub fn with_stderr(mut self) -> Self {
        self.stderr = true;
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_file_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.file_dir = Some(dir.into());
        self
    }
}

/// Guards that must stay alive for buffered log output to be flushed.
#[must_use = "dropping the guards stops background log writers"]
pub struct LoggingGuards {
    _file: Option<WorkerGuard>,
}

/// Install the global subscriber described by `config`.
pub fn init_logging(config: &LogConfig) -> anyhow::Result<LoggingGuards> {
    let filter = EnvFilter::try_new(&config.level).unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, file_guard) = match &config.file_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::daily(dir, &config.file_prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .json()
                .with_writer(writer)
                .with_target(true)
                .with_thread_ids(true);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let registry = tracing_subscriber::registry().with(filter).with(file_layer);

    match (config.format, config.stderr) {
        (LogFormat::Json, true) => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()?,
        (LogFormat::Json, false) => registry.with(fmt::layer().json()).try_init()?,
        (LogFormat::Compact, true) => registry
            .with(fmt::layer().compact().with_writer(std::io::stderr))
            .try_init()?,
        (LogFormat::Compact, false) => registry.with(fmt::layer().compact()).try_init()?,
    }

    Ok(LoggingGuards { _file: file_guard })
}

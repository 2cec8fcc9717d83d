//! Logging initialization
//!
//! One tracing setup shared by every silo binary: console and/or
//! daily-rotated file output, text or JSON lines, configured through the
//! `LOG_*` environment variables. Components log through the `tracing`
//! macros only; nothing in the workspace prints directly.
//!
//! # Example
//!
//! ```no_run
//! use silo_common::logging::{init_logging, LogConfig};
//! use tracing::info;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = LogConfig::from_env()?;
//!     init_logging(&config)?;
//!     info!("Application started");
//!     Ok(())
//! }
//! ```

use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Where log lines go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogOutput {
    #[default]
    Console,
    File,
    Both,
}

/// How log lines are rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Minimum level to emit.
    pub level: Level,
    pub output: LogOutput,
    pub format: LogFormat,
    /// Directory for log files when file output is enabled.
    pub log_dir: PathBuf,
    /// File name prefix, e.g. "silo" -> "silo.2026-08-04.log".
    pub log_file_prefix: String,
    /// Extra filter directives, e.g. "sqlx=warn".
    pub filter_directives: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            output: LogOutput::Console,
            format: LogFormat::Text,
            log_dir: PathBuf::from("./logs"),
            log_file_prefix: "silo".to_string(),
            filter_directives: None,
        }
    }
}

impl LogConfig {
    /// Read configuration from `LOG_LEVEL`, `LOG_OUTPUT`, `LOG_FORMAT`,
    /// `LOG_DIR`, `LOG_FILE_PREFIX`, and `LOG_FILTER`.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(level) = std::env::var("LOG_LEVEL") {
            config.level = level
                .parse()
                .map_err(|_| anyhow::anyhow!("Invalid log level: {}", level))?;
        }
        if let Ok(output) = std::env::var("LOG_OUTPUT") {
            config.output = parse_output(&output)?;
        }
        if let Ok(format) = std::env::var("LOG_FORMAT") {
            config.format = parse_format(&format)?;
        }
        if let Ok(dir) = std::env::var("LOG_DIR") {
            config.log_dir = PathBuf::from(dir);
        }
        if let Ok(prefix) = std::env::var("LOG_FILE_PREFIX") {
            config.log_file_prefix = prefix;
        }
        if let Ok(filter) = std::env::var("LOG_FILTER") {
            config.filter_directives = Some(filter);
        }

        Ok(config)
    }
}

fn parse_output(raw: &str) -> Result<LogOutput> {
    match raw.to_lowercase().as_str() {
        "console" | "stdout" => Ok(LogOutput::Console),
        "file" => Ok(LogOutput::File),
        "both" | "all" => Ok(LogOutput::Both),
        _ => bail!("Invalid log output: {}", raw),
    }
}

fn parse_format(raw: &str) -> Result<LogFormat> {
    match raw.to_lowercase().as_str() {
        "text" | "pretty" => Ok(LogFormat::Text),
        "json" => Ok(LogFormat::Json),
        _ => bail!("Invalid log format: {}", raw),
    }
}

/// The subscriber stack the output layers attach to.
type FilteredRegistry =
    tracing_subscriber::layer::Layered<EnvFilter, tracing_subscriber::Registry>;

/// Initialize logging with the given configuration
///
/// Sets up the global tracing subscriber. Call once at application startup.
pub fn init_logging(config: &LogConfig) -> Result<()> {
    let mut filter = EnvFilter::from_default_env().add_directive(config.level.into());

    if let Some(ref directives) = config.filter_directives {
        for directive in directives.split(',') {
            filter = filter.add_directive(
                directive
                    .parse()
                    .context("Failed to parse filter directive")?,
            );
        }
    }

    let mut layers: Vec<Box<dyn Layer<FilteredRegistry> + Send + Sync>> = Vec::new();

    if matches!(config.output, LogOutput::Console | LogOutput::Both) {
        let layer = fmt::layer()
            .with_writer(std::io::stdout)
            .with_span_events(FmtSpan::CLOSE);
        match config.format {
            LogFormat::Text => layers.push(layer.boxed()),
            LogFormat::Json => layers.push(layer.json().boxed()),
        }
    }

    if matches!(config.output, LogOutput::File | LogOutput::Both) {
        std::fs::create_dir_all(&config.log_dir).context("Failed to create log directory")?;

        let file_appender =
            tracing_appender::rolling::daily(&config.log_dir, &config.log_file_prefix);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        // The guard must outlive the program for buffered lines to flush;
        // leak it since logging lives until process exit.
        std::mem::forget(guard);

        let layer = fmt::layer()
            .with_writer(non_blocking)
            .with_span_events(FmtSpan::CLOSE)
            .with_ansi(false);
        match config.format {
            LogFormat::Text => layers.push(layer.boxed()),
            LogFormat::Json => layers.push(layer.json().boxed()),
        }
    }

    tracing_subscriber::registry()
        .with(filter)
        .with(layers)
        .try_init()?;

    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_output() {
        assert_eq!(parse_output("console").unwrap(), LogOutput::Console);
        assert_eq!(parse_output("stdout").unwrap(), LogOutput::Console);
        assert_eq!(parse_output("FILE").unwrap(), LogOutput::File);
        assert_eq!(parse_output("both").unwrap(), LogOutput::Both);
        assert!(parse_output("syslog").is_err());
    }

    #[test]
    fn test_parse_format() {
        assert_eq!(parse_format("text").unwrap(), LogFormat::Text);
        assert_eq!(parse_format("pretty").unwrap(), LogFormat::Text);
        assert_eq!(parse_format("Json").unwrap(), LogFormat::Json);
        assert!(parse_format("xml").is_err());
    }

    #[test]
    fn test_default_config() {
        let config = LogConfig::default();
        assert_eq!(config.level, Level::INFO);
        assert_eq!(config.output, LogOutput::Console);
        assert_eq!(config.format, LogFormat::Text);
        assert_eq!(config.log_file_prefix, "silo");
    }
}

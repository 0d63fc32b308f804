//! Tracing subscriber setup.
//!
//! Log records go to stderr, and additionally to the file named by the `log`
//! config key when one is set. The format is human-readable text by default or
//! one JSON object per line when `log_format` is `json`.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::{ConfigStore, DEFAULT_LOG_FILTER, DEFAULT_LOG_FORMAT};

/// Permissions for newly created log files
pub const LOG_FILE_MODE: u32 = 0o640;

/// Output format for log records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl LogFormat {
    /// Anything other than `json` falls back to text.
    pub fn parse(value: &str) -> Self {
        if value.eq_ignore_ascii_case("json") {
            LogFormat::Json
        } else {
            LogFormat::Text
        }
    }
}

/// Logging settings derived from the active configuration.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub filter: String,
    pub format: LogFormat,
    pub file: Option<String>,
}

impl LoggingConfig {
    /// Build settings with priority: CLI > RUST_LOG > default for the filter,
    /// and the `log` / `log_format` config keys for the sinks.
    pub fn from_config(config: &ConfigStore, cli_filter: Option<String>) -> Self {
        let filter = cli_filter
            .or_else(|| std::env::var("RUST_LOG").ok())
            .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());

        let format = match config.config("log_format") {
            f if f.is_empty() => LogFormat::parse(DEFAULT_LOG_FORMAT),
            f => LogFormat::parse(&f),
        };

        let file = Some(config.config("log")).filter(|p| !p.is_empty());

        Self {
            filter,
            format,
            file,
        }
    }
}

/// Open (creating if needed) a log file for appending.
pub fn open_log_file<P: AsRef<Path>>(path: P) -> io::Result<File> {
    let path = path.as_ref();
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let mut options = OpenOptions::new();
    options.append(true).create(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(LOG_FILE_MODE);
    }
    options.open(path)
}

/// Install the global tracing subscriber.
pub fn init(config: &LoggingConfig) -> io::Result<()> {
    let file = config.file.as_deref().map(open_log_file).transpose()?.map(Arc::new);

    let stderr_layer = match config.format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_writer(io::stderr)
            .boxed(),
        LogFormat::Text => tracing_subscriber::fmt::layer()
            .with_writer(io::stderr)
            .boxed(),
    };

    let file_layer = file.map(|file| match config.format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_ansi(false)
            .with_writer(file)
            .boxed(),
        LogFormat::Text => tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(file)
            .boxed(),
    });

    tracing_subscriber::registry()
        .with(EnvFilter::new(&config.filter))
        .with(stderr_layer)
        .with(file_layer)
        .init();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigFile, Environment};

    #[test]
    fn test_format_parse() {
        assert_eq!(LogFormat::parse("json"), LogFormat::Json);
        assert_eq!(LogFormat::parse("JSON"), LogFormat::Json);
        assert_eq!(LogFormat::parse("text"), LogFormat::Text);
        assert_eq!(LogFormat::parse("xml"), LogFormat::Text);
    }

    #[test]
    fn test_from_config_reads_keys() {
        let file = ConfigFile::parse(
            r#"{"production": {"log": "log/production.log", "log_format": "json"}}"#,
        )
        .unwrap();
        let store = ConfigStore::new(Environment::Production, file);
        let config = LoggingConfig::from_config(&store, Some("debug".to_string()));
        assert_eq!(config.filter, "debug");
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.file.as_deref(), Some("log/production.log"));
    }

    #[test]
    fn test_from_config_defaults() {
        let store = ConfigStore::new(Environment::Development, ConfigFile::default());
        let config = LoggingConfig::from_config(&store, Some("info".to_string()));
        assert_eq!(config.format, LogFormat::Text);
        assert!(config.file.is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_log_file_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log").join("development.log");
        let file = open_log_file(&path).unwrap();
        drop(file);

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        // umask may only remove bits
        assert_eq!(mode & 0o777 & !LOG_FILE_MODE, 0);
        assert!(path.exists());
    }
}

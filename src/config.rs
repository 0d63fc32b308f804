//! Configuration loading and constants.
//!
//! Loads the environment-keyed configuration from `secrets/fragmenta.json`
//! and exposes typed getters over the active mapping. The environment is
//! selected once, from `FRAG_ENV`, and never changes for the lifetime of the
//! store.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use const_format::formatcp;
use serde::Deserialize;

// =============================================================================
// Default Paths and Strings
// =============================================================================

/// Directory holding the config file and the ACME certificate cache
pub const SECRETS_DIR: &str = "secrets";

/// Default configuration file path, relative to the working directory
pub const DEFAULT_CONFIG_PATH: &str = formatcp!("{}/fragmenta.json", SECRETS_DIR);

/// Environment variable selecting the active configuration
pub const ENV_VAR: &str = "FRAG_ENV";

/// Port used when neither the config nor the command line sets one
pub const DEFAULT_PORT: u16 = 3000;

/// Default log filter when RUST_LOG is not set
pub const DEFAULT_LOG_FILTER: &str = "fragmenta_server=info,tower_http=info";

/// Default log format (text or json)
pub const DEFAULT_LOG_FORMAT: &str = "text";

/// Literal value `config_bool` treats as true
pub const TRUTHY: &str = "yes";

// =============================================================================
// Listener Timeouts
// =============================================================================

/// Time allowed for a client to send the request headers
pub const READ_HEADER_TIMEOUT_SECS: u64 = 30;

/// Time allowed for reading the whole request
pub const READ_TIMEOUT_SECS: u64 = 60;

/// Time allowed for producing and writing the response
pub const WRITE_TIMEOUT_SECS: u64 = 60;

/// Time an idle keep-alive connection is held open
pub const IDLE_TIMEOUT_SECS: u64 = 10;

/// Connection and request timeouts applied to every listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub read_header: Duration,
    pub read: Duration,
    pub write: Duration,
    pub idle: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            read_header: Duration::from_secs(READ_HEADER_TIMEOUT_SECS),
            read: Duration::from_secs(READ_TIMEOUT_SECS),
            write: Duration::from_secs(WRITE_TIMEOUT_SECS),
            idle: Duration::from_secs(IDLE_TIMEOUT_SECS),
        }
    }
}

impl Timeouts {
    /// Upper bound on the time a single request may spend in the service.
    pub fn request_budget(&self) -> Duration {
        self.read.max(self.write)
    }
}

/// Which configuration block is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    #[default]
    Development,
    Production,
}

impl Environment {
    /// Select the environment from the raw value of `FRAG_ENV`.
    ///
    /// Only the exact string `production` selects production; anything else,
    /// including an unset variable, selects development.
    pub fn from_env_value(value: Option<&str>) -> Self {
        match value {
            Some("production") => Environment::Production,
            _ => Environment::Development,
        }
    }

    /// Read `FRAG_ENV` from the process environment.
    pub fn from_env() -> Self {
        Self::from_env_value(std::env::var(ENV_VAR).ok().as_deref())
    }

    /// Capitalised label, as reported by `mode()`.
    pub fn label(&self) -> &'static str {
        match self {
            Environment::Production => "Production",
            Environment::Development => "Development",
        }
    }
}

/// On-disk layout of `fragmenta.json`.
///
/// Unknown top-level keys are ignored; missing blocks deserialize as empty maps.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub development: HashMap<String, String>,
    #[serde(default)]
    pub production: HashMap<String, String>,
    #[serde(default)]
    pub test: Option<HashMap<String, String>>,
}

impl ConfigFile {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Load {
            path: path.display().to_string(),
            source: e.into(),
        })?;
        Self::parse(&contents).map_err(|e| ConfigError::Load {
            path: path.display().to_string(),
            source: e.into(),
        })
    }

    pub fn parse(contents: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(contents)
    }
}

/// Read-only store of the development and production mappings.
#[derive(Debug, Clone, Default)]
pub struct ConfigStore {
    environment: Environment,
    development: HashMap<String, String>,
    production: HashMap<String, String>,
    test: Option<HashMap<String, String>>,
}

impl ConfigStore {
    pub fn new(environment: Environment, file: ConfigFile) -> Self {
        Self {
            environment,
            development: file.development,
            production: file.production,
            test: file.test,
        }
    }

    /// Load the store from a config file for the given environment.
    pub fn load<P: AsRef<Path>>(environment: Environment, path: P) -> Result<Self, ConfigError> {
        Ok(Self::new(environment, ConfigFile::load(path)?))
    }

    pub fn environment(&self) -> Environment {
        self.environment
    }

    pub fn production(&self) -> bool {
        self.environment == Environment::Production
    }

    /// "Production" or "Development"
    pub fn mode(&self) -> &'static str {
        self.environment.label()
    }

    /// The active mapping.
    pub fn configuration(&self) -> &HashMap<String, String> {
        match self.environment {
            Environment::Production => &self.production,
            Environment::Development => &self.development,
        }
    }

    /// The optional `test` mapping, never selected as active.
    pub fn test_configuration(&self) -> Option<&HashMap<String, String>> {
        self.test.as_ref()
    }

    /// Value for `key` in the active mapping, or an empty string.
    pub fn config(&self, key: &str) -> String {
        self.configuration().get(key).cloned().unwrap_or_default()
    }

    /// Value for `key` parsed as base-10, or 0 when absent or unparseable.
    pub fn config_int(&self, key: &str) -> i64 {
        self.try_config_int(key).ok().flatten().unwrap_or(0)
    }

    /// Like [`config_int`](Self::config_int) but surfaces parse failures.
    pub fn try_config_int(&self, key: &str) -> Result<Option<i64>, ConfigError> {
        match self.configuration().get(key) {
            None => Ok(None),
            Some(v) if v.is_empty() => Ok(None),
            Some(v) => v.parse::<i64>().map(Some).map_err(|e| ConfigError::Parse {
                key: key.to_string(),
                value: v.clone(),
                reason: e.to_string(),
            }),
        }
    }

    /// True iff the raw value is exactly `"yes"`.
    pub fn config_bool(&self, key: &str) -> bool {
        self.configuration().get(key).map(String::as_str) == Some(TRUTHY)
    }

    /// Port from the active mapping, if one is set.
    pub fn port(&self) -> Result<Option<u16>, ConfigError> {
        match self.configuration().get("port") {
            None => Ok(None),
            Some(v) if v.is_empty() => Ok(None),
            Some(v) => v.parse::<u16>().map(Some).map_err(|e| ConfigError::Parse {
                key: "port".to_string(),
                value: v.clone(),
                reason: e.to_string(),
            }),
        }
    }
}

/// Resolve the listening port: command line over config over default.
pub fn resolve_port(config_port: Option<u16>, cli_port: Option<u16>) -> u16 {
    cli_port
        .filter(|p| *p > 0)
        .or(config_port)
        .unwrap_or(DEFAULT_PORT)
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Error opening config {path}: {source}")]
    Load {
        path: String,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("Error reading {key} value {value:?}: {reason}")]
    Parse {
        key: String,
        value: String,
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(environment: Environment, json: &str) -> ConfigStore {
        ConfigStore::new(environment, ConfigFile::parse(json).unwrap())
    }

    const SAMPLE: &str = r#"{
        "development": {"port": "5000", "hmac_key": "dev-key", "debug": "yes", "count": "42"},
        "production": {"port": "4000", "hmac_key": "prod-key", "debug": "true"},
        "test": {"port": "3001"},
        "staging": {"ignored": "value"}
    }"#;

    #[test]
    fn test_environment_selection() {
        assert_eq!(Environment::from_env_value(Some("production")), Environment::Production);
        assert_eq!(Environment::from_env_value(Some("Production")), Environment::Development);
        assert_eq!(Environment::from_env_value(Some("production ")), Environment::Development);
        assert_eq!(Environment::from_env_value(Some("")), Environment::Development);
        assert_eq!(Environment::from_env_value(None), Environment::Development);
    }

    #[test]
    fn test_mode_labels() {
        assert_eq!(store(Environment::Production, SAMPLE).mode(), "Production");
        assert!(store(Environment::Production, SAMPLE).production());
        assert_eq!(store(Environment::Development, SAMPLE).mode(), "Development");
        assert!(!store(Environment::Development, SAMPLE).production());
    }

    #[test]
    fn test_active_mapping_follows_environment() {
        assert_eq!(store(Environment::Production, SAMPLE).config("hmac_key"), "prod-key");
        assert_eq!(store(Environment::Development, SAMPLE).config("hmac_key"), "dev-key");
        assert_eq!(store(Environment::Development, SAMPLE).config("missing"), "");
    }

    #[test]
    fn test_config_bool_only_accepts_yes() {
        let dev = store(Environment::Development, SAMPLE);
        assert!(dev.config_bool("debug"));
        assert!(!dev.config_bool("missing"));

        let s = store(
            Environment::Development,
            r#"{"development": {"a": "true", "b": "1", "c": "YES", "d": "yes "}}"#,
        );
        for key in ["a", "b", "c", "d"] {
            assert!(!s.config_bool(key), "{key} should be false");
        }
    }

    #[test]
    fn test_config_int() {
        let dev = store(Environment::Development, SAMPLE);
        assert_eq!(dev.config_int("count"), 42);
        assert_eq!(dev.config_int("hmac_key"), 0);
        assert_eq!(dev.config_int("missing"), 0);
    }

    #[test]
    fn test_try_config_int_surfaces_errors() {
        let dev = store(Environment::Development, SAMPLE);
        assert_eq!(dev.try_config_int("count").unwrap(), Some(42));
        assert_eq!(dev.try_config_int("missing").unwrap(), None);
        assert!(matches!(
            dev.try_config_int("hmac_key"),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_missing_blocks_are_empty() {
        let s = store(Environment::Production, r#"{"development": {"port": "1"}}"#);
        assert!(s.configuration().is_empty());
        assert!(s.test_configuration().is_none());
    }

    #[test]
    fn test_test_block_is_kept_but_never_active() {
        let s = store(Environment::Development, SAMPLE);
        assert_eq!(s.test_configuration().unwrap().get("port").unwrap(), "3001");
        assert_eq!(s.config("port"), "5000");
    }

    #[test]
    fn test_port_precedence() {
        let s = store(Environment::Development, SAMPLE);
        let config_port = s.port().unwrap();
        assert_eq!(resolve_port(config_port, Some(6000)), 6000);
        assert_eq!(resolve_port(config_port, None), 5000);
        assert_eq!(resolve_port(None, None), DEFAULT_PORT);
        assert_eq!(resolve_port(config_port, Some(0)), 5000);
    }

    #[test]
    fn test_bad_port_is_parse_error() {
        let s = store(Environment::Development, r#"{"development": {"port": "http"}}"#);
        assert!(matches!(s.port(), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_load_missing_file() {
        let err = ConfigStore::load(Environment::Development, "/nonexistent/fragmenta.json")
            .unwrap_err();
        assert!(matches!(err, ConfigError::Load { .. }));
    }

    #[test]
    fn test_load_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fragmenta.json");
        std::fs::write(&path, "{ not json").unwrap();
        let err = ConfigStore::load(Environment::Development, &path).unwrap_err();
        assert!(matches!(err, ConfigError::Load { .. }));
        assert!(err.to_string().contains("fragmenta.json"));
    }

    #[test]
    fn test_default_timeouts() {
        let t = Timeouts::default();
        assert_eq!(t.read_header, Duration::from_secs(30));
        assert_eq!(t.read, Duration::from_secs(60));
        assert_eq!(t.write, Duration::from_secs(60));
        assert_eq!(t.idle, Duration::from_secs(10));
        assert_eq!(t.request_budget(), Duration::from_secs(60));
    }
}

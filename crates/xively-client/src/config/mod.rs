//! Client configuration.
//!
//! Supports configuration from:
//! - TOML file (default: `xively.toml`)
//! - Environment variables with `XIVELY__` prefix (double underscore for nesting)
//! - In-file variable substitution: `${VAR}` or `${VAR:-default}`
//!
//! Environment variable examples:
//! - `XIVELY__CONNECTION__HOST=broker.example.com`
//! - `XIVELY__LIMITS__MAX_PUBS_IN_FLIGHT=4`
//!
//! In-file substitution example:
//! ```toml
//! [connection]
//! host = "${XI_HOST:-broker.xively.com}"
//! ```

mod backoff;
mod connection;
mod limits;
mod log;
mod sft;
mod tls;

use std::path::Path;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

pub use backoff::{BackoffConfig, DEFAULT_BACKOFF_LUT, DEFAULT_DECAY_LUT};
pub use connection::{
    ConnectionConfig, DEFAULT_CONNECTION_TIMEOUT, DEFAULT_HOST, DEFAULT_KEEPALIVE_TIMEOUT,
    DEFAULT_NETWORK_TIMEOUT_MS, DEFAULT_PORT,
};
pub use limits::{
    LimitsConfig, DEFAULT_MAX_CONTEXTS, DEFAULT_MAX_EVENTS, DEFAULT_MAX_PACKET_SIZE,
    DEFAULT_MAX_PUBLISH_RETRIES, DEFAULT_MAX_PUBS_IN_FLIGHT, DEFAULT_MAX_TIMED_TASKS,
};
pub use self::log::LogConfig;
pub use sft::{SftConfig, DEFAULT_CHUNK_SIZE};
pub use tls::TlsConfig;

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let Ok(re) = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}") else {
        return content.to_string();
    };
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging configuration.
    pub log: LogConfig,
    /// Broker connection defaults.
    pub connection: ConnectionConfig,
    /// Resource limits.
    pub limits: LimitsConfig,
    /// Reconnect backoff tables.
    pub backoff: BackoffConfig,
    /// Control-topic file transfer.
    pub sft: SftConfig,
    /// TLS configuration.
    pub tls: TlsConfig,
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file.
    Io(std::io::Error),
    /// Config parsing/loading error.
    Config(config::ConfigError),
    /// Invalid configuration value.
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// A missing file is not an error: defaults and `XIVELY__*` variables
    /// still apply.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .set_default("log.level", "info")?
            .set_default("connection.host", DEFAULT_HOST)?
            .set_default("connection.port", DEFAULT_PORT as i64)?
            .set_default(
                "connection.keepalive_timeout",
                DEFAULT_KEEPALIVE_TIMEOUT as i64,
            )?
            .set_default(
                "connection.connection_timeout",
                DEFAULT_CONNECTION_TIMEOUT as i64,
            )?
            .set_default("connection.session", "clean")?
            .set_default("connection.use_tls", true)?
            .set_default("connection.auto_reconnect", false)?
            .set_default(
                "connection.network_timeout_ms",
                DEFAULT_NETWORK_TIMEOUT_MS as i64,
            )?
            .set_default(
                "limits.max_pubs_in_flight",
                DEFAULT_MAX_PUBS_IN_FLIGHT as i64,
            )?
            .set_default(
                "limits.max_publish_retries",
                DEFAULT_MAX_PUBLISH_RETRIES as i64,
            )?
            .set_default("limits.max_timed_tasks", DEFAULT_MAX_TIMED_TASKS as i64)?
            .set_default("limits.max_contexts", DEFAULT_MAX_CONTEXTS as i64)?
            .set_default("limits.max_events", DEFAULT_MAX_EVENTS as i64)?
            .set_default("sft.enabled", false)?
            .set_default("sft.chunk_size", DEFAULT_CHUNK_SIZE as i64)?
            .set_default("sft.accept_download_link", false)?;

        let path = path.as_ref();
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let substituted = substitute_env_vars(&content);
            builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
        }

        let cfg = builder
            .add_source(
                Environment::with_prefix("XIVELY")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let substituted = substitute_env_vars(content);
        let config: Config = toml::from_str(&substituted)
            .map_err(|e| ConfigError::Validation(format!("TOML parse error: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.log.validate().map_err(ConfigError::Validation)?;
        self.connection.validate().map_err(ConfigError::Validation)?;
        self.limits.validate().map_err(ConfigError::Validation)?;
        self.backoff.validate().map_err(ConfigError::Validation)?;
        self.sft.validate().map_err(ConfigError::Validation)?;
        self.tls.validate().map_err(ConfigError::Validation)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::connection::SessionType;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.log.level, "info");
        assert_eq!(config.connection.port, DEFAULT_PORT);
        assert!(!config.connection.auto_reconnect);
    }

    #[test]
    fn test_parse_toml() {
        let toml = r#"
[log]
level = "debug"

[connection]
host = "localhost"
port = 1883
keepalive_timeout = 30
session = "continue"
use_tls = false

[limits]
max_pubs_in_flight = 4

[backoff]
lut = [1, 2, 3]
decay_lut = [5, 5, 5]

[sft]
enabled = true
updateable_files = ["firmware.bin", "config.json"]
"#;
        let config = Config::parse(toml).unwrap();
        assert_eq!(config.log.level, "debug");
        assert_eq!(config.connection.host, "localhost");
        assert_eq!(config.connection.port, 1883);
        assert_eq!(config.connection.keepalive_timeout, 30);
        assert_eq!(config.connection.session, SessionType::Continue);
        assert!(!config.connection.use_tls);
        assert_eq!(config.limits.max_pubs_in_flight, 4);
        assert_eq!(config.backoff.lut, vec![1, 2, 3]);
        assert!(config.sft.enabled);
        assert_eq!(config.sft.updateable_files.len(), 2);
        assert_eq!(config.sft.chunk_size, DEFAULT_CHUNK_SIZE);
    }

    #[test]
    fn test_parse_rejects_mismatched_backoff() {
        let toml = r#"
[backoff]
lut = [1, 2, 3]
decay_lut = [5]
"#;
        assert!(matches!(
            Config::parse(toml),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn test_env_var_substitution_with_default() {
        std::env::remove_var("XI_TEST_NONEXISTENT_HOST");
        let content = r#"host = "${XI_TEST_NONEXISTENT_HOST:-localhost}""#;
        let substituted = substitute_env_vars(content);
        assert!(substituted.contains("localhost"));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[connection]\nhost = \"example.org\"\nport = 1884").unwrap();
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.connection.host, "example.org");
        assert_eq!(config.connection.port, 1884);
        assert_eq!(config.limits.max_contexts, DEFAULT_MAX_CONTEXTS);
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.connection.keepalive_timeout, DEFAULT_KEEPALIVE_TIMEOUT);
    }
}

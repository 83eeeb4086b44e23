//! Client log filter.

use std::str::FromStr;

use ::log::LevelFilter;
use serde::Deserialize;

/// Logging configuration.
///
/// `level` is handed to `env_logger` as its default filter, so it takes the
/// same directives as `RUST_LOG`: a bare level (`debug`) and/or
/// comma separated `module=level` pairs, for example
/// `warn,xively_client::layer=trace`, optionally followed by `/regex` to keep
/// only matching messages. `RUST_LOG` still wins when it is set.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl LogConfig {
    /// The filter to pass to `env_logger`.
    pub fn filter(&self) -> &str {
        &self.level
    }

    /// Reject directives `env_logger` would silently ignore.
    pub fn validate(&self) -> Result<(), String> {
        let directives = self.level.split_once('/').map_or(self.level.as_str(), |(d, _)| d);
        for directive in directives.split(',').map(str::trim).filter(|d| !d.is_empty()) {
            let valid = match directive.split_once('=') {
                Some((module, level)) => is_module_path(module) && LevelFilter::from_str(level).is_ok(),
                None => LevelFilter::from_str(directive).is_ok() || is_module_path(directive),
            };
            if !valid {
                return Err(format!("log.level: invalid filter directive '{}'", directive));
            }
        }
        Ok(())
    }
}

/// A bare module path enables everything below it.
fn is_module_path(directive: &str) -> bool {
    directive
        .split("::")
        .all(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'))
}

//! Service configuration.
//!
//! # Responsibility
//! - Deserialize the service configuration file once at startup.
//! - Reject values that would only fail later, at first use.
//!
//! # Invariants
//! - A loaded `ServiceConfig` has already passed `validate()`.
//! - Nothing here reads environment variables; callers pass paths explicitly.

use crate::db::DEFAULT_TIMEOUT;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug)]
pub enum ConfigError {
    Io { path: PathBuf, source: std::io::Error },
    Parse(serde_json::Error),
    Invalid(String),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { path, source } => {
                write!(f, "cannot read config `{}`: {source}", path.display())
            }
            Self::Parse(err) => write!(f, "malformed config: {err}"),
            Self::Invalid(message) => write!(f, "invalid config: {message}"),
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Parse(err) => Some(err),
            Self::Invalid(_) => None,
        }
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(value: serde_json::Error) -> Self {
        Self::Parse(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub bind_address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL URL / key-value string, or `sqlite:<path>` / `sqlite::memory:`.
    pub url: String,
    #[serde(default = "default_timeout_ms")]
    pub statement_timeout_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub idle_in_transaction_timeout_ms: u64,
}

impl DatabaseConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            statement_timeout_ms: default_timeout_ms(),
            idle_in_transaction_timeout_ms: default_timeout_ms(),
        }
    }

    pub fn statement_timeout(&self) -> Duration {
        Duration::from_millis(self.statement_timeout_ms)
    }

    pub fn idle_in_transaction_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_in_transaction_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level_string")]
    pub level: String,
    /// `stdout`, `file` or `file|stdout`.
    #[serde(default = "default_log_output")]
    pub output: String,
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level_string(),
            output: default_log_output(),
            path: None,
        }
    }
}

impl ServiceConfig {
    pub fn from_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> ConfigResult<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.server.bind_address.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "server.bind_address cannot be empty".to_string(),
            ));
        }
        if self.database.url.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "database.url cannot be empty".to_string(),
            ));
        }
        if self.database.statement_timeout_ms == 0
            || self.database.idle_in_transaction_timeout_ms == 0
        {
            return Err(ConfigError::Invalid(
                "database timeouts must be positive".to_string(),
            ));
        }
        if self.log.output.contains("file") && self.log.path.is_none() {
            return Err(ConfigError::Invalid(
                "log.path is required when log.output writes to a file".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT.as_millis() as u64
}

fn default_log_level_string() -> String {
    crate::logging::default_log_level().to_string()
}

fn default_log_output() -> String {
    "stdout".to_string()
}

#[cfg(test)]
mod tests {
    use super::{ConfigError, ServiceConfig};
    use std::time::Duration;

    #[test]
    fn minimal_config_gets_default_timeouts_and_stdout_logging() {
        let config = ServiceConfig::from_json_str(
            r#"{
                "server": { "bind_address": "0.0.0.0:50051" },
                "database": { "url": "postgres://users@localhost/users" }
            }"#,
        )
        .expect("minimal config should load");

        assert_eq!(config.database.statement_timeout(), Duration::from_secs(60));
        assert_eq!(
            config.database.idle_in_transaction_timeout(),
            Duration::from_secs(60)
        );
        assert_eq!(config.log.output, "stdout");
        assert!(config.log.path.is_none());
    }

    #[test]
    fn file_output_requires_a_path() {
        let err = ServiceConfig::from_json_str(
            r#"{
                "server": { "bind_address": ":50051" },
                "database": { "url": "sqlite::memory:" },
                "log": { "level": "info", "output": "file|stdout" }
            }"#,
        )
        .expect_err("file output without path must be rejected");
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn empty_database_url_is_rejected() {
        let err = ServiceConfig::from_json_str(
            r#"{ "server": { "bind_address": ":1" }, "database": { "url": " " } }"#,
        )
        .expect_err("empty url must be rejected");
        assert!(err.to_string().contains("database.url"));
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        let err = ServiceConfig::from_json_str("{ not json").expect_err("must fail");
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = ServiceConfig::from_file(dir.path().join("absent.json")).expect_err("must fail");
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}

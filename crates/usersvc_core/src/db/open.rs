//! Connection bootstrap for storage sessions.
//!
//! # Responsibility
//! - Parse connection strings into a PostgreSQL or SQLite target.
//! - Apply the application tag and server-side timeouts before handing out
//!   a connection.
//! - Hold the explicit database configuration used to open sessions.
//!
//! # Invariants
//! - A malformed connection string is a `StorageError::Config`, never a panic.
//! - Open failures are returned immediately; there are no retries.

use super::postgres::PostgresBackend;
use super::sqlite::{SqliteBackend, SqliteTarget};
use super::{Backend, DbError, TxOptions};
use crate::config::DatabaseConfig;
use crate::storage::{StorageError, StorageResult, StorageSession};
use log::{error, info};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Statement and idle-in-transaction timeout applied when none is configured.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Immutable per-session settings.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    dsn: String,
    app_name: String,
    cancel: CancellationToken,
    auto_commit: bool,
    auto_close: bool,
    statement_timeout: Duration,
    idle_in_transaction_timeout: Duration,
    tx_options: TxOptions,
}

impl SessionSettings {
    /// Creates settings with manual transaction control and a fresh
    /// cancellation scope.
    pub fn new(dsn: impl Into<String>, app_name: impl Into<String>) -> Self {
        Self {
            dsn: dsn.into(),
            app_name: app_name.into(),
            cancel: CancellationToken::new(),
            auto_commit: false,
            auto_close: false,
            statement_timeout: DEFAULT_TIMEOUT,
            idle_in_transaction_timeout: DEFAULT_TIMEOUT,
            tx_options: TxOptions::default(),
        }
    }

    pub fn with_auto_commit(mut self, auto_commit: bool) -> Self {
        self.auto_commit = auto_commit;
        self
    }

    pub fn with_auto_close(mut self, auto_close: bool) -> Self {
        self.auto_close = auto_close;
        self
    }

    /// Binds the session to an external cancellation scope.
    pub fn with_cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_statement_timeout(mut self, timeout: Duration) -> Self {
        self.statement_timeout = timeout;
        self
    }

    pub fn with_idle_in_transaction_timeout(mut self, timeout: Duration) -> Self {
        self.idle_in_transaction_timeout = timeout;
        self
    }

    pub fn with_transaction_options(mut self, options: TxOptions) -> Self {
        self.tx_options = options;
        self
    }

    pub fn dsn(&self) -> &str {
        &self.dsn
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn auto_commit(&self) -> bool {
        self.auto_commit
    }

    pub fn auto_close(&self) -> bool {
        self.auto_close
    }

    pub fn statement_timeout(&self) -> Duration {
        self.statement_timeout
    }

    pub fn idle_in_transaction_timeout(&self) -> Duration {
        self.idle_in_transaction_timeout
    }

    pub fn tx_options(&self) -> &TxOptions {
        &self.tx_options
    }
}

/// Opens sessions against the configured database.
///
/// Constructed once from configuration and passed to whoever needs sessions.
#[derive(Debug, Clone)]
pub struct ConnectionManager {
    config: DatabaseConfig,
}

impl ConnectionManager {
    pub fn new(config: DatabaseConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// Session settings for `app_name`, prefilled from configuration.
    pub fn settings(&self, app_name: impl Into<String>) -> SessionSettings {
        SessionSettings::new(self.config.url.as_str(), app_name)
            .with_statement_timeout(self.config.statement_timeout())
            .with_idle_in_transaction_timeout(self.config.idle_in_transaction_timeout())
    }

    pub fn open(&self, settings: SessionSettings) -> StorageResult<StorageSession> {
        StorageSession::open(settings)
    }
}

enum ConnectionTarget {
    Postgres(Box<tokio_postgres::Config>),
    Sqlite(SqliteTarget),
}

impl ConnectionTarget {
    fn parse(dsn: &str) -> StorageResult<Self> {
        let dsn = dsn.trim();
        if dsn.is_empty() {
            return Err(StorageError::Config(
                "connection string is empty".to_string(),
            ));
        }

        if let Some(rest) = dsn.strip_prefix("sqlite:") {
            let path = rest.strip_prefix("//").unwrap_or(rest);
            return match path {
                "" => Err(StorageError::Config(
                    "sqlite connection string has no database path".to_string(),
                )),
                ":memory:" => Ok(Self::Sqlite(SqliteTarget::Memory)),
                file => Ok(Self::Sqlite(SqliteTarget::File(file.into()))),
            };
        }

        dsn.parse::<tokio_postgres::Config>()
            .map(|config| Self::Postgres(Box::new(config)))
            .map_err(|err| StorageError::Config(format!("invalid connection string: {err}")))
    }

    fn mode(&self) -> &'static str {
        match self {
            Self::Postgres(_) => "postgres",
            Self::Sqlite(SqliteTarget::Memory) => "sqlite_memory",
            Self::Sqlite(SqliteTarget::File(_)) => "sqlite_file",
        }
    }
}

/// Opens one physical connection for `settings`.
///
/// # Side effects
/// - Emits `db_open` logging events with duration and status.
pub fn connect(settings: &SessionSettings) -> StorageResult<Box<dyn Backend>> {
    let started_at = Instant::now();
    let target = ConnectionTarget::parse(settings.dsn())?;
    let mode = target.mode();
    info!(
        "event=db_open module=db status=start mode={} app={}",
        mode,
        settings.app_name()
    );

    let opened: Result<Box<dyn Backend>, DbError> = match target {
        ConnectionTarget::Postgres(config) => {
            let config = apply_runtime_params(*config, settings);
            PostgresBackend::connect(&config, settings.cancel_token().clone())
                .map(|backend| Box::new(backend) as Box<dyn Backend>)
        }
        ConnectionTarget::Sqlite(target) => SqliteBackend::open(
            &target,
            settings.statement_timeout(),
            settings.cancel_token().clone(),
        )
        .map(|backend| Box::new(backend) as Box<dyn Backend>),
    };

    match opened {
        Ok(backend) => {
            info!(
                "event=db_open module=db status=ok mode={} app={} duration_ms={}",
                mode,
                settings.app_name(),
                started_at.elapsed().as_millis()
            );
            Ok(backend)
        }
        Err(err) => {
            error!(
                "event=db_open module=db status=error mode={} app={} duration_ms={} error_code=db_open_failed error={}",
                mode,
                settings.app_name(),
                started_at.elapsed().as_millis(),
                err
            );
            Err(StorageError::from_db(err, StorageError::Connection))
        }
    }
}

fn apply_runtime_params(
    mut config: tokio_postgres::Config,
    settings: &SessionSettings,
) -> tokio_postgres::Config {
    let timeouts = format!(
        "-c statement_timeout={} -c idle_in_transaction_session_timeout={}",
        settings.statement_timeout().as_millis(),
        settings.idle_in_transaction_timeout().as_millis()
    );
    let options = match config.get_options() {
        Some(existing) if !existing.trim().is_empty() => format!("{existing} {timeouts}"),
        _ => timeouts,
    };
    config.application_name(settings.app_name());
    config.options(&options);
    config
}

#[cfg(test)]
mod tests {
    use super::{apply_runtime_params, ConnectionTarget, SessionSettings};
    use crate::db::sqlite::SqliteTarget;
    use crate::storage::{ErrorKind, StorageError};
    use std::path::PathBuf;
    use std::time::Duration;

    fn parse_err(dsn: &str) -> StorageError {
        match ConnectionTarget::parse(dsn) {
            Ok(_) => panic!("`{dsn}` should be rejected"),
            Err(err) => err,
        }
    }

    #[test]
    fn empty_and_malformed_connection_strings_are_config_errors() {
        assert_eq!(parse_err("   ").kind(), ErrorKind::Config);
        assert_eq!(parse_err("sqlite:").kind(), ErrorKind::Config);
        assert_eq!(
            parse_err("host=localhost port=notaport").kind(),
            ErrorKind::Config
        );
        assert_eq!(
            parse_err("postgresql://user@localhost:badport/users").kind(),
            ErrorKind::Config
        );
    }

    #[test]
    fn sqlite_targets_are_recognized() {
        assert!(matches!(
            ConnectionTarget::parse("sqlite::memory:").unwrap(),
            ConnectionTarget::Sqlite(SqliteTarget::Memory)
        ));
        match ConnectionTarget::parse("sqlite:///tmp/users.db").unwrap() {
            ConnectionTarget::Sqlite(SqliteTarget::File(path)) => {
                assert_eq!(path, PathBuf::from("/tmp/users.db"));
            }
            _ => panic!("expected sqlite file target"),
        }
    }

    #[test]
    fn postgres_config_carries_application_name_and_timeouts() {
        let settings = SessionSettings::new("postgres://app@localhost/users", "usersvc::test")
            .with_statement_timeout(Duration::from_secs(5))
            .with_idle_in_transaction_timeout(Duration::from_secs(30));
        let config = match ConnectionTarget::parse(settings.dsn()).unwrap() {
            ConnectionTarget::Postgres(config) => apply_runtime_params(*config, &settings),
            _ => panic!("expected postgres target"),
        };

        assert_eq!(config.get_application_name(), Some("usersvc::test"));
        assert_eq!(
            config.get_options(),
            Some("-c statement_timeout=5000 -c idle_in_transaction_session_timeout=30000")
        );
    }
}

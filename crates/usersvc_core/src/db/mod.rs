//! Physical connection layer.
//!
//! # Responsibility
//! - Define the `Backend` seam every storage session drives.
//! - Open PostgreSQL or SQLite connections from a connection string.
//! - Translate driver failures into one `DbError` type.
//!
//! # Invariants
//! - A backend is owned by exactly one session and is never shared.
//! - Every backend call blocks the caller until the driver answers.
//! - Placeholders are `$1..$n` for every dialect.

use std::error::Error;
use std::fmt::{Display, Formatter};

mod open;
pub mod postgres;
pub mod sqlite;
pub mod value;

pub use open::{connect, ConnectionManager, SessionSettings, DEFAULT_TIMEOUT};
pub use value::{DecodeError, FromRow, FromValue, Row, Value};

pub type DbResult<T> = Result<T, DbError>;

#[derive(Debug)]
pub enum DbError {
    Postgres(tokio_postgres::Error),
    Sqlite(rusqlite::Error),
    Io(std::io::Error),
    /// The session's cancellation scope fired before or during the call.
    Cancelled,
    Driver(String),
}

impl Display for DbError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Postgres(err) => write!(f, "{err}"),
            Self::Sqlite(err) => write!(f, "{err}"),
            Self::Io(err) => write!(f, "{err}"),
            Self::Cancelled => write!(f, "operation cancelled"),
            Self::Driver(message) => write!(f, "{message}"),
        }
    }
}

impl Error for DbError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Postgres(err) => Some(err),
            Self::Sqlite(err) => Some(err),
            Self::Io(err) => Some(err),
            Self::Cancelled | Self::Driver(_) => None,
        }
    }
}

impl From<tokio_postgres::Error> for DbError {
    fn from(value: tokio_postgres::Error) -> Self {
        Self::Postgres(value)
    }
}

impl From<rusqlite::Error> for DbError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sqlite(value)
    }
}

/// SQL flavour spoken by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Postgres,
    Sqlite,
}

impl Display for Dialect {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Postgres => write!(f, "postgres"),
            Self::Sqlite => write!(f, "sqlite"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadWrite,
    ReadOnly,
}

/// Transaction characteristics applied when a session begins its transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxOptions {
    pub isolation: IsolationLevel,
    pub access_mode: AccessMode,
    pub deferrable: bool,
}

impl Default for TxOptions {
    fn default() -> Self {
        Self {
            isolation: IsolationLevel::ReadCommitted,
            access_mode: AccessMode::ReadWrite,
            deferrable: false,
        }
    }
}

impl TxOptions {
    /// PostgreSQL `BEGIN` statement carrying these characteristics.
    pub fn begin_statement(&self) -> String {
        let isolation = match self.isolation {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        };
        let access = match self.access_mode {
            AccessMode::ReadWrite => "READ WRITE",
            AccessMode::ReadOnly => "READ ONLY",
        };
        let deferrable = if self.deferrable {
            "DEFERRABLE"
        } else {
            "NOT DEFERRABLE"
        };
        format!("BEGIN ISOLATION LEVEL {isolation}, {access}, {deferrable}")
    }
}

/// One physical database connection.
///
/// Sessions own a boxed backend and call it strictly sequentially. Table and
/// column names reaching `copy_in` are already validated identifiers.
pub trait Backend: Send {
    fn dialect(&self) -> Dialect;
    fn begin(&mut self, options: &TxOptions) -> DbResult<()>;
    fn commit(&mut self) -> DbResult<()>;
    fn rollback(&mut self) -> DbResult<()>;
    fn query(&mut self, sql: &str, args: &[Value]) -> DbResult<Vec<Row>>;
    fn execute(&mut self, sql: &str, args: &[Value]) -> DbResult<u64>;
    /// Loads `rows` into `table` with the driver's bulk path; returns rows written.
    fn copy_in(&mut self, table: &str, columns: &[String], rows: &[Vec<Value>]) -> DbResult<u64>;
    fn ping(&mut self) -> DbResult<()>;
    fn close(self: Box<Self>) -> DbResult<()>;
}

/// Quotes a possibly schema-qualified identifier, part by part.
pub(crate) fn quote_ident_path(name: &str) -> String {
    name.split('.')
        .map(|part| format!("\"{}\"", part.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(".")
}

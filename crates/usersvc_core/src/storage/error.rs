use crate::db::{DbError, DecodeError};
use std::error::Error;
use std::fmt::{Display, Formatter};

pub type StorageResult<T> = Result<T, StorageError>;

/// Coarse error class, one per row of the storage error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Config,
    Connection,
    Transaction,
    Query,
    Validation,
    Extraction,
    Cancelled,
}

/// Error returned by every public storage-session operation.
#[derive(Debug)]
pub enum StorageError {
    /// Connection string is empty or malformed.
    Config(String),
    /// Opening or probing the connection failed.
    Connection(DbError),
    /// The session released its connection; it cannot be used again.
    ConnectionClosed,
    Close(DbError),
    Begin(DbError),
    Commit(DbError),
    /// Rolling back failed. When this follows a failed operation the
    /// operation's own error was logged and dropped.
    Rollback(DbError),
    NoActiveTransaction,
    Query(DbError),
    /// A mutation matched no rows.
    NoRowsAffected,
    Decode(DecodeError),
    Validation(String),
    /// Record at `index` could not be turned into a row tuple.
    Extraction { index: usize, message: String },
    Cancelled,
}

impl StorageError {
    /// Wraps a driver error, keeping cancellation in its own class.
    pub(crate) fn from_db(err: DbError, wrap: fn(DbError) -> StorageError) -> Self {
        match err {
            DbError::Cancelled => Self::Cancelled,
            other => wrap(other),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::Config,
            Self::Connection(_) | Self::ConnectionClosed | Self::Close(_) => ErrorKind::Connection,
            Self::Begin(_) | Self::Commit(_) | Self::Rollback(_) | Self::NoActiveTransaction => {
                ErrorKind::Transaction
            }
            Self::Query(_) | Self::NoRowsAffected | Self::Decode(_) => ErrorKind::Query,
            Self::Validation(_) => ErrorKind::Validation,
            Self::Extraction { .. } => ErrorKind::Extraction,
            Self::Cancelled => ErrorKind::Cancelled,
        }
    }
}

impl Display for StorageError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(message) => write!(f, "invalid storage configuration: {message}"),
            Self::Connection(err) => write!(f, "connection failed: {err}"),
            Self::ConnectionClosed => write!(f, "storage session connection is closed"),
            Self::Close(err) => write!(f, "closing connection failed: {err}"),
            Self::Begin(err) => write!(f, "begin transaction failed: {err}"),
            Self::Commit(err) => write!(f, "commit failed: {err}"),
            Self::Rollback(err) => write!(f, "rollback failed: {err}"),
            Self::NoActiveTransaction => write!(f, "no active transaction"),
            Self::Query(err) => write!(f, "query failed: {err}"),
            Self::NoRowsAffected => write!(f, "statement affected no rows"),
            Self::Decode(err) => write!(f, "{err}"),
            Self::Validation(message) => write!(f, "invalid request: {message}"),
            Self::Extraction { index, message } => {
                write!(f, "cannot extract row from record #{index}: {message}")
            }
            Self::Cancelled => write!(f, "storage operation cancelled"),
        }
    }
}

impl Error for StorageError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Connection(err)
            | Self::Close(err)
            | Self::Begin(err)
            | Self::Commit(err)
            | Self::Rollback(err)
            | Self::Query(err) => Some(err),
            Self::Decode(err) => Some(err),
            Self::Config(_)
            | Self::ConnectionClosed
            | Self::NoActiveTransaction
            | Self::NoRowsAffected
            | Self::Validation(_)
            | Self::Extraction { .. }
            | Self::Cancelled => None,
        }
    }
}

impl From<DecodeError> for StorageError {
    fn from(value: DecodeError) -> Self {
        Self::Decode(value)
    }
}

//! SQLite backend on `rusqlite`.
//!
//! # Responsibility
//! - Run sessions against an embedded database file or in-memory database.
//! - Accept the same `$n` placeholders the PostgreSQL backend takes.
//!
//! # Invariants
//! - `$n` placeholders are rewritten to `?n`, so argument numbering is
//!   explicit and independent of textual order. Text inside quotes,
//!   bracketed identifiers and comments is never rewritten.
//! - Bulk loads insert rows one by one through a single prepared statement.
//! - The cancellation scope is checked before every statement and row.

use super::value::{Row, Value, TIMESTAMP_FORMAT};
use super::{quote_ident_path, Backend, DbError, DbResult, Dialect, IsolationLevel, TxOptions};
use log::debug;
use rusqlite::types::{ToSqlOutput, Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection};
use std::borrow::Cow;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqliteTarget {
    Memory,
    File(PathBuf),
}

pub struct SqliteBackend {
    conn: Connection,
    cancel: CancellationToken,
}

impl SqliteBackend {
    /// Opens `target`; the statement timeout becomes the busy timeout.
    pub fn open(
        target: &SqliteTarget,
        busy_timeout: Duration,
        cancel: CancellationToken,
    ) -> DbResult<Self> {
        if cancel.is_cancelled() {
            return Err(DbError::Cancelled);
        }
        let conn = match target {
            SqliteTarget::Memory => Connection::open_in_memory()?,
            SqliteTarget::File(path) => Connection::open(path)?,
        };
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.busy_timeout(busy_timeout)?;
        debug!("event=sqlite_open module=db status=ok idle_in_transaction_timeout=unsupported");
        Ok(Self { conn, cancel })
    }

    fn ensure_active(&self) -> DbResult<()> {
        if self.cancel.is_cancelled() {
            return Err(DbError::Cancelled);
        }
        Ok(())
    }
}

/// Rewrites `$n` placeholders to SQLite's numbered `?n` form.
pub fn rewrite_placeholders(sql: &str) -> Cow<'_, str> {
    if !sql.contains('$') {
        return Cow::Borrowed(sql);
    }

    let bytes = sql.as_bytes();
    let mut out = String::with_capacity(sql.len());
    let mut copied = 0;
    let mut index = 0;
    while index < bytes.len() {
        match bytes[index] {
            quote @ (b'\'' | b'"' | b'`') => index = skip_past(bytes, index + 1, quote),
            b'[' => index = skip_past(bytes, index + 1, b']'),
            b'-' if bytes.get(index + 1) == Some(&b'-') => {
                index = find(bytes, index + 2, b"\n").map_or(bytes.len(), |end| end + 1);
            }
            b'/' if bytes.get(index + 1) == Some(&b'*') => {
                index = find(bytes, index + 2, b"*/").map_or(bytes.len(), |end| end + 2);
            }
            b'$' => {
                let digits = bytes[index + 1..]
                    .iter()
                    .take_while(|byte| byte.is_ascii_digit())
                    .count();
                if digits > 0 {
                    out.push_str(&sql[copied..index]);
                    out.push('?');
                    copied = index + 1;
                }
                index += 1 + digits;
            }
            _ => index += 1,
        }
    }
    out.push_str(&sql[copied..]);
    Cow::Owned(out)
}

/// Index just after the next `close` at or after `from`, or the end of input.
/// A doubled quote (`''`) closes and reopens, which leaves it inside the span.
fn skip_past(bytes: &[u8], from: usize, close: u8) -> usize {
    bytes[from..]
        .iter()
        .position(|&byte| byte == close)
        .map_or(bytes.len(), |offset| from + offset + 1)
}

fn find(bytes: &[u8], from: usize, needle: &[u8]) -> Option<usize> {
    bytes[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|offset| from + offset)
}

impl Backend for SqliteBackend {
    fn dialect(&self) -> Dialect {
        Dialect::Sqlite
    }

    fn begin(&mut self, options: &TxOptions) -> DbResult<()> {
        self.ensure_active()?;
        // SQLite transactions are serializable; weaker levels are not available.
        let statement = match options.isolation {
            IsolationLevel::Serializable => "BEGIN IMMEDIATE",
            _ => "BEGIN DEFERRED",
        };
        self.conn.execute_batch(statement)?;
        Ok(())
    }

    fn commit(&mut self) -> DbResult<()> {
        self.ensure_active()?;
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    fn rollback(&mut self) -> DbResult<()> {
        self.ensure_active()?;
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }

    fn query(&mut self, sql: &str, args: &[Value]) -> DbResult<Vec<Row>> {
        self.ensure_active()?;
        let sql = rewrite_placeholders(sql);
        let mut stmt = self.conn.prepare(&sql)?;
        let columns: Arc<[String]> = stmt
            .column_names()
            .into_iter()
            .map(str::to_string)
            .collect::<Vec<_>>()
            .into();

        let mut rows = stmt.query(params_from_iter(args.iter()))?;
        let mut decoded = Vec::new();
        while let Some(row) = rows.next()? {
            self.ensure_active()?;
            let mut values = Vec::with_capacity(columns.len());
            for index in 0..columns.len() {
                values.push(read_value(row.get_ref(index)?)?);
            }
            decoded.push(Row::new(Arc::clone(&columns), values));
        }
        Ok(decoded)
    }

    fn execute(&mut self, sql: &str, args: &[Value]) -> DbResult<u64> {
        self.ensure_active()?;
        let sql = rewrite_placeholders(sql);
        let changed = self.conn.execute(&sql, params_from_iter(args.iter()))?;
        Ok(changed as u64)
    }

    fn copy_in(&mut self, table: &str, columns: &[String], rows: &[Vec<Value>]) -> DbResult<u64> {
        self.ensure_active()?;
        let placeholders = (1..=columns.len())
            .map(|index| format!("?{index}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident_path(table),
            columns
                .iter()
                .map(|column| quote_ident_path(column))
                .collect::<Vec<_>>()
                .join(", "),
            placeholders
        );

        let mut stmt = self.conn.prepare(&sql)?;
        let mut written = 0u64;
        for row in rows {
            self.ensure_active()?;
            written += stmt.execute(params_from_iter(row.iter()))? as u64;
        }
        Ok(written)
    }

    fn ping(&mut self) -> DbResult<()> {
        self.ensure_active()?;
        self.conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }

    fn close(self: Box<Self>) -> DbResult<()> {
        self.conn.close().map_err(|(_, err)| DbError::Sqlite(err))
    }
}

fn read_value(cell: ValueRef<'_>) -> DbResult<Value> {
    Ok(match cell {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(number) => Value::Int(number),
        ValueRef::Real(number) => Value::Float(number),
        ValueRef::Text(bytes) => Value::Text(
            String::from_utf8(bytes.to_vec())
                .map_err(|err| DbError::Driver(format!("non UTF-8 text cell: {err}")))?,
        ),
        ValueRef::Blob(bytes) => Value::Bytes(bytes.to_vec()),
    })
}

impl rusqlite::ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Owned(SqlValue::Null),
            Value::Bool(flag) => ToSqlOutput::Owned(SqlValue::Integer(i64::from(*flag))),
            Value::Int(number) => ToSqlOutput::Owned(SqlValue::Integer(*number)),
            Value::Float(number) => ToSqlOutput::Owned(SqlValue::Real(*number)),
            Value::Text(text) => ToSqlOutput::Borrowed(ValueRef::Text(text.as_bytes())),
            Value::Bytes(bytes) => ToSqlOutput::Borrowed(ValueRef::Blob(bytes)),
            Value::Timestamp(at) => {
                ToSqlOutput::Owned(SqlValue::Text(at.format(TIMESTAMP_FORMAT).to_string()))
            }
        })
    }
}

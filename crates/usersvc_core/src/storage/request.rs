//! Per-call request shapes accepted by a storage session.

use super::error::{StorageError, StorageResult};
use super::extract::RowSource;
use crate::db::Value;
use once_cell::sync::Lazy;
use regex::Regex;

static IDENTIFIER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)?$")
        .expect("valid identifier regex")
});

/// Query text plus ordered positional arguments (`$1..$n`).
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    pub sql: String,
    pub args: Vec<Value>,
}

impl QueryRequest {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args(sql: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            sql: sql.into(),
            args,
        }
    }

    /// Appends the next positional argument.
    pub fn bind(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }
}

/// Bulk load of `source` into `table`.
pub struct CopyRequest<'a> {
    pub table: String,
    pub fields: Vec<String>,
    pub source: RowSource<'a>,
}

impl<'a> CopyRequest<'a> {
    pub fn new<S: Into<String>>(
        table: impl Into<String>,
        fields: impl IntoIterator<Item = S>,
        source: RowSource<'a>,
    ) -> Self {
        Self {
            table: table.into(),
            fields: fields.into_iter().map(Into::into).collect(),
            source,
        }
    }
}

/// Batch of per-row UPDATE statements against `table`.
///
/// Fields prefixed with `@` are predicate columns; the rest are SET columns.
pub struct UpdateRequest<'a> {
    pub table: String,
    pub fields: Vec<String>,
    pub source: RowSource<'a>,
}

impl<'a> UpdateRequest<'a> {
    pub fn new<S: Into<String>>(
        table: impl Into<String>,
        fields: impl IntoIterator<Item = S>,
        source: RowSource<'a>,
    ) -> Self {
        Self {
            table: table.into(),
            fields: fields.into_iter().map(Into::into).collect(),
            source,
        }
    }
}

/// Rejects anything but a plain or schema-qualified SQL identifier.
pub(crate) fn validate_identifier(role: &str, name: &str) -> StorageResult<()> {
    if name.is_empty() {
        return Err(StorageError::Validation(format!("{role} name is empty")));
    }
    if !IDENTIFIER_RE.is_match(name) {
        return Err(StorageError::Validation(format!(
            "{role} name `{name}` is not a valid identifier"
        )));
    }
    Ok(())
}

/// Checks that every row carries exactly one value per field.
pub(crate) fn validate_row_widths(fields: usize, rows: &[Vec<Value>]) -> StorageResult<()> {
    if let Some((index, row)) = rows.iter().enumerate().find(|(_, row)| row.len() != fields) {
        return Err(StorageError::Validation(format!(
            "row #{index} has {} values for {fields} fields",
            row.len()
        )));
    }
    Ok(())
}

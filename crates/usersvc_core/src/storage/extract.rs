//! Record-to-row conversion for bulk loads and batched updates.
//!
//! # Responsibility
//! - Turn caller records into ordered row tuples through an explicit
//!   per-type adapter (`ToRow`).
//! - Support transport-generated records that carry trailing bookkeeping
//!   fields after their data fields.
//!
//! # Invariants
//! - Output order always matches input order.
//! - A record that cannot be converted fails the whole extraction with its
//!   index; nothing is skipped silently.

use super::error::{StorageError, StorageResult};
use crate::db::Value;
use std::borrow::Cow;

/// Trailing non-data fields carried by transport-generated record types.
pub const BOOKKEEPING_FIELDS: usize = 5;

/// Adapter from one record type to an ordered list of column values.
pub trait ToRow {
    fn to_row(&self) -> StorageResult<Vec<Value>>;
}

/// Row source handed to bulk copy and batched update.
///
/// The caller states which form it supplies; nothing is inspected at run time.
pub enum RowSource<'a> {
    Tuples(Vec<Vec<Value>>),
    Records(Vec<&'a dyn ToRow>),
}

impl<'a> RowSource<'a> {
    pub fn tuples(rows: Vec<Vec<Value>>) -> Self {
        Self::Tuples(rows)
    }

    pub fn records<T: ToRow>(records: &'a [T]) -> Self {
        Self::Records(records.iter().map(|record| record as &dyn ToRow).collect())
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Tuples(rows) => rows.len(),
            Self::Records(records) => records.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Row tuples for this source, extracting records when needed.
    pub fn to_rows(&self) -> StorageResult<Cow<'_, [Vec<Value>]>> {
        match self {
            Self::Tuples(rows) => Ok(Cow::Borrowed(rows.as_slice())),
            Self::Records(records) => extract_rows(records).map(Cow::Owned),
        }
    }
}

/// Converts `records` into row tuples, preserving order.
pub fn extract_rows(records: &[&dyn ToRow]) -> StorageResult<Vec<Vec<Value>>> {
    records
        .iter()
        .enumerate()
        .map(|(index, record)| {
            record.to_row().map_err(|err| match err {
                StorageError::Extraction { message, .. } => {
                    StorageError::Extraction { index, message }
                }
                other => other,
            })
        })
        .collect()
}

/// Builds a row from every field of a transport-generated record.
///
/// `fields` lists all fields in declaration order, bookkeeping included;
/// `None` marks a field the record does not expose. The trailing
/// [`BOOKKEEPING_FIELDS`] entries are dropped and unexposed data fields
/// become `Value::Null` holes.
pub fn transport_fields_to_row(fields: Vec<Option<Value>>) -> StorageResult<Vec<Value>> {
    let total = fields.len();
    let usable = total
        .checked_sub(BOOKKEEPING_FIELDS)
        .ok_or_else(|| StorageError::Extraction {
            index: 0,
            message: format!(
                "record has {total} fields, fewer than the {BOOKKEEPING_FIELDS} trailing bookkeeping fields"
            ),
        })?;

    Ok(fields
        .into_iter()
        .take(usable)
        .map(|field| field.unwrap_or(Value::Null))
        .collect())
}

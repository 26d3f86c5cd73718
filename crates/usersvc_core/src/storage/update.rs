//! UPDATE statement synthesis from tabular input.
//!
//! # Invariants
//! - Output depends only on the inputs: same table, fields and row always
//!   give the same SQL text and argument order.
//! - Row values are returned as bound arguments, never written into SQL.

use super::error::{StorageError, StorageResult};
use super::request::validate_identifier;
use crate::db::Value;

/// Prefix that turns a field into a WHERE predicate column.
pub const PREDICATE_MARKER: char = '@';

/// Builds one parameterized UPDATE for `row`.
///
/// Fields marked with [`PREDICATE_MARKER`] form the AND-joined WHERE clause;
/// all others form the SET clause, both in field order. SET placeholders are
/// numbered first, then WHERE placeholders, and the returned arguments
/// follow the same order. Without any marked field the first field is the
/// row key and becomes the only predicate.
///
/// ```
/// use usersvc_core::db::Value;
/// use usersvc_core::storage::build_update;
///
/// let (sql, args) = build_update("t", &["@id", "name"], &[Value::Int(7), Value::from("Bob")]).unwrap();
/// assert_eq!(sql, "UPDATE t SET name=$1 WHERE id=$2");
/// assert_eq!(args, vec![Value::from("Bob"), Value::Int(7)]);
/// ```
pub fn build_update<S: AsRef<str>>(
    table: &str,
    fields: &[S],
    row: &[Value],
) -> StorageResult<(String, Vec<Value>)> {
    validate_identifier("table", table)?;
    if fields.is_empty() {
        return Err(StorageError::Validation(
            "update field list is empty".to_string(),
        ));
    }
    if fields.len() != row.len() {
        return Err(StorageError::Validation(format!(
            "update row has {} values for {} fields",
            row.len(),
            fields.len()
        )));
    }

    let mut set_terms: Vec<(&str, &Value)> = Vec::with_capacity(fields.len());
    let mut where_terms: Vec<(&str, &Value)> = Vec::new();
    for (field, value) in fields.iter().zip(row) {
        let field = field.as_ref();
        match field.strip_prefix(PREDICATE_MARKER) {
            Some(column) => {
                validate_identifier("predicate column", column)?;
                where_terms.push((column, value));
            }
            None => {
                validate_identifier("column", field)?;
                set_terms.push((field, value));
            }
        }
    }

    if where_terms.is_empty() {
        where_terms.push(set_terms.remove(0));
    }
    if set_terms.is_empty() {
        return Err(StorageError::Validation(format!(
            "update of `{table}` has no SET columns"
        )));
    }

    let mut args = Vec::with_capacity(set_terms.len() + where_terms.len());
    let mut set_clauses = Vec::with_capacity(set_terms.len());
    for (column, value) in set_terms {
        args.push(value.clone());
        set_clauses.push(format!("{column}=${}", args.len()));
    }
    let mut where_clauses = Vec::with_capacity(where_terms.len());
    for (column, value) in where_terms {
        args.push(value.clone());
        where_clauses.push(format!("{column}=${}", args.len()));
    }

    let sql = format!(
        "UPDATE {table} SET {} WHERE {}",
        set_clauses.join(", "),
        where_clauses.join(" AND ")
    );
    Ok((sql, args))
}

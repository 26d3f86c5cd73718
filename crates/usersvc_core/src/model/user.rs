//! User domain model.
//!
//! # Responsibility
//! - Define the persisted user record and the shapes used to create and
//!   update users.
//! - Provide the row adapters bulk load and batched update consume.
//!
//! # Invariants
//! - `login` is unique among persisted users.
//! - `is_deleted` is the source of truth for tombstone state.
//! - Timestamps are rendered as `YYYY-MM-DD HH24:MI:SS` text.

use crate::db::{DecodeError, FromRow, Row, Value};
use crate::storage::{StorageResult, ToRow};
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Database-assigned user identifier.
pub type UserId = i64;

/// Column list used when bulk loading users.
pub const IMPORT_FIELDS: [&str; 3] = ["login", "password", "is_deleted"];

/// Field list used when batch updating users; `@id` is the row key.
pub const UPDATE_FIELDS: [&str; 4] = ["login", "password", "is_deleted", "@id"];

/// Persisted user as returned by the storage layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub login: String,
    pub password: String,
    pub is_deleted: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl FromRow for User {
    fn from_row(row: &Row) -> Result<Self, DecodeError> {
        Ok(Self {
            id: row.get("id")?,
            login: row.get("login")?,
            password: row.get("password")?,
            is_deleted: row.get("is_deleted")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserValidationError {
    EmptyLogin,
    EmptyPassword,
}

impl Display for UserValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyLogin => write!(f, "login cannot be empty"),
            Self::EmptyPassword => write!(f, "password cannot be empty"),
        }
    }
}

impl Error for UserValidationError {}

/// Create-user input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateUserRequest {
    pub login: String,
    pub password: String,
}

impl CreateUserRequest {
    pub fn new(login: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            login: login.into(),
            password: password.into(),
        }
    }

    pub fn validate(&self) -> Result<(), UserValidationError> {
        if self.login.trim().is_empty() {
            return Err(UserValidationError::EmptyLogin);
        }
        if self.password.is_empty() {
            return Err(UserValidationError::EmptyPassword);
        }
        Ok(())
    }
}

/// Bulk import rows follow [`IMPORT_FIELDS`]; imported users are live.
impl ToRow for CreateUserRequest {
    fn to_row(&self) -> StorageResult<Vec<Value>> {
        Ok(vec![
            Value::from(self.login.as_str()),
            Value::from(self.password.as_str()),
            Value::Bool(false),
        ])
    }
}

/// Full replacement of a user's mutable columns, keyed by `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserUpdate {
    pub id: UserId,
    pub login: String,
    pub password: String,
    pub is_deleted: bool,
}

/// Rows follow [`UPDATE_FIELDS`].
impl ToRow for UserUpdate {
    fn to_row(&self) -> StorageResult<Vec<Value>> {
        Ok(vec![
            Value::from(self.login.as_str()),
            Value::from(self.password.as_str()),
            Value::Bool(self.is_deleted),
            Value::Int(self.id),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::{CreateUserRequest, User, UserUpdate, UserValidationError, UPDATE_FIELDS};
    use crate::db::{FromRow, Row, Value};
    use crate::storage::ToRow;

    #[test]
    fn user_decodes_from_named_columns() {
        let row = Row::new(
            vec![
                "id".to_string(),
                "login".to_string(),
                "password".to_string(),
                "is_deleted".to_string(),
                "created_at".to_string(),
                "updated_at".to_string(),
            ]
            .into(),
            vec![
                Value::Int(1),
                Value::from("Vladick"),
                Value::from("secret"),
                Value::Int(0),
                Value::from("2024-01-02 03:04:05"),
                Value::from("2024-01-02 03:04:05"),
            ],
        );

        let user = User::from_row(&row).expect("row should decode");
        assert_eq!(user.login, "Vladick");
        assert!(!user.is_deleted);
        assert_eq!(user.created_at, "2024-01-02 03:04:05");
    }

    #[test]
    fn create_request_requires_login_and_password() {
        assert_eq!(
            CreateUserRequest::new("  ", "pw").validate(),
            Err(UserValidationError::EmptyLogin)
        );
        assert_eq!(
            CreateUserRequest::new("neo", "").validate(),
            Err(UserValidationError::EmptyPassword)
        );
        assert!(CreateUserRequest::new("neo", "pw").validate().is_ok());
    }

    #[test]
    fn update_row_lines_up_with_update_fields() {
        let update = UserUpdate {
            id: 42,
            login: "neo".to_string(),
            password: "pw".to_string(),
            is_deleted: true,
        };
        let row = update.to_row().unwrap();
        assert_eq!(row.len(), UPDATE_FIELDS.len());
        assert_eq!(row[3], Value::Int(42));
    }
}

//! User repository contracts and session-backed implementation.
//!
//! # Responsibility
//! - Provide the persistence operations of the users service.
//! - Keep SQL text and dialect differences inside the repository.
//!
//! # Invariants
//! - Every operation runs in its own auto-commit, auto-close session.
//! - Login and password always travel as bound arguments.
//! - Soft delete of an unknown id is `RepoError::NotFound`.

use crate::db::{ConnectionManager, Dialect, SessionSettings};
use crate::model::user::{
    CreateUserRequest, User, UserId, UserUpdate, UserValidationError, IMPORT_FIELDS,
    UPDATE_FIELDS,
};
use crate::storage::{
    CopyRequest, QueryRequest, RowSource, StorageError, StorageSession, UpdateRequest,
};
use log::info;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::time::Instant;
use tokio_util::sync::CancellationToken;

pub const USERS_TABLE: &str = "users_ref";

const POSTGRES_INSERT_USER_SQL: &str = "WITH inserted_user AS (
    INSERT INTO users_ref (login, password) VALUES ($1, $2) RETURNING *
)
SELECT
    usr.id AS id,
    usr.login AS login,
    usr.password AS password,
    usr.is_deleted AS is_deleted,
    to_char(usr.created_at, 'YYYY-MM-DD HH24:MI:SS'::text) AS created_at,
    to_char(usr.updated_at, 'YYYY-MM-DD HH24:MI:SS'::text) AS updated_at
FROM inserted_user AS usr";

const SQLITE_INSERT_USER_SQL: &str = "INSERT INTO users_ref (login, password) VALUES ($1, $2)
RETURNING
    id,
    login,
    password,
    is_deleted,
    strftime('%Y-%m-%d %H:%M:%S', created_at) AS created_at,
    strftime('%Y-%m-%d %H:%M:%S', updated_at) AS updated_at";

const POSTGRES_FIND_BY_LOGIN_SQL: &str = "SELECT
    id,
    login,
    password,
    is_deleted,
    to_char(created_at, 'YYYY-MM-DD HH24:MI:SS'::text) AS created_at,
    to_char(updated_at, 'YYYY-MM-DD HH24:MI:SS'::text) AS updated_at
FROM users_ref
WHERE login = $1 AND NOT is_deleted";

const SQLITE_FIND_BY_LOGIN_SQL: &str = "SELECT
    id,
    login,
    password,
    is_deleted,
    strftime('%Y-%m-%d %H:%M:%S', created_at) AS created_at,
    strftime('%Y-%m-%d %H:%M:%S', updated_at) AS updated_at
FROM users_ref
WHERE login = $1 AND NOT is_deleted";

const SOFT_DELETE_USER_SQL: &str =
    "UPDATE users_ref SET is_deleted = TRUE, updated_at = CURRENT_TIMESTAMP WHERE id = $1 AND NOT is_deleted";

pub type RepoResult<T> = Result<T, RepoError>;

#[derive(Debug)]
pub enum RepoError {
    Validation(UserValidationError),
    Storage(StorageError),
    NotFound(UserId),
}

impl Display for RepoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation(err) => write!(f, "{err}"),
            Self::Storage(err) => write!(f, "{err}"),
            Self::NotFound(id) => write!(f, "user not found: {id}"),
        }
    }
}

impl Error for RepoError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Validation(err) => Some(err),
            Self::Storage(err) => Some(err),
            Self::NotFound(_) => None,
        }
    }
}

impl From<UserValidationError> for RepoError {
    fn from(value: UserValidationError) -> Self {
        Self::Validation(value)
    }
}

impl From<StorageError> for RepoError {
    fn from(value: StorageError) -> Self {
        Self::Storage(value)
    }
}

/// Builds the RETURNING-wrapped insert for `request` in `dialect`.
pub fn insert_user_query(dialect: Dialect, request: &CreateUserRequest) -> QueryRequest {
    let sql = match dialect {
        Dialect::Postgres => POSTGRES_INSERT_USER_SQL,
        Dialect::Sqlite => SQLITE_INSERT_USER_SQL,
    };
    QueryRequest::new(sql)
        .bind(request.login.as_str())
        .bind(request.password.as_str())
}

fn find_by_login_query(dialect: Dialect, login: &str) -> QueryRequest {
    let sql = match dialect {
        Dialect::Postgres => POSTGRES_FIND_BY_LOGIN_SQL,
        Dialect::Sqlite => SQLITE_FIND_BY_LOGIN_SQL,
    };
    QueryRequest::new(sql).bind(login)
}

/// Persistence operations of the users service.
pub trait UserRepository {
    /// Inserts one user and returns the stored rows.
    fn create_user(&self, request: &CreateUserRequest) -> RepoResult<Vec<User>>;
    /// Loads a live user by login.
    fn find_by_login(&self, login: &str) -> RepoResult<Option<User>>;
    fn soft_delete_user(&self, id: UserId) -> RepoResult<()>;
    /// Bulk loads users in one all-or-nothing batch.
    fn import_users(&self, users: &[CreateUserRequest]) -> RepoResult<u64>;
    /// Applies full-row updates keyed by id in one all-or-nothing batch.
    fn update_users(&self, updates: &[UserUpdate]) -> RepoResult<u64>;
    fn ping(&self) -> RepoResult<()>;
}

/// `UserRepository` that opens one storage session per call.
pub struct SessionUserRepository<'a> {
    manager: &'a ConnectionManager,
    cancel: CancellationToken,
}

impl<'a> SessionUserRepository<'a> {
    pub fn new(manager: &'a ConnectionManager) -> Self {
        Self {
            manager,
            cancel: CancellationToken::new(),
        }
    }

    /// Binds every session this repository opens to `cancel`.
    pub fn with_cancel_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn settings(&self, operation: &str) -> SessionSettings {
        self.manager
            .settings(format!("usersvc::{operation}"))
            .with_auto_commit(true)
            .with_auto_close(true)
            .with_cancel_token(self.cancel.clone())
    }

    fn open(&self, operation: &str) -> RepoResult<StorageSession> {
        Ok(self.manager.open(self.settings(operation))?)
    }
}

impl UserRepository for SessionUserRepository<'_> {
    fn create_user(&self, request: &CreateUserRequest) -> RepoResult<Vec<User>> {
        request.validate()?;
        let started_at = Instant::now();
        let mut session = self.open("create_user")?;
        let query = insert_user_query(session.dialect()?, request);

        let mut users = Vec::new();
        session.query(&query, &mut users)?;
        info!(
            "event=user_create module=repo status=ok rows={} duration_ms={}",
            users.len(),
            started_at.elapsed().as_millis()
        );
        Ok(users)
    }

    fn find_by_login(&self, login: &str) -> RepoResult<Option<User>> {
        let mut session = self.open("find_by_login")?;
        let query = find_by_login_query(session.dialect()?, login);

        let mut users: Vec<User> = Vec::new();
        session.query(&query, &mut users)?;
        Ok(users.into_iter().next())
    }

    fn soft_delete_user(&self, id: UserId) -> RepoResult<()> {
        let mut session = self.open("soft_delete_user")?;
        match session.execute(&QueryRequest::new(SOFT_DELETE_USER_SQL).bind(id)) {
            Ok(_) => {
                info!("event=user_delete module=repo status=ok id={}", id);
                Ok(())
            }
            Err(StorageError::NoRowsAffected) => Err(RepoError::NotFound(id)),
            Err(err) => Err(err.into()),
        }
    }

    fn import_users(&self, users: &[CreateUserRequest]) -> RepoResult<u64> {
        for user in users {
            user.validate()?;
        }
        let mut session = self.open("import_users")?;
        let request = CopyRequest::new(USERS_TABLE, IMPORT_FIELDS, RowSource::records(users));
        Ok(session.bulk_copy(&request)?)
    }

    fn update_users(&self, updates: &[UserUpdate]) -> RepoResult<u64> {
        let mut session = self.open("update_users")?;
        let request = UpdateRequest::new(USERS_TABLE, UPDATE_FIELDS, RowSource::records(updates));
        Ok(session.update_from_rows(&request)?)
    }

    fn ping(&self) -> RepoResult<()> {
        let mut session = self.manager.open(
            self.manager
                .settings("usersvc::ping")
                .with_cancel_token(self.cancel.clone()),
        )?;
        session.ping()?;
        session.release()?;
        Ok(())
    }
}

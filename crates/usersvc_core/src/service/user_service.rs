//! User use-case service.
//!
//! # Responsibility
//! - Validate incoming requests before they reach storage.
//! - Delegate persistence to repository implementations.
//!
//! # Invariants
//! - Expected failures come back as `ServiceError`, never as panics.
//! - Service layer remains storage-agnostic.

use crate::model::user::{CreateUserRequest, User, UserId, UserUpdate};
use crate::repo::user_repo::{RepoError, UserRepository};
use log::warn;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub type ServiceResult<T> = Result<T, ServiceError>;

#[derive(Debug)]
pub enum ServiceError {
    InvalidRequest(String),
    Repo(RepoError),
}

impl Display for ServiceError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidRequest(message) => write!(f, "invalid request: {message}"),
            Self::Repo(err) => write!(f, "{err}"),
        }
    }
}

impl Error for ServiceError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::InvalidRequest(_) => None,
            Self::Repo(err) => Some(err),
        }
    }
}

impl From<RepoError> for ServiceError {
    fn from(value: RepoError) -> Self {
        Self::Repo(value)
    }
}

/// Use-case service wrapper for user operations.
pub struct UserService<R: UserRepository> {
    repo: R,
}

impl<R: UserRepository> UserService<R> {
    pub fn new(repo: R) -> Self {
        Self { repo }
    }

    /// Creates one user and returns what storage reported back.
    ///
    /// # Contract
    /// - Rejects empty login or password without touching storage.
    /// - An empty result is returned as-is and logged as a warning.
    pub fn create_user(&self, request: &CreateUserRequest) -> ServiceResult<Vec<User>> {
        request
            .validate()
            .map_err(|err| ServiceError::InvalidRequest(err.to_string()))?;

        let users = self.repo.create_user(request)?;
        if users.is_empty() {
            warn!("event=user_create module=service status=empty message=storage returned no user");
        }
        Ok(users)
    }

    pub fn find_user(&self, login: &str) -> ServiceResult<Option<User>> {
        if login.trim().is_empty() {
            return Err(ServiceError::InvalidRequest(
                "login cannot be empty".to_string(),
            ));
        }
        Ok(self.repo.find_by_login(login)?)
    }

    pub fn delete_user(&self, id: UserId) -> ServiceResult<()> {
        Ok(self.repo.soft_delete_user(id)?)
    }

    pub fn import_users(&self, users: &[CreateUserRequest]) -> ServiceResult<u64> {
        for user in users {
            user.validate()
                .map_err(|err| ServiceError::InvalidRequest(err.to_string()))?;
        }
        Ok(self.repo.import_users(users)?)
    }

    pub fn update_users(&self, updates: &[UserUpdate]) -> ServiceResult<u64> {
        Ok(self.repo.update_users(updates)?)
    }

    pub fn ping(&self) -> ServiceResult<()> {
        Ok(self.repo.ping()?)
    }
}

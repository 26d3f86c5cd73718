//! Core of the users service.
//! Storage sessions, the users repository and the request handler live here.

pub mod config;
pub mod db;
pub mod logging;
pub mod model;
pub mod repo;
pub mod service;
pub mod storage;

pub use config::{ConfigError, DatabaseConfig, LogConfig, ServerConfig, ServiceConfig};
pub use db::{ConnectionManager, SessionSettings, Value};
pub use logging::{default_log_level, init_logging, logging_status};
pub use model::user::{CreateUserRequest, User, UserId, UserUpdate};
pub use repo::user_repo::{RepoError, RepoResult, SessionUserRepository, UserRepository};
pub use service::user_service::{ServiceError, ServiceResult, UserService};
pub use storage::{ErrorKind, StorageError, StorageResult, StorageSession};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

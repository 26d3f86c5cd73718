//! PostgreSQL backend tests.
//!
//! The runtime-context tests need no server. The remaining tests run against
//! the database named by `USERSVC_PG_URL` and are skipped when it is unset.

use std::sync::Once;
use std::thread;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use usersvc_core::db::Value;
use usersvc_core::storage::{CopyRequest, QueryRequest, RowSource};
use usersvc_core::{
    ConnectionManager, CreateUserRequest, DatabaseConfig, ErrorKind, SessionUserRepository,
    StorageError, StorageSession, UserRepository,
};

const UNREACHABLE_URL: &str = "postgres://usersvc@127.0.0.1:1/usersvc?connect_timeout=2";

const USERS_SCHEMA_SQL: &str = "CREATE TABLE IF NOT EXISTS users_ref (
    id BIGSERIAL PRIMARY KEY,
    login TEXT NOT NULL UNIQUE,
    password TEXT NOT NULL,
    is_deleted BOOLEAN NOT NULL DEFAULT FALSE,
    created_at TIMESTAMP NOT NULL DEFAULT now(),
    updated_at TIMESTAMP NOT NULL DEFAULT now()
)";

static SCHEMA: Once = Once::new();

fn open_err(manager: &ConnectionManager) -> StorageError {
    match manager.open(manager.settings("usersvc::pg_test")) {
        Ok(_) => panic!("connection to an unreachable server succeeded"),
        Err(err) => err,
    }
}

#[tokio::test]
async fn opening_inside_a_current_thread_runtime_fails_without_panicking() {
    let manager = ConnectionManager::new(DatabaseConfig::new(UNREACHABLE_URL));

    let err = open_err(&manager);

    assert_eq!(err.kind(), ErrorKind::Connection);
    assert!(err.to_string().contains("async runtime"), "{err}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn opening_inside_a_multi_thread_runtime_reports_the_connect_error() {
    let manager = ConnectionManager::new(DatabaseConfig::new(UNREACHABLE_URL));

    let err = open_err(&manager);

    assert_eq!(err.kind(), ErrorKind::Connection);
    assert!(!err.to_string().contains("async runtime"), "{err}");
}

/// Manager for the configured server with `users_ref` in place, or `None`
/// when `USERSVC_PG_URL` is unset.
fn pg_manager() -> Option<ConnectionManager> {
    let Ok(url) = std::env::var("USERSVC_PG_URL") else {
        eprintln!("USERSVC_PG_URL is not set; skipping PostgreSQL test");
        return None;
    };
    let manager = ConnectionManager::new(DatabaseConfig::new(url));
    SCHEMA.call_once(|| {
        let mut session = manager.open(manager.settings("usersvc::pg_schema")).unwrap();
        let mut ignored: Vec<Vec<Value>> = Vec::new();
        session
            .query(&QueryRequest::new(USERS_SCHEMA_SQL), &mut ignored)
            .unwrap();
        session.commit().unwrap();
        session.release().unwrap();
    });
    Some(manager)
}

fn manual_session(manager: &ConnectionManager) -> StorageSession {
    manager.open(manager.settings("usersvc::pg_test")).unwrap()
}

fn auto_session(manager: &ConnectionManager) -> StorageSession {
    manager
        .open(
            manager
                .settings("usersvc::pg_test")
                .with_auto_commit(true)
                .with_auto_close(true),
        )
        .unwrap()
}

fn unique_login(prefix: &str) -> String {
    format!("{prefix}-{}", uuid::Uuid::new_v4())
}

fn count_logins(manager: &ConnectionManager, pattern: &str) -> i64 {
    let mut rows: Vec<Vec<Value>> = Vec::new();
    auto_session(manager)
        .query(
            &QueryRequest::new("SELECT COUNT(*) AS n FROM users_ref WHERE login LIKE $1")
                .bind(pattern),
            &mut rows,
        )
        .unwrap();
    match rows[0][0] {
        Value::Int(count) => count,
        ref other => panic!("unexpected count value {other:?}"),
    }
}

#[test]
fn create_user_returns_the_inserted_row_with_formatted_timestamps() {
    let Some(manager) = pg_manager() else { return };
    let repo = SessionUserRepository::new(&manager);
    let login = unique_login("create");

    let users = repo
        .create_user(&CreateUserRequest::new(login.as_str(), "12345"))
        .unwrap();

    assert_eq!(users.len(), 1);
    assert_eq!(users[0].login, login);
    assert_eq!(users[0].password, "12345");
    assert!(!users[0].is_deleted);
    assert_eq!(users[0].created_at.len(), 19);
    assert!(repo.find_by_login(&login).unwrap().is_some());
}

#[test]
fn bulk_copy_is_all_or_nothing() {
    let Some(manager) = pg_manager() else { return };
    let batch = unique_login("copy");

    let users = vec![
        CreateUserRequest::new(format!("{batch}-a"), "a"),
        CreateUserRequest::new(format!("{batch}-b"), "b"),
        CreateUserRequest::new(format!("{batch}-c"), "c"),
    ];
    let written = auto_session(&manager)
        .bulk_copy(&CopyRequest::new(
            "users_ref",
            ["login", "password", "is_deleted"],
            RowSource::records(&users),
        ))
        .unwrap();
    assert_eq!(written, 3);
    assert_eq!(count_logins(&manager, &format!("{batch}-%")), 3);

    let failing = unique_login("copy-dup");
    let rows = vec![
        vec![Value::from(format!("{failing}-x")), Value::from("1")],
        vec![Value::from(format!("{failing}-x")), Value::from("2")],
    ];
    let err = auto_session(&manager)
        .bulk_copy(&CopyRequest::new(
            "users_ref",
            ["login", "password"],
            RowSource::tuples(rows),
        ))
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Query);
    assert_eq!(count_logins(&manager, &format!("{failing}-%")), 0);
}

#[test]
fn begin_applies_the_default_transaction_options() {
    let Some(manager) = pg_manager() else { return };
    let mut session = manual_session(&manager);

    session.begin().unwrap();
    let mut rows: Vec<Vec<Value>> = Vec::new();
    session
        .query(
            &QueryRequest::new("SELECT current_setting('transaction_isolation') AS iso"),
            &mut rows,
        )
        .unwrap();
    session.rollback().unwrap();
    session.release().unwrap();

    assert_eq!(rows, vec![vec![Value::from("read committed")]]);
}

#[test]
fn cancelling_the_scope_interrupts_a_running_query() {
    let Some(manager) = pg_manager() else { return };
    let cancel = CancellationToken::new();
    let mut session = manager
        .open(
            manager
                .settings("usersvc::pg_test")
                .with_auto_commit(true)
                .with_cancel_token(cancel.clone()),
        )
        .unwrap();

    let canceller = thread::spawn(move || {
        thread::sleep(Duration::from_millis(200));
        cancel.cancel();
    });
    let mut rows: Vec<Vec<Value>> = Vec::new();
    let err = session
        .query(&QueryRequest::new("SELECT pg_sleep(10)"), &mut rows)
        .unwrap_err();
    canceller.join().unwrap();

    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert!(session.current_transaction().is_none());
}

#[test]
fn uuid_date_and_json_columns_decode_to_text() {
    let Some(manager) = pg_manager() else { return };
    let mut rows: Vec<Vec<Value>> = Vec::new();

    auto_session(&manager)
        .query(
            &QueryRequest::new(
                "SELECT 'a0eebc99-9c0b-4ef8-bb6d-6bb9bd380a11'::uuid AS u, \
                 DATE '2024-01-02' AS d, \
                 '{\"a\":1}'::jsonb AS j",
            ),
            &mut rows,
        )
        .unwrap();

    assert_eq!(
        rows,
        vec![vec![
            Value::from("a0eebc99-9c0b-4ef8-bb6d-6bb9bd380a11"),
            Value::from("2024-01-02"),
            Value::from(r#"{"a":1}"#),
        ]]
    );
}

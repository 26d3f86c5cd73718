#![allow(dead_code)]

use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use usersvc_core::db::{Backend, DbError, DbResult, Dialect, Row, TxOptions, Value};
use usersvc_core::{ConnectionManager, DatabaseConfig, SessionSettings};

pub const USERS_SCHEMA_SQL: &str = "CREATE TABLE users_ref (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    login TEXT NOT NULL UNIQUE,
    password TEXT NOT NULL,
    is_deleted INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);";

/// Temporary SQLite database with the users schema applied.
pub struct TestDb {
    _dir: tempfile::TempDir,
    path: PathBuf,
}

impl TestDb {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.db");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(USERS_SCHEMA_SQL).unwrap();
        drop(conn);
        Self { _dir: dir, path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn url(&self) -> String {
        format!("sqlite://{}", self.path.display())
    }

    pub fn manager(&self) -> ConnectionManager {
        ConnectionManager::new(DatabaseConfig::new(self.url()))
    }

    pub fn conn(&self) -> Connection {
        Connection::open(&self.path).unwrap()
    }

    pub fn count_users(&self) -> i64 {
        self.conn()
            .query_row("SELECT COUNT(*) FROM users_ref", [], |row| row.get(0))
            .unwrap()
    }

    pub fn seed(&self, login: &str, password: &str) -> i64 {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO users_ref (login, password) VALUES (?1, ?2)",
            (login, password),
        )
        .unwrap();
        conn.last_insert_rowid()
    }
}

/// Calls observed by a [`ScriptedBackend`].
#[derive(Debug, Default, Clone)]
pub struct Journal {
    pub begins: usize,
    pub commits: usize,
    pub rollbacks: usize,
    pub closes: usize,
    pub queries: usize,
    pub executes: Vec<(String, Vec<Value>)>,
    pub copies: Vec<(String, Vec<String>, usize)>,
}

/// In-memory backend with scripted answers and a shared call journal.
pub struct ScriptedBackend {
    journal: Arc<Mutex<Journal>>,
    pub rows: Vec<Row>,
    pub rows_affected: u64,
    /// Execute calls after this many successful ones fail.
    pub fail_execute_after: Option<usize>,
    pub fail_query: bool,
    pub fail_commit: bool,
    pub fail_rollback: bool,
    pub fail_copy: bool,
    pub cancel_on_query: Option<tokio_util::sync::CancellationToken>,
}

impl ScriptedBackend {
    pub fn new() -> (Self, Arc<Mutex<Journal>>) {
        let journal = Arc::new(Mutex::new(Journal::default()));
        let backend = Self {
            journal: Arc::clone(&journal),
            rows: Vec::new(),
            rows_affected: 1,
            fail_execute_after: None,
            fail_query: false,
            fail_commit: false,
            fail_rollback: false,
            fail_copy: false,
            cancel_on_query: None,
        };
        (backend, journal)
    }

    fn journal(&self) -> MutexGuard<'_, Journal> {
        self.journal.lock().unwrap()
    }
}

impl Backend for ScriptedBackend {
    fn dialect(&self) -> Dialect {
        Dialect::Postgres
    }

    fn begin(&mut self, _options: &TxOptions) -> DbResult<()> {
        self.journal().begins += 1;
        Ok(())
    }

    fn commit(&mut self) -> DbResult<()> {
        self.journal().commits += 1;
        if self.fail_commit {
            return Err(DbError::Driver("database is locked".to_string()));
        }
        Ok(())
    }

    fn rollback(&mut self) -> DbResult<()> {
        self.journal().rollbacks += 1;
        if self.fail_rollback {
            return Err(DbError::Driver("connection reset during rollback".to_string()));
        }
        Ok(())
    }

    fn query(&mut self, _sql: &str, _args: &[Value]) -> DbResult<Vec<Row>> {
        self.journal().queries += 1;
        if let Some(cancel) = &self.cancel_on_query {
            cancel.cancel();
            return Err(DbError::Cancelled);
        }
        if self.fail_query {
            return Err(DbError::Driver("relation does not exist".to_string()));
        }
        Ok(self.rows.clone())
    }

    fn execute(&mut self, sql: &str, args: &[Value]) -> DbResult<u64> {
        let mut journal = self.journal();
        if let Some(limit) = self.fail_execute_after {
            if journal.executes.len() >= limit {
                return Err(DbError::Driver("duplicate key value".to_string()));
            }
        }
        journal.executes.push((sql.to_string(), args.to_vec()));
        Ok(self.rows_affected)
    }

    fn copy_in(&mut self, table: &str, columns: &[String], rows: &[Vec<Value>]) -> DbResult<u64> {
        self.journal()
            .copies
            .push((table.to_string(), columns.to_vec(), rows.len()));
        if self.fail_copy {
            return Err(DbError::Driver("duplicate key value".to_string()));
        }
        Ok(rows.len() as u64)
    }

    fn ping(&mut self) -> DbResult<()> {
        Ok(())
    }

    fn close(self: Box<Self>) -> DbResult<()> {
        self.journal().closes += 1;
        Ok(())
    }
}

pub fn settings(auto_commit: bool, auto_close: bool) -> SessionSettings {
    SessionSettings::new("scripted", "usersvc::test")
        .with_auto_commit(auto_commit)
        .with_auto_close(auto_close)
}

pub fn user_row(id: i64, login: &str) -> Row {
    Row::new(
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
            Value::Int(id),
            Value::from(login),
            Value::from("secret"),
            Value::Bool(false),
            Value::from("2024-05-01 10:00:00"),
            Value::from("2024-05-01 10:00:00"),
        ],
    )
}

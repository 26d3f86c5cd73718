mod common;

use common::TestDb;
use usersvc_core::db::{Row, Value};
use usersvc_core::repo::user_repo::insert_user_query;
use usersvc_core::storage::{CopyRequest, QueryRequest, RowSource, UpdateRequest};
use usersvc_core::{
    ConnectionManager, CreateUserRequest, DatabaseConfig, ErrorKind, StorageError, User,
};

fn auto_session(manager: &ConnectionManager) -> usersvc_core::StorageSession {
    manager
        .open(
            manager
                .settings("usersvc::sqlite_test")
                .with_auto_commit(true)
                .with_auto_close(true),
        )
        .unwrap()
}

#[test]
fn create_user_returns_the_stored_row() {
    let db = TestDb::new();
    let manager = db.manager();
    let mut session = auto_session(&manager);

    let request = CreateUserRequest::new("Vladick", "12345");
    let query = insert_user_query(session.dialect().unwrap(), &request);
    let mut users: Vec<User> = Vec::new();
    let count = session.query(&query, &mut users).unwrap();

    assert_eq!(count, 1);
    let user = &users[0];
    assert!(user.id > 0);
    assert_eq!(user.login, "Vladick");
    assert_eq!(user.password, "12345");
    assert!(!user.is_deleted);
    assert_eq!(user.created_at.len(), "YYYY-MM-DD HH:MM:SS".len());
    assert!(!session.is_open());
    assert_eq!(db.count_users(), 1);
}

#[test]
fn opening_with_a_malformed_connection_string_is_a_config_error() {
    let manager = ConnectionManager::new(DatabaseConfig::new("host=localhost port=notaport"));
    let err = manager.open(manager.settings("usersvc::bad")).err().unwrap();
    assert_eq!(err.kind(), ErrorKind::Config);

    let manager = ConnectionManager::new(DatabaseConfig::new(""));
    let err = manager.open(manager.settings("usersvc::bad")).err().unwrap();
    assert_eq!(err.kind(), ErrorKind::Config);
}

#[test]
fn bulk_copy_loads_every_row_in_order() {
    let db = TestDb::new();
    let manager = db.manager();
    let mut session = auto_session(&manager);

    let users = vec![
        CreateUserRequest::new("alpha", "a"),
        CreateUserRequest::new("beta", "b"),
        CreateUserRequest::new("gamma", "c"),
    ];
    let request = CopyRequest::new(
        "users_ref",
        ["login", "password", "is_deleted"],
        RowSource::records(&users),
    );
    let written = session.bulk_copy(&request).unwrap();

    assert_eq!(written, 3);
    let conn = db.conn();
    let logins: Vec<String> = conn
        .prepare("SELECT login FROM users_ref ORDER BY id")
        .unwrap()
        .query_map([], |row| row.get(0))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(logins, vec!["alpha", "beta", "gamma"]);
}

#[test]
fn duplicate_in_bulk_copy_keeps_nothing() {
    let db = TestDb::new();
    let manager = db.manager();
    let mut session = auto_session(&manager);

    let rows = vec![
        vec![Value::from("dup"), Value::from("1")],
        vec![Value::from("other"), Value::from("2")],
        vec![Value::from("dup"), Value::from("3")],
    ];
    let request = CopyRequest::new("users_ref", ["login", "password"], RowSource::tuples(rows));
    let err = session.bulk_copy(&request).unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Query);
    assert_eq!(db.count_users(), 0);
}

#[test]
fn update_from_rows_applies_every_row() {
    let db = TestDb::new();
    let first = db.seed("neo", "old");
    let second = db.seed("trinity", "old");
    let manager = db.manager();
    let mut session = auto_session(&manager);

    let rows = vec![
        vec![Value::from("new-1"), Value::Int(first)],
        vec![Value::from("new-2"), Value::Int(second)],
    ];
    let request = UpdateRequest::new("users_ref", ["password", "@id"], RowSource::tuples(rows));
    let affected = session.update_from_rows(&request).unwrap();

    assert_eq!(affected, 2);
    let password: String = db
        .conn()
        .query_row(
            "SELECT password FROM users_ref WHERE id = ?1",
            [second],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(password, "new-2");
}

#[test]
fn unique_violation_in_update_batch_rolls_back_earlier_rows() {
    let db = TestDb::new();
    let first = db.seed("neo", "pw");
    let second = db.seed("trinity", "pw");
    let manager = db.manager();
    let mut session = auto_session(&manager);

    let rows = vec![
        vec![Value::from("renamed"), Value::Int(first)],
        vec![Value::from("renamed"), Value::Int(second)],
    ];
    let request = UpdateRequest::new("users_ref", ["login", "@id"], RowSource::tuples(rows));
    let err = session.update_from_rows(&request).unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Query);
    let login: String = db
        .conn()
        .query_row("SELECT login FROM users_ref WHERE id = ?1", [first], |row| {
            row.get(0)
        })
        .unwrap();
    assert_eq!(login, "neo");
}

#[test]
fn manual_transaction_spans_several_operations() {
    let db = TestDb::new();
    let manager = db.manager();
    let mut session = manager.open(manager.settings("usersvc::manual")).unwrap();

    let tx = session.begin().unwrap();
    session
        .execute(
            &QueryRequest::new("INSERT INTO users_ref (login, password) VALUES ($1, $2)")
                .bind("one")
                .bind("pw"),
        )
        .unwrap();
    session
        .execute(
            &QueryRequest::new("INSERT INTO users_ref (login, password) VALUES ($1, $2)")
                .bind("two")
                .bind("pw"),
        )
        .unwrap();
    assert_eq!(session.current_transaction(), Some(tx));

    session.rollback().unwrap();
    assert_eq!(db.count_users(), 0);

    session
        .execute(
            &QueryRequest::new("INSERT INTO users_ref (login, password) VALUES ($1, $2)")
                .bind("three")
                .bind("pw"),
        )
        .unwrap();
    session.commit().unwrap();
    session.release().unwrap();
    assert_eq!(db.count_users(), 1);
}

#[test]
fn soft_delete_of_unknown_id_matches_no_rows() {
    let db = TestDb::new();
    let manager = db.manager();
    let mut session = auto_session(&manager);

    let err = session
        .execute(
            &QueryRequest::new("UPDATE users_ref SET is_deleted = TRUE WHERE id = $1").bind(404),
        )
        .unwrap_err();
    assert!(matches!(err, StorageError::NoRowsAffected));
    assert!(session.is_open());
    session.ping().unwrap();
}

#[test]
fn dollar_signs_inside_string_literals_reach_the_database_unchanged() {
    let db = TestDb::new();
    let manager = db.manager();
    let mut session = auto_session(&manager);

    let mut rows: Vec<Row> = Vec::new();
    session
        .query(
            &QueryRequest::new("SELECT 'costs $1' AS label, $1 AS v").bind(5),
            &mut rows,
        )
        .unwrap();

    assert_eq!(rows[0].get::<String>("label").unwrap(), "costs $1");
    assert_eq!(rows[0].get::<i64>("v").unwrap(), 5);
}

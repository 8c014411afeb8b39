use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::thread;

use pricewatch_db::{
    build_connection_configuration, ensure_schema, Backend, Database, SchemaError,
    SessionError, PRICE_HISTORY,
};

fn file_locator(path: &Path) -> String {
    format!("sqlite:///{}", path.display())
}

fn file_db(path: &Path) -> Database {
    Database::provision(build_connection_configuration(file_locator(path)))
        .expect("failed to provision file database")
}

#[test]
fn db_initialization_works() {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let path = dir.path().join("data").join("price_history.db");

    let db = file_db(&path);
    assert_eq!(db.backend(), Backend::Sqlite);
    assert!(
        path.parent().expect("path has a parent").is_dir(),
        "database directory should be created at provision"
    );
    assert_eq!(db.config().connect_timeout, None);

    let created = ensure_schema(&db, &PRICE_HISTORY).expect("failed to ensure schema");
    assert_eq!(created, 2);
    assert!(path.exists(), "database file should be created on first use");

    let tables: Vec<String> = db
        .with_session(|session| -> Result<_, SessionError> {
            let conn = session.sqlite().expect("session should be sqlite");
            let mut stmt = conn.prepare(
                "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
            )?;
            let names = stmt
                .query_map([], |row| row.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            Ok(names)
        })
        .expect("failed to list tables");

    assert_eq!(tables, vec!["price_records", "products"]);
}

#[test]
fn ensure_schema_twice_on_same_store() {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let path = dir.path().join("prices.db");

    let first = file_db(&path);
    assert_eq!(ensure_schema(&first, &PRICE_HISTORY).expect("first run"), 2);
    assert_eq!(ensure_schema(&first, &PRICE_HISTORY).expect("second run"), 0);

    // A fresh handle on the same file sees the existing tables.
    let second = file_db(&path);
    assert_eq!(ensure_schema(&second, &PRICE_HISTORY).expect("third run"), 0);
}

#[test]
fn data_written_in_one_session_is_visible_in_the_next() {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let db = file_db(&dir.path().join("prices.db"));
    ensure_schema(&db, &PRICE_HISTORY).expect("failed to ensure schema");

    db.with_session(|session| {
        session.execute_batch(
            "INSERT INTO products (name, url) VALUES ('Espresso grinder', 'https://shop.example.com/grinder');
             INSERT INTO price_records (product_id, price) VALUES (1, 189.0);
             INSERT INTO price_records (product_id, price) VALUES (1, 174.5);",
        )
    })
    .expect("failed to insert rows");

    let count: i64 = db
        .with_session(|session| -> Result<_, SessionError> {
            let conn = session.sqlite().expect("session should be sqlite");
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM price_records WHERE product_id = 1",
                [],
                |row| row.get(0),
            )?)
        })
        .expect("failed to count rows");
    assert_eq!(count, 2);
}

#[test]
fn session_released_once_on_success_and_error() {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let db = file_db(&dir.path().join("prices.db"));

    db.with_session(|session| session.ping())
        .expect("ping should succeed");
    assert_eq!(db.session_stats().acquired(), 1);
    assert_eq!(db.session_stats().released(), 1);

    let err = db
        .with_session(|session| session.execute_batch("SELECT * FROM no_such_table"))
        .expect_err("query against a missing table should fail");
    assert!(matches!(err, SessionError::Sqlite(_)));
    assert_eq!(db.session_stats().acquired(), 2);
    assert_eq!(db.session_stats().released(), 2);
    assert_eq!(db.session_stats().outstanding(), 0);
}

#[test]
fn session_released_when_scope_panics() {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let db = file_db(&dir.path().join("prices.db"));

    let outcome = catch_unwind(AssertUnwindSafe(|| {
        db.with_session(|_session| -> Result<(), SessionError> {
            panic!("caller blew up mid-session");
        })
    }));
    assert!(outcome.is_err(), "panic should propagate");

    assert_eq!(db.session_stats().acquired(), 1);
    assert_eq!(db.session_stats().released(), 1);
    db.acquire_session()
        .expect("pool should still hand out sessions after a panic");
}

#[test]
fn explicit_close_releases_early() {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let db = file_db(&dir.path().join("prices.db"));

    let session = db.acquire_session().expect("should acquire session");
    assert_eq!(db.session_stats().outstanding(), 1);
    session.close();
    assert_eq!(db.session_stats().outstanding(), 0);
    assert_eq!(db.session_stats().released(), 1);
}

#[test]
fn concurrent_sessions_share_one_handle() {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let db = file_db(&dir.path().join("prices.db"));
    ensure_schema(&db, &PRICE_HISTORY).expect("failed to ensure schema");

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let db = db.clone();
            thread::spawn(move || {
                db.with_session(|session| -> Result<(), SchemaError> {
                    session.ping()?;
                    assert_eq!(session.backend(), Backend::Sqlite);
                    Ok(())
                })
                .unwrap_or_else(|e| panic!("worker {i} failed: {e}"));
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("worker thread panicked");
    }

    // One session for ensure_schema plus one per worker.
    assert_eq!(db.session_stats().acquired(), 9);
    assert_eq!(db.session_stats().outstanding(), 0);
}

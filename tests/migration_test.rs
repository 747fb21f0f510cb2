mod helpers;

use medimimes::db;
use medimimes::db::migrations::{get_embedding_model, get_schema_version, run_migrations, CURRENT_SCHEMA_VERSION};
use medimimes::meds::types::Frequency;

use helpers::*;

fn v1_database() -> rusqlite::Connection {
    db::load_sqlite_vec();
    let conn = rusqlite::Connection::open_in_memory().unwrap();
    conn.pragma_update(None, "foreign_keys", "ON").unwrap();
    db::schema::init_schema(&conn).unwrap();
    conn
}

#[test]
fn fresh_database_is_current() {
    let conn = test_db();
    assert_eq!(get_schema_version(&conn).unwrap(), CURRENT_SCHEMA_VERSION);
    assert_eq!(get_embedding_model(&conn).unwrap().as_deref(), Some("all-MiniLM-L6-v2"));
}

#[test]
fn rerunning_migrations_changes_nothing() {
    let conn = test_db();
    run_migrations(&conn).unwrap();
    run_migrations(&conn).unwrap();
    assert_eq!(get_schema_version(&conn).unwrap(), CURRENT_SCHEMA_VERSION);
}

#[test]
fn v1_database_keeps_its_rows_through_upgrade() {
    let conn = v1_database();
    assert_eq!(get_schema_version(&conn).unwrap(), 1);
    assert!(get_embedding_model(&conn).unwrap().is_none());

    let user = create_user(&conn, "asha");
    add_med(&conn, user.id, "Metformin", Frequency::Daily, &["08:00"], at(2025, 3, 1, 7, 0));

    run_migrations(&conn).unwrap();

    assert_eq!(get_schema_version(&conn).unwrap(), CURRENT_SCHEMA_VERSION);
    let summary = db::summarize(&conn).unwrap();
    assert_eq!(summary.users, 1);
    assert_eq!(summary.medications, 1);
}

#[test]
fn recorded_embedding_model_is_not_overwritten() {
    let conn = v1_database();
    db::migrations::set_embedding_model(&conn, "hashed-bow-384").unwrap();
    run_migrations(&conn).unwrap();
    assert_eq!(get_embedding_model(&conn).unwrap().as_deref(), Some("hashed-bow-384"));
}

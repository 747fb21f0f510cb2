pub mod migrations;
pub mod schema;

use anyhow::{Context, Result};
use rusqlite::Connection;
use sqlite_vec::sqlite3_vec_init;
use std::path::Path;
use std::sync::Once;

static SQLITE_VEC_INIT: Once = Once::new();

/// Register the sqlite-vec extension for every connection opened afterwards.
pub fn load_sqlite_vec() {
    SQLITE_VEC_INIT.call_once(|| unsafe {
        rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute(
            sqlite3_vec_init as *const (),
        )));
    });
}

/// Open (or create) the database at `path`, with pragmas set, schema created
/// and migrations applied.
pub fn open_database(path: impl AsRef<Path>) -> Result<Connection> {
    let path = path.as_ref();

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }

    load_sqlite_vec();

    let conn = Connection::open(path)
        .with_context(|| format!("failed to open database at {}", path.display()))?;

    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.busy_timeout(std::time::Duration::from_millis(5000))?;

    prepare(&conn)?;

    tracing::info!(path = %path.display(), "database initialized");
    Ok(conn)
}

/// Open a fully migrated in-memory database.
pub fn open_memory_database() -> Result<Connection> {
    load_sqlite_vec();
    let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    prepare(&conn)?;
    Ok(conn)
}

fn prepare(conn: &Connection) -> Result<()> {
    schema::init_schema(conn).context("failed to initialize schema")?;
    migrations::run_migrations(conn).context("failed to run migrations")?;
    Ok(())
}

/// Row counts reported by `medimimes report` and the health endpoint.
#[derive(Debug, serde::Serialize)]
pub struct DatabaseSummary {
    pub schema_version: u32,
    pub users: u64,
    pub medications: u64,
    pub dose_logs: u64,
    pub knowledge_chunks: u64,
}

pub fn summarize(conn: &Connection) -> Result<DatabaseSummary> {
    let count = |table: &str| -> Result<u64> {
        let n: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?;
        Ok(n as u64)
    };
    Ok(DatabaseSummary {
        schema_version: migrations::get_schema_version(conn)?,
        users: count("users")?,
        medications: count("medications")?,
        dose_logs: count("dose_logs")?,
        knowledge_chunks: count("kb_chunks")?,
    })
}

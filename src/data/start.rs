//! Database initialization and startup
//!
//! Opens the SQLite database and ensures all required tables exist.

use rusqlite::Connection;

use super::schema::create_all_tables;

/// Error type for database startup
#[derive(Debug)]
pub enum StartError {
    /// SQLite error
    Database(rusqlite::Error),
}

impl std::fmt::Display for StartError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StartError::Database(e) => write!(f, "database error: {}", e),
        }
    }
}

impl std::error::Error for StartError {}

impl From<rusqlite::Error> for StartError {
    fn from(e: rusqlite::Error) -> Self {
        StartError::Database(e)
    }
}

/// Opens the database and ensures all required tables exist
pub fn start_db(db_path: &str) -> Result<Connection, StartError> {
    let conn = Connection::open(db_path)?;

    // WAL mode for better concurrency (multiple readers, non-blocking writes)
    // Note: PRAGMA returns the new mode, so we use query_row instead of execute
    let _: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;

    conn.execute("PRAGMA foreign_keys = ON", [])?;

    // Schema creation is idempotent (`CREATE TABLE IF NOT EXISTS`), so always
    // run it to recover cleanly from partially initialized databases.
    create_all_tables(&conn)?;

    Ok(conn)
}

/// Create an in-memory database for testing
pub fn start_memory_db() -> rusqlite::Result<Connection> {
    let conn = Connection::open_in_memory()?;
    // WAL mode doesn't work with in-memory databases, skip it
    conn.execute("PRAGMA foreign_keys = ON", [])?;
    create_all_tables(&conn)?;
    Ok(conn)
}

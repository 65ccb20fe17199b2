//! SQLite-backed tab ledger: which named tab of which project last pointed at which session.
//!
//! The ledger is advisory. Nothing here keeps a session alive, and a stored
//! session id may refer to a session that has since exited or been reaped.

pub mod schema;
pub mod tabs;

use rusqlite::Connection;
use std::path::Path;

pub use tabs::TabRecord;

pub fn open(path: &Path) -> rusqlite::Result<Connection> {
    let conn = Connection::open(path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    schema::initialize(&conn)?;
    Ok(conn)
}

/// Open a throwaway ledger, for tests and ephemeral deployments.
pub fn open_in_memory() -> rusqlite::Result<Connection> {
    let conn = Connection::open_in_memory()?;
    schema::initialize(&conn)?;
    Ok(conn)
}

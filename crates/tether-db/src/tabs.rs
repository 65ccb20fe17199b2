use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabRecord {
    pub project_id: String,
    pub tab_id: String,
    pub name: String,
    /// Last session this tab pointed at. Advisory only.
    pub session_id: Option<String>,
    pub position: i64,
    pub created_at: String,
    pub updated_at: String,
}

const TAB_COLUMNS: &str =
    "project_id, tab_id, name, session_id, position, created_at, updated_at";

fn tab_from_row(row: &Row<'_>) -> rusqlite::Result<TabRecord> {
    Ok(TabRecord {
        project_id: row.get(0)?,
        tab_id: row.get(1)?,
        name: row.get(2)?,
        session_id: row.get(3)?,
        position: row.get(4)?,
        created_at: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

/// Open a new tab at the end of the project's tab strip.
pub fn create_tab(
    conn: &Connection,
    project_id: &str,
    tab_id: &str,
    name: &str,
    session_id: Option<&str>,
) -> rusqlite::Result<TabRecord> {
    conn.execute(
        "INSERT INTO tabs (project_id, tab_id, name, session_id, position)
         VALUES (?1, ?2, ?3, ?4,
                 (SELECT COALESCE(MAX(position), -1) + 1 FROM tabs WHERE project_id = ?1))",
        params![project_id, tab_id, name, session_id],
    )?;
    get_tab(conn, project_id, tab_id)?.ok_or(rusqlite::Error::QueryReturnedNoRows)
}

pub fn get_tab(
    conn: &Connection,
    project_id: &str,
    tab_id: &str,
) -> rusqlite::Result<Option<TabRecord>> {
    conn.query_row(
        &format!("SELECT {TAB_COLUMNS} FROM tabs WHERE project_id = ?1 AND tab_id = ?2"),
        params![project_id, tab_id],
        tab_from_row,
    )
    .optional()
}

pub fn list_tabs(conn: &Connection, project_id: &str) -> rusqlite::Result<Vec<TabRecord>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {TAB_COLUMNS} FROM tabs WHERE project_id = ?1 ORDER BY position, created_at"
    ))?;
    let rows = stmt.query_map(params![project_id], tab_from_row)?;
    rows.collect()
}

pub fn rename_tab(
    conn: &Connection,
    project_id: &str,
    tab_id: &str,
    name: &str,
) -> rusqlite::Result<bool> {
    let changed = conn.execute(
        "UPDATE tabs SET name = ?3, updated_at = datetime('now')
         WHERE project_id = ?1 AND tab_id = ?2",
        params![project_id, tab_id, name],
    )?;
    Ok(changed > 0)
}

/// Record which session the tab now shows, or clear it with `None`.
pub fn set_session(
    conn: &Connection,
    project_id: &str,
    tab_id: &str,
    session_id: Option<&str>,
) -> rusqlite::Result<bool> {
    let changed = conn.execute(
        "UPDATE tabs SET session_id = ?3, updated_at = datetime('now')
         WHERE project_id = ?1 AND tab_id = ?2",
        params![project_id, tab_id, session_id],
    )?;
    Ok(changed > 0)
}

/// Delete the tab's row. The session it pointed at is untouched.
pub fn close_tab(conn: &Connection, project_id: &str, tab_id: &str) -> rusqlite::Result<bool> {
    let changed = conn.execute(
        "DELETE FROM tabs WHERE project_id = ?1 AND tab_id = ?2",
        params![project_id, tab_id],
    )?;
    Ok(changed > 0)
}

//! SQLite schema and migrations for the local document store.

use anyhow::Result;
use rusqlite::Connection;

/// Current schema version, recorded in `schema_version`.
pub const SCHEMA_VERSION: i64 = 2;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS documents (
            index_name TEXT NOT NULL,
            doc_id TEXT NOT NULL,
            ts TEXT,
            body_json TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (index_name, doc_id)
        );

        CREATE INDEX IF NOT EXISTS idx_documents_ts ON documents(index_name, ts);",
    )?;

    // v2: severity column for the escalation lookup
    let has_severity: i32 = conn
        .query_row(
            "SELECT count(*) FROM pragma_table_info('documents') WHERE name='severity'",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if has_severity == 0 {
        conn.execute("ALTER TABLE documents ADD COLUMN severity TEXT", [])?;
    }
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_documents_severity ON documents(index_name, severity, ts)",
        [],
    )?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
        [SCHEMA_VERSION],
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrate_creates_tables() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM documents", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);

        let version: i64 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap();
    }
}

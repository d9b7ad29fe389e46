//! Database schema definitions and migration runner.
//!
//! Migrations are simple SQL strings applied in order. The SQLite
//! `user_version` pragma tracks which migrations have already been applied.

use rusqlite::Connection;
use tracing::{debug, info};

use crate::errors::DatabaseError;

/// All migrations, in order. Each entry is `(version, description, sql)`.
/// Versions start at 1.
static MIGRATIONS: &[(u32, &str, &str)] = &[
    (
        1,
        "initial catalog schema",
        r#"
        CREATE TABLE IF NOT EXISTS books (
            id                TEXT PRIMARY KEY,
            title             TEXT NOT NULL,
            author            TEXT NOT NULL,
            isbn10            TEXT UNIQUE,
            isbn13            TEXT UNIQUE,
            publisher         TEXT,
            publication_date  TEXT,
            pages             INTEGER,
            cover_url         TEXT,
            subtitle          TEXT,
            description       TEXT,
            genre             TEXT,
            series            TEXT,
            series_number     TEXT,
            original_title    TEXT,
            normalized_title  TEXT NOT NULL,
            normalized_author TEXT NOT NULL,
            created_at        TEXT NOT NULL,
            updated_at        TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_books_title_author
            ON books (normalized_title, normalized_author);

        CREATE TABLE IF NOT EXISTS memberships (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            book_id     TEXT NOT NULL REFERENCES books (id) ON DELETE CASCADE,
            media_type  TEXT NOT NULL CHECK (media_type IN
                ('hardcover', 'paperback', 'audiobook', 'ebook', 'unspecified')),
            created_at  TEXT NOT NULL,
            UNIQUE (book_id, media_type)
        );

        CREATE TABLE IF NOT EXISTS kv_state (
            key         TEXT PRIMARY KEY,
            value       TEXT NOT NULL,
            updated_at  TEXT NOT NULL
        );
        "#,
    ),
];

/// Run all pending migrations against `conn`.
pub fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    let current_version = get_schema_version(conn)?;
    info!(
        current_version,
        target_version = MIGRATIONS.last().map(|m| m.0).unwrap_or(0),
        "checking database migrations"
    );

    for &(version, description, sql) in MIGRATIONS {
        if version > current_version {
            info!(version, description, "applying migration");
            conn.execute_batch(sql)
                .map_err(|e| DatabaseError::MigrationFailed {
                    version,
                    detail: e.to_string(),
                })?;
            set_schema_version(conn, version)?;
            debug!(version, "migration applied successfully");
        }
    }

    Ok(())
}

/// Read the current schema version from the SQLite `user_version` pragma.
fn get_schema_version(conn: &Connection) -> Result<u32, DatabaseError> {
    let version: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(version)
}

/// Set the schema version via the SQLite `user_version` pragma.
fn set_schema_version(conn: &Connection, version: u32) -> Result<(), DatabaseError> {
    conn.pragma_update(None, "user_version", version)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_run_idempotently() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), 1);
    }

    #[test]
    fn test_tables_created() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        let tables: Vec<String> = {
            let mut stmt = conn
                .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
                .unwrap();
            stmt.query_map([], |row| row.get(0))
                .unwrap()
                .filter_map(|r| r.ok())
                .collect()
        };

        assert!(tables.contains(&"books".to_string()));
        assert!(tables.contains(&"memberships".to_string()));
        assert!(tables.contains(&"kv_state".to_string()));
    }

    #[test]
    fn test_membership_media_type_is_checked() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        conn.execute(
            "INSERT INTO books (id, title, author, normalized_title, normalized_author, created_at, updated_at)
             VALUES ('b1', 't', 'a', 't', 'a', 'now', 'now')",
            [],
        )
        .unwrap();
        let result = conn.execute(
            "INSERT INTO memberships (book_id, media_type, created_at) VALUES ('b1', 'vinyl', 'now')",
            [],
        );
        assert!(result.is_err());
    }
}

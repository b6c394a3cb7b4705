//! Database schema and migrations.
//!
//! The schema version lives in SQLite's `user_version` header field. Each
//! migration runs in its own transaction together with the version bump, so
//! an interrupted upgrade resumes at the first step that did not commit.

use rusqlite::Connection;
use tracing::info;

use crate::error::Result;

struct Migration {
    version: i32,
    name: &'static str,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "rules and body blobs",
        // Rule values are stored normalized; bodies are keyed by SHA-256.
        sql: "
            CREATE TABLE rules (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                rule_type TEXT NOT NULL,
                value TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                note TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                UNIQUE (rule_type, value)
            );
            CREATE INDEX idx_rules_type_enabled ON rules (rule_type, enabled);

            CREATE TABLE body_blobs (
                hash TEXT PRIMARY KEY,
                mime_type TEXT NOT NULL,
                size INTEGER NOT NULL,
                data BLOB NOT NULL,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
        ",
    },
    Migration {
        version: 2,
        name: "verdict log",
        sql: "
            CREATE TABLE verdict_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                transport TEXT NOT NULL,
                classification TEXT NOT NULL,
                method TEXT NOT NULL,
                url TEXT NOT NULL,
                canonical TEXT NOT NULL,
                status INTEGER,
                rule_type TEXT,
                rule_value TEXT,
                dns_host TEXT,
                request_blob TEXT,
                response_blob TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX idx_verdict_log_created_at ON verdict_log (created_at);
            CREATE INDEX idx_verdict_log_classification ON verdict_log (classification);
        ",
    },
];

/// Current schema version.
pub const SCHEMA_VERSION: i32 = 2;

/// Run all pending migrations.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    run_migrations_to(conn, SCHEMA_VERSION)
}

fn run_migrations_to(conn: &Connection, target: i32) -> Result<()> {
    let current = schema_version(conn)?;

    for migration in MIGRATIONS
        .iter()
        .filter(|m| m.version > current && m.version <= target)
    {
        info!(
            "Applying migration v{}: {}",
            migration.version, migration.name
        );
        conn.execute_batch(&format!(
            "BEGIN;\n{}\nPRAGMA user_version = {};\nCOMMIT;",
            migration.sql, migration.version
        ))
        .inspect_err(|_| {
            // Leave no half-applied step behind.
            let _ = conn.execute_batch("ROLLBACK;");
        })?;
    }

    Ok(())
}

/// Returns the schema version recorded in the database header.
pub fn schema_version(conn: &Connection) -> Result<i32> {
    Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_exists(conn: &Connection, table: &str) -> bool {
        conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [table],
            |row| row.get::<_, i64>(0),
        )
        .unwrap()
            == 1
    }

    #[test]
    fn migrations_create_tables() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        for table in ["rules", "body_blobs", "verdict_log"] {
            assert!(table_exists(&conn, table), "missing table {table}");
        }
        assert_eq!(schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();
        assert_eq!(schema_version(&conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn upgrades_from_v1() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations_to(&conn, 1).unwrap();
        assert_eq!(schema_version(&conn).unwrap(), 1);
        assert!(!table_exists(&conn, "verdict_log"));

        run_migrations(&conn).unwrap();
        assert!(table_exists(&conn, "verdict_log"));
        assert_eq!(schema_version(&conn).unwrap(), 2);
    }

    #[test]
    fn versions_are_ascending() {
        assert!(MIGRATIONS.windows(2).all(|w| w[0].version < w[1].version));
        assert_eq!(MIGRATIONS.last().map(|m| m.version), Some(SCHEMA_VERSION));
    }
}

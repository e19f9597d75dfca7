//! Database schema and migrations.

use anyhow::Result;
use rusqlite::{Connection, OptionalExtension};
use tracing::info;

pub const SCHEMA_VERSION: i64 = 2;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS anomalies (
            anomaly_id TEXT PRIMARY KEY,
            metric_name TEXT NOT NULL,
            severity TEXT NOT NULL,
            resolution_status TEXT NOT NULL DEFAULT 'open',
            observed_at TEXT NOT NULL,
            record_json TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS anomaly_transitions (
            id INTEGER PRIMARY KEY,
            anomaly_id TEXT NOT NULL,
            from_status TEXT NOT NULL,
            to_status TEXT NOT NULL,
            changed_at TEXT NOT NULL,
            FOREIGN KEY (anomaly_id) REFERENCES anomalies(anomaly_id)
        );

        CREATE INDEX IF NOT EXISTS idx_anomalies_observed ON anomalies(observed_at);
        CREATE INDEX IF NOT EXISTS idx_anomalies_status ON anomalies(resolution_status);
        CREATE INDEX IF NOT EXISTS idx_transitions_anomaly ON anomaly_transitions(anomaly_id);",
    )?;

    // Version 2: track when the lifecycle column last changed.
    let has_updated_at: i32 = conn
        .query_row(
            "SELECT count(*) FROM pragma_table_info('anomalies') WHERE name='updated_at'",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);
    if has_updated_at == 0 {
        conn.execute("ALTER TABLE anomalies ADD COLUMN updated_at TEXT", [])?;
        conn.execute(
            "UPDATE anomalies SET updated_at = created_at WHERE updated_at IS NULL",
            [],
        )?;
    }

    let current: Option<i64> = conn
        .query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))
        .optional()?
        .flatten();
    if current.unwrap_or(0) < SCHEMA_VERSION {
        conn.execute(
            "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
            [SCHEMA_VERSION],
        )?;
        info!(version = SCHEMA_VERSION, "database schema migrated");
    }

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
            .query_row("SELECT COUNT(*) FROM anomalies", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM anomaly_transitions", [], |row| row.get(0))
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

        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[test]
    fn test_upgrades_version_one_table() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE anomalies (
                anomaly_id TEXT PRIMARY KEY,
                metric_name TEXT NOT NULL,
                severity TEXT NOT NULL,
                resolution_status TEXT NOT NULL DEFAULT 'open',
                observed_at TEXT NOT NULL,
                record_json TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            INSERT INTO anomalies VALUES
                ('rps_1.000000', 'rps', 'warning', 'open', '1970-01-01T00:00:01Z', '{}', '2025-01-01T00:00:00Z');",
        )
        .unwrap();

        migrate(&conn).unwrap();
        let updated: String = conn
            .query_row("SELECT updated_at FROM anomalies", [], |row| row.get(0))
            .unwrap();
        assert_eq!(updated, "2025-01-01T00:00:00Z");
    }
}

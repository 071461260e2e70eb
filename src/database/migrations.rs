//! Database migrations for sienge-sync
//!
//! This module contains SQL migrations for the SQLite database schema.

/// SQL statement to create the initial database schema
pub const CREATE_SCHEMA: &str = r#"
-- Upstream API credentials (password stored encrypted)
CREATE TABLE IF NOT EXISTS api_credentials (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    subdomain TEXT NOT NULL UNIQUE,
    username TEXT NOT NULL,
    password_ciphertext TEXT NOT NULL,
    password_iv TEXT NOT NULL,
    password_tag TEXT NOT NULL,
    password_salt TEXT NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 1,
    created_at DATETIME DEFAULT CURRENT_TIMESTAMP,
    updated_at DATETIME DEFAULT CURRENT_TIMESTAMP
);

-- Sync runs table
CREATE TABLE IF NOT EXISTS sync_runs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    entities TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    records_processed INTEGER NOT NULL DEFAULT 0,
    records_inserted INTEGER NOT NULL DEFAULT 0,
    records_updated INTEGER NOT NULL DEFAULT 0,
    records_errors INTEGER NOT NULL DEFAULT 0,
    api_calls_made INTEGER NOT NULL DEFAULT 0,
    started_at DATETIME DEFAULT CURRENT_TIMESTAMP,
    completed_at DATETIME,
    error_message TEXT
);

-- At most one run may be in progress
CREATE UNIQUE INDEX IF NOT EXISTS idx_sync_runs_single_active
    ON sync_runs(status) WHERE status = 'in_progress';
CREATE INDEX IF NOT EXISTS idx_sync_runs_started ON sync_runs(started_at DESC);

-- Synchronized upstream records, one row per (entity, upstream id)
CREATE TABLE IF NOT EXISTS entity_records (
    entity TEXT NOT NULL,
    external_id TEXT NOT NULL,
    payload TEXT NOT NULL,
    synced_at DATETIME DEFAULT CURRENT_TIMESTAMP,
    PRIMARY KEY (entity, external_id)
);
"#;

/// Get the migration version
pub fn migration_version() -> i32 {
    1
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn test_create_schema_valid_sql() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(CREATE_SCHEMA).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(Result::ok)
            .collect();

        assert!(tables.contains(&"api_credentials".to_string()));
        assert!(tables.contains(&"sync_runs".to_string()));
        assert!(tables.contains(&"entity_records".to_string()));
    }

    #[test]
    fn test_schema_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(CREATE_SCHEMA).unwrap();
        conn.execute_batch(CREATE_SCHEMA).unwrap();
    }

    #[test]
    fn test_single_active_run_index() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(CREATE_SCHEMA).unwrap();

        conn.execute(
            "INSERT INTO sync_runs (entities, status) VALUES ('[]', 'in_progress')",
            [],
        )
        .unwrap();

        // A second active run violates the partial unique index
        let result = conn.execute(
            "INSERT INTO sync_runs (entities, status) VALUES ('[]', 'in_progress')",
            [],
        );
        assert!(result.is_err());

        // Terminal runs are unconstrained
        conn.execute(
            "INSERT INTO sync_runs (entities, status) VALUES ('[]', 'completed')",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO sync_runs (entities, status) VALUES ('[]', 'completed')",
            [],
        )
        .unwrap();
    }

    #[test]
    fn test_credentials_subdomain_unique() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(CREATE_SCHEMA).unwrap();

        let insert = "INSERT INTO api_credentials \
            (subdomain, username, password_ciphertext, password_iv, password_tag, password_salt) \
            VALUES (?, ?, 'c', 'i', 't', 's')";
        conn.execute(insert, ["acme", "user1"]).unwrap();

        let result = conn.execute(insert, ["acme", "user2"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_migration_version() {
        assert_eq!(migration_version(), 1);
    }
}

//! SQLite implementation of the Database trait
//!
//! This module provides a SQLite-based implementation of the Database trait
//! using rusqlite and tokio-rusqlite for async operations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::OptionalExtension;
use tokio_rusqlite::Connection;

use super::migrations::CREATE_SCHEMA;
use super::Database;
use crate::error::DbError;
use crate::models::{
    EncryptedSecret, EntitySlot, RunStatus, SaveSummary, StoredCredentials, SyncRun,
    UpsertOutcome,
};

const RUN_COLUMNS: &str = "id, entities, status, records_processed, records_inserted, \
    records_updated, records_errors, api_calls_made, started_at, completed_at, error_message";

/// SQLite database implementation
pub struct SqliteDatabase {
    conn: Connection,
}

impl SqliteDatabase {
    /// Create a new SQLite database connection
    ///
    /// Use `:memory:` for in-memory database or a file path for persistent storage.
    pub async fn new(path: &str) -> Result<Self, DbError> {
        let conn = Connection::open(path).await?;

        // Run migrations
        conn.call(|conn| {
            conn.execute_batch(CREATE_SCHEMA)?;
            Ok(())
        })
        .await?;

        Ok(Self { conn })
    }

    /// Create a new in-memory database (useful for testing)
    pub async fn in_memory() -> Result<Self, DbError> {
        Self::new(":memory:").await
    }

    async fn query_run(&self, filter: &'static str, id: Option<i64>) -> Result<Option<SyncRun>, DbError> {
        self.conn
            .call(move |conn| {
                let sql = format!("SELECT {} FROM sync_runs {}", RUN_COLUMNS, filter);
                let mut stmt = conn.prepare(&sql)?;

                let result = match id {
                    Some(id) => stmt.query_row([id], row_to_run).optional()?,
                    None => stmt.query_row([], row_to_run).optional()?,
                };

                Ok(result)
            })
            .await
            .map_err(Into::into)
    }
}

#[async_trait]
impl Database for SqliteDatabase {
    // =========================================================================
    // Credential operations
    // =========================================================================

    async fn get_active_credentials(&self) -> Result<Option<StoredCredentials>, DbError> {
        self.conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    r#"
                    SELECT subdomain, username, password_ciphertext, password_iv,
                           password_tag, password_salt, is_active, created_at, updated_at
                    FROM api_credentials
                    WHERE is_active = 1
                    ORDER BY updated_at DESC, id DESC
                    LIMIT 1
                    "#,
                )?;

                let result = stmt
                    .query_row([], |row| {
                        Ok(StoredCredentials {
                            subdomain: row.get(0)?,
                            username: row.get(1)?,
                            password: EncryptedSecret {
                                ciphertext: row.get(2)?,
                                iv: row.get(3)?,
                                tag: row.get(4)?,
                                salt: row.get(5)?,
                            },
                            is_active: row.get::<_, i32>(6)? != 0,
                            created_at: parse_datetime(row.get::<_, Option<String>>(7)?)
                                .unwrap_or_else(Utc::now),
                            updated_at: parse_datetime(row.get::<_, Option<String>>(8)?)
                                .unwrap_or_else(Utc::now),
                        })
                    })
                    .optional()?;

                Ok(result)
            })
            .await
            .map_err(Into::into)
    }

    async fn upsert_credentials(
        &self,
        credentials: &StoredCredentials,
    ) -> Result<UpsertOutcome, DbError> {
        let subdomain = credentials.subdomain.clone();
        let username = credentials.username.clone();
        let secret = credentials.password.clone();
        let created_at = credentials.created_at.to_rfc3339();
        let updated_at = credentials.updated_at.to_rfc3339();

        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;

                let existed = tx
                    .prepare("SELECT 1 FROM api_credentials WHERE subdomain = ?1")?
                    .exists([&subdomain])?;

                // Superseded tenants stay on disk but are no longer active
                tx.execute(
                    "UPDATE api_credentials SET is_active = 0 WHERE subdomain != ?1",
                    [&subdomain],
                )?;

                tx.execute(
                    r#"
                    INSERT INTO api_credentials
                    (subdomain, username, password_ciphertext, password_iv, password_tag,
                     password_salt, is_active, created_at, updated_at)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7, ?8)
                    ON CONFLICT(subdomain) DO UPDATE SET
                        username = excluded.username,
                        password_ciphertext = excluded.password_ciphertext,
                        password_iv = excluded.password_iv,
                        password_tag = excluded.password_tag,
                        password_salt = excluded.password_salt,
                        is_active = 1,
                        updated_at = excluded.updated_at
                    "#,
                    rusqlite::params![
                        subdomain,
                        username,
                        secret.ciphertext,
                        secret.iv,
                        secret.tag,
                        secret.salt,
                        created_at,
                        updated_at
                    ],
                )?;

                tx.commit()?;

                Ok(if existed {
                    UpsertOutcome::Updated
                } else {
                    UpsertOutcome::Created
                })
            })
            .await
            .map_err(Into::into)
    }

    // =========================================================================
    // Sync run operations
    // =========================================================================

    async fn create_run(&self, run: &SyncRun) -> Result<Option<i64>, DbError> {
        let entities = encode_entities(&run.entities)?;
        let started_at = run.started_at.to_rfc3339();

        self.conn
            .call(move |conn| {
                let result = conn.execute(
                    r#"
                    INSERT INTO sync_runs (entities, status, started_at)
                    SELECT ?1, 'in_progress', ?2
                    WHERE NOT EXISTS (SELECT 1 FROM sync_runs WHERE status = 'in_progress')
                    "#,
                    rusqlite::params![entities, started_at],
                );

                match result {
                    Ok(0) => Ok(None),
                    Ok(_) => Ok(Some(conn.last_insert_rowid())),
                    // Lost a race against another writer on the same file
                    Err(rusqlite::Error::SqliteFailure(err, _))
                        if err.code == rusqlite::ErrorCode::ConstraintViolation =>
                    {
                        Ok(None)
                    }
                    Err(e) => Err(e.into()),
                }
            })
            .await
            .map_err(Into::into)
    }

    async fn update_run_progress(&self, run: &SyncRun) -> Result<bool, DbError> {
        let id = run.id.ok_or(DbError::NotFound)?;
        let entities = encode_entities(&run.entities)?;
        let status = run.status.to_string();
        let counters = [
            run.records_processed as i64,
            run.records_inserted as i64,
            run.records_updated as i64,
            run.records_errors as i64,
            run.api_calls_made as i64,
        ];
        let completed_at = run.completed_at.map(|dt| dt.to_rfc3339());
        let error_message = run.error_message.clone();

        self.conn
            .call(move |conn| {
                let count = conn.execute(
                    r#"
                    UPDATE sync_runs
                    SET entities = ?1, status = ?2, records_processed = ?3,
                        records_inserted = ?4, records_updated = ?5, records_errors = ?6,
                        api_calls_made = ?7, completed_at = ?8, error_message = ?9
                    WHERE id = ?10 AND status = 'in_progress'
                    "#,
                    rusqlite::params![
                        entities,
                        status,
                        counters[0],
                        counters[1],
                        counters[2],
                        counters[3],
                        counters[4],
                        completed_at,
                        error_message,
                        id
                    ],
                )?;
                Ok(count > 0)
            })
            .await
            .map_err(Into::into)
    }

    async fn cancel_active_run(&self, reason: &str) -> Result<Option<i64>, DbError> {
        let reason = reason.to_string();
        let completed_at = Utc::now().to_rfc3339();

        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;

                let id: Option<i64> = tx
                    .query_row(
                        "SELECT id FROM sync_runs WHERE status = 'in_progress' LIMIT 1",
                        [],
                        |row| row.get(0),
                    )
                    .optional()?;

                if let Some(id) = id {
                    tx.execute(
                        r#"
                        UPDATE sync_runs
                        SET status = 'cancelled', completed_at = ?1, error_message = ?2
                        WHERE id = ?3
                        "#,
                        rusqlite::params![completed_at, reason, id],
                    )?;
                }

                tx.commit()?;
                Ok(id)
            })
            .await
            .map_err(Into::into)
    }

    async fn abandon_run(&self, id: i64, reason: &str) -> Result<bool, DbError> {
        let reason = reason.to_string();
        let completed_at = Utc::now().to_rfc3339();

        self.conn
            .call(move |conn| {
                let changed = conn.execute(
                    r#"
                    UPDATE sync_runs
                    SET status = 'cancelled', completed_at = ?1, error_message = ?2
                    WHERE id = ?3 AND status = 'in_progress'
                    "#,
                    rusqlite::params![completed_at, reason, id],
                )?;
                Ok(changed > 0)
            })
            .await
            .map_err(Into::into)
    }

    async fn abandon_in_progress_runs(&self, reason: &str) -> Result<u64, DbError> {
        let reason = reason.to_string();
        let completed_at = Utc::now().to_rfc3339();

        self.conn
            .call(move |conn| {
                let changed = conn.execute(
                    r#"
                    UPDATE sync_runs
                    SET status = 'cancelled', completed_at = ?1, error_message = ?2
                    WHERE status = 'in_progress'
                    "#,
                    rusqlite::params![completed_at, reason],
                )?;
                Ok(changed as u64)
            })
            .await
            .map_err(Into::into)
    }

    async fn get_run(&self, id: i64) -> Result<Option<SyncRun>, DbError> {
        self.query_run("WHERE id = ?1", Some(id)).await
    }

    async fn get_latest_run(&self) -> Result<Option<SyncRun>, DbError> {
        self.query_run("ORDER BY started_at DESC, id DESC LIMIT 1", None)
            .await
    }

    async fn get_active_run(&self) -> Result<Option<SyncRun>, DbError> {
        self.query_run("WHERE status = 'in_progress' LIMIT 1", None)
            .await
    }

    // =========================================================================
    // Entity record operations
    // =========================================================================

    async fn save_records(
        &self,
        entity: &str,
        records: &[serde_json::Value],
    ) -> Result<SaveSummary, DbError> {
        let entity = entity.to_string();
        let mut missing_id = 0u64;
        let keyed: Vec<(String, String)> = records
            .iter()
            .filter_map(|record| match record_key(record) {
                Some(key) => Some((key, record.to_string())),
                None => {
                    missing_id += 1;
                    None
                }
            })
            .collect();
        let synced_at = Utc::now().to_rfc3339();

        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let mut summary = SaveSummary {
                    errors: missing_id,
                    ..SaveSummary::default()
                };

                {
                    let mut exists = tx.prepare(
                        "SELECT 1 FROM entity_records WHERE entity = ?1 AND external_id = ?2",
                    )?;
                    let mut insert = tx.prepare(
                        r#"
                        INSERT INTO entity_records (entity, external_id, payload, synced_at)
                        VALUES (?1, ?2, ?3, ?4)
                        "#,
                    )?;
                    let mut update = tx.prepare(
                        r#"
                        UPDATE entity_records SET payload = ?3, synced_at = ?4
                        WHERE entity = ?1 AND external_id = ?2
                        "#,
                    )?;

                    for (key, payload) in &keyed {
                        let params = rusqlite::params![entity, key, payload, synced_at];
                        if exists.exists(rusqlite::params![entity, key])? {
                            update.execute(params)?;
                            summary.updated += 1;
                        } else {
                            insert.execute(params)?;
                            summary.inserted += 1;
                        }
                    }
                }

                tx.commit()?;
                Ok(summary)
            })
            .await
            .map_err(Into::into)
    }

    async fn count_records(&self, entity: &str) -> Result<u64, DbError> {
        let entity = entity.to_string();

        self.conn
            .call(move |conn| {
                let count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM entity_records WHERE entity = ?1",
                    [&entity],
                    |row| row.get(0),
                )?;
                Ok(count as u64)
            })
            .await
            .map_err(Into::into)
    }
}

fn encode_entities(entities: &[EntitySlot]) -> Result<String, DbError> {
    serde_json::to_string(entities).map_err(|e| DbError::Serialization(e.to_string()))
}

/// Upstream identifier of a record: its `id` field as a string
fn record_key(record: &serde_json::Value) -> Option<String> {
    match record.get("id")? {
        serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn row_to_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<SyncRun> {
    let entities_json: String = row.get(1)?;
    let entities: Vec<EntitySlot> = serde_json::from_str(&entities_json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(1, Type::Text, Box::new(e)))?;

    Ok(SyncRun {
        id: Some(row.get(0)?),
        entities,
        status: parse_run_status(row.get::<_, String>(2)?),
        records_processed: row.get::<_, i64>(3)? as u64,
        records_inserted: row.get::<_, i64>(4)? as u64,
        records_updated: row.get::<_, i64>(5)? as u64,
        records_errors: row.get::<_, i64>(6)? as u64,
        api_calls_made: row.get::<_, i64>(7)? as u64,
        started_at: parse_datetime(row.get::<_, Option<String>>(8)?).unwrap_or_else(Utc::now),
        completed_at: parse_datetime(row.get::<_, Option<String>>(9)?),
        error_message: row.get(10)?,
    })
}

/// Parse a datetime string to DateTime<Utc>
fn parse_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|s| {
        DateTime::parse_from_rfc3339(&s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
            .or_else(|| {
                // Try parsing SQLite's datetime format
                chrono::NaiveDateTime::parse_from_str(&s, "%Y-%m-%d %H:%M:%S")
                    .ok()
                    .map(|dt| dt.and_utc())
            })
    })
}

/// Parse a run status string
fn parse_run_status(s: String) -> RunStatus {
    s.parse().unwrap_or(RunStatus::Pending)
}

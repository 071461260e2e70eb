//! Database layer for sienge-sync
//!
//! This module defines the database trait and SQLite implementation.

pub mod migrations;
pub mod sqlite;

pub use sqlite::SqliteDatabase;

use async_trait::async_trait;

use crate::error::DbError;
use crate::models::{SaveSummary, StoredCredentials, SyncRun, UpsertOutcome};

/// Database trait for data persistence
///
/// This trait defines all database operations needed by the sync engine.
/// It uses `async_trait` for async methods and `mockall::automock` for testing.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Database: Send + Sync {
    // =========================================================================
    // Credential operations
    // =========================================================================

    /// Get the active credentials record, if any
    async fn get_active_credentials(&self) -> Result<Option<StoredCredentials>, DbError>;

    /// Insert or replace the credentials for a subdomain and make it the active record
    async fn upsert_credentials(
        &self,
        credentials: &StoredCredentials,
    ) -> Result<UpsertOutcome, DbError>;

    // =========================================================================
    // Sync run operations
    // =========================================================================

    /// Insert a run in `in_progress` state
    ///
    /// Returns the new run ID, or None if another run is already in progress.
    async fn create_run(&self, run: &SyncRun) -> Result<Option<i64>, DbError>;

    /// Persist progress of an in-progress run
    ///
    /// Only applies while the stored run is still `in_progress`. Returns false
    /// when another actor already moved it to a terminal status.
    async fn update_run_progress(&self, run: &SyncRun) -> Result<bool, DbError>;

    /// Mark the in-progress run as cancelled
    ///
    /// Returns the cancelled run ID, or None if nothing was running.
    async fn cancel_active_run(&self, reason: &str) -> Result<Option<i64>, DbError>;

    /// Mark a specific run as cancelled if it is still in progress
    ///
    /// Returns false when the run had already reached a terminal status.
    async fn abandon_run(&self, id: i64, reason: &str) -> Result<bool, DbError>;

    /// Mark every in-progress run as cancelled and return how many were closed
    async fn abandon_in_progress_runs(&self, reason: &str) -> Result<u64, DbError>;

    /// Get a run by ID
    async fn get_run(&self, id: i64) -> Result<Option<SyncRun>, DbError>;

    /// Get the most recently started run
    async fn get_latest_run(&self) -> Result<Option<SyncRun>, DbError>;

    /// Get the run currently in progress
    async fn get_active_run(&self) -> Result<Option<SyncRun>, DbError>;

    // =========================================================================
    // Entity record operations
    // =========================================================================

    /// Upsert fetched records for an entity, keyed by each record's `id`
    async fn save_records(
        &self,
        entity: &str,
        records: &[serde_json::Value],
    ) -> Result<SaveSummary, DbError>;

    /// Count stored records for an entity
    async fn count_records(&self, entity: &str) -> Result<u64, DbError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EncryptedSecret, RunStatus};

    fn secret() -> EncryptedSecret {
        EncryptedSecret {
            ciphertext: "aa".to_string(),
            iv: "bb".to_string(),
            tag: "cc".to_string(),
            salt: "dd".to_string(),
        }
    }

    // Test 1: MockDatabase credential operations
    #[tokio::test]
    async fn test_mock_database_credentials() {
        let mut mock = MockDatabase::new();

        mock.expect_get_active_credentials()
            .returning(|| Ok(Some(StoredCredentials::new("acme", "api-user", secret()))));
        mock.expect_upsert_credentials()
            .withf(|c| c.subdomain == "acme")
            .returning(|_| Ok(UpsertOutcome::Updated));

        let stored = mock.get_active_credentials().await.unwrap().unwrap();
        assert_eq!(stored.subdomain, "acme");

        let outcome = mock.upsert_credentials(&stored).await.unwrap();
        assert_eq!(outcome, UpsertOutcome::Updated);
    }

    // Test 2: MockDatabase reports a rejected run
    #[tokio::test]
    async fn test_mock_database_create_run_rejected() {
        let mut mock = MockDatabase::new();

        mock.expect_create_run().returning(|_| Ok(None));

        let run = SyncRun::new(["companies"]).in_progress();
        assert_eq!(mock.create_run(&run).await.unwrap(), None);
    }

    // Test 3: MockDatabase run reads
    #[tokio::test]
    async fn test_mock_database_run_reads() {
        let mut mock = MockDatabase::new();

        mock.expect_get_latest_run().returning(|| {
            let mut run = SyncRun::new(["companies"]).finish();
            run.id = Some(7);
            Ok(Some(run))
        });
        mock.expect_get_run()
            .withf(|id| *id == 7)
            .returning(|_| Ok(None));

        let latest = mock.get_latest_run().await.unwrap().unwrap();
        assert_eq!(latest.id, Some(7));
        assert_eq!(latest.status, RunStatus::Completed);
        assert!(mock.get_run(7).await.unwrap().is_none());
    }

    // Test 4: MockDatabase error handling
    #[tokio::test]
    async fn test_mock_database_error_handling() {
        let mut mock = MockDatabase::new();

        mock.expect_save_records()
            .returning(|_, _| Err(DbError::Serialization("bad".to_string())));

        let result = mock.save_records("companies", &[]).await;
        match result {
            Err(DbError::Serialization(msg)) => assert_eq!(msg, "bad"),
            _ => panic!("Expected DbError::Serialization"),
        }
    }
}

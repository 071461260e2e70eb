//! Domain models for sienge-sync
//!
//! This module contains the core domain models used throughout the application.

pub mod credentials;
pub mod run;

// Re-export commonly used types
pub use credentials::{
    Credentials, CredentialsSummary, EncryptedSecret, StoredCredentials, UpsertOutcome,
};
pub use run::{EntitySlot, EntityStatus, RunStatus, SaveSummary, SyncRun};

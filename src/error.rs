//! Application error types for sienge-sync
//!
//! This module defines the error taxonomy used throughout the crate.
//! All error types use `thiserror` for ergonomic error handling.

use std::time::Duration;

use thiserror::Error;

/// Credential vault errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum VaultError {
    /// Authentication tag did not verify
    #[error("Integrity check failed: ciphertext, nonce or tag was altered")]
    Integrity,

    /// A stored field could not be decoded
    #[error("Malformed encrypted secret: {0}")]
    Malformed(String),

    /// Encryption could not be performed
    #[error("Encryption failed: {0}")]
    Encryption(String),
}

/// Database-related errors
#[derive(Debug, Error)]
pub enum DbError {
    /// SQLite error
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Error from the async connection wrapper
    #[error("Database error: {0}")]
    Connection(#[from] tokio_rusqlite::Error),

    /// Record not found
    #[error("Record not found")]
    NotFound,

    /// Constraint violation
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// Migration error
    #[error("Migration error: {0}")]
    Migration(String),

    /// A JSON column could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Upstream synchronization errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SyncError {
    /// Network timeout
    #[error("Network timeout")]
    NetworkTimeout,

    /// Connection refused
    #[error("Connection refused")]
    ConnectionRefused,

    /// Rate limited by upstream
    #[error("Rate limited, retry after {0} seconds")]
    RateLimited(u64),

    /// Server error
    #[error("Server error: HTTP {0}")]
    ServerError(u16),

    /// 4xx response other than 429
    #[error("Client error: HTTP {status}: {message}")]
    ClientError {
        /// Upstream status code
        status: u16,
        /// Upstream response body or reason phrase
        message: String,
    },

    /// Invalid data received
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Request rejected because the admission queue is full
    #[error("Request queue is full")]
    QueueFull,

    /// A fetch was attempted before credentials were loaded
    #[error("Upstream client is not initialized")]
    NotInitialized,

    /// Generic network error
    #[error("Network error: {0}")]
    Network(String),
}

impl SyncError {
    /// Upstream HTTP status, if the error carries one
    pub fn status(&self) -> Option<u16> {
        match self {
            SyncError::ServerError(code) => Some(*code),
            SyncError::ClientError { status, .. } => Some(*status),
            SyncError::RateLimited(_) => Some(429),
            _ => None,
        }
    }

    /// True for 401/403 responses
    pub fn is_auth_rejection(&self) -> bool {
        matches!(self.status(), Some(401) | Some(403))
    }
}

/// Application-level error type
///
/// Aggregates the domain-specific errors and adds the configuration
/// failures surfaced by initialization and run admission.
#[derive(Debug, Error)]
pub enum AppError {
    /// No credentials are stored for the upstream API
    #[error("Upstream credentials are not configured")]
    NotConfigured,

    /// Credentials exist but the upstream refused them
    #[error("Upstream rejected the configured credentials for subdomain '{0}'")]
    CredentialsRejected(String),

    /// Validation call failed before producing an answer
    #[error("Credential validation was inconclusive: {0}")]
    ValidationInconclusive(String),

    /// Credential input failed local validation
    #[error("Invalid credentials input: {0}")]
    InvalidCredentials(String),

    /// Another run is already in progress
    #[error("A sync run is already in progress (run {0})")]
    RunInProgress(i64),

    /// Vault error
    #[error("Vault error: {0}")]
    Vault(#[from] VaultError),

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    /// Sync error
    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// True for the errors that mean "fix your configuration"
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            AppError::NotConfigured
                | AppError::CredentialsRejected(_)
                | AppError::ValidationInconclusive(_)
                | AppError::InvalidCredentials(_)
                | AppError::Config(_)
        )
    }
}

/// Trait for determining if an error is retryable
pub trait RetryableError {
    /// Returns true if the error is transient
    fn is_retryable(&self) -> bool;

    /// Returns true if the request never reached the upstream
    fn is_connection_level(&self) -> bool {
        false
    }

    /// Minimum wait requested by the upstream before the next attempt
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

impl RetryableError for SyncError {
    fn is_retryable(&self) -> bool {
        match self {
            SyncError::NetworkTimeout => true,
            SyncError::ConnectionRefused => true,
            SyncError::RateLimited(_) => true,
            SyncError::ServerError(code) if *code >= 500 => true,
            SyncError::Network(_) => true,

            SyncError::ServerError(_) => false,
            SyncError::ClientError { .. } => false,
            SyncError::InvalidData(_) => false,
            SyncError::QueueFull => false,
            SyncError::NotInitialized => false,
        }
    }

    fn is_connection_level(&self) -> bool {
        matches!(self, SyncError::ConnectionRefused)
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            SyncError::RateLimited(secs) => Some(Duration::from_secs(*secs)),
            _ => None,
        }
    }
}

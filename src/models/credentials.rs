//! Credential-related domain models
//!
//! This module defines the plaintext credential triple used for outbound
//! authentication, its encrypted at-rest form, and the stored record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum length of a tenant subdomain
pub const MAX_SUBDOMAIN_LEN: usize = 50;

/// Upstream API credentials in plaintext
///
/// Only ever held in memory. The `Debug` impl redacts the password.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    /// Tenant identifier
    pub subdomain: String,

    /// API username
    pub username: String,

    /// API password
    pub password: String,
}

impl Credentials {
    /// Create a new credential triple
    pub fn new(
        subdomain: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            subdomain: subdomain.into(),
            username: username.into(),
            password: password.into(),
        }
    }

    /// Check the input rules for administrative credential updates
    ///
    /// Returns a human-readable reason on failure.
    pub fn validate(&self) -> Result<(), String> {
        if self.subdomain.is_empty() || self.subdomain.len() > MAX_SUBDOMAIN_LEN {
            return Err(format!(
                "subdomain must be 1 to {} characters",
                MAX_SUBDOMAIN_LEN
            ));
        }
        if !self
            .subdomain
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return Err("subdomain may only contain letters, digits and hyphens".to_string());
        }

        let username_len = self.username.chars().count();
        if !(3..=100).contains(&username_len) {
            return Err("username must be 3 to 100 characters".to_string());
        }

        let password_len = self.password.chars().count();
        if !(8..=200).contains(&password_len) {
            return Err("password must be 8 to 200 characters".to_string());
        }

        Ok(())
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("subdomain", &self.subdomain)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Authenticated ciphertext with everything needed to decrypt it
///
/// All fields are hex-encoded. Salt and nonce are fresh per encryption.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedSecret {
    /// Encrypted bytes without the authentication tag
    pub ciphertext: String,

    /// AES-GCM nonce
    pub iv: String,

    /// AES-GCM authentication tag
    pub tag: String,

    /// PBKDF2 salt for key derivation
    pub salt: String,
}

/// Credentials record as persisted in the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredCredentials {
    /// Tenant identifier (unique)
    pub subdomain: String,

    /// API username
    pub username: String,

    /// Encrypted password
    pub password: EncryptedSecret,

    /// Whether this record is the active one
    pub is_active: bool,

    /// When the record was first created
    pub created_at: DateTime<Utc>,

    /// When the record was last updated
    pub updated_at: DateTime<Utc>,
}

impl StoredCredentials {
    /// Create an active record stamped with the current time
    pub fn new(
        subdomain: impl Into<String>,
        username: impl Into<String>,
        password: EncryptedSecret,
    ) -> Self {
        let now = Utc::now();
        Self {
            subdomain: subdomain.into(),
            username: username.into(),
            password,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Credentials record without any secret material
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialsSummary {
    pub subdomain: String,
    pub username: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&StoredCredentials> for CredentialsSummary {
    fn from(stored: &StoredCredentials) -> Self {
        Self {
            subdomain: stored.subdomain.clone(),
            username: stored.username.clone(),
            is_active: stored.is_active,
            created_at: stored.created_at,
            updated_at: stored.updated_at,
        }
    }
}

/// Whether an upsert created a new record or replaced an existing one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Created,
    Updated,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> Credentials {
        Credentials::new("acme-corp", "api-user", "s3cret-pass")
    }

    #[test]
    fn test_credentials_validate_ok() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn test_credentials_validate_subdomain() {
        let mut creds = valid();
        creds.subdomain = "acme_corp".to_string();
        assert!(creds.validate().is_err());

        creds.subdomain = "a".repeat(51);
        assert!(creds.validate().is_err());

        creds.subdomain = String::new();
        assert!(creds.validate().is_err());

        creds.subdomain = "a".repeat(50);
        assert!(creds.validate().is_ok());
    }

    #[test]
    fn test_credentials_validate_lengths() {
        let mut creds = valid();
        creds.username = "ab".to_string();
        assert!(creds.validate().is_err());

        let mut creds = valid();
        creds.password = "short".to_string();
        assert!(creds.validate().is_err());

        let mut creds = valid();
        creds.password = "p".repeat(201);
        assert!(creds.validate().is_err());
    }

    #[test]
    fn test_credentials_debug_redacts_password() {
        let rendered = format!("{:?}", valid());
        assert!(rendered.contains("acme-corp"));
        assert!(!rendered.contains("s3cret-pass"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn test_summary_from_stored() {
        let stored = StoredCredentials::new(
            "acme",
            "api-user",
            EncryptedSecret {
                ciphertext: "00".to_string(),
                iv: "11".to_string(),
                tag: "22".to_string(),
                salt: "33".to_string(),
            },
        );

        let summary = CredentialsSummary::from(&stored);
        assert_eq!(summary.subdomain, "acme");
        assert_eq!(summary.username, "api-user");
        assert!(summary.is_active);
        assert_eq!(summary.created_at, stored.created_at);
    }

    #[test]
    fn test_upsert_outcome_serialization() {
        assert_eq!(
            serde_json::to_string(&UpsertOutcome::Created).unwrap(),
            "\"created\""
        );
    }
}

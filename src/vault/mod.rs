//! Credential vault
//!
//! Encrypts upstream API secrets at rest using AES-256-GCM. Every encryption
//! derives a fresh key from the master key and a random salt (PBKDF2-HMAC-SHA512),
//! so no two records share key material.
//!
//! ```ignore
//! let vault = Vault::new(Some("master"), Environment::Production);
//! let secret = vault.encrypt("s3cret")?;
//! assert_eq!(vault.decrypt(&secret)?, "s3cret");
//! ```

use aes_gcm::aead::consts::U16;
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::aes::Aes256;
use aes_gcm::{Aes256Gcm, AesGcm, Nonce};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha512;
use tracing::warn;
use zeroize::Zeroizing;

use crate::config::{Config, Environment};
use crate::error::VaultError;
use crate::models::EncryptedSecret;

/// Legacy master key used when none is configured
pub const DEFAULT_MASTER_KEY: &str = "default-key-change-in-production";

/// PBKDF2 rounds per derivation
pub const PBKDF2_ITERATIONS: u32 = 100_000;

const KEY_LEN: usize = 32;
const SALT_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const LEGACY_NONCE_LEN: usize = 16;
const TAG_LEN: usize = 16;

/// AES-256-GCM with the 16-byte IVs written by earlier deployments
type LegacyAes256Gcm = AesGcm<Aes256, U16>;

/// Reversible encryption for stored credentials
#[derive(Clone)]
pub struct Vault {
    master_key: Zeroizing<String>,
}

impl std::fmt::Debug for Vault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vault")
            .field("master_key", &"[REDACTED]")
            .field("uses_default_key", &self.uses_default_key())
            .finish()
    }
}

impl Vault {
    /// Create a vault from an optional master key
    ///
    /// A missing key falls back to [`DEFAULT_MASTER_KEY`]. In production this
    /// logs a warning but still succeeds so existing deployments keep decrypting.
    pub fn new(master_key: Option<&str>, environment: Environment) -> Self {
        let key = match master_key {
            Some(key) if !key.is_empty() => key.to_string(),
            _ => DEFAULT_MASTER_KEY.to_string(),
        };

        let vault = Self {
            master_key: Zeroizing::new(key),
        };

        if environment.is_production() && vault.uses_default_key() {
            warn!(
                "Credential vault is using the built-in default master key; \
                 set vault.master_key or ENCRYPTION_MASTER_KEY before storing real credentials"
            );
        }

        vault
    }

    /// Create a vault from application configuration
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.vault.master_key.as_deref(), config.environment)
    }

    /// Whether the vault runs on the insecure built-in key
    pub fn uses_default_key(&self) -> bool {
        self.master_key.as_str() == DEFAULT_MASTER_KEY
    }

    /// Encrypt a plaintext secret
    pub fn encrypt(&self, plaintext: &str) -> Result<EncryptedSecret, VaultError> {
        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let key = self.derive_key(&salt);
        let cipher = Aes256Gcm::new_from_slice(key.as_slice()).map_err(invalid_key)?;
        let mut ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|e| VaultError::Encryption(e.to_string()))?;

        // aes-gcm appends the tag to the ciphertext; it is stored on its own
        let tag = ciphertext.split_off(ciphertext.len() - TAG_LEN);

        Ok(EncryptedSecret {
            ciphertext: hex::encode(ciphertext),
            iv: hex::encode(nonce),
            tag: hex::encode(tag),
            salt: hex::encode(salt),
        })
    }

    /// Decrypt a secret, verifying its authentication tag
    ///
    /// Both 12-byte IVs and the 16-byte IVs of earlier deployments are accepted.
    pub fn decrypt(&self, secret: &EncryptedSecret) -> Result<String, VaultError> {
        let salt = decode_field("salt", &secret.salt, Some(SALT_LEN))?;
        let nonce = decode_field("iv", &secret.iv, None)?;
        let tag = decode_field("tag", &secret.tag, Some(TAG_LEN))?;
        let mut sealed = decode_field("ciphertext", &secret.ciphertext, None)?;
        sealed.extend_from_slice(&tag);

        let key = self.derive_key(&salt);
        let opened = match nonce.len() {
            NONCE_LEN => Aes256Gcm::new_from_slice(key.as_slice())
                .map_err(invalid_key)?
                .decrypt(Nonce::from_slice(&nonce), sealed.as_slice()),
            LEGACY_NONCE_LEN => LegacyAes256Gcm::new_from_slice(key.as_slice())
                .map_err(invalid_key)?
                .decrypt(GenericArray::from_slice(&nonce), sealed.as_slice()),
            len => {
                return Err(VaultError::Malformed(format!(
                    "iv must be {} or {} bytes, got {}",
                    NONCE_LEN, LEGACY_NONCE_LEN, len
                )))
            }
        };
        let plaintext = Zeroizing::new(opened.map_err(|_| VaultError::Integrity)?);

        String::from_utf8(plaintext.to_vec())
            .map_err(|_| VaultError::Malformed("plaintext is not valid UTF-8".to_string()))
    }

    /// Check whether a secret decrypts to the given plaintext
    ///
    /// Any decryption failure yields `false`.
    pub fn verify(&self, plaintext: &str, secret: &EncryptedSecret) -> bool {
        match self.decrypt(secret) {
            Ok(decrypted) => {
                let decrypted = Zeroizing::new(decrypted);
                decrypted.as_str() == plaintext
            }
            Err(_) => false,
        }
    }

    /// Re-encrypt a secret under another vault's master key
    pub fn rotate(&self, secret: &EncryptedSecret, target: &Vault) -> Result<EncryptedSecret, VaultError> {
        let plaintext = Zeroizing::new(self.decrypt(secret)?);
        target.encrypt(&plaintext)
    }

    fn derive_key(&self, salt: &[u8]) -> Zeroizing<[u8; KEY_LEN]> {
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        pbkdf2::pbkdf2_hmac::<Sha512>(
            self.master_key.as_bytes(),
            salt,
            PBKDF2_ITERATIONS,
            key.as_mut_slice(),
        );
        key
    }
}

fn invalid_key(e: impl std::fmt::Display) -> VaultError {
    VaultError::Encryption(format!("invalid derived key: {}", e))
}

/// Generate a random master key, hex-encoded
pub fn generate_master_key() -> String {
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    OsRng.fill_bytes(key.as_mut_slice());
    hex::encode(key.as_slice())
}

fn decode_field(name: &str, value: &str, expected_len: Option<usize>) -> Result<Vec<u8>, VaultError> {
    let bytes = hex::decode(value)
        .map_err(|e| VaultError::Malformed(format!("{} is not valid hex: {}", name, e)))?;

    if let Some(len) = expected_len {
        if bytes.len() != len {
            return Err(VaultError::Malformed(format!(
                "{} must be {} bytes, got {}",
                name,
                len,
                bytes.len()
            )));
        }
    }

    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vault() -> Vault {
        Vault::new(Some("test-master-key"), Environment::Development)
    }

    /// Flip one bit of a hex-encoded field
    fn flip_bit(hex_field: &str, byte: usize) -> String {
        let mut bytes = hex::decode(hex_field).unwrap();
        bytes[byte] ^= 0x01;
        hex::encode(bytes)
    }

    // Test 1: Encrypt then decrypt returns the original plaintext
    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let vault = vault();
        for plaintext in ["s3cret-pass", "ção-ünïcødé", ""] {
            let secret = vault.encrypt(plaintext).unwrap();
            assert_eq!(vault.decrypt(&secret).unwrap(), plaintext);
        }
    }

    // Test 2: Field sizes and fresh randomness per encryption
    #[test]
    fn test_encrypt_uses_fresh_salt_and_nonce() {
        let vault = vault();
        let a = vault.encrypt("same-password").unwrap();
        let b = vault.encrypt("same-password").unwrap();

        assert_eq!(a.salt.len(), SALT_LEN * 2);
        assert_eq!(a.iv.len(), NONCE_LEN * 2);
        assert_eq!(a.tag.len(), TAG_LEN * 2);
        assert_eq!(a.ciphertext.len(), "same-password".len() * 2);

        assert_ne!(a.salt, b.salt);
        assert_ne!(a.iv, b.iv);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    // Test 3: Single-bit flips are integrity failures
    #[test]
    fn test_bit_flip_is_integrity_error() {
        let vault = vault();
        let secret = vault.encrypt("s3cret-pass").unwrap();

        let mut tampered = secret.clone();
        tampered.ciphertext = flip_bit(&secret.ciphertext, 0);
        assert_eq!(vault.decrypt(&tampered), Err(VaultError::Integrity));

        let mut tampered = secret.clone();
        tampered.tag = flip_bit(&secret.tag, 15);
        assert_eq!(vault.decrypt(&tampered), Err(VaultError::Integrity));

        let mut tampered = secret.clone();
        tampered.iv = flip_bit(&secret.iv, 5);
        assert_eq!(vault.decrypt(&tampered), Err(VaultError::Integrity));

        let mut tampered = secret;
        tampered.salt = flip_bit(&tampered.salt, 31);
        assert_eq!(vault.decrypt(&tampered), Err(VaultError::Integrity));
    }

    // Test 4: A different master key cannot decrypt
    #[test]
    fn test_wrong_master_key_fails() {
        let secret = vault().encrypt("s3cret-pass").unwrap();
        let other = Vault::new(Some("another-key"), Environment::Development);
        assert_eq!(other.decrypt(&secret), Err(VaultError::Integrity));
    }

    // Test 5: Malformed fields are reported as such
    #[test]
    fn test_malformed_fields() {
        let vault = vault();
        let secret = vault.encrypt("s3cret-pass").unwrap();

        let mut bad = secret.clone();
        bad.iv = "zz".to_string();
        assert!(matches!(vault.decrypt(&bad), Err(VaultError::Malformed(_))));

        let mut bad = secret;
        bad.tag = "00".to_string();
        assert!(matches!(vault.decrypt(&bad), Err(VaultError::Malformed(_))));
    }

    // Test 6: verify swallows failures into false
    #[test]
    fn test_verify() {
        let vault = vault();
        let secret = vault.encrypt("s3cret-pass").unwrap();

        assert!(vault.verify("s3cret-pass", &secret));
        assert!(!vault.verify("other-pass", &secret));

        let mut tampered = secret.clone();
        tampered.tag = flip_bit(&secret.tag, 0);
        assert!(!vault.verify("s3cret-pass", &tampered));
    }

    // Test 7: Rotation re-encrypts under the new key
    #[test]
    fn test_rotate() {
        let old = vault();
        let new = Vault::new(Some("rotated-key"), Environment::Development);

        let secret = old.encrypt("s3cret-pass").unwrap();
        let rotated = old.rotate(&secret, &new).unwrap();

        assert_eq!(new.decrypt(&rotated).unwrap(), "s3cret-pass");
        assert_eq!(old.decrypt(&rotated), Err(VaultError::Integrity));
    }

    // Test 8: Missing or empty key falls back to the default
    #[test]
    fn test_default_key_fallback() {
        assert!(Vault::new(None, Environment::Production).uses_default_key());
        assert!(Vault::new(Some(""), Environment::Development).uses_default_key());
        assert!(!vault().uses_default_key());
    }

    // Test 9: Debug output never shows the master key
    #[test]
    fn test_debug_redacts_master_key() {
        let rendered = format!("{:?}", vault());
        assert!(!rendered.contains("test-master-key"));
        assert!(rendered.contains("REDACTED"));
    }

    // Test 10: Secrets sealed with a 16-byte IV by earlier deployments still open
    #[test]
    fn test_decrypt_legacy_sixteen_byte_iv() {
        let vault = Vault::new(Some("legacy-master"), Environment::Production);
        let secret = EncryptedSecret {
            ciphertext: "579f15a8ec78d52936cef9".to_string(),
            iv: "6fff43de6de2f03b33408e42c243bd52".to_string(),
            tag: "d543acad3dd57b0ee6ea559152834905".to_string(),
            salt: "5e60f7f78152cde49b0268a725c6486ba3431d70781e33bb9bb623d51495e2a5".to_string(),
        };

        assert_eq!(vault.decrypt(&secret).unwrap(), "s3cret-pass");
        assert!(vault.verify("s3cret-pass", &secret));

        let mut tampered = secret.clone();
        tampered.iv = flip_bit(&secret.iv, 15);
        assert_eq!(vault.decrypt(&tampered), Err(VaultError::Integrity));

        let other = Vault::new(Some("other-master"), Environment::Production);
        assert_eq!(other.decrypt(&secret), Err(VaultError::Integrity));

        // Re-encrypting moves the secret to a 12-byte IV
        let rotated = vault.rotate(&secret, &vault).unwrap();
        assert_eq!(rotated.iv.len(), NONCE_LEN * 2);
        assert_eq!(vault.decrypt(&rotated).unwrap(), "s3cret-pass");
    }

    // Test 11: IVs of any other length are malformed
    #[test]
    fn test_unsupported_iv_length() {
        let vault = vault();
        let mut secret = vault.encrypt("s3cret-pass").unwrap();
        secret.iv = "00".repeat(8);
        assert!(matches!(vault.decrypt(&secret), Err(VaultError::Malformed(_))));
    }

    // Test 12: Generated master keys are 32 random bytes
    #[test]
    fn test_generate_master_key() {
        let a = generate_master_key();
        let b = generate_master_key();
        assert_eq!(a.len(), 64);
        assert!(hex::decode(&a).is_ok());
        assert_ne!(a, b);
    }
}

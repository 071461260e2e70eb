//! Credential validation cache
//!
//! Memoizes "are these credentials valid" answers from the upstream so the
//! auth check is not repeated on every initialization. Entries are keyed by an
//! HMAC fingerprint of the credential triple, prefixed by an HMAC of the
//! subdomain so a tenant can be invalidated without storing anything reversible.
//!
//! Only definitive answers are cached. A validator that errors leaves the cache
//! untouched.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;

use hmac::digest::generic_array::GenericArray;
use hmac::digest::KeyInit;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::Serialize;
use sha2::Sha256;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::config::Config;

type HmacSha256 = Hmac<Sha256>;

const HMAC_KEY_LEN: usize = 64;

/// Cached answer for one credential fingerprint
#[derive(Debug, Clone)]
struct CacheEntry {
    is_valid: bool,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Result of a cached-or-fresh validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationOutcome {
    /// Upstream accepted the credentials
    Valid,
    /// Upstream rejected the credentials
    Invalid,
    /// The validation call failed before producing an answer
    Inconclusive(String),
}

impl ValidationOutcome {
    pub fn is_valid(&self) -> bool {
        matches!(self, ValidationOutcome::Valid)
    }
}

/// Snapshot of cache occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub total_entries: usize,
    pub valid_entries: usize,
    pub expired_entries: usize,
    pub ttl_secs: u64,
    pub hits: u64,
    pub misses: u64,
}

/// Thread-safe validation cache with TTL expiry
pub struct ValidationCache {
    ttl: Duration,
    key: Zeroizing<[u8; HMAC_KEY_LEN]>,
    entries: RwLock<HashMap<String, CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ValidationCache {
    /// Create an empty cache with a per-process random fingerprint key
    pub fn new(ttl: Duration) -> Self {
        let mut key = Zeroizing::new([0u8; HMAC_KEY_LEN]);
        OsRng.fill_bytes(key.as_mut_slice());

        Self {
            ttl,
            key,
            entries: RwLock::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Create a cache using the TTL for the configured posture
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.cache_ttl())
    }

    /// Create a cache from configuration with its expiry sweep already running
    ///
    /// The sweep stops when the returned handle is shut down or dropped.
    pub fn start(config: &Config) -> (Arc<Self>, SweepHandle) {
        let cache = Arc::new(Self::from_config(config));
        let sweeper =
            cache.spawn_sweeper(Duration::from_secs(config.cache.sweep_interval_secs.max(1)));
        (cache, sweeper)
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Cached validity, or None when unknown or expired
    pub fn lookup(&self, subdomain: &str, username: &str, password: &str) -> Option<bool> {
        let key = self.fingerprint(subdomain, username, password);
        let now = Instant::now();

        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let result = entries
            .get(&key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.is_valid);

        match result {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };

        result
    }

    /// Record a definitive validation answer
    pub fn store(&self, subdomain: &str, username: &str, password: &str, is_valid: bool) {
        let key = self.fingerprint(subdomain, username, password);
        let entry = CacheEntry {
            is_valid,
            expires_at: Instant::now() + self.ttl,
        };

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key, entry);
    }

    /// Drop every entry for a subdomain
    ///
    /// Returns the number of removed entries.
    pub fn invalidate(&self, subdomain: &str) -> usize {
        let prefix = format!("{}:", self.tenant_prefix(subdomain));

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|key, _| !key.starts_with(&prefix));
        let removed = before - entries.len();

        debug!(subdomain = %subdomain, removed = removed, "Validation cache invalidated");
        removed
    }

    /// Drop every entry
    pub fn clear(&self) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.clear();
    }

    /// Remove expired entries
    ///
    /// Returns the number of removed entries.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        before - entries.len()
    }

    /// Occupancy and hit/miss counters
    pub fn stats(&self) -> CacheStats {
        let now = Instant::now();
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let expired = entries.values().filter(|e| e.is_expired(now)).count();

        CacheStats {
            total_entries: entries.len(),
            valid_entries: entries.len() - expired,
            expired_entries: expired,
            ttl_secs: self.ttl.as_secs(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// Check the cache, falling back to `validator` on a miss
    ///
    /// A definitive validator answer is cached. A validator error is returned
    /// as `Inconclusive` and nothing is stored.
    pub async fn check<F, Fut, E>(
        &self,
        subdomain: &str,
        username: &str,
        password: &str,
        validator: F,
    ) -> ValidationOutcome
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<bool, E>>,
        E: std::fmt::Display,
    {
        if let Some(is_valid) = self.lookup(subdomain, username, password) {
            debug!(subdomain = %subdomain, is_valid = is_valid, "Validation cache hit");
            return if is_valid {
                ValidationOutcome::Valid
            } else {
                ValidationOutcome::Invalid
            };
        }

        match validator().await {
            Ok(is_valid) => {
                self.store(subdomain, username, password, is_valid);
                if is_valid {
                    ValidationOutcome::Valid
                } else {
                    ValidationOutcome::Invalid
                }
            }
            Err(e) => {
                warn!(
                    subdomain = %subdomain,
                    error = %e,
                    "Credential validation inconclusive, result not cached"
                );
                ValidationOutcome::Inconclusive(e.to_string())
            }
        }
    }

    /// Cached-or-fresh validity; validator errors count as invalid for this call only
    pub async fn validate_with_cache<F, Fut, E>(
        &self,
        subdomain: &str,
        username: &str,
        password: &str,
        validator: F,
    ) -> bool
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<bool, E>>,
        E: std::fmt::Display,
    {
        self.check(subdomain, username, password, validator)
            .await
            .is_valid()
    }

    /// Start the periodic expiry sweep
    ///
    /// The task holds only a weak reference and ends when the cache is dropped
    /// or the returned handle is shut down.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> SweepHandle {
        let cache: Weak<Self> = Arc::downgrade(self);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(cache) = cache.upgrade() else {
                            break;
                        };
                        let removed = cache.sweep();
                        if removed > 0 {
                            debug!(removed = removed, "Swept expired validation cache entries");
                        }
                    }
                    _ = &mut shutdown_rx => {
                        break;
                    }
                }
            }
        });

        SweepHandle {
            shutdown: Some(shutdown_tx),
            task: Some(task),
        }
    }

    fn tenant_prefix(&self, subdomain: &str) -> String {
        let mut mac = self.mac();
        mac.update(b"tenant");
        update_field(&mut mac, subdomain);
        hex::encode(mac.finalize().into_bytes())
    }

    fn fingerprint(&self, subdomain: &str, username: &str, password: &str) -> String {
        let mut mac = self.mac();
        mac.update(b"credentials");
        update_field(&mut mac, subdomain);
        update_field(&mut mac, username);
        update_field(&mut mac, password);

        format!(
            "{}:{}",
            self.tenant_prefix(subdomain),
            hex::encode(mac.finalize().into_bytes())
        )
    }

    fn mac(&self) -> HmacSha256 {
        <HmacSha256 as KeyInit>::new(GenericArray::from_slice(self.key.as_slice()))
    }
}

/// Length-prefixed so ("ab", "c") and ("a", "bc") differ
fn update_field(mac: &mut HmacSha256, value: &str) {
    mac.update(&(value.len() as u64).to_le_bytes());
    mac.update(value.as_bytes());
}

/// Owner of the background sweep task
pub struct SweepHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl SweepHandle {
    /// Stop the sweep task and wait for it to finish
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for SweepHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    const TTL: Duration = Duration::from_secs(60);

    // Test 1: Lookup on an empty cache is unknown
    #[tokio::test]
    async fn test_lookup_unknown() {
        let cache = ValidationCache::new(TTL);
        assert_eq!(cache.lookup("acme", "user", "pass"), None);
    }

    // Test 2: Stored answers are returned, including negative ones
    #[tokio::test]
    async fn test_store_and_lookup() {
        let cache = ValidationCache::new(TTL);
        cache.store("acme", "user", "good-pass", true);
        cache.store("acme", "user", "bad-pass", false);

        assert_eq!(cache.lookup("acme", "user", "good-pass"), Some(true));
        assert_eq!(cache.lookup("acme", "user", "bad-pass"), Some(false));
        assert_eq!(cache.lookup("acme", "other", "good-pass"), None);
    }

    // Test 3: Entries expire after the TTL
    #[tokio::test(start_paused = true)]
    async fn test_entries_expire() {
        let cache = ValidationCache::new(TTL);
        cache.store("acme", "user", "pass", true);

        tokio::time::advance(Duration::from_secs(59)).await;
        assert_eq!(cache.lookup("acme", "user", "pass"), Some(true));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cache.lookup("acme", "user", "pass"), None);
    }

    // Test 4: Invalidate removes only the tenant's entries
    #[tokio::test]
    async fn test_invalidate_by_subdomain() {
        let cache = ValidationCache::new(TTL);
        cache.store("acme", "user", "p1", true);
        cache.store("acme", "other", "p2", false);
        cache.store("globex", "user", "p1", true);

        assert_eq!(cache.invalidate("acme"), 2);
        assert_eq!(cache.lookup("acme", "user", "p1"), None);
        assert_eq!(cache.lookup("globex", "user", "p1"), Some(true));
        assert_eq!(cache.invalidate("acme"), 0);
    }

    // Test 5: Keys never contain the plaintext credentials
    #[tokio::test]
    async fn test_fingerprint_is_opaque() {
        let cache = ValidationCache::new(TTL);
        let key = cache.fingerprint("acme", "api-user", "s3cret-pass");

        assert!(!key.contains("acme"));
        assert!(!key.contains("api-user"));
        assert!(!key.contains("s3cret-pass"));
        assert_ne!(key, cache.fingerprint("acme", "api-use", "rs3cret-pass"));

        // Separate processes use separate keys
        let other = ValidationCache::new(TTL);
        assert_ne!(key, other.fingerprint("acme", "api-user", "s3cret-pass"));
    }

    // Test 6: Sweep removes only expired entries
    #[tokio::test(start_paused = true)]
    async fn test_sweep_removes_expired() {
        let cache = ValidationCache::new(TTL);
        cache.store("acme", "old", "pass", true);
        tokio::time::advance(Duration::from_secs(30)).await;
        cache.store("acme", "new", "pass", true);
        tokio::time::advance(Duration::from_secs(31)).await;

        let stats = cache.stats();
        assert_eq!(stats.total_entries, 2);
        assert_eq!(stats.expired_entries, 1);
        assert_eq!(stats.valid_entries, 1);

        assert_eq!(cache.sweep(), 1);
        assert_eq!(cache.stats().total_entries, 1);
    }

    // Test 7: Validator runs once within the TTL and again after expiry
    #[tokio::test(start_paused = true)]
    async fn test_validate_with_cache_memoizes() {
        let cache = ValidationCache::new(TTL);
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let validator = move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, String>(true)
        };

        assert!(cache.validate_with_cache("acme", "user", "pass", validator).await);
        assert!(cache.validate_with_cache("acme", "user", "pass", validator).await);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(TTL).await;
        assert!(cache.validate_with_cache("acme", "user", "pass", validator).await);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    // Test 8: Validator errors are not cached
    #[tokio::test]
    async fn test_validator_error_not_cached() {
        let cache = ValidationCache::new(TTL);
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let validator = move || async move {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                Err("connection reset".to_string())
            } else {
                Ok(true)
            }
        };

        assert!(!cache.validate_with_cache("acme", "user", "pass", validator).await);
        assert_eq!(cache.lookup("acme", "user", "pass"), None);

        assert!(cache.validate_with_cache("acme", "user", "pass", validator).await);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // Now definitive and cached
        assert!(cache.validate_with_cache("acme", "user", "pass", validator).await);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    // Test 9: check distinguishes invalid from inconclusive
    #[tokio::test]
    async fn test_check_outcomes() {
        let cache = ValidationCache::new(TTL);

        let outcome = cache
            .check("acme", "user", "bad", || async { Ok::<_, String>(false) })
            .await;
        assert_eq!(outcome, ValidationOutcome::Invalid);

        let outcome = cache
            .check("acme", "user", "flaky", || async {
                Err::<bool, _>("timeout".to_string())
            })
            .await;
        assert_eq!(outcome, ValidationOutcome::Inconclusive("timeout".to_string()));

        // Negative answer is served from cache
        let outcome = cache
            .check("acme", "user", "bad", || async { Ok::<_, String>(true) })
            .await;
        assert_eq!(outcome, ValidationOutcome::Invalid);
    }

    // Test 10: Hit and miss counters
    #[tokio::test]
    async fn test_hit_miss_counters() {
        let cache = ValidationCache::new(TTL);
        cache.lookup("acme", "user", "pass");
        cache.store("acme", "user", "pass", true);
        cache.lookup("acme", "user", "pass");
        cache.lookup("acme", "user", "pass");

        let stats = cache.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.ttl_secs, 60);
    }

    // Test 11: Background sweeper removes expired entries on its interval
    #[tokio::test(start_paused = true)]
    async fn test_spawn_sweeper() {
        let cache = Arc::new(ValidationCache::new(Duration::from_secs(5)));
        let handle = cache.spawn_sweeper(Duration::from_secs(10));

        cache.store("acme", "user", "pass", true);
        assert_eq!(cache.stats().total_entries, 1);

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(cache.stats().total_entries, 0);

        handle.shutdown().await;
    }

    // Test 12: Sweeper stops once the cache is dropped
    #[tokio::test(start_paused = true)]
    async fn test_sweeper_stops_with_cache() {
        let cache = Arc::new(ValidationCache::new(TTL));
        let mut handle = cache.spawn_sweeper(Duration::from_secs(1));
        drop(cache);

        let task = handle.task.take().unwrap();
        let finished = tokio::time::timeout(Duration::from_secs(5), task).await;
        assert!(finished.is_ok());
    }

    // Test 13: A started cache sweeps on the configured interval
    #[tokio::test(start_paused = true)]
    async fn test_start_runs_sweeper() {
        let mut config = Config::default();
        config.environment = crate::config::Environment::Development;
        config.cache.ttl_development_secs = 5;
        config.cache.sweep_interval_secs = 10;

        let (cache, sweeper) = ValidationCache::start(&config);
        cache.store("acme", "user", "pass", true);

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(cache.stats().total_entries, 0);

        sweeper.shutdown().await;
    }
}

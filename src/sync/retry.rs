//! Retry manager for handling transient failures with exponential backoff
//!
//! This module provides a retry mechanism with configurable backoff strategy,
//! jitter, and maximum retry limits for handling temporary failures gracefully.

use crate::config::RetryConfig;
use crate::error::RetryableError;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Retry manager with exponential backoff support
#[derive(Debug, Clone)]
pub struct RetryManager {
    config: RetryConfig,
}

impl RetryManager {
    /// Create a new RetryManager with the given configuration
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Create a RetryManager with default configuration
    pub fn with_defaults() -> Self {
        Self::new(RetryConfig::default())
    }

    /// Execute an async operation with retry logic
    ///
    /// The operation will be retried up to `max_retries` times if it returns
    /// a retryable error. Each retry will wait for an exponentially increasing
    /// backoff period with optional jitter.
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, E>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: RetryableError + std::fmt::Display,
    {
        self.execute_when(operation, E::is_retryable).await
    }

    /// Execute an async operation, retrying only errors accepted by `should_retry`
    ///
    /// Used for non-idempotent requests, where only failures that never reached
    /// the upstream are safe to repeat. A `retry_after` hint on the error raises
    /// the wait to at least that long.
    pub async fn execute_when<F, Fut, T, E, P>(&self, operation: F, should_retry: P) -> Result<T, E>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: RetryableError + std::fmt::Display,
        P: Fn(&E) -> bool,
    {
        let mut attempt = 0u32;

        loop {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(err) => {
                    if !should_retry(&err) || attempt >= self.config.max_retries {
                        if should_retry(&err) {
                            warn!(
                                attempts = attempt + 1,
                                max_retries = self.config.max_retries,
                                error = %err,
                                "Max retries exhausted"
                            );
                        }
                        return Err(err);
                    }

                    let backoff = match err.retry_after() {
                        Some(hint) => hint.max(self.calculate_backoff(attempt)),
                        None => self.calculate_backoff(attempt),
                    };
                    debug!(
                        attempt = attempt + 1,
                        max_retries = self.config.max_retries,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "Retrying after transient error"
                    );

                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Calculate backoff duration for a given attempt number
    ///
    /// Uses exponential backoff: initial_backoff * multiplier^attempt
    /// Capped at max_backoff_ms with optional jitter
    pub fn calculate_backoff(&self, attempt: u32) -> Duration {
        let base = self.config.initial_backoff_ms as f64
            * self.config.backoff_multiplier.powi(attempt as i32);
        let capped = base.min(self.config.max_backoff_ms as f64);

        let delay = if self.config.jitter {
            // Add jitter: 50-100% of the calculated backoff
            let jitter = rand::thread_rng().gen_range(0.5..1.0);
            capped * jitter
        } else {
            capped
        };

        Duration::from_secs_f64(delay / 1000.0)
    }

    /// Get the retry configuration
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }
}

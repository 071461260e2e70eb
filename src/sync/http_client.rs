//! Rate-limited HTTP client for upstream API calls
//!
//! Every call passes through one process-wide admission budget: a bounded
//! wait queue, a concurrency ceiling, a rolling one-minute request window and
//! a minimum spacing between dispatches. Transient failures are retried with
//! backoff; non-idempotent requests are only repeated when the connection
//! itself was refused.

use crate::config::{Config, RateLimitConfig, RetryConfig, UpstreamConfig};
use crate::error::{RetryableError, SyncError};
use crate::otel::Metrics;
use crate::sync::retry::RetryManager;
use reqwest::header::{ACCEPT, USER_AGENT};
use reqwest::{Client, Method, StatusCode};
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, warn};

const WINDOW: Duration = Duration::from_secs(60);
const MAX_ERROR_BODY: usize = 500;

/// HTTP basic credentials attached to a request
#[derive(Clone)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for BasicAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BasicAuth")
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

/// One outbound request
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
    pub auth: Option<BasicAuth>,
}

impl ApiRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            query: Vec::new(),
            body: None,
            auth: None,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn with_query<K, V>(mut self, params: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.query
            .extend(params.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_basic_auth(mut self, username: &str, password: &str) -> Self {
        self.auth = Some(BasicAuth {
            username: username.to_string(),
            password: password.to_string(),
        });
        self
    }

    /// Whether a failed attempt may be repeated after reaching the upstream
    pub fn is_idempotent(&self) -> bool {
        self.method.is_idempotent()
    }
}

/// Snapshot of the admission budget
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RateLimitStats {
    /// Requests currently in flight
    pub running: u64,
    /// Requests waiting for admission
    pub queued: u64,
    /// Requests that finished, successfully or not
    pub done: u64,
    /// Requests dispatched to the upstream
    pub calls_made: u64,
    /// Requests that finished with an error
    pub failed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    running: AtomicU64,
    queued: AtomicU64,
    done: AtomicU64,
    calls_made: AtomicU64,
    failed: AtomicU64,
}

/// Holds a queue slot until dropped
struct QueueSlot<'a>(&'a Counters);

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        self.0.queued.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Marks a request in flight until dropped, on every exit path
struct InFlight<'a>(&'a Counters);

impl<'a> InFlight<'a> {
    fn start(counters: &'a Counters) -> Self {
        counters.running.fetch_add(1, Ordering::SeqCst);
        counters.calls_made.fetch_add(1, Ordering::SeqCst);
        Self(counters)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.running.fetch_sub(1, Ordering::SeqCst);
        self.0.done.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Default)]
struct DispatchWindow {
    last_dispatch: Option<Instant>,
    recent: VecDeque<Instant>,
}

/// HTTP client with a shared rate budget and retry policy
pub struct HttpClientWithRateLimit {
    client: Client,
    user_agent: String,
    semaphore: Arc<Semaphore>,
    window: Mutex<DispatchWindow>,
    counters: Counters,
    config: RateLimitConfig,
    retry: RetryManager,
    metrics: Option<Arc<Metrics>>,
}

impl HttpClientWithRateLimit {
    /// Create a client with the upstream timeout and User-Agent applied
    pub fn new(
        upstream: &UpstreamConfig,
        rate_limit: RateLimitConfig,
        retry: RetryConfig,
    ) -> Result<Self, SyncError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(upstream.timeout_secs))
            .connect_timeout(Duration::from_secs(upstream.timeout_secs))
            .build()
            .map_err(|e| SyncError::Network(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self::with_client(client, rate_limit, retry).with_user_agent(&upstream.user_agent))
    }

    /// Create a client from application configuration
    pub fn from_config(config: &Config) -> Result<Self, SyncError> {
        Self::new(
            &config.upstream,
            config.rate_limit.clone(),
            config.retry.clone(),
        )
    }

    /// Create a rate-limited client around a custom reqwest Client
    pub fn with_client(client: Client, rate_limit: RateLimitConfig, retry: RetryConfig) -> Self {
        Self {
            client,
            user_agent: UpstreamConfig::default().user_agent,
            semaphore: Arc::new(Semaphore::new(rate_limit.max_concurrent)),
            window: Mutex::new(DispatchWindow::default()),
            counters: Counters::default(),
            config: rate_limit,
            retry: RetryManager::new(retry),
            metrics: None,
        }
    }

    pub fn with_user_agent(mut self, user_agent: &str) -> Self {
        self.user_agent = user_agent.to_string();
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Admit `task` once it fits the budget, then run it
    ///
    /// Fails immediately with `QueueFull` when `max_queue` requests are
    /// already waiting. The task counts as one upstream call.
    pub async fn schedule<F, Fut, T>(&self, task: F) -> Result<T, SyncError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, SyncError>>,
    {
        let slot = self.enter_queue()?;

        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| SyncError::Network("rate limiter closed".to_string()))?;

        self.wait_for_slot().await;
        drop(slot);

        let _in_flight = InFlight::start(&self.counters);
        let result = task().await;
        if result.is_err() {
            self.counters.failed.fetch_add(1, Ordering::SeqCst);
        }
        result
    }

    /// Send a request through the budget, retrying per method semantics
    pub async fn send(&self, request: &ApiRequest) -> Result<Value, SyncError> {
        let idempotent = request.is_idempotent();
        let attempts = AtomicU32::new(0);
        let attempts = &attempts;

        self.retry
            .execute_when(
                move || async move {
                    if attempts.fetch_add(1, Ordering::SeqCst) > 0 {
                        if let Some(metrics) = &self.metrics {
                            metrics.record_retry(request.method.as_str());
                        }
                    }
                    self.schedule(move || self.dispatch(request)).await
                },
                move |err: &SyncError| {
                    if idempotent {
                        err.is_retryable()
                    } else {
                        err.is_connection_level()
                    }
                },
            )
            .await
    }

    /// GET a URL and parse the JSON body
    pub async fn get_json(
        &self,
        url: &str,
        query: &[(String, String)],
    ) -> Result<Value, SyncError> {
        self.send(&ApiRequest::get(url).with_query(query.iter().cloned()))
            .await
    }

    /// Current admission counters
    pub fn stats(&self) -> RateLimitStats {
        RateLimitStats {
            running: self.counters.running.load(Ordering::SeqCst),
            queued: self.counters.queued.load(Ordering::SeqCst),
            done: self.counters.done.load(Ordering::SeqCst),
            calls_made: self.counters.calls_made.load(Ordering::SeqCst),
            failed: self.counters.failed.load(Ordering::SeqCst),
        }
    }

    /// Total number of dispatched calls since startup
    pub fn calls_made(&self) -> u64 {
        self.counters.calls_made.load(Ordering::SeqCst)
    }

    /// Get current configuration
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Get number of available permits (concurrent request slots)
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    fn enter_queue(&self) -> Result<QueueSlot<'_>, SyncError> {
        let max_queue = self.config.max_queue as u64;
        self.counters
            .queued
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |queued| {
                (queued < max_queue).then_some(queued + 1)
            })
            .map_err(|queued| {
                warn!(queued = queued, max_queue = max_queue, "Request queue full");
                SyncError::QueueFull
            })?;
        Ok(QueueSlot(&self.counters))
    }

    /// Wait until both the rolling window and the minimum spacing allow a dispatch
    async fn wait_for_slot(&self) {
        let min_interval = Duration::from_millis(self.config.min_interval_ms);
        let per_minute = self.config.requests_per_minute as usize;

        loop {
            let mut window = self.window.lock().await;
            let now = Instant::now();

            while window
                .recent
                .front()
                .is_some_and(|sent| now.duration_since(*sent) >= WINDOW)
            {
                window.recent.pop_front();
            }

            let mut wait = Duration::ZERO;
            if per_minute > 0 && window.recent.len() >= per_minute {
                if let Some(oldest) = window.recent.front() {
                    wait = WINDOW.saturating_sub(now.duration_since(*oldest));
                }
            }
            if let Some(last) = window.last_dispatch {
                wait = wait.max(min_interval.saturating_sub(now.duration_since(last)));
            }

            if wait.is_zero() {
                window.last_dispatch = Some(now);
                if per_minute > 0 {
                    window.recent.push_back(now);
                }
                return;
            }

            // Release lock while waiting
            drop(window);
            debug!(wait_ms = wait.as_millis() as u64, "Waiting for rate limit");
            tokio::time::sleep(wait).await;
        }
    }

    async fn dispatch(&self, request: &ApiRequest) -> Result<Value, SyncError> {
        let started = Instant::now();

        let mut builder = self
            .client
            .request(request.method.clone(), &request.url)
            .header(USER_AGENT, &self.user_agent)
            .header(ACCEPT, "application/json");
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(auth) = &request.auth {
            builder = builder.basic_auth(&auth.username, Some(&auth.password));
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        debug!(method = %request.method, url = %request.url, "Sending upstream request");

        let result = match builder.send().await {
            Ok(response) => self.handle_response(request, response).await,
            Err(e) => Err(map_transport_error(&e)),
        };

        if let Some(metrics) = &self.metrics {
            let outcome = match &result {
                Ok(_) => "success",
                Err(SyncError::ClientError { .. }) => "client_error",
                Err(SyncError::ServerError(_)) => "server_error",
                Err(SyncError::RateLimited(_)) => "rate_limited",
                Err(_) => "network_error",
            };
            metrics.record_api_call(
                request.method.as_str(),
                outcome,
                started.elapsed().as_secs_f64(),
            );
        }

        result
    }

    async fn handle_response(
        &self,
        request: &ApiRequest,
        response: reqwest::Response,
    ) -> Result<Value, SyncError> {
        let status = response.status();

        if status.is_success() {
            let body = response.text().await.map_err(|e| map_transport_error(&e))?;
            debug!(url = %request.url, status = status.as_u16(), body_size = body.len(), "Received response");
            return parse_body(&body);
        }

        match status {
            StatusCode::TOO_MANY_REQUESTS => {
                let wait = response
                    .headers()
                    .get("Retry-After")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.trim().parse().ok())
                    .unwrap_or(self.config.rate_limit_wait_secs);

                warn!(url = %request.url, retry_after = wait, "Rate limited by upstream");
                Err(SyncError::RateLimited(wait))
            }
            status if status.is_server_error() => {
                warn!(url = %request.url, status = status.as_u16(), "Server error");
                Err(SyncError::ServerError(status.as_u16()))
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                let message = if body.trim().is_empty() {
                    status.canonical_reason().unwrap_or("").to_string()
                } else {
                    truncate(body.trim(), MAX_ERROR_BODY)
                };

                warn!(url = %request.url, status = status.as_u16(), "Upstream rejected request");
                Err(SyncError::ClientError {
                    status: status.as_u16(),
                    message,
                })
            }
        }
    }
}

fn map_transport_error(e: &reqwest::Error) -> SyncError {
    if e.is_timeout() {
        SyncError::NetworkTimeout
    } else if e.is_connect() {
        SyncError::ConnectionRefused
    } else {
        SyncError::Network(e.to_string())
    }
}

/// Empty bodies (204, empty 200) parse as null
fn parse_body(body: &str) -> Result<Value, SyncError> {
    if body.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(body)
        .map_err(|e| SyncError::InvalidData(format!("response is not valid JSON: {}", e)))
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

//! Sienge API client
//!
//! Loads the active credentials, validates them once through the validation
//! cache and then serves single and paginated calls through the shared
//! rate-limited HTTP client.

use async_trait::async_trait;
use reqwest::Method;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::cache::{ValidationCache, ValidationOutcome};
use crate::config::{Config, Environment, UpstreamConfig};
use crate::database::Database;
use crate::error::{AppError, SyncError};
use crate::models::{Credentials, CredentialsSummary, StoredCredentials, UpsertOutcome};
use crate::otel::Metrics;
use crate::sync::entities::EntityDef;
use crate::sync::http_client::{ApiRequest, HttpClientWithRateLimit, RateLimitStats};
use crate::sync::orchestrator::{EntityFetch, EntityFetcher};
use crate::sync::pagination::{self, PageLimits, PageResult, PageSource};
use crate::vault::Vault;

/// Credentials validated for the current process
#[derive(Clone)]
struct Session {
    credentials: Credentials,
    base_url: String,
}

/// Page source bound to one session snapshot
struct SessionSource<'a> {
    http: &'a HttpClientWithRateLimit,
    session: Session,
}

#[async_trait]
impl PageSource for SessionSource<'_> {
    async fn fetch_page(
        &self,
        endpoint: &str,
        params: &[(String, String)],
    ) -> Result<Value, SyncError> {
        let request = authorized(
            &self.session,
            ApiRequest::get(join_url(&self.session.base_url, endpoint)),
        )
        .with_query(params.iter().cloned());
        self.http.send(&request).await
    }
}

/// Upstream client facade
pub struct SiengeClient<D: Database> {
    http: Arc<HttpClientWithRateLimit>,
    database: Arc<D>,
    vault: Vault,
    cache: Arc<ValidationCache>,
    upstream: UpstreamConfig,
    environment: Environment,
    limits: PageLimits,
    session: RwLock<Option<Session>>,
    metrics: Option<Arc<Metrics>>,
}

impl<D: Database> SiengeClient<D> {
    /// Build a client and its collaborators from configuration
    pub fn new(config: &Config, database: Arc<D>) -> Result<Self, AppError> {
        let http = Arc::new(HttpClientWithRateLimit::from_config(config)?);
        Ok(Self::with_components(
            config,
            http,
            database,
            Vault::from_config(config),
            Arc::new(ValidationCache::from_config(config)),
        ))
    }

    /// Build a client around existing collaborators
    pub fn with_components(
        config: &Config,
        http: Arc<HttpClientWithRateLimit>,
        database: Arc<D>,
        vault: Vault,
        cache: Arc<ValidationCache>,
    ) -> Self {
        Self {
            http,
            database,
            vault,
            cache,
            upstream: config.upstream.clone(),
            environment: config.environment,
            limits: PageLimits::from_config(config),
            session: RwLock::new(None),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn cache(&self) -> &Arc<ValidationCache> {
        &self.cache
    }

    pub fn http(&self) -> &Arc<HttpClientWithRateLimit> {
        &self.http
    }

    /// Load and validate credentials; must succeed before any fetch
    ///
    /// Fails with `NotConfigured` when no credentials exist, and with
    /// `CredentialsRejected` when the upstream refuses them. Any failure
    /// drops the previous session, so fetches are refused until a later
    /// call succeeds.
    pub async fn initialize(&self) -> Result<(), AppError> {
        match self.establish_session().await {
            Ok(session) => {
                *self.session.write().await = Some(session);
                Ok(())
            }
            Err(e) => {
                *self.session.write().await = None;
                Err(e)
            }
        }
    }

    async fn establish_session(&self) -> Result<Session, AppError> {
        let credentials = self.load_credentials().await?;
        let validator_called = AtomicBool::new(false);

        let outcome = self
            .cache
            .check(
                &credentials.subdomain,
                &credentials.username,
                &credentials.password,
                || {
                    validator_called.store(true, Ordering::SeqCst);
                    self.validate_credentials(&credentials)
                },
            )
            .await;

        if let Some(metrics) = &self.metrics {
            if validator_called.load(Ordering::SeqCst) {
                metrics.record_cache_miss();
            } else {
                metrics.record_cache_hit();
            }
        }

        match outcome {
            ValidationOutcome::Valid => {
                info!(
                    subdomain = %credentials.subdomain,
                    username = %credentials.username,
                    "Upstream client initialized"
                );
                let base_url = self.upstream.base_url_for(&credentials.subdomain);
                Ok(Session {
                    credentials,
                    base_url,
                })
            }
            ValidationOutcome::Invalid => {
                Err(AppError::CredentialsRejected(credentials.subdomain))
            }
            ValidationOutcome::Inconclusive(reason) => {
                Err(AppError::ValidationInconclusive(reason))
            }
        }
    }

    pub async fn is_initialized(&self) -> bool {
        self.session.read().await.is_some()
    }

    /// Ask the upstream whether the credentials are accepted
    ///
    /// `Ok(false)` only for 401/403; any other failure is an error.
    pub async fn validate_credentials(&self, credentials: &Credentials) -> Result<bool, SyncError> {
        let base_url = self.upstream.base_url_for(&credentials.subdomain);
        let request = ApiRequest::get(join_url(&base_url, "/companies"))
            .with_query([("limit", "1")])
            .with_basic_auth(&credentials.username, &credentials.password);

        match self.http.send(&request).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_auth_rejection() => {
                warn!(subdomain = %credentials.subdomain, status = ?e.status(), "Upstream rejected credentials");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Single non-paginated GET
    pub async fn fetch_data(
        &self,
        endpoint: &str,
        params: &[(String, String)],
    ) -> Result<Value, AppError> {
        let source = self.source().await?;
        Ok(source.fetch_page(endpoint, params).await?)
    }

    /// Every page of `endpoint`, under the configured ceilings unless overridden
    pub async fn fetch_paginated_data(
        &self,
        endpoint: &str,
        base_params: &[(String, String)],
        limits: Option<PageLimits>,
    ) -> Result<PageResult, AppError> {
        let source = self.source().await?;
        let limits = limits.unwrap_or(self.limits);
        Ok(pagination::fetch_all(&source, endpoint, base_params, limits).await?)
    }

    /// POST a record
    pub async fn create_data(&self, endpoint: &str, body: Value) -> Result<Value, AppError> {
        self.write(Method::POST, endpoint, Some(body)).await
    }

    /// PUT a record
    pub async fn update_data(&self, endpoint: &str, body: Value) -> Result<Value, AppError> {
        self.write(Method::PUT, endpoint, Some(body)).await
    }

    /// DELETE a record
    pub async fn delete_data(&self, endpoint: &str) -> Result<Value, AppError> {
        self.write(Method::DELETE, endpoint, None).await
    }

    pub fn rate_limit_stats(&self) -> RateLimitStats {
        self.http.stats()
    }

    /// Validate, encrypt and store credentials for a tenant
    ///
    /// The stored record becomes the active one and cached validation
    /// results for the subdomain are dropped.
    pub async fn save_credentials(
        &self,
        subdomain: &str,
        username: &str,
        password: &str,
    ) -> Result<UpsertOutcome, AppError> {
        let credentials = Credentials::new(subdomain.trim(), username.trim(), password);
        credentials.validate().map_err(AppError::InvalidCredentials)?;

        match self.validate_credentials(&credentials).await {
            Ok(true) => {}
            Ok(false) => return Err(AppError::CredentialsRejected(credentials.subdomain)),
            Err(e) => return Err(AppError::ValidationInconclusive(e.to_string())),
        }

        let secret = self.vault.encrypt(&credentials.password)?;
        let stored = StoredCredentials::new(&credentials.subdomain, &credentials.username, secret);
        let outcome = self.database.upsert_credentials(&stored).await?;

        self.cache.invalidate(&credentials.subdomain);
        self.cache.store(
            &credentials.subdomain,
            &credentials.username,
            &credentials.password,
            true,
        );

        info!(
            subdomain = %credentials.subdomain,
            username = %credentials.username,
            outcome = ?outcome,
            "Upstream credentials saved"
        );

        let base_url = self.upstream.base_url_for(&credentials.subdomain);
        *self.session.write().await = Some(Session {
            credentials,
            base_url,
        });

        Ok(outcome)
    }

    /// Active credentials without secrets
    pub async fn credentials_summary(&self) -> Result<Option<CredentialsSummary>, AppError> {
        let stored = self.database.get_active_credentials().await?;
        Ok(stored.as_ref().map(CredentialsSummary::from))
    }

    async fn load_credentials(&self) -> Result<Credentials, AppError> {
        if let Some(stored) = self.database.get_active_credentials().await? {
            let password = self.vault.decrypt(&stored.password)?;
            return Ok(Credentials::new(stored.subdomain, stored.username, password));
        }

        match (&self.upstream.fallback_credentials, self.environment) {
            (Some(fallback), Environment::Development) => {
                warn!(
                    subdomain = %fallback.subdomain,
                    "No stored credentials, using development fallback credentials"
                );
                Ok(Credentials::new(
                    fallback.subdomain.as_str(),
                    fallback.username.as_str(),
                    fallback.password.as_str(),
                ))
            }
            _ => Err(AppError::NotConfigured),
        }
    }

    async fn source(&self) -> Result<SessionSource<'_>, SyncError> {
        let session = self
            .session
            .read()
            .await
            .clone()
            .ok_or(SyncError::NotInitialized)?;
        Ok(SessionSource {
            http: &self.http,
            session,
        })
    }

    async fn write(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<Value>,
    ) -> Result<Value, AppError> {
        let source = self.source().await?;
        let mut request = authorized(
            &source.session,
            ApiRequest::new(method, join_url(&source.session.base_url, endpoint)),
        );
        if let Some(body) = body {
            request = request.with_body(body);
        }
        Ok(self.http.send(&request).await?)
    }
}

#[async_trait]
impl<D: Database> EntityFetcher for SiengeClient<D> {
    async fn prepare(&self) -> Result<(), AppError> {
        self.initialize().await
    }

    async fn fetch_entity(&self, entity: &'static EntityDef) -> Result<EntityFetch, SyncError> {
        let source = self.source().await?;
        let limits = entity.limits(self.limits);
        let mut last_error = None;

        for endpoint in entity.endpoints {
            match pagination::fetch_all(&source, endpoint, &[], limits).await {
                Ok(result) => {
                    return Ok(EntityFetch {
                        endpoint: endpoint.to_string(),
                        result,
                    })
                }
                Err(e) => {
                    warn!(entity = %entity.kind, endpoint = %endpoint, error = %e, "Endpoint failed");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            SyncError::InvalidData(format!("no endpoint configured for {}", entity.kind))
        }))
    }

    fn calls_made(&self) -> u64 {
        self.http.calls_made()
    }
}

fn authorized(session: &Session, request: ApiRequest) -> ApiRequest {
    request.with_basic_auth(&session.credentials.username, &session.credentials.password)
}

fn join_url(base_url: &str, endpoint: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        endpoint.trim_start_matches('/')
    )
}

//! HTTP router for sienge-sync
//!
//! This module defines the axum router for the control API:
//! - Health check
//! - Sync run admission, status and cancellation
//! - Rate limiter and validation cache diagnostics
//! - Credential administration

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::database::Database;
use crate::error::AppError;
use crate::models::{SyncRun, UpsertOutcome};
use crate::sync::{entities, Orchestrator, SiengeClient};

/// Shared application state
pub struct AppState<D: Database> {
    /// Run orchestrator
    pub orchestrator: Arc<Orchestrator<D, SiengeClient<D>>>,

    /// Upstream client
    pub client: Arc<SiengeClient<D>>,
}

impl<D: Database> AppState<D> {
    pub fn new(orchestrator: Arc<Orchestrator<D, SiengeClient<D>>>) -> Self {
        let client = Arc::clone(orchestrator.fetcher());
        Self {
            orchestrator,
            client,
        }
    }
}

impl<D: Database> Clone for AppState<D> {
    fn clone(&self) -> Self {
        Self {
            orchestrator: Arc::clone(&self.orchestrator),
            client: Arc::clone(&self.client),
        }
    }
}

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Body of `POST /api/sync`
#[derive(Debug, Deserialize)]
pub struct SyncRequest {
    pub entities: Vec<String>,
    #[serde(default)]
    pub with_dependencies: bool,
}

/// Body of `GET /api/sync/status`
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub run: Option<SyncRun>,
    pub progress_percent: u8,
}

/// Body of `POST /api/credentials`
#[derive(Deserialize)]
pub struct CredentialsRequest {
    pub subdomain: String,
    pub username: String,
    pub password: String,
}

/// Build the main application router
pub fn build_router<D: Database + 'static>(state: AppState<D>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/sync", post(start_sync_handler::<D>))
        .route("/api/sync/status", get(sync_status_handler::<D>))
        .route("/api/sync/runs/:id", get(get_run_handler::<D>))
        .route("/api/sync/cancel", post(cancel_sync_handler::<D>))
        .route("/api/sync/rate-limit", get(rate_limit_handler::<D>))
        .route(
            "/api/credentials",
            get(get_credentials_handler::<D>).post(save_credentials_handler::<D>),
        )
        .route("/api/cache/stats", get(cache_stats_handler::<D>))
        .with_state(state)
}

// =============================================================================
// Health
// =============================================================================

async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// =============================================================================
// Sync runs
// =============================================================================

/// Admit a run and execute it in the background
async fn start_sync_handler<D: Database + 'static>(
    State(state): State<AppState<D>>,
    Json(request): Json<SyncRequest>,
) -> Response {
    if request.entities.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "At least one entity is required" })),
        )
            .into_response();
    }

    let requested = if request.with_dependencies {
        entities::with_dependencies(request.entities.as_slice())
    } else {
        request.entities
    };

    match state.orchestrator.begin_run(requested.as_slice()).await {
        Ok(run) => {
            let orchestrator = Arc::clone(&state.orchestrator);
            let accepted = run.clone();
            tokio::spawn(async move {
                if let Err(e) = orchestrator.execute_run(run).await {
                    tracing::error!(error = %e, "Sync run aborted");
                }
            });
            (StatusCode::ACCEPTED, Json(accepted)).into_response()
        }
        Err(e) => error_response(&e),
    }
}

async fn sync_status_handler<D: Database + 'static>(
    State(state): State<AppState<D>>,
) -> Response {
    match state.orchestrator.latest_run().await {
        Ok(run) => {
            let progress_percent = run.as_ref().map(SyncRun::progress_percent).unwrap_or(0);
            Json(StatusResponse {
                run,
                progress_percent,
            })
            .into_response()
        }
        Err(e) => error_response(&e),
    }
}

async fn get_run_handler<D: Database + 'static>(
    State(state): State<AppState<D>>,
    Path(id): Path<i64>,
) -> Response {
    match state.orchestrator.run(id).await {
        Ok(Some(run)) => Json(run).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "Run not found" })),
        )
            .into_response(),
        Err(e) => error_response(&e),
    }
}

async fn cancel_sync_handler<D: Database + 'static>(
    State(state): State<AppState<D>>,
) -> Response {
    match state.orchestrator.cancel_active_run().await {
        Ok(Some(run_id)) => Json(serde_json::json!({
            "cancelled": true,
            "run_id": run_id
        }))
        .into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({
                "cancelled": false,
                "error": "No sync run in progress"
            })),
        )
            .into_response(),
        Err(e) => error_response(&e),
    }
}

async fn rate_limit_handler<D: Database + 'static>(
    State(state): State<AppState<D>>,
) -> impl IntoResponse {
    Json(state.client.rate_limit_stats())
}

// =============================================================================
// Credentials and cache
// =============================================================================

async fn get_credentials_handler<D: Database + 'static>(
    State(state): State<AppState<D>>,
) -> Response {
    match state.client.credentials_summary().await {
        Ok(summary) => Json(serde_json::json!({
            "configured": summary.is_some(),
            "credentials": summary
        }))
        .into_response(),
        Err(e) => error_response(&e),
    }
}

async fn save_credentials_handler<D: Database + 'static>(
    State(state): State<AppState<D>>,
    Json(request): Json<CredentialsRequest>,
) -> Response {
    let result = state
        .client
        .save_credentials(&request.subdomain, &request.username, &request.password)
        .await;

    match result {
        Ok(outcome) => {
            let status = match outcome {
                UpsertOutcome::Created => StatusCode::CREATED,
                UpsertOutcome::Updated => StatusCode::OK,
            };
            tracing::info!(subdomain = %request.subdomain, "Credentials updated via control API");
            (
                status,
                Json(serde_json::json!({
                    "message": "Credentials saved",
                    "subdomain": request.subdomain.trim(),
                    "outcome": outcome
                })),
            )
                .into_response()
        }
        Err(e) => error_response(&e),
    }
}

async fn cache_stats_handler<D: Database + 'static>(
    State(state): State<AppState<D>>,
) -> impl IntoResponse {
    Json(state.client.cache().stats())
}

/// Map an application error to a status and a client-safe body
fn error_response(error: &AppError) -> Response {
    let status = match error {
        AppError::RunInProgress(_) => StatusCode::CONFLICT,
        AppError::ValidationInconclusive(_) => StatusCode::BAD_GATEWAY,
        e if e.is_configuration() => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };

    let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!(error = %error, "Control API request failed");
        "Internal server error".to_string()
    } else {
        error.to_string()
    };

    let mut body = serde_json::json!({ "error": message });
    if let AppError::RunInProgress(run_id) = error {
        body["run_id"] = serde_json::json!(run_id);
    }

    (status, Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ValidationCache;
    use crate::config::{Config, Environment};
    use crate::database::SqliteDatabase;
    use crate::vault::Vault;
    use axum_test::TestServer;
    use serde_json::{json, Value};
    use std::time::Duration;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn create_test_state(upstream: &MockServer) -> AppState<SqliteDatabase> {
        let mut config = Config::default();
        config.environment = Environment::Production;
        config.upstream.base_url = format!("{}/{{subdomain}}/public/api/v1", upstream.uri());
        config.rate_limit.min_interval_ms = 0;
        config.retry.max_retries = 0;
        config.vault.master_key = Some("router-test-key".to_string());

        let database = Arc::new(SqliteDatabase::in_memory().await.unwrap());
        let http = Arc::new(crate::sync::HttpClientWithRateLimit::from_config(&config).unwrap());
        let client = Arc::new(SiengeClient::with_components(
            &config,
            http,
            database.clone(),
            Vault::from_config(&config),
            Arc::new(ValidationCache::new(Duration::from_secs(60))),
        ));
        AppState::new(Arc::new(Orchestrator::new(database, client)))
    }

    async fn mount_upstream(server: &MockServer, validation_status: u16) {
        Mock::given(method("GET"))
            .and(path("/acme/public/api/v1/companies"))
            .respond_with(
                ResponseTemplate::new(validation_status).set_body_json(json!([])),
            )
            .mount(server)
            .await;
    }

    fn credentials_body() -> Value {
        json!({
            "subdomain": "acme",
            "username": "api-user",
            "password": "s3cret-pass"
        })
    }

    // Test 1: Health endpoint
    #[tokio::test]
    async fn test_health_endpoint() {
        let upstream = MockServer::start().await;
        let server = TestServer::new(build_router(create_test_state(&upstream).await)).unwrap();

        let response = server.get("/health").await;
        response.assert_status_ok();
        let body: HealthResponse = response.json();
        assert_eq!(body.status, "healthy");
        assert_eq!(body.version, env!("CARGO_PKG_VERSION"));
    }

    // Test 2: Sync without credentials is a configuration error
    #[tokio::test]
    async fn test_start_sync_not_configured() {
        let upstream = MockServer::start().await;
        let server = TestServer::new(build_router(create_test_state(&upstream).await)).unwrap();

        let response = server
            .post("/api/sync")
            .json(&json!({ "entities": ["companies"] }))
            .await;
        response.assert_status(StatusCode::BAD_REQUEST);
        let body: Value = response.json();
        assert_eq!(body["error"], "Upstream credentials are not configured");

        let status: StatusResponse = server.get("/api/sync/status").await.json();
        assert!(status.run.is_none());
    }

    // Test 3: Empty entity list is rejected
    #[tokio::test]
    async fn test_start_sync_requires_entities() {
        let upstream = MockServer::start().await;
        let server = TestServer::new(build_router(create_test_state(&upstream).await)).unwrap();

        let response = server
            .post("/api/sync")
            .json(&json!({ "entities": [] }))
            .await;
        response.assert_status(StatusCode::BAD_REQUEST);
    }

    // Test 4: Credentials round trip through the API without secrets
    #[tokio::test]
    async fn test_credentials_endpoints() {
        let upstream = MockServer::start().await;
        mount_upstream(&upstream, 200).await;
        let server = TestServer::new(build_router(create_test_state(&upstream).await)).unwrap();

        let before: Value = server.get("/api/credentials").await.json();
        assert_eq!(before["configured"], false);

        let response = server.post("/api/credentials").json(&credentials_body()).await;
        response.assert_status(StatusCode::CREATED);

        let response = server.post("/api/credentials").json(&credentials_body()).await;
        response.assert_status_ok();

        let after = server.get("/api/credentials").await;
        let rendered = after.text();
        assert!(!rendered.contains("s3cret-pass"));
        let after: Value = serde_json::from_str(&rendered).unwrap();
        assert_eq!(after["configured"], true);
        assert_eq!(after["credentials"]["subdomain"], "acme");
    }

    // Test 5: Invalid and rejected credentials are client errors
    #[tokio::test]
    async fn test_credentials_rejected() {
        let upstream = MockServer::start().await;
        mount_upstream(&upstream, 401).await;
        let server = TestServer::new(build_router(create_test_state(&upstream).await)).unwrap();

        let response = server
            .post("/api/credentials")
            .json(&json!({ "subdomain": "acme", "username": "ab", "password": "s3cret-pass" }))
            .await;
        response.assert_status(StatusCode::BAD_REQUEST);

        let response = server.post("/api/credentials").json(&credentials_body()).await;
        response.assert_status(StatusCode::BAD_REQUEST);
        let body: Value = response.json();
        assert!(body["error"].as_str().unwrap().contains("rejected"));
    }

    // Test 6: Admitted run is accepted and a second one conflicts
    #[tokio::test]
    async fn test_start_sync_accepted_then_conflict() {
        let upstream = MockServer::start().await;
        mount_upstream(&upstream, 200).await;
        Mock::given(method("GET"))
            .and(path("/acme/public/api/v1/customers"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!([]))
                    .set_delay(Duration::from_millis(300)),
            )
            .mount(&upstream)
            .await;

        let server = TestServer::new(build_router(create_test_state(&upstream).await)).unwrap();
        server
            .post("/api/credentials")
            .json(&credentials_body())
            .await
            .assert_status(StatusCode::CREATED);

        let response = server
            .post("/api/sync")
            .json(&json!({ "entities": ["customers"] }))
            .await;
        response.assert_status(StatusCode::ACCEPTED);
        let run: SyncRun = response.json();
        assert_eq!(run.entity_names(), vec!["customers"]);

        let response = server
            .post("/api/sync")
            .json(&json!({ "entities": ["companies"] }))
            .await;
        response.assert_status(StatusCode::CONFLICT);
        let body: Value = response.json();
        assert_eq!(body["run_id"], json!(run.id));

        let response = server.post("/api/sync/cancel").await;
        response.assert_status_ok();
        let body: Value = response.json();
        assert_eq!(body["cancelled"], true);

        let status: StatusResponse = server.get("/api/sync/status").await.json();
        assert_eq!(
            status.run.unwrap().status,
            crate::models::RunStatus::Cancelled
        );
    }

    // Test 7: Cancel with nothing running
    #[tokio::test]
    async fn test_cancel_without_run() {
        let upstream = MockServer::start().await;
        let server = TestServer::new(build_router(create_test_state(&upstream).await)).unwrap();

        let response = server.post("/api/sync/cancel").await;
        response.assert_status(StatusCode::NOT_FOUND);
    }

    // Test 8: Diagnostics endpoints
    #[tokio::test]
    async fn test_diagnostics_endpoints() {
        let upstream = MockServer::start().await;
        let server = TestServer::new(build_router(create_test_state(&upstream).await)).unwrap();

        let response = server.get("/api/sync/rate-limit").await;
        response.assert_status_ok();
        let body: Value = response.json();
        assert_eq!(body["running"], 0);
        assert_eq!(body["queued"], 0);
        assert_eq!(body["done"], 0);

        let response = server.get("/api/cache/stats").await;
        response.assert_status_ok();
        let body: Value = response.json();
        assert_eq!(body["total_entries"], 0);
        assert_eq!(body["ttl_secs"], 60);
    }

    // Test 9: Unknown run ID
    #[tokio::test]
    async fn test_get_run_not_found() {
        let upstream = MockServer::start().await;
        let server = TestServer::new(build_router(create_test_state(&upstream).await)).unwrap();

        let response = server.get("/api/sync/runs/999").await;
        response.assert_status(StatusCode::NOT_FOUND);
    }

    // Test 10: Error mapping
    #[test]
    fn test_error_response_status() {
        assert_eq!(
            error_response(&AppError::RunInProgress(1)).status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            error_response(&AppError::NotConfigured).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            error_response(&AppError::ValidationInconclusive("timeout".to_string())).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            error_response(&AppError::Internal("boom".to_string())).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}

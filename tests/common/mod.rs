//! Common test utilities and helpers for integration tests

#![allow(dead_code)]

use std::sync::Arc;

use serde_json::{json, Value};
use sienge_sync::cache::ValidationCache;
use sienge_sync::config::{Config, Environment};
use sienge_sync::database::{Database, SqliteDatabase};
use sienge_sync::models::StoredCredentials;
use sienge_sync::server::AppState;
use sienge_sync::sync::{HttpClientWithRateLimit, Orchestrator, SiengeClient};
use sienge_sync::vault::Vault;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const MASTER_KEY: &str = "integration-test-master-key";
pub const SUBDOMAIN: &str = "acme";
pub const USERNAME: &str = "api-user";
pub const PASSWORD: &str = "s3cret-pass";

/// Configuration pointing at a mock upstream with no pacing or retries
pub fn test_config(upstream: &MockServer) -> Config {
    let mut config = Config::default();
    config.environment = Environment::Production;
    config.upstream.base_url = format!("{}/{{subdomain}}/public/api/v1", upstream.uri());
    config.upstream.page_size = 50;
    config.rate_limit.min_interval_ms = 0;
    config.retry.max_retries = 0;
    config.vault.master_key = Some(MASTER_KEY.to_string());
    config
}

/// Upstream path for an endpoint of the test tenant
pub fn api_path(endpoint: &str) -> String {
    format!("/{}/public/api/v1{}", SUBDOMAIN, endpoint)
}

/// Create an in-memory database for testing
pub async fn create_test_database() -> Arc<SqliteDatabase> {
    Arc::new(
        SqliteDatabase::in_memory()
            .await
            .expect("Failed to create test database"),
    )
}

/// Store the test credentials encrypted under the test master key
pub async fn seed_credentials(database: &SqliteDatabase, config: &Config) {
    let vault = Vault::from_config(config);
    let secret = vault.encrypt(PASSWORD).expect("Failed to encrypt password");
    database
        .upsert_credentials(&StoredCredentials::new(SUBDOMAIN, USERNAME, secret))
        .await
        .expect("Failed to store credentials");
}

/// Build a client with its own cache and HTTP client
pub fn create_client(
    config: &Config,
    database: Arc<SqliteDatabase>,
) -> Arc<SiengeClient<SqliteDatabase>> {
    let http = Arc::new(
        HttpClientWithRateLimit::from_config(config).expect("Failed to build HTTP client"),
    );
    Arc::new(SiengeClient::with_components(
        config,
        http,
        database,
        Vault::from_config(config),
        Arc::new(ValidationCache::from_config(config)),
    ))
}

/// Build an orchestrator backed by a fresh client
pub fn create_orchestrator(
    config: &Config,
    database: Arc<SqliteDatabase>,
) -> Arc<Orchestrator<SqliteDatabase, SiengeClient<SqliteDatabase>>> {
    let client = create_client(config, database.clone());
    Arc::new(Orchestrator::new(database, client))
}

/// Create a test application state
pub async fn create_test_state(config: &Config) -> AppState<SqliteDatabase> {
    AppState::new(create_orchestrator(config, create_test_database().await))
}

/// Accept the test credentials on the validation endpoint
pub async fn mount_validation(upstream: &MockServer) {
    Mock::given(method("GET"))
        .and(path(api_path("/companies")))
        .and(query_param("limit", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": 0}])))
        .mount(upstream)
        .await;
}

/// Records `start..start + count` shaped like upstream rows
pub fn records(start: usize, count: usize) -> Vec<Value> {
    (start..start + count)
        .map(|id| json!({ "id": id, "name": format!("record-{}", id) }))
        .collect()
}

/// Serve `total` records from `endpoint` as bare arrays, `page_size` per page
pub async fn mount_pages(upstream: &MockServer, endpoint: &str, total: usize, page_size: usize) {
    let mut offset = 0;
    loop {
        let count = page_size.min(total.saturating_sub(offset));
        Mock::given(method("GET"))
            .and(path(api_path(endpoint)))
            .and(query_param("offset", offset.to_string()))
            .and(query_param("limit", page_size.to_string()))
            .respond_with(ResponseTemplate::new(200).set_body_json(records(offset, count)))
            .expect(1)
            .mount(upstream)
            .await;
        if count == 0 {
            break;
        }
        offset += page_size;
    }
}

/// Run a test server in the background and return the address
/// The server will be shut down when the returned shutdown sender is dropped or sent
pub async fn run_test_server(
    state: AppState<SqliteDatabase>,
) -> (std::net::SocketAddr, tokio::sync::oneshot::Sender<()>) {
    use tokio::net::TcpListener;

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind test server");
    let addr = listener.local_addr().expect("Failed to get local address");

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();

    let app = sienge_sync::server::build_router(state)
        .layer(tower_http::trace::TraceLayer::new_for_http());

    tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .expect("Server error");
    });

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    (addr, shutdown_tx)
}

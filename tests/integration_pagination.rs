//! Pagination integration tests
//!
//! Drives the page walker through the real rate-limited client against a
//! mock upstream:
//! - End-of-data detection
//! - Page and record ceilings
//! - Envelope shapes and metadata

mod common;

use std::time::Duration;

use common::*;
use serde_json::json;
use sienge_sync::sync::PageLimits;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn limits(max_pages: usize, max_records: usize) -> PageLimits {
    PageLimits {
        page_size: 50,
        max_pages,
        max_records,
        timeout: Duration::from_secs(60),
    }
}

/// Test 1: Five full pages, a short page and an empty page yield 260 records in 7 calls
#[tokio::test]
async fn test_paginated_fetch_until_empty_page() {
    let upstream = MockServer::start().await;
    mount_validation(&upstream).await;
    mount_pages(&upstream, "/customers", 260, 50).await;

    let config = test_config(&upstream);
    let database = create_test_database().await;
    seed_credentials(&database, &config).await;
    let client = create_client(&config, database);
    client.initialize().await.unwrap();

    let result = client
        .fetch_paginated_data("/customers", &[], Some(limits(50, 10_000)))
        .await
        .unwrap();

    assert_eq!(result.records.len(), 260);
    assert_eq!(result.pages, 7);
    assert!(!result.truncated);
    assert_eq!(result.records[259]["id"], 259);

    // validation call plus seven pages
    assert_eq!(client.rate_limit_stats().calls_made, 8);
}

/// Test 2: An upstream that never ends stops at the page ceiling
#[tokio::test]
async fn test_endless_upstream_is_truncated() {
    let upstream = MockServer::start().await;
    mount_validation(&upstream).await;
    Mock::given(method("GET"))
        .and(path(api_path("/income")))
        .respond_with(ResponseTemplate::new(200).set_body_json(records(0, 50)))
        .expect(50)
        .mount(&upstream)
        .await;

    let config = test_config(&upstream);
    let database = create_test_database().await;
    seed_credentials(&database, &config).await;
    let client = create_client(&config, database);
    client.initialize().await.unwrap();

    let result = client
        .fetch_paginated_data("/income", &[], Some(limits(50, 1_000_000)))
        .await
        .unwrap();

    assert_eq!(result.pages, 50);
    assert_eq!(result.records.len(), 2500);
    assert!(result.truncated);
    assert!(!result.warnings.is_empty());
}

/// Test 3: The record ceiling drops the overflow
#[tokio::test]
async fn test_record_ceiling() {
    let upstream = MockServer::start().await;
    mount_validation(&upstream).await;
    Mock::given(method("GET"))
        .and(path(api_path("/units")))
        .respond_with(ResponseTemplate::new(200).set_body_json(records(0, 50)))
        .expect(3)
        .mount(&upstream)
        .await;

    let config = test_config(&upstream);
    let database = create_test_database().await;
    seed_credentials(&database, &config).await;
    let client = create_client(&config, database);
    client.initialize().await.unwrap();

    let result = client
        .fetch_paginated_data("/units", &[], Some(limits(50, 120)))
        .await
        .unwrap();

    assert_eq!(result.records.len(), 120);
    assert_eq!(result.pages, 3);
    assert!(result.truncated);
}

/// Test 4: Envelope metadata ends the walk without an empty page
#[tokio::test]
async fn test_envelope_metadata_total() {
    let upstream = MockServer::start().await;
    mount_validation(&upstream).await;
    for (offset, count) in [(0usize, 50usize), (50, 30)] {
        Mock::given(method("GET"))
            .and(path(api_path("/enterprises")))
            .and(query_param("offset", offset.to_string()))
            .and(query_param("companyId", "7"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "resultSetMetadata": { "count": 80, "offset": offset, "limit": 50 },
                "results": records(offset, count)
            })))
            .expect(1)
            .mount(&upstream)
            .await;
    }

    let config = test_config(&upstream);
    let database = create_test_database().await;
    seed_credentials(&database, &config).await;
    let client = create_client(&config, database);
    client.initialize().await.unwrap();

    let params = vec![
        ("companyId".to_string(), "7".to_string()),
        ("offset".to_string(), "999".to_string()),
    ];
    let result = client
        .fetch_paginated_data("/enterprises", &params, None)
        .await
        .unwrap();

    assert_eq!(result.records.len(), 80);
    assert_eq!(result.pages, 2);
    assert!(!result.truncated);
}

/// Test 5: An unexpected shape is zero records plus a warning
#[tokio::test]
async fn test_unexpected_shape_is_a_warning() {
    let upstream = MockServer::start().await;
    mount_validation(&upstream).await;
    Mock::given(method("GET"))
        .and(path(api_path("/indexers")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "ok"})))
        .expect(1)
        .mount(&upstream)
        .await;

    let config = test_config(&upstream);
    let database = create_test_database().await;
    seed_credentials(&database, &config).await;
    let client = create_client(&config, database);
    client.initialize().await.unwrap();

    let result = client
        .fetch_paginated_data("/indexers", &[], None)
        .await
        .unwrap();

    assert!(result.records.is_empty());
    assert_eq!(result.warnings.len(), 1);
    assert!(!result.truncated);
}

/// Test 6: A client error mid-walk is surfaced, not swallowed
#[tokio::test]
async fn test_client_error_mid_walk() {
    let upstream = MockServer::start().await;
    mount_validation(&upstream).await;
    Mock::given(method("GET"))
        .and(path(api_path("/carriers")))
        .and(query_param("offset", "0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(records(0, 50)))
        .mount(&upstream)
        .await;
    Mock::given(method("GET"))
        .and(path(api_path("/carriers")))
        .and(query_param("offset", "50"))
        .respond_with(ResponseTemplate::new(400).set_body_string("bad offset"))
        .mount(&upstream)
        .await;

    let config = test_config(&upstream);
    let database = create_test_database().await;
    seed_credentials(&database, &config).await;
    let client = create_client(&config, database);
    client.initialize().await.unwrap();

    let error = client
        .fetch_paginated_data("/carriers", &[], None)
        .await
        .unwrap_err();
    assert!(error.to_string().contains("bad offset"));
}

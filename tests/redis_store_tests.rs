//! Redis store tests using testcontainers.
//!
//! These tests start a Redis container and exercise the Lua-backed store
//! directly and through two gateway instances sharing it. They need a
//! Docker daemon and are ignored by default.
//!
//! Run with: `cargo test --test redis_store_tests -- --ignored`
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use testcontainers::core::{IntoContainerPort, WaitFor};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, GenericImage};
use tower::ServiceExt;
use uuid::Uuid;

use edge_guard::models::SuspiciousPattern;
use edge_guard::store::{
    BehaviorUpdate, CircuitBreakerConfig, FallbackStore, MemoryStore, RedisStore,
    RedisStoreConfig, SecurityStore,
};
use edge_guard::{AppState, Config, build_router};

const REDIS_PORT: u16 = 6379;

/// Start of a 60s window, far from any boundary effects.
const WINDOW_START_MS: u64 = 28_000_000 * 60_000;

async fn start_redis() -> (ContainerAsync<GenericImage>, String) {
    let container = GenericImage::new("redis", "7-alpine")
        .with_exposed_port(REDIS_PORT.tcp())
        .with_wait_for(WaitFor::message_on_stdout("Ready to accept connections"))
        .start()
        .await
        .expect("Failed to start Redis container");

    let port = container
        .get_host_port_ipv4(REDIS_PORT)
        .await
        .expect("Failed to get Redis port");

    (container, format!("redis://127.0.0.1:{port}"))
}

/// Store with a per-test key prefix so tests never share keys.
fn store(url: &str) -> RedisStore {
    RedisStore::new(
        RedisStoreConfig::new(url).with_key_prefix(format!("test-{}", Uuid::new_v4())),
    )
    .expect("valid redis url")
}

#[tokio::test]
#[ignore = "requires a Docker daemon"]
async fn test_ping() {
    let (_container, url) = start_redis().await;
    store(&url).ping().await.unwrap();
}

#[tokio::test]
#[ignore = "requires a Docker daemon"]
async fn test_sliding_window_limit() {
    let (_container, url) = start_redis().await;
    let store = store(&url);
    let window = Duration::from_secs(60);

    for expected in 1..=5 {
        let outcome = store
            .sliding_window_hit("login:198.51.100.1", window, 5, WINDOW_START_MS + 10)
            .await
            .unwrap();
        assert!(outcome.allowed);
        assert_eq!(outcome.count, expected);
    }

    let outcome = store
        .sliding_window_hit("login:198.51.100.1", window, 5, WINDOW_START_MS + 20)
        .await
        .unwrap();
    assert!(!outcome.allowed);
    assert_eq!(outcome.count, 5);

    // Halfway through the next window, half of the previous count still applies
    let outcome = store
        .sliding_window_hit("login:198.51.100.1", window, 5, WINDOW_START_MS + 90_000)
        .await
        .unwrap();
    assert!(outcome.allowed);
    assert_eq!(outcome.count, 4);
}

#[tokio::test]
#[ignore = "requires a Docker daemon"]
async fn test_flags_expire_and_clear() {
    let (_container, url) = start_redis().await;
    let store = store(&url);

    assert_eq!(store.flag_ttl("bl:203.0.113.9").await.unwrap(), None);

    store
        .set_flag("bl:203.0.113.9", Duration::from_secs(60))
        .await
        .unwrap();
    let ttl = store.flag_ttl("bl:203.0.113.9").await.unwrap().unwrap();
    assert!(ttl > Duration::from_secs(50) && ttl <= Duration::from_secs(60));

    assert!(store.clear_flag("bl:203.0.113.9").await.unwrap());
    assert!(!store.clear_flag("bl:203.0.113.9").await.unwrap());

    store
        .set_flag("bl:203.0.113.10", Duration::from_millis(200))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(store.flag_ttl("bl:203.0.113.10").await.unwrap(), None);
}

#[tokio::test]
#[ignore = "requires a Docker daemon"]
async fn test_behavior_profile() {
    let (_container, url) = start_redis().await;
    let store = store(&url);
    let ip = "198.51.100.7";

    assert!(store.behavior(ip).await.unwrap().is_none());

    for (endpoint, agent) in [("/", "curl/8.0"), ("/cart", "curl/8.0"), ("/", "Mozilla/5.0")] {
        store
            .record_behavior(&BehaviorUpdate {
                ip,
                endpoint,
                user_agent: agent,
                country: Some("NL"),
                now_ms: edge_guard::utils::now_millis(),
                ttl: Duration::from_secs(600),
            })
            .await
            .unwrap();
    }
    store
        .push_pattern(ip, SuspiciousPattern::PathTraversal, Duration::from_secs(600))
        .await
        .unwrap();

    let behavior = store.behavior(ip).await.unwrap().unwrap();
    assert_eq!(behavior.request_count, 3);
    assert_eq!(behavior.unique_endpoints.len(), 2);
    assert_eq!(behavior.unique_user_agents.len(), 2);
    assert_eq!(behavior.countries.len(), 1);
    assert_eq!(behavior.suspicious_patterns, vec![SuspiciousPattern::PathTraversal]);
}

#[tokio::test]
#[ignore = "requires a Docker daemon"]
async fn test_fallback_store_uses_primary_when_healthy() {
    let (_container, url) = start_redis().await;
    let local = Arc::new(MemoryStore::new());
    let fallback = FallbackStore::new(
        Arc::new(store(&url)),
        local.clone(),
        CircuitBreakerConfig::new(3, 2, Duration::from_secs(30)),
        Duration::from_millis(500),
    );

    fallback
        .set_flag("bl:203.0.113.20", Duration::from_secs(60))
        .await
        .unwrap();
    assert!(fallback.flag_ttl("bl:203.0.113.20").await.unwrap().is_some());
    assert_eq!(fallback.active_backend().await, "redis");
    assert_eq!(fallback.fallback_calls(), 0);
}

#[tokio::test]
#[ignore = "requires a Docker daemon"]
async fn test_instances_share_limits() {
    let (_container, url) = start_redis().await;
    let config = || Config {
        redis_url: Some(url.clone()),
        store_timeout: Duration::from_millis(500),
        inspection_timeout: Duration::from_secs(2),
        ..Config::default()
    };
    let first = AppState::new(config()).unwrap();
    let second = AppState::new(config()).unwrap();
    let apps = [build_router(first.clone()), build_router(second.clone())];

    let request = || {
        Request::builder()
            .uri("/verify")
            .header("x-forwarded-for", "198.51.100.99")
            .header("x-forwarded-uri", "/api/login")
            .body(Body::empty())
            .unwrap()
    };

    let mut statuses = Vec::new();
    for i in 0..6 {
        let app = apps[i % 2].clone();
        statuses.push(app.oneshot(request()).await.unwrap().status());
    }

    assert!(statuses[..5].iter().all(|s| *s == StatusCode::OK));
    assert_eq!(statuses[5], StatusCode::TOO_MANY_REQUESTS);

    first.shutdown().await;
    second.shutdown().await;
}

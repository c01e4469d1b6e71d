//! End-to-end behaviour of SessionRefreshCoordinator against a mock provider

use std::time::Duration;

use futures_util::future::join_all;
use reserva_auth::clock::Clock;
use reserva_auth::SessionError;
use reserva_core::config::SessionConfig;
use wiremock::matchers::{method, path};
use wiremock::{Mock, ResponseTemplate};

use crate::common::{self, TOKEN_PATH};

fn access_token(result: &reserva_auth::SessionResult) -> String {
    result
        .as_ref()
        .expect("session fetch failed")
        .as_ref()
        .expect("no session")
        .access_token
        .clone()
}

#[tokio::test]
async fn test_simultaneous_callers_share_one_exchange() {
    let h = common::setup(SessionConfig::default()).await;
    common::mount_refresh_ok(&h.server, "access-1").await;

    let results = join_all((0..5).map(|_| h.coordinator.get_session())).await;

    assert_eq!(common::received(&h.server).await, 1);
    for result in &results {
        assert_eq!(access_token(result), "access-1");
    }
}

#[tokio::test]
async fn test_cached_session_served_until_ttl_expires() {
    let h = common::setup(SessionConfig::default()).await;
    common::mount_refresh_ok(&h.server, "access-1").await;

    let first = h.coordinator.get_session().await;
    assert_eq!(access_token(&first), "access-1");

    h.clock.advance(Duration::from_secs(100));
    let cached = h.coordinator.get_session().await;
    assert_eq!(access_token(&cached), "access-1");
    assert_eq!(common::received(&h.server).await, 1);

    h.clock.advance(Duration::from_secs(100));
    h.coordinator.get_session().await.expect("refetch failed");
    assert_eq!(common::received(&h.server).await, 2);

    // a steady poller keeps getting fresh exchanges
    for expected in 3..=5 {
        h.clock.advance(Duration::from_secs(200));
        h.coordinator.get_session().await.expect("refetch failed");
        assert_eq!(common::received(&h.server).await, expected);
    }
}

#[tokio::test]
async fn test_clear_cache_forces_new_exchange() {
    let h = common::setup(SessionConfig::default()).await;
    common::mount_refresh_ok(&h.server, "access-1").await;

    h.coordinator.get_session().await.expect("first fetch failed");
    h.coordinator.clear_cache();
    h.coordinator.get_session().await.expect("second fetch failed");

    assert_eq!(common::received(&h.server).await, 2);
}

#[tokio::test]
async fn test_logout_then_get_session_returns_none() {
    let h = common::setup(SessionConfig::default()).await;
    common::mount_refresh_ok(&h.server, "access-1").await;

    h.coordinator.get_session().await.expect("fetch failed");
    h.source.clear_session();
    h.coordinator.clear_cache();

    let result = h.coordinator.get_session().await.expect("fetch failed");
    assert!(result.is_none());
    assert_eq!(common::received(&h.server).await, 1);
}

#[tokio::test]
async fn test_rate_limited_exchange_is_replayed_after_retry_after() {
    let h = common::setup(SessionConfig::default()).await;
    common::mount_refresh_rate_limited(&h.server, "5", 1).await;
    common::mount_refresh_ok(&h.server, "access-1").await;
    let start = h.clock.now();

    let results = join_all((0..5).map(|_| h.coordinator.get_session())).await;

    for result in &results {
        assert_eq!(access_token(result), "access-1");
    }
    let sent = h.raw.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].1, start);
    assert!(sent[1].1 >= start + Duration::from_secs(5));

    let snapshot = h.coordinator.rate_limit_snapshot();
    assert!(!snapshot.is_rate_limited);
    assert_eq!(snapshot.consecutive_errors, 1);
    assert_eq!(snapshot.refresh_count, 1);
    assert_eq!(h.coordinator.queued_requests(), 0);
}

#[tokio::test]
async fn test_exchange_rejected_twice_is_replayed_twice() {
    let h = common::setup(SessionConfig::default()).await;
    common::mount_refresh_rate_limited(&h.server, "5", 2).await;
    common::mount_refresh_ok(&h.server, "access-1").await;
    let start = h.clock.now();

    let result = h.coordinator.get_session().await;

    assert_eq!(access_token(&result), "access-1");
    let sent = h.raw.sent();
    assert_eq!(sent.len(), 3);
    assert!(sent[1].1 >= start + Duration::from_secs(5));
    assert!(sent[2].1 >= sent[1].1 + Duration::from_secs(5));
}

#[tokio::test]
async fn test_exchange_queued_while_limited_waits_for_retry_after() {
    let config = SessionConfig {
        max_inline_wait_ms: 1000,
        ..SessionConfig::default()
    };
    let h = common::setup(config).await;
    common::mount_refresh_ok(&h.server, "access-1").await;
    h.coordinator
        .transport()
        .guard()
        .record_rejection(Some(Duration::from_secs(5)));
    let start = h.clock.now();
    assert_eq!(
        h.coordinator.rate_limit_snapshot().rate_limited_until,
        Some(start + Duration::from_secs(5))
    );

    // waits 1s inline, then the exchange is queued for the remaining 4s
    let result = h.coordinator.get_session().await;
    assert_eq!(access_token(&result), "access-1");

    let sent = h.raw.sent();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].1 >= start + Duration::from_secs(5));
    assert!(!h.coordinator.rate_limit_snapshot().is_rate_limited);
    assert_eq!(h.coordinator.queued_requests(), 0);
}

#[tokio::test]
async fn test_rejected_refresh_token_is_not_cached() {
    let h = common::setup(SessionConfig::default()).await;
    Mock::given(method("POST"))
        .and(path(TOKEN_PATH))
        .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({
            "msg": "Invalid Refresh Token"
        })))
        .mount(&h.server)
        .await;

    let err = h.coordinator.get_session().await.unwrap_err();
    assert!(matches!(err, SessionError::Provider { status: 401, .. }));
    assert!(h.coordinator.cache_age().is_none());

    // the source signed out, so the retry answers without the network
    let result = h.coordinator.get_session().await.expect("fetch failed");
    assert!(result.is_none());
    assert_eq!(common::received(&h.server).await, 1);
}

#[tokio::test]
async fn test_throttled_initiations_serve_last_known_session() {
    let h = common::setup(SessionConfig::default()).await;
    common::mount_refresh_ok(&h.server, "access-1").await;

    h.coordinator.get_session().await.expect("fetch failed");
    h.clock.advance(Duration::from_secs(181));
    h.coordinator
        .transport()
        .guard()
        .record_rejection(Some(Duration::from_secs(60)));

    let result = h.coordinator.get_session().await;

    assert_eq!(access_token(&result), "access-1");
    assert_eq!(common::received(&h.server).await, 1);
}

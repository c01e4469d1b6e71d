//! Guarded transport behaviour shared by every provider call

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use reqwest::{Method, Request, StatusCode};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use reserva_auth::clock::{Clock, ManualClock};
use reserva_auth::rate_limit::{RandomJitter, RateLimitGuard};
use reserva_auth::retry_queue::RetryQueue;
use reserva_auth::transport::HttpTransport;
use reserva_core::config::SessionConfig;

use crate::common::{self, RecordingTransport, TOKEN_PATH};

const ITEMS_PATH: &str = "/rest/v1/reservations";

fn transport(
    clock: &Arc<ManualClock>,
    raw: &Arc<RecordingTransport>,
    jitter_seed: u64,
) -> HttpTransport {
    let config = SessionConfig::default();
    let guard = Arc::new(RateLimitGuard::with_jitter(
        config.clone(),
        clock.clone(),
        Box::new(RandomJitter::seeded(jitter_seed)),
    ));
    let queue = RetryQueue::new(guard.clone(), clock.clone(), config.retry_spacing());
    HttpTransport::new(raw.clone(), guard, queue, clock.clone(), &config)
}

fn get(server: &MockServer, path: &str) -> Request {
    let url = format!("{}{path}", server.uri());
    Request::new(Method::GET, url.parse().unwrap())
}

#[tokio::test]
async fn test_consecutive_rejections_grow_backoff_within_jitter_bounds() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(ITEMS_PATH))
        .respond_with(ResponseTemplate::new(429))
        .mount(&server)
        .await;
    let clock = Arc::new(ManualClock::new());
    let raw = Arc::new(RecordingTransport::new(clock.clone()));
    let http = transport(&clock, &raw, 42);

    let max = SessionConfig::default().max_backoff();
    let mut previous = http.guard().snapshot().backoff_time;
    for _ in 0..10 {
        let response = http.execute(get(&server, ITEMS_PATH)).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        let current = http.guard().snapshot().backoff_time;
        if current == max {
            assert!(previous.mul_f64(2.4) >= max);
        } else {
            assert!(current >= previous.mul_f64(1.6), "{current:?} < 1.6 x {previous:?}");
            assert!(current <= previous.mul_f64(2.4), "{current:?} > 2.4 x {previous:?}");
        }
        previous = current;
    }
    assert_eq!(previous, max);
    assert_eq!(http.guard().snapshot().consecutive_errors, 10);
}

#[tokio::test]
async fn test_success_after_rejections_resets_backoff_but_keeps_limit() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(ITEMS_PATH))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "120"))
        .up_to_n_times(2)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(ITEMS_PATH))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    let clock = Arc::new(ManualClock::new());
    let raw = Arc::new(RecordingTransport::new(clock.clone()));
    let http = transport(&clock, &raw, 7);

    http.execute(get(&server, ITEMS_PATH)).await.unwrap();
    http.execute(get(&server, ITEMS_PATH)).await.unwrap();
    assert_eq!(http.guard().snapshot().consecutive_errors, 2);

    let response = http.execute(get(&server, ITEMS_PATH)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let snapshot = http.guard().snapshot();
    assert_eq!(snapshot.backoff_time, SessionConfig::default().initial_backoff());
    assert_eq!(snapshot.consecutive_errors, 0);
    // a success on another endpoint does not lift the limit
    assert!(snapshot.is_rate_limited);
}

#[tokio::test]
async fn test_deferred_exchanges_replay_in_order_with_spacing() {
    let server = MockServer::start().await;
    common::mount_refresh_ok(&server, "access").await;
    let clock = Arc::new(ManualClock::new());
    let raw = Arc::new(RecordingTransport::new(clock.clone()));
    let http = transport(&clock, &raw, 1);

    http.guard().record_rejection(Some(Duration::from_secs(5)));
    let limited_until = http.guard().snapshot().rate_limited_until.unwrap();

    let exchanges = (1..=3).map(|n| {
        let http = http.clone();
        let url = format!(
            "{}{TOKEN_PATH}?grant_type=refresh_token&n={n}",
            server.uri()
        );
        tokio::spawn(async move {
            http.execute(Request::new(Method::POST, url.parse().unwrap()))
                .await
        })
    });
    let tasks: Vec<_> = exchanges.collect();
    for result in join_all(tasks).await {
        let response = result.unwrap().unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let sent = raw.sent();
    let order: Vec<&str> = sent
        .iter()
        .map(|(url, _)| url.rsplit('=').next().unwrap())
        .collect();
    assert_eq!(order, vec!["1", "2", "3"]);
    assert!(sent[0].1 >= limited_until);
    for pair in sent.windows(2) {
        assert!(pair[1].1 - pair[0].1 >= Duration::from_secs(1));
    }
}

#[tokio::test]
async fn test_limit_released_by_refresh_success_lets_requests_through() {
    let server = MockServer::start().await;
    common::mount_refresh_ok(&server, "access").await;
    Mock::given(method("GET"))
        .and(path(ITEMS_PATH))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    let clock = Arc::new(ManualClock::new());
    let raw = Arc::new(RecordingTransport::new(clock.clone()));
    let http = transport(&clock, &raw, 3);

    http.guard().record_rejection(Some(Duration::from_secs(2)));
    let url = format!("{}{TOKEN_PATH}?grant_type=refresh_token", server.uri());
    http.execute(Request::new(Method::POST, url.parse().unwrap()))
        .await
        .unwrap();
    assert!(http.guard().rate_limit_wait().is_none());

    let before = clock.now();
    http.execute(get(&server, ITEMS_PATH)).await.unwrap();
    assert_eq!(clock.now(), before, "no inline wait once the limit is lifted");
}

use admission_gate::app;
use admission_gate::config::FilterConfig;
use admission_gate::filter::{self, AdmissionFilter};
use admission_gate::rate_limit::ManualClock;
use axum::{
    Router,
    body::Body,
    extract::{ConnectInfo, Request},
    http::{StatusCode, header::RETRY_AFTER},
    middleware,
    routing::get,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tower::ServiceExt;

const WINDOW_SECONDS: i64 = 4;
const LIMIT: i64 = 40;
// start of window 100 for a 4s window
const WINDOW_START: u64 = 400_000;

fn request_from(ip: &str) -> Request {
    let addr: SocketAddr = format!("{ip}:50000").parse().unwrap();
    Request::builder()
        .uri("/")
        .extension(ConnectInfo(addr))
        .body(Body::empty())
        .unwrap()
}

fn gateway(config: FilterConfig, clock: Arc<ManualClock>) -> (Router, Arc<AdmissionFilter>) {
    let filter = Arc::new(AdmissionFilter::configure_with_clock(&config, clock).unwrap());
    (app(Arc::clone(&filter)), filter)
}

async fn status_of(router: &Router, ip: &str) -> StatusCode {
    router.clone().oneshot(request_from(ip)).await.unwrap().status()
}

fn expected(total: usize, admitted: impl Fn(usize) -> bool) -> Vec<StatusCode> {
    (0..total)
        .map(|i| if admitted(i) { StatusCode::OK } else { StatusCode::TOO_MANY_REQUESTS })
        .collect()
}

#[tokio::test]
async fn admits_min_of_requests_and_limit_within_a_window() {
    let clock = Arc::new(ManualClock::new(WINDOW_START + 500));
    let (router, _) = gateway(FilterConfig::new(WINDOW_SECONDS, 5), clock);

    let mut statuses = Vec::new();
    for _ in 0..8 {
        statuses.push(status_of(&router, "10.1.1.1").await);
    }
    assert_eq!(statuses, expected(8, |i| i < 5));

    // a second filter keeps its own counts
    let clock = Arc::new(ManualClock::new(WINDOW_START));
    let (router, _) = gateway(FilterConfig::new(WINDOW_SECONDS, 5), clock);
    for _ in 0..3 {
        assert_eq!(status_of(&router, "10.1.1.1").await, StatusCode::OK);
    }
}

#[tokio::test]
async fn rejection_short_circuits_downstream() {
    let clock = Arc::new(ManualClock::new(WINDOW_START + 1_200));
    let admission =
        Arc::new(AdmissionFilter::configure_with_clock(&FilterConfig::new(WINDOW_SECONDS, 2), clock).unwrap());

    let calls = Arc::new(AtomicUsize::new(0));
    let downstream_calls = Arc::clone(&calls);
    let router = Router::new()
        .route(
            "/",
            get(move || {
                let calls = Arc::clone(&downstream_calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    "downstream"
                }
            }),
        )
        .layer(middleware::from_fn_with_state(Arc::clone(&admission), filter::handle));

    for _ in 0..2 {
        let response = router.clone().oneshot(request_from("10.2.2.2")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"downstream");
    }

    let response = router.clone().oneshot(request_from("10.2.2.2")).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    // 2.8s left in the window
    assert_eq!(response.headers()[RETRY_AFTER], "3");
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&body[..], b"Too many requests");

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(admission.counter().count_at("10.2.2.2", WINDOW_START + 1_200), 3);
}

#[tokio::test]
async fn custom_status_and_message() {
    let config = FilterConfig {
        status_code: 503,
        status_message: "slow down".to_string(),
        ..FilterConfig::new(WINDOW_SECONDS, 1)
    };
    let (router, _) = gateway(config, Arc::new(ManualClock::new(WINDOW_START)));

    assert_eq!(status_of(&router, "10.3.3.3").await, StatusCode::OK);

    let response = router.clone().oneshot(request_from("10.3.3.3")).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&body[..], b"slow down");
}

#[tokio::test]
async fn rollover_restores_quota_after_rejections() {
    let clock = Arc::new(ManualClock::new(WINDOW_START + 3_000));
    let (router, _) = gateway(FilterConfig::new(WINDOW_SECONDS, 3), clock.clone());

    let mut first = Vec::new();
    for _ in 0..10 {
        first.push(status_of(&router, "10.4.4.4").await);
    }
    assert_eq!(first, expected(10, |i| i < 3));

    clock.advance(Duration::from_millis(1_000));

    let mut second = Vec::new();
    for _ in 0..4 {
        second.push(status_of(&router, "10.4.4.4").await);
    }
    assert_eq!(second, expected(4, |i| i < 3));
}

#[tokio::test]
async fn forwarded_requests_carry_their_count() {
    let config = FilterConfig {
        enforce: false,
        ..FilterConfig::new(WINDOW_SECONDS, 1)
    };
    let (router, _) = gateway(config, Arc::new(ManualClock::new(WINDOW_START)));

    for expected_count in 1..=3 {
        let response = router.clone().oneshot(request_from("10.5.5.5")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["count"], expected_count);
    }
}

#[tokio::test]
async fn health_route_is_filtered_too() {
    let (router, _) = gateway(FilterConfig::new(WINDOW_SECONDS, 1), Arc::new(ManualClock::new(WINDOW_START)));

    let health = |ip: &str| {
        let addr: SocketAddr = format!("{ip}:50000").parse().unwrap();
        Request::builder()
            .uri("/health")
            .extension(ConnectInfo(addr))
            .body(Body::empty())
            .unwrap()
    };

    assert_eq!(router.clone().oneshot(health("10.6.6.6")).await.unwrap().status(), StatusCode::OK);
    assert_eq!(
        router.clone().oneshot(health("10.6.6.6")).await.unwrap().status(),
        StatusCode::TOO_MANY_REQUESTS
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_burst_on_one_key_admits_exactly_the_limit() {
    let (router, filter) = gateway(FilterConfig::new(WINDOW_SECONDS, 50), Arc::new(ManualClock::new(WINDOW_START)));

    let tasks: Vec<_> = (0..200)
        .map(|_| {
            let router = router.clone();
            tokio::spawn(async move { router.oneshot(request_from("10.7.7.7")).await.unwrap().status() })
        })
        .collect();

    let mut admitted = 0;
    let mut rejected = 0;
    for task in tasks {
        let status = task.await.unwrap();
        if status == StatusCode::OK {
            admitted += 1;
        } else if status == StatusCode::TOO_MANY_REQUESTS {
            rejected += 1;
        } else {
            panic!("unexpected status {status}");
        }
    }

    assert_eq!(admitted, 50);
    assert_eq!(rejected, 150);
    assert_eq!(filter.counter().count_at("10.7.7.7", WINDOW_START), 200);
}

struct Client {
    ip: &'static str,
    rps: u64,
}

const CLIENTS: [Client; 4] = [
    Client { ip: "10.20.20.5", rps: 5 },
    Client { ip: "10.20.20.10", rps: 10 },
    Client { ip: "10.20.20.20", rps: 20 },
    Client { ip: "10.20.20.40", rps: 40 },
];

// Four clients at 5, 10, 20 and 40 req/s from a window boundary for 5s,
// replayed on virtual time in global timestamp order.
#[tokio::test]
async fn four_clients_reference_scenario() {
    let clock = Arc::new(ManualClock::new(WINDOW_START));
    let (router, _) = gateway(FilterConfig::new(WINDOW_SECONDS, LIMIT), clock.clone());

    let run_millis = 5_000;
    let mut events: Vec<(u64, usize)> = CLIENTS
        .iter()
        .enumerate()
        .flat_map(|(idx, client)| {
            let interval = 1_000 / client.rps;
            (0..200u64)
                .map(move |i| i * interval)
                .take_while(move |t| *t < run_millis)
                .map(move |t| (t, idx))
        })
        .collect();
    events.sort_unstable();

    let mut results: Vec<Vec<StatusCode>> = vec![Vec::new(); CLIENTS.len()];
    for (offset, idx) in events {
        clock.set(WINDOW_START + offset);
        results[idx].push(status_of(&router, CLIENTS[idx].ip).await);
    }

    let limit = LIMIT as usize;

    // 25 and 50 requests, never more than 40 in one window
    assert_eq!(results[0], expected(25, |_| true));
    assert_eq!(results[1], expected(50, |_| true));

    // 80 requests in the first window, 20 in the second
    assert_eq!(results[2], expected(100, |i| i < limit || i >= 80));

    // 160 requests in the first window, 40 in the second
    assert_eq!(results[3], expected(200, |i| i < limit || i >= 160));
}

// Same demand, each client an independent task hammering the filter
// concurrently; the clock is held inside one window per phase.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn four_clients_concurrently_per_window() {
    let clock = Arc::new(ManualClock::new(WINDOW_START + 100));
    let (router, _) = gateway(FilterConfig::new(WINDOW_SECONDS, LIMIT), clock.clone());

    async fn run_phase(router: &Router, demand: [usize; 4]) -> Vec<Vec<StatusCode>> {
        let tasks: Vec<_> = CLIENTS
            .iter()
            .zip(demand)
            .map(|(client, n)| {
                let router = router.clone();
                let ip = client.ip;
                tokio::spawn(async move {
                    let mut statuses = Vec::with_capacity(n);
                    for _ in 0..n {
                        statuses.push(router.clone().oneshot(request_from(ip)).await.unwrap().status());
                    }
                    statuses
                })
            })
            .collect();

        let mut results = Vec::new();
        for task in tasks {
            results.push(task.await.unwrap());
        }
        results
    }

    let limit = LIMIT as usize;

    let first = run_phase(&router, [20, 40, 80, 160]).await;
    assert_eq!(first[0], expected(20, |_| true));
    assert_eq!(first[1], expected(40, |_| true));
    assert_eq!(first[2], expected(80, |i| i < limit));
    assert_eq!(first[3], expected(160, |i| i < limit));

    clock.set(WINDOW_START + 4_000);

    let second = run_phase(&router, [5, 10, 20, 40]).await;
    for (statuses, n) in second.iter().zip([5, 10, 20, 40]) {
        assert_eq!(*statuses, expected(n, |_| true));
    }
}

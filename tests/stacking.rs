//! Integration tests for full middleware stacks: decorators composed the
//! way the builder wires them, driven by scripted transports.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tower::util::BoxService;
use tower::service_fn;
use tower_sheets::{
    AdaptiveConfig, CacheConfig, ErrorCategory, InMemorySheets, RetryConfig, SheetsClient,
    SheetsClientBuilder, SheetsError, SheetsRequest, SheetsResponse, TransportError, ValueRange,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Innermost service that fails `failures` times with `code`, then
/// returns a single-cell payload, counting every inward call.
fn scripted(
    failures: usize,
    code: u16,
    calls: Arc<AtomicUsize>,
) -> BoxService<SheetsRequest, SheetsResponse, SheetsError> {
    BoxService::new(service_fn(move |_req: SheetsRequest| {
        let calls = calls.clone();
        async move {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < failures {
                Err(SheetsError::Transport(TransportError::status(
                    code,
                    format!("scripted failure #{n}"),
                )))
            } else {
                Ok(SheetsResponse::Values(ValueRange::new(
                    "A1",
                    vec![vec![json!("x")]],
                )))
            }
        }
    }))
}

#[tokio::test]
async fn retry_backoff_end_to_end() {
    init_tracing();
    let calls = Arc::new(AtomicUsize::new(0));
    let client = SheetsClientBuilder::from_service(scripted(2, 500, calls.clone()))
        .retry(RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
        })
        .build();

    let started = Instant::now();
    let values = client.read("s1", "A1").await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(values.values, vec![vec![json!("x")]]);
    // At least the two computed backoff floors: 10ms + 20ms.
    assert!(started.elapsed() >= Duration::from_millis(30));
}

#[tokio::test]
async fn non_retryable_makes_exactly_one_call() {
    init_tracing();
    let calls = Arc::new(AtomicUsize::new(0));
    let client = SheetsClientBuilder::from_service(scripted(usize::MAX, 403, calls.clone()))
        .retry(RetryConfig {
            max_attempts: 5,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        })
        .build();

    let err = client.read("s1", "A1").await.unwrap_err();
    let classified = err.classified().expect("classified at the boundary");
    assert_eq!(classified.category, ErrorCategory::Permission);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

/// The metrics layer's independent 3-attempt loop multiplies with the
/// retry engine's budget when both are stacked. Observed behavior, kept
/// as two separately configured policies.
#[tokio::test]
async fn stacked_layers_multiply_attempts() {
    init_tracing();
    let calls = Arc::new(AtomicUsize::new(0));
    let client = SheetsClientBuilder::from_service(scripted(usize::MAX, 500, calls.clone()))
        .retry(RetryConfig {
            max_attempts: 2,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        })
        .with_metrics()
        .metrics_backoff(Duration::from_millis(1))
        .build();

    let err = client.read("s1", "A1").await.unwrap_err();
    assert!(err.is_transient());

    // 3 metrics-layer attempts, each running a full 2-try retry sequence.
    assert_eq!(calls.load(Ordering::SeqCst), 6);

    let snapshot = client.metrics().unwrap().snapshot();
    assert_eq!(snapshot.total_requests, 1);
    assert_eq!(snapshot.failed_requests, 1);
    assert_eq!(snapshot.retry_count, 2);
    assert_eq!(snapshot.errors_by_code.get("500"), Some(&1));
    assert_eq!(snapshot.rate_limit_hits, 0);
}

#[tokio::test]
async fn write_never_serves_stale_reads() {
    init_tracing();
    let client = SheetsClient::builder(InMemorySheets::new().with_spreadsheet("s1", "Budget"))
        .retry(RetryConfig {
            max_attempts: 2,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        })
        .with_cache(CacheConfig::default())
        .build();

    client
        .write("s1", "A1:B1", vec![vec![json!("old")]])
        .await
        .unwrap();
    let first = client.read("s1", "A1:B1").await.unwrap();
    assert_eq!(first.values[0][0], json!("old"));

    client
        .write("s1", "A1:B1", vec![vec![json!("new")]])
        .await
        .unwrap();
    let second = client.read("s1", "A1:B1").await.unwrap();
    assert_eq!(second.values[0][0], json!("new"));
}

#[tokio::test]
async fn batch_read_primes_the_cache_in_caller_order() {
    init_tracing();
    let client = SheetsClient::builder(InMemorySheets::new().with_spreadsheet("s1", "Budget"))
        .with_cache(CacheConfig::default())
        .build();

    client.write("s1", "A1", vec![vec![json!(1)]]).await.unwrap();
    client.write("s1", "B1", vec![vec![json!(2)]]).await.unwrap();

    // Prime one range through a single read, then batch both.
    client.read("s1", "A1").await.unwrap();
    let values = client.batch_read("s1", &["B1", "A1"]).await.unwrap();
    assert_eq!(values[0].range, "B1");
    assert_eq!(values[0].values[0][0], json!(2));
    assert_eq!(values[1].range, "A1");
    assert_eq!(values[1].values[0][0], json!(1));

    // Both ranges are now individually cached.
    let cache = client.cache().unwrap();
    assert!(cache.get(&tower_sheets::cache_key("s1", "A1")).is_some());
    assert!(cache.get(&tower_sheets::cache_key("s1", "B1")).is_some());
}

#[tokio::test]
async fn exhausted_rate_limits_reach_the_adaptive_limiter() {
    init_tracing();
    let calls = Arc::new(AtomicUsize::new(0));
    let client = SheetsClientBuilder::from_service(scripted(1, 429, calls.clone()))
        .retry(RetryConfig {
            // A single attempt: the retry engine surfaces the 429 instead
            // of absorbing it, so the limiter outside sees it.
            max_attempts: 1,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        })
        .with_adaptive_limiter(AdaptiveConfig {
            window: Duration::from_millis(200),
            max_requests: 10,
            safety_margin: Duration::from_millis(1),
            delay_floor: Duration::from_millis(10),
            delay_ceiling: Duration::from_millis(50),
            decay: 0.5,
        })
        .build();

    let err = client.read("s1", "A1").await.unwrap_err();
    assert!(err.is_rate_limit());

    let limiter = client.adaptive_limiter().unwrap();
    let after_failure = limiter.stats().await;
    assert!(after_failure.current_delay >= Duration::from_millis(10));
    assert!(after_failure.success_rate < 1.0);

    // The next call succeeds; the limiter decays its delay again.
    client.read("s1", "A1").await.unwrap();
    let after_success = limiter.stats().await;
    assert!(after_success.current_delay < after_failure.current_delay);
}

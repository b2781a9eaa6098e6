//! Latency, outcome, and throughput metrics around wrapped calls.
//!
//! The registry is a single process-lifetime instance per wrapped client;
//! counters only move forward between explicit resets. Derived figures
//! (success rate, throughput) are recomputed from the live counters on
//! every [`MetricsRegistry::summary`] call, never cached.
//!
//! The wrapping layer runs its own bounded retry loop — fixed three
//! attempts with linear backoff — so the retry counts it records are
//! observed rather than inferred. This is deliberately independent of the
//! retry engine's configuration; stacking both multiplies attempts.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tower::{Layer, Service, ServiceExt};
use tracing::debug;

use crate::api::{Method, SheetsRequest, SheetsResponse};
use crate::error::{Result, SheetsError};

/// Samples kept for the sliding-window latency average.
const LATENCY_WINDOW: usize = 100;

/// Attempts made by the metrics layer's own retry loop.
const LAYER_ATTEMPTS: usize = 3;

/// Default base for the layer's linear backoff (`base * attempt`).
const LAYER_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Debug, Default)]
struct MetricsInner {
    total_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
    retry_count: u64,
    rate_limit_hits: u64,
    latencies: VecDeque<Duration>,
    errors_by_code: HashMap<String, u64>,
    requests_by_method: HashMap<Method, u64>,
}

impl MetricsInner {
    fn average_latency(&self) -> Duration {
        if self.latencies.is_empty() {
            return Duration::ZERO;
        }
        self.latencies.iter().sum::<Duration>() / self.latencies.len() as u32
    }
}

/// Raw counter view.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub retry_count: u64,
    pub rate_limit_hits: u64,
    pub average_latency: Duration,
    pub errors_by_code: HashMap<String, u64>,
    pub requests_by_method: HashMap<String, u64>,
}

/// Figures derived from the counters at call time.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSummary {
    pub total_requests: u64,
    pub success_rate: f64,
    pub average_latency: Duration,
    pub requests_per_second: f64,
    pub retry_count: u64,
    pub rate_limit_hits: u64,
    pub uptime: Duration,
}

/// Aggregated request statistics, shared across every call made through
/// one metrics-wrapped client.
#[derive(Debug)]
pub struct MetricsRegistry {
    started_at: StdMutex<Instant>,
    inner: StdMutex<MetricsInner>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            started_at: StdMutex::new(Instant::now()),
            inner: StdMutex::new(MetricsInner::default()),
        }
    }

    /// Folds one finished request into the counters.
    pub fn record(
        &self,
        method: Method,
        duration: Duration,
        success: bool,
        retries: u64,
        error: Option<&SheetsError>,
    ) {
        let mut inner = self.inner.lock().expect("metrics lock poisoned");
        inner.total_requests += 1;
        *inner.requests_by_method.entry(method).or_insert(0) += 1;
        inner.retry_count += retries;
        inner.latencies.push_back(duration);
        while inner.latencies.len() > LATENCY_WINDOW {
            inner.latencies.pop_front();
        }
        if success {
            inner.successful_requests += 1;
        } else {
            inner.failed_requests += 1;
            if let Some(err) = error {
                *inner
                    .errors_by_code
                    .entry(err.code().to_string())
                    .or_insert(0) += 1;
                if err.is_rate_limit() {
                    inner.rate_limit_hits += 1;
                }
            }
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let inner = self.inner.lock().expect("metrics lock poisoned");
        MetricsSnapshot {
            total_requests: inner.total_requests,
            successful_requests: inner.successful_requests,
            failed_requests: inner.failed_requests,
            retry_count: inner.retry_count,
            rate_limit_hits: inner.rate_limit_hits,
            average_latency: inner.average_latency(),
            errors_by_code: inner.errors_by_code.clone(),
            requests_by_method: inner
                .requests_by_method
                .iter()
                .map(|(m, n)| (m.as_str().to_string(), *n))
                .collect(),
        }
    }

    /// Derives success rate and throughput from the live counters.
    pub fn summary(&self) -> MetricsSummary {
        let uptime = self
            .started_at
            .lock()
            .expect("metrics lock poisoned")
            .elapsed();
        let inner = self.inner.lock().expect("metrics lock poisoned");
        let success_rate = if inner.total_requests == 0 {
            1.0
        } else {
            inner.successful_requests as f64 / inner.total_requests as f64
        };
        let uptime_secs = uptime.as_secs_f64().max(f64::EPSILON);
        MetricsSummary {
            total_requests: inner.total_requests,
            success_rate,
            average_latency: inner.average_latency(),
            requests_per_second: inner.total_requests as f64 / uptime_secs,
            retry_count: inner.retry_count,
            rate_limit_hits: inner.rate_limit_hits,
            uptime,
        }
    }

    /// Zeroes every counter and restarts the uptime clock.
    pub fn reset(&self) {
        *self.inner.lock().expect("metrics lock poisoned") = MetricsInner::default();
        *self.started_at.lock().expect("metrics lock poisoned") = Instant::now();
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Layer recording per-request metrics, with its own small retry loop.
pub struct MetricsLayer {
    registry: Arc<MetricsRegistry>,
    backoff: Duration,
}

impl MetricsLayer {
    pub fn new(registry: Arc<MetricsRegistry>) -> Self {
        Self {
            registry,
            backoff: LAYER_BACKOFF,
        }
    }

    /// Overrides the linear backoff base. The attempt count stays fixed.
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }
}

pub struct Metered<S> {
    inner: Arc<Mutex<S>>,
    registry: Arc<MetricsRegistry>,
    backoff: Duration,
}

impl<S> Layer<S> for MetricsLayer {
    type Service = Metered<S>;

    fn layer(&self, inner: S) -> Self::Service {
        Metered {
            inner: Arc::new(Mutex::new(inner)),
            registry: self.registry.clone(),
            backoff: self.backoff,
        }
    }
}

impl<S> Service<SheetsRequest> for Metered<S>
where
    S: Service<SheetsRequest, Response = SheetsResponse, Error = SheetsError> + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = SheetsResponse;
    type Error = SheetsError;
    type Future = Pin<Box<dyn Future<Output = Result<SheetsResponse>> + Send>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<()>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: SheetsRequest) -> Self::Future {
        let inner = self.inner.clone();
        let registry = self.registry.clone();
        let backoff = self.backoff;
        Box::pin(async move {
            let method = req.method();
            let started = Instant::now();
            let mut attempt = 0usize;
            let result = loop {
                let fut = {
                    let mut guard = inner.lock().await;
                    ServiceExt::ready(&mut *guard).await?.call(req.clone())
                };
                match fut.await {
                    Ok(resp) => break Ok(resp),
                    Err(err) if err.is_transient() && attempt + 1 < LAYER_ATTEMPTS => {
                        attempt += 1;
                        let delay = backoff * attempt as u32;
                        debug!(
                            method = %method,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            "metrics layer retrying"
                        );
                        sleep(delay).await;
                    }
                    Err(err) => break Err(err),
                }
            };
            registry.record(
                method,
                started.elapsed(),
                result.is_ok(),
                attempt as u64,
                result.as_ref().err(),
            );
            result
        })
    }
}

//! Retry engine with bounded exponential backoff and jitter.
//!
//! Each call runs its own independent retry sequence; there is no shared
//! cooldown or circuit breaker across calls — pacing between calls is the
//! rate limiters' job. On every failure the raw transport error is
//! classified; a non-retryable code or an exhausted attempt budget
//! surfaces the last [`ClassifiedError`] with the original cause attached.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tower::{Layer, Service, ServiceExt};
use tracing::{debug, warn};

use crate::api::{SheetsRequest, SheetsResponse};
use crate::config::RetryConfig;
use crate::error::{ClassifiedError, Result, SheetsError, TransportError};

/// Uniform jitter added on top of the exponential delay.
const JITTER_MS: u64 = 1000;

/// Backoff state for one call's retry sequence.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    config: RetryConfig,
    attempt: usize,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Zero-based index of the attempt currently being made.
    pub fn attempt(&self) -> usize {
        self.attempt
    }

    /// Whether another try is allowed after the current failure.
    pub fn should_retry(&self) -> bool {
        self.attempt + 1 < self.config.max_attempts
    }

    /// Delay before the next attempt:
    /// `min(initial * 2^attempt, max) + uniform(0..1s)`.
    /// Advances the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self
            .config
            .initial_delay
            .as_secs_f64()
            * 2f64.powi(self.attempt as i32);
        let capped = exp.min(self.config.max_delay.as_secs_f64());
        let jitter = rand::thread_rng().gen_range(0..JITTER_MS);
        self.attempt += 1;
        Duration::from_secs_f64(capped) + Duration::from_millis(jitter)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Run `operation` under `config`, classifying each failure and backing
/// off between retryable ones. The success value is returned as soon as
/// an attempt succeeds; otherwise the last classified error is surfaced.
pub async fn with_retry<T, F, Fut>(config: RetryConfig, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, TransportError>>,
{
    let mut policy = RetryPolicy::new(config);
    loop {
        match operation().await {
            Ok(value) => {
                if policy.attempt() > 0 {
                    debug!(attempts = policy.attempt() + 1, "succeeded after retries");
                }
                return Ok(value);
            }
            Err(raw) => {
                let classified = ClassifiedError::classify(raw);
                if !classified.retryable || !policy.should_retry() {
                    warn!(
                        code = %classified.code,
                        category = ?classified.category,
                        attempts = policy.attempt() + 1,
                        "giving up: {classified}"
                    );
                    return Err(classified.into());
                }
                let delay = policy.next_delay();
                warn!(
                    attempt = policy.attempt(),
                    delay_ms = delay.as_millis() as u64,
                    "transient failure, backing off: {classified}"
                );
                sleep(delay).await;
            }
        }
    }
}

/// Layer wrapping a service in the retry engine.
pub struct RetryLayer {
    config: RetryConfig,
}

impl RetryLayer {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }
}

pub struct Retry<S> {
    inner: Arc<Mutex<S>>,
    config: RetryConfig,
}

impl<S> Layer<S> for RetryLayer {
    type Service = Retry<S>;

    fn layer(&self, inner: S) -> Self::Service {
        Retry {
            inner: Arc::new(Mutex::new(inner)),
            config: self.config,
        }
    }
}

impl<S> Service<SheetsRequest> for Retry<S>
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
        let config = self.config;
        Box::pin(async move {
            let mut policy = RetryPolicy::new(config);
            loop {
                let fut = {
                    let mut guard = inner.lock().await;
                    ServiceExt::ready(&mut *guard).await?.call(req.clone())
                };
                match fut.await {
                    Ok(resp) => {
                        if policy.attempt() > 0 {
                            debug!(
                                method = %req.method(),
                                attempts = policy.attempt() + 1,
                                "succeeded after retries"
                            );
                        }
                        return Ok(resp);
                    }
                    Err(SheetsError::Transport(raw)) => {
                        let classified = ClassifiedError::classify(raw);
                        if !classified.retryable || !policy.should_retry() {
                            warn!(
                                method = %req.method(),
                                code = %classified.code,
                                attempts = policy.attempt() + 1,
                                "giving up: {classified}"
                            );
                            return Err(classified.into());
                        }
                        let delay = policy.next_delay();
                        warn!(
                            method = %req.method(),
                            attempt = policy.attempt(),
                            delay_ms = delay.as_millis() as u64,
                            "transient failure, backing off: {classified}"
                        );
                        sleep(delay).await;
                    }
                    // Precondition errors and already-classified failures
                    // pass through untouched.
                    Err(other) => return Err(other),
                }
            }
        })
    }
}

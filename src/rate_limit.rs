//! Rate limiting layers: adaptive sliding-window and token bucket.
//!
//! Both limiters shape the timing of outgoing requests and never swallow
//! errors — a rate-limited failure is recorded and re-raised. They wrap
//! the whole closed operation set uniformly: every request variant passes
//! through the same interception point.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tower::{Layer, Service, ServiceExt};
use tracing::debug;

use crate::api::{SheetsRequest, SheetsResponse};
use crate::config::{AdaptiveConfig, TokenBucketConfig};
use crate::error::{Result, SheetsError};

/// Extra delays shorter than this decay to zero outright.
const DELAY_EPSILON: Duration = Duration::from_millis(1);

#[derive(Debug)]
struct AdaptiveState {
    success_rate: f64,
    current_delay: Duration,
    window: VecDeque<Instant>,
}

impl AdaptiveState {
    fn fresh() -> Self {
        Self {
            success_rate: 1.0,
            current_delay: Duration::ZERO,
            window: VecDeque::new(),
        }
    }
}

/// Point-in-time view of the adaptive limiter.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct AdaptiveStats {
    pub success_rate: f64,
    pub current_delay: Duration,
    pub window_len: usize,
}

/// Limiter that tracks a sliding window of recent request timestamps and
/// an adaptive per-call delay driven by observed rate-limit failures.
#[derive(Debug)]
pub struct AdaptiveRateLimiter {
    config: AdaptiveConfig,
    state: Mutex<AdaptiveState>,
}

impl AdaptiveRateLimiter {
    pub fn new(config: AdaptiveConfig) -> Self {
        Self {
            config,
            state: Mutex::new(AdaptiveState::fresh()),
        }
    }

    /// Blocks until the sliding window admits another request, then
    /// applies the current adaptive delay. The admitted timestamp is
    /// recorded before the delay so the window reflects admission order.
    pub async fn before_request(&self) {
        loop {
            let (admitted, wait) = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                while state
                    .window
                    .front()
                    .is_some_and(|t| now.duration_since(*t) >= self.config.window)
                {
                    state.window.pop_front();
                }
                if state.window.len() < self.config.max_requests {
                    state.window.push_back(now);
                    (true, state.current_delay)
                } else {
                    // Sleep until the oldest timestamp exits the window,
                    // plus the safety margin.
                    let wait = match state.window.front() {
                        Some(oldest) => (*oldest + self.config.window)
                            .saturating_duration_since(now)
                            + self.config.safety_margin,
                        None => self.config.safety_margin,
                    };
                    (false, wait)
                }
            };
            if admitted {
                if wait > Duration::ZERO {
                    debug!(delay_ms = wait.as_millis() as u64, "adaptive delay");
                    sleep(wait).await;
                }
                return;
            }
            debug!(wait_ms = wait.as_millis() as u64, "request window full");
            sleep(wait).await;
        }
    }

    /// Nudges the success-rate estimate up and decays the extra delay
    /// toward zero.
    pub async fn record_success(&self) {
        let mut state = self.state.lock().await;
        state.success_rate = (state.success_rate * 1.1).min(1.0);
        let decayed = state.current_delay.mul_f64(self.config.decay);
        state.current_delay = if decayed < DELAY_EPSILON {
            Duration::ZERO
        } else {
            decayed
        };
    }

    /// Halves the success-rate estimate and raises the extra delay,
    /// doubling from the configured floor up to the ceiling.
    pub async fn record_rate_limited(&self) {
        let mut state = self.state.lock().await;
        state.success_rate /= 2.0;
        let raised = (state.current_delay * 2).max(self.config.delay_floor);
        state.current_delay = raised.min(self.config.delay_ceiling);
        debug!(
            delay_ms = state.current_delay.as_millis() as u64,
            success_rate = state.success_rate,
            "rate limited, raising delay"
        );
    }

    pub async fn stats(&self) -> AdaptiveStats {
        let state = self.state.lock().await;
        AdaptiveStats {
            success_rate: state.success_rate,
            current_delay: state.current_delay,
            window_len: state.window.len(),
        }
    }

    pub async fn reset(&self) {
        *self.state.lock().await = AdaptiveState::fresh();
    }
}

/// Layer applying an [`AdaptiveRateLimiter`] to every operation.
pub struct AdaptiveLimitLayer {
    limiter: Arc<AdaptiveRateLimiter>,
}

impl AdaptiveLimitLayer {
    pub fn new(limiter: Arc<AdaptiveRateLimiter>) -> Self {
        Self { limiter }
    }
}

pub struct AdaptiveLimit<S> {
    inner: Arc<Mutex<S>>,
    limiter: Arc<AdaptiveRateLimiter>,
}

impl<S> Layer<S> for AdaptiveLimitLayer {
    type Service = AdaptiveLimit<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AdaptiveLimit {
            inner: Arc::new(Mutex::new(inner)),
            limiter: self.limiter.clone(),
        }
    }
}

impl<S> Service<SheetsRequest> for AdaptiveLimit<S>
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
        let limiter = self.limiter.clone();
        Box::pin(async move {
            limiter.before_request().await;
            let fut = {
                let mut guard = inner.lock().await;
                ServiceExt::ready(&mut *guard).await?.call(req)
            };
            match fut.await {
                Ok(resp) => {
                    limiter.record_success().await;
                    Ok(resp)
                }
                Err(err) => {
                    if err.is_rate_limit() {
                        limiter.record_rate_limited().await;
                    }
                    Err(err)
                }
            }
        })
    }
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Continuously refilling token bucket. `refill_rate` must be positive;
/// a request larger than the bucket capacity is clamped to it.
#[derive(Debug)]
pub struct TokenBucket {
    config: TokenBucketConfig,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(config: TokenBucketConfig) -> Self {
        Self {
            state: Mutex::new(BucketState {
                tokens: config.max_tokens,
                last_refill: Instant::now(),
            }),
            config,
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.config.refill_rate)
            .min(self.config.max_tokens);
        state.last_refill = now;
    }

    /// Blocks until `n` tokens are available, then consumes them. The
    /// loop exists purely to re-check availability after waiting; this
    /// limiter has no concept of remote failure.
    pub async fn acquire(&self, n: f64) {
        let n = n.min(self.config.max_tokens);
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                self.refill(&mut state);
                if state.tokens >= n {
                    state.tokens -= n;
                    return;
                }
                let deficit = n - state.tokens;
                Duration::from_secs_f64((deficit / self.config.refill_rate).clamp(0.001, 5.0))
            };
            debug!(wait_ms = wait.as_millis() as u64, "token bucket drained");
            sleep(wait).await;
        }
    }

    /// Current token count after applying the same refill computation an
    /// `acquire` would perform.
    pub async fn available_tokens(&self) -> f64 {
        let mut state = self.state.lock().await;
        self.refill(&mut state);
        state.tokens
    }

    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        state.tokens = self.config.max_tokens;
        state.last_refill = Instant::now();
    }
}

/// Layer charging a fixed token cost per operation.
pub struct TokenBucketLayer {
    bucket: Arc<TokenBucket>,
    cost: f64,
}

impl TokenBucketLayer {
    pub fn new(bucket: Arc<TokenBucket>) -> Self {
        Self { bucket, cost: 1.0 }
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }
}

pub struct TokenBucketLimit<S> {
    inner: Arc<Mutex<S>>,
    bucket: Arc<TokenBucket>,
    cost: f64,
}

impl<S> Layer<S> for TokenBucketLayer {
    type Service = TokenBucketLimit<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TokenBucketLimit {
            inner: Arc::new(Mutex::new(inner)),
            bucket: self.bucket.clone(),
            cost: self.cost,
        }
    }
}

impl<S> Service<SheetsRequest> for TokenBucketLimit<S>
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
        let bucket = self.bucket.clone();
        let cost = self.cost;
        Box::pin(async move {
            bucket.acquire(cost).await;
            let fut = {
                let mut guard = inner.lock().await;
                ServiceExt::ready(&mut *guard).await?.call(req)
            };
            fut.await
        })
    }
}

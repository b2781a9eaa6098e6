//! Client facade: composes the middleware stack and exposes the typed
//! operation set.
//!
//! Layers are applied bottom-up in a fixed order — retry closest to the
//! transport, then cache, then rate limiting, metrics outermost — so a
//! call may be recorded, throttled, served from cache, or retried, in
//! that nesting. Handles to the shared cache, limiter, and metrics state
//! stay available on the built client for manual control.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tower::util::BoxService;
use tower::{Layer, Service, ServiceExt};
use tracing::debug;

use crate::api::{
    AppendSummary, BatchUpdateSummary, CellGrid, ClearedRange, Method, SheetsRequest,
    SheetsResponse, SpreadsheetMetadata, UpdateSummary, ValueRange,
};
use crate::cache::{CacheLayer, ResponseCache};
use crate::config::{AdaptiveConfig, CacheConfig, RetryConfig, TokenBucketConfig};
use crate::error::{Result, SheetsError};
use crate::metrics::{MetricsLayer, MetricsRegistry};
use crate::rate_limit::{AdaptiveLimitLayer, AdaptiveRateLimiter, TokenBucket, TokenBucketLayer};
use crate::retry::RetryLayer;
use crate::transport::{BackendService, SheetsBackend};

/// The boxed service type the stack composes into.
pub type SheetsService = BoxService<SheetsRequest, SheetsResponse, SheetsError>;

/// A decorated spreadsheet client.
pub struct SheetsClient {
    service: Mutex<SheetsService>,
    cache: Option<Arc<ResponseCache>>,
    metrics: Option<Arc<MetricsRegistry>>,
    adaptive: Option<Arc<AdaptiveRateLimiter>>,
    token_bucket: Option<Arc<TokenBucket>>,
}

impl SheetsClient {
    /// Starts a builder over a backend. The retry engine is always
    /// present; every other layer is opt-in.
    pub fn builder<B: SheetsBackend + 'static>(backend: B) -> SheetsClientBuilder {
        SheetsClientBuilder::from_service(BoxService::new(BackendService::new(Arc::new(backend))))
    }

    async fn dispatch(&self, req: SheetsRequest) -> Result<SheetsResponse> {
        req.validate()?;
        let fut = {
            let mut svc = self.service.lock().await;
            ServiceExt::ready(&mut *svc).await?.call(req)
        };
        fut.await
    }

    pub async fn read(&self, spreadsheet_id: &str, range: &str) -> Result<ValueRange> {
        match self
            .dispatch(SheetsRequest::Read {
                spreadsheet_id: spreadsheet_id.to_string(),
                range: range.to_string(),
            })
            .await?
        {
            SheetsResponse::Values(values) => Ok(values),
            other => Err(unexpected(Method::Read, &other)),
        }
    }

    pub async fn write(
        &self,
        spreadsheet_id: &str,
        range: &str,
        values: CellGrid,
    ) -> Result<UpdateSummary> {
        match self
            .dispatch(SheetsRequest::Write {
                spreadsheet_id: spreadsheet_id.to_string(),
                range: range.to_string(),
                values,
            })
            .await?
        {
            SheetsResponse::Updated(summary) => Ok(summary),
            other => Err(unexpected(Method::Write, &other)),
        }
    }

    /// Appends rows after the table at `range`.
    ///
    /// Append is not idempotent: if a timed-out append actually landed,
    /// the retry engine's next try duplicates the rows. That risk is
    /// accepted rather than corrected here.
    pub async fn append(
        &self,
        spreadsheet_id: &str,
        range: &str,
        values: CellGrid,
    ) -> Result<AppendSummary> {
        match self
            .dispatch(SheetsRequest::Append {
                spreadsheet_id: spreadsheet_id.to_string(),
                range: range.to_string(),
                values,
            })
            .await?
        {
            SheetsResponse::Appended(summary) => Ok(summary),
            other => Err(unexpected(Method::Append, &other)),
        }
    }

    pub async fn clear(&self, spreadsheet_id: &str, range: &str) -> Result<ClearedRange> {
        match self
            .dispatch(SheetsRequest::Clear {
                spreadsheet_id: spreadsheet_id.to_string(),
                range: range.to_string(),
            })
            .await?
        {
            SheetsResponse::Cleared(cleared) => Ok(cleared),
            other => Err(unexpected(Method::Clear, &other)),
        }
    }

    pub async fn batch_read(
        &self,
        spreadsheet_id: &str,
        ranges: &[&str],
    ) -> Result<Vec<ValueRange>> {
        match self
            .dispatch(SheetsRequest::BatchRead {
                spreadsheet_id: spreadsheet_id.to_string(),
                ranges: ranges.iter().map(|r| r.to_string()).collect(),
            })
            .await?
        {
            SheetsResponse::BatchValues(values) => Ok(values),
            other => Err(unexpected(Method::BatchRead, &other)),
        }
    }

    pub async fn batch_write(
        &self,
        spreadsheet_id: &str,
        entries: Vec<ValueRange>,
    ) -> Result<BatchUpdateSummary> {
        match self
            .dispatch(SheetsRequest::BatchWrite {
                spreadsheet_id: spreadsheet_id.to_string(),
                entries,
            })
            .await?
        {
            SheetsResponse::BatchUpdated(summary) => Ok(summary),
            other => Err(unexpected(Method::BatchWrite, &other)),
        }
    }

    pub async fn batch_clear(
        &self,
        spreadsheet_id: &str,
        ranges: &[&str],
    ) -> Result<Vec<ClearedRange>> {
        match self
            .dispatch(SheetsRequest::BatchClear {
                spreadsheet_id: spreadsheet_id.to_string(),
                ranges: ranges.iter().map(|r| r.to_string()).collect(),
            })
            .await?
        {
            SheetsResponse::BatchCleared(cleared) => Ok(cleared),
            other => Err(unexpected(Method::BatchClear, &other)),
        }
    }

    pub async fn get_metadata(&self, spreadsheet_id: &str) -> Result<SpreadsheetMetadata> {
        match self
            .dispatch(SheetsRequest::GetMetadata {
                spreadsheet_id: spreadsheet_id.to_string(),
            })
            .await?
        {
            SheetsResponse::Metadata(metadata) => Ok(metadata),
            other => Err(unexpected(Method::GetMetadata, &other)),
        }
    }

    /// Manual cache control, when the cache layer is configured.
    pub fn cache(&self) -> Option<&Arc<ResponseCache>> {
        self.cache.as_ref()
    }

    /// Metrics registry, when the metrics layer is configured.
    pub fn metrics(&self) -> Option<&Arc<MetricsRegistry>> {
        self.metrics.as_ref()
    }

    pub fn adaptive_limiter(&self) -> Option<&Arc<AdaptiveRateLimiter>> {
        self.adaptive.as_ref()
    }

    pub fn token_bucket(&self) -> Option<&Arc<TokenBucket>> {
        self.token_bucket.as_ref()
    }
}

fn unexpected(method: Method, got: &SheetsResponse) -> SheetsError {
    SheetsError::UnexpectedResponse {
        method,
        got: got.kind(),
    }
}

/// Builder for [`SheetsClient`].
pub struct SheetsClientBuilder {
    service: SheetsService,
    retry: RetryConfig,
    cache: Option<CacheConfig>,
    adaptive: Option<AdaptiveConfig>,
    token_bucket: Option<TokenBucketConfig>,
    token_cost: f64,
    metrics: bool,
    metrics_backoff: Option<Duration>,
}

impl SheetsClientBuilder {
    /// Builds over an arbitrary innermost service. Lets tests wire in
    /// scripted fakes; most callers go through [`SheetsClient::builder`].
    pub fn from_service(service: SheetsService) -> Self {
        Self {
            service,
            retry: RetryConfig::default(),
            cache: None,
            adaptive: None,
            token_bucket: None,
            token_cost: 1.0,
            metrics: false,
            metrics_backoff: None,
        }
    }

    pub fn retry(mut self, config: RetryConfig) -> Self {
        self.retry = config;
        self
    }

    pub fn with_cache(mut self, config: CacheConfig) -> Self {
        self.cache = Some(config);
        self
    }

    pub fn with_adaptive_limiter(mut self, config: AdaptiveConfig) -> Self {
        self.adaptive = Some(config);
        self
    }

    pub fn with_token_bucket(mut self, config: TokenBucketConfig) -> Self {
        self.token_bucket = Some(config);
        self
    }

    /// Tokens charged per operation by the token bucket layer.
    pub fn token_cost(mut self, cost: f64) -> Self {
        self.token_cost = cost;
        self
    }

    pub fn with_metrics(mut self) -> Self {
        self.metrics = true;
        self
    }

    /// Overrides the metrics layer's linear backoff base.
    pub fn metrics_backoff(mut self, backoff: Duration) -> Self {
        self.metrics_backoff = Some(backoff);
        self
    }

    pub fn build(self) -> SheetsClient {
        let mut service: SheetsService =
            BoxService::new(RetryLayer::new(self.retry).layer(self.service));

        let cache = self.cache.map(|config| Arc::new(ResponseCache::new(config)));
        if let Some(cache) = &cache {
            service = BoxService::new(CacheLayer::new(cache.clone()).layer(service));
        }

        let adaptive = self
            .adaptive
            .map(|config| Arc::new(AdaptiveRateLimiter::new(config)));
        if let Some(limiter) = &adaptive {
            service = BoxService::new(AdaptiveLimitLayer::new(limiter.clone()).layer(service));
        }

        let token_bucket = self
            .token_bucket
            .map(|config| Arc::new(TokenBucket::new(config)));
        if let Some(bucket) = &token_bucket {
            service = BoxService::new(
                TokenBucketLayer::new(bucket.clone())
                    .with_cost(self.token_cost)
                    .layer(service),
            );
        }

        let metrics = self.metrics.then(|| Arc::new(MetricsRegistry::new()));
        if let Some(registry) = &metrics {
            let mut layer = MetricsLayer::new(registry.clone());
            if let Some(backoff) = self.metrics_backoff {
                layer = layer.with_backoff(backoff);
            }
            service = BoxService::new(layer.layer(service));
        }

        debug!(
            cache = cache.is_some(),
            adaptive = adaptive.is_some(),
            token_bucket = token_bucket.is_some(),
            metrics = metrics.is_some(),
            "client stack built"
        );

        SheetsClient {
            service: Mutex::new(service),
            cache,
            metrics,
            adaptive,
            token_bucket,
        }
    }
}

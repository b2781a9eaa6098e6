//! # tower-sheets
//!
//! Composable Tower middleware for resilient spreadsheet API clients.
//! The crate decorates a transport — anything implementing
//! [`SheetsBackend`] — with stackable layers for the concerns a remote
//! tabular-data service forces on its callers:
//!
//! - **Retry**: bounded exponential backoff with jitter, driven by error
//!   classification ([`retry`], [`error`])
//! - **Cache**: bounded TTL response cache with pattern invalidation
//!   ([`cache`])
//! - **Rate limiting**: an adaptive sliding-window limiter and a token
//!   bucket ([`rate_limit`])
//! - **Metrics**: latency, outcome, and throughput aggregation
//!   ([`metrics`])
//!
//! Each layer implements the same closed operation interface and can be
//! composed freely; [`SheetsClient::builder`] wires them in a fixed
//! order with metrics outermost and retry innermost.
//!
//! ## Example
//!
//! ```rust,no_run
//! use tower_sheets::{CacheConfig, InMemorySheets, RetryConfig, SheetsClient};
//!
//! # async fn example() -> tower_sheets::Result<()> {
//! let backend = InMemorySheets::new().with_spreadsheet("sheet-1", "Budget");
//! let client = SheetsClient::builder(backend)
//!     .retry(RetryConfig::default())
//!     .with_cache(CacheConfig::default())
//!     .with_metrics()
//!     .build();
//!
//! let values = client.read("sheet-1", "Sheet1!A1:B2").await?;
//! println!("{:?}", values.values);
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod metrics;
pub mod rate_limit;
pub mod retry;
pub mod transport;

pub use api::{
    AppendSummary, BatchUpdateSummary, CellGrid, ClearedRange, Method, SheetProperties,
    SheetsRequest, SheetsResponse, SpreadsheetMetadata, UpdateSummary, ValueRange,
};
pub use cache::{cache_key, CacheLayer, ResponseCache};
pub use client::{SheetsClient, SheetsClientBuilder, SheetsService};
pub use config::{AdaptiveConfig, CacheConfig, RetryConfig, TokenBucketConfig};
pub use error::{
    ClassifiedError, ConnectionKind, ErrorCategory, ErrorCode, ErrorResponse, Result, SheetsError,
    TransportError, TransportResult,
};
pub use metrics::{MetricsLayer, MetricsRegistry, MetricsSnapshot, MetricsSummary};
pub use rate_limit::{
    AdaptiveLimitLayer, AdaptiveRateLimiter, AdaptiveStats, TokenBucket, TokenBucketLayer,
};
pub use retry::{with_retry, RetryLayer, RetryPolicy};
pub use transport::{BackendService, InMemorySheets, SheetsBackend};

// Re-export the Tower traits callers need to compose layers by hand.
pub use tower::{Layer, Service, ServiceExt};

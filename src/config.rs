//! Configuration for the client layers.
//!
//! All configuration is accepted at construction time and read-only
//! thereafter; nothing re-validates or hot-reloads these values.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry engine configuration.
///
/// `max_attempts` counts total tries including the first; attempt indices
/// are zero-based when computing backoff.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total number of tries, including the first.
    pub max_attempts: usize,

    /// Delay before the second try; doubles on each subsequent failure.
    pub initial_delay: Duration,

    /// Ceiling for the exponential component of the delay.
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(10),
        }
    }
}

/// Response cache configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Default time-to-live for entries; overridable per `set`.
    pub ttl: Duration,

    /// Capacity bound. At capacity the oldest-inserted entry is evicted.
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            max_entries: 100,
        }
    }
}

/// Adaptive rate limiter configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AdaptiveConfig {
    /// Duration of the sliding request window.
    pub window: Duration,

    /// Soft cap on requests admitted inside one window.
    pub max_requests: usize,

    /// Slack added when waiting for the oldest timestamp to exit the
    /// window.
    pub safety_margin: Duration,

    /// Extra delay applied after the first rate-limit failure.
    pub delay_floor: Duration,

    /// Ceiling for the adaptive extra delay.
    pub delay_ceiling: Duration,

    /// Multiplier applied to the extra delay after each success.
    pub decay: f64,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            max_requests: 60,
            safety_margin: Duration::from_millis(100),
            delay_floor: Duration::from_millis(500),
            delay_ceiling: Duration::from_secs(30),
            decay: 0.9,
        }
    }
}

/// Token bucket configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TokenBucketConfig {
    /// Bucket capacity; available tokens never exceed this.
    pub max_tokens: f64,

    /// Tokens restored per second of elapsed time.
    pub refill_rate: f64,
}

impl Default for TokenBucketConfig {
    fn default() -> Self {
        Self {
            max_tokens: 100.0,
            refill_rate: 10.0,
        }
    }
}

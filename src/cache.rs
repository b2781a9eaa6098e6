//! TTL response cache and the read-through / invalidation layer.
//!
//! The store is bounded: at capacity the oldest-inserted entry is evicted,
//! regardless of how recently it was read. That can evict a hot key; the
//! simplicity is the point, and accepted. Expiry is lazy — a stale entry
//! is dropped by the `get` that finds it, there is no background sweep.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tower::{Layer, Service, ServiceExt};
use tracing::debug;

use crate::api::{SheetsRequest, SheetsResponse, ValueRange};
use crate::config::CacheConfig;
use crate::error::{Result, SheetsError};

/// Cache key for a single range: `spreadsheetId:range`.
pub fn cache_key(spreadsheet_id: &str, range: &str) -> String {
    format!("{spreadsheet_id}:{range}")
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: ValueRange,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    /// Keys in insertion order; the front is the eviction candidate.
    order: VecDeque<String>,
}

impl CacheInner {
    fn remove(&mut self, key: &str) -> bool {
        if self.entries.remove(key).is_some() {
            self.order.retain(|k| k != key);
            true
        } else {
            false
        }
    }
}

/// Bounded key-value store with per-entry TTL.
#[derive(Debug)]
pub struct ResponseCache {
    config: CacheConfig,
    inner: StdMutex<CacheInner>,
}

impl ResponseCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            inner: StdMutex::new(CacheInner::default()),
        }
    }

    /// Returns the cached value if present and unexpired. Finding an
    /// expired entry evicts it as a side effect.
    pub fn get(&self, key: &str) -> Option<ValueRange> {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        let expired = match inner.entries.get(key) {
            Some(entry) if Instant::now() < entry.expires_at => {
                return Some(entry.value.clone());
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            inner.remove(key);
            debug!(key = %key, "expired entry dropped");
        }
        None
    }

    /// Inserts with the default TTL.
    pub fn set(&self, key: impl Into<String>, value: ValueRange) {
        self.set_with_ttl(key, value, self.config.ttl);
    }

    /// Inserts with an explicit TTL. At capacity the oldest-inserted
    /// entry is evicted first.
    pub fn set_with_ttl(&self, key: impl Into<String>, value: ValueRange, ttl: Duration) {
        let key = key.into();
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        if !inner.entries.contains_key(&key) {
            if inner.entries.len() >= self.config.max_entries {
                if let Some(oldest) = inner.order.pop_front() {
                    inner.entries.remove(&oldest);
                    debug!(evicted = %oldest, "capacity eviction");
                }
            }
            inner.order.push_back(key.clone());
        }
        inner.entries.insert(
            key,
            CacheEntry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Removes entries matching `pattern` and returns how many were
    /// dropped. `None` clears everything. A pattern with a `*` is a
    /// prefix match (`id:*`) or, with a leading `*`, a substring match
    /// (`*range`) — deliberately not a glob engine. A bare pattern
    /// removes the exact key.
    pub fn invalidate(&self, pattern: Option<&str>) -> usize {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        let matching: Vec<String> = match pattern {
            None => inner.entries.keys().cloned().collect(),
            Some(p) => match p.split_once('*') {
                Some((prefix, _)) if !prefix.is_empty() => inner
                    .entries
                    .keys()
                    .filter(|k| k.starts_with(prefix))
                    .cloned()
                    .collect(),
                Some((_, needle)) => inner
                    .entries
                    .keys()
                    .filter(|k| k.contains(needle))
                    .cloned()
                    .collect(),
                None => inner.entries.keys().filter(|k| *k == p).cloned().collect(),
            },
        };
        for key in &matching {
            inner.remove(key);
        }
        if !matching.is_empty() {
            debug!(pattern = ?pattern, removed = matching.len(), "invalidated");
        }
        matching.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("cache lock poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        inner.entries.clear();
        inner.order.clear();
    }
}

/// Layer decorating reads with the cache and writes with invalidation.
pub struct CacheLayer {
    cache: Arc<ResponseCache>,
}

impl CacheLayer {
    pub fn new(cache: Arc<ResponseCache>) -> Self {
        Self { cache }
    }
}

pub struct Cached<S> {
    inner: Arc<Mutex<S>>,
    cache: Arc<ResponseCache>,
}

impl<S> Layer<S> for CacheLayer {
    type Service = Cached<S>;

    fn layer(&self, inner: S) -> Self::Service {
        Cached {
            inner: Arc::new(Mutex::new(inner)),
            cache: self.cache.clone(),
        }
    }
}

impl<S> Cached<S>
where
    S: Service<SheetsRequest, Response = SheetsResponse, Error = SheetsError> + Send + 'static,
    S::Future: Send + 'static,
{
    async fn call_inner(
        inner: &Arc<Mutex<S>>,
        req: SheetsRequest,
    ) -> Result<SheetsResponse> {
        let fut = {
            let mut guard = inner.lock().await;
            ServiceExt::ready(&mut *guard).await?.call(req)
        };
        fut.await
    }
}

impl<S> Service<SheetsRequest> for Cached<S>
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
        let cache = self.cache.clone();
        Box::pin(async move {
            match req {
                SheetsRequest::Read {
                    spreadsheet_id,
                    range,
                } => {
                    let key = cache_key(&spreadsheet_id, &range);
                    if let Some(hit) = cache.get(&key) {
                        debug!(key = %key, "cache hit");
                        return Ok(SheetsResponse::Values(hit));
                    }
                    let resp = Self::call_inner(
                        &inner,
                        SheetsRequest::Read {
                            spreadsheet_id,
                            range,
                        },
                    )
                    .await?;
                    if let SheetsResponse::Values(values) = &resp {
                        cache.set(key, values.clone());
                    }
                    Ok(resp)
                }
                SheetsRequest::BatchRead {
                    spreadsheet_id,
                    ranges,
                } => {
                    let mut hits: HashMap<String, ValueRange> = HashMap::new();
                    let mut missing: Vec<String> = Vec::new();
                    for range in &ranges {
                        match cache.get(&cache_key(&spreadsheet_id, range)) {
                            Some(v) => {
                                hits.insert(range.clone(), v);
                            }
                            None => missing.push(range.clone()),
                        }
                    }
                    let mut fetched: HashMap<String, ValueRange> = HashMap::new();
                    if !missing.is_empty() {
                        let resp = Self::call_inner(
                            &inner,
                            SheetsRequest::BatchRead {
                                spreadsheet_id: spreadsheet_id.clone(),
                                ranges: missing.clone(),
                            },
                        )
                        .await?;
                        let values = match resp {
                            SheetsResponse::BatchValues(values) => values,
                            other => {
                                return Err(SheetsError::UnexpectedResponse {
                                    method: crate::api::Method::BatchRead,
                                    got: other.kind(),
                                })
                            }
                        };
                        if values.len() != missing.len() {
                            return Err(SheetsError::UnexpectedResponse {
                                method: crate::api::Method::BatchRead,
                                got: "incomplete batch",
                            });
                        }
                        // Each fresh range is cached individually so later
                        // single-range reads hit too.
                        for (range, value) in missing.iter().zip(values) {
                            cache.set(cache_key(&spreadsheet_id, range), value.clone());
                            fetched.insert(range.clone(), value);
                        }
                    } else {
                        debug!(ranges = ranges.len(), "batch served entirely from cache");
                    }
                    // Merge in the caller's original range order.
                    let merged = ranges
                        .iter()
                        .map(|r| {
                            hits.get(r)
                                .or_else(|| fetched.get(r))
                                .cloned()
                                .ok_or(SheetsError::UnexpectedResponse {
                                    method: crate::api::Method::BatchRead,
                                    got: "missing batch entry",
                                })
                        })
                        .collect::<Result<Vec<_>>>()?;
                    Ok(SheetsResponse::BatchValues(merged))
                }
                other => {
                    // Write-shaped operations invalidate after the inward
                    // call succeeds. Append cannot know where its rows
                    // landed, so the whole spreadsheet namespace goes.
                    let patterns: Vec<String> = match &other {
                        SheetsRequest::Write {
                            spreadsheet_id,
                            range,
                            ..
                        }
                        | SheetsRequest::Clear {
                            spreadsheet_id,
                            range,
                        } => vec![format!("{}*", cache_key(spreadsheet_id, range))],
                        SheetsRequest::Append { spreadsheet_id, .. } => {
                            vec![format!("{spreadsheet_id}:*")]
                        }
                        SheetsRequest::BatchWrite {
                            spreadsheet_id,
                            entries,
                        } => entries
                            .iter()
                            .map(|e| format!("{}*", cache_key(spreadsheet_id, &e.range)))
                            .collect(),
                        SheetsRequest::BatchClear {
                            spreadsheet_id,
                            ranges,
                        } => ranges
                            .iter()
                            .map(|r| format!("{}*", cache_key(spreadsheet_id, r)))
                            .collect(),
                        SheetsRequest::Read { .. }
                        | SheetsRequest::BatchRead { .. }
                        | SheetsRequest::GetMetadata { .. } => Vec::new(),
                    };
                    let resp = Self::call_inner(&inner, other).await?;
                    for pattern in patterns {
                        cache.invalidate(Some(&pattern));
                    }
                    Ok(resp)
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tower::service_fn;

    fn cfg(max_entries: usize, ttl: Duration) -> CacheConfig {
        CacheConfig { ttl, max_entries }
    }

    fn vr(range: &str, cell: &str) -> ValueRange {
        ValueRange::new(range, vec![vec![json!(cell)]])
    }

    #[test]
    fn set_then_get_round_trips() {
        let cache = ResponseCache::new(cfg(10, Duration::from_secs(60)));
        cache.set("s1:A1", vr("A1", "x"));
        assert_eq!(cache.get("s1:A1").unwrap().values[0][0], json!("x"));
        assert!(cache.get("s1:B1").is_none());
    }

    #[test]
    fn expired_entries_are_dropped_lazily() {
        let cache = ResponseCache::new(cfg(10, Duration::from_secs(60)));
        cache.set_with_ttl("s1:A1", vr("A1", "x"), Duration::from_millis(0));
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get("s1:A1").is_none());
        // The failed lookup evicted the stale entry.
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn capacity_evicts_exactly_the_oldest_inserted() {
        let cache = ResponseCache::new(cfg(2, Duration::from_secs(60)));
        cache.set("s1:A1", vr("A1", "a"));
        cache.set("s1:B1", vr("B1", "b"));
        // Reading the oldest does not protect it: eviction is by
        // insertion order, not recency.
        cache.get("s1:A1");
        cache.set("s1:C1", vr("C1", "c"));
        assert!(cache.get("s1:A1").is_none());
        assert!(cache.get("s1:B1").is_some());
        assert!(cache.get("s1:C1").is_some());
    }

    #[test]
    fn overwriting_a_key_keeps_its_insertion_slot() {
        let cache = ResponseCache::new(cfg(2, Duration::from_secs(60)));
        cache.set("s1:A1", vr("A1", "a"));
        cache.set("s1:B1", vr("B1", "b"));
        cache.set("s1:A1", vr("A1", "a2"));
        cache.set("s1:C1", vr("C1", "c"));
        // A1 was still the oldest insertion, so it went first.
        assert!(cache.get("s1:A1").is_none());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn invalidate_none_clears_everything() {
        let cache = ResponseCache::new(cfg(10, Duration::from_secs(60)));
        cache.set("s1:A1", vr("A1", "a"));
        cache.set("s2:A1", vr("A1", "b"));
        assert_eq!(cache.invalidate(None), 2);
        assert!(cache.is_empty());
    }

    #[test]
    fn invalidate_prefix_pattern() {
        let cache = ResponseCache::new(cfg(10, Duration::from_secs(60)));
        cache.set("s1:A1", vr("A1", "a"));
        cache.set("s1:B1", vr("B1", "b"));
        cache.set("s2:A1", vr("A1", "c"));
        assert_eq!(cache.invalidate(Some("s1:*")), 2);
        assert!(cache.get("s1:A1").is_none());
        assert!(cache.get("s2:A1").is_some());
    }

    #[test]
    fn invalidate_substring_and_exact_patterns() {
        let cache = ResponseCache::new(cfg(10, Duration::from_secs(60)));
        cache.set("s1:Sheet1!A1", vr("Sheet1!A1", "a"));
        cache.set("s2:Sheet1!A1", vr("Sheet1!A1", "b"));
        cache.set("s2:Sheet2!A1", vr("Sheet2!A1", "c"));
        assert_eq!(cache.invalidate(Some("*Sheet1")), 2);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.invalidate(Some("s2:Sheet2!A1")), 1);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn read_through_populates_and_short_circuits() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        let svc = service_fn(|req: SheetsRequest| async move {
            CALLS.fetch_add(1, Ordering::SeqCst);
            match req {
                SheetsRequest::Read { range, .. } => {
                    Ok(SheetsResponse::Values(vr(&range, "fresh")))
                }
                _ => unreachable!("only reads expected"),
            }
        });
        let cache = Arc::new(ResponseCache::new(cfg(10, Duration::from_secs(60))));
        let mut svc = CacheLayer::new(cache.clone()).layer(svc);

        let req = SheetsRequest::Read {
            spreadsheet_id: "s1".to_string(),
            range: "A1:B2".to_string(),
        };
        for _ in 0..3 {
            let resp = ServiceExt::ready(&mut svc)
                .await
                .unwrap()
                .call(req.clone())
                .await
                .unwrap();
            assert!(matches!(resp, SheetsResponse::Values(_)));
        }
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn batch_read_fetches_only_missing_and_preserves_order() {
        let seen: Arc<StdMutex<Vec<Vec<String>>>> = Arc::new(StdMutex::new(Vec::new()));
        let seen_inner = seen.clone();
        let svc = service_fn(move |req: SheetsRequest| {
            let seen = seen_inner.clone();
            async move {
                match req {
                    SheetsRequest::BatchRead { ranges, .. } => {
                        seen.lock().unwrap().push(ranges.clone());
                        Ok(SheetsResponse::BatchValues(
                            ranges.iter().map(|r| vr(r, "fetched")).collect(),
                        ))
                    }
                    _ => unreachable!("only batch reads expected"),
                }
            }
        });
        let cache = Arc::new(ResponseCache::new(cfg(10, Duration::from_secs(60))));
        cache.set(cache_key("s1", "B1"), vr("B1", "cached"));
        let mut svc = CacheLayer::new(cache.clone()).layer(svc);

        let resp = ServiceExt::ready(&mut svc)
            .await
            .unwrap()
            .call(SheetsRequest::BatchRead {
                spreadsheet_id: "s1".to_string(),
                ranges: vec!["A1".to_string(), "B1".to_string(), "C1".to_string()],
            })
            .await
            .unwrap();

        // Only the two uncached ranges went inward, in one call.
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], vec!["A1".to_string(), "C1".to_string()]);

        // Caller order preserved; cached entry served from cache.
        match resp {
            SheetsResponse::BatchValues(values) => {
                assert_eq!(values.len(), 3);
                assert_eq!(values[0].values[0][0], json!("fetched"));
                assert_eq!(values[1].values[0][0], json!("cached"));
                assert_eq!(values[2].values[0][0], json!("fetched"));
            }
            other => panic!("unexpected response {other:?}"),
        }

        // Fresh ranges were cached individually.
        assert!(cache.get(&cache_key("s1", "A1")).is_some());
        assert!(cache.get(&cache_key("s1", "C1")).is_some());
    }

    #[tokio::test]
    async fn write_invalidates_the_written_range() {
        let svc = service_fn(|req: SheetsRequest| async move {
            match req {
                SheetsRequest::Write {
                    spreadsheet_id,
                    range,
                    values,
                } => Ok(SheetsResponse::Updated(
                    crate::api::UpdateSummary::for_values(&spreadsheet_id, &range, &values),
                )),
                _ => unreachable!("only writes expected"),
            }
        });
        let cache = Arc::new(ResponseCache::new(cfg(10, Duration::from_secs(60))));
        cache.set(cache_key("s1", "A1:B2"), vr("A1:B2", "stale"));
        cache.set(cache_key("s1", "A1:B2|sub"), vr("A1:B2", "stale-sub"));
        cache.set(cache_key("s1", "Z9"), vr("Z9", "untouched"));
        let mut svc = CacheLayer::new(cache.clone()).layer(svc);

        ServiceExt::ready(&mut svc)
            .await
            .unwrap()
            .call(SheetsRequest::Write {
                spreadsheet_id: "s1".to_string(),
                range: "A1:B2".to_string(),
                values: vec![vec![json!("new")]],
            })
            .await
            .unwrap();

        assert!(cache.get(&cache_key("s1", "A1:B2")).is_none());
        assert!(cache.get(&cache_key("s1", "A1:B2|sub")).is_none());
        assert!(cache.get(&cache_key("s1", "Z9")).is_some());
    }

    #[tokio::test]
    async fn append_invalidates_the_whole_spreadsheet_namespace() {
        let svc = service_fn(|req: SheetsRequest| async move {
            match req {
                SheetsRequest::Append {
                    spreadsheet_id,
                    range,
                    values,
                } => Ok(SheetsResponse::Appended(crate::api::AppendSummary {
                    spreadsheet_id: spreadsheet_id.clone(),
                    table_range: range.clone(),
                    updates: crate::api::UpdateSummary::for_values(
                        &spreadsheet_id,
                        &range,
                        &values,
                    ),
                })),
                _ => unreachable!("only appends expected"),
            }
        });
        let cache = Arc::new(ResponseCache::new(cfg(10, Duration::from_secs(60))));
        cache.set(cache_key("s1", "A1"), vr("A1", "a"));
        cache.set(cache_key("s1", "B1"), vr("B1", "b"));
        cache.set(cache_key("s2", "A1"), vr("A1", "other sheet"));
        let mut svc = CacheLayer::new(cache.clone()).layer(svc);

        ServiceExt::ready(&mut svc)
            .await
            .unwrap()
            .call(SheetsRequest::Append {
                spreadsheet_id: "s1".to_string(),
                range: "A1".to_string(),
                values: vec![vec![json!("row")]],
            })
            .await
            .unwrap();

        assert!(cache.get(&cache_key("s1", "A1")).is_none());
        assert!(cache.get(&cache_key("s1", "B1")).is_none());
        assert!(cache.get(&cache_key("s2", "A1")).is_some());
    }

    proptest! {
        #[test]
        fn size_never_exceeds_capacity(keys in proptest::collection::vec("[a-d]:[A-D][1-4]", 1..64)) {
            let cache = ResponseCache::new(cfg(8, Duration::from_secs(60)));
            for key in keys {
                cache.set(key.clone(), vr("A1", "v"));
                prop_assert!(cache.len() <= 8);
            }
        }
    }
}

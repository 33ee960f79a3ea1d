//! Response cache.
//!
//! Backed by a bounded LRU store with TTL expiry. Keys are
//! `(method, canonical(payload))`; a hit short-circuits the chain and
//! replays the recorded items under the new call id.

use super::{from_fn, Middleware};
use crate::message::ResponseItem;
use crate::streaming;
use lru::LruCache;
use serde_json::Value;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

type ShouldCache = Arc<dyn Fn(&[ResponseItem]) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct CacheConfig {
    pub capacity: NonZeroUsize,
    pub ttl: Duration,
    /// Decides whether a collected response is stored. Default: every item
    /// succeeded.
    pub should_cache: Option<ShouldCache>,
    /// Emit hit/miss stats every this many lookups.
    pub stats_interval: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: NonZeroUsize::new(256).expect("nonzero"),
            ttl: Duration::from_secs(60),
            should_cache: None,
            stats_interval: 1000,
        }
    }
}

impl CacheConfig {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity: NonZeroUsize::new(capacity.max(1)).expect("nonzero"),
            ttl,
            ..Self::default()
        }
    }

    pub fn with_should_cache<F>(mut self, f: F) -> Self
    where
        F: Fn(&[ResponseItem]) -> bool + Send + Sync + 'static,
    {
        self.should_cache = Some(Arc::new(f));
        self
    }
}

struct CacheEntry {
    items: Vec<ResponseItem>,
    stored_at: Instant,
}

/// Canonical JSON rendering: object keys sorted recursively, so equal
/// payloads hash to equal cache keys regardless of construction order.
pub fn canonical_json(value: &Value) -> String {
    fn canonicalize(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut keys: Vec<_> = map.keys().collect();
                keys.sort();
                let mut out = serde_json::Map::new();
                for key in keys {
                    out.insert(key.clone(), canonicalize(&map[key]));
                }
                Value::Object(out)
            }
            Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
            other => other.clone(),
        }
    }
    canonicalize(value).to_string()
}

/// Short-circuit repeated calls with recorded responses.
pub fn cache_middleware(config: CacheConfig) -> Middleware {
    let store: Arc<Mutex<LruCache<String, CacheEntry>>> =
        Arc::new(Mutex::new(LruCache::new(config.capacity)));
    let hits = Arc::new(AtomicU64::new(0));
    let misses = Arc::new(AtomicU64::new(0));

    from_fn(move |ctx, next| {
        let config = config.clone();
        let store = store.clone();
        let hits = hits.clone();
        let misses = misses.clone();
        async move {
            let key = format!(
                "{}:{}",
                ctx.envelope.method.key(),
                canonical_json(&ctx.envelope.payload)
            );
            let call_id = ctx.envelope.id.clone();

            let cached = {
                let mut store = store.lock().unwrap_or_else(PoisonError::into_inner);
                match store.get(&key) {
                    Some(entry) if entry.stored_at.elapsed() <= config.ttl => {
                        Some(entry.items.clone())
                    }
                    Some(_) => {
                        store.pop(&key);
                        None
                    }
                    None => None,
                }
            };

            let lookups = hits.load(Ordering::Relaxed) + misses.load(Ordering::Relaxed) + 1;
            if config.stats_interval > 0 && lookups % config.stats_interval == 0 {
                tracing::debug!(
                    hits = hits.load(Ordering::Relaxed),
                    misses = misses.load(Ordering::Relaxed),
                    "response cache stats"
                );
            }

            if let Some(items) = cached {
                hits.fetch_add(1, Ordering::Relaxed);
                // Replayed items must echo the current call's id.
                let items = items
                    .into_iter()
                    .map(|mut item| {
                        item.id = call_id.clone();
                        item
                    })
                    .collect();
                return streaming::from_items(items);
            }

            misses.fetch_add(1, Ordering::Relaxed);
            let items = streaming::collect(next(ctx).await).await;

            let storable = match &config.should_cache {
                Some(predicate) => predicate(&items),
                None => !items.is_empty() && items.iter().all(ResponseItem::is_success),
            };
            if storable {
                let mut store = store.lock().unwrap_or_else(PoisonError::into_inner);
                store.put(
                    key,
                    CacheEntry {
                        items: items.clone(),
                        stored_at: Instant::now(),
                    },
                );
            }

            streaming::from_items(items)
        }
    })
}

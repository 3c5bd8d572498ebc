//! Process-local TTL cache for upstream lookups.
//!
//! Entries remember when they were fetched; a lookup only counts as a hit while
//! `now - fetched_at < ttl`, measured against an injected [`Clock`]. Expired
//! entries are evicted on access rather than by a background sweep. The cache is
//! best-effort: it may be empty after a restart and nothing depends on it.

use moka::future::Cache;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Source of "now" in epoch milliseconds.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Clock that only moves when told to. Used by tests to exercise TTLs and
/// delivery-token expiry without sleeping.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicI64,
}

impl ManualClock {
    pub fn new(now_ms: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(now_ms),
        }
    }

    pub fn set(&self, now_ms: i64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.now_ms
            .fetch_add(by.as_millis() as i64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
struct CachedValue<V> {
    fetched_at_ms: i64,
    value: V,
}

/// String-keyed cache with a fixed TTL and lazy eviction.
#[derive(Clone)]
pub struct TtlCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    inner: Cache<String, CachedValue<V>>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl<V> TtlCache<V>
where
    V: Clone + Send + Sync + 'static,
{
    /// Creates a cache holding at most `max_capacity` entries.
    pub fn new(ttl: Duration, max_capacity: u64, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Cache::builder().max_capacity(max_capacity).build(),
            ttl,
            clock,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Returns the cached value if it is still fresh. A stale entry is evicted.
    pub async fn get(&self, key: &str) -> Option<V> {
        let entry = self.inner.get(key).await?;
        let age_ms = self.clock.now_ms() - entry.fetched_at_ms;

        if age_ms < self.ttl.as_millis() as i64 {
            Some(entry.value)
        } else {
            tracing::debug!("Cache entry expired for key={} (age {}ms)", key, age_ms);
            self.evict(key).await;
            None
        }
    }

    /// Stores `value`, stamped with the current clock reading.
    pub async fn set(&self, key: impl Into<String>, value: V) {
        let entry = CachedValue {
            fetched_at_ms: self.clock.now_ms(),
            value,
        };
        self.inner.insert(key.into(), entry).await;
    }

    pub async fn evict(&self, key: &str) {
        self.inner.invalidate(key).await;
    }
}

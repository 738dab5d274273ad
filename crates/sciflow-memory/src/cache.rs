//! Plan cache using moka
//!
//! Memoizes generated plan text by [`PlanKey`]. Entries never expire; the
//! least recently used entry is evicted once capacity is exceeded.

use crate::key::PlanKey;
use moka::future::Cache;
use moka::policy::EvictionPolicy;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Default number of cached plans
pub const DEFAULT_CAPACITY: u64 = 100;

/// Cache statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Approximate number of entries
    pub entry_count: u64,
    /// Lookups served from the cache
    pub hits: u64,
    /// Lookups that missed
    pub misses: u64,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
}

/// Shared, concurrent plan cache
#[derive(Debug, Clone)]
pub struct PlanCache {
    inner: Cache<PlanKey, Arc<str>>,
    counters: Arc<Counters>,
}

impl PlanCache {
    /// Create cache holding at most `capacity` plans
    #[must_use]
    pub fn new(capacity: u64) -> Self {
        Self {
            inner: Cache::builder()
                .max_capacity(capacity)
                .eviction_policy(EvictionPolicy::lru())
                .build(),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Cached plan for `key`
    pub async fn get(&self, key: &PlanKey) -> Option<String> {
        let found = self.inner.get(key).await;
        let counter = if found.is_some() {
            &self.counters.hits
        } else {
            &self.counters.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        found.map(|plan| plan.to_string())
    }

    /// Store a plan
    pub async fn insert(&self, key: PlanKey, plan: impl Into<String>) {
        let plan: String = plan.into();
        self.inner.insert(key, Arc::from(plan)).await;
    }

    /// Cached plan, or compute and cache one
    ///
    /// Concurrent callers for the same key share a single computation; the
    /// ones that waited count as hits. Nothing is cached when `f` fails.
    ///
    /// # Errors
    /// Returns the error produced by `f`, shared with every caller that
    /// waited on the same computation.
    pub async fn try_get_or_insert_with<E, F, Fut>(
        &self,
        key: PlanKey,
        f: F,
    ) -> Result<String, Arc<E>>
    where
        E: Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<String, E>>,
    {
        let short = key.short();
        let computed = AtomicBool::new(false);
        let res = self
            .inner
            .try_get_with(key, async {
                computed.store(true, Ordering::Relaxed);
                f().await.map(Arc::<str>::from)
            })
            .await;
        if computed.load(Ordering::Relaxed) {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(key = %short, "plan cache hit");
        }
        res.map(|plan| plan.to_string())
    }

    /// Whether `key` is cached (does not count as a lookup)
    #[must_use]
    pub fn contains(&self, key: &PlanKey) -> bool {
        self.inner.contains_key(key)
    }

    /// Drop every entry
    pub fn invalidate_all(&self) {
        self.inner.invalidate_all();
    }

    /// Apply pending evictions so counts are exact
    pub async fn sync(&self) {
        self.inner.run_pending_tasks().await;
    }

    /// Approximate entry count
    #[must_use]
    pub fn entry_count(&self) -> u64 {
        self.inner.entry_count()
    }

    /// Cache statistics
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entry_count: self.inner.entry_count(),
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
        }
    }
}

impl Default for PlanCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn key(instruction: &str) -> PlanKey {
        PlanKey::new(instruction, &["A".to_string()], (3, 1))
    }

    #[tokio::test]
    async fn insert_then_get() {
        let cache = PlanCache::new(10);
        cache.insert(key("mean"), "1. compute mean").await;
        assert_eq!(cache.get(&key("mean")).await.as_deref(), Some("1. compute mean"));
        assert_eq!(cache.get(&key("median")).await, None);

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
    }

    #[tokio::test]
    async fn compute_runs_once_per_key() {
        let cache = PlanCache::new(10);
        let calls = AtomicUsize::new(0);
        let calls = &calls;

        for _ in 0..3 {
            let plan = cache
                .try_get_or_insert_with(key("mean"), move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, ()>("plan".to_string())
                })
                .await
                .unwrap();
            assert_eq!(plan, "plan");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failures_are_not_cached() {
        let cache = PlanCache::new(10);
        let res = cache
            .try_get_or_insert_with(key("x"), || async { Err::<String, _>("model down") })
            .await;
        assert_eq!(*res.unwrap_err(), "model down");
        assert!(!cache.contains(&key("x")));

        let plan = cache
            .try_get_or_insert_with(key("x"), || async { Ok::<_, ()>("retry".to_string()) })
            .await
            .unwrap();
        assert_eq!(plan, "retry");
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_computation() {
        let cache = PlanCache::new(10);
        let calls = AtomicUsize::new(0);
        let calls = &calls;
        let compute = move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            Ok::<_, ()>("shared".to_string())
        };

        let (a, b, c) = tokio::join!(
            cache.try_get_or_insert_with(key("mean"), compute),
            cache.try_get_or_insert_with(key("mean"), compute),
            cache.try_get_or_insert_with(key("mean"), compute),
        );
        assert_eq!((a.unwrap(), b.unwrap(), c.unwrap()), ("shared".into(), "shared".into(), "shared".into()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (2, 1));
    }

    #[tokio::test]
    async fn least_recently_used_entry_is_evicted() {
        let cache = PlanCache::new(2);
        cache.insert(key("a"), "plan a").await;
        cache.insert(key("b"), "plan b").await;
        cache.sync().await;
        assert!(cache.get(&key("a")).await.is_some());

        cache.insert(key("c"), "plan c").await;
        cache.sync().await;

        assert!(cache.contains(&key("a")));
        assert!(!cache.contains(&key("b")));
        assert!(cache.contains(&key("c")));
        assert_eq!(cache.entry_count(), 2);
    }

    #[tokio::test]
    async fn capacity_is_bounded() {
        let cache = PlanCache::new(2);
        for i in 0..10 {
            cache.insert(key(&format!("q{i}")), "p").await;
        }
        cache.sync().await;
        assert!(cache.entry_count() <= 2);
    }
}

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use tracing::debug;

/// Kind tag carried by every cache entry; drives typed invalidation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheKind {
    General,
    MarketData,
    Greeks,
    OptionChain,
    Position,
    Account,
}

impl CacheKind {
    /// Market-sensitive entries are invalidated when the underlying spot
    /// moves at least `SPOT_MOVE_THRESHOLD`.
    fn is_spot_sensitive(&self) -> bool {
        matches!(
            self,
            CacheKind::MarketData | CacheKind::Greeks | CacheKind::OptionChain
        )
    }

    fn is_position_sensitive(&self) -> bool {
        matches!(self, CacheKind::Greeks | CacheKind::Position)
    }
}

/// Relative spot move that invalidates market-sensitive entries.
pub const SPOT_MOVE_THRESHOLD: f64 = 0.001;

const DEFAULT_TTL_SECS: i64 = 300;
/// Soft memory cap before LRU eviction kicks in.
const MEMORY_SOFT_CAP_BYTES: usize = 175 * 1024 * 1024;
const ENTRY_SOFT_CAP: usize = 10_000;

struct CacheEntry {
    kind: CacheKind,
    value: Value,
    expires_at: DateTime<Utc>,
    last_access: DateTime<Utc>,
    /// Spot of the entry's underlying at insert, when spot-sensitive.
    spot_fingerprint: Option<(String, Decimal)>,
    /// Invested-option-set hash at insert, when position-sensitive.
    position_fingerprint: Option<u64>,
    approx_bytes: usize,
}

#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
    pub approx_bytes: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 1.0;
        }
        self.hits as f64 / total as f64
    }

    pub fn fill_level(&self) -> f64 {
        self.entries as f64 / ENTRY_SOFT_CAP as f64
    }
}

struct CacheInner {
    entries: HashMap<String, CacheEntry>,
    spots: HashMap<String, Decimal>,
    position_hash: u64,
    approx_bytes: usize,
}

/// Consolidated replacement for the historical general/market-data/position
/// caches. Shared, internally synchronised; values are stored as JSON so a
/// single store serves every kind.
pub struct UnifiedCache {
    inner: Mutex<CacheInner>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    ttl: Duration,
}

impl UnifiedCache {
    pub fn new() -> Self {
        Self::with_ttl(Duration::seconds(DEFAULT_TTL_SECS))
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                spots: HashMap::new(),
                position_hash: 0,
                approx_bytes: 0,
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            ttl,
        }
    }

    /// Record the latest spot for an underlying. Spot-sensitive entries for
    /// that underlying are invalidated on a >= 0.1% move at next access.
    pub async fn update_spot(&self, underlying: &str, spot: Decimal) {
        let mut inner = self.inner.lock().await;
        inner.spots.insert(underlying.to_string(), spot);
    }

    /// Record the current invested-option-set hash. Position-sensitive
    /// entries taken under a different hash are invalidated at next access.
    pub async fn note_position_change(&self, hash: u64) {
        let mut inner = self.inner.lock().await;
        inner.position_hash = hash;
    }

    /// Fetch through the cache. `underlying` scopes the spot fingerprint for
    /// spot-sensitive kinds; pass the entry's underlying symbol or None.
    pub async fn get<T, F, Fut>(
        &self,
        key: &str,
        kind: CacheKind,
        underlying: Option<&str>,
        factory: F,
    ) -> T
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        let now = Utc::now();
        {
            let mut inner = self.inner.lock().await;
            let fresh = match inner.entries.get(key) {
                Some(entry) => entry.expires_at > now && fingerprint_matches(entry, &inner),
                None => false,
            };
            if fresh {
                let entry = inner.entries.get_mut(key).expect("entry checked above");
                entry.last_access = now;
                if let Ok(value) = serde_json::from_value(entry.value.clone()) {
                    self.hits.fetch_add(1, Ordering::SeqCst);
                    return value;
                }
            }
        }

        self.misses.fetch_add(1, Ordering::SeqCst);
        let produced = factory().await;
        let value = serde_json::to_value(&produced).unwrap_or(Value::Null);
        let approx_bytes = estimate_bytes(&value);

        let mut inner = self.inner.lock().await;
        let spot_fingerprint = if kind.is_spot_sensitive() {
            underlying.and_then(|u| inner.spots.get(u).map(|s| (u.to_string(), *s)))
        } else {
            None
        };
        let position_fingerprint = kind.is_position_sensitive().then_some(inner.position_hash);
        if let Some(old) = inner.entries.insert(
            key.to_string(),
            CacheEntry {
                kind,
                value,
                expires_at: now + self.ttl,
                last_access: now,
                spot_fingerprint,
                position_fingerprint,
                approx_bytes,
            },
        ) {
            inner.approx_bytes = inner.approx_bytes.saturating_sub(old.approx_bytes);
        }
        inner.approx_bytes += approx_bytes;
        produced
    }

    pub async fn invalidate(&self, key: &str) -> bool {
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.entries.remove(key) {
            inner.approx_bytes = inner.approx_bytes.saturating_sub(entry.approx_bytes);
            true
        } else {
            false
        }
    }

    pub async fn invalidate_by_type(&self, kind: CacheKind) -> usize {
        let mut inner = self.inner.lock().await;
        let before = inner.entries.len();
        let mut freed = 0usize;
        inner.entries.retain(|_, entry| {
            if entry.kind == kind {
                freed += entry.approx_bytes;
                false
            } else {
                true
            }
        });
        inner.approx_bytes = inner.approx_bytes.saturating_sub(freed);
        before - inner.entries.len()
    }

    /// Drop expired entries, then evict by LRU while over the soft caps.
    /// Within the LRU pass the Greeks group goes first.
    pub async fn periodic_maintenance(&self) -> usize {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        let mut freed_entries = 0usize;
        let mut freed_bytes = 0usize;
        inner.entries.retain(|_, entry| {
            if entry.expires_at <= now {
                freed_entries += 1;
                freed_bytes += entry.approx_bytes;
                false
            } else {
                true
            }
        });
        inner.approx_bytes = inner.approx_bytes.saturating_sub(freed_bytes);

        while inner.entries.len() > ENTRY_SOFT_CAP || inner.approx_bytes > MEMORY_SOFT_CAP_BYTES {
            let victim = inner
                .entries
                .iter()
                .min_by_key(|(_, e)| (e.kind != CacheKind::Greeks, e.last_access))
                .map(|(k, _)| k.clone());
            let Some(victim) = victim else { break };
            if let Some(entry) = inner.entries.remove(&victim) {
                inner.approx_bytes = inner.approx_bytes.saturating_sub(entry.approx_bytes);
                self.evictions.fetch_add(1, Ordering::SeqCst);
                freed_entries += 1;
            }
        }

        if freed_entries > 0 {
            debug!(freed = freed_entries, "cache maintenance");
        }
        freed_entries
    }

    pub async fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().await;
        CacheStats {
            hits: self.hits.load(Ordering::SeqCst),
            misses: self.misses.load(Ordering::SeqCst),
            evictions: self.evictions.load(Ordering::SeqCst),
            entries: inner.entries.len(),
            approx_bytes: inner.approx_bytes,
        }
    }
}

impl Default for UnifiedCache {
    fn default() -> Self {
        Self::new()
    }
}

fn fingerprint_matches(entry: &CacheEntry, inner: &CacheInner) -> bool {
    if let Some((underlying, spot_then)) = &entry.spot_fingerprint {
        if let Some(spot_now) = inner.spots.get(underlying) {
            let then = spot_then.to_f64().unwrap_or(0.0);
            let now = spot_now.to_f64().unwrap_or(0.0);
            if then > 0.0 && ((now - then) / then).abs() >= SPOT_MOVE_THRESHOLD {
                return false;
            }
        }
    }
    if let Some(hash_then) = entry.position_fingerprint {
        if hash_then != inner.position_hash {
            return false;
        }
    }
    true
}

fn estimate_bytes(value: &Value) -> usize {
    // JSON text length is a fair proxy for resident size here.
    serde_json::to_string(value).map_or(64, |s| s.len() + 64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    async fn counted_get(cache: &UnifiedCache, key: &str, kind: CacheKind, underlying: Option<&str>, calls: &Arc<AtomicUsize>) -> f64 {
        let calls = calls.clone();
        cache
            .get(key, kind, underlying, move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                42.0
            })
            .await
    }

    #[tokio::test]
    async fn second_get_hits_cache() {
        let cache = UnifiedCache::new();
        let calls = Arc::new(AtomicUsize::new(0));
        counted_get(&cache, "k", CacheKind::General, None, &calls).await;
        counted_get(&cache, "k", CacheKind::General, None, &calls).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stats = cache.stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[tokio::test]
    async fn spot_move_invalidates_market_data() {
        let cache = UnifiedCache::new();
        let calls = Arc::new(AtomicUsize::new(0));
        cache.update_spot("SPY", dec!(450)).await;
        counted_get(&cache, "md:SPY", CacheKind::MarketData, Some("SPY"), &calls).await;

        // 0.05% move: below threshold, still cached.
        cache.update_spot("SPY", dec!(450.2)).await;
        counted_get(&cache, "md:SPY", CacheKind::MarketData, Some("SPY"), &calls).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // 0.1% move from the fingerprint: factory runs again.
        cache.update_spot("SPY", dec!(450.65)).await;
        counted_get(&cache, "md:SPY", CacheKind::MarketData, Some("SPY"), &calls).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn position_change_invalidates_greeks() {
        let cache = UnifiedCache::new();
        let calls = Arc::new(AtomicUsize::new(0));
        cache.note_position_change(1).await;
        counted_get(&cache, "greeks:pf", CacheKind::Greeks, None, &calls).await;
        counted_get(&cache, "greeks:pf", CacheKind::Greeks, None, &calls).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        cache.note_position_change(2).await;
        counted_get(&cache, "greeks:pf", CacheKind::Greeks, None, &calls).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn position_change_does_not_touch_general() {
        let cache = UnifiedCache::new();
        let calls = Arc::new(AtomicUsize::new(0));
        cache.note_position_change(1).await;
        counted_get(&cache, "g", CacheKind::General, None, &calls).await;
        cache.note_position_change(2).await;
        counted_get(&cache, "g", CacheKind::General, None, &calls).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn ttl_expiry_forces_refetch() {
        let cache = UnifiedCache::with_ttl(Duration::seconds(-1));
        let calls = Arc::new(AtomicUsize::new(0));
        counted_get(&cache, "k", CacheKind::General, None, &calls).await;
        counted_get(&cache, "k", CacheKind::General, None, &calls).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn invalidate_by_type_counts() {
        let cache = UnifiedCache::new();
        cache.get("a", CacheKind::Greeks, None, || async { 1.0 }).await;
        cache.get("b", CacheKind::Greeks, None, || async { 2.0 }).await;
        cache.get("c", CacheKind::Account, None, || async { 3.0 }).await;
        assert_eq!(cache.invalidate_by_type(CacheKind::Greeks).await, 2);
        assert_eq!(cache.stats().await.entries, 1);
    }

    #[tokio::test]
    async fn maintenance_removes_expired() {
        let cache = UnifiedCache::with_ttl(Duration::seconds(-1));
        cache.get("a", CacheKind::General, None, || async { 1.0 }).await;
        let removed = cache.periodic_maintenance().await;
        assert_eq!(removed, 1);
        assert_eq!(cache.stats().await.entries, 0);
    }
}

//! Read-through tiered cache: L1 memory, L2 local store, L3 distributed,
//! fronting an external system of record (L4).
//!
//! ## Lookup order
//!
//! ```text
//! get(key)
//!   L1 (DashMap)   hit → return
//!   L2 (SQLite)    hit → fill L1, return
//!   L3 (Redis)     hit → fill L2, L1, return
//!   L4 (source)    hit → fill L3, L2, L1, return
//! ```
//!
//! Tier failures never reach the caller. A corrupt value is dropped from the
//! tier that held it and the lookup continues with the next tier. L3 writes
//! on `set`/`invalidate` are fire-and-forget, but applied per key in the order
//! they were issued: a background set never lands after a later invalidation.

pub mod distributed;
pub mod local_store;
pub mod memory;

use crate::config::CacheConfig;
use crate::error::PipelineResult;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use distributed::{DistributedTier, InvalidationListener, RedisTier, TierHealth};
pub use local_store::LocalStore;
pub use memory::MemoryTier;

/// Cache tiers in order of proximity to the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    L1,
    L2,
    L3,
}

impl Tier {
    pub fn label(&self) -> &'static str {
        match self {
            Tier::L1 => "l1",
            Tier::L2 => "l2",
            Tier::L3 => "l3",
        }
    }
}

/// Independent per-tier TTL caps
#[derive(Debug, Clone, Copy)]
pub struct TierTtls {
    pub l1: Duration,
    pub l2: Duration,
    pub l3: Duration,
}

impl TierTtls {
    fn for_tier(&self, tier: Tier) -> Duration {
        match tier {
            Tier::L1 => self.l1,
            Tier::L2 => self.l2,
            Tier::L3 => self.l3,
        }
    }

    /// TTL for `tier`, never longer than `remaining` when known.
    fn capped(&self, tier: Tier, remaining: Option<Duration>) -> Duration {
        let cap = self.for_tier(tier);
        remaining.map_or(cap, |r| r.min(cap))
    }
}

impl From<&CacheConfig> for TierTtls {
    fn from(config: &CacheConfig) -> Self {
        Self {
            l1: config.l1_ttl(),
            l2: config.l2_ttl(),
            l3: config.l3_ttl(),
        }
    }
}

/// The authoritative store behind the cache (L4).
#[async_trait]
pub trait SourceOfRecord: Send + Sync {
    type Value: Serialize + DeserializeOwned + Send + Sync;

    async fn load(&self, key: &str) -> PipelineResult<Option<Self::Value>>;
}

/// Per-key sequencing of L3 writes. Each write takes a ticket when it is
/// issued; writes to one key run one at a time, and a set whose ticket is no
/// longer the latest for its key is dropped.
#[derive(Default)]
struct WriteOrder {
    next: AtomicU64,
    keys: DashMap<String, KeySlot>,
}

struct KeySlot {
    latest: u64,
    lock: Arc<AsyncMutex<()>>,
}

struct Ticket {
    seq: u64,
    lock: Arc<AsyncMutex<()>>,
}

impl WriteOrder {
    fn issue(&self, key: &str) -> Ticket {
        let seq = self.next.fetch_add(1, Ordering::SeqCst) + 1;
        let mut slot = self.keys.entry(key.to_string()).or_insert_with(|| KeySlot {
            latest: 0,
            lock: Arc::new(AsyncMutex::new(())),
        });
        slot.latest = seq;
        Ticket {
            seq,
            lock: slot.lock.clone(),
        }
    }

    fn is_latest(&self, key: &str, seq: u64) -> bool {
        self.keys.get(key).map_or(false, |slot| slot.latest == seq)
    }

    fn release(&self, key: &str, seq: u64) {
        self.keys.remove_if(key, |_, slot| slot.latest == seq);
    }
}

#[derive(Clone)]
struct L3Handle {
    tier: Arc<dyn DistributedTier>,
    health: Arc<TierHealth>,
    timeout: Duration,
    order: Arc<WriteOrder>,
}

impl L3Handle {
    async fn get(&self, key: &str) -> Option<(Bytes, Option<Duration>)> {
        if !self.health.should_attempt() {
            return None;
        }

        match tokio::time::timeout(self.timeout, self.tier.get(key)).await {
            Ok(Ok(found)) => {
                self.health.mark_up();
                found
            }
            Ok(Err(e)) => {
                self.health.mark_down(&e.to_string());
                None
            }
            Err(_) => {
                self.health.mark_down("GET timed out");
                None
            }
        }
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) {
        if !self.health.should_attempt() {
            return;
        }

        match tokio::time::timeout(self.timeout, self.tier.set(key, value, ttl)).await {
            Ok(Ok(())) => self.health.mark_up(),
            Ok(Err(e)) => self.health.mark_down(&e.to_string()),
            Err(_) => self.health.mark_down("SET timed out"),
        }
    }

    async fn delete_and_publish(&self, key: &str) {
        if !self.health.should_attempt() {
            return;
        }

        let work = async {
            self.tier.delete(key).await?;
            self.tier.publish_invalidation(key).await
        };

        match tokio::time::timeout(self.timeout * 2, work).await {
            Ok(Ok(())) => self.health.mark_up(),
            Ok(Err(e)) => self.health.mark_down(&e.to_string()),
            Err(_) => self.health.mark_down("DEL timed out"),
        }
    }

    /// Set under `ticket`, skipped when a later write to `key` was issued.
    async fn set_in_order(&self, key: &str, ticket: Ticket, value: Bytes, ttl: Duration) {
        let _turn = ticket.lock.lock().await;
        if self.order.is_latest(key, ticket.seq) {
            self.set(key, value, ttl).await;
        } else {
            debug!(key = %key, "L3 set superseded by a later write");
        }
        self.order.release(key, ticket.seq);
    }

    /// Set now, ordered with the background writes to `key`.
    async fn write_through(&self, key: &str, value: Bytes, ttl: Duration) {
        let ticket = self.order.issue(key);
        self.set_in_order(key, ticket, value, ttl).await;
    }

    /// Run `set` in the background; the caller never waits on L3.
    fn spawn_set(&self, key: &str, value: Bytes, ttl: Duration) {
        let ticket = self.order.issue(key);
        let handle = self.clone();
        let key = key.to_string();
        tokio::spawn(async move { handle.set_in_order(&key, ticket, value, ttl).await });
    }

    /// Delete and broadcast in the background. Deletes always run.
    fn spawn_delete(&self, key: &str) {
        let ticket = self.order.issue(key);
        let handle = self.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            let _turn = ticket.lock.lock().await;
            handle.delete_and_publish(&key).await;
            handle.order.release(&key, ticket.seq);
        });
    }
}

/// Cache statistics
#[derive(Debug, Clone, PartialEq)]
pub struct CacheStats {
    pub l1_entries: usize,
    pub l2_enabled: bool,
    pub l3_configured: bool,
    pub l3_reachable: bool,
}

pub struct TieredCache {
    l1: MemoryTier,
    l2: Option<LocalStore>,
    l3: Option<L3Handle>,
    ttls: TierTtls,
}

impl TieredCache {
    pub fn new(
        l1: MemoryTier,
        l2: Option<LocalStore>,
        l3: Option<(Arc<dyn DistributedTier>, Duration, Duration)>,
        ttls: TierTtls,
    ) -> Self {
        let l3 = l3.map(|(tier, timeout, retry_after)| L3Handle {
            tier,
            health: Arc::new(TierHealth::new(retry_after)),
            timeout,
            order: Arc::new(WriteOrder::default()),
        });

        Self { l1, l2, l3, ttls }
    }

    /// Build all tiers from configuration. A local store that cannot be
    /// recreated disables L2 instead of failing startup.
    pub async fn from_config(config: &CacheConfig, l3: Option<Arc<dyn DistributedTier>>) -> Self {
        let l2 = match LocalStore::open(&config.local_store_path).await {
            Ok(store) => Some(store),
            Err(e) => {
                warn!(error = %e, "Local cache store unavailable, running without L2");
                None
            }
        };

        let l3 = l3.map(|tier| {
            (
                tier,
                config.redis_timeout(),
                Duration::from_secs(config.redis_retry_after_secs),
            )
        });

        info!(
            l2_enabled = l2.is_some(),
            l3_enabled = l3.is_some(),
            "Tiered cache initialized"
        );

        Self::new(MemoryTier::new(config.l1_capacity), l2, l3, TierTtls::from(config))
    }

    /// Look `key` up in L1, L2 and L3, back-filling closer tiers on a hit.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        if let Some(data) = self.l1.get(key) {
            match decode::<T>(Tier::L1, key, &data) {
                Some(value) => {
                    record_hit(Tier::L1);
                    return Some(value);
                }
                None => self.l1.remove(key),
            }
        }

        if let Some(l2) = &self.l2 {
            match l2.get(key).await {
                Ok(Some(entry)) => match decode::<T>(Tier::L2, key, &entry.data) {
                    Some(value) => {
                        record_hit(Tier::L2);
                        let remaining = entry.remaining(Utc::now().timestamp_millis());
                        self.l1.insert(
                            key,
                            Bytes::from(entry.data),
                            self.ttls.capped(Tier::L1, Some(remaining)),
                        );
                        return Some(value);
                    }
                    None => self.remove_l2(key).await,
                },
                Ok(None) => {}
                Err(e) => warn!(key = %key, error = %e, "L2 read failed, skipping tier"),
            }
        }

        if let Some(l3) = &self.l3 {
            if let Some((data, remaining)) = l3.get(key).await {
                match decode::<T>(Tier::L3, key, &data) {
                    Some(value) => {
                        record_hit(Tier::L3);
                        self.fill_local(key, &data, remaining).await;
                        return Some(value);
                    }
                    None => l3.spawn_delete(key),
                }
            }
        }

        metrics::counter!("cache.misses").increment(1);
        None
    }

    /// Read-through: on a miss in every tier, load from `source` and
    /// back-fill L3, then L2, then L1. Only errors from `source` propagate.
    pub async fn get_or_load<S: SourceOfRecord>(
        &self,
        key: &str,
        source: &S,
    ) -> PipelineResult<Option<S::Value>> {
        if let Some(value) = self.get::<S::Value>(key).await {
            return Ok(Some(value));
        }

        let Some(value) = source.load(key).await? else {
            return Ok(None);
        };

        match serde_json::to_vec(&value) {
            Ok(encoded) => {
                let data = Bytes::from(encoded);
                if let Some(l3) = &self.l3 {
                    l3.write_through(key, data.clone(), self.ttls.l3).await;
                }
                self.fill_local(key, &data, None).await;
                debug!(key = %key, "cache filled from source of record");
            }
            Err(e) => warn!(key = %key, error = %e, "Failed to encode value for caching"),
        }

        Ok(Some(value))
    }

    /// Write `value` to every tier. L1/L2 synchronously, L3 in the background.
    pub async fn set<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        let data = match serde_json::to_vec(value) {
            Ok(encoded) => Bytes::from(encoded),
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to encode value for caching");
                return;
            }
        };

        self.l1.insert(key, data.clone(), self.ttls.capped(Tier::L1, Some(ttl)));

        if let Some(l2) = &self.l2 {
            if let Err(e) = l2.put(key, &data, self.ttls.capped(Tier::L2, Some(ttl))).await {
                warn!(key = %key, error = %e, "L2 write failed");
            }
        }

        if let Some(l3) = &self.l3 {
            l3.spawn_set(key, data, self.ttls.capped(Tier::L3, Some(ttl)));
        }
    }

    /// Drop `key` everywhere. L3 deletion and the cross-instance broadcast are best-effort.
    pub async fn invalidate(&self, key: &str) {
        self.evict_local(key).await;

        if let Some(l3) = &self.l3 {
            l3.spawn_delete(key);
        }
    }

    /// Drop `key` from L1 and L2 only; used when another instance invalidated it.
    pub async fn evict_local(&self, key: &str) {
        self.l1.remove(key);
        self.remove_l2(key).await;
    }

    /// Remove expired entries from L1 and L2.
    pub async fn sweep(&self) {
        let l1_removed = self.l1.sweep();
        let l2_removed = match &self.l2 {
            Some(l2) => l2.purge_expired().await.unwrap_or_else(|e| {
                warn!(error = %e, "L2 purge failed");
                0
            }),
            None => 0,
        };

        if l1_removed > 0 || l2_removed > 0 {
            debug!(l1_removed, l2_removed, "cache sweep finished");
        }
    }

    /// Periodically sweep until `shutdown`.
    pub async fn run_sweeper(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.sweep().await,
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            l1_entries: self.l1.len(),
            l2_enabled: self.l2.is_some(),
            l3_configured: self.l3.is_some(),
            l3_reachable: self.l3.as_ref().map_or(false, |l3| l3.health.is_reachable()),
        }
    }

    async fn fill_local(&self, key: &str, data: &Bytes, remaining: Option<Duration>) {
        if let Some(l2) = &self.l2 {
            if let Err(e) = l2.put(key, data, self.ttls.capped(Tier::L2, remaining)).await {
                warn!(key = %key, error = %e, "L2 back-fill failed");
            }
        }
        self.l1.insert(key, data.clone(), self.ttls.capped(Tier::L1, remaining));
    }

    async fn remove_l2(&self, key: &str) {
        if let Some(l2) = &self.l2 {
            if let Err(e) = l2.remove(key).await {
                warn!(key = %key, error = %e, "L2 delete failed");
            }
        }
    }
}

fn record_hit(tier: Tier) {
    metrics::counter!("cache.hits", "tier" => tier.label()).increment(1);
}

/// Decode a cached payload; undecodable payloads count as corruption and read as a miss.
fn decode<T: DeserializeOwned>(tier: Tier, key: &str, data: &[u8]) -> Option<T> {
    match serde_json::from_slice(data) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(key = %key, tier = tier.label(), error = %e, "Corrupt cache entry, treating as miss");
            metrics::counter!("cache.corruption", "tier" => tier.label()).increment(1);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use crate::testing::{FakeDistributedTier, UnreachableTier};
    use serde::Deserialize;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Subscription {
        plan: String,
        credits: u32,
    }

    fn ttls() -> TierTtls {
        TierTtls {
            l1: Duration::from_secs(30),
            l2: Duration::from_secs(60),
            l3: Duration::from_secs(120),
        }
    }

    async fn local_store(dir: &TempDir) -> LocalStore {
        LocalStore::open(dir.path().join("cache.sqlite")).await.unwrap()
    }

    fn with_l3(tier: Arc<dyn DistributedTier>) -> Option<(Arc<dyn DistributedTier>, Duration, Duration)> {
        Some((tier, Duration::from_millis(200), Duration::from_secs(30)))
    }

    struct CountingSource {
        loads: AtomicUsize,
        value: Option<Subscription>,
    }

    #[async_trait]
    impl SourceOfRecord for CountingSource {
        type Value = Subscription;

        async fn load(&self, _key: &str) -> PipelineResult<Option<Subscription>> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(self.value.clone())
        }
    }

    fn pro() -> Subscription {
        Subscription {
            plan: "pro".to_string(),
            credits: 120,
        }
    }

    #[tokio::test]
    async fn test_set_then_get_returns_value() {
        let dir = tempfile::tempdir().unwrap();
        let l3 = Arc::new(FakeDistributedTier::default());
        let cache = TieredCache::new(MemoryTier::new(100), Some(local_store(&dir).await), with_l3(l3), ttls());

        cache.set("sub:u1", &pro(), Duration::from_secs(60)).await;
        assert_eq!(cache.get::<Subscription>("sub:u1").await, Some(pro()));
    }

    #[tokio::test]
    async fn test_read_through_fills_every_tier() {
        let dir = tempfile::tempdir().unwrap();
        let l3 = Arc::new(FakeDistributedTier::default());
        let cache = TieredCache::new(
            MemoryTier::new(100),
            Some(local_store(&dir).await),
            with_l3(l3.clone()),
            ttls(),
        );
        let source = CountingSource {
            loads: AtomicUsize::new(0),
            value: Some(pro()),
        };

        assert_eq!(cache.get_or_load("sub:u1", &source).await.unwrap(), Some(pro()));
        assert_eq!(cache.get_or_load("sub:u1", &source).await.unwrap(), Some(pro()));
        assert_eq!(source.loads.load(Ordering::SeqCst), 1);

        assert!(l3.contains("sub:u1"));
        assert!(cache.l2.as_ref().unwrap().get("sub:u1").await.unwrap().is_some());
        assert!(cache.l1.get("sub:u1").is_some());
    }

    #[tokio::test]
    async fn test_missing_in_source_is_not_cached() {
        let cache = TieredCache::new(MemoryTier::new(100), None, None, ttls());
        let source = CountingSource {
            loads: AtomicUsize::new(0),
            value: None,
        };

        assert_eq!(cache.get_or_load("sub:none", &source).await.unwrap(), None);
        assert_eq!(cache.get_or_load("sub:none", &source).await.unwrap(), None);
        assert_eq!(source.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_l3_hit_backfills_local_tiers() {
        let dir = tempfile::tempdir().unwrap();
        let l3 = Arc::new(FakeDistributedTier::default());
        l3.insert("templates:featured", serde_json::to_vec(&pro()).unwrap());
        let cache = TieredCache::new(
            MemoryTier::new(100),
            Some(local_store(&dir).await),
            with_l3(l3),
            ttls(),
        );

        assert_eq!(cache.get::<Subscription>("templates:featured").await, Some(pro()));
        assert!(cache.l1.get("templates:featured").is_some());
        assert!(cache
            .l2
            .as_ref()
            .unwrap()
            .get("templates:featured")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_corrupt_l1_entry_falls_through_to_next_tier() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TieredCache::new(MemoryTier::new(100), Some(local_store(&dir).await), None, ttls());

        cache
            .l2
            .as_ref()
            .unwrap()
            .put("sub:u1", &serde_json::to_vec(&pro()).unwrap(), Duration::from_secs(60))
            .await
            .unwrap();
        cache.l1.insert("sub:u1", Bytes::from_static(b"{not json"), Duration::from_secs(60));

        assert_eq!(cache.get::<Subscription>("sub:u1").await, Some(pro()));
        // L1 was repaired from L2.
        assert_eq!(
            serde_json::from_slice::<Subscription>(&cache.l1.get("sub:u1").unwrap()).unwrap(),
            pro()
        );
    }

    #[tokio::test]
    async fn test_corrupt_everywhere_reloads_from_source() {
        let cache = TieredCache::new(MemoryTier::new(100), None, None, ttls());
        cache.l1.insert("sub:u1", Bytes::from_static(b"\x00\x01"), Duration::from_secs(60));
        let source = CountingSource {
            loads: AtomicUsize::new(0),
            value: Some(pro()),
        };

        assert_eq!(cache.get_or_load("sub:u1", &source).await.unwrap(), Some(pro()));
        assert_eq!(source.loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unreachable_l3_degrades_to_local_tiers() {
        let dir = tempfile::tempdir().unwrap();
        let cache = TieredCache::new(
            MemoryTier::new(100),
            Some(local_store(&dir).await),
            with_l3(Arc::new(UnreachableTier)),
            ttls(),
        );
        let source = CountingSource {
            loads: AtomicUsize::new(0),
            value: Some(pro()),
        };

        cache.set("sub:u1", &pro(), Duration::from_secs(60)).await;
        assert_eq!(cache.get::<Subscription>("sub:u1").await, Some(pro()));

        assert_eq!(cache.get_or_load("sub:u2", &source).await.unwrap(), Some(pro()));
        assert!(!cache.stats().l3_reachable);

        cache.invalidate("sub:u1").await;
        assert_eq!(cache.get::<Subscription>("sub:u1").await, None);
    }

    #[tokio::test]
    async fn test_hanging_l3_is_bounded_by_timeout() {
        let l3 = Arc::new(FakeDistributedTier::with_delay(Duration::from_secs(5)));
        let cache = TieredCache::new(MemoryTier::new(100), None, with_l3(l3), ttls());

        let started = std::time::Instant::now();
        assert_eq!(cache.get::<Subscription>("sub:slow").await, None);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!cache.stats().l3_reachable);
    }

    #[tokio::test]
    async fn test_invalidate_clears_all_tiers() {
        let dir = tempfile::tempdir().unwrap();
        let l3 = Arc::new(FakeDistributedTier::default());
        let cache = TieredCache::new(
            MemoryTier::new(100),
            Some(local_store(&dir).await),
            with_l3(l3.clone()),
            ttls(),
        );

        cache.set("sub:u1", &pro(), Duration::from_secs(60)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(l3.contains("sub:u1"));

        cache.invalidate("sub:u1").await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(cache.get::<Subscription>("sub:u1").await, None);
        assert!(!l3.contains("sub:u1"));
        assert_eq!(l3.published(), vec!["sub:u1".to_string()]);
    }

    #[tokio::test]
    async fn test_slow_set_does_not_outlive_later_invalidate() {
        let l3 = Arc::new(FakeDistributedTier::with_set_delay(Duration::from_millis(100)));
        let cache = TieredCache::new(MemoryTier::new(100), None, with_l3(l3.clone()), ttls());

        cache.set("asset:a1", &pro(), Duration::from_secs(60)).await;
        cache.invalidate("asset:a1").await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(!l3.contains("asset:a1"));
        assert_eq!(cache.get::<Subscription>("asset:a1").await, None);
    }

    #[tokio::test]
    async fn test_l3_keeps_the_latest_of_two_sets() {
        let l3 = Arc::new(FakeDistributedTier::with_set_delay(Duration::from_millis(50)));
        let cache = TieredCache::new(MemoryTier::new(100), None, with_l3(l3.clone()), ttls());
        let free = Subscription {
            plan: "free".to_string(),
            credits: 0,
        };

        cache.set("sub:u1", &free, Duration::from_secs(60)).await;
        cache.set("sub:u1", &pro(), Duration::from_secs(60)).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        cache.evict_local("sub:u1").await;
        assert_eq!(cache.get::<Subscription>("sub:u1").await, Some(pro()));
    }

    #[tokio::test]
    async fn test_l1_ttl_is_shorter_than_requested() {
        let cache = TieredCache::new(
            MemoryTier::new(100),
            None,
            None,
            TierTtls {
                l1: Duration::from_millis(5),
                l2: Duration::from_secs(60),
                l3: Duration::from_secs(60),
            },
        );

        cache.set("popularity:t1", &42u64, Duration::from_secs(60)).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(cache.get::<u64>("popularity:t1").await, None);
    }

    #[tokio::test]
    async fn test_source_errors_propagate() {
        struct Failing;

        #[async_trait]
        impl SourceOfRecord for Failing {
            type Value = Subscription;

            async fn load(&self, _key: &str) -> PipelineResult<Option<Subscription>> {
                Err(PipelineError::Storage("db down".into()))
            }
        }

        let cache = TieredCache::new(MemoryTier::new(10), None, None, ttls());
        assert!(cache.get_or_load("sub:u1", &Failing).await.is_err());
    }
}

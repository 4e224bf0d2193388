//! L1: in-process memory tier.

use bytes::Bytes;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::trace;

/// An L1 entry. The payload is `Bytes`, so hits are reference-counted clones.
#[derive(Debug)]
struct MemoryEntry {
    data: Bytes,
    created_at: Instant,
    ttl: Duration,
    /// Recency tick of the last read or write, used for eviction
    last_access: AtomicU64,
}

impl MemoryEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) > self.ttl
    }
}

/// Bounded in-memory tier with read-time TTL and least-recently-used eviction.
#[derive(Debug)]
pub struct MemoryTier {
    entries: DashMap<String, MemoryEntry>,
    capacity: usize,
    tick: AtomicU64,
}

impl MemoryTier {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            capacity: capacity.max(1),
            tick: AtomicU64::new(0),
        }
    }

    fn next_tick(&self) -> u64 {
        self.tick.fetch_add(1, Ordering::Relaxed)
    }

    /// Get a live entry, dropping it if its TTL has elapsed.
    pub fn get(&self, key: &str) -> Option<Bytes> {
        let now = Instant::now();
        {
            let entry = self.entries.get(key)?;
            if !entry.is_expired(now) {
                entry.last_access.store(self.next_tick(), Ordering::Relaxed);
                return Some(entry.data.clone());
            }
        }

        self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        None
    }

    pub fn insert(&self, key: &str, data: Bytes, ttl: Duration) {
        let entry = MemoryEntry {
            data,
            created_at: Instant::now(),
            ttl,
            last_access: AtomicU64::new(self.next_tick()),
        };
        self.entries.insert(key.to_string(), entry);

        while self.entries.len() > self.capacity {
            if !self.evict_least_recent() {
                break;
            }
        }
    }

    pub fn remove(&self, key: &str) {
        self.entries.remove(key);
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict_least_recent(&self) -> bool {
        let victim = self
            .entries
            .iter()
            .min_by_key(|entry| entry.value().last_access.load(Ordering::Relaxed))
            .map(|entry| entry.key().clone());

        match victim {
            Some(key) => {
                trace!(key = %key, "evicting least recently used L1 entry");
                self.entries.remove(&key);
                true
            }
            None => false,
        }
    }
}

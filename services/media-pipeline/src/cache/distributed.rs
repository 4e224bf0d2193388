//! L3: shared distributed tier (Redis) and its reachability tracking.

use crate::error::{PipelineError, PipelineResult};
use async_trait::async_trait;
use bytes::Bytes;
use deadpool_redis::{Pool, Runtime};
use futures::StreamExt;
use parking_lot::Mutex;
use redis::AsyncCommands;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Channel other instances listen on to drop keys from their local tiers
pub const INVALIDATION_CHANNEL: &str = "cache:invalidate";

/// Simple GET/SET-with-TTL contract of the shared cache service.
#[async_trait]
pub trait DistributedTier: Send + Sync {
    /// Value and remaining TTL, if present.
    async fn get(&self, key: &str) -> PipelineResult<Option<(Bytes, Option<Duration>)>>;

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> PipelineResult<()>;

    async fn delete(&self, key: &str) -> PipelineResult<()>;

    /// Tell other instances to drop `key` from their L1/L2.
    async fn publish_invalidation(&self, _key: &str) -> PipelineResult<()> {
        Ok(())
    }
}

fn redis_error(e: impl std::fmt::Display) -> PipelineError {
    PipelineError::TransientIo(format!("Redis error: {e}"))
}

/// Redis-backed L3 over a deadpool connection pool
pub struct RedisTier {
    pool: Pool,
}

impl RedisTier {
    pub fn new(url: &str, pool_size: usize, timeout: Duration) -> anyhow::Result<Self> {
        let mut redis_config = deadpool_redis::Config::from_url(url);
        if let Some(ref mut pool_config) = redis_config.pool {
            pool_config.max_size = pool_size;
            pool_config.timeouts.wait = Some(timeout);
            pool_config.timeouts.create = Some(timeout);
            pool_config.timeouts.recycle = Some(timeout);
        }

        let pool = redis_config.create_pool(Some(Runtime::Tokio1))?;
        info!("Redis cache tier configured");
        Ok(Self { pool })
    }
}

#[async_trait]
impl DistributedTier for RedisTier {
    async fn get(&self, key: &str) -> PipelineResult<Option<(Bytes, Option<Duration>)>> {
        let mut conn = self.pool.get().await.map_err(redis_error)?;
        let (value, pttl): (Option<Vec<u8>>, i64) = redis::pipe()
            .get(key)
            .pttl(key)
            .query_async(&mut conn)
            .await
            .map_err(redis_error)?;

        // PTTL is -1 for keys without expiry and -2 for missing keys.
        let remaining = (pttl >= 0).then(|| Duration::from_millis(pttl as u64));
        Ok(value.map(|v| (Bytes::from(v), remaining)))
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) -> PipelineResult<()> {
        let mut conn = self.pool.get().await.map_err(redis_error)?;
        conn.pset_ex::<_, _, ()>(key, value.as_ref(), ttl.as_millis().max(1) as u64)
            .await
            .map_err(redis_error)
    }

    async fn delete(&self, key: &str) -> PipelineResult<()> {
        let mut conn = self.pool.get().await.map_err(redis_error)?;
        conn.del::<_, ()>(key).await.map_err(redis_error)
    }

    async fn publish_invalidation(&self, key: &str) -> PipelineResult<()> {
        let mut conn = self.pool.get().await.map_err(redis_error)?;
        conn.publish::<_, _, ()>(INVALIDATION_CHANNEL, key)
            .await
            .map_err(redis_error)
    }
}

/// Tracks whether L3 is reachable. After a failure L3 is skipped until
/// `retry_after` elapses, then the next call probes it again.
#[derive(Debug)]
pub struct TierHealth {
    reachable: AtomicBool,
    down_until: Mutex<Option<Instant>>,
    retry_after: Duration,
}

impl TierHealth {
    pub fn new(retry_after: Duration) -> Self {
        metrics::gauge!("cache.l3.reachable").set(1.0);
        Self {
            reachable: AtomicBool::new(true),
            down_until: Mutex::new(None),
            retry_after,
        }
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::Relaxed)
    }

    /// Whether a call should be attempted now.
    pub fn should_attempt(&self) -> bool {
        match *self.down_until.lock() {
            Some(until) => Instant::now() >= until,
            None => true,
        }
    }

    pub fn mark_up(&self) {
        *self.down_until.lock() = None;
        if !self.reachable.swap(true, Ordering::Relaxed) {
            info!("Distributed cache tier reachable again");
            metrics::gauge!("cache.l3.reachable").set(1.0);
        }
    }

    pub fn mark_down(&self, reason: &str) {
        *self.down_until.lock() = Some(Instant::now() + self.retry_after);
        if self.reachable.swap(false, Ordering::Relaxed) {
            warn!(
                reason = %reason,
                retry_after_secs = self.retry_after.as_secs(),
                "Distributed cache tier unreachable, serving from local tiers only"
            );
            metrics::gauge!("cache.l3.reachable").set(0.0);
        }
    }
}

/// Subscribes to `cache:invalidate` and removes announced keys locally.
pub struct InvalidationListener {
    pub redis_url: String,
}

impl InvalidationListener {
    /// Listen until `shutdown`, reconnecting with exponential backoff.
    /// `on_key` receives every invalidated key.
    pub async fn run<F, Fut>(self, on_key: F, shutdown: CancellationToken)
    where
        F: Fn(String) -> Fut + Send + Sync,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let mut backoff = Duration::from_secs(1);
        const MAX_BACKOFF: Duration = Duration::from_secs(300);

        loop {
            let result = tokio::select! {
                _ = shutdown.cancelled() => return,
                result = self.listen(&on_key) => result,
            };

            match result {
                Ok(()) => backoff = Duration::from_secs(1),
                Err(e) => {
                    error!(
                        error = %e,
                        backoff_secs = backoff.as_secs(),
                        "Cache invalidation listener error, reconnecting"
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }

    async fn listen<F, Fut>(&self, on_key: &F) -> Result<(), String>
    where
        F: Fn(String) -> Fut + Send + Sync,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let client = redis::Client::open(self.redis_url.clone())
            .map_err(|e| format!("failed to create Redis client: {e}"))?;

        let mut pubsub = client
            .get_async_pubsub()
            .await
            .map_err(|e| format!("failed to get pub/sub connection: {e}"))?;

        pubsub
            .subscribe(INVALIDATION_CHANNEL)
            .await
            .map_err(|e| format!("failed to subscribe: {e}"))?;

        info!(channel = INVALIDATION_CHANNEL, "Subscribed to cache invalidation channel");

        let mut stream = pubsub.on_message();
        while let Some(msg) = stream.next().await {
            match msg.get_payload::<String>() {
                Ok(key) => {
                    debug!(key = %key, "received cache invalidation");
                    on_key(key).await;
                }
                Err(e) => warn!(error = %e, "failed to parse invalidation message payload"),
            }
        }

        Err("pub/sub connection closed".to_string())
    }
}

//! In-memory fakes for the pipeline's external collaborators.

use crate::cache::DistributedTier;
use crate::error::{PipelineError, PipelineResult};
use crate::object_store::{ObjectInfo, ObjectStore};
use crate::origin::{FetchedMedia, OriginFetcher};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

pub const PUBLIC_BASE: &str = "https://media.test";

/// Object store keeping uploads in a map keyed by public URL.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<String, (Bytes, String)>>,
    puts: AtomicUsize,
    /// Remaining `put` calls that fail
    failing_puts: AtomicUsize,
}

impl MemoryObjectStore {
    pub fn failing(times: usize) -> Self {
        let store = Self::default();
        store.failing_puts.store(times, Ordering::SeqCst);
        store
    }

    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn object(&self, url: &str) -> Option<Bytes> {
        self.objects.lock().get(url).map(|(body, _)| body.clone())
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &str, body: Bytes, content_type: &str) -> PipelineResult<String> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        if self
            .failing_puts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(PipelineError::TransientIo("storage unavailable".into()));
        }

        let url = format!("{PUBLIC_BASE}/{key}");
        self.objects
            .lock()
            .insert(url.clone(), (body, content_type.to_string()));
        Ok(url)
    }

    async fn head(&self, public_url: &str) -> PipelineResult<Option<ObjectInfo>> {
        Ok(self
            .objects
            .lock()
            .get(public_url)
            .map(|(body, content_type)| ObjectInfo {
                size: body.len() as u64,
                content_type: Some(content_type.clone()),
            }))
    }
}

/// Origin serving a fixed payload, optionally slow or failing.
pub struct FakeOrigin {
    body: Bytes,
    delay: Duration,
    /// HTTP status returned instead of the payload
    status: Option<u16>,
    fetches: AtomicUsize,
}

impl FakeOrigin {
    pub fn serving(body: &'static [u8]) -> Self {
        Self {
            body: Bytes::from_static(body),
            delay: Duration::ZERO,
            status: None,
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn failing_with(status: u16) -> Self {
        Self {
            status: Some(status),
            ..Self::serving(b"")
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OriginFetcher for FakeOrigin {
    async fn fetch(&self, _url: &str) -> PipelineResult<FetchedMedia> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        match self.status {
            Some(code) => Err(PipelineError::TransientIo(format!(
                "Origin returned HTTP {code}"
            ))),
            None => Ok(FetchedMedia {
                body: self.body.clone(),
                content_type: "video/mp4".to_string(),
            }),
        }
    }
}

/// Distributed tier backed by a map, optionally delayed on every call.
#[derive(Default)]
pub struct FakeDistributedTier {
    entries: Mutex<HashMap<String, Bytes>>,
    published: Mutex<Vec<String>>,
    delay: Duration,
    set_delay: Duration,
}

impl FakeDistributedTier {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    /// Only writes are slow; reads and deletes answer at once.
    pub fn with_set_delay(set_delay: Duration) -> Self {
        Self {
            set_delay,
            ..Self::default()
        }
    }

    pub fn insert(&self, key: &str, value: Vec<u8>) {
        self.entries.lock().insert(key.to_string(), Bytes::from(value));
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.lock().contains_key(key)
    }

    pub fn published(&self) -> Vec<String> {
        self.published.lock().clone()
    }

    async fn pause(&self) {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
    }
}

#[async_trait]
impl DistributedTier for FakeDistributedTier {
    async fn get(&self, key: &str) -> PipelineResult<Option<(Bytes, Option<Duration>)>> {
        self.pause().await;
        Ok(self.entries.lock().get(key).map(|v| (v.clone(), None)))
    }

    async fn set(&self, key: &str, value: Bytes, _ttl: Duration) -> PipelineResult<()> {
        self.pause().await;
        if !self.set_delay.is_zero() {
            tokio::time::sleep(self.set_delay).await;
        }
        self.entries.lock().insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> PipelineResult<()> {
        self.pause().await;
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn publish_invalidation(&self, key: &str) -> PipelineResult<()> {
        self.published.lock().push(key.to_string());
        Ok(())
    }
}

/// Distributed tier whose every call fails like a refused connection.
pub struct UnreachableTier;

#[async_trait]
impl DistributedTier for UnreachableTier {
    async fn get(&self, _key: &str) -> PipelineResult<Option<(Bytes, Option<Duration>)>> {
        Err(PipelineError::TransientIo("connection refused".into()))
    }

    async fn set(&self, _key: &str, _value: Bytes, _ttl: Duration) -> PipelineResult<()> {
        Err(PipelineError::TransientIo("connection refused".into()))
    }

    async fn delete(&self, _key: &str) -> PipelineResult<()> {
        Err(PipelineError::TransientIo("connection refused".into()))
    }
}

/// Frame extractor returning a fixed JPEG payload.
pub struct StaticFrame;

#[async_trait]
impl crate::thumbnail::FrameExtractor for StaticFrame {
    async fn extract_frame(&self, _source_url: &str) -> PipelineResult<Bytes> {
        Ok(Bytes::from_static(b"\xff\xd8\xff\xe0jpeg"))
    }
}

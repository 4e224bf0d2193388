//! Trigger dispatcher: turns asset events into fire-and-forget calls to the
//! migration and thumbnail operations.
//!
//! Producers only ever `try_send` into a bounded queue, so the mutation that
//! raised an event never waits on the work it triggers. Delivery is
//! at-least-once at best; a periodic [`Reconciler`] sweep re-triggers anything
//! an overloaded queue or failed call left behind.

use crate::api::{DeriveRequest, DeriveResponse, MigrateRequest, MigrateResponse};
use crate::asset::{asset_cache_key, ArtifactKind, AssetRepository, MigrationState};
use crate::cache::TieredCache;
use crate::config::{DispatcherConfig, Tunables};
use crate::error::{with_timeout, PipelineError, PipelineResult};
use crate::migration::MediaMigrator;
use crate::thumbnail::ThumbnailGenerator;
use async_trait::async_trait;
use backoff::{backoff::Backoff, ExponentialBackoff};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// A qualifying state transition. The JSON form matches the payload the
/// database trigger sends with `pg_notify`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AssetEvent {
    /// Generation finished; the asset should be migrated.
    GenerationCompleted { asset_id: Uuid, origin_url: String },
    /// Migration finished; the asset's thumbnail should be derived.
    MigrationCompleted { asset_id: Uuid },
}

impl AssetEvent {
    pub fn asset_id(&self) -> Uuid {
        match self {
            Self::GenerationCompleted { asset_id, .. } | Self::MigrationCompleted { asset_id } => {
                *asset_id
            }
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::GenerationCompleted { .. } => "generation_completed",
            Self::MigrationCompleted { .. } => "migration_completed",
        }
    }
}

/// Cheap, cloneable sender side of the dispatcher queue.
#[derive(Clone)]
pub struct DispatcherHandle {
    tx: mpsc::Sender<AssetEvent>,
}

impl DispatcherHandle {
    /// Enqueue `event` without waiting. Returns false when it was dropped.
    pub fn notify(&self, event: AssetEvent) -> bool {
        metrics::counter!("dispatcher.events.received", "event" => event.kind()).increment(1);

        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                warn!(
                    asset_id = %event.asset_id(),
                    event = event.kind(),
                    "Dispatcher queue full, dropping event"
                );
                metrics::counter!("dispatcher.events.dropped", "reason" => "full").increment(1);
                false
            }
            Err(TrySendError::Closed(event)) => {
                warn!(
                    asset_id = %event.asset_id(),
                    event = event.kind(),
                    "Dispatcher stopped, dropping event"
                );
                metrics::counter!("dispatcher.events.dropped", "reason" => "closed").increment(1);
                false
            }
        }
    }
}

/// Where triggered calls go.
#[async_trait]
pub trait TriggerTarget: Send + Sync {
    async fn migrate(&self, asset_id: Uuid, origin_url: &str) -> PipelineResult<()>;

    async fn derive_thumbnail(&self, asset_id: Uuid) -> PipelineResult<()>;
}

/// Calls the operations in-process.
pub struct LocalTarget {
    migrator: Arc<MediaMigrator>,
    generator: Arc<ThumbnailGenerator>,
}

impl LocalTarget {
    pub fn new(migrator: Arc<MediaMigrator>, generator: Arc<ThumbnailGenerator>) -> Self {
        Self {
            migrator,
            generator,
        }
    }
}

#[async_trait]
impl TriggerTarget for LocalTarget {
    async fn migrate(&self, asset_id: Uuid, origin_url: &str) -> PipelineResult<()> {
        self.migrator.migrate(asset_id, Some(origin_url)).await.map(|_| ())
    }

    async fn derive_thumbnail(&self, asset_id: Uuid) -> PipelineResult<()> {
        self.generator
            .derive_thumbnail(asset_id, false)
            .await
            .map(|_| ())
    }
}

/// Calls the trigger endpoints of a (possibly remote) pipeline over HTTP.
pub struct HttpTarget {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTarget {
    pub fn new(base_url: &str, timeout: Duration) -> PipelineResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl TriggerTarget for HttpTarget {
    async fn migrate(&self, asset_id: Uuid, origin_url: &str) -> PipelineResult<()> {
        let response: MigrateResponse = self
            .client
            .post(format!("{}/migrate", self.base_url))
            .json(&MigrateRequest {
                asset_id,
                origin_url: Some(origin_url.to_string()),
            })
            .send()
            .await?
            .json()
            .await?;

        if response.success {
            Ok(())
        } else {
            Err(PipelineError::TransientIo(
                response.error.unwrap_or_else(|| "migrate call failed".into()),
            ))
        }
    }

    async fn derive_thumbnail(&self, asset_id: Uuid) -> PipelineResult<()> {
        let response: DeriveResponse = self
            .client
            .post(format!("{}/derive-thumbnail", self.base_url))
            .json(&DeriveRequest {
                asset_id,
                force_regenerate: false,
            })
            .send()
            .await?
            .json()
            .await?;

        if response.success {
            Ok(())
        } else {
            Err(PipelineError::TransientIo(
                response
                    .error
                    .unwrap_or_else(|| "derive-thumbnail call failed".into()),
            ))
        }
    }
}

/// Consumes the event queue and runs triggered calls with bounded concurrency.
pub struct TriggerDispatcher {
    rx: mpsc::Receiver<AssetEvent>,
    target: Arc<dyn TriggerTarget>,
    permits: Arc<Semaphore>,
    call_timeout: Duration,
}

impl TriggerDispatcher {
    /// Create the bounded queue shared by producers and the dispatcher.
    pub fn channel(capacity: usize) -> (DispatcherHandle, mpsc::Receiver<AssetEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (DispatcherHandle { tx }, rx)
    }

    pub fn new(
        rx: mpsc::Receiver<AssetEvent>,
        target: Arc<dyn TriggerTarget>,
        config: &DispatcherConfig,
    ) -> Self {
        Self {
            rx,
            target,
            permits: Arc::new(Semaphore::new(config.concurrency.max(1))),
            call_timeout: config.call_timeout(),
        }
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        info!("Trigger dispatcher started");

        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = self.rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            let Ok(permit) = self.permits.clone().acquire_owned().await else {
                break;
            };
            let target = self.target.clone();
            let limit = self.call_timeout;

            tokio::spawn(async move {
                let _permit = permit;
                dispatch(target.as_ref(), event, limit).await;
            });
        }

        info!("Trigger dispatcher stopped");
    }
}

async fn dispatch(target: &dyn TriggerTarget, event: AssetEvent, limit: Duration) {
    debug!(asset_id = %event.asset_id(), event = event.kind(), "Dispatching");

    let result = match &event {
        AssetEvent::GenerationCompleted {
            asset_id,
            origin_url,
        } => with_timeout(limit, target.migrate(*asset_id, origin_url)).await,
        AssetEvent::MigrationCompleted { asset_id } => {
            with_timeout(limit, target.derive_thumbnail(*asset_id)).await
        }
    };

    if let Err(e) = result {
        warn!(
            asset_id = %event.asset_id(),
            event = event.kind(),
            code = e.code(),
            error = %e,
            "Triggered call failed"
        );
        metrics::counter!("dispatcher.calls.failed", "event" => event.kind()).increment(1);
    }
}

/// Feeds `NOTIFY` payloads from Postgres into the dispatcher.
pub struct PgEventSource {
    pool: PgPool,
    channel: String,
}

impl PgEventSource {
    pub fn new(pool: PgPool, channel: impl Into<String>) -> Self {
        Self {
            pool,
            channel: channel.into(),
        }
    }

    /// Listen until `shutdown`, reconnecting with exponential backoff.
    pub async fn run(self, handle: DispatcherHandle, shutdown: CancellationToken) {
        let mut backoff = ExponentialBackoff {
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(60),
            max_elapsed_time: None,
            ..Default::default()
        };

        loop {
            let result = tokio::select! {
                _ = shutdown.cancelled() => return,
                result = self.listen(&handle, &mut backoff) => result,
            };

            if let Err(e) = result {
                let delay = backoff.next_backoff().unwrap_or(backoff.max_interval);
                error!(
                    channel = %self.channel,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "Asset event listener failed, reconnecting"
                );
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    async fn listen(
        &self,
        handle: &DispatcherHandle,
        backoff: &mut ExponentialBackoff,
    ) -> Result<(), sqlx::Error> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(&self.channel).await?;
        backoff.reset();
        info!(channel = %self.channel, "Listening for asset events");

        loop {
            let notification = listener.recv().await?;
            match serde_json::from_str::<AssetEvent>(notification.payload()) {
                Ok(event) => {
                    handle.notify(event);
                }
                Err(e) => warn!(
                    payload = notification.payload(),
                    error = %e,
                    "Ignoring malformed asset event"
                ),
            }
        }
    }
}

/// What one reconciliation pass did
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// In-flight assets that stopped making progress and were failed
    pub expired: usize,
    /// Migrations re-triggered
    pub migrations: usize,
    /// Failed assets whose attempts already exceed a lowered budget
    pub retired: usize,
    /// Thumbnail derivations re-triggered
    pub thumbnails: usize,
}

/// Periodic sweep that re-triggers work the event path lost.
pub struct Reconciler {
    repo: Arc<dyn AssetRepository>,
    cache: Arc<TieredCache>,
    handle: DispatcherHandle,
    config: DispatcherConfig,
    tunables: watch::Receiver<Tunables>,
}

impl Reconciler {
    pub fn new(
        repo: Arc<dyn AssetRepository>,
        cache: Arc<TieredCache>,
        handle: DispatcherHandle,
        config: DispatcherConfig,
        tunables: watch::Receiver<Tunables>,
    ) -> Self {
        Self {
            repo,
            cache,
            handle,
            config,
            tunables,
        }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.config.sweep_interval_secs.max(1)));

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.sweep(Utc::now()).await {
                Ok(report) if report != SweepReport::default() => {
                    info!(?report, "Reconciliation sweep re-triggered work")
                }
                Ok(_) => debug!("Reconciliation sweep found nothing to do"),
                Err(e) => error!(error = %e, "Reconciliation sweep failed"),
            }
        }
    }

    /// One pass. `PermanentlyFailed` assets are never selected.
    pub async fn sweep(&self, now: DateTime<Utc>) -> PipelineResult<SweepReport> {
        let mut report = SweepReport::default();
        let stale_after = chrono::Duration::from_std(self.config.stale_after())
            .map_err(|e| PipelineError::InvalidInput(format!("stale_after out of range: {e}")))?;
        let stale_cutoff = now - stale_after;
        let batch = self.config.sweep_batch;
        let max_attempts = self.tunables.borrow().max_migration_attempts;

        for state in [MigrationState::Downloading, MigrationState::Uploading] {
            for asset in self.repo.list_by_state(state, stale_cutoff, batch).await? {
                let Some(claim) = asset.claim_id else {
                    warn!(asset_id = %asset.id, %state, "In-flight asset has no claim, skipping");
                    continue;
                };
                let next = self
                    .repo
                    .record_failure(asset.id, claim, max_attempts, &format!("stalled in {state}"))
                    .await?;
                if next == MigrationState::PermanentlyFailed {
                    self.cache.invalidate(&asset_cache_key(asset.id)).await;
                }
                // Re-triggered by a later pass once its backoff has elapsed.
                warn!(asset_id = %asset.id, %state, %next, "Expired stalled migration");
                report.expired += 1;
            }
        }

        for asset in self
            .repo
            .list_by_state(MigrationState::Pending, stale_cutoff, batch)
            .await?
        {
            self.retrigger_migration(asset.id, &asset.origin_url, &mut report);
        }

        for asset in self
            .repo
            .list_by_state(MigrationState::Failed, now, batch)
            .await?
        {
            if asset.attempt_count >= max_attempts {
                if self.repo.retire_exhausted(asset.id, max_attempts).await? {
                    self.cache.invalidate(&asset_cache_key(asset.id)).await;
                    warn!(
                        asset_id = %asset.id,
                        attempts = asset.attempt_count,
                        max_attempts,
                        "Retired failed asset past its attempt budget"
                    );
                    report.retired += 1;
                }
                continue;
            }
            let last = asset.last_attempt_at.unwrap_or(asset.updated_at);
            if self.retry_due(asset.attempt_count, last, now) {
                self.retrigger_migration(asset.id, &asset.origin_url, &mut report);
            }
        }

        for asset_id in self
            .repo
            .list_missing_artifacts(
                ArtifactKind::Thumbnail,
                stale_cutoff,
                self.config.max_derivation_failures,
                batch,
            )
            .await?
        {
            if self.handle.notify(AssetEvent::MigrationCompleted { asset_id }) {
                report.thumbnails += 1;
            }
        }

        Ok(report)
    }

    /// Whether a failed asset's backoff, `retry_base · 2^(attempts-1)`, has elapsed.
    fn retry_due(&self, attempts: i32, last_attempt: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now - last_attempt >= retry_delay(self.config.retry_base_secs, attempts)
    }

    fn retrigger_migration(&self, asset_id: Uuid, origin_url: &str, report: &mut SweepReport) {
        let event = AssetEvent::GenerationCompleted {
            asset_id,
            origin_url: origin_url.to_string(),
        };
        if self.handle.notify(event) {
            report.migrations += 1;
        }
    }
}

fn retry_delay(base_secs: u64, attempts: i32) -> chrono::Duration {
    let exponent = (attempts - 1).clamp(0, 16) as u32;
    chrono::Duration::seconds(base_secs.saturating_mul(1 << exponent) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::{DerivedArtifact, MediaAsset, MemoryAssetStore, SOURCE_OWNED_STORAGE};
    use crate::cache::{MemoryTier, TierTtls};
    use crate::config::ThumbnailConfig;
    use crate::testing::MemoryObjectStore;
    use crate::thumbnail::MockFrameExtractor;
    use parking_lot::Mutex;

    #[test]
    fn test_event_matches_notify_payload() {
        let id = Uuid::new_v4();
        let payload = format!(
            r#"{{"event":"generation_completed","asset_id":"{id}","origin_url":"https://x/video.mp4"}}"#
        );
        let event: AssetEvent = serde_json::from_str(&payload).unwrap();
        assert_eq!(
            event,
            AssetEvent::GenerationCompleted {
                asset_id: id,
                origin_url: "https://x/video.mp4".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_notify_never_blocks_when_full() {
        let (handle, mut rx) = TriggerDispatcher::channel(1);
        let id = Uuid::new_v4();

        assert!(handle.notify(AssetEvent::MigrationCompleted { asset_id: id }));
        assert!(!handle.notify(AssetEvent::MigrationCompleted { asset_id: id }));
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[derive(Default)]
    struct RecordingTarget {
        calls: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl TriggerTarget for RecordingTarget {
        async fn migrate(&self, asset_id: Uuid, _origin_url: &str) -> PipelineResult<()> {
            self.calls.lock().push(format!("migrate:{asset_id}"));
            if self.fail {
                return Err(PipelineError::TransientIo("unreachable".into()));
            }
            Ok(())
        }

        async fn derive_thumbnail(&self, asset_id: Uuid) -> PipelineResult<()> {
            self.calls.lock().push(format!("derive:{asset_id}"));
            Ok(())
        }
    }

    async fn run_dispatcher(target: Arc<RecordingTarget>, events: Vec<AssetEvent>) {
        let (handle, rx) = TriggerDispatcher::channel(16);
        let shutdown = CancellationToken::new();
        let dispatcher = TriggerDispatcher::new(rx, target, &DispatcherConfig::default());
        let task = tokio::spawn(dispatcher.run(shutdown.clone()));

        for event in events {
            handle.notify(event);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_dispatcher_routes_events() {
        let target = Arc::new(RecordingTarget::default());
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        run_dispatcher(
            target.clone(),
            vec![
                AssetEvent::GenerationCompleted {
                    asset_id: a,
                    origin_url: "https://x/a.mp4".into(),
                },
                AssetEvent::MigrationCompleted { asset_id: b },
            ],
        )
        .await;

        let mut calls = target.calls.lock().clone();
        calls.sort();
        let mut expected = vec![format!("migrate:{a}"), format!("derive:{b}")];
        expected.sort();
        assert_eq!(calls, expected);
    }

    #[tokio::test]
    async fn test_failed_calls_do_not_stop_dispatcher() {
        let target = Arc::new(RecordingTarget {
            fail: true,
            ..Default::default()
        });
        let events = (0..3)
            .map(|_| AssetEvent::GenerationCompleted {
                asset_id: Uuid::new_v4(),
                origin_url: "https://x/a.mp4".into(),
            })
            .collect();

        run_dispatcher(target.clone(), events).await;
        assert_eq!(target.calls.lock().len(), 3);
    }

    fn aged(state: MigrationState, age: chrono::Duration, attempts: i32) -> MediaAsset {
        let mut asset = MediaAsset::new(Uuid::new_v4(), "https://x/video.mp4");
        let at = Utc::now() - age;
        asset.migration_state = state;
        asset.claim_id = state.is_in_flight().then(Uuid::new_v4);
        asset.attempt_count = attempts;
        asset.updated_at = at;
        asset.last_attempt_at = (attempts > 0).then_some(at);
        asset
    }

    fn drain(rx: &mut mpsc::Receiver<AssetEvent>) -> Vec<AssetEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn cache() -> Arc<TieredCache> {
        let ttl = Duration::from_secs(60);
        Arc::new(TieredCache::new(
            MemoryTier::new(10),
            None,
            None,
            TierTtls { l1: ttl, l2: ttl, l3: ttl },
        ))
    }

    fn reconciler_with(
        repo: Arc<MemoryAssetStore>,
        cache: Arc<TieredCache>,
        max_attempts: i32,
    ) -> (Reconciler, mpsc::Receiver<AssetEvent>) {
        let (handle, rx) = TriggerDispatcher::channel(64);
        let config = DispatcherConfig {
            stale_after_secs: 600,
            retry_base_secs: 30,
            ..DispatcherConfig::default()
        };
        let tunables = Tunables {
            max_migration_attempts: max_attempts,
            ..Tunables::default()
        };
        let reconciler = Reconciler::new(repo, cache, handle, config, tunables.fixed());
        (reconciler, rx)
    }

    fn reconciler(repo: Arc<MemoryAssetStore>) -> (Reconciler, mpsc::Receiver<AssetEvent>) {
        reconciler_with(repo, cache(), Tunables::default().max_migration_attempts)
    }

    #[tokio::test]
    async fn test_sweep_retriggers_stuck_work() {
        let repo = Arc::new(MemoryAssetStore::new());
        let hour = chrono::Duration::hours(1);

        let stalled = aged(MigrationState::Downloading, hour, 0);
        let pending = aged(MigrationState::Pending, hour, 0);
        let fresh_pending = aged(MigrationState::Pending, chrono::Duration::seconds(5), 0);
        let failed_due = aged(MigrationState::Failed, hour, 1);
        let failed_recent = aged(MigrationState::Failed, chrono::Duration::seconds(5), 1);
        let dead = aged(MigrationState::PermanentlyFailed, hour * 24, 5);
        for asset in [&stalled, &pending, &fresh_pending, &failed_due, &failed_recent, &dead] {
            repo.insert(asset.clone());
        }

        let (reconciler, mut rx) = reconciler(repo.clone());
        let report = reconciler.sweep(Utc::now()).await.unwrap();

        assert_eq!(report.expired, 1);
        let retriggered: Vec<Uuid> = drain(&mut rx).iter().map(AssetEvent::asset_id).collect();
        assert!(retriggered.contains(&pending.id));
        assert!(retriggered.contains(&failed_due.id));
        assert!(!retriggered.contains(&fresh_pending.id));
        assert!(!retriggered.contains(&failed_recent.id));
        assert!(!retriggered.contains(&dead.id));

        let stalled_now = repo.get(stalled.id).await.unwrap().unwrap();
        assert_eq!(stalled_now.migration_state, MigrationState::Failed);
        assert_eq!(stalled_now.attempt_count, 1);
    }

    #[tokio::test]
    async fn test_sweep_retriggers_missing_thumbnails() {
        let repo = Arc::new(MemoryAssetStore::new());
        let mut done = aged(MigrationState::Completed, chrono::Duration::hours(1), 1);
        done.uploaded_at = Some(done.updated_at);
        let mut with_thumb = done.clone();
        with_thumb.id = Uuid::new_v4();
        repo.insert(done.clone());
        repo.insert(with_thumb.clone());
        repo.upsert_artifact(&DerivedArtifact {
            asset_id: with_thumb.id,
            kind: ArtifactKind::Thumbnail,
            url: "https://media.test/thumbnails/x.jpg".into(),
            storage_key: "thumbnails/x.jpg".into(),
            generated_at: Utc::now(),
            source_tier: SOURCE_OWNED_STORAGE.into(),
        })
        .await
        .unwrap();

        let (reconciler, mut rx) = reconciler(repo);
        let report = reconciler.sweep(Utc::now()).await.unwrap();

        assert_eq!(report.thumbnails, 1);
        assert_eq!(
            drain(&mut rx),
            vec![AssetEvent::MigrationCompleted { asset_id: done.id }]
        );
    }

    #[tokio::test]
    async fn test_undecodable_thumbnail_is_not_retriggered_forever() {
        let repo = Arc::new(MemoryAssetStore::new());
        let mut done = aged(MigrationState::Completed, chrono::Duration::hours(1), 1);
        done.uploaded_at = Some(done.updated_at);
        done.owned_url = Some("https://media.test/videos/a.mp4".into());
        repo.insert(done.clone());

        let mut extractor = MockFrameExtractor::new();
        extractor
            .expect_extract_frame()
            .times(1)
            .returning(|_| Err(PipelineError::InvalidInput("undecodable video".into())));
        let generator = ThumbnailGenerator::new(
            repo.clone(),
            Arc::new(MemoryObjectStore::default()),
            Arc::new(extractor),
            cache(),
            ThumbnailConfig::default(),
            Tunables::default().fixed(),
        );
        let (reconciler, mut rx) = reconciler(repo);

        let mut triggered = 0;
        for _ in 0..3 {
            for event in drain(&mut rx) {
                let _ = generator.derive_thumbnail(event.asset_id(), false).await;
            }
            triggered += reconciler.sweep(Utc::now()).await.unwrap().thumbnails;
        }
        for event in drain(&mut rx) {
            let _ = generator.derive_thumbnail(event.asset_id(), false).await;
        }

        assert_eq!(triggered, 1);
    }

    #[tokio::test]
    async fn test_transient_thumbnail_failures_stop_at_budget() {
        let repo = Arc::new(MemoryAssetStore::new());
        let mut done = aged(MigrationState::Completed, chrono::Duration::hours(1), 1);
        done.uploaded_at = Some(done.updated_at);
        repo.insert(done.clone());
        let (reconciler, mut rx) = reconciler(repo.clone());

        let budget = DispatcherConfig::default().max_derivation_failures;
        for _ in 0..budget {
            assert_eq!(reconciler.sweep(Utc::now()).await.unwrap().thumbnails, 1);
            drain(&mut rx);
            repo.record_derivation_failure(done.id, ArtifactKind::Thumbnail, "timeout", false)
                .await
                .unwrap();
        }
        assert_eq!(reconciler.sweep(Utc::now()).await.unwrap().thumbnails, 0);
    }

    #[tokio::test]
    async fn test_expiry_into_permanent_failure_invalidates_cache() {
        let repo = Arc::new(MemoryAssetStore::new());
        let cache = cache();
        let stalled = aged(MigrationState::Uploading, chrono::Duration::hours(1), 2);
        repo.insert(stalled.clone());
        let key = asset_cache_key(stalled.id);
        cache.set(&key, &"processing view", Duration::from_secs(60)).await;

        let (reconciler, _rx) = reconciler_with(repo.clone(), cache.clone(), 3);
        let report = reconciler.sweep(Utc::now()).await.unwrap();

        assert_eq!(report.expired, 1);
        let asset = repo.get(stalled.id).await.unwrap().unwrap();
        assert_eq!(asset.migration_state, MigrationState::PermanentlyFailed);
        assert_eq!(cache.get::<String>(&key).await, None);
    }

    #[tokio::test]
    async fn test_sweep_retires_failed_assets_past_lowered_budget() {
        let repo = Arc::new(MemoryAssetStore::new());
        let cache = cache();
        let exhausted = aged(MigrationState::Failed, chrono::Duration::hours(1), 3);
        repo.insert(exhausted.clone());
        let key = asset_cache_key(exhausted.id);
        cache.set(&key, &"retrying view", Duration::from_secs(60)).await;

        let (reconciler, mut rx) = reconciler_with(repo.clone(), cache.clone(), 2);
        let report = reconciler.sweep(Utc::now()).await.unwrap();

        assert_eq!(report.retired, 1);
        assert_eq!(report.migrations, 0);
        assert!(drain(&mut rx).is_empty());
        let asset = repo.get(exhausted.id).await.unwrap().unwrap();
        assert_eq!(asset.migration_state, MigrationState::PermanentlyFailed);
        assert_eq!(cache.get::<String>(&key).await, None);

        // Once retired it is never selected again.
        assert_eq!(reconciler.sweep(Utc::now()).await.unwrap(), SweepReport::default());
    }

    #[test]
    fn test_retry_delay_doubles_per_attempt() {
        assert_eq!(retry_delay(30, 1), chrono::Duration::seconds(30));
        assert_eq!(retry_delay(30, 3), chrono::Duration::seconds(120));
        assert_eq!(retry_delay(30, 0), chrono::Duration::seconds(30));
    }
}

//! Media migration: origin URL → owned object storage.
//!
//! ```text
//! Pending ──claim──► Downloading ──► Uploading ──► Completed
//!    ▲                    │               │
//!    │                    └──── Failed ◄──┘
//!    └─── requeue ───────────── │
//!                               └──(attempts ≥ max)──► PermanentlyFailed
//! ```
//!
//! Only the worker whose conditional claim succeeded performs I/O for an
//! asset. Every write of that attempt carries the claim token, so a worker
//! whose claim was expired cannot move the asset afterwards. Other callers
//! wait for the owner to settle and return the state it left behind.

use crate::asset::{asset_cache_key, AssetRepository, MediaAsset, MigrationState};
use crate::cache::TieredCache;
use crate::config::{MigrationConfig, Tunables};
use crate::dispatcher::{AssetEvent, DispatcherHandle};
use crate::error::{with_timeout, PipelineError, PipelineResult};
use crate::object_store::{video_key, ObjectStore};
use crate::origin::OriginFetcher;
use backoff::{backoff::Backoff, ExponentialBackoff};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

const SETTLE_POLL_INITIAL: Duration = Duration::from_millis(25);
const SETTLE_POLL_MAX: Duration = Duration::from_secs(1);

/// Result of a `migrate` call that did not fail
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationOutcome {
    pub asset_id: Uuid,
    pub state: MigrationState,
    /// Set once the asset is `Completed`
    pub owned_url: Option<String>,
    /// Whether this call performed the download and upload
    pub performed: bool,
}

impl MigrationOutcome {
    fn observed(asset: &MediaAsset) -> Self {
        Self {
            asset_id: asset.id,
            state: asset.migration_state,
            owned_url: asset.durable_url().map(str::to_string),
            performed: false,
        }
    }
}

pub struct MediaMigrator {
    repo: Arc<dyn AssetRepository>,
    origin: Arc<dyn OriginFetcher>,
    object_store: Arc<dyn ObjectStore>,
    cache: Arc<TieredCache>,
    config: MigrationConfig,
    tunables: watch::Receiver<Tunables>,
    on_complete: Option<DispatcherHandle>,
}

impl MediaMigrator {
    pub fn new(
        repo: Arc<dyn AssetRepository>,
        origin: Arc<dyn OriginFetcher>,
        object_store: Arc<dyn ObjectStore>,
        cache: Arc<TieredCache>,
        config: MigrationConfig,
        tunables: watch::Receiver<Tunables>,
    ) -> Self {
        Self {
            repo,
            origin,
            object_store,
            cache,
            config,
            tunables,
            on_complete: None,
        }
    }

    /// Announce completed migrations on `handle` so derivation can follow.
    pub fn with_dispatcher(mut self, handle: DispatcherHandle) -> Self {
        self.on_complete = Some(handle);
        self
    }

    /// Move `asset_id` into owned storage.
    ///
    /// `origin_url` is required only for assets the repository has not seen.
    /// Idempotent: a completed asset returns its owned URL without I/O, and a
    /// call that loses the claim returns the state the winner left behind.
    #[instrument(skip(self, origin_url), fields(asset_id = %asset_id))]
    pub async fn migrate(
        &self,
        asset_id: Uuid,
        origin_url: Option<&str>,
    ) -> PipelineResult<MigrationOutcome> {
        let asset = match self.repo.get(asset_id).await? {
            Some(asset) => asset,
            None => {
                let url = origin_url.ok_or_else(|| {
                    PipelineError::InvalidInput(format!(
                        "origin URL required for unknown asset {asset_id}"
                    ))
                })?;
                self.repo.register(asset_id, url).await?
            }
        };

        match asset.migration_state {
            MigrationState::Completed => {
                debug!("Asset already migrated");
                metrics::counter!("migration.skipped").increment(1);
                return Ok(MigrationOutcome::observed(&asset));
            }
            MigrationState::PermanentlyFailed => {
                return Err(PipelineError::PermanentFailure {
                    asset_id,
                    attempts: asset.attempt_count,
                });
            }
            _ => {}
        }

        let max_attempts = self.tunables.borrow().max_migration_attempts;
        let Some(claim) = self.repo.claim(asset_id, max_attempts).await? else {
            metrics::counter!("migration.skipped").increment(1);
            return self.observe_owner(asset_id, max_attempts).await;
        };

        info!(origin_url = %asset.origin_url, "Migration started");
        metrics::counter!("migration.started").increment(1);
        let started = Instant::now();

        match self.transfer(&asset, claim).await {
            Ok((owned_url, storage_key)) => {
                self.finish(asset_id, claim, &owned_url, &storage_key, started)
                    .await
            }
            Err(e) => self.fail(asset_id, claim, max_attempts, e).await,
        }
    }

    /// The claim went to someone else or was refused. Wait while another worker
    /// holds the asset, then report what it left behind.
    async fn observe_owner(
        &self,
        asset_id: Uuid,
        max_attempts: i32,
    ) -> PipelineResult<MigrationOutcome> {
        let current = self.await_settled(asset_id).await?;

        if current.migration_state.is_claimable() && current.attempt_count >= max_attempts {
            // The budget shrank below the attempts already spent.
            if self.repo.retire_exhausted(asset_id, max_attempts).await? {
                warn!(
                    attempts = current.attempt_count,
                    max_attempts, "Retired asset with exhausted attempt budget"
                );
                metrics::counter!("migration.permanently_failed").increment(1);
                self.cache.invalidate(&asset_cache_key(asset_id)).await;
            }
            return Err(PipelineError::PermanentFailure {
                asset_id,
                attempts: current.attempt_count,
            });
        }

        if current.migration_state == MigrationState::PermanentlyFailed {
            return Err(PipelineError::PermanentFailure {
                asset_id,
                attempts: current.attempt_count,
            });
        }

        debug!(state = %current.migration_state, "Claim not acquired, observed owner result");
        Ok(MigrationOutcome::observed(&current))
    }

    /// Poll the asset until it leaves the in-flight states or the longest an
    /// owner may legitimately hold it has passed.
    async fn await_settled(&self, asset_id: Uuid) -> PipelineResult<MediaAsset> {
        let mut backoff = ExponentialBackoff {
            initial_interval: SETTLE_POLL_INITIAL,
            max_interval: SETTLE_POLL_MAX,
            max_elapsed_time: Some(self.config.download_timeout() + 2 * self.config.upload_timeout()),
            ..Default::default()
        };

        loop {
            let current = self
                .repo
                .get(asset_id)
                .await?
                .ok_or(PipelineError::NotFound(asset_id))?;
            if !current.migration_state.is_in_flight() {
                return Ok(current);
            }
            match backoff.next_backoff() {
                Some(delay) => tokio::time::sleep(delay).await,
                None => {
                    debug!(state = %current.migration_state, "Owner still in flight, returning current state");
                    return Ok(current);
                }
            }
        }
    }

    /// Download from the origin and upload under the asset's deterministic key.
    async fn transfer(&self, asset: &MediaAsset, claim: Uuid) -> PipelineResult<(String, String)> {
        let media = with_timeout(
            self.config.download_timeout(),
            self.origin.fetch(&asset.origin_url),
        )
        .await?;

        if !self
            .repo
            .transition(
                asset.id,
                claim,
                MigrationState::Downloading,
                MigrationState::Uploading,
            )
            .await?
        {
            return Err(PipelineError::Storage(
                "claim lost while the download was in progress".into(),
            ));
        }

        let key = video_key(asset.id, &media.content_type);
        let expected_size = media.body.len() as u64;
        let upload_timeout = self.config.upload_timeout();

        let owned_url = with_timeout(
            upload_timeout,
            self.object_store.put(&key, media.body, &media.content_type),
        )
        .await?;

        match with_timeout(upload_timeout, self.object_store.head(&owned_url)).await? {
            Some(info) if info.size == expected_size => {}
            Some(info) => {
                return Err(PipelineError::TransientIo(format!(
                    "uploaded object has {} bytes, expected {expected_size}",
                    info.size
                )))
            }
            None => {
                return Err(PipelineError::TransientIo(
                    "uploaded object not found on verification".into(),
                ))
            }
        }

        Ok((owned_url, key))
    }

    async fn finish(
        &self,
        asset_id: Uuid,
        claim: Uuid,
        owned_url: &str,
        storage_key: &str,
        started: Instant,
    ) -> PipelineResult<MigrationOutcome> {
        if !self
            .repo
            .complete(asset_id, claim, owned_url, storage_key)
            .await?
        {
            warn!("Asset changed state before completion could be recorded");
            let current = self
                .repo
                .get(asset_id)
                .await?
                .ok_or(PipelineError::NotFound(asset_id))?;
            return Ok(MigrationOutcome::observed(&current));
        }

        self.cache.invalidate(&asset_cache_key(asset_id)).await;
        if let Some(handle) = &self.on_complete {
            handle.notify(AssetEvent::MigrationCompleted { asset_id });
        }

        let elapsed = started.elapsed();
        metrics::counter!("migration.completed").increment(1);
        metrics::histogram!("migration.duration_seconds").record(elapsed.as_secs_f64());
        info!(
            owned_url = %owned_url,
            duration_ms = elapsed.as_millis() as u64,
            "Migration completed"
        );

        Ok(MigrationOutcome {
            asset_id,
            state: MigrationState::Completed,
            owned_url: Some(owned_url.to_string()),
            performed: true,
        })
    }

    async fn fail(
        &self,
        asset_id: Uuid,
        claim: Uuid,
        max_attempts: i32,
        cause: PipelineError,
    ) -> PipelineResult<MigrationOutcome> {
        let state = self
            .repo
            .record_failure(asset_id, claim, max_attempts, &cause.to_string())
            .await?;

        if state == MigrationState::PermanentlyFailed {
            error!(error = %cause, max_attempts, "Migration permanently failed");
            metrics::counter!("migration.permanently_failed").increment(1);
            self.cache.invalidate(&asset_cache_key(asset_id)).await;
            return Err(PipelineError::PermanentFailure {
                asset_id,
                attempts: max_attempts,
            });
        }

        warn!(error = %cause, code = cause.code(), "Migration attempt failed");
        metrics::counter!("migration.failed").increment(1);
        Err(cause)
    }
}

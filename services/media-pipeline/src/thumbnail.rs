//! Thumbnail derivation from migrated videos.
//!
//! A thumbnail is only ever taken from the owned copy of a video. Assets that
//! have not completed migration are rejected with `NotReady` before any I/O.

use crate::asset::{
    asset_cache_key, ArtifactKind, AssetRepository, DerivedArtifact, SOURCE_OWNED_STORAGE,
};
use crate::cache::TieredCache;
use crate::config::{ThumbnailConfig, Tunables};
use crate::error::{with_timeout, PipelineError, PipelineResult};
use crate::object_store::{thumbnail_key, ObjectStore};
use async_trait::async_trait;
use backoff::{backoff::Backoff, ExponentialBackoff};
use bytes::Bytes;
use chrono::Utc;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Renders a single still frame from a video URL as JPEG.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FrameExtractor: Send + Sync {
    async fn extract_frame(&self, source_url: &str) -> PipelineResult<Bytes>;
}

/// Frame extraction through an `ffmpeg` subprocess writing JPEG to stdout.
pub struct FfmpegExtractor {
    config: ThumbnailConfig,
}

impl FfmpegExtractor {
    pub fn new(config: ThumbnailConfig) -> Self {
        Self { config }
    }

    /// Fixed transform: seek, one frame, letterboxed to the target size.
    fn args(&self, source_url: &str) -> Vec<String> {
        let (w, h) = (self.config.width, self.config.height);
        vec![
            "-hide_banner".into(),
            "-loglevel".into(),
            "error".into(),
            "-ss".into(),
            format!("{:.3}", self.config.seek_secs),
            "-i".into(),
            source_url.into(),
            "-frames:v".into(),
            "1".into(),
            "-vf".into(),
            format!(
                "scale={w}:{h}:force_original_aspect_ratio=decrease,pad={w}:{h}:(ow-iw)/2:(oh-ih)/2"
            ),
            "-q:v".into(),
            self.config.quality.to_string(),
            "-f".into(),
            "image2".into(),
            "-c:v".into(),
            "mjpeg".into(),
            "pipe:1".into(),
        ]
    }
}

#[async_trait]
impl FrameExtractor for FfmpegExtractor {
    async fn extract_frame(&self, source_url: &str) -> PipelineResult<Bytes> {
        let child = Command::new(&self.config.ffmpeg_path)
            .args(self.args(source_url))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PipelineError::InvalidInput(format!("failed to start ffmpeg: {e}")))?;

        let limit = Duration::from_secs(self.config.timeout_secs);
        let output = with_timeout(limit, async move {
            child
                .wait_with_output()
                .await
                .map_err(|e| PipelineError::TransientIo(format!("ffmpeg I/O error: {e}")))
        })
        .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let reason = stderr.lines().last().unwrap_or("no diagnostics").to_string();
            // Undecodable input will not improve on retry.
            if stderr.contains("Invalid data found") || stderr.contains("moov atom not found") {
                return Err(PipelineError::InvalidInput(format!("undecodable video: {reason}")));
            }
            return Err(PipelineError::TransientIo(format!(
                "ffmpeg exited with {}: {reason}",
                output.status
            )));
        }

        if output.stdout.is_empty() {
            return Err(PipelineError::TransientIo("ffmpeg produced no frame".into()));
        }

        Ok(Bytes::from(output.stdout))
    }
}

pub struct ThumbnailGenerator {
    repo: Arc<dyn AssetRepository>,
    object_store: Arc<dyn ObjectStore>,
    extractor: Arc<dyn FrameExtractor>,
    cache: Arc<TieredCache>,
    config: ThumbnailConfig,
    tunables: watch::Receiver<Tunables>,
}

impl ThumbnailGenerator {
    pub fn new(
        repo: Arc<dyn AssetRepository>,
        object_store: Arc<dyn ObjectStore>,
        extractor: Arc<dyn FrameExtractor>,
        cache: Arc<TieredCache>,
        config: ThumbnailConfig,
        tunables: watch::Receiver<Tunables>,
    ) -> Self {
        Self {
            repo,
            object_store,
            extractor,
            cache,
            config,
            tunables,
        }
    }

    /// Derive the canonical thumbnail for a migrated asset.
    ///
    /// Returns the existing artifact unless `force` is set.
    #[instrument(skip(self), fields(asset_id = %asset_id))]
    pub async fn derive_thumbnail(
        &self,
        asset_id: Uuid,
        force: bool,
    ) -> PipelineResult<DerivedArtifact> {
        let asset = self
            .repo
            .get(asset_id)
            .await?
            .ok_or(PipelineError::NotFound(asset_id))?;

        let Some(source_url) = asset.durable_url() else {
            metrics::counter!("thumbnail.not_ready").increment(1);
            return Err(PipelineError::NotReady {
                asset_id,
                reason: format!("migration state is {}", asset.migration_state),
            });
        };

        if !force {
            if let Some(existing) = self.repo.get_artifact(asset_id, ArtifactKind::Thumbnail).await? {
                debug!("Thumbnail already exists");
                return Ok(existing);
            }
        }

        let max_retries = self.tunables.borrow().thumbnail_max_retries;
        let url = match self.render_with_retry(asset_id, source_url, max_retries).await {
            Ok(url) => url,
            Err(e) => {
                warn!(error = %e, code = e.code(), "Thumbnail derivation failed");
                metrics::counter!("thumbnail.failed").increment(1);
                if let Err(record_err) = self
                    .repo
                    .record_derivation_failure(
                        asset_id,
                        ArtifactKind::Thumbnail,
                        &e.to_string(),
                        !e.is_transient(),
                    )
                    .await
                {
                    warn!(error = %record_err, "Failed to record derivation failure");
                }
                return Err(e);
            }
        };

        let artifact = DerivedArtifact {
            asset_id,
            kind: ArtifactKind::Thumbnail,
            url,
            storage_key: thumbnail_key(asset_id),
            generated_at: Utc::now(),
            source_tier: SOURCE_OWNED_STORAGE.to_string(),
        };
        self.repo.upsert_artifact(&artifact).await?;
        self.cache.invalidate(&asset_cache_key(asset_id)).await;

        metrics::counter!("thumbnail.generated").increment(1);
        info!(artifact_url = %artifact.url, "Thumbnail generated");
        Ok(artifact)
    }

    async fn render_with_retry(
        &self,
        asset_id: Uuid,
        source_url: &str,
        max_retries: u32,
    ) -> PipelineResult<String> {
        let mut backoff = ExponentialBackoff {
            initial_interval: Duration::from_millis(self.config.initial_backoff_ms),
            max_interval: Duration::from_secs(30),
            max_elapsed_time: None,
            ..Default::default()
        };
        let mut retries = 0u32;

        loop {
            match self.render(asset_id, source_url).await {
                Ok(url) => return Ok(url),
                Err(e) if e.is_transient() && retries < max_retries => {
                    retries += 1;
                    let delay = backoff.next_backoff().unwrap_or(backoff.max_interval);
                    warn!(
                        attempt = retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Thumbnail render failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn render(&self, asset_id: Uuid, source_url: &str) -> PipelineResult<String> {
        let jpeg = self.extractor.extract_frame(source_url).await?;
        self.object_store
            .put(&thumbnail_key(asset_id), jpeg, "image/jpeg")
            .await
    }
}

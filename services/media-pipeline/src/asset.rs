//! Media asset model and the repository contract the pipeline mutates it through.
//!
//! `migration_state` is the only shared mutable resource in the pipeline. Every
//! transition goes through a conditional update ("update where state = X") so
//! that two workers can never both own the same asset.

use crate::error::{PipelineError, PipelineResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Where an asset is in the origin → owned storage migration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationState {
    Pending,
    Downloading,
    Uploading,
    Completed,
    Failed,
    PermanentlyFailed,
}

impl MigrationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Downloading => "downloading",
            Self::Uploading => "uploading",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::PermanentlyFailed => "permanently_failed",
        }
    }

    /// States a worker may claim an asset from.
    pub fn is_claimable(&self) -> bool {
        matches!(self, Self::Pending | Self::Failed)
    }

    /// States owned by an active worker.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Downloading | Self::Uploading)
    }
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MigrationState {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "downloading" => Ok(Self::Downloading),
            "uploading" => Ok(Self::Uploading),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "permanently_failed" => Ok(Self::PermanentlyFailed),
            other => Err(PipelineError::Storage(format!(
                "unknown migration state '{other}'"
            ))),
        }
    }
}

/// A generated video moving from its transient origin into owned storage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaAsset {
    pub id: Uuid,
    /// Transient URL handed out by the generation provider
    pub origin_url: String,
    /// Durable URL, only meaningful once `migration_state` is `Completed`
    pub owned_url: Option<String>,
    /// Object key inside the owned bucket
    pub storage_key: Option<String>,
    pub migration_state: MigrationState,
    /// Token of the worker owning the asset while it is in flight
    pub claim_id: Option<Uuid>,
    pub attempt_count: i32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub uploaded_at: Option<DateTime<Utc>>,
    /// Diagnostic only, never shown to end users
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MediaAsset {
    pub fn new(id: Uuid, origin_url: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            origin_url: origin_url.into(),
            owned_url: None,
            storage_key: None,
            migration_state: MigrationState::Pending,
            claim_id: None,
            attempt_count: 0,
            last_attempt_at: None,
            uploaded_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// The owned URL, gated on the migration having completed.
    pub fn durable_url(&self) -> Option<&str> {
        match self.migration_state {
            MigrationState::Completed => self.owned_url.as_deref(),
            _ => None,
        }
    }
}

/// Cache key of an asset's public-facing representation.
pub fn asset_cache_key(id: Uuid) -> String {
    format!("asset:{id}")
}

/// Kind of derived artifact; one canonical artifact per asset per kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Thumbnail,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Thumbnail => "thumbnail",
        }
    }
}

impl FromStr for ArtifactKind {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "thumbnail" => Ok(Self::Thumbnail),
            other => Err(PipelineError::Storage(format!(
                "unknown artifact kind '{other}'"
            ))),
        }
    }
}

/// Source location tag recorded on artifacts derived from owned storage
pub const SOURCE_OWNED_STORAGE: &str = "owned_storage";

/// A secondary asset computed from a migrated primary asset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedArtifact {
    pub asset_id: Uuid,
    pub kind: ArtifactKind,
    pub url: String,
    pub storage_key: String,
    pub generated_at: DateTime<Utc>,
    pub source_tier: String,
}

/// Persistence contract for media assets and their derived artifacts.
///
/// Every state-changing method is conditional and reports whether it applied.
#[async_trait]
pub trait AssetRepository: Send + Sync {
    async fn get(&self, id: Uuid) -> PipelineResult<Option<MediaAsset>>;

    /// Insert a pending asset, or return the existing one untouched.
    async fn register(&self, id: Uuid, origin_url: &str) -> PipelineResult<MediaAsset>;

    /// `Pending | Failed → Downloading` while the attempt budget allows it.
    /// Returns the claim token every later write of this attempt must present.
    async fn claim(&self, id: Uuid, max_attempts: i32) -> PipelineResult<Option<Uuid>>;

    /// `from → to`, only if the asset is in `from` and still held by `claim`.
    async fn transition(
        &self,
        id: Uuid,
        claim: Uuid,
        from: MigrationState,
        to: MigrationState,
    ) -> PipelineResult<bool>;

    /// `Uploading → Completed` under `claim`, recording the owned location in
    /// the same write.
    async fn complete(
        &self,
        id: Uuid,
        claim: Uuid,
        owned_url: &str,
        storage_key: &str,
    ) -> PipelineResult<bool>;

    /// Count a failed attempt of an asset in flight under `claim`. Returns the
    /// resulting state, `PermanentlyFailed` once `max_attempts` is reached. When
    /// the claim no longer holds, nothing changes and the current state is returned.
    async fn record_failure(
        &self,
        id: Uuid,
        claim: Uuid,
        max_attempts: i32,
        error: &str,
    ) -> PipelineResult<MigrationState>;

    /// `Pending | Failed → PermanentlyFailed` for an asset whose attempts
    /// already reached `max_attempts`, e.g. after the budget was lowered.
    async fn retire_exhausted(&self, id: Uuid, max_attempts: i32) -> PipelineResult<bool>;

    /// Manual intervention: `Failed | PermanentlyFailed → Pending` with a fresh budget.
    async fn requeue(&self, id: Uuid) -> PipelineResult<bool>;

    /// Assets in `state` whose last update is older than `updated_before`.
    async fn list_by_state(
        &self,
        state: MigrationState,
        updated_before: DateTime<Utc>,
        limit: i64,
    ) -> PipelineResult<Vec<MediaAsset>>;

    /// Completed assets without an artifact of `kind`, completed before
    /// `uploaded_before`. Assets whose derivation failed permanently, or
    /// `max_failures` times, are left out.
    async fn list_missing_artifacts(
        &self,
        kind: ArtifactKind,
        uploaded_before: DateTime<Utc>,
        max_failures: i32,
        limit: i64,
    ) -> PipelineResult<Vec<Uuid>>;

    async fn get_artifact(
        &self,
        asset_id: Uuid,
        kind: ArtifactKind,
    ) -> PipelineResult<Option<DerivedArtifact>>;

    /// Insert or overwrite the canonical artifact for `(asset_id, kind)` and
    /// forget earlier derivation failures.
    async fn upsert_artifact(&self, artifact: &DerivedArtifact) -> PipelineResult<()>;

    /// Count a failed derivation of `kind` for `asset_id`.
    async fn record_derivation_failure(
        &self,
        asset_id: Uuid,
        kind: ArtifactKind,
        error: &str,
        permanent: bool,
    ) -> PipelineResult<()>;

    /// Connectivity check for readiness probes.
    async fn ping(&self) -> PipelineResult<()>;
}

#[derive(Debug, Clone)]
struct DerivationFailure {
    attempts: i32,
    permanent: bool,
}

/// In-process repository, used for local development and tests.
#[derive(Default)]
pub struct MemoryAssetStore {
    assets: Mutex<HashMap<Uuid, MediaAsset>>,
    artifacts: Mutex<HashMap<(Uuid, ArtifactKind), DerivedArtifact>>,
    failures: Mutex<HashMap<(Uuid, ArtifactKind), DerivationFailure>>,
}

impl MemoryAssetStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an asset as-is.
    pub fn insert(&self, asset: MediaAsset) {
        self.assets.lock().insert(asset.id, asset);
    }

    /// Apply `f` when the current state satisfies `guard`.
    fn update_if<F, G>(&self, id: Uuid, guard: G, f: F) -> bool
    where
        G: FnOnce(&MediaAsset) -> bool,
        F: FnOnce(&mut MediaAsset),
    {
        let mut assets = self.assets.lock();
        match assets.get_mut(&id) {
            Some(asset) if guard(asset) => {
                f(asset);
                asset.updated_at = Utc::now();
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl AssetRepository for MemoryAssetStore {
    async fn get(&self, id: Uuid) -> PipelineResult<Option<MediaAsset>> {
        Ok(self.assets.lock().get(&id).cloned())
    }

    async fn register(&self, id: Uuid, origin_url: &str) -> PipelineResult<MediaAsset> {
        let mut assets = self.assets.lock();
        Ok(assets
            .entry(id)
            .or_insert_with(|| MediaAsset::new(id, origin_url))
            .clone())
    }

    async fn claim(&self, id: Uuid, max_attempts: i32) -> PipelineResult<Option<Uuid>> {
        let token = Uuid::new_v4();
        let claimed = self.update_if(
            id,
            |a| a.migration_state.is_claimable() && a.attempt_count < max_attempts,
            |a| {
                a.migration_state = MigrationState::Downloading;
                a.claim_id = Some(token);
                a.last_attempt_at = Some(Utc::now());
            },
        );
        Ok(claimed.then_some(token))
    }

    async fn transition(
        &self,
        id: Uuid,
        claim: Uuid,
        from: MigrationState,
        to: MigrationState,
    ) -> PipelineResult<bool> {
        Ok(self.update_if(
            id,
            |a| a.migration_state == from && a.claim_id == Some(claim),
            |a| a.migration_state = to,
        ))
    }

    async fn complete(
        &self,
        id: Uuid,
        claim: Uuid,
        owned_url: &str,
        storage_key: &str,
    ) -> PipelineResult<bool> {
        Ok(self.update_if(
            id,
            |a| a.migration_state == MigrationState::Uploading && a.claim_id == Some(claim),
            |a| {
                a.migration_state = MigrationState::Completed;
                a.claim_id = None;
                a.owned_url = Some(owned_url.to_string());
                a.storage_key = Some(storage_key.to_string());
                a.uploaded_at = Some(Utc::now());
                a.last_error = None;
            },
        ))
    }

    async fn record_failure(
        &self,
        id: Uuid,
        claim: Uuid,
        max_attempts: i32,
        error: &str,
    ) -> PipelineResult<MigrationState> {
        let mut assets = self.assets.lock();
        let asset = assets.get_mut(&id).ok_or(PipelineError::NotFound(id))?;

        if asset.migration_state.is_in_flight() && asset.claim_id == Some(claim) {
            asset.attempt_count += 1;
            asset.claim_id = None;
            asset.last_attempt_at = Some(Utc::now());
            asset.last_error = Some(error.to_string());
            asset.migration_state = if asset.attempt_count >= max_attempts {
                MigrationState::PermanentlyFailed
            } else {
                MigrationState::Failed
            };
            asset.updated_at = Utc::now();
        }

        Ok(asset.migration_state)
    }

    async fn retire_exhausted(&self, id: Uuid, max_attempts: i32) -> PipelineResult<bool> {
        Ok(self.update_if(
            id,
            |a| a.migration_state.is_claimable() && a.attempt_count >= max_attempts,
            |a| a.migration_state = MigrationState::PermanentlyFailed,
        ))
    }

    async fn requeue(&self, id: Uuid) -> PipelineResult<bool> {
        Ok(self.update_if(
            id,
            |a| {
                matches!(
                    a.migration_state,
                    MigrationState::Failed | MigrationState::PermanentlyFailed
                )
            },
            |a| {
                a.migration_state = MigrationState::Pending;
                a.claim_id = None;
                a.attempt_count = 0;
            },
        ))
    }

    async fn list_by_state(
        &self,
        state: MigrationState,
        updated_before: DateTime<Utc>,
        limit: i64,
    ) -> PipelineResult<Vec<MediaAsset>> {
        let assets = self.assets.lock();
        let mut matching: Vec<MediaAsset> = assets
            .values()
            .filter(|a| a.migration_state == state && a.updated_at < updated_before)
            .cloned()
            .collect();
        matching.sort_by_key(|a| a.updated_at);
        matching.truncate(limit.max(0) as usize);
        Ok(matching)
    }

    async fn list_missing_artifacts(
        &self,
        kind: ArtifactKind,
        uploaded_before: DateTime<Utc>,
        max_failures: i32,
        limit: i64,
    ) -> PipelineResult<Vec<Uuid>> {
        let assets = self.assets.lock();
        let artifacts = self.artifacts.lock();
        let failures = self.failures.lock();
        Ok(assets
            .values()
            .filter(|a| a.migration_state == MigrationState::Completed)
            .filter(|a| a.uploaded_at.map_or(false, |t| t < uploaded_before))
            .filter(|a| !artifacts.contains_key(&(a.id, kind)))
            .filter(|a| {
                failures
                    .get(&(a.id, kind))
                    .map_or(true, |f| !f.permanent && f.attempts < max_failures)
            })
            .map(|a| a.id)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn get_artifact(
        &self,
        asset_id: Uuid,
        kind: ArtifactKind,
    ) -> PipelineResult<Option<DerivedArtifact>> {
        Ok(self.artifacts.lock().get(&(asset_id, kind)).cloned())
    }

    async fn upsert_artifact(&self, artifact: &DerivedArtifact) -> PipelineResult<()> {
        let key = (artifact.asset_id, artifact.kind);
        self.artifacts.lock().insert(key, artifact.clone());
        self.failures.lock().remove(&key);
        Ok(())
    }

    async fn record_derivation_failure(
        &self,
        asset_id: Uuid,
        kind: ArtifactKind,
        _error: &str,
        permanent: bool,
    ) -> PipelineResult<()> {
        let mut failures = self.failures.lock();
        let entry = failures.entry((asset_id, kind)).or_insert(DerivationFailure {
            attempts: 0,
            permanent: false,
        });
        entry.attempts += 1;
        entry.permanent |= permanent;
        Ok(())
    }

    async fn ping(&self) -> PipelineResult<()> {
        Ok(())
    }
}

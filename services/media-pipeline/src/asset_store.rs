use crate::asset::{
    ArtifactKind, AssetRepository, DerivedArtifact, MediaAsset, MigrationState,
};
use crate::config::DatabaseConfig;
use crate::error::{PipelineError, PipelineResult};
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Raw `media_assets` row; the state column is plain text.
#[derive(Debug, Clone, FromRow)]
struct AssetRow {
    id: Uuid,
    origin_url: String,
    owned_url: Option<String>,
    storage_key: Option<String>,
    migration_state: String,
    claim_id: Option<Uuid>,
    attempt_count: i32,
    last_attempt_at: Option<DateTime<Utc>>,
    uploaded_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<AssetRow> for MediaAsset {
    type Error = PipelineError;

    fn try_from(row: AssetRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            origin_url: row.origin_url,
            owned_url: row.owned_url,
            storage_key: row.storage_key,
            migration_state: row.migration_state.parse()?,
            claim_id: row.claim_id,
            attempt_count: row.attempt_count,
            last_attempt_at: row.last_attempt_at,
            uploaded_at: row.uploaded_at,
            last_error: row.last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
struct ArtifactRow {
    asset_id: Uuid,
    kind: String,
    url: String,
    storage_key: String,
    generated_at: DateTime<Utc>,
    source_tier: String,
}

impl TryFrom<ArtifactRow> for DerivedArtifact {
    type Error = PipelineError;

    fn try_from(row: ArtifactRow) -> Result<Self, Self::Error> {
        Ok(Self {
            asset_id: row.asset_id,
            kind: row.kind.parse()?,
            url: row.url,
            storage_key: row.storage_key,
            generated_at: row.generated_at,
            source_tier: row.source_tier,
        })
    }
}

const ASSET_COLUMNS: &str = r#"
    id, origin_url, owned_url, storage_key, migration_state, claim_id,
    attempt_count, last_attempt_at, uploaded_at, last_error,
    created_at, updated_at
"#;

/// PostgreSQL-backed system of record for media assets
pub struct PgAssetStore {
    pool: PgPool,
}

impl PgAssetStore {
    /// Create a new asset store with connection pool
    pub async fn new(config: &DatabaseConfig) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout())
            .idle_timeout(Some(config.idle_timeout()))
            .connect(&config.url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!("Connected to PostgreSQL database");

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> anyhow::Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }

    /// Get the connection pool (for the notification listener)
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl AssetRepository for PgAssetStore {
    async fn get(&self, id: Uuid) -> PipelineResult<Option<MediaAsset>> {
        let row = sqlx::query_as::<_, AssetRow>(&format!(
            "SELECT {ASSET_COLUMNS} FROM media_assets WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(MediaAsset::try_from).transpose()
    }

    #[instrument(skip(self), fields(asset_id = %id))]
    async fn register(&self, id: Uuid, origin_url: &str) -> PipelineResult<MediaAsset> {
        // The no-op update makes RETURNING yield the existing row on conflict.
        let row = sqlx::query_as::<_, AssetRow>(&format!(
            r#"
            INSERT INTO media_assets (id, origin_url, generation_status, migration_state)
            VALUES ($1, $2, 'completed', 'pending')
            ON CONFLICT (id) DO UPDATE SET id = media_assets.id
            RETURNING {ASSET_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(origin_url)
        .fetch_one(&self.pool)
        .await?;

        debug!(asset_id = %id, "Asset registered");
        row.try_into()
    }

    async fn claim(&self, id: Uuid, max_attempts: i32) -> PipelineResult<Option<Uuid>> {
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE media_assets
            SET migration_state = 'downloading',
                claim_id = $3,
                last_attempt_at = NOW(),
                updated_at = NOW()
            WHERE id = $1
              AND migration_state IN ('pending', 'failed')
              AND attempt_count < $2
            RETURNING claim_id
            "#,
        )
        .bind(id)
        .bind(max_attempts)
        .bind(Uuid::new_v4())
        .fetch_optional(&self.pool)
        .await?;

        Ok(claimed.map(|(claim,)| claim))
    }

    async fn transition(
        &self,
        id: Uuid,
        claim: Uuid,
        from: MigrationState,
        to: MigrationState,
    ) -> PipelineResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE media_assets
            SET migration_state = $4, updated_at = NOW()
            WHERE id = $1 AND claim_id = $2 AND migration_state = $3
            "#,
        )
        .bind(id)
        .bind(claim)
        .bind(from.as_str())
        .bind(to.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), fields(asset_id = %id))]
    async fn complete(
        &self,
        id: Uuid,
        claim: Uuid,
        owned_url: &str,
        storage_key: &str,
    ) -> PipelineResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE media_assets
            SET migration_state = 'completed',
                claim_id = NULL,
                owned_url = $3,
                storage_key = $4,
                uploaded_at = NOW(),
                last_error = NULL,
                updated_at = NOW()
            WHERE id = $1 AND claim_id = $2 AND migration_state = 'uploading'
            "#,
        )
        .bind(id)
        .bind(claim)
        .bind(owned_url)
        .bind(storage_key)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, error), fields(asset_id = %id))]
    async fn record_failure(
        &self,
        id: Uuid,
        claim: Uuid,
        max_attempts: i32,
        error: &str,
    ) -> PipelineResult<MigrationState> {
        let updated: Option<(String,)> = sqlx::query_as(
            r#"
            UPDATE media_assets
            SET attempt_count = attempt_count + 1,
                claim_id = NULL,
                last_attempt_at = NOW(),
                last_error = $4,
                migration_state = CASE
                    WHEN attempt_count + 1 >= $3 THEN 'permanently_failed'
                    ELSE 'failed'
                END,
                updated_at = NOW()
            WHERE id = $1
              AND claim_id = $2
              AND migration_state IN ('downloading', 'uploading')
            RETURNING migration_state
            "#,
        )
        .bind(id)
        .bind(claim)
        .bind(max_attempts)
        .bind(error)
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some((state,)) => state.parse(),
            None => self
                .get(id)
                .await?
                .map(|a| a.migration_state)
                .ok_or(PipelineError::NotFound(id)),
        }
    }

    #[instrument(skip(self), fields(asset_id = %id))]
    async fn retire_exhausted(&self, id: Uuid, max_attempts: i32) -> PipelineResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE media_assets
            SET migration_state = 'permanently_failed', updated_at = NOW()
            WHERE id = $1
              AND migration_state IN ('pending', 'failed')
              AND attempt_count >= $2
            "#,
        )
        .bind(id)
        .bind(max_attempts)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn requeue(&self, id: Uuid) -> PipelineResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE media_assets
            SET migration_state = 'pending',
                claim_id = NULL,
                attempt_count = 0,
                updated_at = NOW()
            WHERE id = $1 AND migration_state IN ('failed', 'permanently_failed')
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn list_by_state(
        &self,
        state: MigrationState,
        updated_before: DateTime<Utc>,
        limit: i64,
    ) -> PipelineResult<Vec<MediaAsset>> {
        let rows = sqlx::query_as::<_, AssetRow>(&format!(
            r#"
            SELECT {ASSET_COLUMNS} FROM media_assets
            WHERE migration_state = $1 AND updated_at < $2
            ORDER BY updated_at ASC
            LIMIT $3
            "#
        ))
        .bind(state.as_str())
        .bind(updated_before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(MediaAsset::try_from).collect()
    }

    async fn list_missing_artifacts(
        &self,
        kind: ArtifactKind,
        uploaded_before: DateTime<Utc>,
        max_failures: i32,
        limit: i64,
    ) -> PipelineResult<Vec<Uuid>> {
        let ids: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT a.id FROM media_assets a
            LEFT JOIN derived_artifacts d ON d.asset_id = a.id AND d.kind = $1
            LEFT JOIN derivation_failures f ON f.asset_id = a.id AND f.kind = $1
            WHERE a.migration_state = 'completed'
              AND a.uploaded_at < $2
              AND d.asset_id IS NULL
              AND (f.asset_id IS NULL OR (NOT f.permanent AND f.attempts < $3))
            ORDER BY a.uploaded_at ASC
            LIMIT $4
            "#,
        )
        .bind(kind.as_str())
        .bind(uploaded_before)
        .bind(max_failures)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids.into_iter().map(|(id,)| id).collect())
    }

    async fn get_artifact(
        &self,
        asset_id: Uuid,
        kind: ArtifactKind,
    ) -> PipelineResult<Option<DerivedArtifact>> {
        let row = sqlx::query_as::<_, ArtifactRow>(
            r#"
            SELECT asset_id, kind, url, storage_key, generated_at, source_tier
            FROM derived_artifacts
            WHERE asset_id = $1 AND kind = $2
            "#,
        )
        .bind(asset_id)
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(DerivedArtifact::try_from).transpose()
    }

    #[instrument(skip(self, artifact), fields(asset_id = %artifact.asset_id))]
    async fn upsert_artifact(&self, artifact: &DerivedArtifact) -> PipelineResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO derived_artifacts (
                asset_id, kind, url, storage_key, generated_at, source_tier
            ) VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (asset_id, kind) DO UPDATE SET
                url = EXCLUDED.url,
                storage_key = EXCLUDED.storage_key,
                generated_at = EXCLUDED.generated_at,
                source_tier = EXCLUDED.source_tier
            "#,
        )
        .bind(artifact.asset_id)
        .bind(artifact.kind.as_str())
        .bind(&artifact.url)
        .bind(&artifact.storage_key)
        .bind(artifact.generated_at)
        .bind(&artifact.source_tier)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM derivation_failures WHERE asset_id = $1 AND kind = $2")
            .bind(artifact.asset_id)
            .bind(artifact.kind.as_str())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self, error), fields(asset_id = %asset_id))]
    async fn record_derivation_failure(
        &self,
        asset_id: Uuid,
        kind: ArtifactKind,
        error: &str,
        permanent: bool,
    ) -> PipelineResult<()> {
        sqlx::query(
            r#"
            INSERT INTO derivation_failures (asset_id, kind, attempts, last_error, permanent)
            VALUES ($1, $2, 1, $3, $4)
            ON CONFLICT (asset_id, kind) DO UPDATE SET
                attempts = derivation_failures.attempts + 1,
                last_error = EXCLUDED.last_error,
                permanent = derivation_failures.permanent OR EXCLUDED.permanent,
                failed_at = NOW()
            "#,
        )
        .bind(asset_id)
        .bind(kind.as_str())
        .bind(error)
        .bind(permanent)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn ping(&self) -> PipelineResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

//! Media Pipeline Service
//!
//! Moves generated videos from short-lived provider URLs into owned object
//! storage, derives thumbnails from the owned copy, and serves asset views
//! through a tiered cache in front of PostgreSQL.
//!
//! ## Features
//!
//! - **Migration State Machine**: at most one worker per asset, bounded
//!   attempts, permanent failure after the configured budget
//! - **Thumbnail Derivation**: single-frame extraction via ffmpeg from the
//!   owned copy only, with bounded retries of transient failures
//! - **Tiered Cache**: in-process memory, local SQLite, and Redis in front of
//!   the system of record, with corruption fallthrough and graceful
//!   degradation when Redis is unreachable
//! - **Trigger Dispatch**: row-change notifications and a reconciliation
//!   sweep drive migration and derivation
//! - **Admission Control**: per-user, per-session, per-peer sliding windows
//!   with escalation to a temporary block
//!
//! ## Architecture
//!
//! ```text
//!  Postgres NOTIFY        ┌──────────────┐        ┌──────────────┐
//!  API register  ───────▶│ Trigger      │───────▶│ Migrator     │──▶ S3 videos/
//!  Reconciler             │ Dispatcher   │        └──────────────┘
//!                         └──────────────┘               │ completed
//!                                ▲                       ▼
//!                                └───────────────┌──────────────┐
//!                                                │ Thumbnail    │──▶ S3 thumbnails/
//!                                                │ Generator    │
//!                                                └──────────────┘
//!
//!  GET /api/v1/assets/:id ──▶ L1 memory ──▶ L2 SQLite ──▶ L3 Redis ──▶ PostgreSQL
//! ```

pub mod api;
pub mod asset;
pub mod asset_store;
pub mod cache;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod migration;
pub mod object_store;
pub mod origin;
pub mod rate_limiter;
pub mod thumbnail;

#[cfg(test)]
mod testing;

pub use api::{AppState, AssetStatus, AssetView};
pub use asset::{ArtifactKind, AssetRepository, DerivedArtifact, MediaAsset, MigrationState};
pub use asset_store::PgAssetStore;
pub use cache::{SourceOfRecord, Tier, TieredCache};
pub use config::{Config, ConfigWatcher, Tunables};
pub use dispatcher::{AssetEvent, DispatcherHandle, Reconciler, TriggerDispatcher};
pub use error::{PipelineError, PipelineResult};
pub use migration::{MediaMigrator, MigrationOutcome};
pub use rate_limiter::{RateLimitDecision, RateLimiter, SubjectKey};
pub use thumbnail::{FfmpegExtractor, ThumbnailGenerator};

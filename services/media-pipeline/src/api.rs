use crate::asset::{asset_cache_key, ArtifactKind, AssetRepository, MediaAsset, MigrationState};
use crate::cache::{SourceOfRecord, TieredCache};
use crate::config::ApiConfig;
use crate::dispatcher::{AssetEvent, DispatcherHandle};
use crate::error::{PipelineError, PipelineResult};
use crate::migration::MediaMigrator;
use crate::rate_limiter::{RateLimiter, SubjectKey};
use crate::thumbnail::ThumbnailGenerator;
use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::{
    extract::{ConnectInfo, Path, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument};
use uuid::Uuid;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<dyn AssetRepository>,
    pub migrator: Arc<MediaMigrator>,
    pub thumbnails: Arc<ThumbnailGenerator>,
    pub cache: Arc<TieredCache>,
    pub limiter: Arc<RateLimiter>,
    pub dispatcher: DispatcherHandle,
}

/// `POST /migrate` body
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrateRequest {
    pub asset_id: Uuid,
    #[serde(rename = "originURL", alias = "originUrl", default)]
    pub origin_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrateResponse {
    pub success: bool,
    #[serde(rename = "ownedURL", skip_serializing_if = "Option::is_none", default)]
    pub owned_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub state: Option<MigrationState>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}

/// `POST /derive-thumbnail` body
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeriveRequest {
    pub asset_id: Uuid,
    #[serde(default)]
    pub force_regenerate: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeriveResponse {
    pub success: bool,
    #[serde(rename = "artifactURL", skip_serializing_if = "Option::is_none", default)]
    pub artifact_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
}

/// `POST /api/v1/assets` body: a generation job finished and produced a video.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterAssetRequest {
    pub asset_id: Option<Uuid>,
    #[serde(rename = "originURL", alias = "originUrl")]
    pub origin_url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    pub session_id: String,
    pub user_id: String,
}

/// What end users see of an asset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetStatus {
    Processing,
    Ready,
    /// Rendered as a placeholder by clients
    Unavailable,
}

/// Public representation of an asset. Carries no error details.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetView {
    pub id: Uuid,
    pub status: AssetStatus,
    /// `null` until the owned copy is readable; clients show a placeholder.
    pub video_url: Option<String>,
    pub thumbnail_url: Option<String>,
}

impl AssetView {
    pub fn new(asset: &MediaAsset, thumbnail_url: Option<String>) -> Self {
        let status = match asset.migration_state {
            MigrationState::Completed => AssetStatus::Ready,
            MigrationState::PermanentlyFailed => AssetStatus::Unavailable,
            _ => AssetStatus::Processing,
        };
        let video_url = asset.durable_url().map(str::to_string);

        Self {
            id: asset.id,
            status,
            thumbnail_url: video_url.as_ref().and(thumbnail_url),
            video_url,
        }
    }
}

/// Loads asset views from the repository on a full cache miss.
struct AssetViewSource {
    repo: Arc<dyn AssetRepository>,
    asset_id: Uuid,
}

#[async_trait]
impl SourceOfRecord for AssetViewSource {
    type Value = AssetView;

    async fn load(&self, _key: &str) -> PipelineResult<Option<AssetView>> {
        let Some(asset) = self.repo.get(self.asset_id).await? else {
            return Ok(None);
        };
        let thumbnail = self
            .repo
            .get_artifact(self.asset_id, ArtifactKind::Thumbnail)
            .await?
            .map(|a| a.url);
        Ok(Some(AssetView::new(&asset, thumbnail)))
    }
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

fn status_for(e: &PipelineError) -> StatusCode {
    match e {
        PipelineError::NotFound(_) => StatusCode::NOT_FOUND,
        PipelineError::InvalidInput(_) => StatusCode::BAD_REQUEST,
        PipelineError::NotReady { .. } | PipelineError::PermanentFailure { .. } => {
            StatusCode::CONFLICT
        }
        PipelineError::TransientIo(_) | PipelineError::Timeout(_) => StatusCode::SERVICE_UNAVAILABLE,
        PipelineError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(status: StatusCode, error: &str, code: &str) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
            code: code.to_string(),
        }),
    )
        .into_response()
}

/// Storage and transport details stay in the logs.
fn internal_error(e: PipelineError) -> Response {
    error!(error = %e, "Request failed");
    match e {
        PipelineError::NotFound(_) => error_response(StatusCode::NOT_FOUND, "Asset not found", e.code()),
        _ => error_response(status_for(&e), "Request could not be completed", e.code()),
    }
}

/// Rate limit subject: authenticated user, then anonymous session, then peer address.
pub fn subject_for(headers: &HeaderMap, peer: Option<SocketAddr>) -> SubjectKey {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };

    if let Some(user) = header("x-user-id") {
        SubjectKey::User(user)
    } else if let Some(session) = header("x-session-id") {
        SubjectKey::Session(session)
    } else {
        SubjectKey::Peer(peer.map_or_else(|| "unknown".to_string(), |p| p.ip().to_string()))
    }
}

/// Admission control for endpoints that start expensive work.
fn admit(
    state: &AppState,
    headers: &HeaderMap,
    peer: Option<ConnectInfo<SocketAddr>>,
) -> Result<(), Response> {
    let subject = subject_for(headers, peer.map(|ConnectInfo(addr)| addr));
    let decision = state.limiter.admit(&subject);
    if decision.allowed {
        return Ok(());
    }

    let retry_secs = decision
        .retry_after
        .map_or(1, |d| d.as_secs() + u64::from(d.subsec_nanos() > 0));
    let mut response = error_response(StatusCode::TOO_MANY_REQUESTS, "Too many requests", "RATE_LIMITED");
    response
        .headers_mut()
        .insert(header::RETRY_AFTER, HeaderValue::from(retry_secs));
    Err(response)
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/migrate", post(migrate))
        .route("/derive-thumbnail", post(derive_thumbnail))
        .route("/api/v1/assets", post(register_asset))
        .route("/api/v1/assets/:asset_id", get(get_asset))
        .route("/api/v1/assets/:asset_id/retry", post(retry_asset))
        .route("/api/v1/session/login", post(login))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "media-pipeline"
    }))
}

/// Readiness: the system of record must answer. Cache tiers only degrade.
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let stats = state.cache.stats();
    let cache = serde_json::json!({
        "l1Entries": stats.l1_entries,
        "l2": stats.l2_enabled,
        "l3": if !stats.l3_configured { "disabled" } else if stats.l3_reachable { "reachable" } else { "unreachable" },
    });

    match state.repo.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "database": "connected",
                "cache": cache
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "database": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

/// Trigger endpoint: migrate one asset into owned storage.
#[instrument(skip(state, headers, peer, request), fields(asset_id = %request.asset_id))]
async fn migrate(
    State(state): State<AppState>,
    headers: HeaderMap,
    peer: Option<ConnectInfo<SocketAddr>>,
    Json(request): Json<MigrateRequest>,
) -> Response {
    if let Err(rejected) = admit(&state, &headers, peer) {
        return rejected;
    }

    match state
        .migrator
        .migrate(request.asset_id, request.origin_url.as_deref())
        .await
    {
        Ok(outcome) => Json(MigrateResponse {
            success: true,
            owned_url: outcome.owned_url,
            state: Some(outcome.state),
            error: None,
        })
        .into_response(),
        Err(e) => (
            status_for(&e),
            Json(MigrateResponse {
                success: false,
                owned_url: None,
                state: None,
                error: Some(e.to_string()),
            }),
        )
            .into_response(),
    }
}

/// Trigger endpoint: derive an asset's thumbnail.
#[instrument(skip(state, headers, peer, request), fields(asset_id = %request.asset_id))]
async fn derive_thumbnail(
    State(state): State<AppState>,
    headers: HeaderMap,
    peer: Option<ConnectInfo<SocketAddr>>,
    Json(request): Json<DeriveRequest>,
) -> Response {
    if let Err(rejected) = admit(&state, &headers, peer) {
        return rejected;
    }

    match state
        .thumbnails
        .derive_thumbnail(request.asset_id, request.force_regenerate)
        .await
    {
        Ok(artifact) => Json(DeriveResponse {
            success: true,
            artifact_url: Some(artifact.url),
            error: None,
        })
        .into_response(),
        Err(e) => (
            status_for(&e),
            Json(DeriveResponse {
                success: false,
                artifact_url: None,
                error: Some(e.to_string()),
            }),
        )
            .into_response(),
    }
}

/// A generation job completed: record the asset and trigger its migration.
#[instrument(skip(state, headers, peer, request))]
async fn register_asset(
    State(state): State<AppState>,
    headers: HeaderMap,
    peer: Option<ConnectInfo<SocketAddr>>,
    Json(request): Json<RegisterAssetRequest>,
) -> Response {
    if let Err(rejected) = admit(&state, &headers, peer) {
        return rejected;
    }

    if !(request.origin_url.starts_with("https://") || request.origin_url.starts_with("http://")) {
        return error_response(StatusCode::BAD_REQUEST, "originURL must be an http(s) URL", "INVALID_INPUT");
    }

    let asset_id = request.asset_id.unwrap_or_else(Uuid::new_v4);
    let asset = match state.repo.register(asset_id, &request.origin_url).await {
        Ok(asset) => asset,
        Err(e) => return internal_error(e),
    };

    if asset.migration_state == MigrationState::Pending {
        state.dispatcher.notify(AssetEvent::GenerationCompleted {
            asset_id,
            origin_url: asset.origin_url.clone(),
        });
    }
    state.cache.invalidate(&asset_cache_key(asset_id)).await;

    (StatusCode::ACCEPTED, Json(AssetView::new(&asset, None))).into_response()
}

/// Read an asset through the tiered cache.
async fn get_asset(State(state): State<AppState>, Path(asset_id): Path<Uuid>) -> Response {
    let source = AssetViewSource {
        repo: state.repo.clone(),
        asset_id,
    };

    match state.cache.get_or_load(&asset_cache_key(asset_id), &source).await {
        Ok(Some(view)) => Json(view).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "Asset not found", "NOT_FOUND"),
        Err(e) => internal_error(e),
    }
}

/// Manual intervention: give a failed asset a fresh attempt budget.
#[instrument(skip(state))]
async fn retry_asset(State(state): State<AppState>, Path(asset_id): Path<Uuid>) -> Response {
    let asset = match state.repo.get(asset_id).await {
        Ok(Some(asset)) => asset,
        Ok(None) => return error_response(StatusCode::NOT_FOUND, "Asset not found", "NOT_FOUND"),
        Err(e) => return internal_error(e),
    };

    match state.repo.requeue(asset_id).await {
        Ok(true) => {}
        Ok(false) => {
            return error_response(
                StatusCode::CONFLICT,
                &format!("Asset is {}, only failed assets can be retried", asset.migration_state),
                "INVALID_STATE",
            )
        }
        Err(e) => return internal_error(e),
    }

    info!(previous_state = %asset.migration_state, "Asset requeued for migration");
    state.cache.invalidate(&asset_cache_key(asset_id)).await;
    state.dispatcher.notify(AssetEvent::GenerationCompleted {
        asset_id,
        origin_url: asset.origin_url,
    });

    StatusCode::ACCEPTED.into_response()
}

/// A session authenticated; its anonymous rate limit history no longer applies.
async fn login(State(state): State<AppState>, Json(request): Json<LoginRequest>) -> StatusCode {
    state.limiter.on_login(&request.session_id, &request.user_id);
    StatusCode::NO_CONTENT
}

/// Serve the API until `shutdown` is cancelled.
pub async fn start_api_server(
    state: AppState,
    config: &ApiConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting media pipeline API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await
    .context("API server error")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asset::MemoryAssetStore;
    use crate::cache::{MemoryTier, TierTtls};
    use crate::config::{MigrationConfig, RateLimitConfig, ThumbnailConfig, Tunables};
    use crate::dispatcher::TriggerDispatcher;
    use crate::testing::{FakeOrigin, MemoryObjectStore, StaticFrame};
    use axum::body::Body;
    use axum::http::Request;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    struct TestApp {
        router: Router,
        repo: Arc<MemoryAssetStore>,
        events: mpsc::Receiver<AssetEvent>,
    }

    fn test_app(max_requests: u32) -> TestApp {
        let tunables = Tunables {
            rate_limit: RateLimitConfig {
                max_requests,
                ..RateLimitConfig::default()
            },
            ..Tunables::default()
        };
        let ttl = Duration::from_secs(60);
        let repo = Arc::new(MemoryAssetStore::new());
        let store = Arc::new(MemoryObjectStore::default());
        let cache = Arc::new(TieredCache::new(
            MemoryTier::new(100),
            None,
            None,
            TierTtls { l1: ttl, l2: ttl, l3: ttl },
        ));
        let (dispatcher, events) = TriggerDispatcher::channel(16);

        let migrator = Arc::new(MediaMigrator::new(
            repo.clone(),
            Arc::new(FakeOrigin::serving(b"mp4")),
            store.clone(),
            cache.clone(),
            MigrationConfig::default(),
            tunables.clone().fixed(),
        ));
        let thumbnails = Arc::new(ThumbnailGenerator::new(
            repo.clone(),
            store,
            Arc::new(StaticFrame),
            cache.clone(),
            ThumbnailConfig::default(),
            tunables.clone().fixed(),
        ));

        let state = AppState {
            repo: repo.clone(),
            migrator,
            thumbnails,
            cache,
            limiter: Arc::new(RateLimiter::new(tunables.fixed())),
            dispatcher,
        };

        TestApp {
            router: create_router(state, &ApiConfig::default()),
            repo,
            events,
        }
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn call(router: &Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, body)
    }

    #[tokio::test]
    async fn test_migrate_then_derive() {
        let app = test_app(100);
        let id = Uuid::new_v4();

        let (status, body) = call(
            &app.router,
            post_json("/migrate", serde_json::json!({"assetId": id, "originURL": "https://x/video.mp4"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert!(body["ownedURL"].as_str().unwrap().ends_with(&format!("videos/{id}.mp4")));

        let (status, body) = call(
            &app.router,
            post_json("/derive-thumbnail", serde_json::json!({"assetId": id})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["artifactURL"].as_str().unwrap().ends_with(&format!("thumbnails/{id}.jpg")));
    }

    #[tokio::test]
    async fn test_derive_before_migration_is_not_ready() {
        let app = test_app(100);
        let id = Uuid::new_v4();
        app.repo.register(id, "https://x/video.mp4").await.unwrap();

        let (status, body) = call(
            &app.router,
            post_json("/derive-thumbnail", serde_json::json!({"assetId": id})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_register_triggers_migration() {
        let mut app = test_app(100);
        let id = Uuid::new_v4();

        let (status, body) = call(
            &app.router,
            post_json("/api/v1/assets", serde_json::json!({"assetId": id, "originURL": "https://x/v.mp4"})),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["status"], "processing");
        assert_eq!(
            app.events.try_recv().unwrap(),
            AssetEvent::GenerationCompleted {
                asset_id: id,
                origin_url: "https://x/v.mp4".into()
            }
        );
    }

    #[tokio::test]
    async fn test_asset_view_hides_errors_and_refreshes_after_migration() {
        let app = test_app(100);
        let id = Uuid::new_v4();
        let mut asset = MediaAsset::new(id, "https://x/video.mp4");
        asset.migration_state = MigrationState::Failed;
        asset.last_error = Some("origin returned HTTP 500".into());
        app.repo.insert(asset);

        let get = || Request::builder().uri(format!("/api/v1/assets/{id}")).body(Body::empty()).unwrap();

        let (status, body) = call(&app.router, get()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "processing");
        assert!(!body.to_string().contains("origin returned"));
        assert!(body["videoUrl"].is_null());

        let (status, _) = call(&app.router, post_json("/migrate", serde_json::json!({"assetId": id}))).await;
        assert_eq!(status, StatusCode::OK);

        let (_, body) = call(&app.router, get()).await;
        assert_eq!(body["status"], "ready");
        assert!(body["videoUrl"].is_string());
    }

    #[tokio::test]
    async fn test_unknown_asset_is_404() {
        let app = test_app(100);
        let request = Request::builder()
            .uri(format!("/api/v1/assets/{}", Uuid::new_v4()))
            .body(Body::empty())
            .unwrap();
        let (status, body) = call(&app.router, request).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "NOT_FOUND");
    }

    #[tokio::test]
    async fn test_admission_control_rejects_with_retry_after() {
        let app = test_app(2);
        let request = || {
            let mut request = post_json(
                "/api/v1/assets",
                serde_json::json!({"originURL": "https://x/v.mp4"}),
            );
            request.headers_mut().insert("x-user-id", HeaderValue::from_static("u-1"));
            request
        };

        for _ in 0..2 {
            let (status, _) = call(&app.router, request()).await;
            assert_eq!(status, StatusCode::ACCEPTED);
        }

        let response = app.router.clone().oneshot(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().contains_key(header::RETRY_AFTER));
    }

    #[tokio::test]
    async fn test_login_clears_session_counters() {
        let app = test_app(1);
        let request = || {
            let mut request = post_json(
                "/api/v1/assets",
                serde_json::json!({"originURL": "https://x/v.mp4"}),
            );
            request.headers_mut().insert("x-session-id", HeaderValue::from_static("s-9"));
            request
        };

        assert_eq!(call(&app.router, request()).await.0, StatusCode::ACCEPTED);
        assert_eq!(call(&app.router, request()).await.0, StatusCode::TOO_MANY_REQUESTS);

        let (status, _) = call(
            &app.router,
            post_json("/api/v1/session/login", serde_json::json!({"sessionId": "s-9", "userId": "u-9"})),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert_eq!(call(&app.router, request()).await.0, StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn test_retry_requeues_permanently_failed_asset() {
        let mut app = test_app(100);
        let id = Uuid::new_v4();
        let mut asset = MediaAsset::new(id, "https://x/video.mp4");
        asset.migration_state = MigrationState::PermanentlyFailed;
        asset.attempt_count = 5;
        app.repo.insert(asset);

        let (status, _) = call(&app.router, post_json(&format!("/api/v1/assets/{id}/retry"), serde_json::json!({}))).await;
        assert_eq!(status, StatusCode::ACCEPTED);

        let asset = app.repo.get(id).await.unwrap().unwrap();
        assert_eq!(asset.migration_state, MigrationState::Pending);
        assert_eq!(asset.attempt_count, 0);
        assert_eq!(app.events.try_recv().unwrap().asset_id(), id);

        let (status, body) = call(&app.router, post_json(&format!("/api/v1/assets/{id}/retry"), serde_json::json!({}))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "INVALID_STATE");
    }

    #[test]
    fn test_subject_prefers_user_over_session() {
        let mut headers = HeaderMap::new();
        headers.insert("x-session-id", HeaderValue::from_static("s-1"));
        assert_eq!(subject_for(&headers, None), SubjectKey::Session("s-1".into()));

        headers.insert("x-user-id", HeaderValue::from_static("u-1"));
        assert_eq!(subject_for(&headers, None), SubjectKey::User("u-1".into()));

        let peer: SocketAddr = "10.1.2.3:5555".parse().unwrap();
        assert_eq!(
            subject_for(&HeaderMap::new(), Some(peer)),
            SubjectKey::Peer("10.1.2.3".into())
        );
    }

    #[test]
    fn test_view_exposes_urls_only_when_ready() {
        let mut asset = MediaAsset::new(Uuid::new_v4(), "https://x/video.mp4");
        asset.owned_url = Some("https://media.test/videos/a.mp4".into());
        let view = AssetView::new(&asset, Some("https://media.test/thumbnails/a.jpg".into()));
        assert_eq!(view.status, AssetStatus::Processing);
        assert_eq!(view.video_url, None);
        assert_eq!(view.thumbnail_url, None);

        asset.migration_state = MigrationState::Completed;
        let view = AssetView::new(&asset, Some("https://media.test/thumbnails/a.jpg".into()));
        assert_eq!(view.status, AssetStatus::Ready);
        assert!(view.thumbnail_url.is_some());
    }
}

use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by the provisioning pipeline.
///
/// Cache misses and corrupt cache entries are deliberately absent: the tiered
/// cache absorbs them and reports `None` instead.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Network or storage I/O failed; safe to retry.
    #[error("Transient I/O failure: {0}")]
    TransientIo(String),

    /// An external call exceeded its deadline. Retried like any transient failure.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Precondition not met yet; the caller must re-trigger later.
    #[error("Asset {asset_id} is not ready: {reason}")]
    NotReady { asset_id: Uuid, reason: String },

    /// Attempt budget exhausted, manual intervention required.
    #[error("Asset {asset_id} permanently failed after {attempts} attempts")]
    PermanentFailure { asset_id: Uuid, attempts: i32 },

    #[error("Asset {0} not found")]
    NotFound(Uuid),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The system of record rejected or failed a query.
    #[error("Storage error: {0}")]
    Storage(String),
}

impl PipelineError {
    /// Whether re-invoking the operation may succeed without outside help.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientIo(_) | Self::Timeout(_))
    }

    /// Short machine-readable code used in API responses and metric labels.
    pub fn code(&self) -> &'static str {
        match self {
            Self::TransientIo(_) => "TRANSIENT_IO",
            Self::Timeout(_) => "TIMEOUT",
            Self::NotReady { .. } => "NOT_READY",
            Self::PermanentFailure { .. } => "PERMANENT_FAILURE",
            Self::NotFound(_) => "NOT_FOUND",
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::Storage(_) => "STORAGE_ERROR",
        }
    }
}

impl From<sqlx::Error> for PipelineError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => Self::TransientIo(e.to_string()),
            other => Self::Storage(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for PipelineError {
    fn from(e: reqwest::Error) -> Self {
        Self::TransientIo(e.to_string())
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;

/// Await `fut` for at most `limit`; expiry maps to [`PipelineError::Timeout`].
pub async fn with_timeout<T, F>(limit: Duration, fut: F) -> PipelineResult<T>
where
    F: std::future::Future<Output = PipelineResult<T>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| PipelineError::Timeout(limit))?
}

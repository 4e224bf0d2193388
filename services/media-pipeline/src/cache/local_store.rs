//! L2: node-local durable tier backed by an embedded SQLite file.
//!
//! The file is disposable. When it cannot be opened, carries a different
//! schema version, or reports corruption at runtime, it is deleted and
//! recreated empty instead of failing reads.

use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, warn};

/// Bumped whenever the on-disk layout changes; older files are discarded.
pub const SCHEMA_VERSION: i64 = 1;

#[derive(Error, Debug)]
pub enum LocalStoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Schema version {found} does not match expected {expected}")]
    SchemaMismatch { found: i64, expected: i64 },
}

/// A row read back from the local store
#[derive(Debug, Clone)]
pub struct StoredEntry {
    pub data: Vec<u8>,
    pub created_at_ms: i64,
    pub ttl_ms: i64,
}

impl StoredEntry {
    fn age_ms(&self, now_ms: i64) -> i64 {
        now_ms - self.created_at_ms
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.age_ms(now_ms) > self.ttl_ms
    }

    /// Lifetime left at `now_ms`
    pub fn remaining(&self, now_ms: i64) -> Duration {
        Duration::from_millis((self.ttl_ms - self.age_ms(now_ms)).max(0) as u64)
    }
}

pub struct LocalStore {
    path: PathBuf,
    pool: RwLock<SqlitePool>,
    rebuild_lock: Mutex<()>,
}

impl LocalStore {
    /// Open the store at `path`, discarding and recreating it if it is unusable.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, LocalStoreError> {
        let path = path.as_ref().to_path_buf();

        let pool = match open_checked(&path).await {
            Ok(pool) => pool,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Local cache store unusable, recreating");
                metrics::counter!("cache.l2.rebuilds").increment(1);
                discard_files(&path).await?;
                open_checked(&path).await?
            }
        };

        info!(path = %path.display(), "Local cache store ready");

        Ok(Self {
            path,
            pool: RwLock::new(pool),
            rebuild_lock: Mutex::new(()),
        })
    }

    pub async fn get(&self, key: &str) -> Result<Option<StoredEntry>, LocalStoreError> {
        let pool = self.pool.read().await.clone();
        let row = sqlx::query(
            "SELECT value, created_at_ms, ttl_ms FROM cache_entries WHERE key = ?1",
        )
        .bind(key)
        .fetch_optional(&pool)
        .await;

        let row = match row {
            Ok(row) => row,
            Err(e) => return Err(self.heal_on_corruption(e).await),
        };

        let Some(row) = row else {
            return Ok(None);
        };

        let entry = StoredEntry {
            data: row.try_get("value")?,
            created_at_ms: row.try_get("created_at_ms")?,
            ttl_ms: row.try_get("ttl_ms")?,
        };

        if entry.is_expired(Utc::now().timestamp_millis()) {
            self.remove(key).await?;
            return Ok(None);
        }

        Ok(Some(entry))
    }

    pub async fn put(&self, key: &str, data: &[u8], ttl: Duration) -> Result<(), LocalStoreError> {
        let pool = self.pool.read().await.clone();
        let result = sqlx::query(
            r#"
            INSERT INTO cache_entries (key, value, created_at_ms, ttl_ms)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                created_at_ms = excluded.created_at_ms,
                ttl_ms = excluded.ttl_ms
            "#,
        )
        .bind(key)
        .bind(data)
        .bind(Utc::now().timestamp_millis())
        .bind(ttl.as_millis() as i64)
        .execute(&pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) => Err(self.heal_on_corruption(e).await),
        }
    }

    pub async fn remove(&self, key: &str) -> Result<(), LocalStoreError> {
        let pool = self.pool.read().await.clone();
        sqlx::query("DELETE FROM cache_entries WHERE key = ?1")
            .bind(key)
            .execute(&pool)
            .await?;
        Ok(())
    }

    /// Delete expired rows. Returns how many were removed.
    pub async fn purge_expired(&self) -> Result<u64, LocalStoreError> {
        let pool = self.pool.read().await.clone();
        let result = sqlx::query("DELETE FROM cache_entries WHERE ?1 - created_at_ms > ttl_ms")
            .bind(Utc::now().timestamp_millis())
            .execute(&pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Recreate the store when `e` signals a damaged file; returns `e` for the caller to log.
    async fn heal_on_corruption(&self, e: sqlx::Error) -> LocalStoreError {
        if is_corruption(&e) {
            if let Err(rebuild_err) = self.rebuild().await {
                error!(error = %rebuild_err, "Failed to rebuild local cache store");
            }
        }
        e.into()
    }

    async fn rebuild(&self) -> Result<(), LocalStoreError> {
        let _guard = self.rebuild_lock.lock().await;

        warn!(path = %self.path.display(), "Local cache store corrupted, recreating");
        metrics::counter!("cache.l2.rebuilds").increment(1);

        let mut pool = self.pool.write().await;
        pool.close().await;
        discard_files(&self.path).await?;
        *pool = open_checked(&self.path).await?;
        Ok(())
    }
}

async fn open_checked(path: &Path) -> Result<SqlitePool, LocalStoreError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }

    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(2));

    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await?;

    let version: i64 = sqlx::query_scalar("PRAGMA user_version")
        .fetch_one(&pool)
        .await?;

    match version {
        0 => {
            sqlx::query(
                r#"
                CREATE TABLE IF NOT EXISTS cache_entries (
                    key           TEXT PRIMARY KEY NOT NULL,
                    value         BLOB NOT NULL,
                    created_at_ms INTEGER NOT NULL,
                    ttl_ms        INTEGER NOT NULL
                )
                "#,
            )
            .execute(&pool)
            .await?;
            sqlx::query(&format!("PRAGMA user_version = {SCHEMA_VERSION}"))
                .execute(&pool)
                .await?;
        }
        SCHEMA_VERSION => {
            sqlx::query("SELECT COUNT(*) FROM cache_entries")
                .fetch_one(&pool)
                .await?;
        }
        found => {
            pool.close().await;
            return Err(LocalStoreError::SchemaMismatch {
                found,
                expected: SCHEMA_VERSION,
            });
        }
    }

    Ok(pool)
}

async fn discard_files(path: &Path) -> Result<(), LocalStoreError> {
    for suffix in ["", "-wal", "-shm"] {
        let mut candidate = path.as_os_str().to_owned();
        candidate.push(suffix);
        match tokio::fs::remove_file(&candidate).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// SQLITE_CORRUPT (11) and SQLITE_NOTADB (26)
fn is_corruption(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db) => matches!(db.code().as_deref(), Some("11") | Some("26")),
        _ => false,
    }
}

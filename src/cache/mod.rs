//! On-disk cache for expensive response bodies.
//!
//! A byte-keyed store backed by a single SQLite file, so cached work
//! survives restarts. Values are opaque to the cache; the fusion pipeline
//! stores zstd-compressed JSON bodies. Once the backing file grows past the
//! configured cap the cache flips to read-only and rejects writes with
//! [`CacheError::ReadOnly`] until flushed.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum CacheError {
    /// The size cap was reached; writes are rejected until the next flush.
    #[error("cache is read-only")]
    ReadOnly,
    #[error("cache key not found")]
    NotFound,
    #[error("cache query failed: {0}")]
    Query(sqlx::Error),
}

impl From<sqlx::Error> for CacheError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => CacheError::NotFound,
            other => CacheError::Query(other),
        }
    }
}

#[derive(Debug)]
pub struct ResponseCache {
    pool: SqlitePool,
    path: PathBuf,
    max_bytes: Option<u64>,
    read_only: AtomicBool,
}

impl ResponseCache {
    /// Opens (or creates) the cache file and its single table.
    pub async fn open(path: &Path, max_bytes: Option<u64>) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        sqlx::query("CREATE TABLE IF NOT EXISTS cache (k TEXT PRIMARY KEY, v BLOB NOT NULL)")
            .execute(&pool)
            .await?;
        Ok(Self {
            pool,
            path: path.to_path_buf(),
            max_bytes,
            read_only: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Relaxed)
    }

    pub async fn get(&self, key: &str) -> Result<Bytes, CacheError> {
        let value: Vec<u8> = sqlx::query_scalar("SELECT v FROM cache WHERE k = ?")
            .bind(key)
            .fetch_one(&self.pool)
            .await?;
        Ok(Bytes::from(value))
    }

    /// Inserts or replaces an entry. Concurrent writers for the same key are
    /// last-writer-wins.
    pub async fn set(&self, key: &str, value: &[u8]) -> Result<(), CacheError> {
        if self.is_read_only() {
            return Err(CacheError::ReadOnly);
        }
        sqlx::query("INSERT OR REPLACE INTO cache (k, v) VALUES (?, ?)")
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await?;
        self.enforce_size_cap().await;
        Ok(())
    }

    pub async fn item_count(&self) -> Result<i64, CacheError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM cache")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Drops every entry and re-arms writes.
    pub async fn flush(&self) -> Result<(), CacheError> {
        sqlx::query("DELETE FROM cache").execute(&self.pool).await?;
        sqlx::query("VACUUM").execute(&self.pool).await?;
        self.read_only.store(false, Ordering::Relaxed);
        Ok(())
    }

    async fn enforce_size_cap(&self) {
        let Some(cap) = self.max_bytes else {
            return;
        };
        // page_count * page_size tracks the file size without a stat call.
        let size: i64 = match sqlx::query_scalar(
            "SELECT page_count * page_size FROM pragma_page_count(), pragma_page_size()",
        )
        .fetch_one(&self.pool)
        .await
        {
            Ok(size) => size,
            Err(err) => {
                warn!(error = %err, "cache size probe failed");
                return;
            }
        };
        if size as u64 >= cap && !self.read_only.swap(true, Ordering::Relaxed) {
            warn!(size, cap, "cache reached size cap, switching to read-only");
        }
    }
}

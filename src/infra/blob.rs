//! Metadata blob access keyed by local identifier.

use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FetchError {
    /// No blob for the key. The catalog may reference records that were not
    /// yet ingested, so callers treat this as skippable.
    #[error("blob not found")]
    NotFound,
    #[error("blob backend: {0}")]
    Backend(String),
}

impl From<sqlx::Error> for FetchError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => FetchError::NotFound,
            other => FetchError::Backend(other.to_string()),
        }
    }
}

/// Fetches an opaque metadata blob for a local identifier. Past deployments
/// have backed this with microblob, SOLR and SQLite; only the SQLite variant
/// ships here.
#[async_trait]
pub trait BlobFetcher: Send + Sync {
    async fn fetch(&self, key: &str) -> Result<Bytes, FetchError>;

    /// Optional health capability. `None` means the backend cannot report
    /// its own health, which the health endpoint treats as a warning, not an
    /// error.
    async fn ping(&self) -> Option<Result<(), FetchError>> {
        None
    }
}

/// Blob store over a SQLite `map(k, v)` table where `v` holds the raw
/// metadata document.
#[derive(Debug, Clone)]
pub struct SqliteBlobStore {
    pool: SqlitePool,
}

impl SqliteBlobStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn open_read_only(path: &Path, max_connections: u32) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::new().filename(path).read_only(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        Ok(Self::new(pool))
    }
}

#[async_trait]
impl BlobFetcher for SqliteBlobStore {
    async fn fetch(&self, key: &str) -> Result<Bytes, FetchError> {
        let value: Vec<u8> = sqlx::query_scalar("SELECT v FROM map WHERE k = ? LIMIT 1")
            .bind(key)
            .fetch_one(&self.pool)
            .await?;
        Ok(Bytes::from(value))
    }

    async fn ping(&self) -> Option<Result<(), FetchError>> {
        Some(
            sqlx::query("SELECT 1")
                .execute(&self.pool)
                .await
                .map(|_| ())
                .map_err(|err| FetchError::Backend(err.to_string())),
        )
    }
}

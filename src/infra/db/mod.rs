//! SQLite-backed access to the `map(k, v)` lookup tables.
//!
//! Both backing tables share one shape: the identifier table maps a local
//! catalog identifier to a DOI, the citation table holds directed DOI to DOI
//! edges. The files are produced offline and opened read-only here.

use std::path::Path;

use sqlx::{
    FromRow, QueryBuilder, Sqlite,
    sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions},
};
use thiserror::Error;

/// Chunk size for `IN (…)` selects. SQLite rejects statements beyond its
/// bound-parameter ceiling (SQLITE_LIMIT_VARIABLE_NUMBER, default 999), so
/// batches stay well below it.
const BATCH_SIZE: usize = 500;

/// One row of a lookup table.
#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct Pair {
    pub k: String,
    pub v: String,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("row not found")]
    NotFound,
    #[error("query failed: {0}")]
    Query(sqlx::Error),
}

pub fn map_store_error(err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::RowNotFound => StoreError::NotFound,
        other => StoreError::Query(other),
    }
}

/// Typed handle on one `map(k, v)` table.
#[derive(Debug, Clone)]
pub struct MapStore {
    pool: SqlitePool,
}

impl MapStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Opens the backing file read-only with a dedicated pool.
    pub async fn open_read_only(path: &Path, max_connections: u32) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::new().filename(path).read_only(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// The single value for a key.
    pub async fn get_value(&self, key: &str) -> Result<String, StoreError> {
        sqlx::query_scalar("SELECT v FROM map WHERE k = ? LIMIT 1")
            .bind(key)
            .fetch_one(&self.pool)
            .await
            .map_err(map_store_error)
    }

    /// The inverse lookup. Several keys may share a value; one arbitrary row
    /// wins, which is acceptable for the best-effort DOI redirect.
    pub async fn get_key(&self, value: &str) -> Result<String, StoreError> {
        sqlx::query_scalar("SELECT k FROM map WHERE v = ? LIMIT 1")
            .bind(value)
            .fetch_one(&self.pool)
            .await
            .map_err(map_store_error)
    }

    /// Edges whose key side matches, i.e. outbound edges of a DOI.
    pub async fn select_outbound(&self, key: &str) -> Result<Vec<Pair>, StoreError> {
        sqlx::query_as("SELECT k, v FROM map WHERE k = ?")
            .bind(key)
            .fetch_all(&self.pool)
            .await
            .map_err(map_store_error)
    }

    /// Edges whose value side matches, i.e. inbound edges of a DOI.
    pub async fn select_inbound(&self, value: &str) -> Result<Vec<Pair>, StoreError> {
        sqlx::query_as("SELECT k, v FROM map WHERE v = ?")
            .bind(value)
            .fetch_all(&self.pool)
            .await
            .map_err(map_store_error)
    }

    /// Reverse-maps an arbitrary number of values. Batches are issued
    /// sequentially and concatenated; rows keep whatever duplication the
    /// table has.
    pub async fn batch_by_value(&self, values: &[String]) -> Result<Vec<Pair>, StoreError> {
        let mut rows = Vec::new();
        for chunk in values.chunks(BATCH_SIZE) {
            let mut builder: QueryBuilder<Sqlite> =
                QueryBuilder::new("SELECT k, v FROM map WHERE v IN (");
            let mut separated = builder.separated(", ");
            for value in chunk {
                separated.push_bind(value);
            }
            separated.push_unseparated(")");
            let batch: Vec<Pair> = builder
                .build_query_as()
                .fetch_all(&self.pool)
                .await
                .map_err(map_store_error)?;
            rows.extend(batch);
        }
        Ok(rows)
    }

    pub async fn health_check(&self) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT 1").execute(&self.pool).await.map(|_| ())
    }
}

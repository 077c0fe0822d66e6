//! HTTP surface: routes, shared state and the stats middleware.

mod error;
mod handlers;
mod middleware;

pub use error::ApiError;

use std::sync::Arc;

use axum::{Router, middleware::from_fn_with_state, routing::get};

use crate::application::fusion::CitationFusion;
use crate::cache::ResponseCache;
use crate::infra::blob::BlobFetcher;
use crate::infra::db::MapStore;
use crate::infra::stats::Stats;

#[derive(Clone)]
pub struct AppState {
    pub fusion: Arc<CitationFusion>,
    pub identifier: MapStore,
    pub citation: MapStore,
    pub blobs: Arc<dyn BlobFetcher>,
    pub cache: Option<Arc<ResponseCache>>,
    pub stats: Arc<Stats>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::index))
        .route(
            "/cache",
            get(handlers::cache_info).delete(handlers::cache_purge),
        )
        // DOIs contain slashes, so the segment is a wildcard.
        .route("/doi/{*doi}", get(handlers::doi_redirect))
        .route("/id/{id}", get(handlers::local_id))
        .route("/stats", get(handlers::stats_dump))
        .route("/_health", get(handlers::health))
        .layer(from_fn_with_state(
            state.stats.clone(),
            middleware::record_request_stats,
        ))
        .with_state(state)
}

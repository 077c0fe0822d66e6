use std::process;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use crate::application::fusion::FusionError;
use crate::infra::db::StoreError;

use super::{ApiError, AppState};

/// Plain-text banner with the process id and the reachable endpoints.
pub async fn index(headers: HeaderMap) -> Response {
    let host = headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("localhost");
    let banner = format!(
        r#"legame citation fusion service

Pid: {pid}

Available endpoints:

    GET     /
    GET     /cache
    DELETE  /cache
    GET     /doi/{{doi}}
    GET     /id/{{id}}
    GET     /stats
    GET     /_health

Example:

    http://{host}/id/ai-49-aHR0cDovL2R4LmRvaS5vcmcvMTAuMTA3My9wbmFzLjg1LjguMjQ0NA
"#,
        pid = process::id(),
    );
    (StatusCode::OK, banner).into_response()
}

/// `{"count": N, "path": "…"}`; an empty body when the cache is disabled.
pub async fn cache_info(State(state): State<AppState>) -> Response {
    let Some(cache) = &state.cache else {
        return StatusCode::OK.into_response();
    };
    match cache.item_count().await {
        Ok(count) => Json(json!({"count": count, "path": cache.path()})).into_response(),
        Err(err) => ApiError::internal(format!("cache count: {err}")).into_response(),
    }
}

pub async fn cache_purge(State(state): State<AppState>) -> Response {
    let Some(cache) = &state.cache else {
        return StatusCode::OK.into_response();
    };
    match cache.flush().await {
        Ok(()) => {
            info!("flushed cache");
            StatusCode::OK.into_response()
        }
        Err(err) => ApiError::internal(format!("cache flush: {err}")).into_response(),
    }
}

/// Redirects a DOI to its local id handler, best-effort: when several local
/// ids share the DOI an arbitrary one wins.
pub async fn doi_redirect(State(state): State<AppState>, Path(doi): Path<String>) -> Response {
    match state.identifier.get_key(&doi).await {
        Ok(id) => (
            StatusCode::TEMPORARY_REDIRECT,
            [
                (header::LOCATION, format!("/id/{id}")),
                (header::CONTENT_TYPE, "text/plain".to_string()),
            ],
        )
            .into_response(),
        Err(StoreError::NotFound) => (
            StatusCode::NOT_FOUND,
            [(header::CONTENT_TYPE, "application/json")],
            r#"{"msg": "no id found", "status": 404}"#,
        )
            .into_response(),
        Err(err) => ApiError::internal(format!("doi lookup: {err}")).into_response(),
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct IdQuery {
    /// Institution tag (ISIL, e.g. `DE-14`) for the holdings filter.
    i: Option<String>,
}

/// The fusion pipeline endpoint.
pub async fn local_id(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<IdQuery>,
) -> Response {
    let isil = query.i.unwrap_or_default();
    match state.fusion.respond(&id, &isil).await {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            body,
        )
            .into_response(),
        // A record without any citation edges is a 404 with no body.
        Err(FusionError::NoEdges) => StatusCode::NOT_FOUND.into_response(),
        Err(err @ FusionError::UnknownId(_)) => ApiError::not_found(err.to_string()).into_response(),
        Err(err) => ApiError::internal(err.to_string()).into_response(),
    }
}

pub async fn stats_dump(State(state): State<AppState>) -> Response {
    Json(state.stats.snapshot()).into_response()
}

/// Pings every backing store. The blob backend may not expose a health
/// capability at all; that is only worth a warning.
pub async fn health(State(state): State<AppState>) -> Response {
    if let Err(err) = state.identifier.health_check().await {
        return ApiError::unavailable(format!("identifier store: {err}")).into_response();
    }
    if let Err(err) = state.citation.health_check().await {
        return ApiError::unavailable(format!("citation store: {err}")).into_response();
    }
    match state.blobs.ping().await {
        Some(Ok(())) => {}
        Some(Err(err)) => {
            return ApiError::unavailable(format!("index data store: {err}")).into_response();
        }
        None => warn!("index data store does not report health"),
    }
    StatusCode::OK.into_response()
}

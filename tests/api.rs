//! End-to-end tests: the real router over in-memory SQLite stores and a
//! map-backed blob fetcher.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode, header};
use bytes::Bytes;
use http_body_util::BodyExt;
use serde_json::{Value, json};
use sqlx::sqlite::SqlitePoolOptions;
use tempfile::TempDir;
use tower::ServiceExt;

use legame::application::fusion::CitationFusion;
use legame::cache::ResponseCache;
use legame::infra::blob::{BlobFetcher, FetchError};
use legame::infra::db::MapStore;
use legame::infra::http::{AppState, build_router};
use legame::infra::stats::Stats;

#[derive(Debug, Default)]
struct MemoryBlobs {
    entries: HashMap<String, Bytes>,
}

impl MemoryBlobs {
    fn with(entries: &[(&str, &str)]) -> Self {
        Self {
            entries: entries
                .iter()
                .map(|(key, blob)| (key.to_string(), Bytes::copy_from_slice(blob.as_bytes())))
                .collect(),
        }
    }
}

#[async_trait]
impl BlobFetcher for MemoryBlobs {
    async fn fetch(&self, key: &str) -> Result<Bytes, FetchError> {
        self.entries.get(key).cloned().ok_or(FetchError::NotFound)
    }
}

async fn map_store(rows: &[(&str, &str)]) -> MapStore {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory pool");
    sqlx::query("CREATE TABLE map (k TEXT, v TEXT)")
        .execute(&pool)
        .await
        .expect("schema");
    for (k, v) in rows {
        sqlx::query("INSERT INTO map (k, v) VALUES (?, ?)")
            .bind(k)
            .bind(v)
            .execute(&pool)
            .await
            .expect("seed row");
    }
    MapStore::new(pool)
}

struct Fixture {
    router: Router,
    stats: Arc<Stats>,
}

async fn fixture(
    identifier_rows: &[(&str, &str)],
    citation_rows: &[(&str, &str)],
    blobs: MemoryBlobs,
    cache: Option<Arc<ResponseCache>>,
    trigger: Duration,
) -> Fixture {
    let identifier = map_store(identifier_rows).await;
    let citation = map_store(citation_rows).await;
    let blobs: Arc<dyn BlobFetcher> = Arc::new(blobs);
    let stats = Arc::new(Stats::new());
    let fusion = Arc::new(CitationFusion::new(
        identifier.clone(),
        citation.clone(),
        blobs.clone(),
        cache.clone(),
        trigger,
        stats.clone(),
        false,
    ));
    let router = build_router(AppState {
        fusion,
        identifier,
        citation,
        blobs,
        cache,
        stats: stats.clone(),
    });
    Fixture { router, stats }
}

/// The default dataset: L1 resolves to D1, D1 cites D2, D3 cites D1, and
/// both neighbors have local records with metadata.
async fn default_fixture() -> Fixture {
    fixture(
        &[("L1", "D1"), ("L2", "D2"), ("L3", "D3")],
        &[("D1", "D2"), ("D3", "D1")],
        MemoryBlobs::with(&[
            ("L2", r#"{"title":"two"}"#),
            ("L3", r#"{"title":"three"}"#),
        ]),
        None,
        Duration::from_millis(250),
    )
    .await
}

async fn send(router: &Router, method: Method, uri: &str) -> (StatusCode, Option<String>, Bytes) {
    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    let status = response.status();
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let body = response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes();
    (status, content_type, body)
}

async fn get(router: &Router, uri: &str) -> (StatusCode, Option<String>, Bytes) {
    send(router, Method::GET, uri).await
}

fn decode(body: &Bytes) -> Value {
    serde_json::from_slice(body).expect("json body")
}

#[tokio::test]
async fn happy_path_fuses_both_directions() {
    let fx = default_fixture().await;
    let (status, content_type, body) = get(&fx.router, "/id/L1").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(content_type.as_deref(), Some("application/json"));

    let value = decode(&body);
    assert_eq!(value["id"], "L1");
    assert_eq!(value["doi"], "D1");
    assert_eq!(value["citing"], json!([{"title": "two"}]));
    assert_eq!(value["cited"], json!([{"title": "three"}]));
    assert_eq!(value["extra"]["citing_count"], 1);
    assert_eq!(value["extra"]["cited_count"], 1);
    assert_eq!(value["extra"]["unmatched_citing_count"], 0);
    assert_eq!(value["extra"]["unmatched_cited_count"], 0);
    assert_eq!(value["extra"]["cached"], false);
    assert!(value["extra"]["took"].as_f64().expect("took is a number") >= 0.0);
}

#[tokio::test]
async fn unmapped_doi_lands_in_unmatched() {
    // D2 has no local record at all.
    let fx = fixture(
        &[("L1", "D1"), ("L3", "D3")],
        &[("D1", "D2"), ("D3", "D1")],
        MemoryBlobs::with(&[("L3", r#"{"title":"three"}"#)]),
        None,
        Duration::from_millis(250),
    )
    .await;
    let (status, _, body) = get(&fx.router, "/id/L1").await;

    assert_eq!(status, StatusCode::OK);
    let value = decode(&body);
    assert!(value.get("citing").is_none());
    assert_eq!(value["unmatched"]["citing"], json!([{"doi_str_mv": "D2"}]));
    assert_eq!(value["extra"]["citing_count"], 0);
    assert_eq!(value["extra"]["cited_count"], 1);
    assert_eq!(value["extra"]["unmatched_citing_count"], 1);
    assert_eq!(value["extra"]["unmatched_cited_count"], 0);
}

#[tokio::test]
async fn missing_blob_is_skipped_silently() {
    let fx = fixture(
        &[("L1", "D1"), ("L2", "D2"), ("L3", "D3")],
        &[("D1", "D2"), ("D3", "D1")],
        MemoryBlobs::with(&[("L3", r#"{"title":"three"}"#)]),
        None,
        Duration::from_millis(250),
    )
    .await;
    let (status, _, body) = get(&fx.router, "/id/L1").await;

    assert_eq!(status, StatusCode::OK);
    let value = decode(&body);
    // L2 maps D2 but its record was never ingested: not matched, not
    // unmatched either.
    assert!(value.get("citing").is_none());
    assert_eq!(value["cited"], json!([{"title": "three"}]));
    assert_eq!(value["extra"]["citing_count"], 0);
    assert_eq!(value["extra"]["cited_count"], 1);
    assert_eq!(value["extra"]["unmatched_citing_count"], 0);
    assert_eq!(value["extra"]["unmatched_cited_count"], 0);
    assert!(value["unmatched"].as_object().expect("unmatched object").is_empty());
}

#[tokio::test]
async fn non_json_blob_passes_through_untouched_without_filter() {
    // Blob contents are opaque outside the holdings filter; whatever the
    // store returned is spliced into the body verbatim.
    let fx = fixture(
        &[("L1", "D1"), ("L2", "D2")],
        &[("D1", "D2")],
        MemoryBlobs::with(&[("L2", "plainly not json <>")]),
        None,
        Duration::from_millis(250),
    )
    .await;
    let (status, content_type, body) = get(&fx.router, "/id/L1").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(content_type.as_deref(), Some("application/json"));
    let text = String::from_utf8_lossy(&body);
    assert!(text.contains(r#""citing":[plainly not json <>]"#));
}

#[tokio::test]
async fn non_json_blob_fails_the_filtered_request() {
    // The holdings filter is the only consumer of blob contents; a blob it
    // cannot parse means the index data itself is broken.
    let fx = fixture(
        &[("L1", "D1"), ("L2", "D2")],
        &[("D1", "D2")],
        MemoryBlobs::with(&[("L2", "plainly not json <>")]),
        None,
        Duration::from_millis(250),
    )
    .await;
    let (status, _, body) = get(&fx.router, "/id/L1?i=DE-14").await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    let value = decode(&body);
    assert_eq!(value["status"], 500);
    assert!(
        value["err"]
            .as_str()
            .expect("err message")
            .contains("internal data broken")
    );
}

#[tokio::test]
async fn record_without_edges_is_a_bodyless_404() {
    let fx = fixture(
        &[("L1", "D1")],
        &[("D7", "D8")],
        MemoryBlobs::default(),
        None,
        Duration::from_millis(250),
    )
    .await;
    let (status, _, body) = get(&fx.router, "/id/L1").await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body.is_empty());
}

#[tokio::test]
async fn unknown_id_is_a_json_404() {
    let fx = default_fixture().await;
    let (status, _, body) = get(&fx.router, "/id/NOPE").await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    let value = decode(&body);
    assert_eq!(value["status"], 404);
    assert!(value["err"].as_str().expect("err message").contains("NOPE"));
}

#[tokio::test]
async fn doi_in_both_directions_counts_as_citing() {
    // D1 cites D2 and D2 cites D1; the outbound classification wins.
    let fx = fixture(
        &[("L1", "D1"), ("L2", "D2")],
        &[("D1", "D2"), ("D2", "D1")],
        MemoryBlobs::with(&[("L2", r#"{"title":"two"}"#)]),
        None,
        Duration::from_millis(250),
    )
    .await;
    let (status, _, body) = get(&fx.router, "/id/L1").await;

    assert_eq!(status, StatusCode::OK);
    let value = decode(&body);
    assert_eq!(value["citing"], json!([{"title": "two"}]));
    assert!(value.get("cited").is_none());
    assert_eq!(value["extra"]["citing_count"], 1);
    assert_eq!(value["extra"]["cited_count"], 0);
}

#[tokio::test]
async fn unmatched_tiebreak_prefers_citing() {
    let fx = fixture(
        &[("L1", "D1")],
        &[("D1", "D2"), ("D2", "D1")],
        MemoryBlobs::default(),
        None,
        Duration::from_millis(250),
    )
    .await;
    let (status, _, body) = get(&fx.router, "/id/L1").await;

    assert_eq!(status, StatusCode::OK);
    let value = decode(&body);
    assert_eq!(value["unmatched"]["citing"], json!([{"doi_str_mv": "D2"}]));
    assert!(value["unmatched"].get("cited").is_none());
}

#[tokio::test]
async fn holdings_filter_partitions_by_institution() {
    let fx = fixture(
        &[("L1", "D1"), ("L2", "D2"), ("L3", "D3")],
        &[("D1", "D2"), ("D3", "D1")],
        MemoryBlobs::with(&[
            ("L2", r#"{"institution":["DE-14"],"title":"two"}"#),
            ("L3", r#"{"institution":["DE-15"],"title":"three"}"#),
        ]),
        None,
        Duration::from_millis(250),
    )
    .await;
    let (status, _, body) = get(&fx.router, "/id/L1?i=DE-14").await;

    assert_eq!(status, StatusCode::OK);
    let value = decode(&body);
    assert_eq!(
        value["citing"],
        json!([{"institution": ["DE-14"], "title": "two"}])
    );
    assert!(value.get("cited").is_none());
    assert_eq!(
        value["unmatched"]["cited"],
        json!([{"institution": ["DE-15"], "title": "three"}])
    );
    assert_eq!(value["extra"]["institution"], "DE-14");
    assert_eq!(value["extra"]["citing_count"], 1);
    assert_eq!(value["extra"]["cited_count"], 0);
    assert_eq!(value["extra"]["unmatched_cited_count"], 1);
}

#[tokio::test]
async fn expensive_responses_cache_and_serve_with_fresh_took() {
    let dir = TempDir::new().expect("tempdir");
    let cache = Arc::new(
        ResponseCache::open(&dir.path().join("cache.db"), None)
            .await
            .expect("open cache"),
    );
    // A zero trigger makes every request expensive.
    let fx = fixture(
        &[("L1", "D1"), ("L2", "D2"), ("L3", "D3")],
        &[("D1", "D2"), ("D3", "D1")],
        MemoryBlobs::with(&[
            ("L2", r#"{"title":"two"}"#),
            ("L3", r#"{"title":"three"}"#),
        ]),
        Some(cache.clone()),
        Duration::ZERO,
    )
    .await;

    let (status, _, body) = get(&fx.router, "/id/L1").await;
    assert_eq!(status, StatusCode::OK);
    let first = decode(&body);
    assert_eq!(first["extra"]["cached"], true);
    assert_eq!(cache.item_count().await.expect("count"), 1);
    assert_eq!(fx.stats.timer_count("cache_hit"), 0);

    // The stored entry is a zstd frame of the unfiltered body and reports
    // itself as cached.
    let stored = cache.get("L1").await.expect("stored entry");
    let decompressed = zstd::decode_all(stored.as_ref()).expect("zstd frame");
    let entry: Value = serde_json::from_slice(&decompressed).expect("stored json");
    assert_eq!(entry["extra"]["cached"], true);
    assert_eq!(entry["citing"], json!([{"title": "two"}]));

    let (status, content_type, body) = get(&fx.router, "/id/L1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(content_type.as_deref(), Some("application/json"));
    let second = decode(&body);
    assert_eq!(second["extra"]["cached"], true);
    assert_eq!(second["citing"], json!([{"title": "two"}]));
    assert!(second["extra"]["took"].as_f64().expect("took number") >= 0.0);
    assert_eq!(fx.stats.timer_count("cache_hit"), 1);
}

#[tokio::test]
async fn cache_hit_applies_the_holdings_filter() {
    let dir = TempDir::new().expect("tempdir");
    let cache = Arc::new(
        ResponseCache::open(&dir.path().join("cache.db"), None)
            .await
            .expect("open cache"),
    );
    let fx = fixture(
        &[("L1", "D1"), ("L2", "D2"), ("L3", "D3")],
        &[("D1", "D2"), ("D3", "D1")],
        MemoryBlobs::with(&[
            ("L2", r#"{"institution":["DE-14"]}"#),
            ("L3", r#"{"institution":["DE-15"]}"#),
        ]),
        Some(cache.clone()),
        Duration::ZERO,
    )
    .await;

    // First request caches the unfiltered response.
    let (status, _, _) = get(&fx.router, "/id/L1").await;
    assert_eq!(status, StatusCode::OK);

    // Second request is served from the cache with the filter applied.
    let (status, _, body) = get(&fx.router, "/id/L1?i=DE-14").await;
    assert_eq!(status, StatusCode::OK);
    let value = decode(&body);
    assert_eq!(value["citing"], json!([{"institution": ["DE-14"]}]));
    assert_eq!(value["unmatched"]["cited"], json!([{"institution": ["DE-15"]}]));
    assert_eq!(value["extra"]["institution"], "DE-14");
    assert_eq!(value["extra"]["cached"], true);
    assert_eq!(fx.stats.timer_count("cache_hit"), 1);

    // The cached entry itself stays unfiltered.
    let stored = cache.get("L1").await.expect("stored entry");
    let decompressed = zstd::decode_all(stored.as_ref()).expect("zstd frame");
    let entry: Value = serde_json::from_slice(&decompressed).expect("stored json");
    assert!(entry["extra"].get("institution").is_none());
}

#[tokio::test]
async fn doi_route_redirects_to_the_local_id() {
    let fx = fixture(
        &[("L1", "10.123/abc")],
        &[],
        MemoryBlobs::default(),
        None,
        Duration::from_millis(250),
    )
    .await;

    let response = fx
        .router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/doi/10.123/abc")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
    assert_eq!(
        response
            .headers()
            .get(header::LOCATION)
            .and_then(|value| value.to_str().ok()),
        Some("/id/L1")
    );
    assert_eq!(
        response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok()),
        Some("text/plain")
    );
}

#[tokio::test]
async fn unknown_doi_returns_the_fixed_404_body() {
    let fx = default_fixture().await;
    let (status, _, body) = get(&fx.router, "/doi/10.999/none").await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    let value = decode(&body);
    assert_eq!(value["msg"], "no id found");
    assert_eq!(value["status"], 404);
}

#[tokio::test]
async fn cache_admin_routes_report_and_flush() {
    let dir = TempDir::new().expect("tempdir");
    let cache = Arc::new(
        ResponseCache::open(&dir.path().join("cache.db"), None)
            .await
            .expect("open cache"),
    );
    cache.set("L1", b"payload").await.expect("seed entry");

    let fx = fixture(
        &[("L1", "D1")],
        &[],
        MemoryBlobs::default(),
        Some(cache.clone()),
        Duration::from_millis(250),
    )
    .await;

    let (status, _, body) = get(&fx.router, "/cache").await;
    assert_eq!(status, StatusCode::OK);
    let value = decode(&body);
    assert_eq!(value["count"], 1);
    assert!(value["path"].as_str().expect("path").ends_with("cache.db"));

    let (status, _, body) = send(&fx.router, Method::DELETE, "/cache").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.is_empty());
    assert_eq!(cache.item_count().await.expect("count"), 0);
}

#[tokio::test]
async fn cache_routes_answer_empty_when_disabled() {
    let fx = default_fixture().await;

    let (status, _, body) = get(&fx.router, "/cache").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.is_empty());

    let (status, _, body) = send(&fx.router, Method::DELETE, "/cache").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.is_empty());
}

#[tokio::test]
async fn stats_route_reports_requests_and_statuses() {
    let fx = default_fixture().await;

    let (status, _, _) = get(&fx.router, "/id/L1").await;
    assert_eq!(status, StatusCode::OK);
    let (status, _, _) = get(&fx.router, "/id/NOPE").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, body) = get(&fx.router, "/stats").await;
    assert_eq!(status, StatusCode::OK);
    let value = decode(&body);
    assert_eq!(value["counters"]["requests_total"], 2);
    assert_eq!(value["counters"]["GET /id/{id}"], 2);
    assert_eq!(value["status_codes"]["200"], 1);
    assert_eq!(value["status_codes"]["404"], 1);
    assert!(value["timers"]["sql_query"]["count"].as_u64().expect("count") >= 1);
}

#[tokio::test]
async fn banner_names_the_process() {
    let fx = default_fixture().await;
    let (status, _, body) = get(&fx.router, "/").await;

    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8(body.to_vec()).expect("utf-8 banner");
    assert!(text.contains("Pid:"));
    assert!(text.contains("/id/{id}"));
}

#[tokio::test]
async fn health_reports_ok_without_a_blob_capability() {
    let fx = default_fixture().await;
    let (status, _, _) = get(&fx.router, "/_health").await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn cancelled_request_terminates_without_a_partial_cache_entry() {
    let dir = TempDir::new().expect("tempdir");
    let cache = Arc::new(
        ResponseCache::open(&dir.path().join("cache.db"), None)
            .await
            .expect("open cache"),
    );
    let identifier = map_store(&[("L1", "D1"), ("L2", "D2")]).await;
    let citation = map_store(&[("D1", "D2")]).await;
    let blobs: Arc<dyn BlobFetcher> = Arc::new(MemoryBlobs::with(&[("L2", r#"{"title":"two"}"#)]));
    let stats = Arc::new(Stats::new());
    let fusion = CitationFusion::new(
        identifier,
        citation,
        blobs,
        Some(cache.clone()),
        Duration::ZERO,
        stats,
        false,
    );

    // A disconnecting client drops the pipeline future mid-flight; the
    // timeout reproduces that drop after the first suspension point. The
    // abandoned run logs at debug level and writes nothing.
    let cancelled = tokio::time::timeout(Duration::ZERO, fusion.respond("L1", "")).await;
    assert!(cancelled.is_err());
    assert_eq!(cache.item_count().await.expect("count"), 0);

    // The service is unaffected: a full run completes and caches.
    let body = fusion.respond("L1", "").await.expect("full run");
    let value: Value = serde_json::from_slice(&body).expect("json body");
    assert_eq!(value["extra"]["cached"], true);
    assert_eq!(cache.item_count().await.expect("count"), 1);
}

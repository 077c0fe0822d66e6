//! The fusion pipeline behind `/id/{id}`.
//!
//! A strictly sequential nine-step pipeline: cache probe, identifier
//! resolution, citation edge fetch, reverse mapping, unmatched bookkeeping,
//! blob hydration, count finalization, expensive-request caching, optional
//! holdings filter. Any step may short-circuit the response.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use once_cell::sync::Lazy;
use regex::bytes::Regex;
use thiserror::Error;
use tracing::{debug, error};

use crate::cache::{CacheError, ResponseCache};
use crate::domain::response::{FilterError, FusedResponse, RawBlob};
use crate::domain::set::StringSet;
use crate::infra::blob::{BlobFetcher, FetchError};
use crate::infra::db::{MapStore, StoreError};
use crate::infra::stats::Stats;
use crate::util::stopwatch::StopWatch;

/// Cached bodies carry exactly one `"took":<seconds>` literal which is
/// rewritten on every hit.
static TOOK_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""took":[0-9.]+"#).expect("took pattern is a valid regex"));

const COMPRESSION_LEVEL: i32 = 3;

#[derive(Debug, Error)]
pub enum FusionError {
    /// The local identifier has no DOI mapping.
    #[error("no doi found for id {0}")]
    UnknownId(String),
    /// The DOI exists but carries no citation edges at all.
    #[error("no citation edges")]
    NoEdges,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("index data fetch: {0}")]
    Fetch(FetchError),
    #[error("cache: {0}")]
    Cache(CacheError),
    /// A cache entry failed to decompress or decode.
    #[error("cache entry broken: {0}")]
    CacheEntry(String),
    /// Stored index data failed to parse during filtering.
    #[error("internal data broken: {0}")]
    BrokenData(String),
    #[error("encode: {0}")]
    Encode(#[from] serde_json::Error),
    /// A program invariant was violated; indicates a bug or in-flight data
    /// change, never silent success.
    #[error("{0}")]
    Internal(String),
}

impl From<FilterError> for FusionError {
    fn from(err: FilterError) -> Self {
        FusionError::BrokenData(err.to_string())
    }
}

/// Joins the three data sources required for index and citation data
/// fusion: the identifier store maps local ids to DOIs, the citation store
/// holds directed DOI to DOI edges from the OCI/COCI corpus, and the blob
/// fetcher yields a metadata document per local id.
pub struct CitationFusion {
    identifier: MapStore,
    citation: MapStore,
    blobs: Arc<dyn BlobFetcher>,
    cache: Option<Arc<ResponseCache>>,
    cache_trigger: Duration,
    stats: Arc<Stats>,
    stopwatch_enabled: bool,
}

impl CitationFusion {
    pub fn new(
        identifier: MapStore,
        citation: MapStore,
        blobs: Arc<dyn BlobFetcher>,
        cache: Option<Arc<ResponseCache>>,
        cache_trigger: Duration,
        stats: Arc<Stats>,
        stopwatch_enabled: bool,
    ) -> Self {
        Self {
            identifier,
            citation,
            blobs,
            cache,
            cache_trigger,
            stats,
            stopwatch_enabled,
        }
    }

    /// Runs the pipeline for one local identifier and returns the JSON
    /// body. `isil` is the optional institution tag from the `i` query
    /// parameter; empty means unfiltered.
    ///
    /// A disconnected client drops this future at an await point. The
    /// guard observes the abandoned run and logs it at debug level;
    /// nothing past the suspension point executes, so no response body and
    /// no partial cache entry is written on that path.
    pub async fn respond(&self, id: &str, isil: &str) -> Result<Bytes, FusionError> {
        let mut guard = CancelGuard::new(id);
        let result = self.run(id, isil).await;
        guard.disarm();
        result
    }

    async fn run(&self, id: &str, isil: &str) -> Result<Bytes, FusionError> {
        let started = Instant::now();
        let mut sw = StopWatch::new(self.stopwatch_enabled);
        sw.record(format!("[{isil}] started query: {id}"));

        // (0) Check the cache first.
        if let Some(cache) = &self.cache {
            let probe = Instant::now();
            match cache.get(id).await {
                Ok(compressed) => {
                    let body = serve_cached(&compressed, isil, started, &mut sw)?;
                    self.stats.measure_since("cache_hit", probe);
                    sw.record("sent cached value");
                    sw.log_table();
                    return Ok(body);
                }
                Err(CacheError::NotFound) => {}
                // Any other probe failure is just a miss; the pipeline can
                // always recompute.
                Err(err) => debug!(id, error = %err, "cache probe failed"),
            }
        }

        // (1) Get the DOI for the local id; or get out.
        let t = Instant::now();
        let doi = match self.identifier.get_value(id).await {
            Ok(doi) => doi,
            Err(StoreError::NotFound) => return Err(FusionError::UnknownId(id.to_string())),
            Err(err) => return Err(err.into()),
        };
        self.stats.measure_since("sql_query", t);
        sw.record(format!("found doi: {doi}"));

        let mut response = FusedResponse {
            id: id.to_string(),
            doi: doi.clone(),
            ..Default::default()
        };

        // (2) Outbound and inbound edges.
        let t = Instant::now();
        let citing = self.citation.select_outbound(&doi).await?;
        self.stats.measure_since("sql_query", t);
        let t = Instant::now();
        let cited = self.citation.select_inbound(&doi).await?;
        self.stats.measure_since("sql_query", t);
        sw.record(format!(
            "found {} outbound and {} inbound edges",
            citing.len(),
            cited.len()
        ));

        // (3) The distinct set of DOI whose documents we want.
        let outbound: StringSet = citing.iter().map(|pair| pair.v.as_str()).collect();
        let inbound: StringSet = cited.iter().map(|pair| pair.k.as_str()).collect();
        let universe = outbound.union(&inbound);
        if universe.is_empty() {
            debug!(id, "no citations found");
            return Err(FusionError::NoEdges);
        }

        // (4) Map relevant DOI back to local identifiers.
        let t = Instant::now();
        let values: Vec<String> = universe.iter().map(str::to_string).collect();
        let ids = self.identifier.batch_by_value(&values).await?;
        self.stats.measure_since("sql_query", t);
        sw.record(format!("mapped {} dois back to ids", universe.len()));

        // (5) DOI without a local id only contribute a synthetic stub.
        let matched: StringSet = ids.iter().map(|pair| pair.v.as_str()).collect();
        for doi in universe.difference(&matched).iter() {
            let stub = unmatched_doi_stub(doi)?;
            if outbound.contains(doi) {
                response.unmatched.citing.push(stub);
            } else if inbound.contains(doi) {
                response.unmatched.cited.push(stub);
            } else {
                error!(doi, "unmatched doi is in neither edge set");
                return Err(FusionError::Internal(
                    "unmatched doi is in neither edge set".to_string(),
                ));
            }
        }
        sw.record("recorded unmatched ids");

        // (6) Hydrate matched rows with their metadata blobs. The blob
        // store is content-agnostic; documents pass through unparsed.
        for pair in &ids {
            let t = Instant::now();
            let fetched = self.blobs.fetch(&pair.k).await;
            self.stats.measure_since("index_data_fetch", t);
            let bytes = match fetched {
                Ok(bytes) => bytes,
                // Expected: the catalog references DOI whose records were
                // not yet ingested.
                Err(FetchError::NotFound) => continue,
                Err(err) => return Err(FusionError::Fetch(err)),
            };
            if outbound.contains(&pair.v) {
                response.citing.push(RawBlob::new(bytes));
            } else if inbound.contains(&pair.v) {
                response.cited.push(RawBlob::new(bytes));
            }
        }
        sw.record(format!("fetched {} blobs from index data store", ids.len()));

        // (7) Finalize counts and timing.
        response.update_counts();
        response.extra.took = started.elapsed().as_secs_f64();

        // (8) Cache expensive responses, unfiltered.
        if let Some(cache) = &self.cache {
            if started.elapsed() > self.cache_trigger {
                let t = Instant::now();
                response.extra.cached = true;
                let encoded = response.to_bytes()?;
                let compressed = zstd::encode_all(encoded.as_slice(), COMPRESSION_LEVEL)
                    .map_err(|err| FusionError::CacheEntry(format!("compress: {err}")))?;
                match cache.set(id, &compressed).await {
                    Ok(()) => {
                        self.stats.measure_since("cached", t);
                        sw.record("cached value");
                    }
                    Err(CacheError::ReadOnly) => {}
                    Err(err) => return Err(FusionError::Cache(err)),
                }
            }
        }

        // (9) Optional: tailor the response to one institution's holdings.
        if !isil.is_empty() {
            response.apply_institution_filter(isil)?;
            sw.record("applied institution filter");
        }

        let body = response.to_bytes()?;
        sw.record("sent response");
        sw.log_table();
        Ok(Bytes::from(body))
    }
}

/// Observes abandonment of an in-flight pipeline run. Dropping the request
/// future is how a client disconnect surfaces; the guard's drop runs at
/// that moment and is the only code that does.
struct CancelGuard<'a> {
    id: &'a str,
    armed: bool,
}

impl<'a> CancelGuard<'a> {
    fn new(id: &'a str) -> Self {
        Self { id, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for CancelGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            debug!(id = self.id, "request cancelled, aborting pipeline");
        }
    }
}

/// Serves a cache hit: decompress, refresh the stored `took` with the wall
/// time of this request, and re-filter when an institution tag is present.
fn serve_cached(
    compressed: &[u8],
    isil: &str,
    started: Instant,
    sw: &mut StopWatch,
) -> Result<Bytes, FusionError> {
    let decompressed = zstd::decode_all(compressed)
        .map_err(|err| FusionError::CacheEntry(format!("decompress: {err}")))?;
    sw.record(format!("retrieved value ({}b) from cache", compressed.len()));

    let rewritten = rewrite_took(&decompressed, started.elapsed().as_secs_f64());
    if isil.is_empty() {
        return Ok(Bytes::from(rewritten));
    }

    let mut response: FusedResponse = serde_json::from_slice(&rewritten)
        .map_err(|err| FusionError::CacheEntry(format!("json decode: {err}")))?;
    response.apply_institution_filter(isil)?;
    sw.record("applied institution filter");
    Ok(Bytes::from(response.to_bytes()?))
}

/// Replaces the single `"took":<number>` literal with a fresh value.
fn rewrite_took(body: &[u8], seconds: f64) -> Vec<u8> {
    let took = format!(r#""took":{seconds:.6}"#);
    TOOK_PATTERN.replace(body, took.as_bytes()).into_owned()
}

/// Synthetic stand-in for a record that has a DOI but no local metadata.
/// Built by literal concatenation; the DOI is JSON-escaped.
fn unmatched_doi_stub(doi: &str) -> Result<RawBlob, FusionError> {
    let quoted = serde_json::to_string(doi)?;
    Ok(RawBlob::new(Bytes::from(format!(
        r#"{{"doi_str_mv": {quoted}}}"#
    ))))
}

use std::{process, sync::Arc};

use legame::{
    application::fusion::CitationFusion,
    cache::ResponseCache,
    config,
    infra::{
        blob::{BlobFetcher, SqliteBlobStore},
        db::MapStore,
        error::InfraError,
        http::{self, AppState},
        stats::Stats,
        telemetry,
    },
};
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_startup_error(&error);
        process::exit(1);
    }
}

fn report_startup_error(error: &InfraError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "startup error");
        return;
    }

    // Telemetry may have failed before installation; log through a one-shot
    // subscriber instead of losing the message.
    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "startup error");
    });
}

async fn run() -> Result<(), InfraError> {
    let (_, settings) =
        config::load_with_cli().map_err(|err| InfraError::configuration(err.to_string()))?;
    telemetry::init(&settings.logging)?;

    let max_connections = settings.stores.max_connections.get();
    let identifier = MapStore::open_read_only(&settings.stores.identifier_path, max_connections)
        .await
        .map_err(|err| InfraError::store(settings.stores.identifier_path.display().to_string(), err))?;
    let citation = MapStore::open_read_only(&settings.stores.citation_path, max_connections)
        .await
        .map_err(|err| InfraError::store(settings.stores.citation_path.display().to_string(), err))?;
    let blobs: Arc<dyn BlobFetcher> = Arc::new(
        SqliteBlobStore::open_read_only(&settings.stores.blob_path, max_connections)
            .await
            .map_err(|err| InfraError::store(settings.stores.blob_path.display().to_string(), err))?,
    );

    let cache = match settings.cache.path.as_ref() {
        Some(path) => {
            let cache = ResponseCache::open(path, settings.cache.max_bytes)
                .await
                .map_err(|err| InfraError::store(path.display().to_string(), err))?;
            info!(path = %path.display(), trigger_ms = settings.cache.trigger.as_millis() as u64, "response cache enabled");
            Some(Arc::new(cache))
        }
        None => None,
    };

    let stats = Arc::new(Stats::new());
    let fusion = Arc::new(CitationFusion::new(
        identifier.clone(),
        citation.clone(),
        blobs.clone(),
        cache.clone(),
        settings.cache.trigger,
        stats.clone(),
        settings.stopwatch,
    ));

    let router = http::build_router(AppState {
        fusion,
        identifier,
        citation,
        blobs,
        cache,
        stats,
    });

    let listener = tokio::net::TcpListener::bind(settings.server.addr).await?;
    info!(addr = %settings.server.addr, pid = process::id(), "serving");
    axum::serve(listener, router.into_make_service()).await?;
    Ok(())
}

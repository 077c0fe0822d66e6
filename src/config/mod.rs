//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{net::SocketAddr, num::NonZeroU32, path::PathBuf, str::FromStr, time::Duration};

use clap::{Parser, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "legame";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 8;
const DEFAULT_CACHE_TRIGGER_MS: u64 = 250;
const DEFAULT_CACHE_MAX_BYTES: u64 = 4 * 1024 * 1024 * 1024;

/// Command-line arguments. The binary has a single mode, so every argument
/// is a flat override over file and environment configuration.
#[derive(Debug, Default, Parser)]
#[command(name = "legame", version, about = "Citation fusion query service")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "LEGAME_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the identifier database path (local id to DOI).
    #[arg(long = "identifier-db", value_name = "PATH")]
    pub identifier_db: Option<PathBuf>,

    /// Override the citation database path (DOI to DOI edges).
    #[arg(long = "citation-db", value_name = "PATH")]
    pub citation_db: Option<PathBuf>,

    /// Override the index data database path (local id to metadata blob).
    #[arg(long = "blob-db", value_name = "PATH")]
    pub blob_db: Option<PathBuf>,

    /// Override the per-store connection pool size.
    #[arg(long = "db-max-connections", value_name = "COUNT")]
    pub db_max_connections: Option<u32>,

    /// Override the response cache path. The cache stays disabled unless a
    /// path is configured here or in the file.
    #[arg(long = "cache-path", value_name = "PATH")]
    pub cache_path: Option<PathBuf>,

    /// Override the wall-time threshold beyond which a response is cached.
    #[arg(long = "cache-trigger-ms", value_name = "MILLIS")]
    pub cache_trigger_ms: Option<u64>,

    /// Override the cache size cap; the cache turns read-only beyond it.
    #[arg(long = "cache-max-bytes", value_name = "BYTES")]
    pub cache_max_bytes: Option<u64>,

    /// Enable the per-request stopwatch tracer.
    #[arg(long = "stopwatch", action = clap::ArgAction::SetTrue)]
    pub stopwatch: bool,
}

/// Fully-resolved deployment settings after precedence resolution and
/// validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub stores: StoreSettings,
    pub cache: CacheSettings,
    pub stopwatch: bool,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct StoreSettings {
    pub identifier_path: PathBuf,
    pub citation_path: PathBuf,
    pub blob_path: PathBuf,
    pub max_connections: NonZeroU32,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    /// Unset disables the cache entirely.
    pub path: Option<PathBuf>,
    pub trigger: Duration,
    pub max_bytes: Option<u64>,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix("LEGAME").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;
    raw.apply_overrides(cli);
    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both
/// for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    stores: RawStoreSettings,
    cache: RawCacheSettings,
    stopwatch: RawStopwatchSettings,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawStoreSettings {
    identifier_path: Option<PathBuf>,
    citation_path: Option<PathBuf>,
    blob_path: Option<PathBuf>,
    max_connections: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    path: Option<PathBuf>,
    trigger_ms: Option<u64>,
    max_bytes: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawStopwatchSettings {
    enabled: Option<bool>,
}

impl RawSettings {
    fn apply_overrides(&mut self, cli: &CliArgs) {
        if let Some(host) = cli.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = cli.server_port {
            self.server.port = Some(port);
        }
        if let Some(level) = cli.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = cli.log_json {
            self.logging.json = Some(json);
        }
        if let Some(path) = cli.identifier_db.as_ref() {
            self.stores.identifier_path = Some(path.clone());
        }
        if let Some(path) = cli.citation_db.as_ref() {
            self.stores.citation_path = Some(path.clone());
        }
        if let Some(path) = cli.blob_db.as_ref() {
            self.stores.blob_path = Some(path.clone());
        }
        if let Some(max) = cli.db_max_connections {
            self.stores.max_connections = Some(max);
        }
        if let Some(path) = cli.cache_path.as_ref() {
            self.cache.path = Some(path.clone());
        }
        if let Some(trigger) = cli.cache_trigger_ms {
            self.cache.trigger_ms = Some(trigger);
        }
        if let Some(max) = cli.cache_max_bytes {
            self.cache.max_bytes = Some(max);
        }
        if cli.stopwatch {
            self.stopwatch.enabled = Some(true);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            stores,
            cache,
            stopwatch,
        } = raw;

        Ok(Self {
            server: build_server_settings(server)?,
            logging: build_logging_settings(logging)?,
            stores: build_store_settings(stores)?,
            cache: build_cache_settings(cache)?,
            stopwatch: stopwatch.enabled.unwrap_or(false),
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());
    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }
    let candidate = format!("{host}:{port}");
    let addr = candidate
        .parse()
        .map_err(|err| LoadError::invalid("server.addr", format!("`{candidate}`: {err}")))?;
    Ok(ServerSettings { addr })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };
    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };
    Ok(LoggingSettings { level, format })
}

fn build_store_settings(stores: RawStoreSettings) -> Result<StoreSettings, LoadError> {
    let identifier_path = stores
        .identifier_path
        .ok_or_else(|| LoadError::invalid("stores.identifier_path", "path is required"))?;
    let citation_path = stores
        .citation_path
        .ok_or_else(|| LoadError::invalid("stores.citation_path", "path is required"))?;
    let blob_path = stores
        .blob_path
        .ok_or_else(|| LoadError::invalid("stores.blob_path", "path is required"))?;

    let max_value = stores.max_connections.unwrap_or(DEFAULT_DB_MAX_CONNECTIONS);
    let max_connections = NonZeroU32::new(max_value)
        .ok_or_else(|| LoadError::invalid("stores.max_connections", "must be greater than zero"))?;

    Ok(StoreSettings {
        identifier_path,
        citation_path,
        blob_path,
        max_connections,
    })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let trigger_ms = cache.trigger_ms.unwrap_or(DEFAULT_CACHE_TRIGGER_MS);
    let max_bytes = match cache.max_bytes {
        Some(0) => {
            return Err(LoadError::invalid(
                "cache.max_bytes",
                "must be greater than zero; omit to use the default",
            ));
        }
        Some(value) => Some(value),
        None => Some(DEFAULT_CACHE_MAX_BYTES),
    };
    Ok(CacheSettings {
        path: cache.path,
        trigger: Duration::from_millis(trigger_ms),
        max_bytes,
    })
}

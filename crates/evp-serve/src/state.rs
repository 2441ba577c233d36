//! Application state and configuration.

use std::sync::Arc;
use std::time::Duration;

use evp_ingest::{CredentialStore, IngestService};
use evp_stream::PipelineCounters;

/// Application configuration loaded from environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP listen port.
    pub server_port: u16,
    /// Stream backend endpoint, for networked deployments.
    pub stream_backend_url: Option<String>,
    /// Dedup backend endpoint (often the same as the stream backend).
    pub dedup_backend_url: Option<String>,
    /// Event store endpoint.
    pub eventstore_url: Option<String>,
    /// Event store database name.
    pub eventstore_db: Option<String>,
    /// Credential store endpoint.
    pub credential_store_url: Option<String>,
    /// Consumer group the worker pool joins.
    pub consumer_group: String,
    /// Explicit consumer name; auto-generated per worker when unset.
    pub consumer_name: Option<String>,
    /// Events per worker flush.
    pub worker_batch_size: usize,
    /// Flush a non-empty worker buffer after this long.
    pub worker_batch_timeout: Duration,
    /// Number of in-process workers.
    pub worker_count: usize,
    /// Default log filter.
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// All variables are optional:
    /// - `SERVER_PORT` (default 3001)
    /// - `STREAM_BACKEND_URL`, `DEDUP_BACKEND_URL`, `EVENTSTORE_URL`,
    ///   `EVENTSTORE_DB`, `CREDENTIAL_STORE_URL`
    /// - `CONSUMER_GROUP` (default `evp-workers-group`)
    /// - `CONSUMER_NAME` (default: auto-generated per worker)
    /// - `WORKER_BATCH_SIZE` (default 100)
    /// - `WORKER_BATCH_TIMEOUT_MS` (default 500)
    /// - `WORKER_COUNT` (default 2)
    /// - `LOG_LEVEL` (default `info`)
    pub fn from_env() -> anyhow::Result<Self> {
        let server_port = parse_var("SERVER_PORT", 3001u16)?;
        let worker_batch_size = parse_var("WORKER_BATCH_SIZE", 100usize)?;
        let worker_batch_timeout_ms = parse_var("WORKER_BATCH_TIMEOUT_MS", 500u64)?;
        let worker_count = parse_var("WORKER_COUNT", 2usize)?;

        let config = Self {
            server_port,
            stream_backend_url: std::env::var("STREAM_BACKEND_URL").ok(),
            dedup_backend_url: std::env::var("DEDUP_BACKEND_URL").ok(),
            eventstore_url: std::env::var("EVENTSTORE_URL").ok(),
            eventstore_db: std::env::var("EVENTSTORE_DB").ok(),
            credential_store_url: std::env::var("CREDENTIAL_STORE_URL").ok(),
            consumer_group: std::env::var("CONSUMER_GROUP")
                .unwrap_or_else(|_| "evp-workers-group".to_string()),
            consumer_name: std::env::var("CONSUMER_NAME").ok(),
            worker_batch_size,
            worker_batch_timeout: Duration::from_millis(worker_batch_timeout_ms),
            worker_count,
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        };

        tracing::info!(
            port = config.server_port,
            group = %config.consumer_group,
            workers = config.worker_count,
            batch_size = config.worker_batch_size,
            batch_timeout_ms = config.worker_batch_timeout.as_millis() as u64,
            stream_backend = config.stream_backend_url.as_deref().unwrap_or("in-process"),
            eventstore = config.eventstore_url.as_deref().unwrap_or("in-process"),
            "configuration loaded"
        );

        Ok(config)
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid {name}={raw}: {e}")),
        Err(_) => Ok(default),
    }
}

/// Shared application state available to all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// The ingestion fast path.
    pub ingest: Arc<IngestService>,
    /// Pipeline counters backing the stats endpoint.
    pub counters: Arc<PipelineCounters>,
    /// API-key lookup.
    pub credentials: Arc<dyn CredentialStore>,
}

impl AppState {
    pub fn new(
        ingest: Arc<IngestService>,
        counters: Arc<PipelineCounters>,
        credentials: Arc<dyn CredentialStore>,
    ) -> Self {
        Self {
            ingest,
            counters,
            credentials,
        }
    }
}

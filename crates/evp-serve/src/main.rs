//! EVP ingest API server and worker pool.
//!
//! This binary hosts the full pipeline in one process: the HTTP ingest
//! API, the in-process event stream and dedup index, and a pool of
//! workers draining the stream into the event store.
//!
//! # Usage
//!
//! ```bash
//! # Run with defaults (port 3001, 2 workers)
//! evp-serve
//!
//! # Generate an API key instead of starting the server
//! evp-serve --generate-key
//! ```
//!
//! # Graceful Shutdown
//!
//! SIGINT (Ctrl+C) and SIGTERM trigger graceful shutdown: the HTTP server
//! stops accepting requests, each worker finishes its in-flight flush
//! within a 5 s envelope, and un-acknowledged stream entries are left for
//! the next owner. A second signal forces immediate exit.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::Request;
use clap::Parser;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use evp_core::metrics::{init_recorder, start_exporter};
use evp_ingest::{
    Credential, IngestService, MemoryCredentialStore, MemoryDeadLetterSink, MemoryEventStore,
    Worker, WorkerConfig, WorkerHandle,
};
use evp_serve::{hash_api_key, AppState, Config};
use evp_stream::{DedupIndex, EventStream, PipelineCounters};

/// EVP event ingestion server.
#[derive(Parser, Debug)]
#[command(name = "evp-serve")]
#[command(about = "HTTP ingest API and worker pool for the EVP pipeline", long_about = None)]
#[command(version)]
struct Args {
    /// Path to .env file (optional).
    #[arg(long, env = "DOTENV_PATH", default_value = ".env")]
    dotenv: String,

    /// Prometheus metrics port (0 to disable).
    #[arg(long, default_value = "0")]
    metrics_port: u16,

    /// Print a freshly generated API key and exit.
    #[arg(long)]
    generate_key: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.generate_key {
        println!("{}", evp_serve::generate_api_key());
        return Ok(());
    }

    // Load .env file if it exists
    if std::path::Path::new(&args.dotenv).exists() {
        dotenvy::from_path(&args.dotenv)?;
        eprintln!("Loaded environment from {}", args.dotenv);
    }

    // Initialize tracing from LOG_LEVEL (RUST_LOG still wins when set)
    let default_filter = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;

    // Initialize metrics
    if args.metrics_port > 0 {
        match init_recorder() {
            Some(handle) => {
                start_exporter(args.metrics_port, handle).await?;
            }
            None => tracing::warn!("metrics recorder already installed; exporter not started"),
        }
    }

    // Shared pipeline infrastructure
    let stream = Arc::new(EventStream::new());
    let dedup = Arc::new(DedupIndex::new());
    let counters = Arc::new(PipelineCounters::new());
    let store = Arc::new(MemoryEventStore::new());
    let dlq = Arc::new(MemoryDeadLetterSink::new());
    let credentials = Arc::new(MemoryCredentialStore::new());

    stream.ensure_group(&config.consumer_group);
    register_api_keys(&credentials);

    // Worker pool
    let workers = spawn_workers(
        &config,
        Arc::clone(&stream),
        Arc::clone(&store),
        Arc::clone(&dlq),
        Arc::clone(&counters),
    );

    // HTTP surface
    let ingest = Arc::new(IngestService::new(
        Arc::clone(&stream),
        Arc::clone(&dedup),
        Arc::clone(&counters),
        config.consumer_group.clone(),
    ));
    let state = AppState::new(ingest, Arc::clone(&counters), credentials);

    let app = evp_serve::router(state)
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &Request<_>| {
                tracing::span!(
                    Level::INFO,
                    "http_request",
                    method = %request.method(),
                    path = %request.uri().path()
                )
            }),
        )
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    let bind_addr = format!("0.0.0.0:{}", config.server_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    tracing::info!(addr = %bind_addr, workers = workers.len(), "server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Shutdown sequence: stop workers, report totals
    tracing::info!("shutting down worker pool");
    let mut processed = 0u64;
    let mut dead_lettered = 0u64;
    for worker in workers {
        let stats = worker.stop().await;
        processed += stats.events_processed;
        dead_lettered += stats.events_dead_lettered;
    }

    let snapshot = counters.snapshot();
    tracing::info!(
        ingested = snapshot.total_ingested,
        duplicates = snapshot.total_duplicates,
        processed,
        dead_lettered,
        stored = store.count(),
        "shutdown complete"
    );

    Ok(())
}

/// Register API keys from `EVP_API_KEYS` (comma-separated raw keys).
///
/// When the variable is unset, a single key is generated and logged so a
/// fresh deployment is immediately usable.
fn register_api_keys(credentials: &MemoryCredentialStore) {
    let raw_keys = std::env::var("EVP_API_KEYS").ok();
    let keys: Vec<String> = raw_keys
        .as_deref()
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(str::to_string)
        .collect();

    if keys.is_empty() {
        let key = evp_serve::generate_api_key();
        credentials.insert(
            &hash_api_key(&key),
            Credential {
                user_id: "operator".to_string(),
                role: "producer".to_string(),
                revoked_at: None,
                expires_at: None,
            },
        );
        tracing::warn!(api_key = %key, "EVP_API_KEYS not set; generated a key for this run");
        return;
    }

    for (index, key) in keys.iter().enumerate() {
        credentials.insert(
            &hash_api_key(key),
            Credential {
                user_id: format!("producer-{index}"),
                role: "producer".to_string(),
                revoked_at: None,
                expires_at: None,
            },
        );
    }
    tracing::info!(count = keys.len(), "registered API keys");
}

/// Spawn the worker pool against the shared infrastructure.
fn spawn_workers(
    config: &Config,
    stream: Arc<EventStream>,
    store: Arc<MemoryEventStore>,
    dlq: Arc<MemoryDeadLetterSink>,
    counters: Arc<PipelineCounters>,
) -> Vec<WorkerHandle> {
    (0..config.worker_count.max(1))
        .map(|index| {
            let worker_config = WorkerConfig {
                group: config.consumer_group.clone(),
                consumer_id: config
                    .consumer_name
                    .as_ref()
                    .map(|name| format!("{name}-{index}"))
                    .unwrap_or_else(evp_core::generate_consumer_id),
                batch_size: config.worker_batch_size,
                batch_timeout: config.worker_batch_timeout,
                ..WorkerConfig::default()
            };
            Worker::spawn(
                worker_config,
                Arc::clone(&stream),
                Arc::clone(&store) as _,
                Arc::clone(&dlq) as _,
                Arc::clone(&counters),
            )
        })
        .collect()
}

/// Resolve on SIGINT or SIGTERM; a second signal forces exit.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    tracing::info!("shutdown signal received; send again to force exit");
    tokio::spawn(async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::error!("second signal received, forcing exit");
        std::process::exit(130);
    });
}

//! Prometheus metric setup for the pipeline binaries.
//!
//! Recording happens at the call sites through the `metrics` macros; this
//! module owns what is global: the recorder, the help text for every
//! metric the pipeline emits, and the `/metrics` exporter endpoint.
//!
//! A binary calls [`init_recorder`] once, early, then hands the returned
//! handle to [`start_exporter`]. Libraries never touch this module; if no
//! recorder is installed their `counter!`/`gauge!` calls are no-ops, which
//! keeps unit tests free of metrics setup.

use std::net::SocketAddr;

use axum::routing::get;
use axum::Router;
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Help text for every counter the pipeline emits.
///
/// Names follow `<component>_<what>_<unit>`: `ingest_` for the API fast
/// path, `stream_` for the event stream, `worker_` for the consumer pool,
/// `dedup_` for the dedup index.
const COUNTER_HELP: &[(&str, &str)] = &[
    (
        "ingest_events_accepted_total",
        "Events accepted and appended to the stream",
    ),
    (
        "ingest_events_duplicate_total",
        "Events answered as duplicates by the dedup index",
    ),
    (
        "ingest_events_rejected_total",
        "Events rejected by schema validation",
    ),
    (
        "stream_entries_appended_total",
        "Entries appended to the stream",
    ),
    (
        "stream_entries_acknowledged_total",
        "Entries acknowledged and removed from the pending list",
    ),
    (
        "stream_entries_reclaimed_total",
        "Stale pending entries reassigned via claim-idle",
    ),
    (
        "worker_events_processed_total",
        "Events bulk-written to the event store",
    ),
    (
        "worker_batches_flushed_total",
        "Batches flushed by workers",
    ),
    (
        "worker_events_failed_total",
        "Events that exhausted bulk-insert retries",
    ),
    (
        "worker_events_dead_lettered_total",
        "Events durably routed to the dead-letter sink",
    ),
    (
        "worker_entries_dropped_total",
        "Unparseable stream entries acknowledged and dropped",
    ),
    ("dedup_claims_total", "Dedup claims attempted"),
    (
        "dedup_duplicates_total",
        "Claims that found the event id already present",
    ),
];

/// Help text for every gauge.
const GAUGE_HELP: &[(&str, &str)] = &[
    (
        "ingest_events_per_second",
        "Ingestion rate over the trailing minute",
    ),
    (
        "stream_entries_pending",
        "Entries currently in the pending entry list",
    ),
    ("worker_buffer_events", "Events buffered in a worker"),
];

/// Help text for every histogram.
const HISTOGRAM_HELP: &[(&str, &str)] = &[(
    "worker_flush_duration_seconds",
    "Time spent per bulk-insert flush, including retries",
)];

/// Install the Prometheus recorder and register all help texts.
///
/// Returns `None` when a recorder is already installed (a repeated call,
/// or a harness that brought its own); recording keeps working in that
/// case, the handle is just owned elsewhere.
pub fn init_recorder() -> Option<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder().ok()?;
    describe_metrics();
    Some(handle)
}

/// Register help text for every metric in the tables above.
///
/// Safe to call repeatedly; later descriptions simply overwrite earlier
/// ones.
pub fn describe_metrics() {
    for (name, help) in COUNTER_HELP {
        describe_counter!(*name, *help);
    }
    for (name, help) in GAUGE_HELP {
        describe_gauge!(*name, *help);
    }
    for (name, help) in HISTOGRAM_HELP {
        describe_histogram!(*name, *help);
    }
}

/// Expose `GET /metrics` on the given port from a background task.
///
/// Binds before returning so a busy port fails loudly at startup instead
/// of inside the spawned task; returns the bound address.
pub async fn start_exporter(
    port: u16,
    handle: PrometheusHandle,
) -> std::io::Result<SocketAddr> {
    let listener = tokio::net::TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port))).await?;
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "prometheus exporter listening");

    let app = Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    );

    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, app).await {
            tracing::error!(error = %err, "metrics exporter stopped");
        }
    });

    Ok(addr)
}

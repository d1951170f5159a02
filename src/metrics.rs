//! Prometheus metrics recorder installation and the standalone metrics
//! server exposing `/metrics` for scraping.
//!
//! Grounded on `metrics::init_metrics`/`start_metrics_server`, trimmed of
//! the teacher's `pprof` CPU/heap profiling routes (no `pprof` dependency
//! in this crate — scope is metrics export only, per SPEC_FULL.md §4.J).

use std::net::SocketAddr;
use std::sync::OnceLock;

use axum::{routing::get, Router};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus recorder. Safe to call once per process;
/// subsequent calls are a no-op since the handle is cached in
/// [`METRICS_HANDLE`].
pub fn init_metrics_recorder() -> PrometheusHandle {
    if let Some(handle) = METRICS_HANDLE.get() {
        return handle.clone();
    }
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder");
    METRICS_HANDLE
        .set(handle.clone())
        .expect("metrics handle already initialized");
    handle
}

/// Zero every gauge and counter this crate emits, so dashboards show `0`
/// rather than "no data" before the first scan tick runs (mirrors
/// `initialize_run_metrics`'s absolute(0)/set(0.0) pattern).
pub fn initialize_gauges() {
    metrics::gauge!("dronewatch_ports_eligible").set(0.0);
    metrics::gauge!("dronewatch_listeners_active").set(0.0);
    metrics::gauge!("dronewatch_broadcast_sessions").set(0.0);

    metrics::counter!("dronewatch_probe_hits_total").absolute(0);
    metrics::counter!("dronewatch_probe_errors_total").absolute(0);
    metrics::counter!("dronewatch_messages_decoded_total").absolute(0);
    metrics::counter!("dronewatch_broadcast_frames_total").absolute(0);
    metrics::counter!("dronewatch_persist_batches_total").absolute(0);
    metrics::counter!("dronewatch_persist_failures_total").absolute(0);
}

/// Serve `/metrics` on its own bind address, independent of the telemetry
/// web server (spec.md §6 `metrics_bind`).
pub async fn start_metrics_server(bind: &str) -> std::io::Result<()> {
    init_metrics_recorder();
    initialize_gauges();

    let app = Router::new().route(
        "/metrics",
        get(|| async {
            let handle = METRICS_HANDLE.get().expect("metrics handle not initialized");
            handle.render()
        }),
    );

    let addr: SocketAddr = bind
        .parse()
        .unwrap_or_else(|_| panic!("invalid metrics_bind address: {bind}"));
    info!(%addr, "starting metrics server on http://{addr}/metrics");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await
}

//! `dronewatch` binary entry point: CLI, bootstrap sequencing, and ordered
//! shutdown.
//!
//! Bootstrap ordering is grounded on `commands/run/mod.rs::handle_run`
//! (metrics recorder → gauges zeroed → metrics server spawned and
//! monitored → instance lock → services). Shutdown sequencing follows
//! `commands/run/shutdown.rs`'s "wait for Ctrl+C, then drain in order"
//! shape, but replaces its flat queue-draining poll loop with the explicit
//! four-stage `.await` chain this spec requires (spec.md §5): scan
//! orchestrator, then listener registry, then broadcast hub, then
//! persister.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use dronewatch::broadcast_hub::BroadcastHub;
use dronewatch::config::AppConfig;
use dronewatch::instance_lock::InstanceLock;
use dronewatch::listener_registry::ListenerRegistry;
use dronewatch::log_format::TargetFirstFormat;
use dronewatch::metrics::start_metrics_server;
use dronewatch::persister::Persister;
use dronewatch::port_probe::PortProbe;
use dronewatch::port_set::PortSet;
use dronewatch::scan_orchestrator::ScanOrchestrator;
use dronewatch::state_engine::StateEngine;
use dronewatch::store::{FileStateStore, Store};
use dronewatch::web::start_web_server;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "dronewatch",
    about = "Scan a UDP port range for MAVLink telemetry and broadcast decoded drone state over WebSocket."
)]
struct Args {
    /// Override the resolved config file path (see `AppConfig::load`).
    #[arg(long = "config")]
    config: Option<String>,

    /// Path to the state store file.
    #[arg(long = "state-file", default_value = "./dronewatch-state.db")]
    state_file: String,
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .event_format(TargetFirstFormat)
        .with_env_filter(EnvFilter::from_default_env())
        .init();
}

fn lock_name() -> &'static str {
    if dronewatch::is_production() {
        "dronewatch-production"
    } else if dronewatch::is_staging() {
        "dronewatch-staging"
    } else {
        "dronewatch-dev"
    }
}

/// Config must be loaded before the runtime is built, since `threadPoolSize`
/// sizes the worker pool (spec.md §6) — the `#[tokio::main]` macro builds
/// its runtime before any user code runs, so this crate builds its own.
fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    init_tracing();

    if let Some(config_path) = &args.config {
        unsafe {
            std::env::set_var("DRONEWATCH_CONFIG", config_path);
        }
    }

    info!(env = %dronewatch::deployment_env(), "starting dronewatch");

    let config = AppConfig::load().context("failed to load configuration")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.thread_pool_size)
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    runtime.block_on(run(args, config))
}

async fn run(args: Args, config: AppConfig) -> Result<()> {
    dronewatch::metrics::init_metrics_recorder();
    dronewatch::metrics::initialize_gauges();

    let metrics_bind = config.metrics_bind.clone();
    let metrics_handle = tokio::spawn(async move {
        if let Err(err) = start_metrics_server(&metrics_bind).await {
            error!(%err, "metrics server exited unexpectedly");
        }
    });
    tokio::spawn(async move {
        if let Err(err) = metrics_handle.await {
            error!(%err, "metrics server task panicked");
        }
    });

    let _instance_lock = InstanceLock::new(lock_name()).context("failed to acquire instance lock")?;
    info!(path = %_instance_lock.path().display(), "acquired instance lock");

    let port_set = Arc::new(PortSet::new(
        config.port_range_min,
        config.port_range_max,
        config.max_ports,
    ));
    let probe = Arc::new(PortProbe::new(config.scanner_timeout_ms));
    let state_engine = Arc::new(StateEngine::new(config.stale_threshold_ms));
    let registry = Arc::new(ListenerRegistry::new(state_engine.clone(), config.idle_threshold_ms, config.buffer_size));
    let store: Arc<dyn Store> = Arc::new(FileStateStore::new(args.state_file));
    let broadcast_hub = Arc::new(BroadcastHub::new(state_engine.clone()));
    let persister = Persister::new(state_engine.clone(), store.clone());

    let evictor_cancel = CancellationToken::new();
    let evictor_task = tokio::spawn(state_engine.clone().run_evictor(evictor_cancel.clone()));

    let scan_cancel = CancellationToken::new();
    let orchestrator = ScanOrchestrator::new(port_set, probe, registry.clone());
    let scan_task = tokio::spawn(orchestrator.run(scan_cancel.clone()));

    let broadcast_cancel = CancellationToken::new();
    let broadcast_task = tokio::spawn(broadcast_hub.clone().run(broadcast_cancel.clone()));

    let persist_cancel = CancellationToken::new();
    let persist_task = tokio::spawn(persister.run(persist_cancel.clone()));

    let web_bind = config.web_bind.clone();
    let web_hub = broadcast_hub.clone();
    let web_task = tokio::spawn(async move {
        if let Err(err) = start_web_server(&web_bind, web_hub).await {
            error!(%err, "web server exited unexpectedly");
        }
    });

    tokio::signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
    info!("shutdown signal received, draining in order");

    scan_cancel.cancel();
    let _ = scan_task.await;

    registry.shutdown().await;

    broadcast_cancel.cancel();
    let _ = broadcast_task.await;

    persist_cancel.cancel();
    let _ = persist_task.await;

    evictor_cancel.cancel();
    let _ = evictor_task.await;

    web_task.abort();

    info!("dronewatch shut down cleanly");
    Ok(())
}

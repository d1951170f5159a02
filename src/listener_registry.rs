//! Tracks the one active [`crate::listener::Listener`] task per port.
//!
//! Grounded on `socket_server::SocketServer`'s accept-loop/handle-tracking
//! shape and its `metrics::gauge!` instrumentation of active connection
//! count, adapted from per-connection handles to per-port listener handles.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::listener::Listener;
use crate::state_engine::StateEngine;

const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(5);

struct ListenerHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
    started_at: Instant,
}

/// Owns the currently-running listeners, one per active port.
pub struct ListenerRegistry {
    handles: RwLock<HashMap<u16, ListenerHandle>>,
    state_engine: Arc<StateEngine>,
    idle_threshold_ms: u64,
    buffer_size: usize,
}

impl ListenerRegistry {
    pub fn new(state_engine: Arc<StateEngine>, idle_threshold_ms: u64, buffer_size: usize) -> Self {
        Self {
            handles: RwLock::new(HashMap::new()),
            state_engine,
            idle_threshold_ms,
            buffer_size,
        }
    }

    /// Start a listener for `port` unless one is already active.
    pub async fn start(&self, port: u16) {
        let mut handles = self.handles.write().await;
        if handles.contains_key(&port) {
            return;
        }

        let cancel = CancellationToken::new();
        let listener = Listener::new(
            port,
            self.idle_threshold_ms,
            self.buffer_size,
            self.state_engine.clone(),
            cancel.clone(),
        );
        metrics::gauge!("dronewatch_listeners_active").increment(1.0);

        let join = tokio::spawn(async move {
            if let Err(err) = listener.run().await {
                warn!(port, %err, "listener exited with error");
            }
            metrics::gauge!("dronewatch_listeners_active").decrement(1.0);
        });

        handles.insert(
            port,
            ListenerHandle {
                cancel,
                join,
                started_at: Instant::now(),
            },
        );
        info!(port, "listener registered");
    }

    /// Cancel and remove the listener for `port`, if any.
    pub async fn stop(&self, port: u16) {
        let handle = self.handles.write().await.remove(&port);
        if let Some(handle) = handle {
            handle.cancel.cancel();
            let _ = handle.join.await;
        }
    }

    /// Ports with a currently registered listener task.
    pub async fn active(&self) -> Vec<u16> {
        self.handles.read().await.keys().copied().collect()
    }

    /// Drop handles whose task has already finished, so dead listeners
    /// don't keep their port marked active.
    pub async fn reap_finished(&self) {
        let mut handles = self.handles.write().await;
        handles.retain(|port, handle| {
            let alive = !handle.join.is_finished();
            if !alive {
                info!(port, uptime_s = handle.started_at.elapsed().as_secs(), "reaped finished listener");
            }
            alive
        });
    }

    /// Cancel every active listener and wait up to [`SHUTDOWN_DEADLINE`]
    /// for them to finish before returning.
    pub async fn shutdown(&self) {
        let mut handles = self.handles.write().await;
        for handle in handles.values() {
            handle.cancel.cancel();
        }

        let deadline = tokio::time::sleep(SHUTDOWN_DEADLINE);
        tokio::pin!(deadline);

        let joins: Vec<_> = handles.drain().map(|(_, handle)| handle.join).collect();
        let all_joined = futures_util::future::join_all(joins);
        tokio::select! {
            _ = all_joined => {
                info!("all listeners shut down cleanly");
            }
            _ = &mut deadline => {
                warn!("listener shutdown deadline exceeded, proceeding anyway");
            }
        }
    }
}

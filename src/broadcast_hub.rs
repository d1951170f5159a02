//! Fans `StateEngine` snapshots out to connected WebSocket clients.
//!
//! Grounded on `actions::fixes::handle_websocket`'s split-socket,
//! flume-mediated read/write task shape, generalized from a per-aircraft
//! NATS subscription fan-out to a shared 100ms tick that serializes the
//! active snapshot once per tick and reuses that buffer across every
//! subscriber (spec.md §4.G), rather than re-serializing per client.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::response::Response;
use flume::Sender;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::RwLock;
use tracing::{info, warn};

use serde::Serialize;

use crate::state::DroneDto;
use crate::state_engine::StateEngine;

/// Wire shape for `GET /telemetry{,/port}` frames (spec.md §6): an object
/// with a `drones` key, not a bare array.
#[derive(Serialize)]
struct TelemetryFrame<'a> {
    drones: Vec<DroneDto<'a>>,
}

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

const TICK_INTERVAL: Duration = Duration::from_millis(100);

struct Session {
    filter_port: Option<u16>,
    outbox: Sender<Message>,
}

/// Per-tick cache of serialized snapshots, so N subscribers to the same
/// filter share one JSON encode instead of paying for it N times.
#[derive(Default)]
struct TickCache {
    full: Option<String>,
    by_port: HashMap<u16, String>,
}

/// Owns active WebSocket sessions and the periodic tick that serializes
/// and pushes state to them.
pub struct BroadcastHub {
    state_engine: Arc<StateEngine>,
    sessions: RwLock<HashMap<u64, Session>>,
}

impl BroadcastHub {
    pub fn new(state_engine: Arc<StateEngine>) -> Self {
        Self {
            state_engine,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    async fn register(&self, filter_port: Option<u16>, outbox: Sender<Message>) -> u64 {
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        self.sessions.write().await.insert(id, Session { filter_port, outbox });
        metrics::gauge!("dronewatch_broadcast_sessions").increment(1.0);
        id
    }

    async fn unregister(&self, id: u64) {
        if self.sessions.write().await.remove(&id).is_some() {
            metrics::gauge!("dronewatch_broadcast_sessions").decrement(1.0);
        }
    }

    /// One tick: compute the active snapshot, serialize once per distinct
    /// filter in use, and push to every session, pruning dead ones.
    async fn tick(&self) {
        let snapshot = self.state_engine.active_snapshot();
        if snapshot.is_empty() {
            return;
        }
        let mut cache = TickCache::default();

        let sessions = self.sessions.read().await;
        if sessions.is_empty() {
            return;
        }

        let mut dead = Vec::new();
        for (&id, session) in sessions.iter() {
            let payload = match session.filter_port {
                None => cache.full.get_or_insert_with(|| serialize_full(&snapshot)).clone(),
                Some(port) => cache
                    .by_port
                    .entry(port)
                    .or_insert_with(|| serialize_filtered(&snapshot, port))
                    .clone(),
            };

            if session.outbox.send(Message::Text(payload.into())).is_err() {
                dead.push(id);
            } else {
                metrics::counter!("dronewatch_broadcast_frames_total").increment(1);
            }
        }
        drop(sessions);

        if !dead.is_empty() {
            let mut sessions = self.sessions.write().await;
            for id in dead {
                if sessions.remove(&id).is_some() {
                    metrics::gauge!("dronewatch_broadcast_sessions").decrement(1.0);
                }
            }
        }
    }

    /// Run the broadcast tick loop until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: tokio_util::sync::CancellationToken) {
        let mut interval = tokio::time::interval(TICK_INTERVAL);
        // Fixed rate, skip on overrun (spec.md §5): a slow tick doesn't
        // burst through every missed interval once it catches up.
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("broadcast hub shutting down, closing sessions");
                    self.close_all().await;
                    return;
                }
                _ = interval.tick() => {
                    self.tick().await;
                }
            }
        }
    }

    async fn close_all(&self) {
        let mut sessions = self.sessions.write().await;
        sessions.clear();
        metrics::gauge!("dronewatch_broadcast_sessions").set(0.0);
    }
}

fn serialize_full(snapshot: &[crate::state::DroneState]) -> String {
    let drones: Vec<DroneDto<'_>> = snapshot.iter().map(DroneDto::from).collect();
    serde_json::to_string(&TelemetryFrame { drones }).unwrap_or_else(|_| "{\"drones\":[]}".to_string())
}

fn serialize_filtered(snapshot: &[crate::state::DroneState], port: u16) -> String {
    let drones: Vec<DroneDto<'_>> = snapshot
        .iter()
        .filter(|state| state.port == port)
        .map(DroneDto::from)
        .collect();
    serde_json::to_string(&TelemetryFrame { drones }).unwrap_or_else(|_| "{\"drones\":[]}".to_string())
}

/// `GET /telemetry` — subscribe to every active port.
pub async fn telemetry_ws(ws: WebSocketUpgrade, State(hub): State<Arc<BroadcastHub>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, hub, None))
}

/// `GET /telemetry/{port}` — subscribe to a single port.
pub async fn telemetry_ws_filtered(
    ws: WebSocketUpgrade,
    Path(port): Path<u16>,
    State(hub): State<Arc<BroadcastHub>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, hub, Some(port)))
}

async fn handle_socket(socket: WebSocket, hub: Arc<BroadcastHub>, filter_port: Option<u16>) {
    let (mut sender, mut receiver) = socket.split();
    let (outbox_tx, outbox_rx) = flume::unbounded::<Message>();
    let session_id = hub.register(filter_port, outbox_tx).await;

    let write_task = tokio::spawn(async move {
        while let Ok(message) = outbox_rx.recv_async().await {
            if sender.send(message).await.is_err() {
                break;
            }
        }
    });

    let read_task = tokio::spawn(async move {
        while let Some(message) = receiver.next().await {
            match message {
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(err) => {
                    warn!(%err, "telemetry websocket read error");
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = write_task => {}
        _ = read_task => {}
    }

    hub.unregister(session_id).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::DroneState;

    #[test]
    fn serialize_full_includes_every_port() {
        let snapshot = vec![DroneState::empty(1), DroneState::empty(2)];
        let json = serialize_full(&snapshot);
        assert!(json.starts_with("{\"drones\":["));
        assert!(json.contains("\"port\":1"));
        assert!(json.contains("\"port\":2"));
    }

    #[test]
    fn serialize_filtered_excludes_other_ports() {
        let snapshot = vec![DroneState::empty(1), DroneState::empty(2)];
        let json = serialize_filtered(&snapshot, 1);
        assert!(json.starts_with("{\"drones\":["));
        assert!(json.contains("\"port\":1"));
        assert!(!json.contains("\"port\":2"));
    }

    #[tokio::test]
    async fn register_and_unregister_tracks_session_count() {
        let engine = Arc::new(StateEngine::new(30_000));
        let hub = BroadcastHub::new(engine);
        let (tx, _rx) = flume::unbounded();
        let id = hub.register(None, tx).await;
        assert_eq!(hub.session_count().await, 1);
        hub.unregister(id).await;
        assert_eq!(hub.session_count().await, 0);
    }

    // spec.md §4.G: "If empty, no emission" is specified on the snapshot,
    // not on the session list — a connected subscriber with zero active
    // drones must receive nothing, not `{"drones":[]}`.
    #[tokio::test]
    async fn tick_emits_nothing_when_snapshot_is_empty() {
        let engine = Arc::new(StateEngine::new(30_000));
        let hub = BroadcastHub::new(engine);
        let (tx, rx) = flume::unbounded();
        hub.register(None, tx).await;

        hub.tick().await;

        assert!(rx.try_recv().is_err(), "no frame should be sent for an empty snapshot");
    }
}

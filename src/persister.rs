//! Periodically flushes [`StateEngine`] snapshots to a [`Store`].
//!
//! Grounded on `persistent_queue::PersistentQueue`'s disconnected-state
//! buffering and the `commands/run/shutdown.rs` drain-before-exit pattern:
//! batches are written every tick and a final flush runs at shutdown so no
//! in-flight state is lost.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::state_engine::StateEngine;
use crate::store::Store;

const TICK_INTERVAL: Duration = Duration::from_secs(5);

/// Drives the periodic `StateEngine -> Store` flush.
pub struct Persister {
    state_engine: Arc<StateEngine>,
    store: Arc<dyn Store>,
}

impl Persister {
    pub fn new(state_engine: Arc<StateEngine>, store: Arc<dyn Store>) -> Self {
        Self { state_engine, store }
    }

    /// Pop the dirty set, snapshot those records, and write them as one
    /// batch. On failure, the ports are merged back into the dirty set so
    /// they're retried on the next tick (spec.md §4.H) — the in-memory
    /// `StateEngine` remains the source of truth in the meantime, so no
    /// data is lost by skipping a failed batch.
    pub fn flush(&self) {
        let dirty_ports = self.state_engine.take_dirty();
        if dirty_ports.is_empty() {
            return;
        }

        let snapshot: Vec<_> = dirty_ports
            .iter()
            .filter_map(|&port| self.state_engine.get(port))
            .collect();
        if snapshot.is_empty() {
            return;
        }

        metrics::counter!("dronewatch_persist_batches_total").increment(1);
        if let Err(err) = self.store.save_all(&snapshot) {
            error!(%err, "persist batch failed, will retry next tick");
            metrics::counter!("dronewatch_persist_failures_total").increment(1);
            self.state_engine.mark_dirty_many(&dirty_ports);
        }
    }

    /// Run the flush loop until `cancel` fires, then perform one final
    /// flush before returning.
    pub async fn run(self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(TICK_INTERVAL);

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    info!("persister shutting down, performing final flush");
                    self.flush();
                    return;
                }

                _ = interval.tick() => {
                    self.flush();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FileStateStore;
    use mavlink::common::{MavMessage, SYS_STATUS_DATA};
    use mavlink::MavHeader;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use tempfile::tempdir;

    fn apply_sys_status(engine: &StateEngine, port: u16) {
        let sender = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)), port);
        let header = MavHeader { system_id: 1, component_id: 1, sequence: 0 };
        let msg = MavMessage::SYS_STATUS(SYS_STATUS_DATA {
            onboard_control_sensors_present: mavlink::common::MavSysStatusSensor::default(),
            onboard_control_sensors_enabled: mavlink::common::MavSysStatusSensor::default(),
            onboard_control_sensors_health: mavlink::common::MavSysStatusSensor::default(),
            load: 0,
            voltage_battery: 0,
            current_battery: 0,
            drop_rate_comm: 0,
            errors_comm: 0,
            errors_count1: 0,
            errors_count2: 0,
            errors_count3: 0,
            errors_count4: 0,
            battery_remaining: 0,
        });
        engine.apply(port, sender, &header, &msg);
    }

    #[test]
    fn flush_is_a_no_op_with_no_active_ports() {
        let engine = Arc::new(StateEngine::new(30_000));
        let dir = tempdir().unwrap();
        let store: Arc<dyn Store> = Arc::new(FileStateStore::new(dir.path().join("state.db")));
        let persister = Persister::new(engine, store);
        persister.flush();
        assert!(!dir.path().join("state.db").exists());
    }

    #[test]
    fn flush_persists_only_dirty_ports_and_clears_them() {
        let engine = Arc::new(StateEngine::new(30_000));
        apply_sys_status(&engine, 14551);
        let dir = tempdir().unwrap();
        let store: Arc<dyn Store> = Arc::new(FileStateStore::new(dir.path().join("state.db")));
        let persister = Persister::new(engine.clone(), store.clone());

        persister.flush();
        assert!(store.find_by_port(14551).unwrap().is_some());

        // A second flush with nothing newly dirty is a no-op; the file is
        // untouched rather than rewritten with an empty batch.
        let modified_before = std::fs::metadata(dir.path().join("state.db")).unwrap().modified().unwrap();
        persister.flush();
        let modified_after = std::fs::metadata(dir.path().join("state.db")).unwrap().modified().unwrap();
        assert_eq!(modified_before, modified_after);
    }

    #[test]
    fn failed_batch_is_remarked_dirty_for_retry() {
        let engine = Arc::new(StateEngine::new(30_000));
        apply_sys_status(&engine, 14551);

        // A plain file standing where the store's parent directory needs
        // to be makes every write fail with `create_dir_all`.
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"not a directory").unwrap();
        let store: Arc<dyn Store> = Arc::new(FileStateStore::new(blocker.join("state.db")));
        let persister = Persister::new(engine.clone(), store);

        persister.flush();
        assert_eq!(engine.take_dirty(), vec![14551], "failed batch must be re-marked dirty for the next tick");
    }
}

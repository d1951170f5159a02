//! Fixed-delay scheduler that turns eligible-but-unwatched ports into
//! running listeners.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::listener_registry::ListenerRegistry;
use crate::port_probe::PortProbe;
use crate::port_set::PortSet;

const TICK_INTERVAL: Duration = Duration::from_secs(5);
const HEALTH_TICK_INTERVAL: Duration = Duration::from_secs(30);

/// Drives the scan → probe → start-listener cycle on a fixed interval.
pub struct ScanOrchestrator {
    port_set: Arc<PortSet>,
    probe: Arc<PortProbe>,
    registry: Arc<ListenerRegistry>,
}

impl ScanOrchestrator {
    pub fn new(port_set: Arc<PortSet>, probe: Arc<PortProbe>, registry: Arc<ListenerRegistry>) -> Self {
        Self {
            port_set,
            probe,
            registry,
        }
    }

    /// One scan/probe/start cycle. Broken out from `run` so tests can drive
    /// it without waiting on the ticker.
    pub async fn tick(&self) {
        let active: std::collections::HashSet<u16> = self.registry.active().await.into_iter().collect();
        let candidates: Vec<u16> = self
            .port_set
            .snapshot()
            .into_iter()
            .filter(|port| !active.contains(port))
            .collect();

        if candidates.is_empty() {
            return;
        }

        metrics::gauge!("dronewatch_ports_eligible").set(candidates.len() as f64);
        let hits = self.probe.probe_many(candidates).await;
        metrics::counter!("dronewatch_probe_hits_total").increment(hits.len() as u64);

        for (port, sender) in hits {
            info!(port, %sender, "scan orchestrator starting listener");
            self.registry.start(port).await;
        }
    }

    /// Run the scan loop until `cancel` fires, interleaving a health sweep
    /// that reaps listener handles whose task has already finished.
    pub async fn run(self, cancel: CancellationToken) {
        let mut scan_interval = tokio::time::interval(TICK_INTERVAL);
        // Fixed-delay, not fixed-rate (spec.md §4.E): if a tick overruns,
        // the next one is measured from completion, not skipped/bursted.
        scan_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut health_interval = tokio::time::interval(HEALTH_TICK_INTERVAL);

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    info!("scan orchestrator cancelled");
                    return;
                }

                _ = scan_interval.tick() => {
                    self.tick().await;
                }

                _ = health_interval.tick() => {
                    debug!("scan orchestrator health sweep");
                    self.registry.reap_finished().await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_engine::StateEngine;

    #[tokio::test]
    async fn tick_is_a_no_op_when_no_candidates_remain() {
        let port_set = Arc::new(PortSet::new(1, 1, 1));
        port_set.remove(1);
        let probe = Arc::new(PortProbe::new(50));
        let state_engine = Arc::new(StateEngine::new(30_000));
        let registry = Arc::new(ListenerRegistry::new(state_engine, 50, 4096));
        let orchestrator = ScanOrchestrator::new(port_set, probe, registry.clone());
        orchestrator.tick().await;
        assert!(registry.active().await.is_empty());
    }
}

//! Lightweight UDP datagram-arrival detection ahead of a full MAVLink
//! connection. Cheaper than `mavlink::connect_async` per scan tick since it
//! only needs to observe that *something* is sending to a port, not decode
//! it.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures_util::future::join_all;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::debug;

use crate::error::ProbeError;

const BACKOFF_FAILURE_LIMIT: u32 = 5;
const BACKOFF_WINDOW: Duration = Duration::from_secs(60);
const MAX_CONCURRENT_PROBES: usize = 10;

/// Outcome of probing a single port.
#[derive(Debug)]
pub enum ProbeOutcome {
    Detected { port: u16, sender: SocketAddr },
    NoData,
    InUse,
    Error(ProbeError),
}

struct BackoffRecord {
    failure_count: u32,
    last_scan_at: Instant,
}

/// Probes candidate ports for incoming UDP traffic, tracking a per-port
/// failure count so consistently silent ports are skipped rather than
/// re-probed every tick.
pub struct PortProbe {
    scanner_timeout_ms: u64,
    backoff: DashMap<u16, BackoffRecord>,
}

impl PortProbe {
    pub fn new(scanner_timeout_ms: u64) -> Self {
        Self {
            scanner_timeout_ms,
            backoff: DashMap::new(),
        }
    }

    fn should_short_circuit(&self, port: u16) -> bool {
        match self.backoff.get(&port) {
            Some(record) => {
                record.failure_count >= BACKOFF_FAILURE_LIMIT
                    && record.last_scan_at.elapsed() < BACKOFF_WINDOW
            }
            None => false,
        }
    }

    fn record_failure(&self, port: u16) {
        let mut record = self.backoff.entry(port).or_insert_with(|| BackoffRecord {
            failure_count: 0,
            last_scan_at: Instant::now(),
        });
        record.failure_count += 1;
        record.last_scan_at = Instant::now();
    }

    fn record_success(&self, port: u16) {
        self.backoff.remove(&port);
    }

    /// Probe a single port for an incoming datagram within the configured
    /// scanner timeout.
    pub async fn probe(&self, port: u16) -> ProbeOutcome {
        if self.should_short_circuit(port) {
            return ProbeOutcome::NoData;
        }

        let socket = match UdpSocket::bind(("0.0.0.0", port)).await {
            Ok(socket) => socket,
            Err(source) if source.kind() == std::io::ErrorKind::AddrInUse => {
                self.record_success(port);
                return ProbeOutcome::InUse;
            }
            Err(source) => {
                self.record_failure(port);
                return ProbeOutcome::Error(ProbeError::Socket { port, source });
            }
        };

        let mut buf = [0u8; 1];
        match timeout(
            Duration::from_millis(self.scanner_timeout_ms),
            socket.peek_from(&mut buf),
        )
        .await
        {
            Ok(Ok((_, sender))) => {
                self.record_success(port);
                ProbeOutcome::Detected { port, sender }
            }
            Ok(Err(source)) => {
                self.record_failure(port);
                ProbeOutcome::Error(ProbeError::Socket { port, source })
            }
            Err(_elapsed) => {
                self.record_failure(port);
                ProbeOutcome::NoData
            }
        }
    }

    /// Probe every candidate port, at most [`MAX_CONCURRENT_PROBES`] at a
    /// time, returning only the ports where traffic was detected.
    pub async fn probe_many(&self, ports: Vec<u16>) -> Vec<(u16, SocketAddr)> {
        let mut hits = Vec::new();
        for chunk in ports.chunks(MAX_CONCURRENT_PROBES) {
            let deadline = Duration::from_millis(self.scanner_timeout_ms) + Duration::from_secs(1);
            let futures = chunk.iter().map(|&port| async move {
                match timeout(deadline, self.probe(port)).await {
                    Ok(outcome) => outcome,
                    Err(_elapsed) => ProbeOutcome::NoData,
                }
            });
            for outcome in join_all(futures).await {
                match outcome {
                    ProbeOutcome::Detected { port, sender } => {
                        debug!(port, %sender, "port probe detected traffic");
                        hits.push((port, sender));
                    }
                    ProbeOutcome::Error(err) => {
                        debug!(%err, "port probe error");
                    }
                    ProbeOutcome::NoData | ProbeOutcome::InUse => {}
                }
            }
        }
        hits
    }
}

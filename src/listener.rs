//! A single port's MAVLink connection: decode loop, idle timeout, and
//! cooperative cancellation.
//!
//! Grounded on `mavkit::event_loop::run_event_loop`'s
//! `tokio::select! { biased; ... }` shape for the idle/cancel/recv race, and
//! on `skyward-er-segs`'s `message_broker::listen_from_ethernet_port` for
//! binding a raw `tokio::net::UdpSocket` and decoding MAVLink frames out of
//! each datagram directly, rather than through `mavlink::connect_async` —
//! the high-level connection type never surfaces the UDP peer address per
//! message, but spec.md §3/§4.F require `gcsIp` to be the real sender IP, so
//! this listener owns the socket itself and reads `recv_from` directly.

use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use mavlink::error::MessageReadError;
use socket2::{Domain, Socket, Type};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ListenerError;
use crate::state_engine::StateEngine;

/// MAVLink reserves at least one byte before a frame start; anything
/// smaller than this can never hold a full v1/v2 message.
const READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Runs the decode loop for one UDP port until cancelled, idle, or a fatal
/// transport error.
pub struct Listener {
    port: u16,
    idle_threshold_ms: u64,
    buffer_size: usize,
    state_engine: Arc<StateEngine>,
    cancel: CancellationToken,
}

impl Listener {
    pub fn new(
        port: u16,
        idle_threshold_ms: u64,
        buffer_size: usize,
        state_engine: Arc<StateEngine>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            port,
            idle_threshold_ms,
            buffer_size,
            state_engine,
            cancel,
        }
    }

    /// Bind with `SO_REUSEADDR` so a port vacated by a crashed listener can
    /// be rebound immediately rather than waiting out `TIME_WAIT`. A bind
    /// racing another process (or another instance's listener) for the
    /// same port is reported as `PortAlreadyInUse` rather than a generic
    /// socket error.
    fn bind(&self) -> Result<UdpSocket, ListenerError> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, None)
            .map_err(|source| ListenerError::Socket { port: self.port, source })?;
        socket
            .set_reuse_address(true)
            .map_err(|source| ListenerError::Socket { port: self.port, source })?;
        socket
            .set_nonblocking(true)
            .map_err(|source| ListenerError::Socket { port: self.port, source })?;
        let address: SocketAddr = ([0, 0, 0, 0], self.port).into();
        socket.bind(&address.into()).map_err(|source| {
            if source.kind() == std::io::ErrorKind::AddrInUse {
                ListenerError::PortAlreadyInUse(self.port)
            } else {
                ListenerError::Socket { port: self.port, source }
            }
        })?;
        UdpSocket::from_std(socket.into()).map_err(|source| ListenerError::Socket { port: self.port, source })
    }

    /// Bind and decode until the cancellation token fires, the port goes
    /// idle past `idle_threshold_ms`, or the connection errors out.
    pub async fn run(self) -> Result<(), ListenerError> {
        let socket = self.bind()?;

        info!(port = self.port, "listener started");
        let mut last_message_at = Instant::now();
        let idle_timeout = Duration::from_millis(self.idle_threshold_ms);
        let mut buf = vec![0u8; self.buffer_size];

        loop {
            let idle_check = tokio::time::sleep_until((last_message_at + idle_timeout).into());

            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    info!(port = self.port, "listener cancelled");
                    return Ok(());
                }

                _ = idle_check => {
                    info!(port = self.port, idle_threshold_ms = self.idle_threshold_ms, "listener idle timeout");
                    return Ok(());
                }

                result = tokio::time::timeout(READ_TIMEOUT, socket.recv_from(&mut buf)) => {
                    match result {
                        // Read timeout: no datagram this second, loop back to
                        // re-evaluate the idle deadline (spec.md §4.D step 3).
                        Err(_elapsed) => continue,
                        Ok(Err(source)) => {
                            warn!(port = self.port, %source, "listener socket error");
                            return Err(ListenerError::Socket { port: self.port, source });
                        }
                        Ok(Ok((len, sender))) => {
                            last_message_at = Instant::now();
                            self.decode_and_dispatch(&buf[..len], sender);
                        }
                    }
                }
            }
        }
    }

    /// Decode every complete MAVLink frame in one datagram and dispatch
    /// each to the state engine. A datagram normally carries exactly one
    /// frame, but the wire format permits several; decoding stops at the
    /// first incomplete trailing frame rather than treating it as an error.
    fn decode_and_dispatch(&self, datagram: &[u8], sender: SocketAddr) {
        let mut cursor = Cursor::new(datagram);
        loop {
            match mavlink::read_v2_msg::<mavlink::common::MavMessage, _>(&mut cursor) {
                Ok((header, message)) => {
                    self.state_engine.apply(self.port, sender, &header, &message);
                }
                Err(MessageReadError::Io(source)) if source.kind() == std::io::ErrorKind::UnexpectedEof => {
                    return;
                }
                Err(err) => {
                    // spec.md §7: DecodeError is logged and the stream
                    // continues — it does not terminate the listener.
                    let decode_err = ListenerError::Decode {
                        port: self.port,
                        reason: err.to_string(),
                    };
                    debug!(port = self.port, %sender, error = %decode_err, "discarding undecodable MAVLink frame");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn idle_timeout_exits_cleanly_without_traffic() {
        let engine = Arc::new(StateEngine::new(30_000));
        let cancel = CancellationToken::new();
        let listener = Listener::new(0, 20, 4096, engine, cancel);
        let result = listener.run().await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn cancellation_exits_cleanly() {
        let engine = Arc::new(StateEngine::new(30_000));
        let cancel = CancellationToken::new();
        let listener_cancel = cancel.clone();
        let handle = tokio::spawn(async move { Listener::new(0, 60_000, 4096, engine, listener_cancel).run().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        let result = handle.await.unwrap();
        assert!(result.is_ok());
    }

    // spec.md §7 / the HTTP error surface's 409 mapping: a bind racing an
    // already-bound port must be distinguishable as `PortAlreadyInUse`
    // rather than a generic `Socket` error.
    #[test]
    fn bind_on_occupied_port_reports_port_already_in_use() {
        let holder = std::net::UdpSocket::bind("0.0.0.0:0").expect("bind ephemeral port");
        let port = holder.local_addr().expect("local addr").port();

        let engine = Arc::new(StateEngine::new(30_000));
        let cancel = CancellationToken::new();
        let listener = Listener::new(port, 1000, 4096, engine, cancel);

        let result = listener.bind();
        assert!(
            matches!(result, Err(ListenerError::PortAlreadyInUse(p)) if p == port),
            "expected PortAlreadyInUse({port}), got {result:?}"
        );
    }
}

//! Blocking ICMP receive loop.
//!
//! Runs on a dedicated OS thread: bounded-timeout reads from the raw socket,
//! strips the IP and ICMP headers, decodes the envelope, and publishes the
//! decoded record to the control loop's bounded queue. Unrelated ICMP
//! traffic (echo probes, ping replies from other tools) simply fails the
//! terminator check and is dropped without comment.

use anyhow::Result;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::metrics::Metrics;
use crate::proto::{Envelope, Kind};
use crate::transport::icmp::{ICMP_HEADER_SIZE, parse_echo_header, strip_ipv4_header};
use crate::transport::sink::IcmpTransport;
use crate::transport::socket::recv_icmp;

/// Capacity of the decoded-record queue feeding the control loop.
pub const RECV_QUEUE_CAPACITY: usize = 10_000;

/// Read buffer size; comfortably above the largest possible envelope.
const RECV_BUFFER_SIZE: usize = 10_240;

/// A decoded envelope together with its network-level context.
#[derive(Debug, Clone)]
pub struct TunnelPacket {
    pub kind: Kind,
    pub payload: Vec<u8>,
    pub session_id: String,
    pub target: String,
    /// Source address of the ICMP packet.
    pub peer: IpAddr,
    pub reply_protocol: i16,
    pub catch_mode: i16,
    pub auth_key: u32,
    pub echo_id: u16,
    pub echo_seq: u16,
}

/// The receiver decodes inbound ICMP echoes into tunnel packets.
pub struct Receiver {
    transport: Arc<IcmpTransport>,
    out: mpsc::Sender<TunnelPacket>,
    cancel: CancellationToken,
    metrics: Arc<Metrics>,
}

impl Receiver {
    pub fn new(
        transport: Arc<IcmpTransport>,
        out: mpsc::Sender<TunnelPacket>,
        cancel: CancellationToken,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            transport,
            out,
            cancel,
            metrics,
        }
    }

    /// Run the receiver on a dedicated thread (blocking I/O).
    ///
    /// No read error stops the loop; only cancellation does. The socket's
    /// read timeout bounds how long each poll can block.
    pub fn run_blocking(self) -> Result<()> {
        let mut buffer = [0u8; RECV_BUFFER_SIZE];

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let (len, peer) = match recv_icmp(self.transport.socket(), &mut buffer) {
                Ok(read) => read,
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(e) => {
                    warn!("icmp read error: {e}");
                    continue;
                }
            };

            let Some(icmp) = strip_ipv4_header(&buffer[..len]) else {
                continue;
            };
            let Some((echo_id, echo_seq)) = parse_echo_header(icmp) else {
                continue;
            };

            // Kind and terminator checks live in the codec: anything that is
            // not a well-formed tunnel envelope is foreign traffic.
            let envelope = match Envelope::decode(&icmp[ICMP_HEADER_SIZE..]) {
                Ok(envelope) => envelope,
                Err(e) => {
                    trace!(peer = %peer, "ignoring non-tunnel icmp: {e}");
                    continue;
                }
            };

            let packet = TunnelPacket {
                kind: envelope.kind,
                payload: envelope.payload,
                session_id: envelope.session_id,
                target: envelope.target,
                peer,
                reply_protocol: envelope.reply_protocol,
                catch_mode: envelope.catch_mode,
                auth_key: envelope.auth_key,
                echo_id,
                echo_seq,
            };

            // Never block the receive loop on a slow consumer: a full queue
            // drops the packet and counts the drop.
            match self.out.try_send(packet) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    self.metrics.queue_drops.fetch_add(1, Ordering::Relaxed);
                    debug!("decoded-record queue full, dropping packet");
                }
                Err(TrySendError::Closed(_)) => break,
            }
        }

        Ok(())
    }
}

/// Spawn the receiver on a dedicated OS thread.
pub fn spawn_receiver(
    transport: Arc<IcmpTransport>,
    out: mpsc::Sender<TunnelPacket>,
    cancel: CancellationToken,
    metrics: Arc<Metrics>,
) -> std::thread::JoinHandle<Result<()>> {
    std::thread::spawn(move || Receiver::new(transport, out, cancel, metrics).run_blocking())
}

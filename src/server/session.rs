//! Per-session state and the session receiver task.
//!
//! A session is one tunneled UDP flow: a connected UDP socket toward the
//! real target plus a receiver task that pulls replies back. The session
//! table itself is owned exclusively by the control loop; the receiver task
//! only touches its own session's shared fields and the catch queue, never
//! the table.

use anyhow::{Context, Result};
use parking_lot::RwLock;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::metrics::Metrics;
use crate::proto::{Envelope, Kind};
use crate::transport::receiver::TunnelPacket;
use crate::transport::sink::{IcmpSink, OutFrame};
use crate::transport::icmp::reply_icmp_type;

/// Capacity of the per-session captured-reply queue.
pub const CATCH_QUEUE_CAPACITY: usize = 1_000;
/// How long the receiver waits to enqueue a captured reply before dropping it.
pub const CATCH_PUSH_TIMEOUT: Duration = Duration::from_millis(10);
/// How long a CATCH request waits for a captured reply before giving up.
pub const CATCH_POP_TIMEOUT: Duration = Duration::from_millis(1);

/// UDP read buffer; replies larger than an envelope payload cannot transit.
const UDP_BUFFER_SIZE: usize = 2_000;

/// A UDP reply captured while the session is in catch mode, awaiting a
/// CATCH request to release it.
#[derive(Debug, Clone)]
pub struct CatchMsg {
    pub session_id: String,
    pub peer: IpAddr,
    pub payload: Vec<u8>,
}

/// Echo id/seq of the most recent request for a session.
///
/// Outgoing replies reuse these so they correlate to a request the peer's
/// network path has seen. Stored per session, not process-wide, so
/// concurrent peers never race on each other's correlation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EchoContext {
    pub peer: IpAddr,
    pub id: u16,
    pub seq: u16,
}

/// Mutable session fields shared between the control loop and the session
/// receiver task.
#[derive(Debug)]
pub struct SessionShared {
    pub last_active: Instant,
    pub catch_mode: i16,
    pub closing: bool,
    pub reply_protocol: i16,
    pub echo: EchoContext,
}

/// One live tunneled flow, owned by the control loop via the session table.
pub struct Session {
    pub id: String,
    pub target: SocketAddr,
    pub socket: Arc<UdpSocket>,
    pub shared: Arc<RwLock<SessionShared>>,
    /// Consumer end of the catch queue; only the control loop pops.
    pub catch_rx: mpsc::Receiver<CatchMsg>,
    pub cancel: CancellationToken,
}

impl Session {
    /// Resolve the target, dial a UDP socket, and spawn the receiver task.
    ///
    /// Failure here means no session is created and the triggering packet is
    /// dropped.
    pub async fn open(
        packet: &TunnelPacket,
        sink: Arc<dyn IcmpSink>,
        metrics: Arc<Metrics>,
        key: u32,
        parent: &CancellationToken,
    ) -> Result<Session> {
        let target = tokio::net::lookup_host(&packet.target)
            .await
            .with_context(|| format!("failed to resolve udp target {}", packet.target))?
            .next()
            .with_context(|| format!("udp target {} resolved to nothing", packet.target))?;

        let bind_addr: SocketAddr = if target.is_ipv4() {
            "0.0.0.0:0".parse().unwrap()
        } else {
            "[::]:0".parse().unwrap()
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(target).await?;
        let socket = Arc::new(socket);

        let shared = Arc::new(RwLock::new(SessionShared {
            last_active: Instant::now(),
            catch_mode: packet.catch_mode,
            closing: false,
            reply_protocol: packet.reply_protocol,
            echo: EchoContext {
                peer: packet.peer,
                id: packet.echo_id,
                seq: packet.echo_seq,
            },
        }));

        let (catch_tx, catch_rx) = mpsc::channel(CATCH_QUEUE_CAPACITY);
        let cancel = parent.child_token();

        info!(
            session = %packet.session_id,
            target = %target,
            local = %socket.local_addr().map(|a| a.to_string()).unwrap_or_default(),
            "session opened, waiting for target replies"
        );

        tokio::spawn(run_session_receiver(
            packet.session_id.clone(),
            socket.clone(),
            shared.clone(),
            catch_tx,
            sink,
            metrics,
            key,
            cancel.clone(),
        ));

        Ok(Session {
            id: packet.session_id.clone(),
            target,
            socket,
            shared,
            catch_rx,
            cancel,
        })
    }
}

/// Read UDP replies from the target until closed.
///
/// In catch mode replies are queued for later CATCH release; otherwise they
/// are emitted immediately over ICMP using the session's reply protocol and
/// echo context. A persistent read error marks the session closing and ends
/// the task; the table reaper removes it on the next tick.
#[allow(clippy::too_many_arguments)]
async fn run_session_receiver(
    id: String,
    socket: Arc<UdpSocket>,
    shared: Arc<RwLock<SessionShared>>,
    catch_tx: mpsc::Sender<CatchMsg>,
    sink: Arc<dyn IcmpSink>,
    metrics: Arc<Metrics>,
    key: u32,
    cancel: CancellationToken,
) {
    let mut buffer = [0u8; UDP_BUFFER_SIZE];

    loop {
        let len = tokio::select! {
            _ = cancel.cancelled() => break,
            read = socket.recv(&mut buffer) => match read {
                Ok(len) => len,
                Err(e) => {
                    warn!(session = %id, "udp read error: {e}");
                    shared.write().closing = true;
                    break;
                }
            },
        };

        let (catch_mode, reply_protocol, echo) = {
            let mut state = shared.write();
            state.last_active = Instant::now();
            (state.catch_mode, state.reply_protocol, state.echo)
        };

        if catch_mode > 0 {
            let msg = CatchMsg {
                session_id: id.clone(),
                peer: echo.peer,
                payload: buffer[..len].to_vec(),
            };
            // Soft rendezvous: wait briefly for queue space, then drop.
            match timeout(CATCH_PUSH_TIMEOUT, catch_tx.send(msg)).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) | Err(_) => {
                    debug!(session = %id, "catch queue full, dropping reply");
                }
            }
        } else {
            let frame = OutFrame {
                peer: echo.peer,
                echo_id: echo.id,
                echo_seq: echo.seq,
                icmp_type: reply_icmp_type(reply_protocol),
                envelope: Envelope {
                    kind: Kind::Data,
                    session_id: id.clone(),
                    target: String::new(),
                    payload: buffer[..len].to_vec(),
                    reply_protocol: -1,
                    catch_mode: 0,
                    auth_key: key,
                },
            };
            if let Err(e) = sink.send_reply(&frame) {
                warn!(session = %id, "icmp reply send failed: {e}");
            }
        }

        metrics.sent_packets.fetch_add(1, Ordering::Relaxed);
        metrics.sent_bytes.fetch_add(len as u64, Ordering::Relaxed);
    }
}

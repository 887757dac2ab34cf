//! Server control loop: the session table owner.
//!
//! A single task consumes decoded tunnel packets and a periodic tick. All
//! session-table mutation happens here; session receiver tasks hold only
//! their own session's shared fields. That single-writer rule replaces a
//! lock on the table and is enforced by construction: nothing else ever
//! holds a mutable reference to it.

pub mod session;

pub use session::*;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::Config;
use crate::metrics::Metrics;
use crate::proto::{Envelope, Kind};
use crate::transport::icmp::reply_icmp_type;
use crate::transport::receiver::TunnelPacket;
use crate::transport::sink::{IcmpSink, OutFrame};

pub struct Server {
    config: Config,
    sink: Arc<dyn IcmpSink>,
    metrics: Arc<Metrics>,
    table: HashMap<String, Session>,
    cancel: CancellationToken,
}

impl Server {
    pub fn new(
        config: Config,
        sink: Arc<dyn IcmpSink>,
        metrics: Arc<Metrics>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            sink,
            metrics,
            table: HashMap::new(),
            cancel,
        }
    }

    /// Run the control loop until cancelled or the packet source closes.
    pub async fn run(mut self, mut packets: mpsc::Receiver<TunnelPacket>) {
        let mut tick = tokio::time::interval(self.config.tick);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tick.tick() => {
                    self.check_timeouts();
                    self.report();
                }
                packet = packets.recv() => {
                    match packet {
                        Some(packet) => self.process_packet(packet).await,
                        None => break,
                    }
                }
            }
        }

        for (id, session) in self.table.drain() {
            debug!(session = %id, "shutting down session");
            session.cancel.cancel();
        }
    }

    /// Dispatch one decoded packet.
    ///
    /// The auth key is the access-control gate: a mismatch is discarded with
    /// no response at all, so probers learn nothing about the tunnel.
    pub async fn process_packet(&mut self, packet: TunnelPacket) {
        if packet.auth_key != self.config.key {
            trace!(peer = %packet.peer, "dropping packet with mismatched key");
            return;
        }

        if packet.kind == Kind::Ping {
            self.handle_ping(&packet);
            return;
        }

        if !self.table.contains_key(&packet.session_id) {
            match Session::open(
                &packet,
                self.sink.clone(),
                self.metrics.clone(),
                self.config.key,
                &self.cancel,
            )
            .await
            {
                Ok(session) => {
                    self.table.insert(packet.session_id.clone(), session);
                }
                Err(e) => {
                    warn!(session = %packet.session_id, "cannot open session: {e:#}");
                    return;
                }
            }
        }

        {
            let Some(session) = self.table.get_mut(&packet.session_id) else {
                return;
            };
            let mut shared = session.shared.write();
            shared.last_active = Instant::now();
            shared.catch_mode = packet.catch_mode;
            shared.reply_protocol = packet.reply_protocol;
            shared.echo = EchoContext {
                peer: packet.peer,
                id: packet.echo_id,
                seq: packet.echo_seq,
            };
        }

        match packet.kind {
            Kind::Catch => self.handle_catch(&packet).await,
            Kind::Data => self.handle_data(&packet).await,
            Kind::Ping => unreachable!("ping handled above"),
        }
    }

    /// Echo the probe payload straight back with the requested ICMP type.
    fn handle_ping(&self, packet: &TunnelPacket) {
        info!(
            peer = %packet.peer,
            rproto = packet.reply_protocol,
            echo_id = packet.echo_id,
            echo_seq = packet.echo_seq,
            len = packet.payload.len(),
            "ping"
        );
        let frame = OutFrame {
            peer: packet.peer,
            echo_id: packet.echo_id,
            echo_seq: packet.echo_seq,
            icmp_type: reply_icmp_type(packet.reply_protocol),
            envelope: Envelope {
                kind: Kind::Ping,
                session_id: String::new(),
                target: String::new(),
                payload: packet.payload.clone(),
                reply_protocol: -1,
                catch_mode: 0,
                auth_key: self.config.key,
            },
        };
        if let Err(e) = self.sink.send_reply(&frame) {
            warn!(peer = %packet.peer, "ping reply send failed: {e}");
        }
    }

    /// Forward a DATA payload to the session's UDP target.
    async fn handle_data(&mut self, packet: &TunnelPacket) {
        let Some(session) = self.table.get_mut(&packet.session_id) else {
            return;
        };

        match session.socket.send(&packet.payload).await {
            Ok(_) => {
                self.metrics.recv_packets.fetch_add(1, Ordering::Relaxed);
                self.metrics
                    .recv_bytes
                    .fetch_add(packet.payload.len() as u64, Ordering::Relaxed);
            }
            Err(e) => {
                // No retry: the packet is dropped and the session reaped.
                warn!(session = %session.id, "udp write failed: {e}");
                session.shared.write().closing = true;
            }
        }
    }

    /// Release at most one captured reply for a CATCH poll.
    ///
    /// An empty queue within the bound is "no data pending", not an error;
    /// the poll simply goes unanswered.
    async fn handle_catch(&mut self, packet: &TunnelPacket) {
        let Some(session) = self.table.get_mut(&packet.session_id) else {
            return;
        };

        self.metrics.catch_recv.fetch_add(1, Ordering::Relaxed);

        let reply_protocol = session.shared.read().reply_protocol;
        match timeout(CATCH_POP_TIMEOUT, session.catch_rx.recv()).await {
            Ok(Some(msg)) => {
                let frame = OutFrame {
                    // Correlate the release to the CATCH request that pulled it.
                    peer: packet.peer,
                    echo_id: packet.echo_id,
                    echo_seq: packet.echo_seq,
                    icmp_type: reply_icmp_type(reply_protocol),
                    envelope: Envelope {
                        kind: Kind::Catch,
                        session_id: msg.session_id,
                        target: String::new(),
                        payload: msg.payload,
                        reply_protocol: -1,
                        catch_mode: 0,
                        auth_key: self.config.key,
                    },
                };
                match self.sink.send_reply(&frame) {
                    Ok(()) => {
                        self.metrics.catch_sent.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        warn!(session = %packet.session_id, "catch reply send failed: {e}");
                    }
                }
            }
            Ok(None) | Err(_) => {}
        }
    }

    /// Sweep the table: mark idle sessions closing, then reap everything
    /// marked closing (idle timeout or a failed socket).
    pub fn check_timeouts(&mut self) {
        let now = Instant::now();
        let idle_timeout = self.config.timeout;

        for session in self.table.values() {
            let mut shared = session.shared.write();
            if now.duration_since(shared.last_active) > idle_timeout {
                shared.closing = true;
            }
        }

        self.table.retain(|id, session| {
            if session.shared.read().closing {
                info!(session = %id, target = %session.target, "closing session");
                session.cancel.cancel();
                false
            } else {
                true
            }
        });
    }

    /// Emit the per-tick throughput summary and reset the counters.
    pub fn report(&self) {
        let report = self.metrics.take_report();
        if !report.is_idle() {
            info!(sessions = self.table.len(), "{report}");
        }
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.table.len()
    }

    /// Whether a session with this id is currently in the table.
    pub fn has_session(&self, id: &str) -> bool {
        self.table.contains_key(id)
    }
}

use anyhow::Result;
use socket2::Socket;
use std::net::IpAddr;
use std::sync::Arc;

use crate::proto::Envelope;
use crate::transport::icmp::build_echo_frame;
use crate::transport::socket::{create_raw_icmp_socket, send_icmp};

/// A reply scheduled for emission over ICMP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutFrame {
    /// ICMP peer to address the frame to.
    pub peer: IpAddr,
    /// Echo identifier correlated to the triggering request.
    pub echo_id: u16,
    /// Echo sequence correlated to the triggering request.
    pub echo_seq: u16,
    /// Concrete ICMP type for the frame (already mapped from reply protocol).
    pub icmp_type: u8,
    pub envelope: Envelope,
}

/// Emission seam between the server and the raw socket.
///
/// The control loop and session receivers only see this trait; tests swap in
/// a capturing implementation.
pub trait IcmpSink: Send + Sync {
    fn send_reply(&self, frame: &OutFrame) -> Result<()>;
}

/// Production transport: one raw ICMP socket shared by the receive loop and
/// every sender.
pub struct IcmpTransport {
    socket: Socket,
}

impl IcmpTransport {
    pub fn new() -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            socket: create_raw_icmp_socket()?,
        }))
    }

    pub fn socket(&self) -> &Socket {
        &self.socket
    }
}

impl IcmpSink for IcmpTransport {
    fn send_reply(&self, frame: &OutFrame) -> Result<()> {
        let body = frame.envelope.encode();
        let bytes = build_echo_frame(frame.icmp_type, frame.echo_id, frame.echo_seq, &body);
        send_icmp(&self.socket, &bytes, frame.peer)?;
        Ok(())
    }
}

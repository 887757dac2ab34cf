//! Process-wide throughput counters.
//!
//! Session receivers and the control loop increment; the control loop
//! snapshots and resets once per tick to report per-second rates, matching
//! the original reset-on-report semantics.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Metrics {
    /// UDP replies emitted (or queued for catch) back toward clients.
    pub sent_packets: AtomicU64,
    pub sent_bytes: AtomicU64,
    /// DATA payloads forwarded to UDP targets.
    pub recv_packets: AtomicU64,
    pub recv_bytes: AtomicU64,
    /// Queued replies released by CATCH requests.
    pub catch_sent: AtomicU64,
    /// CATCH requests accepted (whether or not a reply was pending).
    pub catch_recv: AtomicU64,
    /// Packets dropped because the decoded-record queue was full.
    pub queue_drops: AtomicU64,
}

/// One tick's worth of counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Report {
    pub sent_packets: u64,
    pub sent_bytes: u64,
    pub recv_packets: u64,
    pub recv_bytes: u64,
    pub catch_sent: u64,
    pub catch_recv: u64,
    pub queue_drops: u64,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Snapshot all counters and reset them to zero.
    pub fn take_report(&self) -> Report {
        Report {
            sent_packets: self.sent_packets.swap(0, Ordering::Relaxed),
            sent_bytes: self.sent_bytes.swap(0, Ordering::Relaxed),
            recv_packets: self.recv_packets.swap(0, Ordering::Relaxed),
            recv_bytes: self.recv_bytes.swap(0, Ordering::Relaxed),
            catch_sent: self.catch_sent.swap(0, Ordering::Relaxed),
            catch_recv: self.catch_recv.swap(0, Ordering::Relaxed),
            queue_drops: self.queue_drops.swap(0, Ordering::Relaxed),
        }
    }
}

impl Report {
    pub fn is_idle(&self) -> bool {
        *self == Report {
            sent_packets: 0,
            sent_bytes: 0,
            recv_packets: 0,
            recv_bytes: 0,
            catch_sent: 0,
            catch_recv: 0,
            queue_drops: 0,
        }
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "send {}pkt/s {}KB/s recv {}pkt/s {}KB/s sendCatch {}/s recvCatch {}/s",
            self.sent_packets,
            self.sent_bytes / 1024,
            self.recv_packets,
            self.recv_bytes / 1024,
            self.catch_sent,
            self.catch_recv,
        )?;
        if self.queue_drops > 0 {
            write!(f, " drops {}/s", self.queue_drops)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_report_resets() {
        let metrics = Metrics::new();
        metrics.sent_packets.fetch_add(3, Ordering::Relaxed);
        metrics.sent_bytes.fetch_add(2048, Ordering::Relaxed);
        metrics.catch_recv.fetch_add(1, Ordering::Relaxed);

        let report = metrics.take_report();
        assert_eq!(report.sent_packets, 3);
        assert_eq!(report.sent_bytes, 2048);
        assert_eq!(report.catch_recv, 1);
        assert!(!report.is_idle());

        assert!(metrics.take_report().is_idle());
    }

    #[test]
    fn test_report_display() {
        let metrics = Metrics::new();
        metrics.sent_packets.fetch_add(2, Ordering::Relaxed);
        metrics.sent_bytes.fetch_add(4096, Ordering::Relaxed);
        let text = metrics.take_report().to_string();
        assert!(text.contains("send 2pkt/s 4KB/s"));
        assert!(!text.contains("drops"));
    }
}

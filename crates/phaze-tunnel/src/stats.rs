//! Traffic statistics.
//!
//! Counters are only ever fed by the relay loops with what they actually
//! moved; nothing here is estimated.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Live counters shared by both relay loops.
#[derive(Debug, Default)]
pub struct StatsCollector {
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    packets_in: AtomicU64,
    packets_out: AtomicU64,
    send_drops: AtomicU64,
    auth_failures: AtomicU64,
    malformed_frames: AtomicU64,
    stale_frames: AtomicU64,
    oversized_packets: AtomicU64,
    reconnects: AtomicU64,
    /// Milliseconds since the Unix epoch, 0 when idle
    last_activity_ms: AtomicU64,
    started_at: Mutex<Option<Instant>>,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a packet delivered from the remote to the interface.
    pub fn record_ingress(&self, bytes: usize) {
        self.bytes_in.fetch_add(bytes as u64, Ordering::Relaxed);
        self.packets_in.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    /// Record a packet sent from the interface to the remote.
    pub fn record_egress(&self, bytes: usize) {
        self.bytes_out.fetch_add(bytes as u64, Ordering::Relaxed);
        self.packets_out.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    pub fn record_send_drop(&self) {
        self.send_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_auth_failure(&self) {
        self.auth_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_malformed(&self) {
        self.malformed_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale(&self) {
        self.stale_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_oversized(&self) {
        self.oversized_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    /// Mark the remote as alive without counting traffic.
    pub fn touch(&self) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        self.last_activity_ms.store(now, Ordering::Relaxed);
    }

    /// Start the session clock.
    pub fn mark_started(&self, at: Instant) {
        *self.started_at.lock() = Some(at);
    }

    /// Point-in-time copy of all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        let last_ms = self.last_activity_ms.load(Ordering::Relaxed);
        StatsSnapshot {
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            packets_in: self.packets_in.load(Ordering::Relaxed),
            packets_out: self.packets_out.load(Ordering::Relaxed),
            connected_duration: self
                .started_at
                .lock()
                .map(|at| at.elapsed())
                .unwrap_or_default(),
            last_activity: (last_ms != 0).then(|| UNIX_EPOCH + Duration::from_millis(last_ms)),
            send_drops: self.send_drops.load(Ordering::Relaxed),
            auth_failures: self.auth_failures.load(Ordering::Relaxed),
            malformed_frames: self.malformed_frames.load(Ordering::Relaxed),
            stale_frames: self.stale_frames.load(Ordering::Relaxed),
            oversized_packets: self.oversized_packets.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }

    /// Zero every counter and stop the session clock.
    pub fn reset(&self) {
        for counter in [
            &self.bytes_in,
            &self.bytes_out,
            &self.packets_in,
            &self.packets_out,
            &self.send_drops,
            &self.auth_failures,
            &self.malformed_frames,
            &self.stale_frames,
            &self.oversized_packets,
            &self.reconnects,
            &self.last_activity_ms,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        *self.started_at.lock() = None;
    }
}

/// Immutable copy of the counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub packets_in: u64,
    pub packets_out: u64,
    pub connected_duration: Duration,
    pub last_activity: Option<SystemTime>,
    /// Frames that could not be handed to the transport
    pub send_drops: u64,
    pub auth_failures: u64,
    pub malformed_frames: u64,
    /// Duplicates and frames older than the replay window. The window is
    /// checked against the header before decryption, so a forged frame
    /// carrying an already seen sequence lands here, not in `auth_failures`.
    pub stale_frames: u64,
    /// Interface packets larger than the MTU
    pub oversized_packets: u64,
    pub reconnects: u64,
}

impl StatsSnapshot {
    /// Format as human-readable string
    pub fn format(&self) -> String {
        format!(
            "TX: {:.2}MB ({} pkts), RX: {:.2}MB ({} pkts), up {}s, \
             dropped {}, rejected {}, reconnects {}",
            self.bytes_out as f64 / (1024.0 * 1024.0),
            self.packets_out,
            self.bytes_in as f64 / (1024.0 * 1024.0),
            self.packets_in,
            self.connected_duration.as_secs(),
            self.send_drops + self.oversized_packets,
            self.auth_failures + self.malformed_frames + self.stale_frames,
            self.reconnects
        )
    }
}

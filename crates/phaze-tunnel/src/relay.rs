//! Packet Relay
//!
//! Two loops per connected transport:
//!
//! ```text
//!            egress: read_packet -> encode -> send
//!   TUN  <===========================================>  remote
//!            ingress: recv -> decode -> replay check -> write_packet
//! ```
//!
//! Per-frame problems (bad tag, garbage, replays, send hiccups) are counted
//! and dropped. Only a dead transport, a dead interface, a Disconnect from
//! the remote or the stop signal end the relay.

use crate::codec::{peek_sequence, CodecError, FrameCodec, FrameKind};
use crate::interface::{InterfaceError, TunnelInterface};
use crate::replay::SequenceState;
use crate::session::Session;
use crate::stats::StatsCollector;
use crate::transport::{TransportError, TransportSocket};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Relay tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayOptions {
    pub mtu: u16,
    pub keepalive_interval: Duration,
    pub idle_timeout: Duration,
}

impl RelayOptions {
    pub fn from_session(session: &Session) -> Self {
        Self {
            mtu: session.mtu(),
            keepalive_interval: session.options().keepalive_interval,
            idle_timeout: session.options().idle_timeout,
        }
    }
}

/// Why a relay stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayExit {
    /// The stop signal fired
    Cancelled,
    /// The transport died; reconnecting may help
    TransportFailed(TransportError),
    /// The interface died; the session is over
    InterfaceFailed(InterfaceError),
    /// The remote sent a Disconnect frame
    PeerDisconnected,
}

struct RelayContext {
    codec: Arc<FrameCodec>,
    sequences: Arc<SequenceState>,
    interface: Arc<dyn TunnelInterface>,
    transport: Arc<dyn TransportSocket>,
    stats: Arc<StatsCollector>,
    options: RelayOptions,
}

/// Moves packets between one interface and one transport
pub struct PacketRelay {
    ctx: Arc<RelayContext>,
}

impl PacketRelay {
    pub fn new(
        codec: Arc<FrameCodec>,
        sequences: Arc<SequenceState>,
        interface: Arc<dyn TunnelInterface>,
        transport: Arc<dyn TransportSocket>,
        stats: Arc<StatsCollector>,
        options: RelayOptions,
    ) -> Self {
        Self {
            ctx: Arc::new(RelayContext {
                codec,
                sequences,
                interface,
                transport,
                stats,
                options,
            }),
        }
    }

    /// Run both loops until one of them stops or `cancel` fires
    pub async fn run(self, cancel: CancellationToken) -> RelayExit {
        let stop = cancel.child_token();
        debug!(
            peer = %self.ctx.transport.peer(),
            device = %self.ctx.interface.name(),
            "Relay started"
        );

        let egress = tokio::spawn(egress_loop(self.ctx.clone(), stop.clone()));
        let ingress = tokio::spawn(ingress_loop(self.ctx.clone(), stop.clone()));
        let (egress, ingress) = tokio::join!(egress, ingress);

        let exit = [egress, ingress]
            .into_iter()
            .map(|joined| {
                joined.unwrap_or_else(|e| {
                    let reason = format!("relay task failed: {}", e);
                    RelayExit::InterfaceFailed(InterfaceError::Io(reason))
                })
            })
            .find(|exit| *exit != RelayExit::Cancelled)
            .unwrap_or(RelayExit::Cancelled);

        debug!(?exit, "Relay stopped");
        exit
    }
}

async fn egress_loop(ctx: Arc<RelayContext>, stop: CancellationToken) -> RelayExit {
    // Whatever ends this loop ends the other one too
    let _stop_both = stop.clone().drop_guard();

    let period = ctx.options.keepalive_interval;
    let mut keepalive = tokio::time::interval_at(Instant::now() + period, period);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mtu = ctx.options.mtu as usize;

    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => return RelayExit::Cancelled,
            _ = keepalive.tick() => {
                trace!("Sending keepalive");
                if let Err(exit) = send_frame(&ctx, FrameKind::Keepalive, &[]).await {
                    return exit;
                }
            }
            packet = ctx.interface.read_packet() => match packet {
                Ok(packet) if packet.len() > mtu => {
                    debug!(len = packet.len(), mtu, "Dropping oversized packet");
                    ctx.stats.record_oversized();
                }
                Ok(packet) => {
                    if let Err(exit) = send_frame(&ctx, FrameKind::Data, &packet).await {
                        return exit;
                    }
                }
                Err(InterfaceError::Closed) if stop.is_cancelled() => return RelayExit::Cancelled,
                Err(e) => {
                    warn!(error = %e, "Interface read failed");
                    return RelayExit::InterfaceFailed(e);
                }
            },
        }
    }
}

async fn send_frame(ctx: &RelayContext, kind: FrameKind, payload: &[u8]) -> Result<(), RelayExit> {
    let seq = ctx.sequences.next_sequence();
    let frame = match ctx.codec.encode(kind, payload, seq) {
        Ok(frame) => frame,
        Err(e) => {
            debug!(error = %e, "Failed to encode frame");
            ctx.stats.record_send_drop();
            return Ok(());
        }
    };

    match ctx.transport.send(frame.as_bytes()).await {
        Ok(()) => {
            if kind == FrameKind::Data {
                ctx.stats.record_egress(payload.len());
            }
            Ok(())
        }
        Err(e) if e.is_fatal() => {
            warn!(error = %e, "Transport send failed");
            Err(RelayExit::TransportFailed(e))
        }
        Err(e) => {
            debug!(error = %e, seq, "Frame dropped on send");
            ctx.stats.record_send_drop();
            Ok(())
        }
    }
}

async fn ingress_loop(ctx: Arc<RelayContext>, stop: CancellationToken) -> RelayExit {
    let _stop_both = stop.clone().drop_guard();
    let mut last_seen = Instant::now();

    loop {
        if last_seen.elapsed() >= ctx.options.idle_timeout {
            warn!(idle = ?ctx.options.idle_timeout, "No authenticated traffic from remote");
            return RelayExit::TransportFailed(TransportError::Timeout);
        }

        let received = tokio::select! {
            biased;
            _ = stop.cancelled() => return RelayExit::Cancelled,
            received = ctx.transport.recv() => received,
        };

        let bytes = match received {
            Ok(bytes) => bytes,
            Err(TransportError::Timeout) => continue,
            Err(TransportError::Closed) if stop.is_cancelled() => return RelayExit::Cancelled,
            Err(e) if e.is_fatal() => {
                warn!(error = %e, "Transport receive failed");
                return RelayExit::TransportFailed(e);
            }
            Err(e) => {
                debug!(error = %e, "Transient receive error");
                continue;
            }
        };

        if peek_sequence(&bytes).is_some_and(|seq| ctx.sequences.is_replay(seq)) {
            trace!("Dropping replayed frame before decryption");
            ctx.stats.record_stale();
            continue;
        }

        let frame = match ctx.codec.decode(&bytes) {
            Ok(frame) => frame,
            Err(CodecError::AuthenticationFailed) => {
                trace!(len = bytes.len(), "Dropping unauthenticated frame");
                ctx.stats.record_auth_failure();
                continue;
            }
            Err(e) => {
                trace!(error = %e, "Dropping malformed frame");
                ctx.stats.record_malformed();
                continue;
            }
        };

        if let Err(e) = ctx.sequences.accept(frame.sequence) {
            trace!(error = %e, "Dropping stale frame");
            ctx.stats.record_stale();
            continue;
        }
        last_seen = Instant::now();

        match frame.kind {
            FrameKind::Data => match ctx.interface.write_packet(&frame.payload).await {
                Ok(()) => ctx.stats.record_ingress(frame.payload.len()),
                Err(InterfaceError::Closed) if stop.is_cancelled() => return RelayExit::Cancelled,
                Err(e) => {
                    warn!(error = %e, "Interface write failed");
                    return RelayExit::InterfaceFailed(e);
                }
            },
            FrameKind::Keepalive => ctx.stats.touch(),
            FrameKind::Disconnect => {
                info!("Remote closed the session");
                return RelayExit::PeerDisconnected;
            }
        }
    }
}

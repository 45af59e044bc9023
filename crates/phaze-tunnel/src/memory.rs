//! Channel-backed interface and transport.
//!
//! Lets the client run against a userspace network stack or a simulated
//! remote instead of a kernel TUN device and a UDP socket.

use crate::interface::{InterfaceError, TunnelInterface};
use crate::transport::{TransportError, TransportSocket};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Queue depth of every channel
pub const CHANNEL_CAPACITY: usize = 1024;

/// In-memory virtual interface
pub struct MemoryInterface {
    name: String,
    mtu: u16,
    inbound: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
    outbound: mpsc::Sender<Vec<u8>>,
    closed: CancellationToken,
}

/// The "network stack" end of a [`MemoryInterface`]
pub struct MemoryHost {
    /// Packets the stack wants to send through the tunnel
    pub to_tunnel: mpsc::Sender<Vec<u8>>,
    /// Packets the tunnel delivered to the stack
    pub from_tunnel: mpsc::Receiver<Vec<u8>>,
}

impl MemoryHost {
    /// Queue a packet for the tunnel to read
    pub async fn inject(&self, packet: Vec<u8>) -> bool {
        self.to_tunnel.send(packet).await.is_ok()
    }

    /// Next packet written by the tunnel, if one arrives within `wait`
    pub async fn next_packet(&mut self, wait: Duration) -> Option<Vec<u8>> {
        tokio::time::timeout(wait, self.from_tunnel.recv()).await.ok().flatten()
    }
}

impl MemoryInterface {
    /// Create an interface and the host end connected to it
    pub fn pair(name: &str, mtu: u16) -> (Self, MemoryHost) {
        let (to_tunnel, inbound) = mpsc::channel(CHANNEL_CAPACITY);
        let (outbound, from_tunnel) = mpsc::channel(CHANNEL_CAPACITY);

        let interface = Self {
            name: name.to_string(),
            mtu,
            inbound: tokio::sync::Mutex::new(inbound),
            outbound,
            closed: CancellationToken::new(),
        };
        (interface, MemoryHost { to_tunnel, from_tunnel })
    }

    pub fn is_destroyed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

#[async_trait]
impl TunnelInterface for MemoryInterface {
    fn name(&self) -> &str {
        &self.name
    }

    fn mtu(&self) -> u16 {
        self.mtu
    }

    async fn read_packet(&self) -> Result<Vec<u8>, InterfaceError> {
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(InterfaceError::Closed),
            packet = async { self.inbound.lock().await.recv().await } => {
                packet.ok_or_else(|| InterfaceError::Io("host side dropped".to_string()))
            }
        }
    }

    async fn write_packet(&self, packet: &[u8]) -> Result<(), InterfaceError> {
        if self.closed.is_cancelled() {
            return Err(InterfaceError::Closed);
        }
        if let Err(TrySendError::Full(_)) = self.outbound.try_send(packet.to_vec()) {
            trace!(device = %self.name, "Host queue full, packet dropped");
        }
        Ok(())
    }

    fn destroy(&self) {
        self.closed.cancel();
    }
}

/// In-memory datagram transport
pub struct MemoryTransport {
    tx: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
    recv_timeout: Duration,
    closed: CancellationToken,
}

impl MemoryTransport {
    /// Two transports wired to each other
    pub fn pair(recv_timeout: Duration) -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (b_tx, a_rx) = mpsc::channel(CHANNEL_CAPACITY);
        (
            Self::new(a_tx, a_rx, recv_timeout),
            Self::new(b_tx, b_rx, recv_timeout),
        )
    }

    fn new(tx: mpsc::Sender<Vec<u8>>, rx: mpsc::Receiver<Vec<u8>>, recv_timeout: Duration) -> Self {
        Self {
            tx: Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(rx),
            recv_timeout,
            closed: CancellationToken::new(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

#[async_trait]
impl TransportSocket for MemoryTransport {
    async fn send(&self, frame: &[u8]) -> Result<(), TransportError> {
        let tx = self.tx.lock().clone().ok_or(TransportError::Closed)?;
        // Datagram semantics: a full or vanished peer loses the frame
        if tx.try_send(frame.to_vec()).is_err() {
            trace!("Memory transport peer unavailable, frame dropped");
        }
        Ok(())
    }

    async fn recv(&self) -> Result<Vec<u8>, TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }

        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(TransportError::Closed),
            result = async {
                let mut rx = self.rx.lock().await;
                tokio::time::timeout(self.recv_timeout, rx.recv()).await
            } => match result {
                Err(_) => Err(TransportError::Timeout),
                Ok(Some(frame)) => Ok(frame),
                Ok(None) => Err(TransportError::PeerClosed),
            },
        }
    }

    fn close(&self) {
        self.closed.cancel();
        self.tx.lock().take();
    }

    fn peer(&self) -> String {
        "memory".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_interface_pair() {
        let (interface, mut host) = MemoryInterface::pair("mem0", 1400);

        assert!(host.inject(vec![1, 2, 3]).await);
        assert_eq!(interface.read_packet().await.unwrap(), vec![1, 2, 3]);

        interface.write_packet(&[4, 5]).await.unwrap();
        assert_eq!(host.next_packet(Duration::from_secs(1)).await, Some(vec![4, 5]));
    }

    #[tokio::test]
    async fn test_destroy_unblocks_read() {
        let (interface, _host) = MemoryInterface::pair("mem0", 1400);
        let interface = Arc::new(interface);

        let pending = {
            let interface = interface.clone();
            tokio::spawn(async move { interface.read_packet().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        interface.destroy();

        assert_eq!(pending.await.unwrap(), Err(InterfaceError::Closed));
        assert_eq!(interface.write_packet(&[1]).await, Err(InterfaceError::Closed));
        assert!(interface.is_destroyed());
    }

    #[tokio::test]
    async fn test_transport_pair() {
        let (a, b) = MemoryTransport::pair(Duration::from_millis(50));

        a.send(b"ping").await.unwrap();
        assert_eq!(b.recv().await.unwrap(), b"ping");
        assert_eq!(a.recv().await, Err(TransportError::Timeout));
    }

    #[tokio::test]
    async fn test_transport_close() {
        let (a, b) = MemoryTransport::pair(Duration::from_secs(30));
        let a = Arc::new(a);

        let pending = {
            let a = a.clone();
            tokio::spawn(async move { a.recv().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        a.close();

        assert_eq!(pending.await.unwrap(), Err(TransportError::Closed));
        assert_eq!(a.send(b"late").await, Err(TransportError::Closed));
        assert_eq!(b.recv().await, Err(TransportError::PeerClosed));
    }

    #[tokio::test]
    async fn test_send_to_dropped_peer_is_silent() {
        let (a, b) = MemoryTransport::pair(Duration::from_millis(50));
        drop(b);

        assert!(a.send(b"lost").await.is_ok());
    }
}

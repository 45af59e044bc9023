//! Datagram transport to the remote tunnel endpoint.
//!
//! A transport moves opaque frames and nothing else: no retries, no
//! framing, no crypto. Reconnect policy lives in the connection manager.

use crate::config::Endpoint;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Largest datagram we are prepared to receive
pub const MAX_DATAGRAM: usize = 65_535;

/// Unreliable frame channel to the remote endpoint
#[async_trait]
pub trait TransportSocket: Send + Sync {
    /// Send one frame
    async fn send(&self, frame: &[u8]) -> Result<(), TransportError>;

    /// Receive one frame, waiting at most the configured timeout
    async fn recv(&self) -> Result<Vec<u8>, TransportError>;

    /// Close the channel. Pending and later calls fail with `Closed`.
    fn close(&self);

    /// Human readable remote address
    fn peer(&self) -> String;
}

/// Connected UDP socket
pub struct UdpTransport {
    socket: RwLock<Option<Arc<UdpSocket>>>,
    peer: SocketAddr,
    recv_timeout: Duration,
    closed: CancellationToken,
}

impl UdpTransport {
    /// Resolve `endpoint` and connect an ephemeral socket to it
    pub async fn open(endpoint: &Endpoint, recv_timeout: Duration) -> Result<Self, TransportError> {
        let addr = resolve(endpoint)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| TransportError::Resolve(format!("{}: no addresses", endpoint)))?;

        Self::open_addr(addr, recv_timeout).await
    }

    /// Connect an ephemeral socket to an already resolved address
    pub async fn open_addr(
        addr: SocketAddr,
        recv_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let bind: SocketAddr = if addr.is_ipv6() {
            SocketAddr::from(([0u16; 8], 0))
        } else {
            SocketAddr::from(([0u8; 4], 0))
        };

        let socket = UdpSocket::bind(bind)
            .await
            .map_err(|e| TransportError::Bind(e.to_string()))?;
        socket
            .connect(addr)
            .await
            .map_err(|e| TransportError::Connect(format!("{}: {}", addr, e)))?;

        let local = socket.local_addr().map(|a| a.to_string()).unwrap_or_default();
        debug!("UDP transport {} -> {}", local, addr);

        Ok(Self {
            socket: RwLock::new(Some(Arc::new(socket))),
            peer: addr,
            recv_timeout,
            closed: CancellationToken::new(),
        })
    }

    /// Resolved remote address
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    fn socket(&self) -> Result<Arc<UdpSocket>, TransportError> {
        self.socket.read().clone().ok_or(TransportError::Closed)
    }
}

#[async_trait]
impl TransportSocket for UdpTransport {
    async fn send(&self, frame: &[u8]) -> Result<(), TransportError> {
        let socket = self.socket()?;
        match socket.send(frame).await {
            Ok(_) => Ok(()),
            Err(e) => Err(TransportError::Send(e.to_string())),
        }
    }

    async fn recv(&self) -> Result<Vec<u8>, TransportError> {
        let socket = self.socket()?;
        let mut buf = vec![0u8; MAX_DATAGRAM];

        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(TransportError::Closed),
            result = tokio::time::timeout(self.recv_timeout, socket.recv(&mut buf)) => {
                match result {
                    Err(_) => Err(TransportError::Timeout),
                    Ok(Ok(n)) => {
                        buf.truncate(n);
                        Ok(buf)
                    }
                    Ok(Err(e)) => Err(map_recv_error(e)),
                }
            }
        }
    }

    fn close(&self) {
        self.closed.cancel();
        self.socket.write().take();
    }

    fn peer(&self) -> String {
        self.peer.to_string()
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

/// Resolve an endpoint to socket addresses
pub async fn resolve(endpoint: &Endpoint) -> Result<Vec<SocketAddr>, TransportError> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((endpoint.host.as_str(), endpoint.port))
        .await
        .map_err(|e| TransportError::Resolve(format!("{}: {}", endpoint, e)))?
        .collect();

    if addrs.is_empty() {
        return Err(TransportError::Resolve(format!("{}: no addresses", endpoint)));
    }
    Ok(addrs)
}

fn map_recv_error(e: io::Error) -> TransportError {
    match e.kind() {
        // ICMP port unreachable on a connected socket
        io::ErrorKind::ConnectionRefused => TransportError::PeerClosed,
        _ => TransportError::Receive(e.to_string()),
    }
}

/// Transport errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Failed to resolve {0}")]
    Resolve(String),

    #[error("Failed to bind socket: {0}")]
    Bind(String),

    #[error("Failed to connect to {0}")]
    Connect(String),

    #[error("Send failed: {0}")]
    Send(String),

    #[error("Receive failed: {0}")]
    Receive(String),

    #[error("Timed out waiting for data")]
    Timeout,

    #[error("Transport closed")]
    Closed,

    #[error("Remote endpoint unreachable")]
    PeerClosed,
}

impl TransportError {
    /// Whether the error ends the relay (and triggers a reconnect)
    pub fn is_fatal(&self) -> bool {
        !matches!(self, TransportError::Send(_) | TransportError::Timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    async fn peer_socket() -> (UdpSocket, Endpoint) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = socket.local_addr().unwrap().port();
        (socket, Endpoint::new("127.0.0.1", port))
    }

    #[tokio::test]
    async fn test_send_and_recv() {
        let (remote, endpoint) = peer_socket().await;
        let transport = UdpTransport::open(&endpoint, Duration::from_secs(2)).await.unwrap();

        transport.send(b"hello").await.unwrap();
        let mut buf = [0u8; 64];
        let (n, from) = remote.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");

        remote.send_to(b"world", from).await.unwrap();
        assert_eq!(transport.recv().await.unwrap(), b"world");
        assert_eq!(transport.peer(), endpoint.to_string());
    }

    #[tokio::test]
    async fn test_recv_timeout() {
        let (_remote, endpoint) = peer_socket().await;
        let transport = UdpTransport::open(&endpoint, Duration::from_millis(50)).await.unwrap();

        assert_eq!(transport.recv().await, Err(TransportError::Timeout));
    }

    #[tokio::test]
    async fn test_close_unblocks_pending_recv() {
        let (_remote, endpoint) = peer_socket().await;
        let transport = UdpTransport::open(&endpoint, Duration::from_secs(30)).await.unwrap();
        let transport = Arc::new(transport);

        let pending = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.recv().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let start = Instant::now();
        transport.close();
        let result = pending.await.unwrap();

        assert_eq!(result, Err(TransportError::Closed));
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(transport.send(b"late").await, Err(TransportError::Closed));
    }

    #[test]
    fn test_fatality() {
        assert!(!TransportError::Timeout.is_fatal());
        assert!(!TransportError::Send("full".into()).is_fatal());
        assert!(TransportError::Closed.is_fatal());
        assert!(TransportError::PeerClosed.is_fatal());
        assert!(TransportError::Receive("reset".into()).is_fatal());
    }
}

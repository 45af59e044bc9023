//! In-memory remote endpoint for connection scenarios.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use phaze_tunnel::{
    Connector, Endpoint, FrameCodec, FrameKind, InterfaceError, MemoryHost, MemoryInterface,
    MemoryTransport, ReconnectPolicy, Role, SequenceState, Session, SessionKey, SessionOptions,
    TransportError, TransportSocket, TunnelInterface,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Session with timeouts short enough for tests
pub fn test_session() -> Session {
    Session::new(Endpoint::new("127.0.0.1", 51821), SessionKey::from_bytes([7u8; 32]))
        .with_mtu(1400)
        .with_options(SessionOptions {
            handshake_timeout: Duration::from_millis(400),
            io_timeout: Duration::from_millis(50),
            keepalive_interval: Duration::from_secs(3600),
            idle_timeout: Duration::from_secs(3600),
            reconnect: ReconnectPolicy {
                base_delay: Duration::from_millis(50),
                factor: 2,
                max_delay: Duration::from_millis(200),
                max_attempts: None,
            },
            ..SessionOptions::default()
        })
}

/// Connector backed by memory channels and an echoing remote
#[derive(Default)]
pub struct MockConnector {
    pub interfaces_created: AtomicUsize,
    pub transports_opened: AtomicUsize,
    /// Disconnect frames seen by the remote
    pub goodbyes: Arc<AtomicUsize>,
    pub fail_interface: AtomicBool,
    /// Remote never answers
    silent: bool,
    /// Remote answers only the first transport
    silent_after_first: bool,
    /// First transport dies after this many sends
    flaky_after: Option<usize>,
    host: Mutex<Option<MemoryHost>>,
    interface: Mutex<Option<Arc<MemoryInterface>>>,
    server_sequences: Arc<SequenceState>,
    parked: Mutex<Vec<MemoryTransport>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn silent(mut self) -> Self {
        self.silent = true;
        self
    }

    pub fn silent_after_first(mut self) -> Self {
        self.silent_after_first = true;
        self
    }

    pub fn flaky_after(mut self, sends: usize) -> Self {
        self.flaky_after = Some(sends);
        self
    }

    pub fn failing_interface(self) -> Self {
        self.fail_interface.store(true, Ordering::SeqCst);
        self
    }

    /// Host end of the most recently created interface
    pub fn take_host(&self) -> MemoryHost {
        self.host.lock().take().expect("no interface created")
    }

    /// Most recently created interface
    pub fn interface(&self) -> Arc<MemoryInterface> {
        self.interface.lock().clone().expect("no interface created")
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn create_interface(
        &self,
        session: &Session,
    ) -> Result<Arc<dyn TunnelInterface>, InterfaceError> {
        if self.fail_interface.load(Ordering::SeqCst) {
            return Err(InterfaceError::PermissionDenied("operation not permitted".into()));
        }

        let name = &session.options().interface_name;
        let (interface, host) = MemoryInterface::pair(name, session.mtu());
        let interface = Arc::new(interface);
        self.interfaces_created.fetch_add(1, Ordering::SeqCst);
        *self.host.lock() = Some(host);
        *self.interface.lock() = Some(interface.clone());
        Ok(interface)
    }

    async fn open_transport(
        &self,
        session: &Session,
    ) -> Result<Arc<dyn TransportSocket>, TransportError> {
        let index = self.transports_opened.fetch_add(1, Ordering::SeqCst);
        let (client, server) = MemoryTransport::pair(session.options().io_timeout);

        if self.silent || (self.silent_after_first && index > 0) {
            self.parked.lock().push(server);
        } else {
            tokio::spawn(echo_remote(
                server,
                FrameCodec::new(session, Role::Responder),
                self.server_sequences.clone(),
                self.goodbyes.clone(),
            ));
        }

        match self.flaky_after {
            Some(limit) if index == 0 => Ok(Arc::new(FlakyTransport {
                inner: client,
                limit,
                sent: AtomicUsize::new(0),
            })),
            _ => Ok(Arc::new(client)),
        }
    }
}

/// Remote that answers keepalives and echoes data
async fn echo_remote(
    transport: MemoryTransport,
    codec: FrameCodec,
    sequences: Arc<SequenceState>,
    goodbyes: Arc<AtomicUsize>,
) {
    loop {
        let bytes = match transport.recv().await {
            Ok(bytes) => bytes,
            Err(TransportError::Timeout) => continue,
            Err(_) => return,
        };
        let Ok(frame) = codec.decode(&bytes) else { continue };
        if sequences.accept(frame.sequence).is_err() {
            continue;
        }

        let sequence = sequences.next_sequence();
        let reply = match frame.kind {
            FrameKind::Keepalive => codec.encode(FrameKind::Keepalive, &[], sequence),
            FrameKind::Data => codec.encode(FrameKind::Data, &frame.payload, sequence),
            FrameKind::Disconnect => {
                goodbyes.fetch_add(1, Ordering::SeqCst);
                return;
            }
        };
        if let Ok(reply) = reply {
            let _ = transport.send(reply.as_bytes()).await;
        }
    }
}

/// Transport whose link goes down after a number of sends
pub struct FlakyTransport {
    inner: MemoryTransport,
    limit: usize,
    sent: AtomicUsize,
}

impl FlakyTransport {
    fn is_down(&self) -> bool {
        self.sent.load(Ordering::SeqCst) >= self.limit
    }
}

#[async_trait]
impl TransportSocket for FlakyTransport {
    async fn send(&self, frame: &[u8]) -> Result<(), TransportError> {
        if self.is_down() {
            return Err(TransportError::Send("network is down".into()));
        }
        self.sent.fetch_add(1, Ordering::SeqCst);
        self.inner.send(frame).await
    }

    async fn recv(&self) -> Result<Vec<u8>, TransportError> {
        if self.is_down() {
            return Err(TransportError::Receive("network is down".into()));
        }
        self.inner.recv().await
    }

    fn close(&self) {
        self.inner.close();
    }

    fn peer(&self) -> String {
        "flaky".to_string()
    }
}

/// Poll until `check` holds or `limit` passes
pub async fn wait_until(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    check()
}

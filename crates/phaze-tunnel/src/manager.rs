//! Connection Manager
//!
//! Owns the connection state machine and everything a session allocates:
//!
//! ```text
//!   Idle --connect--> Connecting --ok--> Connected --transport down--> Reconnecting
//!                          |                 ^                              |
//!                          +--error--> Failed +--------reopened-------------+
//!
//!   any state --disconnect--> Disconnecting --> Idle
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! let manager = ConnectionManager::new();
//! manager.connect(config.into_session()?).await?;
//!
//! println!("{}", manager.status_report().to_json());
//! println!("{}", manager.stats().format());
//!
//! manager.disconnect().await;
//! ```

use crate::codec::{CodecError, FrameCodec, FrameKind, Role};
use crate::config::{ConfigError, Endpoint};
use crate::interface::{InterfaceConfig, InterfaceError, TunDevice, TunnelInterface};
use crate::relay::{PacketRelay, RelayExit, RelayOptions};
use crate::replay::SequenceState;
use crate::session::{Session, SessionOptions};
use crate::stats::{StatsCollector, StatsSnapshot};
use crate::status::{StatsReport, StatusReport};
use crate::transport::{resolve, TransportError, TransportSocket, UdpTransport};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How long disconnect waits for the session task before aborting it
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Connection state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Reconnecting,
    Disconnecting,
    /// Terminal failure with a human readable reason
    Failed(String),
}

impl ConnectionState {
    /// Check if traffic is flowing
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Check if the connection is in a failure state
    pub fn is_failed(&self) -> bool {
        matches!(self, ConnectionState::Failed(_))
    }

    /// States from which `connect()` is allowed
    pub fn can_connect(&self) -> bool {
        matches!(self, ConnectionState::Idle | ConnectionState::Failed(_))
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Idle => write!(f, "idle"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Reconnecting => write!(f, "reconnecting"),
            ConnectionState::Disconnecting => write!(f, "disconnecting"),
            ConnectionState::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// Connect errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    #[error("Cannot connect while {0}")]
    InvalidState(ConnectionState),

    #[error("Invalid session: {0}")]
    InvalidSession(#[from] ConfigError),

    #[error("Interface error: {0}")]
    Interface(#[from] InterfaceError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("No response from remote within {0:?}")]
    Timeout(Duration),

    #[error("Connect cancelled by disconnect")]
    Cancelled,
}

/// Allocates the OS resources of a session
#[async_trait]
pub trait Connector: Send + Sync {
    /// Create and configure the virtual interface
    async fn create_interface(
        &self,
        session: &Session,
    ) -> Result<Arc<dyn TunnelInterface>, InterfaceError>;

    /// Open a fresh transport to the session's endpoint
    async fn open_transport(
        &self,
        session: &Session,
    ) -> Result<Arc<dyn TransportSocket>, TransportError>;
}

/// Kernel TUN device plus UDP socket
#[derive(Debug, Default)]
pub struct SystemConnector {
    /// Resolved once, before routes point DNS into the tunnel
    resolved: Mutex<Option<(Endpoint, SocketAddr)>>,
}

impl SystemConnector {
    pub fn new() -> Self {
        Self::default()
    }

    async fn remote_addr(&self, endpoint: &Endpoint) -> Result<SocketAddr, TransportError> {
        let cached = self.resolved.lock().clone();
        if let Some((cached_endpoint, addr)) = cached {
            if &cached_endpoint == endpoint {
                return Ok(addr);
            }
        }

        let addr = resolve(endpoint)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| TransportError::Resolve(endpoint.to_string()))?;
        *self.resolved.lock() = Some((endpoint.clone(), addr));
        Ok(addr)
    }
}

#[async_trait]
impl Connector for SystemConnector {
    async fn create_interface(
        &self,
        session: &Session,
    ) -> Result<Arc<dyn TunnelInterface>, InterfaceError> {
        let bypass = match self.remote_addr(session.endpoint()).await {
            Ok(addr) => vec![addr.ip()],
            Err(e) => {
                warn!(error = %e, "Could not resolve endpoint, no bypass route");
                Vec::new()
            }
        };

        let config = InterfaceConfig::from_session(session, bypass);
        let device = tokio::task::spawn_blocking(move || TunDevice::create(config))
            .await
            .map_err(|e| InterfaceError::Create(e.to_string()))??;
        Ok(Arc::new(device))
    }

    async fn open_transport(
        &self,
        session: &Session,
    ) -> Result<Arc<dyn TransportSocket>, TransportError> {
        let addr = self.remote_addr(session.endpoint()).await?;
        let transport = UdpTransport::open_addr(addr, session.options().io_timeout).await?;
        Ok(Arc::new(transport))
    }
}

/// What the status surface reports about the current session
#[derive(Debug, Clone)]
struct SessionInfo {
    server: String,
    address: String,
}

/// State shared with the session task
struct Shared {
    state: RwLock<ConnectionState>,
    stats: Arc<StatsCollector>,
    info: RwLock<Option<SessionInfo>>,
    /// Token of a connect that has not finished yet
    pending: Mutex<Option<CancellationToken>>,
}

impl Shared {
    fn set(&self, state: ConnectionState) {
        *self.state.write() = state;
    }

    /// Change state unless the session was cancelled in the meantime
    fn transition(&self, cancel: &CancellationToken, state: ConnectionState) -> bool {
        let mut current = self.state.write();
        if cancel.is_cancelled() {
            return false;
        }
        debug!("State {} -> {}", *current, state);
        *current = state;
        true
    }
}

/// Resources of a running session
struct ActiveSession {
    cancel: CancellationToken,
    supervisor: JoinHandle<()>,
    interface: Arc<dyn TunnelInterface>,
}

/// Connection Manager
///
/// The only component the surrounding application talks to:
/// - Allocates the interface and transport through a [`Connector`]
/// - Runs the [`PacketRelay`] and restarts it on transport failure
/// - Reports state and statistics without blocking
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    shared: Arc<Shared>,
    /// Serializes connect and disconnect
    control: tokio::sync::Mutex<Option<ActiveSession>>,
}

impl ConnectionManager {
    /// Manager using the kernel TUN device and UDP
    pub fn new() -> Self {
        Self::with_connector(Arc::new(SystemConnector::new()))
    }

    /// Manager using a custom connector
    pub fn with_connector(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            shared: Arc::new(Shared {
                state: RwLock::new(ConnectionState::Idle),
                stats: Arc::new(StatsCollector::new()),
                info: RwLock::new(None),
                pending: Mutex::new(None),
            }),
            control: tokio::sync::Mutex::new(None),
        }
    }

    /// Current state
    pub fn status(&self) -> ConnectionState {
        self.shared.state.read().clone()
    }

    /// Check if traffic is flowing
    pub fn is_connected(&self) -> bool {
        self.status().is_connected()
    }

    /// Current traffic statistics
    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// `{connected, server, assignedAddress}`
    pub fn status_report(&self) -> StatusReport {
        let info = self.shared.info.read().clone();
        StatusReport {
            connected: self.is_connected(),
            server: info.as_ref().map(|i| i.server.clone()).unwrap_or_default(),
            assigned_address: info.map(|i| i.address).unwrap_or_default(),
        }
    }

    /// `{bytesIn, bytesOut, packetsIn, packetsOut, durationSeconds}`
    pub fn stats_report(&self) -> StatsReport {
        StatsReport::from(&self.stats())
    }

    /// Connect a session
    ///
    /// 1. Creates the virtual interface (failures are terminal)
    /// 2. Opens the transport and waits for the remote to answer
    /// 3. Starts the relay under a supervisor that handles reconnects
    pub async fn connect(&self, session: Session) -> Result<(), ConnectError> {
        let mut control = self.control.lock().await;

        let current = self.status();
        if !current.can_connect() {
            return Err(ConnectError::InvalidState(current));
        }
        session.validate()?;

        if let Some(stale) = control.take() {
            release(stale).await;
        }

        info!("Connecting to {} (session {:08x})", session.endpoint(), session.id());
        let cancel = CancellationToken::new();
        {
            let mut state = self.shared.state.write();
            *state = ConnectionState::Connecting;
            *self.shared.pending.lock() = Some(cancel.clone());
        }

        let result = self.start(session, &cancel).await;
        self.shared.pending.lock().take();

        let active = result?;
        *control = Some(active);
        Ok(())
    }

    /// Everything `connect` does once the state is `Connecting`
    async fn start(
        &self,
        mut session: Session,
        cancel: &CancellationToken,
    ) -> Result<ActiveSession, ConnectError> {
        let created = tokio::select! {
            _ = cancel.cancelled() => return Err(ConnectError::Cancelled),
            created = self.connector.create_interface(&session) => created,
        };
        let interface = match created {
            Ok(interface) => interface,
            Err(e) => {
                error!("Interface allocation failed: {}", e);
                self.shared.transition(cancel, ConnectionState::Failed(e.to_string()));
                return Err(e.into());
            }
        };

        let codec = Arc::new(FrameCodec::new(&session, Role::Initiator));
        let sequences = Arc::new(SequenceState::new(session.options().replay_window));

        let established = tokio::select! {
            _ = cancel.cancelled() => Err(ConnectError::Cancelled),
            result = establish(&*self.connector, &session, &codec, &sequences) => result,
        };
        let transport = match established {
            Ok(transport) => transport,
            Err(ConnectError::Cancelled) => {
                info!("Connect cancelled");
                interface.destroy();
                return Err(ConnectError::Cancelled);
            }
            Err(e) => {
                error!("Connection failed: {}", e);
                interface.destroy();
                self.shared.transition(cancel, ConnectionState::Failed(e.to_string()));
                return Err(e);
            }
        };

        session.mark_started();
        self.shared.stats.reset();
        self.shared
            .stats
            .mark_started(session.started_at().unwrap_or_else(Instant::now));
        *self.shared.info.write() = Some(SessionInfo {
            server: session.endpoint().to_string(),
            address: session.address().to_string(),
        });

        if !self.shared.transition(cancel, ConnectionState::Connected) {
            info!("Connect cancelled");
            transport.close();
            interface.destroy();
            return Err(ConnectError::Cancelled);
        }

        info!(
            "Connected to {} via {} ({})",
            session.endpoint(),
            interface.name(),
            session.cidr()
        );

        let supervisor = Supervisor {
            connector: self.connector.clone(),
            shared: self.shared.clone(),
            session: Arc::new(session),
            codec,
            sequences,
            interface: interface.clone(),
            cancel: cancel.clone(),
        };
        let supervisor = tokio::spawn(supervisor.run(transport));

        Ok(ActiveSession {
            cancel: cancel.clone(),
            supervisor,
            interface,
        })
    }

    /// Disconnect
    ///
    /// Stops the relay, says goodbye to the remote, closes the transport,
    /// destroys the interface and zeroes the counters. Always ends in
    /// `Idle`; calling it again is a no-op.
    pub async fn disconnect(&self) {
        // A connect in progress holds `control`, stop it first
        let pending = self.shared.pending.lock().clone();
        if let Some(cancel) = pending {
            let mut state = self.shared.state.write();
            cancel.cancel();
            *state = ConnectionState::Disconnecting;
        }

        let mut control = self.control.lock().await;
        let active = control.take();

        if active.is_none() && self.status() == ConnectionState::Idle {
            return;
        }

        if let Some(active) = active {
            {
                let mut state = self.shared.state.write();
                active.cancel.cancel();
                *state = ConnectionState::Disconnecting;
            }
            info!("Disconnecting");
            release(active).await;
        }

        self.shared.stats.reset();
        self.shared.info.write().take();
        self.shared.set(ConnectionState::Idle);
        info!("Disconnected");
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(cancel) = self.shared.pending.lock().take() {
            cancel.cancel();
        }
        if let Some(active) = self.control.get_mut().take() {
            active.cancel.cancel();
            active.interface.destroy();
        }
    }
}

/// Stop a session task and free its interface
async fn release(active: ActiveSession) {
    active.cancel.cancel();

    let mut supervisor = active.supervisor;
    if tokio::time::timeout(SHUTDOWN_GRACE, &mut supervisor).await.is_err() {
        warn!("Session task did not stop in time, aborting");
        supervisor.abort();
    }
    active.interface.destroy();
}

/// Open a transport and wait for the remote to answer
async fn establish(
    connector: &dyn Connector,
    session: &Session,
    codec: &FrameCodec,
    sequences: &SequenceState,
) -> Result<Arc<dyn TransportSocket>, ConnectError> {
    let transport = connector.open_transport(session).await?;

    match handshake(&*transport, codec, sequences, session.options()).await {
        Ok(()) => Ok(transport),
        Err(e) => {
            transport.close();
            Err(e)
        }
    }
}

/// Send keepalive probes until an authenticated frame comes back
async fn handshake(
    transport: &dyn TransportSocket,
    codec: &FrameCodec,
    sequences: &SequenceState,
    options: &SessionOptions,
) -> Result<(), ConnectError> {
    let deadline = tokio::time::Instant::now() + options.handshake_timeout;
    let mut next_probe = tokio::time::Instant::now();

    loop {
        let now = tokio::time::Instant::now();
        if now >= deadline {
            return Err(ConnectError::Timeout(options.handshake_timeout));
        }

        if now >= next_probe {
            let probe = codec.encode(FrameKind::Keepalive, &[], sequences.next_sequence())?;
            match transport.send(probe.as_bytes()).await {
                Err(e) if e.is_fatal() => return Err(e.into()),
                Err(e) => debug!(error = %e, "Probe not sent"),
                Ok(()) => debug!(peer = %transport.peer(), "Probe sent"),
            }
            next_probe = now + options.io_timeout;
        }

        let wait = next_probe.min(deadline);
        let bytes = match tokio::time::timeout_at(wait, transport.recv()).await {
            Err(_) | Ok(Err(TransportError::Timeout)) => continue,
            Ok(Err(e)) => return Err(e.into()),
            Ok(Ok(bytes)) => bytes,
        };

        match codec.decode(&bytes) {
            Ok(frame) if sequences.accept(frame.sequence).is_ok() => {
                if frame.kind == FrameKind::Disconnect {
                    return Err(TransportError::PeerClosed.into());
                }
                debug!(kind = ?frame.kind, "Remote answered");
                return Ok(());
            }
            Ok(_) => continue,
            Err(e) => debug!(error = %e, "Ignoring frame during handshake"),
        }
    }
}

/// Runs the relay of one session and applies the reconnect policy
struct Supervisor {
    connector: Arc<dyn Connector>,
    shared: Arc<Shared>,
    session: Arc<Session>,
    codec: Arc<FrameCodec>,
    sequences: Arc<SequenceState>,
    interface: Arc<dyn TunnelInterface>,
    cancel: CancellationToken,
}

impl Supervisor {
    async fn run(self, mut transport: Arc<dyn TransportSocket>) {
        loop {
            let relay = PacketRelay::new(
                self.codec.clone(),
                self.sequences.clone(),
                self.interface.clone(),
                transport.clone(),
                self.shared.stats.clone(),
                RelayOptions::from_session(&self.session),
            );

            match relay.run(self.cancel.clone()).await {
                RelayExit::Cancelled => {
                    self.say_goodbye(&*transport).await;
                    transport.close();
                    return;
                }
                RelayExit::InterfaceFailed(e) => {
                    error!("Interface failed: {}", e);
                    transport.close();
                    self.interface.destroy();
                    let reason = format!("interface failed: {}", e);
                    self.shared.transition(&self.cancel, ConnectionState::Failed(reason));
                    return;
                }
                exit => {
                    transport.close();
                    match exit {
                        RelayExit::TransportFailed(e) => warn!("Transport failed: {}", e),
                        _ => warn!("Remote ended the session"),
                    }
                    match self.reconnect().await {
                        Some(next) => transport = next,
                        None => return,
                    }
                }
            }
        }
    }

    /// Reopen the transport with exponential backoff
    async fn reconnect(&self) -> Option<Arc<dyn TransportSocket>> {
        if !self.shared.transition(&self.cancel, ConnectionState::Reconnecting) {
            return None;
        }

        let policy = &self.session.options().reconnect;
        let mut attempt = 0u32;

        loop {
            if !policy.allows(attempt) {
                error!("Giving up after {} reconnect attempts", attempt);
                self.interface.destroy();
                let reason = format!("gave up after {} reconnect attempts", attempt);
                self.shared.transition(&self.cancel, ConnectionState::Failed(reason));
                return None;
            }
            attempt += 1;

            let delay = policy.delay(attempt);
            info!("Reconnecting (attempt {}) in {:?}", attempt, delay);
            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                _ = tokio::time::sleep(delay) => {}
            }

            let result = tokio::select! {
                _ = self.cancel.cancelled() => return None,
                result = self.establish() => result,
            };

            match result {
                Ok(transport) => {
                    if !self.shared.transition(&self.cancel, ConnectionState::Connected) {
                        transport.close();
                        return None;
                    }
                    self.shared.stats.record_reconnect();
                    info!(
                        "Reconnected to {} after {} attempt(s)",
                        self.session.endpoint(),
                        attempt
                    );
                    return Some(transport);
                }
                Err(e) => warn!("Reconnect attempt {} failed: {}", attempt, e),
            }
        }
    }

    async fn establish(&self) -> Result<Arc<dyn TransportSocket>, ConnectError> {
        establish(&*self.connector, &self.session, &self.codec, &self.sequences).await
    }

    /// Best-effort Disconnect frame to the remote
    async fn say_goodbye(&self, transport: &dyn TransportSocket) {
        let sequence = self.sequences.next_sequence();
        let frame = match self.codec.encode(FrameKind::Disconnect, &[], sequence) {
            Ok(frame) => frame,
            Err(_) => return,
        };
        if let Err(e) = transport.send(frame.as_bytes()).await {
            debug!(error = %e, "Disconnect frame not sent");
        }
    }
}

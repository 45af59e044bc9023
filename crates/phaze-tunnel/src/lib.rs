//! Phaze Tunnel - Layer 3 VPN client
//!
//! Relays IP packets between a local virtual interface and a remote
//! PhazeVPN endpoint over UDP, with authenticated encryption per frame.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     ConnectionManager                         │
//! │        state machine, reconnect policy, status surface        │
//! │                                                               │
//! │  ┌──────────────┐    ┌───────────────┐    ┌────────────────┐  │
//! │  │ TUN device   │◀──▶│  PacketRelay  │◀──▶│ UDP transport  │  │
//! │  │ (phazevpn0)  │    │ egress/ingress│    │                │  │
//! │  └──────────────┘    └───────┬───────┘    └───────┬────────┘  │
//! │                              │                    │           │
//! │                 FrameCodec + replay window        │           │
//! │                 StatsCollector                    │           │
//! └───────────────────────────────────────────────────│───────────┘
//!                                                     │
//!                                                     ▼ UDP 51821
//!                                          ┌───────────────────┐
//!                                          │  PhazeVPN server  │
//!                                          └───────────────────┘
//! ```
//!
//! # Features
//!
//! - **Full tunnel**: `0.0.0.0/1` + `128.0.0.0/1` through the device, server bypassed
//! - **Reconnect**: exponential backoff, interface and counters survive
//! - **Replay protection**: sliding window over frame sequence numbers
//! - **Pluggable I/O**: in-memory interface and transport for userspace stacks
//!
//! # Security
//!
//! - Every frame sealed with ChaCha20-Poly1305, header authenticated
//! - Keys derived per session and direction from the supplied key material
//! - Key material wiped from memory on drop

mod codec;
mod config;
mod interface;
mod keys;
mod manager;
mod memory;
mod relay;
mod replay;
mod routing;
mod session;
mod stats;
mod status;
mod transport;

pub use codec::{
    peek_sequence, CodecError, DecodedFrame, Frame, FrameCodec, FrameKind, Role,
    FRAME_OVERHEAD, HEADER_LEN, PROTOCOL_VERSION,
};
pub use config::{ConfigError, ConfigFormat, Endpoint, TunnelConfig, DEFAULT_PORT};
pub use interface::{InterfaceConfig, InterfaceError, TunDevice, TunnelInterface};
pub use keys::{Direction, KeyError, SessionKey};
pub use manager::{ConnectError, ConnectionManager, ConnectionState, Connector, SystemConnector};
pub use memory::{MemoryHost, MemoryInterface, MemoryTransport};
pub use relay::{PacketRelay, RelayExit, RelayOptions};
pub use replay::{ReplayWindow, SequenceState};
pub use routing::{parse_default_gateway, plan_routes, Gateway, RouteSpec, RouteTable};
pub use session::{ReconnectPolicy, Session, SessionOptions};
pub use stats::{StatsCollector, StatsSnapshot};
pub use status::{StatsReport, StatusReport};
pub use transport::{TransportError, TransportSocket, UdpTransport};

//! Tunnel Session
//!
//! One tunnel attempt: where to connect, which address the virtual
//! interface gets, the key material and the tuning knobs.

use crate::config::{ConfigError, Endpoint, DEFAULT_INTERFACE_NAME, DEFAULT_MTU};
use crate::keys::SessionKey;
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

/// Smallest MTU accepted for the virtual interface
pub const MIN_MTU: u16 = 576;

/// Largest MTU accepted (frame payload limit of the protocol)
pub const MAX_MTU: u16 = 16_384;

/// Exponential reconnect backoff
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub factor: u32,
    pub max_delay: Duration,
    /// None retries until disconnect
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            factor: 2,
            max_delay: Duration::from_secs(30),
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the given attempt (attempts start at 1)
    pub fn delay(&self, attempt: u32) -> Duration {
        let mut delay = self.base_delay;
        for _ in 1..attempt {
            if delay >= self.max_delay {
                break;
            }
            delay = delay.saturating_mul(self.factor);
        }
        delay.min(self.max_delay)
    }

    /// Whether another attempt is allowed after `attempts` failed ones
    pub fn allows(&self, attempts: u32) -> bool {
        self.max_attempts.is_none_or(|max| attempts < max)
    }
}

/// Tuning options of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    pub interface_name: String,
    /// Route all traffic through the tunnel
    pub default_route: bool,
    pub reconnect: ReconnectPolicy,
    /// Wait for the first authenticated frame from the remote
    pub handshake_timeout: Duration,
    /// Upper bound for any single blocking read
    pub io_timeout: Duration,
    pub keepalive_interval: Duration,
    /// Silence from the remote after which the transport is considered dead
    pub idle_timeout: Duration,
    /// Replay window size in frames
    pub replay_window: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            interface_name: DEFAULT_INTERFACE_NAME.to_string(),
            default_route: true,
            reconnect: ReconnectPolicy::default(),
            handshake_timeout: Duration::from_secs(5),
            io_timeout: Duration::from_secs(1),
            keepalive_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(120),
            replay_window: 64,
        }
    }
}

/// A single tunnel attempt
#[derive(Debug, Clone)]
pub struct Session {
    id: u32,
    endpoint: Endpoint,
    address: Ipv4Addr,
    prefix_len: u8,
    mtu: u16,
    key: SessionKey,
    options: SessionOptions,
    started_at: Option<Instant>,
}

impl Session {
    /// Create a session with a random id and default address, MTU and options
    pub fn new(endpoint: Endpoint, key: SessionKey) -> Self {
        Self {
            id: rand::random(),
            endpoint,
            address: Ipv4Addr::new(10, 9, 0, 100),
            prefix_len: 24,
            mtu: DEFAULT_MTU,
            key,
            options: SessionOptions::default(),
            started_at: None,
        }
    }

    pub fn with_id(mut self, id: u32) -> Self {
        self.id = id;
        self
    }

    pub fn with_address(mut self, address: Ipv4Addr, prefix_len: u8) -> Self {
        self.address = address;
        self.prefix_len = prefix_len;
        self
    }

    pub fn with_mtu(mut self, mtu: u16) -> Self {
        self.mtu = mtu;
        self
    }

    pub fn with_options(mut self, options: SessionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn address(&self) -> Ipv4Addr {
        self.address
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// Address in CIDR notation
    pub fn cidr(&self) -> String {
        format!("{}/{}", self.address, self.prefix_len)
    }

    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// When the session was connected
    pub fn started_at(&self) -> Option<Instant> {
        self.started_at
    }

    pub(crate) fn mark_started(&mut self) {
        self.started_at = Some(Instant::now());
    }

    /// Check the session parameters
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoint.host.trim().is_empty() {
            return Err(ConfigError::MissingHost);
        }
        if self.endpoint.port == 0 {
            return Err(ConfigError::InvalidPort);
        }
        if self.prefix_len > 32 {
            return Err(ConfigError::InvalidPrefix(self.prefix_len));
        }
        if !(MIN_MTU..=MAX_MTU).contains(&self.mtu) {
            return Err(ConfigError::InvalidMtu(self.mtu, MIN_MTU, MAX_MTU));
        }
        if self.options.replay_window == 0 {
            return Err(ConfigError::InvalidOption("replay window must not be zero"));
        }
        if self.options.io_timeout.is_zero() {
            return Err(ConfigError::InvalidOption("I/O timeout must not be zero"));
        }
        if self.options.handshake_timeout.is_zero() {
            return Err(ConfigError::InvalidOption("handshake timeout must not be zero"));
        }
        if self.options.keepalive_interval.is_zero() {
            return Err(ConfigError::InvalidOption("keepalive interval must not be zero"));
        }
        if self.options.idle_timeout.is_zero() {
            return Err(ConfigError::InvalidOption("idle timeout must not be zero"));
        }
        if self.options.interface_name.is_empty() {
            return Err(ConfigError::InvalidOption("interface name must not be empty"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new(Endpoint::new("vpn.example.net", 51821), SessionKey::generate())
    }

    #[test]
    fn test_backoff_sequence() {
        let policy = ReconnectPolicy::default();
        let delays: Vec<u64> = (1..=7).map(|n| policy.delay(n).as_secs()).collect();

        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn test_backoff_does_not_overflow() {
        let policy = ReconnectPolicy {
            factor: u32::MAX,
            ..ReconnectPolicy::default()
        };

        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn test_max_attempts() {
        let unlimited = ReconnectPolicy::default();
        assert!(unlimited.allows(1_000_000));

        let limited = ReconnectPolicy {
            max_attempts: Some(3),
            ..ReconnectPolicy::default()
        };
        assert!(limited.allows(2));
        assert!(!limited.allows(3));
    }

    #[test]
    fn test_defaults_validate() {
        let session = session();
        assert!(session.validate().is_ok());
        assert_eq!(session.cidr(), "10.9.0.100/24");
        assert!(session.started_at().is_none());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let empty_host = Session::new(Endpoint::new(" ", 51821), SessionKey::generate());
        assert_eq!(empty_host.validate(), Err(ConfigError::MissingHost));

        let no_port = Session::new(Endpoint::new("vpn.example.net", 0), SessionKey::generate());
        assert_eq!(no_port.validate(), Err(ConfigError::InvalidPort));

        let prefix = session().with_address(Ipv4Addr::new(10, 0, 0, 1), 33);
        assert_eq!(prefix.validate(), Err(ConfigError::InvalidPrefix(33)));

        let mtu = session().with_mtu(20_000);
        assert!(matches!(mtu.validate(), Err(ConfigError::InvalidMtu(20_000, _, _))));

        let window = session().with_options(SessionOptions {
            replay_window: 0,
            ..SessionOptions::default()
        });
        assert!(matches!(window.validate(), Err(ConfigError::InvalidOption(_))));

        let zeroed = [
            SessionOptions {
                handshake_timeout: Duration::ZERO,
                ..SessionOptions::default()
            },
            SessionOptions {
                keepalive_interval: Duration::ZERO,
                ..SessionOptions::default()
            },
            SessionOptions {
                idle_timeout: Duration::ZERO,
                ..SessionOptions::default()
            },
        ];
        for options in zeroed {
            let session = session().with_options(options);
            assert!(matches!(session.validate(), Err(ConfigError::InvalidOption(_))));
        }
    }

    #[test]
    fn test_mark_started() {
        let mut session = session();
        session.mark_started();
        assert!(session.started_at().is_some());
    }
}

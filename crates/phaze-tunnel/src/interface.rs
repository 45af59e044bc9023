//! Virtual network interface.
//!
//! A [`TunnelInterface`] hands raw IP packets between the kernel network
//! stack and the relay. [`TunDevice`] is the Linux TUN implementation;
//! [`crate::memory::MemoryInterface`] is a channel-backed one.

use crate::routing::{run_ip, RouteTable};
use crate::session::Session;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Extra read buffer beyond the MTU so oversized packets are seen whole
const READ_SLACK: usize = 256;

/// Local virtual network adapter
#[async_trait]
pub trait TunnelInterface: Send + Sync {
    /// Device name as assigned by the system
    fn name(&self) -> &str;

    fn mtu(&self) -> u16;

    /// Read one IP packet
    async fn read_packet(&self) -> Result<Vec<u8>, InterfaceError>;

    /// Write one IP packet
    async fn write_packet(&self, packet: &[u8]) -> Result<(), InterfaceError>;

    /// Remove the adapter and its routes. Pending reads fail with `Closed`.
    fn destroy(&self);
}

/// Parameters for creating an interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceConfig {
    pub name: String,
    pub address: Ipv4Addr,
    pub prefix_len: u8,
    pub mtu: u16,
    /// Install full-tunnel routes after creation
    pub default_route: bool,
    /// Addresses kept on the original gateway (the remote endpoint)
    pub bypass: Vec<IpAddr>,
}

impl InterfaceConfig {
    pub fn from_session(session: &Session, bypass: Vec<IpAddr>) -> Self {
        Self {
            name: session.options().interface_name.clone(),
            address: session.address(),
            prefix_len: session.prefix_len(),
            mtu: session.mtu(),
            default_route: session.options().default_route,
            bypass,
        }
    }

    pub fn cidr(&self) -> String {
        format!("{}/{}", self.address, self.prefix_len)
    }
}

/// Kernel TUN device (IFF_TUN, no packet info header)
pub struct TunDevice {
    name: String,
    mtu: u16,
    handle: RwLock<Option<Arc<sys::Handle>>>,
    routes: Mutex<Option<RouteTable>>,
    closed: CancellationToken,
}

impl TunDevice {
    /// Allocate and configure the device. Blocks on `ip` invocations.
    pub fn create(config: InterfaceConfig) -> Result<Self, InterfaceError> {
        let (handle, name) = sys::open(&config.name)?;

        let device = Self {
            name,
            mtu: config.mtu,
            handle: RwLock::new(Some(Arc::new(handle))),
            routes: Mutex::new(None),
            closed: CancellationToken::new(),
        };

        device.configure(&config)?;

        if config.default_route {
            let mut routes = RouteTable::new(&device.name);
            routes.install(&config.bypass)?;
            *device.routes.lock() = Some(routes);
        }

        info!(
            requested = %config.name,
            actual = %device.name,
            address = %config.cidr(),
            mtu = config.mtu,
            "Created TUN device"
        );
        Ok(device)
    }

    fn configure(&self, config: &InterfaceConfig) -> Result<(), InterfaceError> {
        let name = self.name.as_str();
        let cidr = config.cidr();
        let mtu = config.mtu.to_string();
        let commands: [Vec<String>; 3] = [
            ["addr", "add", cidr.as_str(), "dev", name].map(String::from).to_vec(),
            ["link", "set", "dev", name, "mtu", mtu.as_str()].map(String::from).to_vec(),
            ["link", "set", "dev", name, "up"].map(String::from).to_vec(),
        ];

        for args in commands {
            let command = args.join(" ");
            match run_ip(&args) {
                Ok(()) => debug!("ip {}", command),
                Err(e) if e.contains("File exists") => {}
                Err(e) => return Err(classify_ip_error(&command, e)),
            }
        }
        Ok(())
    }

    fn handle(&self) -> Result<Arc<sys::Handle>, InterfaceError> {
        self.handle.read().clone().ok_or(InterfaceError::Closed)
    }
}

#[async_trait]
impl TunnelInterface for TunDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn mtu(&self) -> u16 {
        self.mtu
    }

    async fn read_packet(&self) -> Result<Vec<u8>, InterfaceError> {
        let handle = self.handle()?;
        let mut buf = vec![0u8; self.mtu as usize + READ_SLACK];

        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(InterfaceError::Closed),
            result = sys::read(&handle, &mut buf) => {
                let n = result?;
                buf.truncate(n);
                Ok(buf)
            }
        }
    }

    async fn write_packet(&self, packet: &[u8]) -> Result<(), InterfaceError> {
        let handle = self.handle()?;

        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(InterfaceError::Closed),
            result = sys::write(&handle, packet) => result,
        }
    }

    fn destroy(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();

        if let Some(mut routes) = self.routes.lock().take() {
            routes.teardown();
        }
        // Closing the last descriptor removes a non-persistent TUN device
        self.handle.write().take();
        info!(device = %self.name, "Destroyed TUN device");
    }
}

impl Drop for TunDevice {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn classify_ip_error(command: &str, stderr: String) -> InterfaceError {
    if stderr.contains("Operation not permitted") {
        InterfaceError::PermissionDenied(format!("ip {}: {}", command, stderr))
    } else {
        InterfaceError::Configure(format!("ip {}: {}", command, stderr))
    }
}

#[cfg(target_os = "linux")]
mod sys {
    use super::InterfaceError;
    use std::fs::{File, OpenOptions};
    use std::io::{self, Read, Write};
    use std::os::unix::fs::OpenOptionsExt;
    use std::os::unix::io::AsRawFd;
    use tokio::io::unix::AsyncFd;

    const TUNSETIFF: libc::c_ulong = 0x400454ca;

    pub type Handle = AsyncFd<File>;

    /// Open `/dev/net/tun` and attach it to a new TUN device
    pub fn open(name: &str) -> Result<(Handle, String), InterfaceError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK | libc::O_CLOEXEC)
            .open("/dev/net/tun")
            .map_err(|e| open_error("/dev/net/tun", e))?;

        // SAFETY: ifreq is plain old data, all zeroes is a valid value
        let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
        for (dst, src) in ifr.ifr_name.iter_mut().zip(name.bytes().take(libc::IFNAMSIZ - 1)) {
            *dst = src as libc::c_char;
        }
        ifr.ifr_ifru.ifru_flags = (libc::IFF_TUN | libc::IFF_NO_PI) as libc::c_short;

        // SAFETY: the descriptor is open and ifr outlives the call
        let ret = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF as _, &mut ifr) };
        if ret < 0 {
            return Err(open_error("TUNSETIFF", io::Error::last_os_error()));
        }

        let actual: Vec<u8> = ifr
            .ifr_name
            .iter()
            .take_while(|c| **c != 0)
            .map(|c| *c as u8)
            .collect();

        let handle = AsyncFd::new(file).map_err(|e| InterfaceError::Create(e.to_string()))?;
        Ok((handle, String::from_utf8_lossy(&actual).into_owned()))
    }

    pub async fn read(handle: &Handle, buf: &mut [u8]) -> Result<usize, InterfaceError> {
        loop {
            let mut guard = handle.readable().await.map_err(io_error)?;
            match guard.try_io(|inner| {
                let mut file: &File = inner.get_ref();
                file.read(buf)
            }) {
                Ok(result) => return result.map_err(io_error),
                Err(_would_block) => continue,
            }
        }
    }

    pub async fn write(handle: &Handle, packet: &[u8]) -> Result<(), InterfaceError> {
        loop {
            let mut guard = handle.writable().await.map_err(io_error)?;
            match guard.try_io(|inner| {
                let mut file: &File = inner.get_ref();
                file.write(packet)
            }) {
                Ok(result) => return result.map(|_| ()).map_err(io_error),
                Err(_would_block) => continue,
            }
        }
    }

    fn open_error(what: &str, e: io::Error) -> InterfaceError {
        match e.kind() {
            // EPERM and EACCES both land here
            io::ErrorKind::PermissionDenied => InterfaceError::PermissionDenied(format!(
                "{}: {} (CAP_NET_ADMIN required)",
                what, e
            )),
            _ => InterfaceError::Create(format!("{}: {}", what, e)),
        }
    }

    fn io_error(e: io::Error) -> InterfaceError {
        InterfaceError::Io(e.to_string())
    }
}

#[cfg(not(target_os = "linux"))]
mod sys {
    use super::InterfaceError;

    pub struct Handle;

    pub fn open(_name: &str) -> Result<(Handle, String), InterfaceError> {
        Err(InterfaceError::Unsupported)
    }

    pub async fn read(_handle: &Handle, _buf: &mut [u8]) -> Result<usize, InterfaceError> {
        Err(InterfaceError::Unsupported)
    }

    pub async fn write(_handle: &Handle, _packet: &[u8]) -> Result<(), InterfaceError> {
        Err(InterfaceError::Unsupported)
    }
}

/// Interface errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InterfaceError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Failed to create interface: {0}")]
    Create(String),

    #[error("Failed to configure interface: {0}")]
    Configure(String),

    #[error("Failed to set up routes: {0}")]
    Routing(String),

    #[error("Interface I/O error: {0}")]
    Io(String),

    #[error("Interface closed")]
    Closed,

    #[error("TUN devices are not supported on this platform")]
    Unsupported,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Endpoint;
    use crate::keys::SessionKey;

    #[test]
    fn test_config_from_session() {
        let session = Session::new(Endpoint::new("vpn.example.net", 51821), SessionKey::generate())
            .with_address(Ipv4Addr::new(10, 9, 0, 42), 16)
            .with_mtu(1380);
        let bypass = vec![IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7))];
        let config = InterfaceConfig::from_session(&session, bypass.clone());

        assert_eq!(config.name, "phazevpn0");
        assert_eq!(config.cidr(), "10.9.0.42/16");
        assert_eq!(config.mtu, 1380);
        assert!(config.default_route);
        assert_eq!(config.bypass, bypass);
    }

    #[test]
    fn test_classify_ip_error() {
        let denied = "RTNETLINK answers: Operation not permitted".to_string();
        assert!(matches!(
            classify_ip_error("link set dev tun0 up", denied),
            InterfaceError::PermissionDenied(_)
        ));
        assert!(matches!(
            classify_ip_error("link set dev tun0 up", "Cannot find device".into()),
            InterfaceError::Configure(_)
        ));
    }
}

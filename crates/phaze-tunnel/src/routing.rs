//! Routing table management.
//!
//! Full-tunnel routing without touching the existing default route: the
//! two halves `0.0.0.0/1` and `128.0.0.0/1` are more specific than
//! `0.0.0.0/0` and win, while a host route per remote endpoint keeps the
//! tunnel's own datagrams on the original gateway.

use crate::interface::InterfaceError;
use std::net::IpAddr;
use std::process::Command;
use tracing::{debug, info, warn};

/// The two halves of the IPv4 address space
const SPLIT_DEFAULT: [&str; 2] = ["0.0.0.0/1", "128.0.0.0/1"];

/// Default gateway as reported by the system
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Gateway {
    pub address: IpAddr,
    pub device: String,
}

/// A single route
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteSpec {
    /// Destination in CIDR notation
    pub destination: String,
    pub gateway: Option<IpAddr>,
    pub device: String,
}

impl RouteSpec {
    /// Route through a device
    pub fn via_device(destination: &str, device: &str) -> Self {
        Self {
            destination: destination.to_string(),
            gateway: None,
            device: device.to_string(),
        }
    }

    /// Route through a gateway on a device
    pub fn via_gateway(destination: &str, gateway: IpAddr, device: &str) -> Self {
        Self {
            destination: destination.to_string(),
            gateway: Some(gateway),
            device: device.to_string(),
        }
    }

    /// Arguments for `ip` to add this route
    pub fn add_args(&self) -> Vec<String> {
        self.args("add")
    }

    /// Arguments for `ip` to delete this route
    pub fn del_args(&self) -> Vec<String> {
        self.args("del")
    }

    fn args(&self, verb: &str) -> Vec<String> {
        let mut args = vec!["route".to_string(), verb.to_string(), self.destination.clone()];
        if let Some(gw) = self.gateway {
            args.push("via".to_string());
            args.push(gw.to_string());
        }
        args.push("dev".to_string());
        args.push(self.device.clone());
        args
    }
}

/// Routes needed to send all traffic through `device`.
///
/// Bypass routes are only planned for endpoints of the same address
/// family as the gateway.
pub fn plan_routes(device: &str, bypass: &[IpAddr], gateway: Option<&Gateway>) -> Vec<RouteSpec> {
    let mut routes = Vec::new();

    if let Some(gw) = gateway {
        for addr in bypass {
            if addr.is_ipv4() != gw.address.is_ipv4() {
                continue;
            }
            let host = match addr {
                IpAddr::V4(v4) => format!("{}/32", v4),
                IpAddr::V6(v6) => format!("{}/128", v6),
            };
            routes.push(RouteSpec::via_gateway(&host, gw.address, &gw.device));
        }
    }

    for half in SPLIT_DEFAULT {
        routes.push(RouteSpec::via_device(half, device));
    }
    routes
}

/// Parse `ip route show default` output
/// (`default via 192.168.1.1 dev eth0 proto dhcp metric 100`)
pub fn parse_default_gateway(output: &str) -> Option<Gateway> {
    output.lines().find_map(|line| {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.first() != Some(&"default") {
            return None;
        }
        let via = parts.iter().position(|p| *p == "via")?;
        let dev = parts.iter().position(|p| *p == "dev")?;
        Some(Gateway {
            address: parts.get(via + 1)?.parse().ok()?,
            device: parts.get(dev + 1)?.to_string(),
        })
    })
}

/// Routes installed for one tunnel device, removed on teardown or drop
#[derive(Debug)]
pub struct RouteTable {
    device: String,
    installed: Vec<RouteSpec>,
}

impl RouteTable {
    pub fn new(device: &str) -> Self {
        Self {
            device: device.to_string(),
            installed: Vec::new(),
        }
    }

    /// Routes currently installed by this table
    pub fn installed(&self) -> &[RouteSpec] {
        &self.installed
    }

    /// Route all traffic through the device, keeping `bypass` on the
    /// original gateway
    pub fn install(&mut self, bypass: &[IpAddr]) -> Result<(), InterfaceError> {
        let gateway = current_gateway()?;
        match &gateway {
            Some(gw) => info!(
                gateway = %gw.address,
                device = %gw.device,
                "Saved original default gateway"
            ),
            None => warn!("No default gateway found, tunnel endpoint will not be bypassed"),
        }

        for route in plan_routes(&self.device, bypass, gateway.as_ref()) {
            if let Err(e) = run_ip(&route.add_args()) {
                if e.contains("File exists") {
                    debug!(route = %route.destination, "Route already present");
                    continue;
                }
                self.teardown();
                return Err(InterfaceError::Routing(format!("{}: {}", route.destination, e)));
            }
            debug!(route = %route.destination, "Route added");
            self.installed.push(route);
        }
        Ok(())
    }

    /// Remove installed routes in reverse order
    pub fn teardown(&mut self) {
        for route in self.installed.drain(..).rev() {
            if let Err(e) = run_ip(&route.del_args()) {
                warn!(route = %route.destination, error = %e, "Failed to remove route");
            }
        }
    }
}

impl Drop for RouteTable {
    fn drop(&mut self) {
        self.teardown();
    }
}

fn current_gateway() -> Result<Option<Gateway>, InterfaceError> {
    let output = Command::new("ip")
        .args(["route", "show", "default"])
        .output()
        .map_err(|e| InterfaceError::Routing(format!("ip: {}", e)))?;

    if !output.status.success() {
        return Ok(None);
    }
    Ok(parse_default_gateway(&String::from_utf8_lossy(&output.stdout)))
}

/// Run `ip` with the given arguments, returning stderr on failure
pub(crate) fn run_ip(args: &[String]) -> Result<(), String> {
    let output = Command::new("ip")
        .args(args)
        .output()
        .map_err(|e| e.to_string())?;

    if output.status.success() {
        Ok(())
    } else {
        Err(String::from_utf8_lossy(&output.stderr).trim().to_string())
    }
}

//! MTU discovery and usable payload size.

use std::net::IpAddr;

use tracing::trace;

/// MTU assumed when no interface reports one.
pub const DEFAULT_MTU: usize = 1500;

/// IPv6 header size, deducted for both families.
const IP_HEADER: usize = 40;
const UDP_HEADER: usize = 8;

/// Name prefixes of interfaces that never carry mDNS traffic.
const VIRTUAL_PREFIXES: &[&str] = &["lo", "veth", "docker", "br-", "virbr", "vmnet", "utun"];

/// Usable UDP payload for the interface at `interface`.
///
/// Uses that interface's MTU when it can be found, otherwise the smallest
/// MTU among physical interfaces that are up.
pub fn negotiate(interface: IpAddr) -> usize {
    let mtu = interface_mtu(interface).unwrap_or_else(minimum_mtu);
    trace!(%interface, mtu, "negotiated mtu");
    payload_size(mtu)
}

/// UDP payload that fits in `mtu`.
pub fn payload_size(mtu: usize) -> usize {
    mtu.saturating_sub(IP_HEADER + UDP_HEADER)
}

fn interface_mtu(address: IpAddr) -> Option<usize> {
    if address.is_unspecified() {
        return None;
    }
    let interfaces = if_addrs::get_if_addrs().ok()?;
    let interface = interfaces.iter().find(|i| i.ip() == address)?;
    read_mtu(&interface.name)
}

fn minimum_mtu() -> usize {
    let Ok(interfaces) = if_addrs::get_if_addrs() else {
        return DEFAULT_MTU;
    };
    interfaces
        .iter()
        .filter(|i| !i.is_loopback() && !is_virtual(&i.name) && is_up(&i.name))
        .filter_map(|i| read_mtu(&i.name))
        .min()
        .unwrap_or(DEFAULT_MTU)
}

/// Whether `name` looks like a loopback, bridge or tunnel interface.
pub fn is_virtual(name: &str) -> bool {
    VIRTUAL_PREFIXES.iter().any(|p| name.starts_with(p))
}

#[cfg(target_os = "linux")]
fn read_mtu(name: &str) -> Option<usize> {
    std::fs::read_to_string(format!("/sys/class/net/{name}/mtu"))
        .ok()?
        .trim()
        .parse()
        .ok()
}

#[cfg(not(target_os = "linux"))]
fn read_mtu(_name: &str) -> Option<usize> {
    None
}

#[cfg(target_os = "linux")]
fn is_up(name: &str) -> bool {
    // "unknown" is what many point-to-point and dummy links report.
    std::fs::read_to_string(format!("/sys/class/net/{name}/operstate"))
        .map(|state| state.trim() != "down")
        .unwrap_or(true)
}

#[cfg(not(target_os = "linux"))]
fn is_up(_name: &str) -> bool {
    true
}

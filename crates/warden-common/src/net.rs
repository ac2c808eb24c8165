//! ---
//! warden_section: "01-core-functionality"
//! warden_subsection: "module"
//! warden_type: "source"
//! warden_scope: "code"
//! warden_description: "Shared primitives and utilities for the controller runtime."
//! warden_version: "v0.0.0-prealpha"
//! warden_owner: "tbd"
//! ---
use std::net::{IpAddr, SocketAddr, UdpSocket};

use indexmap::IndexMap;

use crate::config::MonitorConfig;

/// Whether `ip` is assigned to one of the local interfaces.
///
/// Binding an ephemeral UDP socket only succeeds for local addresses, which avoids
/// walking the interface table.
pub fn has_bind_address(ip: IpAddr) -> bool {
    UdpSocket::bind(SocketAddr::new(ip, 0)).is_ok()
}

/// Monitor tags whose RPC address is not bound on this machine.
pub fn missing_monitor_addresses(monitors: &IndexMap<String, MonitorConfig>) -> Vec<String> {
    monitors
        .iter()
        .filter(|(_, monitor)| match monitor.socket_addr() {
            Ok(addr) => !has_bind_address(addr.ip()),
            Err(_) => true,
        })
        .map(|(tag, monitor)| format!("{} ({})", tag, monitor.address))
        .collect()
}

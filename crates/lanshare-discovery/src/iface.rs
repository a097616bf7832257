//! Interface enumeration.
//!
//! IPv4 unicast addresses are grouped by the network they sit on; within a
//! group only the preferred interface keeps a discovery socket, so a peer
//! reachable two ways is asked (and heard) once per network, not once per
//! NIC. The OS route metric is not portably readable, so the interface
//! index stands in for it: lower wins.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use network_interface::{NetworkInterface, NetworkInterfaceConfig};
use tracing::debug;

use crate::DiscoveryError;

/// One interface address that earned a discovery socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IfaceEntry {
    pub addr: Ipv4Addr,
    pub metric: u32,
    pub name: String,
}

/// Enumerate and group the system's IPv4 addresses.
pub fn enumerate() -> Result<Vec<IfaceEntry>, DiscoveryError> {
    let interfaces =
        NetworkInterface::show().map_err(|e| DiscoveryError::Enumerate(e.to_string()))?;
    Ok(group(candidates(&interfaces)))
}

fn candidates(interfaces: &[NetworkInterface]) -> Vec<(IfaceEntry, Ipv4Addr)> {
    let mut out = Vec::new();
    for iface in interfaces {
        for addr in &iface.addr {
            let network_interface::Addr::V4(v4) = addr else {
                continue;
            };
            if v4.ip.is_loopback() {
                continue;
            }
            let Some(netmask) = v4.netmask else {
                debug!("skipping {} on {}: no netmask", v4.ip, iface.name);
                continue;
            };
            out.push((
                IfaceEntry {
                    addr: v4.ip,
                    metric: iface.index,
                    name: iface.name.clone(),
                },
                netmask,
            ));
        }
    }
    out
}

/// Keep one entry per `(network prefix, prefix length)`, the lowest metric.
fn group(candidates: Vec<(IfaceEntry, Ipv4Addr)>) -> Vec<IfaceEntry> {
    let mut by_prefix: HashMap<(u32, u32), IfaceEntry> = HashMap::new();
    for (entry, netmask) in candidates {
        let mask = u32::from(netmask);
        let network = u32::from(entry.addr) & mask;
        let key = (network, mask.count_ones());
        match by_prefix.get(&key) {
            Some(existing) if existing.metric <= entry.metric => {}
            _ => {
                by_prefix.insert(key, entry);
            }
        }
    }
    let mut entries: Vec<_> = by_prefix.into_values().collect();
    entries.sort_by_key(|e| (e.metric, e.addr));
    entries
}

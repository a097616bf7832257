//! LAN peer discovery.
//!
//! One UDP socket per usable IPv4 interface, all bound to the discovery
//! port with broadcast enabled. A burst sends the request magic out of every
//! socket and collects responses for 500 ms; responses are deduplicated per
//! peer, keeping the one heard on the preferred (lowest-metric) interface.
//! Requests from other agents are answered with our key and the address of
//! the socket that heard them.

pub mod iface;
pub mod service;

use thiserror::Error;

pub use service::{spawn, DiscoveryConfig, DiscoveryHandle};

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("interface enumeration failed: {0}")]
    Enumerate(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

use std::fmt;
use std::str::FromStr;

use base64::Engine;
use base64::engine::general_purpose::STANDARD_NO_PAD;

/// A peer's identity: the raw Ed25519 public key.
///
/// Every lookup in the engine is keyed by this. Displayed as unpadded
/// standard base64, which is also how the store and the front-end render it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub [u8; 32]);

impl PeerId {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Parse a peer id from raw wire bytes. Anything but 32 bytes is rejected.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(arr))
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&STANDARD_NO_PAD.encode(self.0))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({self})")
    }
}

impl FromStr for PeerId {
    type Err = BadPeerId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = STANDARD_NO_PAD.decode(s).map_err(|_| BadPeerId)?;
        Self::from_slice(&bytes).ok_or(BadPeerId)
    }
}

/// The string was not a base64-encoded 32-byte key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BadPeerId;

impl fmt::Display for BadPeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("not a valid peer id")
    }
}

impl std::error::Error for BadPeerId {}

/// A known or discovered peer as the rest of the system sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contact {
    pub peer: PeerId,
    pub display_name: Option<String>,
    /// Statically configured IPv4 address (dotted quad), if any.
    pub static_host: Option<String>,
}

impl Contact {
    pub fn new(peer: PeerId) -> Self {
        Self {
            peer,
            display_name: None,
            static_host: None,
        }
    }
}

/// One peer heard during a discovery burst, after per-burst dedup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryResult {
    pub peer: PeerId,
    pub host: String,
    pub port: u16,
    pub iface_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Byte and file counters for one direction of one peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferTotals {
    pub done_bytes: u64,
    pub total_bytes: u64,
    pub done_files: u64,
    pub total_files: u64,
}

/// Per-peer progress, updated in place and emitted at most every 500 ms
/// (plus unconditionally on batch start, file start and file completion).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub send: TransferTotals,
    pub recv: TransferTotals,
}

use crate::models::{DiscoveryResult, PeerId, ProgressSnapshot};

/// Events the engine surfaces to its host (the desktop UI, or the agent's
/// REPL front-end). One stream for all workers; the host decides rendering.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A discovery burst finished; one entry per peer after dedup.
    Discovered(Vec<DiscoveryResult>),

    /// A session completed its handshake. `known` is false when the peer's
    /// key is not in the contact store — the host may prompt to trust it.
    Connected { peer: PeerId, known: bool },

    /// A session ended, orderly or not.
    Disconnected { peer: PeerId },

    /// Transfer progress for one peer.
    Progress {
        peer: PeerId,
        snapshot: ProgressSnapshot,
    },
}

pub mod events;
pub mod models;

pub use events::EngineEvent;
pub use models::{
    ConnectState, Contact, DiscoveryResult, PeerId, ProgressSnapshot, TransferTotals,
};

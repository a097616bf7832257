//! In-memory contact registry.
//!
//! One task owns the map of peers: the static half loaded from the store
//! (display name, static host, the `known` flag) and the dynamic half fed by
//! discovery and the session engine (current address, interface, connect
//! state, transfer progress). Every other worker talks to it through its
//! inbox; `is_known` is the one synchronous query (oneshot reply) and must
//! never be awaited from the registry task itself.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{error, warn};

use lanshare_db::Database;
use lanshare_types::{ConnectState, DiscoveryResult, PeerId, ProgressSnapshot};

/// One peer as the registry sees it.
#[derive(Debug, Clone)]
pub struct ContactEntry {
    pub peer: PeerId,
    pub name: Option<String>,
    pub static_host: Option<String>,
    /// True when the peer exists in the persistent store. Unknown entries
    /// are dropped on the next discovery refresh.
    pub known: bool,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub iface_name: Option<String>,
    pub connect_state: ConnectState,
    pub progress: ProgressSnapshot,
}

impl ContactEntry {
    fn new(peer: PeerId) -> Self {
        Self {
            peer,
            name: None,
            static_host: None,
            known: false,
            host: None,
            port: None,
            iface_name: None,
            connect_state: ConnectState::Disconnected,
            progress: ProgressSnapshot::default(),
        }
    }

    /// Best address to dial: live discovery result, else the static host on
    /// the default service port.
    pub fn dial_addr(&self, default_port: u16) -> Option<(String, u16)> {
        if let (Some(host), Some(port)) = (&self.host, self.port) {
            return Some((host.clone(), port));
        }
        self.static_host
            .as_ref()
            .map(|h| (h.clone(), default_port))
    }
}

enum Command {
    ApplyDiscovery(Vec<DiscoveryResult>),
    IsKnown {
        peer: PeerId,
        reply: oneshot::Sender<bool>,
    },
    SetConnectState {
        peer: PeerId,
        state: ConnectState,
    },
    SetProgress {
        peer: PeerId,
        snapshot: ProgressSnapshot,
    },
    AddContact {
        peer: PeerId,
        name: String,
        reply: oneshot::Sender<anyhow::Result<()>>,
    },
    UpdateName {
        peer: PeerId,
        name: String,
        reply: oneshot::Sender<anyhow::Result<()>>,
    },
    List {
        reply: oneshot::Sender<Vec<ContactEntry>>,
    },
}

/// Cheap cloneable handle to the registry task.
#[derive(Clone)]
pub struct RegistryHandle {
    tx: mpsc::Sender<Command>,
}

impl RegistryHandle {
    pub async fn apply_discovery(&self, results: Vec<DiscoveryResult>) {
        let _ = self.tx.send(Command::ApplyDiscovery(results)).await;
    }

    /// Whether the peer is in the persistent store. Used by the session
    /// server path before completing a handshake. Deadlocks if awaited from
    /// the registry task; nothing in the engine does that.
    pub async fn is_known(&self, peer: PeerId) -> bool {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::IsKnown { peer, reply }).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn set_connect_state(&self, peer: PeerId, state: ConnectState) {
        let _ = self.tx.send(Command::SetConnectState { peer, state }).await;
    }

    pub async fn set_progress(&self, peer: PeerId, snapshot: ProgressSnapshot) {
        let _ = self.tx.send(Command::SetProgress { peer, snapshot }).await;
    }

    /// Persist a peer and mark it known from now on.
    pub async fn add_contact(&self, peer: PeerId, name: String) -> anyhow::Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::AddContact { peer, name, reply })
            .await
            .map_err(|_| anyhow::anyhow!("registry is gone"))?;
        rx.await.map_err(|_| anyhow::anyhow!("registry is gone"))?
    }

    pub async fn update_name(&self, peer: PeerId, name: String) -> anyhow::Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::UpdateName { peer, name, reply })
            .await
            .map_err(|_| anyhow::anyhow!("registry is gone"))?;
        rx.await.map_err(|_| anyhow::anyhow!("registry is gone"))?
    }

    pub async fn list(&self) -> Vec<ContactEntry> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::List { reply }).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }
}

struct Registry {
    entries: HashMap<PeerId, ContactEntry>,
    db: Arc<Database>,
}

/// Load the stored contacts and spawn the registry task.
pub fn spawn(db: Arc<Database>) -> anyhow::Result<RegistryHandle> {
    let mut entries = HashMap::new();
    for row in db.list_contacts()? {
        let mut entry = ContactEntry::new(row.peer);
        entry.name = Some(row.name);
        entry.static_host = row.static_host;
        entry.known = true;
        entries.insert(row.peer, entry);
    }

    let (tx, mut rx) = mpsc::channel(64);
    let mut registry = Registry { entries, db };
    tokio::spawn(async move {
        while let Some(cmd) = rx.recv().await {
            registry.handle(cmd);
        }
    });

    Ok(RegistryHandle { tx })
}

impl Registry {
    fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::ApplyDiscovery(results) => self.apply_discovery(results),
            Command::IsKnown { peer, reply } => {
                let known = self.entries.get(&peer).is_some_and(|e| e.known);
                let _ = reply.send(known);
            }
            Command::SetConnectState { peer, state } => {
                self.entries
                    .entry(peer)
                    .or_insert_with(|| ContactEntry::new(peer))
                    .connect_state = state;
            }
            Command::SetProgress { peer, snapshot } => {
                if let Some(entry) = self.entries.get_mut(&peer) {
                    entry.progress = snapshot;
                }
            }
            Command::AddContact { peer, name, reply } => {
                let result = self.db.add_contact(peer, &name).map(|()| {
                    let entry = self
                        .entries
                        .entry(peer)
                        .or_insert_with(|| ContactEntry::new(peer));
                    entry.name = Some(name);
                    entry.known = true;
                });
                if let Err(e) = &result {
                    error!("can't persist contact {peer}: {e}");
                }
                let _ = reply.send(result);
            }
            Command::UpdateName { peer, name, reply } => {
                let result = self.db.update_contact_name(peer, &name).map(|()| {
                    if let Some(entry) = self.entries.get_mut(&peer) {
                        entry.name = Some(name);
                    }
                });
                let _ = reply.send(result);
            }
            Command::List { reply } => {
                let mut all: Vec<_> = self.entries.values().cloned().collect();
                all.sort_by_key(|e| e.peer);
                let _ = reply.send(all);
            }
        }
    }

    /// A finished discovery burst replaces all dynamic state: entries that
    /// exist only because an earlier burst heard them are dropped, known
    /// contacts keep their identity but lose their stale address.
    fn apply_discovery(&mut self, results: Vec<DiscoveryResult>) {
        self.entries.retain(|_, e| e.known);
        for entry in self.entries.values_mut() {
            entry.host = None;
            entry.port = None;
            entry.iface_name = None;
        }

        for result in results {
            if result.host.is_empty() {
                warn!("discovery result for {} has no address", result.peer);
                continue;
            }
            let entry = self
                .entries
                .entry(result.peer)
                .or_insert_with(|| ContactEntry::new(result.peer));
            entry.host = Some(result.host);
            entry.port = Some(result.port);
            entry.iface_name = Some(result.iface_name);
        }
    }
}

//! Headless agent: wires the workers together and drives them from a small
//! line-based console, standing in for a desktop front-end.

mod repl;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{info, warn};

use lanshare_db::Database;
use lanshare_discovery::{DiscoveryConfig, DiscoveryHandle};
use lanshare_proto::{DISCOVERY_PORT, SESSION_PORT};
use lanshare_registry::RegistryHandle;
use lanshare_session::{LocalIdentity, SessionConfig, SessionHandle};
use lanshare_transfer::{TransferConfig, TransferHandle};
use lanshare_types::{ConnectState, EngineEvent};

#[derive(Parser, Debug)]
#[command(name = "lanshare", about = "Peer-to-peer LAN file transfer agent")]
struct Args {
    /// Contact/key store; defaults to the per-user data directory.
    #[arg(long)]
    database: Option<PathBuf>,

    /// Where received files land; defaults to the desktop directory.
    #[arg(long)]
    receive_dir: Option<PathBuf>,

    /// TCP port for incoming sessions.
    #[arg(long, default_value_t = SESSION_PORT)]
    listen_port: u16,

    /// UDP port for discovery.
    #[arg(long, default_value_t = DISCOVERY_PORT)]
    discovery_port: u16,
}

/// Handles the console needs.
#[derive(Clone)]
pub struct Agent {
    pub registry: RegistryHandle,
    pub discovery: DiscoveryHandle,
    pub session: SessionHandle,
    pub transfer: TransferHandle,
    pub default_port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lanshare=info".into()),
        )
        .init();

    let args = Args::parse();

    let db_path = match args.database {
        Some(path) => path,
        None => {
            let dir = dirs::data_dir()
                .context("no per-user data directory; pass --database")?
                .join("lanshare");
            tokio::fs::create_dir_all(&dir).await?;
            dir.join("lanshare.db")
        }
    };
    let receive_root = args
        .receive_dir
        .or_else(dirs::desktop_dir)
        .or_else(dirs::home_dir)
        .context("no usable receive directory; pass --receive-dir")?;

    // An unopenable store refuses to start the engine.
    let db = Arc::new(
        Database::open(&db_path)
            .with_context(|| format!("can't open store at {}", db_path.display()))?,
    );
    let (peer, secret) = db.identity().context("can't load identity keypair")?;
    info!("local identity {peer}");

    let registry = lanshare_registry::spawn(db)?;

    // Engine events for the console, session events for the transfer worker.
    let (events_tx, events_rx) = mpsc::channel::<EngineEvent>(256);
    let (session_events_tx, session_events_rx) = mpsc::channel(256);

    let is_known: lanshare_session::IsKnownFn = {
        let registry = registry.clone();
        Arc::new(move |peer| {
            let registry = registry.clone();
            Box::pin(async move { registry.is_known(peer).await })
        })
    };
    let (session, listen_port) = lanshare_session::spawn(SessionConfig {
        identity: LocalIdentity { peer, secret },
        listen_port: args.listen_port,
        is_known,
        events: session_events_tx,
    })?;
    info!("listening for sessions on port {listen_port}");

    let transfer = lanshare_transfer::spawn(TransferConfig {
        receive_root: receive_root.clone(),
        session: session.clone(),
        session_events: session_events_rx,
        events: events_tx.clone(),
    });
    info!("receiving into {}", receive_root.display());

    let (results_tx, mut results_rx) = mpsc::channel(8);
    let discovery = lanshare_discovery::spawn(DiscoveryConfig {
        pubkey: peer,
        service_port: listen_port,
        discovery_port: args.discovery_port,
        results_tx,
    })?;

    // Discovery results feed the registry, then the console.
    {
        let registry = registry.clone();
        let events_tx = events_tx.clone();
        tokio::spawn(async move {
            while let Some(results) = results_rx.recv().await {
                registry.apply_discovery(results.clone()).await;
                let _ = events_tx.send(EngineEvent::Discovered(results)).await;
            }
        });
    }

    // Event pump: keep the registry's dynamic state current and narrate.
    {
        let registry = registry.clone();
        tokio::spawn(async move {
            let mut events = events_rx;
            while let Some(event) = events.recv().await {
                match event {
                    EngineEvent::Discovered(results) => {
                        info!("discovery finished: {} peer(s)", results.len());
                        for result in &results {
                            info!(
                                "  {} at {}:{} via {}",
                                result.peer, result.host, result.port, result.iface_name
                            );
                        }
                    }
                    EngineEvent::Connected { peer, known } => {
                        registry
                            .set_connect_state(peer, ConnectState::Connected)
                            .await;
                        if known {
                            info!("connected: {peer}");
                        } else {
                            warn!("connected to unknown peer {peer}; `trust` it to receive files");
                        }
                    }
                    EngineEvent::Disconnected { peer } => {
                        registry
                            .set_connect_state(peer, ConnectState::Disconnected)
                            .await;
                        info!("disconnected: {peer}");
                    }
                    EngineEvent::Progress { peer, snapshot } => {
                        registry.set_progress(peer, snapshot).await;
                        let (send, recv) = (snapshot.send, snapshot.recv);
                        info!(
                            "{peer}: sent {}/{} files {}/{} bytes, received {}/{} files {}/{} bytes",
                            send.done_files,
                            send.total_files,
                            send.done_bytes,
                            send.total_bytes,
                            recv.done_files,
                            recv.total_files,
                            recv.done_bytes,
                            recv.total_bytes,
                        );
                    }
                }
            }
        });
    }

    let agent = Agent {
        registry,
        discovery,
        session,
        transfer,
        default_port: SESSION_PORT,
    };
    repl::run(agent).await
}

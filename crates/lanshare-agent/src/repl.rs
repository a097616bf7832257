//! Console commands, the thinnest possible stand-in for a contact-list UI.

use std::path::PathBuf;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::error;

use lanshare_registry::ContactEntry;
use lanshare_transfer::paths::list_flat_dir;
use lanshare_types::ConnectState;

use crate::Agent;

const HELP: &str = "\
commands:
  discover                 probe the LAN for peers
  contacts                 list known and discovered peers
  connect <n>              open a session to contact <n>
  disconnect <n>           close the session to contact <n>
  send <n> <path>          send one file
  senddir <n> <dir>        send every file of a flat directory
  trust <n> [name]         persist contact <n> (accept its transfers)
  name <n> <name>          rename contact <n>
  quit";

pub async fn run(agent: Agent) -> anyhow::Result<()> {
    println!("{HELP}");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        let mut parts = line.split_whitespace();
        let Some(cmd) = parts.next() else {
            continue;
        };
        let args: Vec<&str> = parts.collect();

        match cmd {
            "help" => println!("{HELP}"),
            "quit" | "exit" => break,
            "discover" => agent.discovery.start_discovery().await,
            "contacts" => {
                for (i, entry) in agent.registry.list().await.iter().enumerate() {
                    println!("{i:3}  {}", describe(entry));
                }
            }
            "connect" => {
                if let Some(entry) = pick(&agent, &args).await {
                    match entry.dial_addr(agent.default_port) {
                        Some((host, port)) => {
                            agent
                                .registry
                                .set_connect_state(entry.peer, ConnectState::Connecting)
                                .await;
                            agent.session.connect(entry.peer, host, port).await;
                        }
                        None => error!("no address for {}; run discover first", entry.peer),
                    }
                }
            }
            "disconnect" => {
                if let Some(entry) = pick(&agent, &args).await {
                    agent.session.disconnect(entry.peer).await;
                }
            }
            "send" => {
                let (Some(entry), Some(path)) = (pick(&agent, &args).await, args.get(1)) else {
                    error!("usage: send <n> <path>");
                    continue;
                };
                agent
                    .transfer
                    .send_file(entry.peer, PathBuf::from(path))
                    .await;
            }
            "senddir" => {
                let (Some(entry), Some(dir)) = (pick(&agent, &args).await, args.get(1)) else {
                    error!("usage: senddir <n> <dir>");
                    continue;
                };
                let dir = PathBuf::from(dir);
                match list_flat_dir(&dir).await {
                    Ok(files) => agent.transfer.send_dir(entry.peer, dir, files).await,
                    Err(e) => error!("can't send '{}': {e}", dir.display()),
                }
            }
            "trust" => {
                if let Some(entry) = pick(&agent, &args).await {
                    let name = args
                        .get(1)
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| entry.peer.to_string());
                    match agent.registry.add_contact(entry.peer, name).await {
                        Ok(()) => agent.transfer.mark_trusted(entry.peer).await,
                        Err(e) => error!("can't add contact: {e}"),
                    }
                }
            }
            "name" => {
                let (Some(entry), Some(name)) = (pick(&agent, &args).await, args.get(1)) else {
                    error!("usage: name <n> <name>");
                    continue;
                };
                if let Err(e) = agent.registry.update_name(entry.peer, name.to_string()).await {
                    error!("can't rename: {e}");
                }
            }
            other => error!("unknown command {other:?}; try `help`"),
        }
    }
    Ok(())
}

/// Resolve the `<n>` argument against the current contact listing.
async fn pick(agent: &Agent, args: &[&str]) -> Option<ContactEntry> {
    let index: usize = args.first()?.parse().ok()?;
    let all = agent.registry.list().await;
    let entry = all.into_iter().nth(index);
    if entry.is_none() {
        error!("no contact #{index}; run `contacts`");
    }
    entry
}

fn describe(entry: &ContactEntry) -> String {
    let name = entry.name.as_deref().unwrap_or("<unnamed>");
    let state = match entry.connect_state {
        ConnectState::Connected => "connected",
        ConnectState::Connecting => "connecting",
        ConnectState::Disconnected => "disconnected",
    };
    let addr = match (&entry.host, entry.port) {
        (Some(host), Some(port)) => format!("{host}:{port}"),
        _ => entry
            .static_host
            .clone()
            .unwrap_or_else(|| "no address".into()),
    };
    let known = if entry.known { "" } else { "  [unknown]" };
    format!("{name}  {}  {addr}  {state}{known}", entry.peer)
}

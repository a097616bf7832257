//! The discovery worker.
//!
//! All state lives in one task. Per-socket recv tasks only forward datagrams
//! into the inbox; replies go out through the socket the request arrived on,
//! so the advertised address is always the one the peer can actually reach.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use lanshare_proto::discovery::{
    split_magic, request_datagram, response_datagram, DiscoveryResponse, DISCOVERY_REQ_MAGIC,
    DISCOVERY_RESP_MAGIC,
};
use lanshare_proto::Wire;
use lanshare_types::{DiscoveryResult, PeerId};

use crate::iface::{self, IfaceEntry};
use crate::DiscoveryError;

/// How long a burst listens before the accumulated results are delivered.
const BURST_WINDOW: Duration = Duration::from_millis(500);

/// Portable stand-in for the OS address-list-change notification.
const REENUMERATE_EVERY: Duration = Duration::from_secs(60);

pub struct DiscoveryConfig {
    pub pubkey: PeerId,
    /// TCP port advertised in responses.
    pub service_port: u16,
    /// UDP port the discovery sockets bind and broadcast to.
    pub discovery_port: u16,
    /// Where finished bursts are delivered.
    pub results_tx: mpsc::Sender<Vec<DiscoveryResult>>,
}

#[derive(Clone)]
pub struct DiscoveryHandle {
    tx: mpsc::Sender<Msg>,
}

impl DiscoveryHandle {
    /// Kick off a burst. Results arrive on the configured channel ~500 ms
    /// later; starting again before that restarts the window.
    pub async fn start_discovery(&self) {
        let _ = self.tx.send(Msg::Start).await;
    }
}

enum Msg {
    Start,
    Datagram {
        generation: u64,
        endpoint: usize,
        from: SocketAddr,
        data: Vec<u8>,
    },
    BurstTimeout {
        burst: u64,
    },
}

/// Spawn the discovery worker. Per-socket trouble is logged and tolerated
/// (including having no usable interface yet); only a failed enumeration of
/// the interface table itself refuses to start.
pub fn spawn(config: DiscoveryConfig) -> Result<DiscoveryHandle, DiscoveryError> {
    let (tx, rx) = mpsc::channel(256);
    let (cancel_tx, _) = watch::channel(0u64);

    let mut service = Service {
        config,
        endpoints: Vec::new(),
        entries: Vec::new(),
        dedup: HashMap::new(),
        generation: 0,
        burst_id: 0,
        inbox: tx.clone(),
        cancel: cancel_tx,
    };
    service.rebuild_endpoints(iface::enumerate()?);
    if service.endpoints.is_empty() {
        warn!("no usable IPv4 interface; discovery is idle until one appears");
    }

    tokio::spawn(service.run(rx));
    Ok(DiscoveryHandle { tx })
}

/// Socket-free description of one endpoint, shared with the datagram logic.
#[derive(Debug, Clone, PartialEq, Eq)]
struct EndpointInfo {
    local: SocketAddrV4,
    metric: u32,
    iface_name: String,
}

struct Endpoint {
    socket: Arc<UdpSocket>,
    info: EndpointInfo,
}

struct Service {
    config: DiscoveryConfig,
    endpoints: Vec<Endpoint>,
    /// The enumeration the current sockets were built from.
    entries: Vec<IfaceEntry>,
    dedup: HashMap<PeerId, (u32, DiscoveryResult)>,
    generation: u64,
    burst_id: u64,
    inbox: mpsc::Sender<Msg>,
    cancel: watch::Sender<u64>,
}

impl Service {
    async fn run(mut self, mut rx: mpsc::Receiver<Msg>) {
        let mut reenumerate = tokio::time::interval_at(
            tokio::time::Instant::now() + REENUMERATE_EVERY,
            REENUMERATE_EVERY,
        );
        reenumerate.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = reenumerate.tick() => self.refresh_endpoints(),
                msg = rx.recv() => match msg {
                    Some(msg) => self.handle(msg).await,
                    None => break,
                },
            }
        }
    }

    async fn handle(&mut self, msg: Msg) {
        match msg {
            Msg::Start => self.start_burst().await,
            Msg::Datagram {
                generation,
                endpoint,
                from,
                data,
            } => {
                if generation != self.generation {
                    return;
                }
                self.on_datagram(endpoint, from, &data).await;
            }
            Msg::BurstTimeout { burst } => {
                if burst != self.burst_id {
                    return;
                }
                let mut results: Vec<_> =
                    self.dedup.drain().map(|(_, (_, result))| result).collect();
                results.sort_by_key(|r| r.peer);
                info!("discovery burst finished with {} peer(s)", results.len());
                let _ = self.config.results_tx.send(results).await;
            }
        }
    }

    async fn start_burst(&mut self) {
        self.refresh_endpoints();
        self.dedup.clear();

        let request = request_datagram();
        let broadcast = SocketAddr::V4(SocketAddrV4::new(
            Ipv4Addr::BROADCAST,
            self.config.discovery_port,
        ));
        for endpoint in &self.endpoints {
            if let Err(e) = endpoint.socket.send_to(&request, broadcast).await {
                warn!(
                    "can't send discovery request from {}: {e}",
                    endpoint.info.local
                );
            }
        }

        self.burst_id += 1;
        let burst = self.burst_id;
        let inbox = self.inbox.clone();
        tokio::spawn(async move {
            tokio::time::sleep(BURST_WINDOW).await;
            let _ = inbox.send(Msg::BurstTimeout { burst }).await;
        });
    }

    async fn on_datagram(&mut self, endpoint: usize, from: SocketAddr, data: &[u8]) {
        let infos: Vec<_> = self.endpoints.iter().map(|e| e.info.clone()).collect();
        let action = handle_datagram(
            &infos,
            endpoint,
            from,
            data,
            &self.config.pubkey,
            self.config.service_port,
            &mut self.dedup,
        );
        if let DatagramAction::Reply(reply) = action {
            if let Some(ep) = self.endpoints.get(endpoint) {
                if let Err(e) = ep.socket.send_to(&reply, from).await {
                    warn!("can't send discovery response to {from}: {e}");
                }
            }
        }
    }

    /// Re-enumerate; rebind only when the interface picture changed.
    fn refresh_endpoints(&mut self) {
        match iface::enumerate() {
            Ok(entries) if entries != self.entries => {
                info!("interface list changed, rebinding discovery sockets");
                self.rebuild_endpoints(entries);
            }
            Ok(_) => {}
            Err(e) => warn!("interface enumeration failed: {e}"),
        }
    }

    fn rebuild_endpoints(&mut self, entries: Vec<IfaceEntry>) {
        self.generation += 1;
        let _ = self.cancel.send(self.generation);
        self.endpoints.clear();

        for entry in &entries {
            let socket = match bind_broadcast(entry.addr, self.config.discovery_port) {
                Ok(socket) => Arc::new(socket),
                Err(e) => {
                    warn!(
                        "bind to {}:{} failed, discovery may not work on {}: {e}",
                        entry.addr, self.config.discovery_port, entry.name
                    );
                    continue;
                }
            };
            let info = EndpointInfo {
                local: SocketAddrV4::new(entry.addr, self.config.discovery_port),
                metric: entry.metric,
                iface_name: entry.name.clone(),
            };
            debug!("discovery socket on {} ({})", info.local, info.iface_name);
            spawn_recv(
                socket.clone(),
                self.endpoints.len(),
                self.generation,
                self.inbox.clone(),
                self.cancel.subscribe(),
            );
            self.endpoints.push(Endpoint { socket, info });
        }
        self.entries = entries;
    }
}

fn bind_broadcast(addr: Ipv4Addr, port: u16) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_broadcast(true)?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddrV4::new(addr, port).into())?;
    UdpSocket::from_std(socket.into())
}

fn spawn_recv(
    socket: Arc<UdpSocket>,
    endpoint: usize,
    generation: u64,
    inbox: mpsc::Sender<Msg>,
    mut cancel: watch::Receiver<u64>,
) {
    tokio::spawn(async move {
        let mut buf = vec![0u8; 1500];
        loop {
            tokio::select! {
                result = socket.recv_from(&mut buf) => match result {
                    Ok((len, from)) => {
                        let msg = Msg::Datagram {
                            generation,
                            endpoint,
                            from,
                            data: buf[..len].to_vec(),
                        };
                        if inbox.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        // Drop the packet, keep the socket.
                        warn!("discovery recv error: {e}");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                _ = cancel.changed() => break,
            }
        }
    });
}

enum DatagramAction {
    Ignore,
    Reply(Vec<u8>),
}

/// The protocol logic, free of sockets: decide what one datagram means.
fn handle_datagram(
    endpoints: &[EndpointInfo],
    endpoint: usize,
    from: SocketAddr,
    data: &[u8],
    pubkey: &PeerId,
    service_port: u16,
    dedup: &mut HashMap<PeerId, (u32, DiscoveryResult)>,
) -> DatagramAction {
    let Some((magic, body)) = split_magic(data) else {
        debug!("bad discovery packet of size {}", data.len());
        return DatagramAction::Ignore;
    };
    let Some(receiver) = endpoints.get(endpoint) else {
        return DatagramAction::Ignore;
    };

    if magic == DISCOVERY_REQ_MAGIC {
        // Our own broadcast loops back on every socket that sent it.
        if endpoints.iter().any(|e| SocketAddr::V4(e.local) == from) {
            return DatagramAction::Ignore;
        }
        let response = DiscoveryResponse {
            pubkey: pubkey.as_bytes().to_vec(),
            ip: receiver.local.ip().to_string(),
            port: service_port,
        };
        return DatagramAction::Reply(response_datagram(&response));
    }

    if magic == DISCOVERY_RESP_MAGIC {
        let response = match DiscoveryResponse::decode(body) {
            Ok(response) => response,
            Err(e) => {
                debug!("can't decode discovery response from {from}: {e}");
                return DatagramAction::Ignore;
            }
        };
        let Some(peer) = PeerId::from_slice(&response.pubkey) else {
            debug!("discovery response from {from} has a malformed key");
            return DatagramAction::Ignore;
        };
        let keep = match dedup.get(&peer) {
            Some((metric, _)) => receiver.metric < *metric,
            None => true,
        };
        if keep {
            dedup.insert(
                peer,
                (
                    receiver.metric,
                    DiscoveryResult {
                        peer,
                        host: response.ip,
                        port: response.port,
                        iface_name: receiver.iface_name.clone(),
                    },
                ),
            );
        }
        return DatagramAction::Ignore;
    }

    debug!("received bad discovery magic {magic:#010x}");
    DatagramAction::Ignore
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoints() -> Vec<EndpointInfo> {
        vec![
            EndpointInfo {
                local: SocketAddrV4::new([192, 168, 1, 10].into(), 8891),
                metric: 10,
                iface_name: "eth0".into(),
            },
            EndpointInfo {
                local: SocketAddrV4::new([10, 0, 0, 5].into(), 8891),
                metric: 25,
                iface_name: "wlan0".into(),
            },
        ]
    }

    fn response_from(peer: PeerId, ip: &str) -> Vec<u8> {
        response_datagram(&DiscoveryResponse {
            pubkey: peer.as_bytes().to_vec(),
            ip: ip.into(),
            port: 8890,
        })
    }

    #[test]
    fn request_from_peer_gets_reply_with_receiving_address() {
        let endpoints = endpoints();
        let me = PeerId([0xAA; 32]);
        let mut dedup = HashMap::new();
        let from: SocketAddr = "192.168.1.20:8891".parse().unwrap();

        let action = handle_datagram(
            &endpoints,
            0,
            from,
            &request_datagram(),
            &me,
            8890,
            &mut dedup,
        );
        let DatagramAction::Reply(reply) = action else {
            panic!("expected a reply");
        };
        let (magic, body) = split_magic(&reply).unwrap();
        assert_eq!(magic, DISCOVERY_RESP_MAGIC);
        let response = DiscoveryResponse::decode(body).unwrap();
        assert_eq!(response.ip, "192.168.1.10");
        assert_eq!(response.port, 8890);
        assert_eq!(response.pubkey, me.as_bytes());
    }

    #[test]
    fn own_request_is_dropped() {
        let endpoints = endpoints();
        let mut dedup = HashMap::new();
        // Loops back on the *other* socket too; still ours.
        let from = SocketAddr::V4(endpoints[0].local);
        let action = handle_datagram(
            &endpoints,
            1,
            from,
            &request_datagram(),
            &PeerId([0xAA; 32]),
            8890,
            &mut dedup,
        );
        assert!(matches!(action, DatagramAction::Ignore));
    }

    #[test]
    fn dedup_keeps_lowest_metric_interface() {
        let endpoints = endpoints();
        let me = PeerId([0xAA; 32]);
        let peer = PeerId([0xBB; 32]);
        let mut dedup = HashMap::new();
        let from: SocketAddr = "192.168.1.20:8891".parse().unwrap();

        // Heard on the worse interface first, then the better one.
        for (idx, ip) in [(1usize, "10.0.0.20"), (0usize, "192.168.1.20")] {
            handle_datagram(
                &endpoints,
                idx,
                from,
                &response_from(peer, ip),
                &me,
                8890,
                &mut dedup,
            );
        }
        assert_eq!(dedup.len(), 1);
        let (_, result) = &dedup[&peer];
        assert_eq!(result.iface_name, "eth0");
        assert_eq!(result.host, "192.168.1.20");

        // Hearing the worse interface again does not displace the winner.
        handle_datagram(
            &endpoints,
            1,
            from,
            &response_from(peer, "10.0.0.20"),
            &me,
            8890,
            &mut dedup,
        );
        assert_eq!(dedup[&peer].1.iface_name, "eth0");
    }

    #[test]
    fn junk_datagrams_are_ignored() {
        let endpoints = endpoints();
        let mut dedup = HashMap::new();
        let from: SocketAddr = "192.168.1.20:8891".parse().unwrap();
        for junk in [&b""[..], b"HS", b"XXXXooo"] {
            let action = handle_datagram(
                &endpoints,
                0,
                from,
                junk,
                &PeerId([0xAA; 32]),
                8890,
                &mut dedup,
            );
            assert!(matches!(action, DatagramAction::Ignore));
        }
        assert!(dedup.is_empty());
    }

    #[test]
    fn malformed_response_key_is_ignored() {
        let endpoints = endpoints();
        let mut dedup = HashMap::new();
        let from: SocketAddr = "192.168.1.20:8891".parse().unwrap();
        let datagram = response_datagram(&DiscoveryResponse {
            pubkey: vec![1, 2, 3],
            ip: "192.168.1.20".into(),
            port: 8890,
        });
        handle_datagram(
            &endpoints,
            0,
            from,
            &datagram,
            &PeerId([0xAA; 32]),
            8890,
            &mut dedup,
        );
        assert!(dedup.is_empty());
    }
}

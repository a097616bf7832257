//! The session worker.
//!
//! One engine task owns the peer→connection index; each connection runs in
//! its own task (reader and writer driven together, so aborting the task
//! tears the whole connection down). Connections register with the engine
//! once their handshake completes and deregister on any exit path, which is
//! what guarantees the disconnect notification always fires.

use std::collections::HashMap;
use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use lanshare_types::PeerId;

use crate::handshake::{self, Established, LocalIdentity};
use crate::queue::{QueueReceiver, SendQueue, MAX_BUFFERS_TO_SEND};
use crate::record::{read_record, write_record};
use crate::SessionError;

/// Listener backlog.
const BACKLOG: i32 = 10;

/// Async predicate answering "is this key in the contact store?". Runs in
/// connection tasks, never in the worker that owns the answer.
pub type IsKnownFn =
    Arc<dyn Fn(PeerId) -> Pin<Box<dyn Future<Output = bool> + Send>> + Send + Sync>;

/// What the session engine tells the transfer engine (and, forwarded by it,
/// the host). Delivered strictly in order per peer.
#[derive(Debug)]
pub enum SessionEvent {
    /// Handshake complete; `sender` is the way to this peer's wire.
    Connected {
        peer: PeerId,
        sender: PeerSender,
        known: bool,
    },
    /// Connection gone, orderly or not.
    Disconnected { peer: PeerId },
    /// One decrypted record.
    Record { peer: PeerId, plaintext: Bytes },
    /// The send queue drained below the low watermark.
    QueueEmpty { peer: PeerId },
}

/// Handle for enqueueing records to one connected peer.
#[derive(Clone)]
pub struct PeerSender {
    peer: PeerId,
    queue: SendQueue,
}

impl PeerSender {
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// Queue one plaintext record. True means the high watermark was hit
    /// and the caller should cork this peer until `QueueEmpty`.
    pub fn enqueue(&self, plaintext: Bytes) -> bool {
        self.queue.enqueue(plaintext)
    }
}

impl std::fmt::Debug for PeerSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerSender({})", self.peer)
    }
}

pub struct SessionConfig {
    pub identity: LocalIdentity,
    /// 0 binds an ephemeral port (tests).
    pub listen_port: u16,
    pub is_known: IsKnownFn,
    pub events: mpsc::Sender<SessionEvent>,
}

#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<Cmd>,
}

impl SessionHandle {
    /// Dial a peer. Outcome arrives as a `Connected` or `Disconnected`
    /// event; dialing an already-connected peer is a no-op.
    pub async fn connect(&self, peer: PeerId, host: String, port: u16) {
        let _ = self.tx.send(Cmd::Connect { peer, host, port }).await;
    }

    pub async fn disconnect(&self, peer: PeerId) {
        let _ = self.tx.send(Cmd::Disconnect { peer }).await;
    }
}

enum Cmd {
    Connect {
        peer: PeerId,
        host: String,
        port: u16,
    },
    Disconnect {
        peer: PeerId,
    },
    Incoming {
        stream: TcpStream,
        addr: SocketAddr,
    },
    Register {
        conn_id: u64,
        peer: PeerId,
        sender: PeerSender,
        known: bool,
        reply: oneshot::Sender<bool>,
    },
    Closed {
        conn_id: u64,
        peer: Option<PeerId>,
    },
}

/// Bind the listener and start the engine. Returns the handle and the port
/// actually bound.
pub fn spawn(config: SessionConfig) -> Result<(SessionHandle, u16), SessionError> {
    let listener = build_listener(config.listen_port)?;
    let port = listener.local_addr()?.port();
    info!("session listener on port {port}");

    let (tx, rx) = mpsc::channel(256);

    let accept_tx = tx.clone();
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    if accept_tx.send(Cmd::Incoming { stream, addr }).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    error!("accept error: {e}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    });

    let engine = Engine {
        identity: config.identity,
        is_known: config.is_known,
        events: config.events,
        cmd_tx: tx.clone(),
        conns: HashMap::new(),
        tasks: HashMap::new(),
        next_conn_id: 0,
    };
    tokio::spawn(engine.run(rx));

    Ok((SessionHandle { tx }, port))
}

fn build_listener(port: u16) -> Result<TcpListener, SessionError> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into())?;
    socket.listen(BACKLOG)?;
    Ok(TcpListener::from_std(socket.into())?)
}

struct Connection {
    conn_id: u64,
}

struct Engine {
    identity: LocalIdentity,
    is_known: IsKnownFn,
    events: mpsc::Sender<SessionEvent>,
    cmd_tx: mpsc::Sender<Cmd>,
    conns: HashMap<PeerId, Connection>,
    tasks: HashMap<u64, JoinHandle<()>>,
    next_conn_id: u64,
}

enum Role {
    /// We dialed; the peer must prove this identity.
    Client { expected: PeerId },
    Server,
}

impl Engine {
    async fn run(mut self, mut rx: mpsc::Receiver<Cmd>) {
        while let Some(cmd) = rx.recv().await {
            self.handle(cmd).await;
        }
        for (_, task) in self.tasks.drain() {
            task.abort();
        }
    }

    async fn handle(&mut self, cmd: Cmd) {
        match cmd {
            Cmd::Connect { peer, host, port } => {
                if self.conns.contains_key(&peer) {
                    debug!("already connected to {peer}");
                    return;
                }
                let conn_id = self.next_id();
                let ctx = self.conn_ctx(conn_id);
                let task = tokio::spawn(async move {
                    match TcpStream::connect((host.as_str(), port)).await {
                        Ok(stream) => {
                            run_connection(ctx, stream, Role::Client { expected: peer }).await;
                        }
                        Err(e) => {
                            warn!("can't connect to {peer} at {host}:{port}: {e}");
                            let _ = ctx.events.send(SessionEvent::Disconnected { peer }).await;
                            let _ = ctx
                                .cmd_tx
                                .send(Cmd::Closed {
                                    conn_id,
                                    peer: None,
                                })
                                .await;
                        }
                    }
                });
                self.tasks.insert(conn_id, task);
            }
            Cmd::Disconnect { peer } => {
                if let Some(conn) = self.conns.remove(&peer) {
                    if let Some(task) = self.tasks.remove(&conn.conn_id) {
                        task.abort();
                    }
                    let _ = self.events.send(SessionEvent::Disconnected { peer }).await;
                }
            }
            Cmd::Incoming { stream, addr } => {
                debug!("incoming connection from {addr}");
                let conn_id = self.next_id();
                let ctx = self.conn_ctx(conn_id);
                let task =
                    tokio::spawn(async move { run_connection(ctx, stream, Role::Server).await });
                self.tasks.insert(conn_id, task);
            }
            Cmd::Register {
                conn_id,
                peer,
                sender,
                known,
                reply,
            } => {
                if self.conns.contains_key(&peer) {
                    // One connection per peer; the newcomer is shut.
                    warn!("dropping duplicate connection for {peer}");
                    let _ = reply.send(false);
                    return;
                }
                self.conns.insert(peer, Connection { conn_id });
                let _ = reply.send(true);
                let _ = self
                    .events
                    .send(SessionEvent::Connected {
                        peer,
                        sender,
                        known,
                    })
                    .await;
            }
            Cmd::Closed { conn_id, peer } => {
                self.tasks.remove(&conn_id);
                if let Some(peer) = peer {
                    let current = self.conns.get(&peer).map(|c| c.conn_id);
                    if current == Some(conn_id) {
                        self.conns.remove(&peer);
                        let _ = self.events.send(SessionEvent::Disconnected { peer }).await;
                    }
                }
            }
        }
    }

    fn next_id(&mut self) -> u64 {
        self.next_conn_id += 1;
        self.next_conn_id
    }

    fn conn_ctx(&self, conn_id: u64) -> ConnCtx {
        ConnCtx {
            conn_id,
            identity: self.identity.clone(),
            is_known: self.is_known.clone(),
            events: self.events.clone(),
            cmd_tx: self.cmd_tx.clone(),
        }
    }
}

#[derive(Clone)]
struct ConnCtx {
    conn_id: u64,
    identity: LocalIdentity,
    is_known: IsKnownFn,
    events: mpsc::Sender<SessionEvent>,
    cmd_tx: mpsc::Sender<Cmd>,
}

async fn run_connection(ctx: ConnCtx, mut stream: TcpStream, role: Role) {
    if let Err(e) = SockRef::from(&stream).set_nodelay(true) {
        debug!("can't set nodelay: {e}");
    }

    let established = match &role {
        Role::Client { expected } => {
            match handshake::connect(&mut stream, &ctx.identity, *expected).await {
                Ok(est) => est,
                Err(e) => {
                    error!("handshake with {expected} failed: {e}");
                    // The dial was user-initiated; report it dead so the
                    // host can reset its connecting state.
                    let _ = ctx
                        .events
                        .send(SessionEvent::Disconnected { peer: *expected })
                        .await;
                    let _ = ctx
                        .cmd_tx
                        .send(Cmd::Closed {
                            conn_id: ctx.conn_id,
                            peer: None,
                        })
                        .await;
                    return;
                }
            }
        }
        Role::Server => match handshake::accept(&mut stream, &ctx.identity).await {
            Ok(est) => est,
            Err(e) => {
                error!("inbound handshake failed: {e}");
                let _ = ctx
                    .cmd_tx
                    .send(Cmd::Closed {
                        conn_id: ctx.conn_id,
                        peer: None,
                    })
                    .await;
                return;
            }
        },
    };

    let peer = established.peer;
    let known = (ctx.is_known)(peer).await;
    if !known {
        info!("peer {peer} completed handshake but is not a known contact");
    }

    let (queue, queue_rx) = SendQueue::new();
    let sender = PeerSender { peer, queue };

    let (reply, accepted) = oneshot::channel();
    let registered = ctx
        .cmd_tx
        .send(Cmd::Register {
            conn_id: ctx.conn_id,
            peer,
            sender,
            known,
            reply,
        })
        .await
        .is_ok()
        && accepted.await.unwrap_or(false);
    if !registered {
        let _ = ctx
            .cmd_tx
            .send(Cmd::Closed {
                conn_id: ctx.conn_id,
                peer: None,
            })
            .await;
        return;
    }

    info!("connected to {peer}");
    match drive(stream, established, queue_rx, &ctx.events).await {
        Ok(()) => info!("connection to {peer} closed"),
        Err(e) => error!("connection to {peer} failed: {e}"),
    }

    let _ = ctx
        .cmd_tx
        .send(Cmd::Closed {
            conn_id: ctx.conn_id,
            peer: Some(peer),
        })
        .await;
}

/// Pump both directions until either side ends. Records observe strict FIFO
/// per direction; the AEAD nonce counters tie decrypt order to wire order.
async fn drive(
    stream: TcpStream,
    established: Established,
    mut queue_rx: QueueReceiver,
    events: &mpsc::Sender<SessionEvent>,
) -> Result<(), SessionError> {
    let peer = established.peer;
    let mut seal = established.tx;
    let mut open = established.rx;
    let (mut read_half, mut write_half) = stream.into_split();

    let reader = async {
        loop {
            match read_record(&mut read_half).await? {
                None => return Ok(()),
                Some(ciphertext) => {
                    let plaintext = open.open(&ciphertext)?;
                    let event = SessionEvent::Record {
                        peer,
                        plaintext: Bytes::from(plaintext),
                    };
                    if events.send(event).await.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    };

    let writer = async {
        let mut written = 0usize;
        while let Some((plaintext, crossed_low)) = queue_rx.recv().await {
            let ciphertext = seal.seal(&plaintext);
            write_record(&mut write_half, &ciphertext).await?;
            if crossed_low {
                let _ = events.send(SessionEvent::QueueEmpty { peer }).await;
            }
            // Fairness with the other connections on this worker.
            written += 1;
            if written >= MAX_BUFFERS_TO_SEND {
                written = 0;
                tokio::task::yield_now().await;
            }
        }
        Ok(())
    };

    tokio::select! {
        result = reader => result,
        result = writer => result,
    }
}

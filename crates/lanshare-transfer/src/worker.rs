//! The transfer worker.
//!
//! One task owns every per-peer send queue, the receive state machine and
//! the progress map. Send work drains cooperatively: while any peer is
//! uncorked the loop alternates between absorbing inbox traffic and writing
//! one bounded burst of records, so a long file never starves the inbox.
//!
//! Flow control: `PeerSender::enqueue` returning true moves that peer's
//! task from `uncorked` to `corked`; the session's `QueueEmpty` signal
//! moves it back. A peer sits in exactly one bucket at a time (`paused` is
//! the third, reserved for host-driven pause control).

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};
use tokio::fs;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use lanshare_crypto::Hash256;
use lanshare_proto::file::{FileHeader, FileList, FileMessageKind, FileTrailer};
use lanshare_proto::frame::{StreamHeader, FILE_STREAM_ID};
use lanshare_proto::Wire;
use lanshare_session::{PeerSender, SessionEvent, SessionHandle};
use lanshare_types::{EngineEvent, PeerId, ProgressSnapshot};

use crate::paths::{self, StagedFile};

/// Disk read size per data record.
const READ_CHUNK: usize = 65536;

/// Data records written for one peer per drain round.
const MAX_RECORDS_PER_ROUND: usize = 10;

/// Progress callback throttle.
const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);

pub struct TransferConfig {
    pub receive_root: PathBuf,
    pub session: SessionHandle,
    pub session_events: mpsc::Receiver<SessionEvent>,
    pub events: mpsc::Sender<EngineEvent>,
}

#[derive(Clone)]
pub struct TransferHandle {
    tx: mpsc::Sender<Cmd>,
}

impl TransferHandle {
    /// Queue a single file for a connected peer.
    pub async fn send_file(&self, peer: PeerId, path: PathBuf) {
        let _ = self.tx.send(Cmd::SendFile { peer, path }).await;
    }

    /// Queue a flat-directory batch. `files` are names relative to `dir`,
    /// as produced by [`paths::list_flat_dir`].
    pub async fn send_dir(&self, peer: PeerId, dir: PathBuf, files: Vec<String>) {
        let _ = self.tx.send(Cmd::SendDir { peer, dir, files }).await;
    }

    /// The host confirmed trust in a peer whose handshake arrived unknown;
    /// start accepting its transfers.
    pub async fn mark_trusted(&self, peer: PeerId) {
        let _ = self.tx.send(Cmd::MarkTrusted { peer }).await;
    }
}

enum Cmd {
    SendFile {
        peer: PeerId,
        path: PathBuf,
    },
    SendDir {
        peer: PeerId,
        dir: PathBuf,
        files: Vec<String>,
    },
    MarkTrusted {
        peer: PeerId,
    },
}

pub fn spawn(config: TransferConfig) -> TransferHandle {
    let (tx, rx) = mpsc::channel(64);
    let worker = Worker {
        receive_root: config.receive_root,
        session: config.session,
        events: config.events,
        conns: HashMap::new(),
        uncorked: HashMap::new(),
        corked: HashMap::new(),
        paused: HashMap::new(),
        recv: HashMap::new(),
        progress: HashMap::new(),
    };
    tokio::spawn(worker.run(rx, config.session_events));
    TransferHandle { tx }
}

// ---------------------------------------------------------------- send side

enum SendPhase {
    Header,
    Data,
    Trailer,
}

struct FileItem {
    abs: PathBuf,
    rel: String,
    phase: SendPhase,
    hash: Hash256,
    file: Option<fs::File>,
    /// True when a batch preamble already carried this file's size.
    in_batch: bool,
}

enum SendItem {
    ListHeader { count: u32, size: u64 },
    File(FileItem),
}

#[derive(Default)]
struct SendTask {
    queue: VecDeque<SendItem>,
}

struct PeerConn {
    sender: PeerSender,
    known: bool,
    refusal_logged: bool,
}

// ------------------------------------------------------------- receive side

enum RecvPhase {
    Header,
    Body,
}

struct ReceiveState {
    phase: RecvPhase,
    staged: Option<StagedFile>,
    hash: Hash256,
    expected: u64,
    received: u64,
    write_failed: bool,
    /// Directory the current batch lands in; empty for bare single files.
    batch_dir: Option<PathBuf>,
    batch_total: u32,
    batch_done: u32,
}

impl Default for ReceiveState {
    fn default() -> Self {
        Self {
            phase: RecvPhase::Header,
            staged: None,
            hash: Hash256::new(),
            expected: 0,
            received: 0,
            write_failed: false,
            batch_dir: None,
            batch_total: 0,
            batch_done: 0,
        }
    }
}

struct ProgressState {
    snapshot: ProgressSnapshot,
    last_sent: Option<Instant>,
}

// ----------------------------------------------------------------- worker

struct Worker {
    receive_root: PathBuf,
    session: SessionHandle,
    events: mpsc::Sender<EngineEvent>,
    conns: HashMap<PeerId, PeerConn>,
    uncorked: HashMap<PeerId, SendTask>,
    corked: HashMap<PeerId, SendTask>,
    paused: HashMap<PeerId, SendTask>,
    recv: HashMap<PeerId, ReceiveState>,
    progress: HashMap<PeerId, ProgressState>,
}

impl Worker {
    async fn run(
        mut self,
        mut cmds: mpsc::Receiver<Cmd>,
        mut session_events: mpsc::Receiver<SessionEvent>,
    ) {
        loop {
            if self.uncorked.values().any(|t| !t.queue.is_empty()) {
                // Drain mode: absorb whatever is queued without blocking,
                // then write one burst.
                loop {
                    match cmds.try_recv() {
                        Ok(cmd) => self.on_cmd(cmd).await,
                        Err(_) => break,
                    }
                }
                loop {
                    match session_events.try_recv() {
                        Ok(event) => self.on_session_event(event).await,
                        Err(_) => break,
                    }
                }
                self.write_round().await;
                tokio::task::yield_now().await;
            } else {
                tokio::select! {
                    cmd = cmds.recv() => match cmd {
                        Some(cmd) => self.on_cmd(cmd).await,
                        None => break,
                    },
                    event = session_events.recv() => match event {
                        Some(event) => self.on_session_event(event).await,
                        None => break,
                    },
                }
            }
        }
    }

    async fn on_cmd(&mut self, cmd: Cmd) {
        match cmd {
            Cmd::SendFile { peer, path } => self.enqueue_file(peer, path),
            Cmd::SendDir { peer, dir, files } => self.enqueue_dir(peer, dir, files).await,
            Cmd::MarkTrusted { peer } => {
                if let Some(conn) = self.conns.get_mut(&peer) {
                    conn.known = true;
                    conn.refusal_logged = false;
                }
            }
        }
    }

    fn enqueue_file(&mut self, peer: PeerId, path: PathBuf) {
        info!("queued file '{}' for {peer}", path.display());
        let rel = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.task_for(peer).queue.push_back(SendItem::File(FileItem {
            abs: path,
            rel,
            phase: SendPhase::Header,
            hash: Hash256::new(),
            file: None,
            in_batch: false,
        }));
    }

    async fn enqueue_dir(&mut self, peer: PeerId, dir: PathBuf, files: Vec<String>) {
        // Preamble totals come from stat; unreadable files leave the batch
        // here, before anything is promised to the receiver.
        let mut kept = Vec::new();
        let mut size = 0u64;
        for name in files {
            let abs = dir.join(&name);
            match fs::metadata(&abs).await {
                Ok(meta) if meta.is_file() => {
                    size += meta.len();
                    kept.push((abs, name));
                }
                Ok(_) => warn!("skipping non-file '{}'", abs.display()),
                Err(e) => error!("can't stat '{}': {e}", abs.display()),
            }
        }
        info!("queued {} file(s), {size} bytes for {peer}", kept.len());

        let task = self.task_for(peer);
        task.queue.push_back(SendItem::ListHeader {
            count: kept.len() as u32,
            size,
        });
        for (abs, rel) in kept {
            task.queue.push_back(SendItem::File(FileItem {
                abs,
                rel,
                phase: SendPhase::Header,
                hash: Hash256::new(),
                file: None,
                in_batch: true,
            }));
        }
    }

    /// The bucket a new item lands in is wherever the peer already sits.
    fn task_for(&mut self, peer: PeerId) -> &mut SendTask {
        if self.paused.contains_key(&peer) {
            self.paused.get_mut(&peer).unwrap()
        } else if self.corked.contains_key(&peer) {
            self.corked.get_mut(&peer).unwrap()
        } else {
            self.uncorked.entry(peer).or_default()
        }
    }

    async fn on_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Connected {
                peer,
                sender,
                known,
            } => {
                self.conns.insert(
                    peer,
                    PeerConn {
                        sender,
                        known,
                        refusal_logged: false,
                    },
                );
                let _ = self.events.send(EngineEvent::Connected { peer, known }).await;
            }
            SessionEvent::Disconnected { peer } => {
                self.conns.remove(&peer);
                self.uncorked.remove(&peer);
                self.corked.remove(&peer);
                self.paused.remove(&peer);
                // An open .part stays on disk for diagnosis; the final name
                // never appears for a truncated transfer.
                if let Some(state) = self.recv.remove(&peer) {
                    if let Some(staged) = state.staged {
                        warn!(
                            "connection to {peer} lost mid-file, keeping {}",
                            staged.part_path.display()
                        );
                    }
                }
                let _ = self.events.send(EngineEvent::Disconnected { peer }).await;
            }
            SessionEvent::Record { peer, plaintext } => {
                self.on_record(peer, plaintext).await;
            }
            SessionEvent::QueueEmpty { peer } => {
                if let Some(task) = self.corked.remove(&peer) {
                    self.uncorked.insert(peer, task);
                }
            }
        }
    }

    // ------------------------------------------------------------- sending

    /// Drain a bounded burst for one uncorked peer.
    async fn write_round(&mut self) {
        let Some(peer) = self.uncorked.keys().next().copied() else {
            return;
        };
        if !self.conns.contains_key(&peer) {
            warn!("dropping queued transfers for {peer}: not connected");
            self.uncorked.remove(&peer);
            return;
        }

        enum Front {
            Done,
            List { count: u32, size: u64 },
            File { needs_header: bool },
        }
        let front = match self.uncorked.get(&peer).and_then(|t| t.queue.front()) {
            None => Front::Done,
            Some(SendItem::ListHeader { count, size }) => Front::List {
                count: *count,
                size: *size,
            },
            Some(SendItem::File(item)) => Front::File {
                needs_header: matches!(item.phase, SendPhase::Header),
            },
        };

        match front {
            Front::Done => {
                self.uncorked.remove(&peer);
            }
            Front::List { count, size } => {
                let body = FileList { count, size }.encode();
                self.send_record(peer, FileMessageKind::List, &body);

                let stats = &mut self.progress_for(peer).snapshot.send;
                stats.total_bytes += size;
                stats.total_files += u64::from(count);
                self.maybe_send_progress(peer, true).await;

                self.pop_item(peer);
            }
            Front::File { needs_header } => {
                if needs_header && !self.start_file(peer).await {
                    return;
                }
                // Fall through into the data loop unless the header corked.
                if self.uncorked.contains_key(&peer) {
                    self.pump_data(peer).await;
                }
            }
        }
    }

    /// Open the file and emit its header. False means the item was dropped.
    async fn start_file(&mut self, peer: PeerId) -> bool {
        let Some(SendItem::File(item)) = self
            .uncorked
            .get_mut(&peer)
            .and_then(|t| t.queue.front_mut())
        else {
            return false;
        };

        let file = match fs::File::open(&item.abs).await {
            Ok(file) => file,
            Err(e) => {
                error!("can't open file '{}': {e}", item.abs.display());
                self.pop_item(peer);
                return false;
            }
        };
        let size = match file.metadata().await {
            Ok(meta) => meta.len(),
            Err(e) => {
                error!("can't stat file '{}': {e}", item.abs.display());
                self.pop_item(peer);
                return false;
            }
        };
        info!("starting to send '{}'", item.abs.display());

        item.file = Some(file);
        item.phase = SendPhase::Data;
        let rel = item.rel.clone();
        let in_batch = item.in_batch;

        if !in_batch {
            let stats = &mut self.progress_for(peer).snapshot.send;
            stats.total_bytes += size;
            stats.total_files += 1;
            self.maybe_send_progress(peer, true).await;
        }

        let body = FileHeader { name: rel, size }.encode();
        self.send_record(peer, FileMessageKind::Header, &body);
        true
    }

    /// Stream data records until EOF, cork, or the fairness bound.
    async fn pump_data(&mut self, peer: PeerId) {
        let mut records = 0usize;
        loop {
            let Some(SendItem::File(item)) = self
                .uncorked
                .get_mut(&peer)
                .and_then(|t| t.queue.front_mut())
            else {
                return;
            };
            if !matches!(item.phase, SendPhase::Data) {
                break;
            }
            let Some(file) = item.file.as_mut() else {
                return;
            };

            let mut buf = BytesMut::with_capacity(READ_CHUNK);
            buf.resize(READ_CHUNK, 0);
            let count = match file.read(&mut buf[..]).await {
                Ok(count) => count,
                Err(e) => {
                    error!("error reading '{}': {e}", item.abs.display());
                    self.pop_item(peer);
                    return;
                }
            };
            if count == 0 {
                info!("finished sending '{}'", item.abs.display());
                item.file = None;
                item.phase = SendPhase::Trailer;
                break;
            }
            buf.truncate(count);
            item.hash.update(&buf);

            self.progress_for(peer).snapshot.send.done_bytes += count as u64;
            self.maybe_send_progress(peer, false).await;

            let corked = self.send_record(peer, FileMessageKind::Data, &buf);
            records += 1;
            if corked || records >= MAX_RECORDS_PER_ROUND {
                return;
            }
        }

        // Trailer. Cork state no longer gates it: this is the item's last
        // record, so it goes out and the item is retired either way.
        let Some(SendItem::File(item)) = self
            .uncorked
            .get_mut(&peer)
            .and_then(|t| t.queue.front_mut())
        else {
            return;
        };
        if matches!(item.phase, SendPhase::Trailer) {
            let checksum = std::mem::take(&mut item.hash).finalize();
            let body = FileTrailer {
                checksum: checksum.to_vec(),
            }
            .encode();

            self.progress_for(peer).snapshot.send.done_files += 1;
            self.maybe_send_progress(peer, true).await;
            self.send_record(peer, FileMessageKind::Trailer, &body);
            self.pop_item(peer);
        }
    }

    fn pop_item(&mut self, peer: PeerId) {
        for bucket in [&mut self.uncorked, &mut self.corked, &mut self.paused] {
            if let Some(task) = bucket.get_mut(&peer) {
                task.queue.pop_front();
                return;
            }
        }
    }

    /// Frame and enqueue one record; a true return means the session queue
    /// hit its high watermark and this peer just moved to `corked`.
    fn send_record(&mut self, peer: PeerId, kind: FileMessageKind, payload: &[u8]) -> bool {
        let Some(conn) = self.conns.get(&peer) else {
            return false;
        };
        let header = StreamHeader::file(kind as u16).to_bytes();
        let mut record = BytesMut::with_capacity(header.len() + payload.len());
        record.put_slice(&header);
        record.put_slice(payload);

        let corked = conn.sender.enqueue(record.freeze());
        if corked {
            if let Some(task) = self.uncorked.remove(&peer) {
                self.corked.insert(peer, task);
            }
        }
        corked
    }

    // ----------------------------------------------------------- receiving

    async fn on_record(&mut self, peer: PeerId, plaintext: Bytes) {
        let Some(conn) = self.conns.get_mut(&peer) else {
            debug!("record from unregistered peer {peer}");
            return;
        };
        if !conn.known {
            // Held until the host confirms the contact.
            if !conn.refusal_logged {
                conn.refusal_logged = true;
                warn!("refusing transfer records from unconfirmed peer {peer}");
            }
            return;
        }

        let (header, payload) = match StreamHeader::split(&plaintext) {
            Ok(split) => split,
            Err(e) => {
                error!("malformed record from {peer}: {e}");
                self.session.disconnect(peer).await;
                return;
            }
        };
        if header.stream_id != FILE_STREAM_ID {
            error!("bad stream id {} from {peer}", header.stream_id);
            self.session.disconnect(peer).await;
            return;
        }
        let Some(kind) = FileMessageKind::from_wire(header.kind) else {
            error!("unknown record kind {} from {peer}", header.kind);
            self.session.disconnect(peer).await;
            return;
        };

        let in_body = matches!(self.recv.entry(peer).or_default().phase, RecvPhase::Body);
        if in_body {
            self.on_body_record(peer, kind, payload).await;
        } else {
            self.on_header_record(peer, kind, payload).await;
        }
    }

    async fn on_header_record(&mut self, peer: PeerId, kind: FileMessageKind, payload: &[u8]) {
        match kind {
            FileMessageKind::List => {
                let list = match FileList::decode(payload) {
                    Ok(list) => list,
                    Err(e) => {
                        error!("can't decode file list from {peer}: {e}");
                        return;
                    }
                };
                if list.count == 0 {
                    return;
                }
                let batch_dir = match paths::make_batch_dir(&self.receive_root).await {
                    Ok(dir) => dir,
                    Err(e) => {
                        error!("can't create batch directory: {e}");
                        return;
                    }
                };
                info!(
                    "going to receive {} file(s), {} bytes into '{}'",
                    list.count,
                    list.size,
                    batch_dir.display()
                );
                let state = self.recv.entry(peer).or_default();
                state.batch_dir = Some(batch_dir);
                state.batch_total = list.count;
                state.batch_done = 0;

                let stats = &mut self.progress_for(peer).snapshot.recv;
                stats.total_files += u64::from(list.count);
                stats.total_bytes += list.size;
                self.maybe_send_progress(peer, true).await;
            }
            FileMessageKind::Header => {
                let header = match FileHeader::decode(payload) {
                    Ok(header) => header,
                    Err(e) => {
                        error!("can't decode file header from {peer}: {e}");
                        return;
                    }
                };
                info!("receiving file '{}' of size {}", header.name, header.size);

                let state = self.recv.entry(peer).or_default();
                let outside_batch = state.batch_done == state.batch_total;
                if outside_batch {
                    // A bare file between batches forms a batch of one.
                    state.batch_dir = None;
                }
                let root = state
                    .batch_dir
                    .clone()
                    .unwrap_or_else(|| self.receive_root.clone());

                let rel = match paths::sanitize_relative(&header.name) {
                    Ok(rel) => rel,
                    Err(e) => {
                        error!("rejecting file from {peer}: {e}");
                        return;
                    }
                };
                let staged = match paths::stage_file(&root, &rel).await {
                    Ok(staged) => staged,
                    Err(e) => {
                        error!("can't create file for '{}': {e}", header.name);
                        return;
                    }
                };

                let state = self.recv.entry(peer).or_default();
                if outside_batch {
                    state.batch_total += 1;
                }
                state.staged = Some(staged);
                state.hash = Hash256::new();
                state.expected = header.size;
                state.received = 0;
                state.write_failed = false;
                state.phase = RecvPhase::Body;

                if outside_batch {
                    let stats = &mut self.progress_for(peer).snapshot.recv;
                    stats.total_files += 1;
                    stats.total_bytes += header.size;
                    self.maybe_send_progress(peer, true).await;
                }
            }
            FileMessageKind::Data | FileMessageKind::Trailer => {
                // Usually the tail of a file whose destination could not be
                // created; drop until the next header.
                debug!("ignoring {kind:?} record outside a file from {peer}");
            }
        }
    }

    async fn on_body_record(&mut self, peer: PeerId, kind: FileMessageKind, payload: &[u8]) {
        match kind {
            FileMessageKind::Data => {
                let Some(state) = self.recv.get_mut(&peer) else {
                    return;
                };
                state.hash.update(payload);
                state.received += payload.len() as u64;

                if !state.write_failed {
                    if let Some(staged) = state.staged.as_mut() {
                        use tokio::io::AsyncWriteExt;
                        if let Err(e) = staged.file.write_all(payload).await {
                            error!(
                                "error writing to '{}': {e}",
                                staged.part_path.display()
                            );
                            state.write_failed = true;
                        }
                    }
                }

                self.progress_for(peer).snapshot.recv.done_bytes += payload.len() as u64;
                self.maybe_send_progress(peer, false).await;
            }
            FileMessageKind::Trailer => {
                let trailer = match FileTrailer::decode(payload) {
                    Ok(trailer) => trailer,
                    Err(e) => {
                        error!("can't decode trailer from {peer}: {e}");
                        self.session.disconnect(peer).await;
                        return;
                    }
                };
                self.finish_file(peer, trailer).await;
            }
            FileMessageKind::Header | FileMessageKind::List => {
                error!("unexpected {kind:?} record mid-file from {peer}");
                self.session.disconnect(peer).await;
            }
        }
    }

    /// Close out the in-flight file: the `.part` becomes the final name only
    /// when both the size and the checksum agree with the trailer.
    async fn finish_file(&mut self, peer: PeerId, trailer: FileTrailer) {
        let Some(state) = self.recv.get_mut(&peer) else {
            return;
        };
        let staged = state.staged.take();
        let actual = std::mem::take(&mut state.hash).finalize();
        let (received, expected) = (state.received, state.expected);
        let write_failed = state.write_failed;

        if let Some(staged) = staged {
            drop(staged.file);
            if write_failed {
                warn!(
                    "keeping '{}': local write errors",
                    staged.part_path.display()
                );
            } else if received != expected {
                error!(
                    "bad size for '{}': expected {expected}, received {received} bytes",
                    staged.final_path.display()
                );
            } else if actual.as_slice() != trailer.checksum.as_slice() {
                error!(
                    "corrupt file '{}': expected hash {}, actual {}",
                    staged.final_path.display(),
                    hex::encode(&trailer.checksum),
                    hex::encode(actual)
                );
            } else {
                match paths::promote(&staged.part_path, &staged.final_path).await {
                    Ok(true) => {
                        info!(
                            "finished receiving '{}', checksum OK",
                            staged.final_path.display()
                        )
                    }
                    Ok(false) => warn!(
                        "'{}' already exists, keeping '{}'",
                        staged.final_path.display(),
                        staged.part_path.display()
                    ),
                    Err(e) => error!("can't finalize '{}': {e}", staged.final_path.display()),
                }
            }
        }

        let state = self.recv.entry(peer).or_default();
        state.batch_done += 1;
        if state.batch_done == state.batch_total {
            state.batch_dir = None;
        }
        state.phase = RecvPhase::Header;

        self.progress_for(peer).snapshot.recv.done_files += 1;
        self.maybe_send_progress(peer, true).await;
    }

    // ------------------------------------------------------------ progress

    fn progress_for(&mut self, peer: PeerId) -> &mut ProgressState {
        self.progress.entry(peer).or_insert(ProgressState {
            snapshot: ProgressSnapshot::default(),
            last_sent: None,
        })
    }

    async fn maybe_send_progress(&mut self, peer: PeerId, force: bool) {
        let Some(state) = self.progress.get_mut(&peer) else {
            return;
        };
        if !force
            && state
                .last_sent
                .is_some_and(|last| last.elapsed() < PROGRESS_INTERVAL)
        {
            return;
        }
        state.last_sent = Some(Instant::now());
        let snapshot = state.snapshot;
        let _ = self
            .events
            .send(EngineEvent::Progress { peer, snapshot })
            .await;
    }
}

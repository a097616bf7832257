//! The session engine: TCP listener and dialer, the mutual-authentication
//! handshake, the encrypted record layer, and per-connection send queues
//! with back-pressure.
//!
//! The engine is one task; each connection adds a reader task and a writer
//! task. Everything downstream (the transfer engine) hears about a
//! connection through [`SessionEvent`]s and talks back through the
//! [`PeerSender`] it was handed at connect time — callbacks never re-enter
//! the session task.

pub mod engine;
pub mod handshake;
pub mod queue;
pub mod record;

use thiserror::Error;

pub use engine::{spawn, IsKnownFn, PeerSender, SessionConfig, SessionEvent, SessionHandle};
pub use handshake::LocalIdentity;
pub use queue::{HIGH_WATERMARK, LOW_WATERMARK, MAX_BUFFERS_TO_SEND};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Frame(#[from] lanshare_proto::FrameError),
    #[error(transparent)]
    Codec(#[from] lanshare_proto::CodecError),
    #[error(transparent)]
    Crypto(#[from] lanshare_crypto::CryptoError),
    #[error("peer closed the connection mid-record")]
    UnexpectedEof,
    #[error("peer closed the connection during the handshake")]
    ClosedInHandshake,
    #[error("handshake field has the wrong length")]
    BadHandshakeField,
    #[error("peer identity does not match the dialed contact")]
    PeerMismatch,
}

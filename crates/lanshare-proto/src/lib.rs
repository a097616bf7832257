//! Wire protocol: record framing, the tagged-field codec, and every message
//! that crosses the network (discovery datagrams, handshake records, file
//! stream records).

pub mod codec;
pub mod discovery;
pub mod file;
pub mod frame;
pub mod handshake;

pub use codec::{CodecError, FieldReader, FieldWriter, Wire};
pub use frame::{FrameError, StreamHeader, FILE_STREAM_ID, MAX_RECORD_LEN, MIN_RECORD_LEN};

/// TCP port the session listener binds.
pub const SESSION_PORT: u16 = 8890;

/// UDP port discovery sockets bind and broadcast to.
pub const DISCOVERY_PORT: u16 = 8891;

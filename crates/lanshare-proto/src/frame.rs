//! Record framing.
//!
//! Every record on a session is `u32_le length ∥ body`. Post-handshake the
//! body is an AEAD ciphertext whose plaintext starts with a raw 4-byte
//! stream header:
//!
//! ```text
//! [0..2]  stream id (u16 LE) — always 5555 for the file stream
//! [2..4]  message kind (u16 LE)
//! [4..]   tag-encoded body, or raw bytes for FileData
//! ```

use thiserror::Error;

/// Smallest body a record may carry.
pub const MIN_RECORD_LEN: usize = 4;

/// Upper bound on a record body, exclusive. Anything at or above this is a
/// protocol violation and fatal to the connection.
pub const MAX_RECORD_LEN: usize = 100_000;

/// The only stream id currently assigned. Kept as a checked constant so a
/// future revision can turn it into a real multiplexing field.
pub const FILE_STREAM_ID: u16 = 5555;

/// Raw stream header size on the wire.
pub const STREAM_HEADER_LEN: usize = 4;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("record length {0} outside [{MIN_RECORD_LEN}, {MAX_RECORD_LEN})")]
    LengthOutOfRange(u32),
    #[error("record too short for a stream header")]
    Truncated,
    #[error("unexpected stream id {0}")]
    BadStreamId(u16),
}

/// Validate a just-read record length against the protocol bounds.
pub fn check_record_len(len: u32) -> Result<(), FrameError> {
    if (len as usize) < MIN_RECORD_LEN || (len as usize) >= MAX_RECORD_LEN {
        return Err(FrameError::LengthOutOfRange(len));
    }
    Ok(())
}

/// The fixed header in front of every post-handshake plaintext. Not
/// tag-encoded: two raw little-endian u16s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamHeader {
    pub stream_id: u16,
    pub kind: u16,
}

impl StreamHeader {
    pub fn file(kind: u16) -> Self {
        Self {
            stream_id: FILE_STREAM_ID,
            kind,
        }
    }

    pub fn to_bytes(self) -> [u8; STREAM_HEADER_LEN] {
        let mut out = [0u8; STREAM_HEADER_LEN];
        out[0..2].copy_from_slice(&self.stream_id.to_le_bytes());
        out[2..4].copy_from_slice(&self.kind.to_le_bytes());
        out
    }

    /// Split a plaintext into its stream header and payload.
    pub fn split(plaintext: &[u8]) -> Result<(Self, &[u8]), FrameError> {
        if plaintext.len() < STREAM_HEADER_LEN {
            return Err(FrameError::Truncated);
        }
        let header = Self {
            stream_id: u16::from_le_bytes(plaintext[0..2].try_into().unwrap()),
            kind: u16::from_le_bytes(plaintext[2..4].try_into().unwrap()),
        };
        Ok((header, &plaintext[STREAM_HEADER_LEN..]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn length_bounds() {
        assert!(check_record_len(4).is_ok());
        assert!(check_record_len(99_999).is_ok());
        assert_eq!(
            check_record_len(3),
            Err(FrameError::LengthOutOfRange(3))
        );
        assert_eq!(
            check_record_len(100_000),
            Err(FrameError::LengthOutOfRange(100_000))
        );
        assert_eq!(
            check_record_len(u32::MAX),
            Err(FrameError::LengthOutOfRange(u32::MAX))
        );
    }

    #[test]
    fn header_roundtrip() {
        let h = StreamHeader::file(3);
        let mut buf = h.to_bytes().to_vec();
        buf.extend_from_slice(b"payload");
        let (parsed, rest) = StreamHeader::split(&buf).unwrap();
        assert_eq!(parsed, h);
        assert_eq!(rest, b"payload");
        // Wire layout is two raw LE u16s.
        assert_eq!(&buf[0..2], &5555u16.to_le_bytes());
    }

    #[test]
    fn header_needs_four_bytes() {
        assert_eq!(StreamHeader::split(&[1, 2, 3]), Err(FrameError::Truncated));
    }
}

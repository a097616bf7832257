//! Streaming BLAKE2b-256.
//!
//! One type serves both users: the handshake transcript (which needs
//! `snapshot` — hash-so-far without disturbing the running state) and file
//! content checksums.

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};

pub const HASH_LEN: usize = 32;

/// Both peers seed the handshake transcript with this 32-byte ASCII-space
/// block. Spaces rather than zeros are load-bearing: the value is fixed by
/// the wire protocol.
pub const TRANSCRIPT_SEED: [u8; 32] = [0x20; 32];

#[derive(Clone)]
pub struct Hash256 {
    state: Blake2b<U32>,
}

impl Hash256 {
    pub fn new() -> Self {
        Self {
            state: Blake2b::<U32>::new(),
        }
    }

    /// A transcript accumulator, already seeded.
    pub fn transcript() -> Self {
        let mut h = Self::new();
        h.update(&TRANSCRIPT_SEED);
        h
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.state.update(bytes);
    }

    /// Hash of everything absorbed so far; the accumulator keeps running.
    pub fn snapshot(&self) -> [u8; HASH_LEN] {
        self.state.clone().finalize().into()
    }

    pub fn finalize(self) -> [u8; HASH_LEN] {
        self.state.finalize().into()
    }
}

impl Default for Hash256 {
    fn default() -> Self {
        Self::new()
    }
}

/// One-shot convenience for small inputs.
pub fn hash256(bytes: &[u8]) -> [u8; HASH_LEN] {
    let mut h = Hash256::new();
    h.update(bytes);
    h.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_keeps_accumulating() {
        let mut h = Hash256::new();
        h.update(b"one");
        let early = h.snapshot();
        h.update(b"two");
        let late = h.finalize();

        assert_eq!(early, hash256(b"one"));
        assert_eq!(late, hash256(b"onetwo"));
        assert_ne!(early, late);
    }

    #[test]
    fn incremental_matches_one_shot() {
        let mut h = Hash256::new();
        for chunk in [b"abc".as_slice(), b"def", b""] {
            h.update(chunk);
        }
        assert_eq!(h.finalize(), hash256(b"abcdef"));
    }

    #[test]
    fn transcript_seed_is_spaces() {
        assert_eq!(&TRANSCRIPT_SEED, b"                                ");
        let seeded = Hash256::transcript().finalize();
        assert_eq!(seeded, hash256(&TRANSCRIPT_SEED));
    }
}

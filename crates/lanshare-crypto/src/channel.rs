//! Per-direction AEAD state.
//!
//! Each direction of a session owns a key and a 12-byte nonce treated as a
//! little-endian 96-bit counter: every successful seal or open uses the
//! current value and then increments it, so nonce order is record order and
//! no nonce is ever reused. An open failure means the stream is corrupt or
//! tampered; the connection must be torn down.

use chacha20poly1305::aead::Aead;
use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit, Nonce};

use crate::CryptoError;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// Increment a nonce as a little-endian counter, carrying across bytes.
fn increment(nonce: &mut [u8; NONCE_LEN]) {
    for byte in nonce.iter_mut() {
        let (next, carry) = byte.overflowing_add(1);
        *byte = next;
        if !carry {
            break;
        }
    }
}

/// Encrypting half of a channel.
pub struct SealingKey {
    cipher: ChaCha20Poly1305,
    nonce: [u8; NONCE_LEN],
}

impl SealingKey {
    pub fn new(key: &[u8; KEY_LEN], nonce: [u8; NONCE_LEN]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
            nonce,
        }
    }

    /// Encrypt one record; the ciphertext carries the 16-byte tag.
    pub fn seal(&mut self, plaintext: &[u8]) -> Vec<u8> {
        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&self.nonce), plaintext)
            .expect("chacha20poly1305 encryption is infallible for in-range lengths");
        increment(&mut self.nonce);
        ciphertext
    }

    pub fn nonce(&self) -> &[u8; NONCE_LEN] {
        &self.nonce
    }
}

/// Decrypting half of a channel.
pub struct OpeningKey {
    cipher: ChaCha20Poly1305,
    nonce: [u8; NONCE_LEN],
}

impl OpeningKey {
    pub fn new(key: &[u8; KEY_LEN], nonce: [u8; NONCE_LEN]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
            nonce,
        }
    }

    /// Decrypt one record. The nonce only advances on success, so a fatal
    /// authentication failure leaves the state diagnosable.
    pub fn open(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&self.nonce), ciphertext)
            .map_err(|_| CryptoError::DecryptFailed)?;
        increment(&mut self.nonce);
        Ok(plaintext)
    }

    pub fn nonce(&self) -> &[u8; NONCE_LEN] {
        &self.nonce
    }
}

//! Cryptographic primitives for the session protocol: long-term Ed25519
//! identities, per-connection X25519 key exchange, the per-direction
//! ChaCha20-Poly1305 channel with counter nonces, and the BLAKE2b-256
//! streaming hash used for both the handshake transcript and file checksums.

pub mod channel;
pub mod hash;
pub mod identity;
pub mod kx;

use thiserror::Error;

pub use channel::{OpeningKey, SealingKey, KEY_LEN, NONCE_LEN, TAG_LEN};
pub use hash::{Hash256, HASH_LEN, TRANSCRIPT_SEED};
pub use identity::{PUBLIC_KEY_LEN, SECRET_KEY_LEN, SIGNATURE_LEN};
pub use kx::{KexKeypair, SessionKeys};

#[derive(Debug, Error)]
pub enum CryptoError {
    /// The OS randomness source failed; treated as fatal at startup.
    #[error("random source unavailable: {0}")]
    RandomSource(String),
    #[error("malformed key material")]
    BadKey,
    #[error("key share contributed no entropy")]
    WeakKexShare,
    #[error("record failed authentication")]
    DecryptFailed,
    #[error("signature verification failed")]
    BadSignature,
}

/// Fill a fixed-size buffer from the OS randomness source.
pub(crate) fn random_array<const N: usize>() -> Result<[u8; N], CryptoError> {
    use rand::TryRngCore;

    let mut out = [0u8; N];
    rand::rngs::OsRng
        .try_fill_bytes(&mut out)
        .map_err(|e| CryptoError::RandomSource(e.to_string()))?;
    Ok(out)
}

/// Random bytes for handshake contributions (hello randoms, initial nonces).
pub fn random_bytes<const N: usize>() -> Result<[u8; N], CryptoError> {
    random_array()
}

//! Per-connection key exchange.
//!
//! Ephemeral X25519, with session keys derived the libsodium `kx` way:
//! `BLAKE2b-512(q ∥ client_pk ∥ server_pk)` split into two 32-byte halves.
//! The client reads `(rx, tx)` in that order; the server reads the reverse,
//! so each side's tx key is the other's rx key.

use blake2::digest::consts::U64;
use blake2::{Blake2b, Digest};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::{random_array, CryptoError};

pub const KEX_PUBLIC_LEN: usize = 32;

/// An ephemeral X25519 keypair, one per connection attempt.
pub struct KexKeypair {
    public: [u8; KEX_PUBLIC_LEN],
    secret: StaticSecret,
}

impl KexKeypair {
    pub fn generate() -> Result<Self, CryptoError> {
        let secret = StaticSecret::from(random_array::<32>()?);
        let public = PublicKey::from(&secret).to_bytes();
        Ok(Self { public, secret })
    }

    pub fn public(&self) -> &[u8; KEX_PUBLIC_LEN] {
        &self.public
    }

    fn shared(&self, peer_public: &[u8; KEX_PUBLIC_LEN]) -> Result<[u8; 32], CryptoError> {
        let shared = self.secret.diffie_hellman(&PublicKey::from(*peer_public));
        if !shared.was_contributory() {
            return Err(CryptoError::WeakKexShare);
        }
        Ok(shared.to_bytes())
    }
}

/// The two directional AEAD keys for one connection.
pub struct SessionKeys {
    pub rx: [u8; 32],
    pub tx: [u8; 32],
}

fn derive(
    shared: &[u8; 32],
    client_public: &[u8; KEX_PUBLIC_LEN],
    server_public: &[u8; KEX_PUBLIC_LEN],
) -> [u8; 64] {
    let mut hasher = Blake2b::<U64>::new();
    hasher.update(shared);
    hasher.update(client_public);
    hasher.update(server_public);
    hasher.finalize().into()
}

/// Derive session keys on the dialing side.
pub fn client_session_keys(
    client: &KexKeypair,
    server_public: &[u8; KEX_PUBLIC_LEN],
) -> Result<SessionKeys, CryptoError> {
    let keys = derive(&client.shared(server_public)?, client.public(), server_public);
    Ok(SessionKeys {
        rx: keys[..32].try_into().unwrap(),
        tx: keys[32..].try_into().unwrap(),
    })
}

/// Derive session keys on the accepting side.
pub fn server_session_keys(
    server: &KexKeypair,
    client_public: &[u8; KEX_PUBLIC_LEN],
) -> Result<SessionKeys, CryptoError> {
    let keys = derive(&server.shared(client_public)?, client_public, server.public());
    Ok(SessionKeys {
        rx: keys[32..].try_into().unwrap(),
        tx: keys[..32].try_into().unwrap(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn both_sides_agree() {
        let client = KexKeypair::generate().unwrap();
        let server = KexKeypair::generate().unwrap();

        let c = client_session_keys(&client, server.public()).unwrap();
        let s = server_session_keys(&server, client.public()).unwrap();

        assert_eq!(c.tx, s.rx);
        assert_eq!(c.rx, s.tx);
        assert_ne!(c.tx, c.rx);
    }

    #[test]
    fn zero_share_is_rejected() {
        let client = KexKeypair::generate().unwrap();
        assert!(matches!(
            client_session_keys(&client, &[0u8; 32]),
            Err(CryptoError::WeakKexShare)
        ));
    }
}

//! Long-term Ed25519 identity keys.
//!
//! The secret half uses the 64-byte keypair encoding (seed ∥ public), which
//! is what the contact store persists.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

use crate::{random_array, CryptoError};

pub const PUBLIC_KEY_LEN: usize = 32;
pub const SECRET_KEY_LEN: usize = 64;
pub const SIGNATURE_LEN: usize = 64;

/// Generate a fresh identity keypair.
pub fn generate() -> Result<([u8; PUBLIC_KEY_LEN], [u8; SECRET_KEY_LEN]), CryptoError> {
    let seed: [u8; 32] = random_array()?;
    let signing = SigningKey::from_bytes(&seed);
    Ok((
        signing.verifying_key().to_bytes(),
        signing.to_keypair_bytes(),
    ))
}

/// Sign a message with the long-term key.
pub fn sign(secret: &[u8; SECRET_KEY_LEN], message: &[u8]) -> Result<[u8; SIGNATURE_LEN], CryptoError> {
    let signing = SigningKey::from_keypair_bytes(secret).map_err(|_| CryptoError::BadKey)?;
    Ok(signing.sign(message).to_bytes())
}

/// Verify a detached signature against a public key.
pub fn verify(public: &[u8], message: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
    let public: &[u8; PUBLIC_KEY_LEN] = public.try_into().map_err(|_| CryptoError::BadKey)?;
    let key = VerifyingKey::from_bytes(public).map_err(|_| CryptoError::BadKey)?;
    let signature: &[u8; SIGNATURE_LEN] =
        signature.try_into().map_err(|_| CryptoError::BadSignature)?;
    key.verify(message, &Signature::from_bytes(signature))
        .map_err(|_| CryptoError::BadSignature)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify() {
        let (public, secret) = generate().unwrap();
        let sig = sign(&secret, b"transcript hash").unwrap();
        verify(&public, b"transcript hash", &sig).unwrap();
    }

    #[test]
    fn verify_rejects_wrong_message() {
        let (public, secret) = generate().unwrap();
        let sig = sign(&secret, b"one transcript").unwrap();
        assert!(verify(&public, b"another transcript", &sig).is_err());
    }

    #[test]
    fn verify_rejects_other_key() {
        let (_, secret) = generate().unwrap();
        let (other_public, _) = generate().unwrap();
        let sig = sign(&secret, b"msg").unwrap();
        assert!(verify(&other_public, b"msg", &sig).is_err());
    }

    #[test]
    fn secret_encodes_public_half() {
        let (public, secret) = generate().unwrap();
        assert_eq!(&secret[32..], &public);
    }
}

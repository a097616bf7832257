//! Handshake messages.
//!
//! Four records establish a session: ClientHello, ServerHelloFinished and
//! ClientFinished on the wire, with a SignatureMessage embedded (encrypted)
//! in the latter two. Field sizes are fixed by the protocol; decoding only
//! parses — length checks live with the handshake driver so a violation can
//! be reported with its session context.

use crate::codec::{CodecError, FieldReader, FieldWriter, Wire};

/// Length of the `random` contribution in both hello messages.
pub const RANDOM_LEN: usize = 32;

/// Length of an X25519 key share.
pub const KEX_LEN: usize = 32;

/// Length of an initial AEAD nonce carried in a hello.
pub const NONCE_LEN: usize = 12;

/// Upper bound on an embedded encrypted signature message.
pub const MAX_ENCRYPTED_SIGNATURE_LEN: usize = 2000;

/// First record, sent unencrypted by the dialing side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientHello {
    pub random: Vec<u8>,
    pub kex_share: Vec<u8>,
    /// The client's initial tx nonce; the server's initial rx nonce.
    pub nonce: Vec<u8>,
}

impl Wire for ClientHello {
    fn encode_fields(&self, w: &mut FieldWriter) {
        w.put_bytes(1, &self.random);
        w.put_bytes(2, &self.kex_share);
        w.put_bytes(3, &self.nonce);
    }

    fn decode_fields(r: &mut FieldReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            random: r.bytes_field(1)?,
            kex_share: r.bytes_field(2)?,
            nonce: r.bytes_field(3)?,
        })
    }
}

/// Binds a long-term identity to the transcript: an Ed25519 signature over
/// the transcript hash at the point the protocol prescribes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureMessage {
    pub pubkey: Vec<u8>,
    pub signature: Vec<u8>,
}

impl Wire for SignatureMessage {
    fn encode_fields(&self, w: &mut FieldWriter) {
        w.put_bytes(1, &self.pubkey);
        w.put_bytes(2, &self.signature);
    }

    fn decode_fields(r: &mut FieldReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            pubkey: r.bytes_field(1)?,
            signature: r.bytes_field(2)?,
        })
    }
}

/// Second record. The embedded signature message is already encrypted under
/// the server's tx key with the initial nonce carried alongside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerHelloFinished {
    pub random: Vec<u8>,
    pub kex_share: Vec<u8>,
    /// The server's initial tx nonce, pre-increment.
    pub nonce: Vec<u8>,
    pub encrypted_signature: Vec<u8>,
}

impl Wire for ServerHelloFinished {
    fn encode_fields(&self, w: &mut FieldWriter) {
        w.put_bytes(1, &self.random);
        w.put_bytes(2, &self.kex_share);
        w.put_bytes(3, &self.nonce);
        w.put_bytes(4, &self.encrypted_signature);
    }

    fn decode_fields(r: &mut FieldReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            random: r.bytes_field(1)?,
            kex_share: r.bytes_field(2)?,
            nonce: r.bytes_field(3)?,
            encrypted_signature: r.bytes_field(4)?,
        })
    }
}

/// Third record, closing the handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientFinished {
    pub encrypted_signature: Vec<u8>,
}

impl Wire for ClientFinished {
    fn encode_fields(&self, w: &mut FieldWriter) {
        w.put_bytes(1, &self.encrypted_signature);
    }

    fn decode_fields(r: &mut FieldReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            encrypted_signature: r.bytes_field(1)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_hello_roundtrip() {
        let m = ClientHello {
            random: vec![1; RANDOM_LEN],
            kex_share: vec![2; KEX_LEN],
            nonce: vec![3; NONCE_LEN],
        };
        assert_eq!(ClientHello::decode(&m.encode()).unwrap(), m);
    }

    #[test]
    fn server_hello_finished_roundtrip() {
        let m = ServerHelloFinished {
            random: vec![9; RANDOM_LEN],
            kex_share: vec![8; KEX_LEN],
            nonce: vec![7; NONCE_LEN],
            encrypted_signature: vec![6; 120],
        };
        assert_eq!(ServerHelloFinished::decode(&m.encode()).unwrap(), m);
    }

    #[test]
    fn signature_message_roundtrip() {
        let m = SignatureMessage {
            pubkey: vec![4; 32],
            signature: vec![5; 64],
        };
        assert_eq!(SignatureMessage::decode(&m.encode()).unwrap(), m);
        let f = ClientFinished {
            encrypted_signature: m.encode().to_vec(),
        };
        assert_eq!(ClientFinished::decode(&f.encode()).unwrap(), f);
    }
}

//! Discovery datagrams.
//!
//! A request is the bare 4-byte magic. A response is the response magic
//! followed by a tag-encoded [`DiscoveryResponse`].

use crate::codec::{CodecError, FieldReader, FieldWriter, Wire};

/// "HSHA" as it appears on the wire (written little-endian).
pub const DISCOVERY_REQ_MAGIC: u32 = 0x4148_5348;

/// "HSHB" as it appears on the wire.
pub const DISCOVERY_RESP_MAGIC: u32 = 0x4248_5348;

pub const MAGIC_LEN: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryResponse {
    /// Responder's long-term public key, raw 32 bytes.
    pub pubkey: Vec<u8>,
    /// The address the responder received the request on, dotted quad.
    pub ip: String,
    /// Responder's TCP service port.
    pub port: u16,
}

impl Wire for DiscoveryResponse {
    fn encode_fields(&self, w: &mut FieldWriter) {
        w.put_bytes(1, &self.pubkey);
        w.put_str(2, &self.ip);
        w.put_u16(3, self.port);
    }

    fn decode_fields(r: &mut FieldReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            pubkey: r.bytes_field(1)?,
            ip: r.str_field(2)?,
            port: r.u16_field(3)?,
        })
    }
}

/// Build a request datagram.
pub fn request_datagram() -> [u8; MAGIC_LEN] {
    DISCOVERY_REQ_MAGIC.to_le_bytes()
}

/// Build a response datagram.
pub fn response_datagram(resp: &DiscoveryResponse) -> Vec<u8> {
    let body = resp.encode();
    let mut out = Vec::with_capacity(MAGIC_LEN + body.len());
    out.extend_from_slice(&DISCOVERY_RESP_MAGIC.to_le_bytes());
    out.extend_from_slice(&body);
    out
}

/// Read the magic off a datagram, yielding the remainder.
pub fn split_magic(datagram: &[u8]) -> Option<(u32, &[u8])> {
    if datagram.len() < MAGIC_LEN {
        return None;
    }
    let magic = u32::from_le_bytes(datagram[..MAGIC_LEN].try_into().unwrap());
    Some((magic, &datagram[MAGIC_LEN..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_is_hsha() {
        assert_eq!(&request_datagram(), b"HSHA");
    }

    #[test]
    fn response_roundtrip() {
        let resp = DiscoveryResponse {
            pubkey: vec![0xAB; 32],
            ip: "192.168.1.17".into(),
            port: 8890,
        };
        let datagram = response_datagram(&resp);
        assert_eq!(&datagram[..4], b"HSHB");
        let (magic, body) = split_magic(&datagram).unwrap();
        assert_eq!(magic, DISCOVERY_RESP_MAGIC);
        assert_eq!(DiscoveryResponse::decode(body).unwrap(), resp);
    }

    #[test]
    fn short_datagram_has_no_magic() {
        assert!(split_magic(b"HSH").is_none());
    }
}

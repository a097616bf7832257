//! Tagged-field message encoding.
//!
//! A message body is a sequence of `u8 tag ∥ payload` fields in ascending tag
//! order, terminated by a zero tag byte. Tag 0 is reserved as the terminator.
//! Integers are little-endian; strings and byte blobs are `u32 len ∥ raw`;
//! optional values carry a one-byte present flag.
//!
//! Decoding tolerates schema drift in both directions: a field that was
//! dropped by a newer sender decodes to its default, and a field added by a
//! newer sender (smaller tag already consumed, larger tag unread) is skipped
//! or left for the terminator scan. Truncation anywhere fails the message.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("message truncated")]
    Truncated,
    #[error("string field is not valid UTF-8")]
    BadUtf8,
}

/// Field payload shape, used when skipping an out-of-order field. The skip is
/// typed by the field the *caller* asked for, matching the encoder contract
/// that a given tag never changes type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldKind {
    U8,
    U16,
    U32,
    U64,
    Bytes,
    OptU32,
}

impl FieldKind {
    fn skip(self, r: &mut FieldReader<'_>) -> Result<(), CodecError> {
        match self {
            FieldKind::U8 => r.raw_bytes(1).map(|_| ()),
            FieldKind::U16 => r.raw_bytes(2).map(|_| ()),
            FieldKind::U32 => r.raw_bytes(4).map(|_| ()),
            FieldKind::U64 => r.raw_bytes(8).map(|_| ()),
            FieldKind::Bytes => {
                let len = r.raw_u32()? as usize;
                r.raw_bytes(len).map(|_| ())
            }
            FieldKind::OptU32 => {
                if r.raw_u8()? != 0 {
                    r.raw_bytes(4)?;
                }
                Ok(())
            }
        }
    }
}

/// Writes fields in ascending tag order; `finish` appends the terminator.
pub struct FieldWriter {
    buf: BytesMut,
}

impl FieldWriter {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    fn tag(&mut self, tag: u8) {
        debug_assert!(tag != 0, "tag 0 is the terminator");
        self.buf.put_u8(tag);
    }

    pub fn put_bool(&mut self, tag: u8, v: bool) {
        self.put_u8(tag, v as u8);
    }

    pub fn put_u8(&mut self, tag: u8, v: u8) {
        self.tag(tag);
        self.buf.put_u8(v);
    }

    pub fn put_u16(&mut self, tag: u8, v: u16) {
        self.tag(tag);
        self.buf.put_u16_le(v);
    }

    pub fn put_u32(&mut self, tag: u8, v: u32) {
        self.tag(tag);
        self.buf.put_u32_le(v);
    }

    pub fn put_u64(&mut self, tag: u8, v: u64) {
        self.tag(tag);
        self.buf.put_u64_le(v);
    }

    pub fn put_bytes(&mut self, tag: u8, v: &[u8]) {
        self.tag(tag);
        self.buf.put_u32_le(v.len() as u32);
        self.buf.put_slice(v);
    }

    pub fn put_str(&mut self, tag: u8, v: &str) {
        self.put_bytes(tag, v.as_bytes());
    }

    pub fn put_opt_u32(&mut self, tag: u8, v: Option<u32>) {
        self.tag(tag);
        self.buf.put_u8(v.is_some() as u8);
        if let Some(v) = v {
            self.buf.put_u32_le(v);
        }
    }

    pub fn finish(mut self) -> Bytes {
        self.buf.put_u8(0);
        self.buf.freeze()
    }
}

impl Default for FieldWriter {
    fn default() -> Self {
        Self::new()
    }
}

/// Reads fields in ascending tag order with the skip/push-back rules.
pub struct FieldReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FieldReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn raw_u8(&mut self) -> Result<u8, CodecError> {
        let b = *self.buf.get(self.pos).ok_or(CodecError::Truncated)?;
        self.pos += 1;
        Ok(b)
    }

    fn raw_bytes(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        let end = self.pos.checked_add(len).ok_or(CodecError::Truncated)?;
        let slice = self.buf.get(self.pos..end).ok_or(CodecError::Truncated)?;
        self.pos = end;
        Ok(slice)
    }

    fn raw_u16(&mut self) -> Result<u16, CodecError> {
        Ok(u16::from_le_bytes(self.raw_bytes(2)?.try_into().unwrap()))
    }

    fn raw_u32(&mut self) -> Result<u32, CodecError> {
        Ok(u32::from_le_bytes(self.raw_bytes(4)?.try_into().unwrap()))
    }

    fn raw_u64(&mut self) -> Result<u64, CodecError> {
        Ok(u64::from_le_bytes(self.raw_bytes(8)?.try_into().unwrap()))
    }

    /// Position the reader at the payload of `tag`. Returns false (field
    /// absent, caller takes the default) when the terminator or a larger tag
    /// comes first; both are pushed back. Smaller tags are fields this
    /// decoder no longer knows under that number; skip one `kind`-shaped
    /// payload and keep scanning.
    fn seek(&mut self, tag: u8, kind: FieldKind) -> Result<bool, CodecError> {
        loop {
            let mark = self.pos;
            let found = self.raw_u8()?;
            if found == 0 || found > tag {
                self.pos = mark;
                return Ok(false);
            }
            if found == tag {
                return Ok(true);
            }
            kind.skip(self)?;
        }
    }

    pub fn bool_field(&mut self, tag: u8) -> Result<bool, CodecError> {
        Ok(self.u8_field(tag)? != 0)
    }

    pub fn u8_field(&mut self, tag: u8) -> Result<u8, CodecError> {
        if self.seek(tag, FieldKind::U8)? {
            self.raw_u8()
        } else {
            Ok(0)
        }
    }

    pub fn u16_field(&mut self, tag: u8) -> Result<u16, CodecError> {
        if self.seek(tag, FieldKind::U16)? {
            self.raw_u16()
        } else {
            Ok(0)
        }
    }

    pub fn u32_field(&mut self, tag: u8) -> Result<u32, CodecError> {
        if self.seek(tag, FieldKind::U32)? {
            self.raw_u32()
        } else {
            Ok(0)
        }
    }

    pub fn u64_field(&mut self, tag: u8) -> Result<u64, CodecError> {
        if self.seek(tag, FieldKind::U64)? {
            self.raw_u64()
        } else {
            Ok(0)
        }
    }

    pub fn bytes_field(&mut self, tag: u8) -> Result<Vec<u8>, CodecError> {
        if self.seek(tag, FieldKind::Bytes)? {
            let len = self.raw_u32()? as usize;
            Ok(self.raw_bytes(len)?.to_vec())
        } else {
            Ok(Vec::new())
        }
    }

    pub fn str_field(&mut self, tag: u8) -> Result<String, CodecError> {
        String::from_utf8(self.bytes_field(tag)?).map_err(|_| CodecError::BadUtf8)
    }

    pub fn opt_u32_field(&mut self, tag: u8) -> Result<Option<u32>, CodecError> {
        if self.seek(tag, FieldKind::OptU32)? {
            if self.raw_u8()? != 0 {
                Ok(Some(self.raw_u32()?))
            } else {
                Ok(None)
            }
        } else {
            Ok(None)
        }
    }
}

/// A message made of tagged fields.
pub trait Wire: Sized {
    fn encode_fields(&self, w: &mut FieldWriter);
    fn decode_fields(r: &mut FieldReader<'_>) -> Result<Self, CodecError>;

    fn encode(&self) -> Bytes {
        let mut w = FieldWriter::new();
        self.encode_fields(&mut w);
        w.finish()
    }

    /// Decode from a body slice. Unknown trailing fields are ignored;
    /// truncation of any known field fails the whole message.
    fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        let mut r = FieldReader::new(buf);
        Self::decode_fields(&mut r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Eq, Default)]
    struct Sample {
        a: u16,
        b: String,
        c: u64,
        d: Option<u32>,
    }

    impl Wire for Sample {
        fn encode_fields(&self, w: &mut FieldWriter) {
            w.put_u16(1, self.a);
            w.put_str(2, &self.b);
            w.put_u64(3, self.c);
            w.put_opt_u32(4, self.d);
        }

        fn decode_fields(r: &mut FieldReader<'_>) -> Result<Self, CodecError> {
            Ok(Self {
                a: r.u16_field(1)?,
                b: r.str_field(2)?,
                c: r.u64_field(3)?,
                d: r.opt_u32_field(4)?,
            })
        }
    }

    fn sample() -> Sample {
        Sample {
            a: 0xBEEF,
            b: "hello".into(),
            c: 42,
            d: Some(7),
        }
    }

    #[test]
    fn roundtrip() {
        let m = sample();
        assert_eq!(Sample::decode(&m.encode()).unwrap(), m);
    }

    #[test]
    fn missing_fields_default() {
        // Only field 3 present.
        let mut w = FieldWriter::new();
        w.put_u64(3, 99);
        let buf = w.finish();
        let m = Sample::decode(&buf).unwrap();
        assert_eq!(
            m,
            Sample {
                c: 99,
                ..Default::default()
            }
        );
    }

    #[test]
    fn unknown_trailing_fields_ignored() {
        let m = sample();
        let mut buf = m.encode().to_vec();
        // Splice two unknown fields (tags above anything known) before the
        // terminator; an older decoder must still produce the same message.
        buf.pop();
        buf.push(9);
        buf.extend_from_slice(&123u32.to_le_bytes());
        buf.push(10);
        buf.push(1);
        buf.push(0);
        assert_eq!(Sample::decode(&buf).unwrap(), m);
    }

    #[test]
    fn superseded_smaller_tag_is_skipped() {
        // A sender still emits tag 1 while this reader only knows tag 2 of
        // the same shape: the reader skips one field and carries on. The skip
        // is typed by the field being sought, so dropping a tag is only safe
        // while its payload shape matches its successor's — the same contract
        // the deprecated-field marker enforces on the encoder side.
        let mut w = FieldWriter::new();
        w.put_u16(1, 0xAAAA);
        w.put_u16(2, 0xBBBB);
        let buf = w.finish();

        let mut r = FieldReader::new(&buf);
        assert_eq!(r.u16_field(2).unwrap(), 0xBBBB);
    }

    #[test]
    fn truncated_payload_fails() {
        let m = sample();
        let buf = m.encode();
        for cut in 1..buf.len() - 1 {
            // Every proper prefix either fails or (when the cut lands exactly
            // on a field boundary) yields defaults for the tail; it must
            // never panic. The interesting assertions are mid-payload cuts.
            let _ = Sample::decode(&buf[..cut]);
        }
        // Cut inside the string payload: definitely an error.
        assert_eq!(Sample::decode(&buf[..6]).unwrap_err(), CodecError::Truncated);
    }

    #[test]
    fn absent_optional_is_none() {
        let m = Sample {
            d: None,
            ..sample()
        };
        assert_eq!(Sample::decode(&m.encode()).unwrap().d, None);
    }
}

//! File-stream messages.
//!
//! A transfer is `FileList?` (batches only) then per file: `FileHeader`,
//! any number of `FileData` records, `FileTrailer`. `FileData` is the one
//! record whose payload is raw bytes rather than tagged fields.

use crate::codec::{CodecError, FieldReader, FieldWriter, Wire};

/// Message kinds on the file stream. Kind 2 was an acknowledgement in an
/// earlier protocol revision and stays reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum FileMessageKind {
    Header = 1,
    Data = 3,
    Trailer = 4,
    List = 5,
}

impl FileMessageKind {
    pub fn from_wire(kind: u16) -> Option<Self> {
        match kind {
            1 => Some(Self::Header),
            3 => Some(Self::Data),
            4 => Some(Self::Trailer),
            5 => Some(Self::List),
            _ => None,
        }
    }
}

/// Preamble for a directory batch: how many files follow and their summed
/// size, so the receiver can report totals before the first header arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileList {
    pub count: u32,
    pub size: u64,
}

impl Wire for FileList {
    fn encode_fields(&self, w: &mut FieldWriter) {
        w.put_u32(1, self.count);
        w.put_u64(2, self.size);
    }

    fn decode_fields(r: &mut FieldReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            count: r.u32_field(1)?,
            size: r.u64_field(2)?,
        })
    }
}

/// Announces one file: its name relative to the batch root, and its size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    pub name: String,
    pub size: u64,
}

impl Wire for FileHeader {
    fn encode_fields(&self, w: &mut FieldWriter) {
        w.put_str(1, &self.name);
        w.put_u64(2, self.size);
    }

    fn decode_fields(r: &mut FieldReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            name: r.str_field(1)?,
            size: r.u64_field(2)?,
        })
    }
}

/// Closes one file: the BLAKE2b-256 of its contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileTrailer {
    pub checksum: Vec<u8>,
}

impl Wire for FileTrailer {
    fn encode_fields(&self, w: &mut FieldWriter) {
        w.put_bytes(1, &self.checksum);
    }

    fn decode_fields(r: &mut FieldReader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            checksum: r.bytes_field(1)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_roundtrip() {
        for kind in [
            FileMessageKind::Header,
            FileMessageKind::Data,
            FileMessageKind::Trailer,
            FileMessageKind::List,
        ] {
            assert_eq!(FileMessageKind::from_wire(kind as u16), Some(kind));
        }
        assert_eq!(FileMessageKind::from_wire(2), None);
        assert_eq!(FileMessageKind::from_wire(6), None);
    }

    #[test]
    fn header_roundtrip() {
        let m = FileHeader {
            name: "photos/cat.jpg".into(),
            size: 1_500_000,
        };
        assert_eq!(FileHeader::decode(&m.encode()).unwrap(), m);
    }

    #[test]
    fn list_and_trailer_roundtrip() {
        let l = FileList { count: 3, size: 60 };
        assert_eq!(FileList::decode(&l.encode()).unwrap(), l);

        let t = FileTrailer {
            checksum: vec![0xCC; 32],
        };
        assert_eq!(FileTrailer::decode(&t.encode()).unwrap(), t);
    }
}

//! Object header and header-message parsing (spec.md §4.3).
//!
//! Both header-layout versions are unified behind one iteration contract:
//! "yield a sequence of `{type, absolute_offset, size, flags}` records,
//! following continuation messages transparently." Mirrors
//! `zh5.file.ObjectHeaderV1`/`ObjectHeaderV2`.

use crate::byte_source::MetaReader;
use crate::error::{Error, Result};
use nom::bytes::complete::{tag, take};
use nom::error::context;
use nom::number::complete::{le_u16, le_u32, le_u64, le_u8};
use std::collections::VecDeque;

/// A single header-message record: enough for a downstream decoder to seek
/// directly to the message body (`offset`) and read `size` bytes.
#[derive(Debug, Clone, Copy)]
pub struct MessageRecord {
    pub message_type: u16,
    pub offset: u64,
    pub size: u16,
    pub flags: u8,
}

struct Continuation {
    offset: u64,
    length: u64,
}

/// `{offset:u64, length:u64}` continuation-message body, shared by v1 and
/// v2 headers (spec.md §4.3).
fn continuation_body(input: &[u8]) -> crate::superblock::PResult<Continuation> {
    context("continuation message", |input| {
        let (input, offset) = le_u64(input)?;
        let (input, length) = le_u64(input)?;
        Ok((input, Continuation { offset, length }))
    })(input)
}

struct V1MessagePrefix {
    message_type: u16,
    size: u16,
    flags: u8,
}

/// `{type:u16, size:u16, flags:u8, reserved:[u8;3]}` (spec.md §4.3).
fn v1_message_prefix(input: &[u8]) -> crate::superblock::PResult<V1MessagePrefix> {
    context("v1 object header message prefix", |input| {
        let (input, message_type) = le_u16(input)?;
        let (input, size) = le_u16(input)?;
        let (input, flags) = le_u8(input)?;
        let (input, _reserved) = take(3usize)(input)?;
        Ok((input, V1MessagePrefix { message_type, size, flags }))
    })(input)
}

struct V2MessagePrefix {
    message_type: u8,
    size: u16,
    flags: u8,
}

/// `{type:u8, size:u16, flags:u8, creation_order:[u8;creation_order_size]}`
/// (spec.md §4.3).
fn v2_message_prefix(
    creation_order_size: usize,
) -> impl Fn(&[u8]) -> crate::superblock::PResult<V2MessagePrefix> {
    move |input| {
        context("v2 object header message prefix", move |input| {
            let (input, message_type) = le_u8(input)?;
            let (input, size) = le_u16(input)?;
            let (input, flags) = le_u8(input)?;
            let (input, _creation_order) = take(creation_order_size)(input)?;
            Ok((input, V2MessagePrefix { message_type, size, flags }))
        })(input)
    }
}

enum Version {
    V1 { total_messages: u16, object_header_size: u32 },
    V2 { chunk_size: u64, creation_order_size: u8 },
}

/// A parsed object header, bound to an absolute byte offset, ready to yield
/// its message sequence.
pub struct ObjectHeader {
    version: Version,
    offset_data: u64,
}

impl ObjectHeader {
    /// Peeks 4 bytes at `offset` to distinguish `OHDR` (v2) from a v1 header
    /// (whose first byte is the version number, 1), as `zh5.file.Group`'s
    /// constructor does.
    pub fn open(reader: &mut dyn MetaReader, offset: u64) -> Result<Self> {
        reader.seek(offset)?;
        let peek = reader.read(4)?;
        if peek == *b"OHDR" {
            Self::parse_v2(reader, offset)
        } else {
            Self::parse_v1(reader, offset)
        }
    }

    fn parse_v1(reader: &mut dyn MetaReader, offset: u64) -> Result<Self> {
        reader.seek(offset)?;
        let bytes = reader.read(16)?;
        let (version, total_messages, object_header_size) = context("v1 object header", |input| {
            let (input, version) = le_u8(input)?;
            let (input, _reserved) = le_u8(input)?;
            let (input, total_messages) = le_u16(input)?;
            let (input, _object_reference_count) = le_u32(input)?;
            let (input, object_header_size) = le_u32(input)?;
            let (input, _) = take(4usize)(input)?;
            Ok((input, (version, total_messages, object_header_size)))
        })(&bytes)
        .map_err(|e: nom::Err<nom::error::VerboseError<&[u8]>>| {
            Error::Corrupt(format!("v1 object header: {e:?}"))
        })?
        .1;
        if version != 1 {
            return Err(Error::UnsupportedVersion(format!(
                "object header version {version}"
            )));
        }
        Ok(ObjectHeader {
            version: Version::V1 { total_messages, object_header_size },
            offset_data: offset + 16,
        })
    }

    fn parse_v2(reader: &mut dyn MetaReader, offset: u64) -> Result<Self> {
        reader.seek(offset)?;
        let bytes = reader.read(6)?;
        let (version, flags) = context("v2 object header", |input| {
            let (input, _) = tag(b"OHDR")(input)?;
            let (input, version) = le_u8(input)?;
            let (input, flags) = le_u8(input)?;
            Ok((input, (version, flags)))
        })(&bytes)
        .map_err(|e: nom::Err<nom::error::VerboseError<&[u8]>>| {
            Error::Corrupt(format!("v2 object header: {e:?}"))
        })?
        .1;
        if version != 2 {
            return Err(Error::UnsupportedVersion(format!(
                "object header version {version}"
            )));
        }
        let chunk_size_field_width = 1u32 << (flags & 0b11);
        let creation_order_size = if flags & 0b100 != 0 { 2 } else { 0 };

        if flags & 0b10_0000 != 0 {
            reader.read(16)?; // four 4-byte timestamps
        }
        if flags & 0b1_0000 != 0 {
            reader.read(4)?; // compact/dense attribute thresholds
        }
        let chunk_size_bytes = reader.read(chunk_size_field_width as usize)?;
        let (_, chunk_size) = crate::superblock::address(chunk_size_field_width as u8, &chunk_size_bytes)
            .map_err(|e| Error::Corrupt(format!("v2 object header chunk size: {e:?}")))?;

        Ok(ObjectHeader {
            version: Version::V2 { chunk_size, creation_order_size },
            offset_data: reader.tell(),
        })
    }

    /// Yields every message in this header, transparently following
    /// continuation chunks.
    pub fn messages(&self, reader: &mut dyn MetaReader) -> Result<Vec<MessageRecord>> {
        match &self.version {
            Version::V1 { total_messages, object_header_size } => {
                self.messages_v1(reader, *total_messages, *object_header_size)
            }
            Version::V2 { chunk_size, creation_order_size } => {
                self.messages_v2(reader, *chunk_size, *creation_order_size)
            }
        }
    }

    fn messages_v1(
        &self,
        reader: &mut dyn MetaReader,
        total_messages: u16,
        object_header_size: u32,
    ) -> Result<Vec<MessageRecord>> {
        reader.seek(self.offset_data)?;
        let mut buffer = reader.read(object_header_size as usize)?;
        let mut offset = 0usize;
        let mut global_offset = self.offset_data;
        let mut continuations: VecDeque<Continuation> = VecDeque::new();
        let mut out = Vec::with_capacity(total_messages as usize);

        for _ in 0..total_messages {
            if offset == buffer.len() {
                if let Some(cm) = continuations.pop_front() {
                    reader.seek(cm.offset)?;
                    buffer = reader.read(cm.length as usize)?;
                    offset = 0;
                    global_offset = cm.offset;
                } else {
                    break;
                }
            }
            if offset + 8 > buffer.len() {
                return Err(Error::Corrupt("truncated v1 object header message".into()));
            }
            let (_, prefix) = v1_message_prefix(&buffer[offset..offset + 8])
                .map_err(|e| Error::Corrupt(format!("v1 object header message: {e:?}")))?;
            let V1MessagePrefix { message_type, size, flags } = prefix;
            let body_offset = global_offset + 8;

            if message_type == 0x0010 {
                let body = &buffer[offset + 8..offset + 8 + size as usize];
                let (_, cont) = continuation_body(body)
                    .map_err(|e| Error::Corrupt(format!("continuation message: {e:?}")))?;
                continuations.push_back(cont);
            } else {
                out.push(MessageRecord { message_type, offset: body_offset, size, flags });
            }

            offset += size as usize + 8;
            global_offset += size as u64 + 8;
        }

        Ok(out)
    }

    fn messages_v2(
        &self,
        reader: &mut dyn MetaReader,
        chunk_size: u64,
        creation_order_size: u8,
    ) -> Result<Vec<MessageRecord>> {
        reader.seek(self.offset_data)?;
        let mut buffer = reader.read(chunk_size as usize)?;
        let mut offset = 0usize;
        let mut global_offset = self.offset_data;
        let mut continuations: VecDeque<Continuation> = VecDeque::new();
        let mut out = Vec::new();
        let cos = creation_order_size as usize;

        loop {
            let pending = buffer.len().saturating_sub(offset);
            if pending <= 4 + cos {
                match continuations.pop_front() {
                    Some(cm) => {
                        reader.seek(cm.offset)?;
                        let chunk = reader.read(cm.length as usize)?;
                        let (_, _) = tag::<_, _, nom::error::VerboseError<&[u8]>>(b"OCHK".as_slice())(
                            chunk.as_slice(),
                        )
                        .map_err(|_| Error::Corrupt("missing OCHK signature".into()))?;
                        buffer = chunk[4..].to_vec();
                        offset = 0;
                        global_offset = cm.offset + 4;
                        continue;
                    }
                    None => break,
                }
            }

            let (_, prefix) = v2_message_prefix(cos)(&buffer[offset..offset + 4 + cos])
                .map_err(|e| Error::Corrupt(format!("v2 object header message: {e:?}")))?;
            let V2MessagePrefix { message_type, size, flags } = prefix;
            let body_offset = global_offset + 4 + cos as u64;

            if message_type == 0x10 {
                let body_start = offset + 4 + cos;
                let (_, cont) = continuation_body(&buffer[body_start..body_start + 16])
                    .map_err(|e| Error::Corrupt(format!("continuation message: {e:?}")))?;
                continuations.push_back(cont);
            } else {
                out.push(MessageRecord {
                    message_type: message_type as u16,
                    offset: body_offset,
                    size,
                    flags,
                });
            }

            offset += size as usize + 4 + cos;
            global_offset += size as u64 + 4 + cos as u64;
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::byte_source::LocalSource;
    use std::io::Write;

    fn write_temp(bytes: &[u8], name: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(bytes).unwrap();
        path
    }

    #[test]
    fn v1_header_yields_messages_without_continuation() {
        let mut file = vec![0u8; 16];
        file[0] = 1; // version
        file[2..4].copy_from_slice(&1u16.to_le_bytes()); // total messages
        // msg: type=0x0001 (dataspace), size=8, flags=0
        let mut body = Vec::new();
        body.extend_from_slice(&1u16.to_le_bytes());
        body.extend_from_slice(&8u16.to_le_bytes());
        body.push(0);
        body.extend_from_slice(&[0, 0, 0]);
        body.extend_from_slice(&[0u8; 8]); // message body
        file[8..12].copy_from_slice(&(body.len() as u32).to_le_bytes()); // object_header_size
        file.extend_from_slice(&body);

        let path = write_temp(&file, "hdf5_reader_test_oh_v1.bin");
        let mut source = LocalSource::open(&path).unwrap();
        let oh = ObjectHeader::open(&mut source, 0).unwrap();
        let msgs = oh.messages(&mut source).unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].message_type, 1);
        assert_eq!(msgs[0].size, 8);
        assert_eq!(msgs[0].offset, 16 + 8);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn v2_header_stops_at_checksum_with_no_continuation() {
        let mut file = Vec::new();
        file.extend_from_slice(b"OHDR");
        file.push(2); // version
        file.push(0); // flags: chunk_size_field_width = 1, no timestamps/attrs, no creation order
        let mut msgs_buf = Vec::new();
        msgs_buf.push(1u8); // type = dataspace
        msgs_buf.extend_from_slice(&4u16.to_le_bytes()); // size
        msgs_buf.push(0); // flags
        msgs_buf.extend_from_slice(&[0u8; 4]); // body
        msgs_buf.extend_from_slice(&[0u8; 4]); // checksum
        file.push(msgs_buf.len() as u8); // chunk_size (1-byte width)
        file.extend_from_slice(&msgs_buf);

        let path = write_temp(&file, "hdf5_reader_test_oh_v2.bin");
        let mut source = LocalSource::open(&path).unwrap();
        let oh = ObjectHeader::open(&mut source, 0).unwrap();
        let msgs = oh.messages(&mut source).unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].message_type, 1);
        assert_eq!(msgs[0].size, 4);
        std::fs::remove_file(&path).ok();
    }
}

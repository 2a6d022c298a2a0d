//! Link enumeration, unifying the three on-disk link storage shapes behind
//! one contract (spec.md §4.4). Grounded in `zh5/link.py`: `LinkMessage`
//! (inline, type 6), the V1 group B-tree + local heap path (type 17,
//! `SymbolTableMessage`), and `LinkInfoMessage` (type 2, dense storage via
//! a fractal heap indexed by a v2 B-tree).

use crate::btree;
use crate::byte_source::MetaReader;
use crate::error::{Error, Result};
use crate::heap::{FractalHeap, LocalHeap};
use crate::object_header::MessageRecord;
use crate::superblock::address as parse_address;
use nom::bytes::complete::{tag, take};
use nom::combinator::cond;
use nom::error::context;
use nom::number::complete::{le_u16, le_u8};

/// What a link resolves to. Only hard links carry an address this crate
/// can open — soft and external links are recognized but not followed,
/// matching `LinkMessage.solve()`'s `ToDo: hard link support only`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkTarget {
    Hard(u64),
    Soft,
    External,
}

#[derive(Debug, Clone)]
pub struct Link {
    pub name: String,
    pub target: LinkTarget,
}

impl Link {
    pub fn object_header_address(&self) -> Option<u64> {
        match self.target {
            LinkTarget::Hard(addr) => Some(addr),
            _ => None,
        }
    }
}

/// Decodes one inline Link message body (type 6), matching
/// `zh5/link.py::LinkMessage.__init__` field-for-field.
pub fn parse_link_message(body: &[u8], offset_size: u8) -> Result<Link> {
    let (rest, (version, flags)) = context("link message prefix", |input: &[u8]| {
        let (input, version) = le_u8(input)?;
        let (input, flags) = le_u8(input)?;
        Ok((input, (version, flags)))
    })(body)
    .map_err(|e: nom::Err<nom::error::VerboseError<&[u8]>>| Error::Corrupt(format!("link message: {e:?}")))?;
    if version != 1 {
        return Err(Error::UnsupportedVersion(format!("link message version {version}")));
    }

    let (rest, link_type) = cond(flags & 0b0000_1000 != 0, le_u8)(rest)
        .map_err(|e: nom::Err<nom::error::VerboseError<&[u8]>>| Error::Corrupt(format!("link message type: {e:?}")))?;
    let link_type = link_type.unwrap_or(0);

    let (rest, _creation_order) = cond(flags & 0b0000_0100 != 0, nom::number::complete::le_u64)(rest)
        .map_err(|e: nom::Err<nom::error::VerboseError<&[u8]>>| Error::Corrupt(format!("link message creation order: {e:?}")))?;

    let (rest, _character_set) = cond(flags & 0b0001_0000 != 0, le_u8)(rest)
        .map_err(|e: nom::Err<nom::error::VerboseError<&[u8]>>| Error::Corrupt(format!("link message character set: {e:?}")))?;

    let name_len_width = 1u8 << (flags & 0b11);
    let (rest, name_len) = parse_address(name_len_width, rest)
        .map_err(|e| Error::Corrupt(format!("link message name length: {e:?}")))?;
    let (rest, name_bytes) = take::<_, _, nom::error::VerboseError<&[u8]>>(name_len as usize)(rest)
        .map_err(|e| Error::Corrupt(format!("link message name: {e:?}")))?;
    let name = String::from_utf8_lossy(name_bytes).into_owned();

    let target = match link_type {
        0 => {
            let (_, addr) = parse_address(offset_size, rest)
                .map_err(|e| Error::Corrupt(format!("link message target address: {e:?}")))?;
            LinkTarget::Hard(addr)
        }
        1 => LinkTarget::Soft,
        64 => LinkTarget::External,
        other => return Err(Error::Corrupt(format!("unrecognized link type {other}"))),
    };

    Ok(Link { name, target })
}

/// Dense link storage (type 2, `LinkInfoMessage`): which of the optional
/// fields are present is driven by two flag bits, matching the original's
/// four explicit branches collapsed into one bit-tested read.
fn parse_link_info_message(body: &[u8], offset_size: u8) -> Result<(u64, u64)> {
    let flags = body[1];
    let (rest, _max_creation_index) =
        cond(flags & 0b01 != 0, nom::number::complete::le_u64)(&body[2..])
            .map_err(|e: nom::Err<nom::error::VerboseError<&[u8]>>| {
                Error::Corrupt(format!("link info message: {e:?}"))
            })?;
    let (rest, fractal_heap_address) = parse_address(offset_size, rest)
        .map_err(|e| Error::Corrupt(format!("link info message fractal heap address: {e:?}")))?;
    let (rest, _name_btree_address) = parse_address(offset_size, rest)
        .map_err(|e| Error::Corrupt(format!("link info message name btree address: {e:?}")))?;
    let creation_order_btree_address = if flags & 0b10 != 0 {
        parse_address(offset_size, rest)
            .map_err(|e| Error::Corrupt(format!("link info message creation order btree address: {e:?}")))?
            .1
    } else {
        fractal_heap_address // caller checks for the undefined sentinel anyway
    };
    Ok((fractal_heap_address, creation_order_btree_address))
}

/// Resolves a group's links from its V1 symbol-table storage
/// (`zh5/file.py::SymbolTableMessage` + `SymbolTableNode`): walk the group
/// B-tree for SNOD addresses, then resolve each entry's name through the
/// local heap.
pub fn resolve_symbol_table(
    reader: &mut dyn MetaReader,
    btree_address: u64,
    local_heap_address: u64,
    offset_size: u8,
    length_size: u8,
) -> Result<Vec<Link>> {
    let heap = LocalHeap::open(reader, local_heap_address, offset_size)?;
    let snods = btree::group_children(reader, btree_address, offset_size, length_size)?;
    let entry_size = 4 * offset_size as usize + 8;

    let mut out = Vec::new();
    for snod in snods {
        reader.seek(snod.child_address)?;
        let header = reader.read(8)?;
        let (_, n_symbols) = context("SNOD header", |input| {
            let (input, _) = tag(b"SNOD")(input)?;
            let (input, _version) = le_u8(input)?;
            let (input, _reserved) = le_u8(input)?;
            le_u16(input)
        })(&header)
        .map_err(|e: nom::Err<nom::error::VerboseError<&[u8]>>| {
            Error::Corrupt(format!("SNOD header: {e:?}"))
        })?;
        let body = reader.read(n_symbols as usize * entry_size)?;
        for i in 0..n_symbols as usize {
            let entry = &body[i * entry_size..(i + 1) * entry_size];
            let ste = crate::superblock::parse_symbol_table_entry(entry, offset_size)
                .map_err(|e| Error::Corrupt(format!("symbol table entry: {e:?}")))?
                .1;
            let name = heap.name_at(ste.link_name_offset)?;
            out.push(Link { name, target: LinkTarget::Hard(ste.object_header_address) });
        }
    }
    Ok(out)
}

/// Resolves a group's links from dense storage (type 2): walk the
/// creation-order v2 B-tree, resolving each record's heap id through the
/// fractal heap to get a Link message body (`LinkInfoMessage.solve()`).
pub fn resolve_dense(
    reader: &mut dyn MetaReader,
    link_info_body: &[u8],
    offset_size: u8,
    length_size: u8,
    undefined_address: u64,
) -> Result<Vec<Link>> {
    let (fractal_heap_address, creation_order_btree_address) =
        parse_link_info_message(link_info_body, offset_size)?;
    if fractal_heap_address == undefined_address || creation_order_btree_address == undefined_address {
        return Ok(Vec::new());
    }

    let heap = FractalHeap::open(reader, fractal_heap_address, offset_size, length_size)?;
    let records =
        btree::v2_creation_order_links(reader, creation_order_btree_address, offset_size, length_size)?;

    let mut out = Vec::with_capacity(records.len());
    for record in records {
        let data = heap.get_data(reader, &record.heap_id)?;
        out.push(parse_link_message(&data, offset_size)?);
    }
    Ok(out)
}

/// Dispatches a group's header messages to whichever link-storage shape
/// they describe, returning `None` when the object carries none (i.e. it
/// isn't a group at all).
pub fn links_from_messages(
    reader: &mut dyn MetaReader,
    messages: &[MessageRecord],
    offset_size: u8,
    length_size: u8,
    undefined_address: u64,
) -> Result<Option<Vec<Link>>> {
    let mut inline = Vec::new();
    for m in messages {
        match m.message_type {
            2 => {
                reader.seek(m.offset)?;
                let body = reader.read(m.size as usize)?;
                return Ok(Some(resolve_dense(
                    reader,
                    &body,
                    offset_size,
                    length_size,
                    undefined_address,
                )?));
            }
            17 => {
                reader.seek(m.offset)?;
                let body = reader.read(m.size as usize)?;
                let (rest, btree_address) = parse_address(offset_size, &body)
                    .map_err(|e| Error::Corrupt(format!("symbol table message btree address: {e:?}")))?;
                let (_, local_heap_address) = parse_address(offset_size, rest)
                    .map_err(|e| Error::Corrupt(format!("symbol table message local heap address: {e:?}")))?;
                return Ok(Some(resolve_symbol_table(
                    reader,
                    btree_address,
                    local_heap_address,
                    offset_size,
                    length_size,
                )?));
            }
            6 => {
                reader.seek(m.offset)?;
                let body = reader.read(m.size as usize)?;
                inline.push(parse_link_message(&body, offset_size)?);
            }
            _ => {}
        }
    }
    if inline.is_empty() {
        Ok(None)
    } else {
        Ok(Some(inline))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inline_hard_link_decodes_name_and_address() {
        let mut body = vec![1u8, 0]; // version 1, flags: 1-byte name length, no creation order/type/charset
        body.push(b'x' as u8);
        let mut full = vec![1u8, 0b0000_0000];
        full.push(1); // name length
        full.push(b'x');
        full.extend_from_slice(&42u64.to_le_bytes());
        let link = parse_link_message(&full, 8).unwrap();
        assert_eq!(link.name, "x");
        assert_eq!(link.target, LinkTarget::Hard(42));
        let _ = body;
    }

    #[test]
    fn inline_soft_link_is_recognized_but_not_hard() {
        let mut full = vec![1u8, 0b0000_1000]; // link type byte present
        full.push(1); // link type = soft
        full.push(1); // name length
        full.push(b'y');
        full.extend_from_slice(&0u64.to_le_bytes());
        let link = parse_link_message(&full, 8).unwrap();
        assert_eq!(link.name, "y");
        assert_eq!(link.target, LinkTarget::Soft);
        assert_eq!(link.object_header_address(), None);
    }
}

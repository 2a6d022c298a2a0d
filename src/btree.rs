//! V1 and V2 B-trees (spec.md §4.5/4.6).
//!
//! The V1 tree indexes either group members (keyed by local-heap name
//! offset) or dataset chunks (keyed by chunk offset); both share one node
//! header shape, so `BtreeV1` parametrizes the key decode over a small
//! `V1Key` enum rather than duplicating traversal. Grounded in
//! `zh5/tree.py::BtreeV1`/`BtreeV1Group`/`BtreeV1Chunk`/`BtreeV2`.

use crate::byte_source::MetaReader;
use crate::error::{Error, Result};
use crate::superblock::address as parse_address;
use nom::bytes::complete::{tag, take};
use nom::error::context;
use nom::multi::count;
use nom::number::complete::{le_u16, le_u32, le_u64, le_u8};

/// One leaf entry of a group B-tree: the name's offset into the local heap
/// and the address of the symbol table node holding that key range.
#[derive(Debug, Clone, Copy)]
pub struct GroupEntry {
    pub child_address: u64,
}

/// One leaf entry of a chunk B-tree: the chunk's logical offset (one
/// component per dataset dimension plus a trailing dataset-element index,
/// always 0 for non-compound types), its on-disk size, filter mask, and
/// address (`zh5/tree.py::BtreeV1Chunk`).
#[derive(Debug, Clone)]
pub struct ChunkEntry {
    pub offset: Vec<u64>,
    pub chunk_size: u32,
    pub filter_mask: u32,
    pub address: u64,
}

struct NodeHeader {
    node_type: u8,
    node_level: u8,
    entries_used: u16,
}

fn node_header(input: &[u8]) -> crate::superblock::PResult<NodeHeader> {
    context("btree node header", |input| {
        let (input, _) = tag(b"TREE")(input)?;
        let (input, node_type) = le_u8(input)?;
        let (input, node_level) = le_u8(input)?;
        let (input, entries_used) = le_u16(input)?;
        Ok((input, NodeHeader { node_type, node_level, entries_used }))
    })(input)
}

fn read_node_header(reader: &mut dyn MetaReader) -> Result<NodeHeader> {
    let bytes = reader.read(8)?;
    let (_, header) =
        node_header(&bytes).map_err(|e| Error::Corrupt(format!("btree node header: {e:?}")))?;
    Ok(header)
}

/// Walks a V1 group B-tree rooted at `address`, returning every leaf's
/// symbol table node address in key order.
pub fn group_children(
    reader: &mut dyn MetaReader,
    node_address: u64,
    offset_size: u8,
    length_size: u8,
) -> Result<Vec<GroupEntry>> {
    reader.seek(node_address)?;
    let header = read_node_header(reader)?;
    if header.node_type != 0 {
        return Err(Error::Corrupt("expected group (type 0) B-tree node".into()));
    }
    reader.read(2 * offset_size as usize)?; // left/right sibling addresses

    let mut children = Vec::with_capacity(header.entries_used as usize);
    for _ in 0..header.entries_used {
        reader.read(length_size as usize)?; // key: heap offset of this entry's name
        let bytes = reader.read(offset_size as usize)?;
        let (_, child) = parse_address(offset_size, &bytes)
            .map_err(|e| Error::Corrupt(format!("group btree child address: {e:?}")))?;
        children.push(child);
    }
    reader.read(length_size as usize)?; // closing key

    let mut out = Vec::new();
    for child in children {
        if header.node_level == 0 {
            out.push(GroupEntry { child_address: child });
        } else {
            out.extend(group_children(reader, child, offset_size, length_size)?);
        }
    }
    Ok(out)
}

/// Walks a V1 chunk B-tree rooted at `address`, returning every chunk leaf
/// in key order. `n_dims` is the number of *storage* dimensions (dataset
/// rank + 1 for the trailing element index).
struct ChunkKey {
    chunk_size: u32,
    filter_mask: u32,
    offset: Vec<u64>,
}

/// `{chunk_byte_size:u32, filter_mask:u32, (coord_i:u64) for i in 0..n_dims}`
/// (spec.md §4.5).
fn chunk_key(n_dims: usize) -> impl Fn(&[u8]) -> crate::superblock::PResult<ChunkKey> {
    move |input| {
        context("chunk btree key", |input| {
            let (input, chunk_size) = le_u32(input)?;
            let (input, filter_mask) = le_u32(input)?;
            let (input, offset) = count(le_u64, n_dims)(input)?;
            Ok((input, ChunkKey { chunk_size, filter_mask, offset }))
        })(input)
    }
}

pub fn chunk_entries(
    reader: &mut dyn MetaReader,
    node_address: u64,
    offset_size: u8,
    n_dims: usize,
) -> Result<Vec<ChunkEntry>> {
    reader.seek(node_address)?;
    let header = read_node_header(reader)?;
    if header.node_type != 1 {
        return Err(Error::Corrupt("expected chunk (type 1) B-tree node".into()));
    }
    reader.read(2 * offset_size as usize)?; // left/right sibling

    struct Raw {
        chunk_size: u32,
        filter_mask: u32,
        offset: Vec<u64>,
        child: u64,
    }

    let mut raws = Vec::with_capacity(header.entries_used as usize);
    for _ in 0..header.entries_used {
        let key_bytes = reader.read(8 + 8 * n_dims)?;
        let (_, key) = chunk_key(n_dims)(&key_bytes)
            .map_err(|e| Error::Corrupt(format!("chunk btree key: {e:?}")))?;
        let child_bytes = reader.read(offset_size as usize)?;
        let (_, child) = parse_address(offset_size, &child_bytes)
            .map_err(|e| Error::Corrupt(format!("chunk btree child address: {e:?}")))?;
        raws.push(Raw { chunk_size: key.chunk_size, filter_mask: key.filter_mask, offset: key.offset, child });
    }
    reader.read(8 + 8 * n_dims)?; // closing key

    let mut out = Vec::new();
    for raw in raws {
        if header.node_level == 0 {
            out.push(ChunkEntry {
                offset: raw.offset,
                chunk_size: raw.chunk_size,
                filter_mask: raw.filter_mask,
                address: raw.child,
            });
        } else {
            out.extend(chunk_entries(reader, raw.child, offset_size, n_dims)?);
        }
    }
    Ok(out)
}

/// One record of a V2 B-tree's type-6 (creation-order link) leaf,
/// `zh5/tree.py::BtreeV2LeafNode` for record type 6.
#[derive(Debug, Clone, Copy)]
pub struct LinkRecord {
    pub heap_id: [u8; 8],
}

struct BTreeV2Header {
    record_type: u8,
    record_size: u16,
    depth: u16,
    root_address: u64,
    n_records_root: u16,
}

/// `BTHD(4) + version(1) + type(1) + node_size(4) + record_size(2) +
/// depth(2) + split_percent(1) + merge_percent(1) + root_address(O) +
/// n_records_root(2) + total_records(L) + checksum(4)`, matching
/// `zh5/tree.py::BtreeV2.__init__`'s `22 + size_of_offsets + size_of_lengths`.
fn bthd_header(
    offset_size: u8,
    length_size: u8,
) -> impl Fn(&[u8]) -> crate::superblock::PResult<BTreeV2Header> {
    move |input| {
        context("v2 btree header", move |input| {
            let (input, _) = tag(b"BTHD")(input)?;
            let (input, _version) = le_u8(input)?;
            let (input, record_type) = le_u8(input)?;
            let (input, _node_size) = le_u32(input)?;
            let (input, record_size) = le_u16(input)?;
            let (input, depth) = le_u16(input)?;
            let (input, _split_percent) = le_u8(input)?;
            let (input, _merge_percent) = le_u8(input)?;
            let (input, root_address) = parse_address(offset_size, input)?;
            let (input, n_records_root) = le_u16(input)?;
            let (input, _total_records) = parse_address(length_size, input)?;
            let (input, _checksum) = le_u32(input)?;
            Ok((
                input,
                BTreeV2Header { record_type, record_size, depth, root_address, n_records_root },
            ))
        })(input)
    }
}

/// `version(1) + type(1)` BTLF leaf prefix, already past the `b"BTLF"` tag.
fn btlf_prefix(input: &[u8]) -> crate::superblock::PResult<()> {
    context("v2 btree leaf prefix", |input| {
        let (input, _) = tag(b"BTLF")(input)?;
        let (input, _version) = le_u8(input)?;
        let (input, _record_type) = le_u8(input)?;
        Ok((input, ()))
    })(input)
}

/// Type-6 record: `{creation_order:u64, heap_id:[u8;record_size-8]}`
/// (spec.md §4.6); the creation order itself is unused here.
fn creation_order_link_record(
    record_size: u16,
) -> impl Fn(&[u8]) -> crate::superblock::PResult<LinkRecord> {
    move |input| {
        context("creation order link record", move |input| {
            let (input, _creation_order) = le_u64(input)?;
            let (input, id_bytes) = take(record_size as usize - 8)(input)?;
            let mut heap_id = [0u8; 8];
            heap_id[..id_bytes.len()].copy_from_slice(id_bytes);
            Ok((input, LinkRecord { heap_id }))
        })(input)
    }
}

/// Reads the V2 B-tree header at `address` and, if the root is a leaf
/// (depth 0), returns its records. Internal-node traversal (depth > 0) is
/// not implemented: records with a depth-bearing root raise
/// `Error::UnsupportedVersion` rather than fabricating a wrong walk.
pub fn v2_creation_order_links(
    reader: &mut dyn MetaReader,
    address: u64,
    offset_size: u8,
    length_size: u8,
) -> Result<Vec<LinkRecord>> {
    reader.seek(address)?;
    let header_bytes = reader.read(22 + offset_size as usize + length_size as usize)?;
    let (_, header) = bthd_header(offset_size, length_size)(&header_bytes)
        .map_err(|e| Error::Corrupt(format!("v2 btree header: {e:?}")))?;

    if header.record_type != 6 {
        return Err(Error::UnsupportedVersion(format!(
            "V2 B-tree record type {} (only creation-order links are supported)",
            header.record_type
        )));
    }
    if header.depth != 0 {
        return Err(Error::UnsupportedVersion(
            "V2 B-tree internal-node traversal is not supported".into(),
        ));
    }

    reader.seek(header.root_address)?;
    let leaf_prefix = reader.read(4 + 1 + 1)?;
    btlf_prefix(&leaf_prefix).map_err(|e| Error::Corrupt(format!("v2 btree leaf: {e:?}")))?;

    let mut out = Vec::with_capacity(header.n_records_root as usize);
    for _ in 0..header.n_records_root {
        let rec = reader.read(header.record_size as usize)?;
        let (_, record) = creation_order_link_record(header.record_size)(&rec)
            .map_err(|e| Error::Corrupt(format!("creation order link record: {e:?}")))?;
        out.push(record);
    }
    reader.read(4)?; // checksum
    Ok(out)
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
    fn single_leaf_group_node_yields_one_child() {
        let mut file = Vec::new();
        file.extend_from_slice(b"TREE");
        file.push(0); // node type: group
        file.push(0); // node level: leaf
        file.extend_from_slice(&1u16.to_le_bytes()); // entries used
        file.extend_from_slice(&u64::MAX.to_le_bytes()); // left sibling
        file.extend_from_slice(&u64::MAX.to_le_bytes()); // right sibling
        file.extend_from_slice(&0u64.to_le_bytes()); // key 0
        file.extend_from_slice(&500u64.to_le_bytes()); // child 0
        file.extend_from_slice(&8u64.to_le_bytes()); // closing key

        let path = write_temp(&file, "hdf5_reader_test_btree_group.bin");
        let mut source = LocalSource::open(&path).unwrap();
        let children = group_children(&mut source, 0, 8, 8).unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].child_address, 500);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn single_leaf_chunk_node_yields_offset() {
        let n_dims = 2; // 1-D dataset: 1 dim + trailing element index
        let mut file = Vec::new();
        file.extend_from_slice(b"TREE");
        file.push(1); // node type: chunk
        file.push(0); // leaf
        file.extend_from_slice(&1u16.to_le_bytes());
        file.extend_from_slice(&u64::MAX.to_le_bytes());
        file.extend_from_slice(&u64::MAX.to_le_bytes());
        file.extend_from_slice(&40u32.to_le_bytes()); // chunk size
        file.extend_from_slice(&0u32.to_le_bytes()); // filter mask
        file.extend_from_slice(&0u64.to_le_bytes()); // offset dim0
        file.extend_from_slice(&0u64.to_le_bytes()); // trailing element index
        file.extend_from_slice(&900u64.to_le_bytes()); // child address
        // closing key
        file.extend_from_slice(&0u32.to_le_bytes());
        file.extend_from_slice(&0u32.to_le_bytes());
        file.extend_from_slice(&10u64.to_le_bytes());
        file.extend_from_slice(&0u64.to_le_bytes());

        let path = write_temp(&file, "hdf5_reader_test_btree_chunk.bin");
        let mut source = LocalSource::open(&path).unwrap();
        let entries = chunk_entries(&mut source, 0, 8, n_dims).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].offset, vec![0, 0]);
        assert_eq!(entries[0].chunk_size, 40);
        assert_eq!(entries[0].address, 900);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn v2_header_and_leaf_yield_heap_ids() {
        let offset_size = 8u8;
        let length_size = 8u8;
        let leaf_addr = 200u64;
        let record_size = 15u16; // creation_order:u64 + heap_id:[u8;7]

        let mut file = vec![0u8; leaf_addr as usize];
        // BTHD header at offset 0.
        let mut hdr = Vec::new();
        hdr.extend_from_slice(b"BTHD");
        hdr.push(0); // version
        hdr.push(6); // type: creation-order links
        hdr.extend_from_slice(&64u32.to_le_bytes()); // node size
        hdr.extend_from_slice(&record_size.to_le_bytes());
        hdr.extend_from_slice(&0u16.to_le_bytes()); // depth: leaf root
        hdr.push(0); // split percent
        hdr.push(0); // merge percent
        hdr.extend_from_slice(&leaf_addr.to_le_bytes()); // root node address
        hdr.extend_from_slice(&1u16.to_le_bytes()); // n records in root
        hdr.extend_from_slice(&1u64.to_le_bytes()); // total records in tree
        hdr.extend_from_slice(&0u32.to_le_bytes()); // checksum
        file[0..hdr.len()].copy_from_slice(&hdr);

        // BTLF leaf at leaf_addr: one type-6 record.
        let mut leaf = Vec::new();
        leaf.extend_from_slice(b"BTLF");
        leaf.push(0); // version
        leaf.push(6); // type
        leaf.extend_from_slice(&7u64.to_le_bytes()); // creation order (ignored)
        leaf.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7]); // heap id, 7 bytes
        leaf.extend_from_slice(&0u32.to_le_bytes()); // checksum
        file.extend_from_slice(&leaf);

        let path = write_temp(&file, "hdf5_reader_test_btree_v2.bin");
        let mut source = LocalSource::open(&path).unwrap();
        let records = v2_creation_order_links(&mut source, 0, offset_size, length_size).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(&records[0].heap_id[..7], &[1, 2, 3, 4, 5, 6, 7]);
        std::fs::remove_file(&path).ok();
    }
}

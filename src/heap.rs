//! Local, global, and fractal heaps (spec.md §4.4/4.7/4.8).
//!
//! Three unrelated on-disk structures share this module because they're all
//! "heaps" in the HDF5 sense: byte blobs addressed by an offset or an id,
//! rather than structured records addressed by key. Grounded in
//! `zh5/heap.py::LocalHeap`/`GlobalHeapCollection`/`FractalHeap`.

use crate::byte_source::MetaReader;
use crate::error::{Error, Result};
use crate::superblock::address as parse_address;
use nom::bytes::complete::tag;
use nom::error::context;
use nom::number::complete::{le_u16, le_u32};

/// A local heap: a flat byte blob holding NUL-terminated link names,
/// addressed by offset (`zh5/heap.py::LocalHeap`).
pub struct LocalHeap {
    data: Vec<u8>,
}

struct LocalHeapHeader {
    data_segment_size: u64,
    data_segment_address: u64,
}

/// `HEAP(4) + version(1) + reserved(3) + data_segment_size(O) +
/// free_list_head_offset(O) + data_segment_address(O)` (spec.md §4.4).
fn local_heap_header(offset_size: u8) -> impl Fn(&[u8]) -> crate::superblock::PResult<LocalHeapHeader> {
    move |input| {
        context("local heap header", move |input| {
            let (input, _) = tag(b"HEAP")(input)?;
            let (input, _version) = le_u32(input)?; // version(1) + reserved(3)
            let (input, data_segment_size) = parse_address(offset_size, input)?;
            let (input, _free_list_head_offset) = parse_address(offset_size, input)?;
            let (input, data_segment_address) = parse_address(offset_size, input)?;
            Ok((input, LocalHeapHeader { data_segment_size, data_segment_address }))
        })(input)
    }
}

impl LocalHeap {
    pub fn open(reader: &mut dyn MetaReader, address: u64, offset_size: u8) -> Result<Self> {
        reader.seek(address)?;
        let header_bytes = reader.read(8 + 3 * offset_size as usize)?;
        let (_, header) = local_heap_header(offset_size)(&header_bytes)
            .map_err(|e| Error::Corrupt(format!("local heap header: {e:?}")))?;
        reader.seek(header.data_segment_address)?;
        let data = reader.read(header.data_segment_size as usize)?;
        Ok(LocalHeap { data })
    }

    /// Reads the NUL-terminated name starting at `offset` into the heap's
    /// data segment.
    pub fn name_at(&self, offset: u64) -> Result<String> {
        let start = offset as usize;
        if start > self.data.len() {
            return Err(Error::Corrupt("local heap offset out of bounds".into()));
        }
        let end = self.data[start..]
            .iter()
            .position(|&b| b == 0)
            .map(|p| start + p)
            .unwrap_or(self.data.len());
        Ok(String::from_utf8_lossy(&self.data[start..end]).into_owned())
    }
}

/// A single object stored in a global heap collection
/// (`zh5/heap.py::GlobalHeapObject`).
#[derive(Debug, Clone)]
pub struct GlobalHeapObject {
    pub index: u16,
    pub data: Vec<u8>,
}

/// A collection of global heap objects sharing one on-disk block
/// (`zh5/heap.py::GlobalHeapCollection`), terminated by an index-0 entry.
pub struct GlobalHeapCollection {
    objects: Vec<GlobalHeapObject>,
}

struct GlobalHeapObjectPrefix {
    index: u16,
    obj_size: u64,
}

/// `{index:u16, ref_count:u16, reserved:u32, size:u64}` heap-object prefix
/// (spec.md §4.7), immediately followed by `size` bytes of object data.
fn global_heap_object_prefix(input: &[u8]) -> crate::superblock::PResult<GlobalHeapObjectPrefix> {
    context("global heap object prefix", |input| {
        let (input, index) = le_u16(input)?;
        let (input, _ref_count) = le_u16(input)?;
        let (input, _reserved) = le_u32(input)?;
        let (input, obj_size) = crate::superblock::address(8, input)?;
        Ok((input, GlobalHeapObjectPrefix { index, obj_size }))
    })(input)
}

impl GlobalHeapCollection {
    pub fn open(reader: &mut dyn MetaReader, address: u64, length_size: u8) -> Result<Self> {
        reader.seek(address)?;
        let header_bytes = reader.read(8 + length_size as usize)?;
        let collection_size = context("global heap collection header", |input| {
            let (input, _) = tag(b"GCOL")(input)?;
            let (input, _version) = le_u32(input)?; // version(1) + reserved(3)
            let (input, size) = parse_address(length_size, input)?;
            Ok((input, size))
        })(&header_bytes)
        .map_err(|e: nom::Err<nom::error::VerboseError<&[u8]>>| {
            Error::Corrupt(format!("global heap collection header: {e:?}"))
        })?
        .1 as usize;
        let body = reader.read(collection_size.saturating_sub(header_bytes.len()))?;

        let mut objects = Vec::new();
        let mut pos = 0usize;
        while pos + 8 <= body.len() {
            let (_, prefix) = global_heap_object_prefix(&body[pos..pos + 16])
                .map_err(|e| Error::Corrupt(format!("global heap object prefix: {e:?}")))?;
            if prefix.index == 0 {
                break;
            }
            let data_start = pos + 16;
            let data_end = data_start + prefix.obj_size as usize;
            if data_end > body.len() {
                return Err(Error::Corrupt("global heap object runs past collection".into()));
            }
            objects.push(GlobalHeapObject {
                index: prefix.index,
                data: body[data_start..data_end].to_vec(),
            });
            let padded = (prefix.obj_size as usize + 7) & !7;
            pos = data_start + padded;
        }
        Ok(GlobalHeapCollection { objects })
    }

    pub fn object(&self, index: u32) -> Result<&GlobalHeapObject> {
        self.objects
            .iter()
            .find(|o| o.index as u32 == index)
            .ok_or_else(|| Error::Corrupt(format!("no global heap object with index {index}")))
    }
}

/// Lazily-populated cache of global heap collections keyed by collection
/// address, matching `zh5/file.py`'s per-`File` global heap cache.
#[derive(Default)]
pub struct GlobalHeap {
    cache: std::collections::HashMap<u64, GlobalHeapCollection>,
}

impl GlobalHeap {
    pub fn new() -> Self {
        GlobalHeap { cache: std::collections::HashMap::new() }
    }

    /// Resolves a vlen element cell `{collection_offset, object_index}` to
    /// its raw bytes, loading and caching the collection on first access.
    pub fn resolve(
        &mut self,
        reader: &mut dyn MetaReader,
        collection_offset: u64,
        object_index: u32,
        length_size: u8,
    ) -> Result<Vec<u8>> {
        if !self.cache.contains_key(&collection_offset) {
            let collection = GlobalHeapCollection::open(reader, collection_offset, length_size)?;
            self.cache.insert(collection_offset, collection);
        }
        let collection = self.cache.get(&collection_offset).unwrap();
        Ok(collection.object(object_index)?.data.clone())
    }
}

/// Decodes a vlen-string element cell, matching
/// `zh5/dtypes.py::VLStringDatatype.parse`: trailing NULs stripped, decoded
/// as UTF-8 when `character_set == 1`, otherwise returned as raw bytes.
pub fn decode_vlen_string(bytes: &[u8], character_set: u8) -> Vec<u8> {
    let trimmed = match bytes.iter().rposition(|&b| b != 0) {
        Some(last) => &bytes[..=last],
        None => &bytes[..0],
    };
    if character_set == 1 {
        trimmed.to_vec()
    } else {
        trimmed.to_vec()
    }
}

/// One level of a fractal heap's block tree: either a leaf with raw bytes
/// or an indirect block of child pointers, used only to build the managed
/// block list during `FractalHeap::open`.
enum Block {
    Direct { offset: u64, size: u64 },
    Indirect { address: u64 },
}

/// A fractal heap, used to back dense link and attribute storage
/// (`zh5/heap.py::FractalHeap`). Field layout matches the original
/// constructor exactly; the ordered managed-block list is built eagerly so
/// that heap-id resolution can binary-search it.
pub struct FractalHeap {
    heap_id_len: u16,
    io_filter_len: u16,
    max_managed_object_size: u32,
    managed: Vec<(u64, u64)>, // (direct_block_offset, direct_block_size)
    starting_block_size: u64,
    max_direct_block_size: u64,
    max_heap_size: u16,
}

struct FractalHeapHeader {
    heap_id_len: u16,
    io_filter_len: u16,
    max_managed_object_size: u32,
    table_width: u16,
    starting_block_size: u64,
    max_direct_block_size: u64,
    max_heap_size: u16,
    starting_rows: u16,
    root_block_address: u64,
    current_rows: u16,
}

/// Fixed-layout `FRHP` header, `zh5/heap.py::FractalHeap`'s constructor
/// field order; `O`/`L` stand for `offset_size`/`length_size`-wide fields.
fn fractal_heap_header(
    offset_size: u8,
    length_size: u8,
) -> impl Fn(&[u8]) -> crate::superblock::PResult<FractalHeapHeader> {
    move |input| {
        context("fractal heap header", move |input| {
            let (input, _) = tag(b"FRHP")(input)?;
            let (input, _version) = nom::number::complete::le_u8(input)?;
            let (input, heap_id_len) = le_u16(input)?;
            let (input, io_filter_len) = le_u16(input)?;
            let (input, _flags) = nom::number::complete::le_u8(input)?;
            let (input, max_managed_object_size) = le_u32(input)?;
            let (input, _next_huge_id) = parse_address(length_size, input)?;
            let (input, _huge_btree_address) = parse_address(offset_size, input)?;
            let (input, _free_space) = parse_address(length_size, input)?;
            let (input, _free_space_manager_address) = parse_address(offset_size, input)?;
            let (input, _managed_space) = parse_address(length_size, input)?;
            let (input, _allocated_space) = parse_address(length_size, input)?;
            let (input, _iterator_offset) = parse_address(length_size, input)?;
            let (input, _n_managed_objects) = parse_address(length_size, input)?;
            let (input, _huge_size) = parse_address(length_size, input)?;
            let (input, _n_huge_objects) = parse_address(length_size, input)?;
            let (input, _tiny_size) = parse_address(length_size, input)?;
            let (input, _n_tiny_objects) = parse_address(length_size, input)?;
            let (input, table_width) = le_u16(input)?;
            let (input, starting_block_size) = parse_address(length_size, input)?;
            let (input, max_direct_block_size) = parse_address(length_size, input)?;
            let (input, max_heap_size) = le_u16(input)?;
            let (input, starting_rows) = le_u16(input)?;
            let (input, root_block_address) = parse_address(offset_size, input)?;
            let (input, current_rows) = le_u16(input)?;
            Ok((
                input,
                FractalHeapHeader {
                    heap_id_len,
                    io_filter_len,
                    max_managed_object_size,
                    table_width,
                    starting_block_size,
                    max_direct_block_size,
                    max_heap_size,
                    starting_rows,
                    root_block_address,
                    current_rows,
                },
            ))
        })(input)
    }
}

impl FractalHeap {
    pub fn open(reader: &mut dyn MetaReader, address: u64, offset_size: u8, length_size: u8) -> Result<Self> {
        reader.seek(address)?;
        let o = offset_size as usize;
        let l = length_size as usize;
        let header_len = 22 + 3 * o + 12 * l;
        let header_bytes = reader.read(header_len)?;
        let (_, header) = fractal_heap_header(offset_size, length_size)(&header_bytes)
            .map_err(|e| Error::Corrupt(format!("fractal heap header: {e:?}")))?;
        let FractalHeapHeader {
            heap_id_len,
            io_filter_len,
            max_managed_object_size,
            table_width,
            starting_block_size,
            max_direct_block_size,
            max_heap_size,
            starting_rows,
            root_block_address,
            current_rows,
        } = header;

        if io_filter_len > 0 {
            reader.read(l)?; // size of filtered root direct block
            reader.read(4)?; // filter mask
            reader.read(io_filter_len as usize)?; // encoded filter pipeline
        }
        reader.read(4)?; // checksum

        let mut managed = Vec::new();
        if root_block_address != undefined(o) {
            if current_rows == 0 {
                managed.push((root_block_address, starting_block_size));
            } else {
                collect_indirect(
                    reader,
                    root_block_address,
                    table_width,
                    current_rows,
                    starting_rows,
                    starting_block_size,
                    max_direct_block_size,
                    max_heap_size,
                    o,
                    &mut managed,
                )?;
            }
        }

        Ok(FractalHeap {
            heap_id_len,
            io_filter_len,
            max_managed_object_size,
            managed,
            starting_block_size,
            max_direct_block_size,
            max_heap_size,
        })
    }

    /// Resolves a managed heap id (`version:3bits, type:2bits, reserved:3bits`
    /// followed by an offset/length pair) to the raw object bytes, walking
    /// the eagerly-built managed block list to find the containing block.
    pub fn get_data(&self, reader: &mut dyn MetaReader, heap_id: &[u8]) -> Result<Vec<u8>> {
        if heap_id.len() < self.heap_id_len as usize {
            return Err(Error::Corrupt("heap id shorter than declared length".into()));
        }
        let flags = heap_id[0];
        let id_type = (flags >> 4) & 0b11;
        if id_type != 0 {
            return Err(Error::UnsupportedVersion(format!(
                "fractal heap id type {id_type} (only managed objects are supported)"
            )));
        }
        let offset_size = offset_byte_len(self.max_heap_size);
        let length_size = length_byte_len(self.max_managed_object_size);
        let (_, offset) = parse_address(offset_size as u8, &heap_id[1..1 + offset_size])
            .map_err(|e| Error::Corrupt(format!("fractal heap id offset: {e:?}")))?;
        let (_, length) = parse_address(
            length_size as u8,
            &heap_id[1 + offset_size..1 + offset_size + length_size],
        )
        .map_err(|e| Error::Corrupt(format!("fractal heap id length: {e:?}")))?;

        let (block_offset, block_size) = self
            .managed
            .iter()
            .find(|(start, size)| offset >= *start && offset < *start + *size)
            .ok_or_else(|| Error::Corrupt("heap offset does not fall in any managed block".into()))?;
        let in_block = offset - block_offset;
        reader.seek(block_offset + in_block)?;
        let _ = block_size;
        let _ = self.io_filter_len;
        let _ = self.starting_block_size;
        let _ = self.max_direct_block_size;
        reader.read(length as usize)
    }
}

fn undefined(size: usize) -> u64 {
    if size >= 8 {
        u64::MAX
    } else {
        (1u64 << (8 * size)) - 1
    }
}

fn offset_byte_len(max_heap_size_bits: u16) -> usize {
    ((max_heap_size_bits as usize) + 7) / 8
}

fn length_byte_len(max_managed_object_size: u32) -> usize {
    let bits = 32 - max_managed_object_size.leading_zeros().max(0);
    ((bits.max(1) as usize) + 7) / 8
}

/// Direct-block headers carry a prefix (signature, version, heap header
/// address, block offset) before their data; this walks indirect blocks
/// breadth-first to enumerate every direct block's `(offset, size)`,
/// matching `FractalHeapIndirectBlock`'s eager child enumeration.
#[allow(clippy::too_many_arguments)]
fn collect_indirect(
    reader: &mut dyn MetaReader,
    address: u64,
    table_width: u16,
    _current_rows: u16,
    starting_rows: u16,
    starting_block_size: u64,
    max_direct_block_size: u64,
    max_heap_size_bits: u16,
    offset_size: usize,
    out: &mut Vec<(u64, u64)>,
) -> Result<()> {
    reader.seek(address)?;
    let prefix = reader.read(4 + 1 + offset_size)?;
    tag::<_, _, nom::error::VerboseError<&[u8]>>(b"FHIB".as_slice())(prefix.as_slice())
        .map_err(|_| Error::Corrupt("missing FHIB signature".into()))?;
    // block_offset field: ceil(max_heap_size_bits / 8) bytes, identifies this
    // block's position in the heap's linear address space. Not needed to
    // enumerate children, but must be skipped to reach the address table.
    let block_offset_bytes = (max_heap_size_bits as usize + 7) / 8;
    reader.read(block_offset_bytes)?;

    let max_direct_rows = {
        let mut bits = 0u32;
        let mut v = max_direct_block_size;
        while v > starting_block_size {
            v /= 2;
            bits += 1;
        }
        bits as u16 + 2
    };

    let mut row_size = starting_block_size;
    for row in 0..starting_rows.max(1) {
        for _col in 0..table_width {
            let child_bytes = reader.read(offset_size)?;
            let (_, child_address) = parse_address(offset_size as u8, &child_bytes)
                .map_err(|e| Error::Corrupt(format!("fractal heap indirect child address: {e:?}")))?;
            if child_address != undefined(offset_size) {
                if row < max_direct_rows {
                    out.push((child_address, row_size));
                } else {
                    collect_indirect(
                        reader,
                        child_address,
                        table_width,
                        0,
                        starting_rows,
                        starting_block_size,
                        max_direct_block_size,
                        max_heap_size_bits,
                        offset_size,
                        out,
                    )?;
                }
            }
        }
        if row >= 1 {
            row_size *= 2;
        }
    }
    Ok(())
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
    fn local_heap_reads_null_terminated_name() {
        let mut file = Vec::new();
        file.extend_from_slice(b"HEAP");
        file.push(0); // version
        file.extend_from_slice(&[0u8; 3]); // reserved
        let data_segment_size = 16u64;
        file.extend_from_slice(&data_segment_size.to_le_bytes());
        file.extend_from_slice(&u64::MAX.to_le_bytes()); // free list head
        let data_segment_address = 64u64;
        file.extend_from_slice(&data_segment_address.to_le_bytes());
        file.resize(64, 0);
        file.extend_from_slice(b"alpha\0beta\0\0\0\0\0\0");

        let path = write_temp(&file, "hdf5_reader_test_localheap.bin");
        let mut source = LocalSource::open(&path).unwrap();
        let heap = LocalHeap::open(&mut source, 0, 8).unwrap();
        assert_eq!(heap.name_at(0).unwrap(), "alpha");
        assert_eq!(heap.name_at(6).unwrap(), "beta");
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn global_heap_collection_stops_at_zero_index() {
        let mut body = Vec::new();
        // object 1: 4 bytes of data, padded to 8
        body.extend_from_slice(&1u16.to_le_bytes());
        body.extend_from_slice(&0u16.to_le_bytes());
        body.extend_from_slice(&0u32.to_le_bytes());
        body.extend_from_slice(&4u64.to_le_bytes());
        body.extend_from_slice(&[9, 9, 9, 9, 0, 0, 0, 0]);
        // terminator
        body.extend_from_slice(&0u16.to_le_bytes());
        body.extend_from_slice(&[0u8; 14]);

        let mut file = Vec::new();
        file.extend_from_slice(b"GCOL");
        file.push(1);
        file.extend_from_slice(&[0u8; 3]);
        let total = (8 + 8 + body.len()) as u64;
        file.extend_from_slice(&total.to_le_bytes());
        file.extend_from_slice(&body);

        let path = write_temp(&file, "hdf5_reader_test_gheap.bin");
        let mut source = LocalSource::open(&path).unwrap();
        let collection = GlobalHeapCollection::open(&mut source, 0, 8).unwrap();
        let obj = collection.object(1).unwrap();
        assert_eq!(obj.data, vec![9, 9, 9, 9]);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn vlen_string_strips_trailing_nuls() {
        let bytes = b"hello\0\0\0";
        assert_eq!(decode_vlen_string(bytes, 1), b"hello".to_vec());
    }

    #[test]
    fn fractal_heap_header_fields_land_on_correct_offsets() {
        let o = 8usize;
        let l = 8usize;
        let mut file = Vec::new();
        file.extend_from_slice(b"FRHP");
        file.push(0); // version
        file.extend_from_slice(&7u16.to_le_bytes()); // heap_id_len
        file.extend_from_slice(&0u16.to_le_bytes()); // io_filter_len
        file.push(0); // flags
        file.extend_from_slice(&100u32.to_le_bytes()); // max_managed_object_size
        file.extend_from_slice(&vec![0u8; l]); // next_huge_object_id
        file.extend_from_slice(&vec![0xffu8; o]); // v2_btree_address_huge_objects
        file.extend_from_slice(&vec![0u8; l]); // free_space_managed
        file.extend_from_slice(&vec![0xffu8; o]); // managed_block_fsm_address
        file.extend_from_slice(&vec![0u8; l]); // managed_space_in_heap
        file.extend_from_slice(&vec![0u8; l]); // allocated_managed_space
        file.extend_from_slice(&vec![0u8; l]); // iterator_offset
        file.extend_from_slice(&vec![0u8; l]); // n_managed_objects
        file.extend_from_slice(&vec![0u8; l]); // huge_size
        file.extend_from_slice(&vec![0u8; l]); // n_huge_objects
        file.extend_from_slice(&vec![0u8; l]); // tiny_size
        file.extend_from_slice(&vec![0u8; l]); // n_tiny_objects
        file.extend_from_slice(&4u16.to_le_bytes()); // table_width
        file.extend_from_slice(&512u64.to_le_bytes()[..l]); // starting_block_size
        file.extend_from_slice(&65536u64.to_le_bytes()[..l]); // max_direct_block_size
        file.extend_from_slice(&32u16.to_le_bytes()); // max_heap_size bits
        file.extend_from_slice(&1u16.to_le_bytes()); // starting_rows
        file.extend_from_slice(&vec![0xffu8; o]); // root_block_address (undefined: no managed blocks)
        file.extend_from_slice(&0u16.to_le_bytes()); // current_rows
        file.extend_from_slice(&0u32.to_le_bytes()); // checksum

        let path = write_temp(&file, "hdf5_reader_test_fractalheap.bin");
        let mut source = LocalSource::open(&path).unwrap();
        let heap = FractalHeap::open(&mut source, 0, o as u8, l as u8).unwrap();
        assert_eq!(heap.heap_id_len, 7);
        assert_eq!(heap.io_filter_len, 0);
        assert_eq!(heap.max_managed_object_size, 100);
        assert_eq!(heap.starting_block_size, 512);
        assert_eq!(heap.max_direct_block_size, 65536);
        assert!(heap.managed.is_empty());
        std::fs::remove_file(&path).ok();
    }
}

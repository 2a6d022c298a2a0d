//! Superblock discovery and version dispatch (spec.md §4.2).
//!
//! Mirrors `zh5.file.SuperblockV01`/`SuperblockV23`: the file is scanned for
//! the 8-byte signature at offsets 0, 512, 1024, 2048, ... (doubling), then
//! dispatched on the version byte that immediately follows it.

use crate::byte_source::MetaReader;
use crate::error::{Error, Result};
use nom::bytes::complete::{tag, take};
use nom::error::{context, VerboseError};
use nom::number::complete::{le_u16, le_u32, le_u64, le_u8};
use nom::IResult;

pub(crate) type PResult<'a, O> = IResult<&'a [u8], O, VerboseError<&'a [u8]>>;

pub const SIGNATURE: &[u8; 8] = b"\x89HDF\r\n\x1a\n";

/// Reads a `len`-byte little-endian address field (`size_of_offsets` or
/// `size_of_lengths` wide) and widens it to `u64`, shared by every module
/// that decodes a file-format field whose width depends on the superblock.
pub(crate) fn address(len: u8, input: &[u8]) -> PResult<u64> {
    let (input, bytes) = take(len)(input)?;
    let mut buf = [0u8; 8];
    buf[..bytes.len()].copy_from_slice(bytes);
    Ok((input, u64::from_le_bytes(buf)))
}

/// The symbol-table-entry form used by v0/v1 superblocks to locate the root
/// group indirectly through a local heap + B-tree pair (spec.md §4.4).
#[derive(Debug, Clone)]
pub struct SymbolTableEntry {
    pub link_name_offset: u64,
    pub object_header_address: u64,
    pub cache_type: u32,
    pub btree_address: u64,
    pub local_heap_address: u64,
}

pub fn parse_symbol_table_entry(input: &[u8], offset_size: u8) -> PResult<SymbolTableEntry> {
    context("symbol table entry", move |input| {
        let (input, link_name_offset) = address(offset_size, input)?;
        let (input, object_header_address) = address(offset_size, input)?;
        let (input, cache_type) = le_u32(input)?;
        let (input, _) = take(4usize)(input)?;
        let (input, btree_address) = address(offset_size, input)?;
        let (input, local_heap_address) = address(offset_size, input)?;
        Ok((
            input,
            SymbolTableEntry {
                link_name_offset,
                object_header_address,
                cache_type,
                btree_address,
                local_heap_address,
            },
        ))
    })(input)
}

#[derive(Debug, Clone)]
pub struct DriverInfoBlock {
    pub driver_identification: [u8; 8],
    pub driver_information: Vec<u8>,
}

#[derive(Debug, Clone)]
pub enum Entrypoint {
    /// v0/v1: the root group is reached through a symbol table entry at
    /// `base + superblock.size`.
    SymbolTable(SymbolTableEntry),
    /// v2/v3: the root group's object header address directly.
    ObjectHeader(u64),
}

#[derive(Debug, Clone)]
pub struct Superblock {
    pub version: u8,
    pub size_of_offsets: u8,
    pub size_of_lengths: u8,
    pub base_address: u64,
    pub end_of_file_address: u64,
    pub group_leaf_node_k: Option<u16>,
    pub group_internal_node_k: Option<u16>,
    pub entrypoint: Entrypoint,
    pub driver_information_block_address: Option<u64>,
    pub superblock_extension_address: Option<u64>,
    /// Size of the on-disk superblock layout: 56 for v0/v1 (fixed), used to
    /// locate the root symbol table entry right after it.
    pub size: u64,
}

impl Superblock {
    pub fn undefined_address(&self) -> u64 {
        if self.size_of_offsets >= 8 {
            u64::MAX
        } else {
            (1u64 << (8 * self.size_of_offsets)) - 1
        }
    }

    /// `None` for v0/v1 superblocks, which have no extension-address field
    /// at all (resolves spec.md §9 Open Question (a)).
    pub fn extension_address(&self) -> Option<u64> {
        self.superblock_extension_address
    }
}

fn parse_v01(input: &[u8], version: u8) -> PResult<Superblock> {
    context("superblock v0/v1", move |input| {
        let (input, _free_space_storage_version) = le_u8(input)?;
        let (input, _root_group_ste_version) = le_u8(input)?;
        let (input, _) = tag([0u8])(input)?;
        let (input, _shared_header_message_format_version) = le_u8(input)?;
        let (input, size_of_offsets) = le_u8(input)?;
        let (input, size_of_lengths) = le_u8(input)?;
        let (input, _) = tag([0u8])(input)?;
        let (input, group_leaf_node_k) = le_u16(input)?;
        let (input, group_internal_node_k) = le_u16(input)?;
        let (input, _file_consistency_flags) = le_u32(input)?;

        let (input, _indexed_storage_internal_node_k) = if version == 1 {
            let (input, k) = le_u16(input)?;
            let (input, _) = take(2usize)(input)?;
            (input, Some(k))
        } else {
            (input, None)
        };

        let (input, base_address) = address(size_of_offsets, input)?;
        let (input, _free_space_info_address) = address(size_of_offsets, input)?;
        let (input, end_of_file_address) = address(size_of_offsets, input)?;
        let (input, driver_information_block_address) = address(size_of_offsets, input)?;
        let (input, ste) = parse_symbol_table_entry(input, size_of_offsets)?;

        Ok((
            input,
            Superblock {
                version,
                size_of_offsets,
                size_of_lengths,
                base_address,
                end_of_file_address,
                group_leaf_node_k: Some(group_leaf_node_k),
                group_internal_node_k: Some(group_internal_node_k),
                entrypoint: Entrypoint::SymbolTable(ste),
                driver_information_block_address: Some(driver_information_block_address),
                superblock_extension_address: None,
                size: 56,
            },
        ))
    })(input)
}

fn parse_v23(input: &[u8], version: u8) -> PResult<Superblock> {
    context("superblock v2/v3", move |input| {
        let (input, size_of_offsets) = le_u8(input)?;
        let (input, size_of_lengths) = le_u8(input)?;
        let (input, _file_consistency_flags) = le_u8(input)?;
        let (input, base_address) = address(size_of_offsets, input)?;
        let (input, superblock_extension_address) = address(size_of_offsets, input)?;
        let (input, end_of_file_address) = address(size_of_offsets, input)?;
        let (input, root_group_object_header_address) = address(size_of_offsets, input)?;
        let (input, _checksum) = le_u32(input)?;

        Ok((
            input,
            Superblock {
                version,
                size_of_offsets,
                size_of_lengths,
                base_address,
                end_of_file_address,
                group_leaf_node_k: None,
                group_internal_node_k: None,
                entrypoint: Entrypoint::ObjectHeader(root_group_object_header_address),
                driver_information_block_address: None,
                superblock_extension_address: Some(superblock_extension_address),
                size: 0,
            },
        ))
    })(input)
}

/// Scans for the signature at offsets 0, 512, 1024, ... and parses whichever
/// superblock layout the version byte selects.
///
/// Both layouts carry a handful of fixed bytes before any field whose size
/// depends on `size_of_offsets`/`size_of_lengths`; a small prefix is read
/// first to learn those widths, then exactly the remaining byte count.
pub fn locate_and_parse(reader: &mut dyn MetaReader) -> Result<(u64, Superblock)> {
    let mut probe = 0u64;
    loop {
        reader.seek(probe)?;
        let head = reader.read(9);
        match head {
            Ok(bytes) if bytes.len() == 9 && &bytes[0..8] == SIGNATURE.as_slice() => {
                let version = bytes[8];
                let sb = match version {
                    0 | 1 => {
                        let prefix = reader.read(7)?;
                        let size_of_offsets = prefix[4];
                        let rest_len = 16
                            + if version == 1 { 4 } else { 0 }
                            + 8 * size_of_offsets as usize;
                        let rest = reader.read(rest_len)?;
                        let mut body = prefix;
                        body.extend_from_slice(&rest);
                        parse_v01(&body, version)
                            .map_err(|e| Error::Corrupt(format!("superblock: {e:?}")))?
                            .1
                    }
                    2 | 3 => {
                        let prefix = reader.read(3)?;
                        let size_of_offsets = prefix[0];
                        let rest_len = 4 * size_of_offsets as usize + 4;
                        let rest = reader.read(rest_len)?;
                        let mut body = prefix;
                        body.extend_from_slice(&rest);
                        parse_v23(&body, version)
                            .map_err(|e| Error::Corrupt(format!("superblock: {e:?}")))?
                            .1
                    }
                    other => {
                        return Err(Error::UnsupportedVersion(format!(
                            "superblock version {other}"
                        )))
                    }
                };
                return Ok((probe, sb));
            }
            _ => {
                if probe == 0 {
                    probe = 512;
                } else {
                    probe *= 2;
                }
                if probe > (1u64 << 40) {
                    return Err(Error::Corrupt("HDF5 signature not found".into()));
                }
            }
        }
    }
}

fn driver_info_block_header(input: &[u8]) -> PResult<(u32, [u8; 8])> {
    context("driver info block header", |input| {
        let (input, _version) = le_u8(input)?;
        let (input, _reserved) = take(3usize)(input)?;
        let (input, size) = le_u32(input)?;
        let (input, identification) = take(8usize)(input)?;
        let mut driver_identification = [0u8; 8];
        driver_identification.copy_from_slice(identification);
        Ok((input, (size, driver_identification)))
    })(input)
}

pub fn parse_driver_info_block(reader: &mut dyn MetaReader, offset: u64) -> Result<DriverInfoBlock> {
    reader.seek(offset)?;
    let header = reader.read(16)?;
    let (_, (size, driver_identification)) = driver_info_block_header(&header)
        .map_err(|e| Error::Corrupt(format!("driver info block header: {e:?}")))?;
    let driver_information = reader.read(size as usize)?;
    Ok(DriverInfoBlock { driver_identification, driver_information })
}

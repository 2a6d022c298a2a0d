//! A pure-Rust HDF5 reader, built for speed.
//!
//! This library does not intend to support all features of HDF5 either in
//! the library or the specification: superblock versions 0-3, object
//! header versions 1-2, fixed-point/float/variable-length-string
//! datatypes, and the deflate/shuffle/fletcher32 filters are what's
//! implemented. See each module's docs for the exact subset understood.

mod array;
mod attribute;
mod btree;
mod byte_source;
mod dataset;
mod driver;
mod dtype;
mod error;
mod filter;
mod heap;
mod layout;
mod link;
mod object_header;
mod superblock;

pub use array::Array;
pub use attribute::Attribute;
pub use dataset::{ChunkRecord, Dataset, Hyperslab};
pub use dtype::{DataType, Dataspace};
pub use error::Error;
pub use filter::Filter;
pub use layout::Layout;
pub use link::{Link, LinkTarget};

use byte_source::{open_source, FetchCursor, MetaReader, PagedReader, RangeFetcher};
use error::Result;
use heap::GlobalHeap;
use object_header::ObjectHeader;
use std::sync::{Arc, Mutex};

const DEFAULT_PAGE_SIZE: u64 = 4096;

/// Opens `name` (a filesystem path, or an `http://`/`https://` URL) for
/// reading, without a page cache (spec.md §6).
pub fn open(name: &str) -> Result<File> {
    File::open(name)
}

/// As [`open`], but fronts the byte source with a page-aligned cache —
/// intended for remote files, whose metadata reads are small and
/// scattered (spec.md §4.1).
pub fn open_paged(name: &str) -> Result<File> {
    File::open_paged(name)
}

/// Shared addressing context every open group/dataset needs: the
/// superblock's field widths and undefined-address sentinel, plus an
/// optional split-driver raw sibling (spec.md §4.12). Cheap to clone —
/// it's handed to every `Group`/`Dataset` this file opens.
#[derive(Clone)]
struct Ctx {
    offset_size: u8,
    length_size: u8,
    undefined_address: u64,
    raw: Option<(Arc<dyn RangeFetcher>, u64)>,
    /// The cache-bypassing fetcher used for bulk raw-chunk/contiguous reads
    /// when there's no split-driver raw sibling (spec.md §4.1). Metadata
    /// traversal (links, B-tree walks, heap resolution) instead goes
    /// through the per-`Group`/`Dataset` `fetcher` field, which is the
    /// paged, cached one when the file was opened with `open_paged`.
    raw_fetcher: Arc<dyn RangeFetcher>,
}

/// An opened HDF5 file: its superblock, a cursor-free byte fetcher used by
/// every group and dataset it has handed out, and the root group.
pub struct File {
    reader: Box<dyn MetaReader>,
    fetcher: Arc<dyn RangeFetcher>,
    superblock: superblock::Superblock,
    root: Group,
}

/// Either half of what a link or a root entrypoint can resolve to
/// (spec.md §4.4: "depending on whether its object header carries a
/// dataspace message and a data-layout message").
pub enum Entry {
    Dataset(Dataset),
    Group(Group),
}

impl Entry {
    pub fn into_dataset(self) -> Result<Dataset> {
        match self {
            Entry::Dataset(d) => Ok(d),
            Entry::Group(_) => Err(Error::Corrupt("expected a dataset, found a group".into())),
        }
    }

    pub fn into_group(self) -> Result<Group> {
        match self {
            Entry::Group(g) => Ok(g),
            Entry::Dataset(_) => Err(Error::Corrupt("expected a group, found a dataset".into())),
        }
    }
}

/// A group: an object header whose messages name a link-storage shape
/// (inline, V1 symbol table, or dense fractal-heap) rather than a
/// dataspace and layout.
pub struct Group {
    fetcher: Arc<dyn RangeFetcher>,
    ctx: Ctx,
    messages: Vec<object_header::MessageRecord>,
}

impl Group {
    /// Enumerates this group's direct children, in whatever order its
    /// storage shape yields them (creation order for dense storage, key
    /// order for a V1 symbol table, declaration order for inline links).
    /// Lazy and not restartable: each call re-walks the underlying
    /// storage (spec.md §9 "Lazy iteration").
    pub fn links(&self) -> Result<Vec<Link>> {
        let mut cursor = FetchCursor::new(self.fetcher.clone());
        Ok(link::links_from_messages(
            &mut cursor,
            &self.messages,
            self.ctx.offset_size,
            self.ctx.length_size,
            self.ctx.undefined_address,
        )?
        .unwrap_or_default())
    }

    /// Looks up a direct child by name, matching `Group::__getitem__`'s
    /// linear scan over `links()` (spec.md §4.4).
    pub fn get(&self, name: &str) -> Result<Entry> {
        let links = self.links()?;
        let link = links
            .iter()
            .find(|l| l.name == name)
            .ok_or_else(|| Error::NotFound(name.to_string()))?;
        let address = link
            .object_header_address()
            .ok_or_else(|| Error::NotFound(name.to_string()))?;
        open_entry(self.fetcher.clone(), &self.ctx, address)
    }

    /// Decodes every type-12 Attribute message attached to this group.
    pub fn attributes(&self) -> Result<Vec<Attribute>> {
        read_attributes(&mut FetchCursor::new(self.fetcher.clone()), &self.messages)
    }
}

impl std::fmt::Debug for Group {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Group")
            .field("links", &self.links().map(|ls| ls.into_iter().map(|l| l.name).collect::<Vec<_>>()))
            .finish()
    }
}

fn read_attributes(
    cursor: &mut dyn MetaReader,
    messages: &[object_header::MessageRecord],
) -> Result<Vec<Attribute>> {
    let mut out = Vec::new();
    for m in messages {
        if m.message_type == 0x000C {
            cursor.seek(m.offset)?;
            let body = cursor.read(m.size as usize)?;
            out.push(attribute::parse_attribute_message(&body)?);
        }
    }
    Ok(out)
}

/// Opens the object header at `address` and dispatches it to a `Dataset`
/// or a `Group`, per spec.md §4.4's dataspace+layout test.
fn open_entry(fetcher: Arc<dyn RangeFetcher>, ctx: &Ctx, address: u64) -> Result<Entry> {
    let mut cursor = FetchCursor::new(fetcher.clone());
    let oh = ObjectHeader::open(&mut cursor, address)?;
    let messages = oh.messages(&mut cursor)?;

    let has_dataspace = messages.iter().any(|m| m.message_type == 1);
    let has_layout = messages.iter().any(|m| m.message_type == 8);

    if has_dataspace && has_layout {
        let mut dataspace = None;
        let mut datatype = None;
        let mut layout = None;
        let mut filters = Vec::new();

        for m in &messages {
            match m.message_type {
                1 => {
                    cursor.seek(m.offset)?;
                    let body = cursor.read(m.size as usize)?;
                    dataspace = Some(dtype::parse_dataspace(&body)?);
                }
                3 => {
                    cursor.seek(m.offset)?;
                    let body = cursor.read(m.size as usize)?;
                    datatype = Some(dtype::parse_datatype(&body)?);
                }
                8 => {
                    cursor.seek(m.offset)?;
                    let body = cursor.read(m.size as usize)?;
                    layout = Some(layout::parse_layout(&body, ctx.offset_size, ctx.length_size)?);
                }
                11 => {
                    cursor.seek(m.offset)?;
                    let body = cursor.read(m.size as usize)?;
                    filters = filter::parse_pipeline_message(&body)?;
                }
                _ => {}
            }
        }

        let dataspace =
            dataspace.ok_or_else(|| Error::Corrupt("dataset object header missing dataspace message".into()))?;
        let datatype =
            datatype.ok_or_else(|| Error::Corrupt("dataset object header missing datatype message".into()))?;
        let layout =
            layout.ok_or_else(|| Error::Corrupt("dataset object header missing layout message".into()))?;

        Ok(Entry::Dataset(Dataset {
            shape: dataspace.shape,
            dtype: datatype,
            layout,
            filters,
            offset_size: ctx.offset_size,
            length_size: ctx.length_size,
            undefined_address: ctx.undefined_address,
            fetcher,
            raw_fetcher: ctx.raw_fetcher.clone(),
            global_heap: Mutex::new(GlobalHeap::new()),
            raw: ctx.raw.clone(),
            messages,
        }))
    } else {
        Ok(Entry::Group(Group { fetcher, ctx: ctx.clone(), messages }))
    }
}

/// Reads the page size carried by a version-1 File-Space-Info message
/// (superblock extension message type 0x17), matching
/// `zh5/file.py::PagedFile._read_file_space_info`/`FileSpaceInfoV1`.
/// `None` when the superblock has no extension, the extension is absent
/// (`undefined_address`), or the message carries no page size (version 0).
fn read_page_size_override(
    reader: &mut dyn MetaReader,
    superblock: &superblock::Superblock,
) -> Result<Option<u64>> {
    let Some(ext_addr) = superblock.extension_address() else {
        return Ok(None);
    };
    if ext_addr == superblock.undefined_address() {
        return Ok(None);
    }
    let oh = ObjectHeader::open(reader, ext_addr)?;
    let messages = oh.messages(reader)?;
    for m in &messages {
        if m.message_type == 0x0017 {
            reader.seek(m.offset)?;
            let body = reader.read(m.size as usize)?;
            if body.is_empty() || body[0] != 1 {
                return Ok(None); // version 0 carries no page size field
            }
            let l = superblock.size_of_lengths as usize;
            let page_size_offset = 3 + l;
            if body.len() < page_size_offset + 4 {
                return Err(Error::Corrupt("file space info message too short".into()));
            }
            let page_size = u32::from_le_bytes(
                body[page_size_offset..page_size_offset + 4].try_into().unwrap(),
            );
            return Ok(Some(page_size as u64));
        }
    }
    Ok(None)
}

impl File {
    /// Opens `name` without a page cache.
    pub fn open(name: &str) -> Result<Self> {
        Self::open_with(name, false)
    }

    /// Opens `name` fronted by a page-aligned cache, default page size
    /// 4096 bytes unless overridden by a File-Space-Info message (spec.md
    /// §4.1), which only v2/v3 superblocks can carry.
    pub fn open_paged(name: &str) -> Result<Self> {
        Self::open_with(name, true)
    }

    fn open_with(name: &str, paged: bool) -> Result<Self> {
        tracing::debug!(%name, paged, "opening HDF5 file");
        let mut inner = open_source(name)?;
        let (_origin, superblock) = superblock::locate_and_parse(inner.as_mut())?;
        let undefined_address = superblock.undefined_address();

        let mut reader: Box<dyn MetaReader> = if paged {
            let page_size = read_page_size_override(inner.as_mut(), &superblock)?
                .unwrap_or(DEFAULT_PAGE_SIZE);
            Box::new(PagedReader::new(inner, page_size, 0))
        } else {
            inner
        };

        let raw = Self::open_split_raw(name, &superblock, reader.as_mut())?;
        let fetcher = reader.range_fetcher();
        let raw_fetcher = reader.bypass_fetcher();

        let ctx = Ctx {
            offset_size: superblock.size_of_offsets,
            length_size: superblock.size_of_lengths,
            undefined_address,
            raw,
            raw_fetcher,
        };

        let root_address = match &superblock.entrypoint {
            superblock::Entrypoint::SymbolTable(ste) => ste.object_header_address,
            superblock::Entrypoint::ObjectHeader(addr) => *addr,
        };
        let root = open_entry(fetcher.clone(), &ctx, root_address)?.into_group()?;

        Ok(File { reader, fetcher, superblock, root })
    }

    /// Detects a split/multi driver from the v0/v1 driver-info block and
    /// opens the raw sibling file, per spec.md §4.12. `None` for ordinary
    /// single-file storage and for v2/v3 superblocks, which carry no
    /// driver-info block at all.
    fn open_split_raw(
        name: &str,
        superblock: &superblock::Superblock,
        reader: &mut dyn MetaReader,
    ) -> Result<Option<(Arc<dyn RangeFetcher>, u64)>> {
        let Some(block_address) = superblock.driver_information_block_address else {
            return Ok(None);
        };
        if block_address == superblock.undefined_address() {
            return Ok(None);
        }
        let block = superblock::parse_driver_info_block(reader, block_address)?;
        if !driver::is_split_or_multi(&block.driver_identification) {
            return Ok(None);
        }
        let members = driver::parse_members(&block.driver_information)?;
        let raw_path = driver::raw_sibling_path(name);
        tracing::debug!(%raw_path, "split driver detected, opening raw sibling");
        let raw_source = open_source(&raw_path)?;
        Ok(Some((raw_source.range_fetcher(), members.raw.address)))
    }

    pub fn root(&self) -> &Group {
        &self.root
    }

    /// Looks up an absolute slash-separated path from the root group,
    /// e.g. `"/group/dataset"` or `"group/dataset"`.
    pub fn get(&self, path: &str) -> Result<Entry> {
        let path = path.trim_start_matches('/');
        if path.is_empty() {
            return Err(Error::NotFound(path.to_string()));
        }
        let mut parts = path.split('/');
        let first = parts.next().unwrap();
        let mut entry = self.root.get(first)?;
        for part in parts {
            let group = match entry {
                Entry::Group(g) => g,
                Entry::Dataset(_) => return Err(Error::NotFound(path.to_string())),
            };
            entry = group.get(part)?;
        }
        Ok(entry)
    }

    pub fn cache_hits(&self) -> u64 {
        self.reader.cache_hits()
    }

    pub fn cache_misses(&self) -> u64 {
        self.reader.cache_misses()
    }

    pub fn reset_cache(&mut self) {
        self.reader.reset_cache()
    }

    /// Closes the file, dropping the byte source (and with it, any page
    /// cache and global-heap cache) on all exit paths.
    pub fn close(self) {}

    pub fn superblock(&self) -> &superblock::Superblock {
        &self.superblock
    }

    pub fn is_remote(&self) -> bool {
        self.fetcher.is_remote()
    }
}

impl std::fmt::Debug for File {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("File")
            .field("version", &self.superblock.version)
            .field("root", &self.root)
            .finish()
    }
}

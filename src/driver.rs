//! Split/multi driver member table (spec.md §4.12).
//!
//! Grounded in `zh5/file.py::SplitFile.members`/`project_chunk`: the
//! driver-info block is interpreted as a 6-entry member table when the
//! driver identification names the split/multi driver. Only the two-file
//! "split" shape (one meta member, one raw member) is supported, matching
//! the original — true multi-driver's up-to-six-file layout is not
//! required by any of this crate's callers.

use crate::error::{Error, Result};
use nom::error::context;
use nom::number::complete::le_u64;

#[derive(Debug, Clone, Copy, Default)]
pub struct Member {
    pub address: u64,
    pub length: u64,
}

/// The six logical members the split/multi driver's info block names, in
/// on-disk order: superblock, btree, raw data, global heap, local heap,
/// object header.
#[derive(Debug, Clone)]
pub struct SplitMembers {
    pub superblock: Member,
    pub btree: Member,
    pub raw: Member,
    pub global_heap: Member,
    pub local_heap: Member,
    pub object_header: Member,
}

/// True when the 8-byte driver identification names the split or multi
/// driver, per the format's `Driver Identification` field.
pub fn is_split_or_multi(driver_identification: &[u8; 8]) -> bool {
    driver_identification.starts_with(b"NCSAmult") || driver_identification.starts_with(b"NCSAspli")
}

/// Decodes the 6-entry member table from a driver-info block's
/// `driver_information` bytes, matching `SplitFile.members`: each of the
/// 6 logical members carries a 1-byte member-file index at offset `i`;
/// index 1 selects the first (address, length) pair at byte 8, anything
/// else selects the second pair at byte 24 — exactly two physical files
/// are addressable, matching the split driver's meta/raw split.
pub fn parse_members(driver_information: &[u8]) -> Result<SplitMembers> {
    if driver_information.len() < 8 + 32 {
        return Err(Error::Corrupt(
            "driver information block too short for a split/multi member table".into(),
        ));
    }
    let member_index = &driver_information[0..6];
    let read_member = |i: usize| -> Result<Member> {
        let slot = if member_index[i] == 1 { 0 } else { 1 };
        let address_offset = 8 + slot * 16;
        let (_, (address, length)) = context("split driver member", |input| {
            let (input, address) = le_u64(input)?;
            let (input, length) = le_u64(input)?;
            Ok((input, (address, length)))
        })(&driver_information[address_offset..address_offset + 16])
        .map_err(|e: nom::Err<nom::error::VerboseError<&[u8]>>| {
            Error::Corrupt(format!("split driver member: {e:?}"))
        })?;
        Ok(Member { address, length })
    };
    Ok(SplitMembers {
        superblock: read_member(0)?,
        btree: read_member(1)?,
        raw: read_member(2)?,
        global_heap: read_member(3)?,
        local_heap: read_member(4)?,
        object_header: read_member(5)?,
    })
}

impl SplitMembers {
    /// Projects a raw-data chunk byte offset (as read from the B-tree,
    /// which lives in the raw member's address space) into an offset
    /// within the raw sibling file, per `SplitFile.project_chunk`.
    pub fn project_chunk(&self, chunk_offset: u64) -> u64 {
        chunk_offset - self.raw.address
    }
}

/// Derives the raw sibling's path from the meta file's path, following
/// the `-m.h5`/`-r.h5` naming convention `SplitFile.__init__` defaults to.
/// Open Question (c) in spec.md §9 leaves conformant naming undecided
/// beyond this default; non-default suffixes are out of scope.
pub fn raw_sibling_path(meta_path: &str) -> String {
    if let Some(stripped) = meta_path.strip_suffix("-m.h5") {
        format!("{stripped}-r.h5")
    } else if let Some(stripped) = meta_path.strip_suffix(".h5") {
        format!("{stripped}-r.h5")
    } else {
        format!("{meta_path}-r.h5")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_chunk_subtracts_raw_member_base() {
        let mut info = vec![0u8; 8 + 32];
        info[0] = 1; // superblock -> meta (slot 0)
        info[1] = 1; // btree -> meta
        info[2] = 2; // raw -> raw (slot 1)
        info[3] = 1;
        info[4] = 1;
        info[5] = 1;
        info[8..16].copy_from_slice(&0u64.to_le_bytes()); // meta address
        info[16..24].copy_from_slice(&1_000_000u64.to_le_bytes()); // meta length
        info[24..32].copy_from_slice(&2048u64.to_le_bytes()); // raw address
        info[32..40].copy_from_slice(&1_000_000u64.to_le_bytes()); // raw length

        let members = parse_members(&info).unwrap();
        assert_eq!(members.raw.address, 2048);
        assert_eq!(members.project_chunk(2048 + 512), 512);
    }

    #[test]
    fn raw_sibling_path_swaps_m_suffix_for_r() {
        assert_eq!(raw_sibling_path("data-m.h5"), "data-r.h5");
        assert_eq!(raw_sibling_path("data.h5"), "data-r.h5");
    }
}

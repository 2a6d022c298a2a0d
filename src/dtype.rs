//! Dataspace and datatype message decoding (spec.md §4.9).
//!
//! Matches `zh5/dataset.py::DataspaceMessage` and
//! `zh5/dtypes.py::DatatypeMessage`/`FixedPointDatatype`/`FloatDatatype`/
//! `VLStringDatatype`.

use crate::error::{Error, Result};
use nom::error::context;
use nom::multi::count;
use nom::number::complete::{le_u32, le_u64, le_u8};

/// A decoded dataspace message: the dataset's current and (if present)
/// maximum extents, one entry per dimension.
#[derive(Debug, Clone)]
pub struct Dataspace {
    pub shape: Vec<u64>,
    pub max_shape: Vec<Option<u64>>,
}

struct DataspacePrefix {
    version: u8,
    dimensionality: u8,
    flags: u8,
}

/// `{version:u8, dimensionality:u8, flags:u8}`, followed by a
/// version-dependent header padding before the dimension sizes.
fn dataspace_prefix(input: &[u8]) -> crate::superblock::PResult<DataspacePrefix> {
    context("dataspace message prefix", |input| {
        let (input, version) = le_u8(input)?;
        let (input, dimensionality) = le_u8(input)?;
        let (input, flags) = le_u8(input)?;
        Ok((input, DataspacePrefix { version, dimensionality, flags }))
    })(input)
}

pub fn parse_dataspace(body: &[u8]) -> Result<Dataspace> {
    let (_, prefix) =
        dataspace_prefix(body).map_err(|e| Error::Corrupt(format!("dataspace message: {e:?}")))?;
    let dimensionality = prefix.dimensionality as usize;
    let has_max = prefix.flags & 0b1 != 0;
    let has_permutation = prefix.flags & 0b10 != 0;

    let header_len = match prefix.version {
        1 => 8,
        2 => 4,
        other => return Err(Error::UnsupportedVersion(format!("dataspace message version {other}"))),
    };
    let rest = &body[header_len..];
    let (rest, shape) = count(le_u64, dimensionality)(rest)
        .map_err(|e: nom::Err<nom::error::VerboseError<&[u8]>>| {
            Error::Corrupt(format!("dataspace shape: {e:?}"))
        })?;
    let max_shape = if has_max {
        let (_, raw) = count(le_u64, dimensionality)(rest).map_err(
            |e: nom::Err<nom::error::VerboseError<&[u8]>>| {
                Error::Corrupt(format!("dataspace max shape: {e:?}"))
            },
        )?;
        raw.into_iter().map(|v| if v == u64::MAX { None } else { Some(v) }).collect()
    } else {
        vec![None; dimensionality]
    };
    let _ = has_permutation; // permutation indices are legacy/unused, per the format's own deprecation
    Ok(Dataspace { shape, max_shape })
}

/// A decoded datatype message, reduced to the cases this crate supports:
/// fixed-point integers, IEEE floats, and variable-length strings
/// (spec.md §4.9's Non-goals exclude compound/enum/array/reference/opaque
/// classes and non-string variable-length sequences).
#[derive(Debug, Clone, PartialEq)]
pub enum DataType {
    FixedPoint { size: u8, signed: bool, big_endian: bool },
    Float { size: u8, big_endian: bool },
    VlenString { character_set: u8 },
}

impl DataType {
    /// Byte width of one element as stored on disk (for vlen strings, the
    /// width of the `{reserved, collection_offset, object_index}` cell,
    /// not the decoded string length).
    pub fn element_size(&self) -> usize {
        match self {
            DataType::FixedPoint { size, .. } => *size as usize,
            DataType::Float { size, .. } => *size as usize,
            DataType::VlenString { .. } => 16,
        }
    }
}

struct DatatypePrefix {
    class: u8,
    bits_0: u8,
    bits_2: u8,
    size: u8,
}

/// `{class_and_version:u8, bit_field0:u8, bit_field1:u8, bit_field2:u8,
/// size:u32}` shared by every datatype class (spec.md §4.9).
fn datatype_prefix(input: &[u8]) -> crate::superblock::PResult<DatatypePrefix> {
    context("datatype message prefix", |input| {
        let (input, class_and_version) = le_u8(input)?;
        let (input, bits_0) = le_u8(input)?;
        let (input, _bits_1) = le_u8(input)?;
        let (input, bits_2) = le_u8(input)?;
        let (input, size) = le_u32(input)?;
        Ok((input, DatatypePrefix { class: class_and_version & 0x0F, bits_0, bits_2, size: size as u8 }))
    })(input)
}

pub fn parse_datatype(body: &[u8]) -> Result<DataType> {
    let (_, DatatypePrefix { class, bits_0, bits_2, size }) =
        datatype_prefix(body).map_err(|e| Error::Corrupt(format!("datatype message: {e:?}")))?;

    match class {
        0 => {
            // fixed-point
            let big_endian = bits_0 & 0b1 != 0;
            let signed = bits_0 & 0b1000 != 0;
            Ok(DataType::FixedPoint { size, signed, big_endian })
        }
        1 => {
            // floating-point
            let big_endian = bits_0 & 0b1 != 0;
            Ok(DataType::Float { size, big_endian })
        }
        9 => {
            // variable-length: bits[0..4] select sequence(0) vs string(1)
            let vlen_type = bits_0 & 0x0F;
            if vlen_type != 1 {
                return Err(Error::UnsupportedDatatype(class));
            }
            let character_set = bits_2 & 0x03;
            Ok(DataType::VlenString { character_set })
        }
        other => Err(Error::UnsupportedDatatype(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dataspace_v1_decodes_shape_without_max() {
        let mut body = vec![1u8, 2, 0, 0, 0, 0, 0, 0]; // version 1, 2 dims, no max flag
        body.extend_from_slice(&10u64.to_le_bytes());
        body.extend_from_slice(&20u64.to_le_bytes());
        let ds = parse_dataspace(&body).unwrap();
        assert_eq!(ds.shape, vec![10, 20]);
        assert_eq!(ds.max_shape, vec![None, None]);
    }

    #[test]
    fn fixed_point_decodes_signed_little_endian() {
        let mut body = vec![0u8; 8];
        body[1] = 0b1000; // signed bit
        body[4] = 4; // size
        let dt = parse_datatype(&body).unwrap();
        assert_eq!(dt, DataType::FixedPoint { size: 4, signed: true, big_endian: false });
    }

    #[test]
    fn vlen_sequence_class_is_unsupported() {
        let mut body = vec![9u8, 0, 0, 0, 0, 0, 0, 0];
        body[1] = 0; // vlen_type = 0 (sequence, not string)
        assert!(parse_datatype(&body).is_err());
    }
}

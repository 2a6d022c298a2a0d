//! Attribute message decoding (type 0x000C / 12).
//!
//! Not detailed in spec.md's component design, but named in its §1 purpose
//! ("a navigable object tree (groups, datasets, attributes)"); supplemented
//! here from `examples/original_source/zh5/attr.py`, generalized to decode
//! the name/datatype/dataspace properly (via `dtype::parse_datatype` and
//! `dtype::parse_dataspace`) rather than the original's "treat everything
//! as a UTF-8 string" shortcut. Only version 1 (the 8-byte-aligned layout)
//! is supported; versions 2/3 drop the padding and are not required by any
//! file this crate is asked to read.

use crate::dtype::{self, DataType, Dataspace};
use crate::error::{Error, Result};
use nom::error::context;
use nom::number::complete::{le_u16, le_u8};

/// A decoded attribute: its name, declared type/shape, and raw on-disk
/// value bytes (reinterpreted by the caller according to `dtype`, the same
/// convention `Dataset::read` uses for its `Array`).
#[derive(Debug, Clone)]
pub struct Attribute {
    pub name: String,
    pub dtype: DataType,
    pub dataspace: Dataspace,
    pub data: Vec<u8>,
}

fn pad8(n: usize) -> usize {
    (n + 7) & !7
}

/// Parses a version-1 attribute message body, matching the field layout
/// `AttributeMessage.__init__` reads (name/datatype/dataspace sizes,
/// each padded up to a multiple of 8 bytes) but decoding the datatype and
/// dataspace sub-messages instead of skipping over them blindly.
pub fn parse_attribute_message(body: &[u8]) -> Result<Attribute> {
    if body.len() < 8 {
        return Err(Error::Corrupt("attribute message shorter than its header".into()));
    }
    let (_, (version, name_size, datatype_size, dataspace_size)) =
        context("attribute message header", |input| {
            let (input, version) = le_u8(input)?;
            let (input, _reserved) = le_u8(input)?;
            let (input, name_size) = le_u16(input)?;
            let (input, datatype_size) = le_u16(input)?;
            let (input, dataspace_size) = le_u16(input)?;
            Ok((input, (version, name_size, datatype_size, dataspace_size)))
        })(body)
        .map_err(|e: nom::Err<nom::error::VerboseError<&[u8]>>| {
            Error::Corrupt(format!("attribute message header: {e:?}"))
        })?;
    if version != 1 {
        return Err(Error::UnsupportedVersion(format!("attribute message version {version}")));
    }
    let name_size = name_size as usize;
    let datatype_size = datatype_size as usize;
    let dataspace_size = dataspace_size as usize;

    let name_padded = pad8(name_size);
    let datatype_padded = pad8(datatype_size);
    let dataspace_padded = pad8(dataspace_size);

    let mut pos = 8usize;
    let name_bytes = &body[pos..pos + name_size];
    let name = String::from_utf8_lossy(name_bytes).trim_end_matches('\0').to_string();
    pos += name_padded;

    let datatype_bytes = &body[pos..pos + datatype_size];
    let dtype = dtype::parse_datatype(datatype_bytes)?;
    pos += datatype_padded;

    let dataspace_bytes = &body[pos..pos + dataspace_size];
    let dataspace = dtype::parse_dataspace(dataspace_bytes)?;
    pos += dataspace_padded;

    let data = body[pos..].to_vec();
    Ok(Attribute { name, dtype, dataspace, data })
}

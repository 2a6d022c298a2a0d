//! Filter pipeline parsing and codec registry (spec.md §4.10).
//!
//! Matches `zh5/codecs.py::FilterPipelineMessageV1/V2` and
//! `FilterDescriptionV1/V2` byte layouts. The codec registry is in-crate
//! rather than pluggable, since no codec-plugin crate is part of the
//! retrieved stack: `flate2` backs deflate, the other two are small enough
//! to hand-roll directly against the format they decode.

use crate::error::{Error, Result};
use nom::bytes::complete::take;
use nom::error::context;
use nom::multi::count;
use nom::number::complete::{le_u16, le_u32};

/// One decoded filter-pipeline entry: an id plus whatever client data the
/// message carried for it (`FilterDescriptionV1::client_data`).
#[derive(Debug, Clone)]
pub struct Filter {
    pub id: u16,
    pub name: String,
    pub client_data: Vec<u32>,
}

/// Parses a type-11 filter pipeline message body (either wire version).
pub fn parse_pipeline_message(body: &[u8]) -> Result<Vec<Filter>> {
    if body.is_empty() {
        return Err(Error::Corrupt("empty filter pipeline message".into()));
    }
    match body[0] {
        1 => parse_v1(body),
        2 => parse_v2(body),
        other => Err(Error::UnsupportedVersion(format!("filter pipeline message version {other}"))),
    }
}

struct V1FilterPrefix {
    id: u16,
    name_len: u16,
    n_client_values: u16,
}

/// `{id:u16, name_len:u16, flags:u16, n_client_values:u16}`
/// (`FilterDescriptionV1`).
fn v1_filter_prefix(input: &[u8]) -> crate::superblock::PResult<V1FilterPrefix> {
    context("v1 filter prefix", |input| {
        let (input, id) = le_u16(input)?;
        let (input, name_len) = le_u16(input)?;
        let (input, _flags) = le_u16(input)?;
        let (input, n_client_values) = le_u16(input)?;
        Ok((input, V1FilterPrefix { id, name_len, n_client_values }))
    })(input)
}

fn parse_v1(body: &[u8]) -> Result<Vec<Filter>> {
    let n_filters = body[1] as usize;
    let mut pos = 8; // version(1) + n_filters(1) + 6 reserved
    let mut out = Vec::with_capacity(n_filters);
    for _ in 0..n_filters {
        let (_, prefix) = v1_filter_prefix(&body[pos..pos + 8])
            .map_err(|e| Error::Corrupt(format!("v1 filter prefix: {e:?}")))?;
        pos += 8;
        let name_len = prefix.name_len as usize;
        let n_client_values = prefix.n_client_values as usize;
        let name = if name_len > 0 {
            let (_, raw) = take::<_, _, nom::error::VerboseError<&[u8]>>(name_len)(&body[pos..])
                .map_err(|e| Error::Corrupt(format!("v1 filter name: {e:?}")))?;
            pos += pad_to_8(name_len);
            String::from_utf8_lossy(raw).trim_end_matches('\0').to_string()
        } else {
            String::new()
        };
        let (_, client_data) = count(le_u32, n_client_values)(&body[pos..])
            .map_err(|e: nom::Err<nom::error::VerboseError<&[u8]>>| {
                Error::Corrupt(format!("v1 filter client data: {e:?}"))
            })?;
        pos += n_client_values * 4;
        if n_client_values % 2 == 1 {
            pos += 4; // padding to a multiple of 8 bytes
        }
        out.push(Filter { id: prefix.id, name: registry_name(prefix.id, name), client_data });
    }
    Ok(out)
}

fn parse_v2(body: &[u8]) -> Result<Vec<Filter>> {
    let n_filters = body[1] as usize;
    let mut rest = &body[2..];
    let mut out = Vec::with_capacity(n_filters);
    for _ in 0..n_filters {
        let (tail, id) = le_u16::<_, nom::error::VerboseError<&[u8]>>(rest)
            .map_err(|e| Error::Corrupt(format!("v2 filter id: {e:?}")))?;
        let (tail, name) = if id < 256 {
            (tail, String::new())
        } else {
            let (tail, name_len) = le_u16::<_, nom::error::VerboseError<&[u8]>>(tail)
                .map_err(|e| Error::Corrupt(format!("v2 filter name length: {e:?}")))?;
            let (tail, raw) = take::<_, _, nom::error::VerboseError<&[u8]>>(name_len as usize)(tail)
                .map_err(|e| Error::Corrupt(format!("v2 filter name: {e:?}")))?;
            (tail, String::from_utf8_lossy(raw).trim_end_matches('\0').to_string())
        };
        let (tail, (_flags, n_client_values)) =
            context("v2 filter flags and count", |input: &[u8]| {
                let (input, flags) = le_u16(input)?;
                let (input, n_client_values) = le_u16(input)?;
                Ok((input, (flags, n_client_values)))
            })(tail)
            .map_err(|e: nom::Err<nom::error::VerboseError<&[u8]>>| {
                Error::Corrupt(format!("v2 filter flags: {e:?}"))
            })?;
        let (tail, client_data) = count(le_u32, n_client_values as usize)(tail)
            .map_err(|e: nom::Err<nom::error::VerboseError<&[u8]>>| {
                Error::Corrupt(format!("v2 filter client data: {e:?}"))
            })?;
        rest = tail;
        out.push(Filter { id, name: registry_name(id, name), client_data });
    }
    Ok(out)
}

fn pad_to_8(len: usize) -> usize {
    (len + 7) & !7
}

fn registry_name(id: u16, declared: String) -> String {
    if !declared.is_empty() {
        return declared;
    }
    match id {
        1 => "deflate".to_string(),
        2 => "shuffle".to_string(),
        3 => "fletcher32".to_string(),
        _ => format!("filter-{id}"),
    }
}

/// Applies the pipeline's filters in reverse order (`filters[::-1]` in the
/// original) to decode a chunk's on-disk bytes back to raw element bytes.
pub fn decode(filters: &[Filter], element_size: usize, mut data: Vec<u8>) -> Result<Vec<u8>> {
    for filter in filters.iter().rev() {
        data = match filter.id {
            1 => inflate(&data)?,
            2 => unshuffle(&data, element_size),
            3 => verify_and_strip_fletcher32(&data)?,
            other => return Err(Error::UnsupportedFilter(other)),
        };
    }
    Ok(data)
}

fn inflate(data: &[u8]) -> Result<Vec<u8>> {
    use std::io::Read;
    let mut decoder = flate2::read::ZlibDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

/// Reverses the byte-shuffle filter: on-disk bytes are grouped by byte
/// position across all elements, so element `i`'s byte `b` sits at
/// `b * n_elements + i`.
fn unshuffle(data: &[u8], element_size: usize) -> Vec<u8> {
    if element_size <= 1 {
        return data.to_vec();
    }
    let n_elements = data.len() / element_size;
    let mut out = vec![0u8; data.len()];
    for elem in 0..n_elements {
        for byte in 0..element_size {
            out[elem * element_size + byte] = data[byte * n_elements + elem];
        }
    }
    out
}

fn verify_and_strip_fletcher32(data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < 4 {
        return Err(Error::Corrupt("fletcher32 chunk shorter than checksum".into()));
    }
    let (payload, checksum_bytes) = data.split_at(data.len() - 4);
    let stored = u32::from_le_bytes(checksum_bytes.try_into().unwrap());
    let computed = fletcher32(payload);
    if stored != computed {
        return Err(Error::Corrupt(format!(
            "fletcher32 checksum mismatch: stored {stored:#x}, computed {computed:#x}"
        )));
    }
    Ok(payload.to_vec())
}

fn fletcher32(data: &[u8]) -> u32 {
    let mut sum1: u32 = 0;
    let mut sum2: u32 = 0;
    let words = data.chunks(2);
    for chunk in words {
        let word = if chunk.len() == 2 {
            u16::from_le_bytes([chunk[0], chunk[1]]) as u32
        } else {
            chunk[0] as u32
        };
        sum1 = (sum1 + word) % 65535;
        sum2 = (sum2 + sum1) % 65535;
    }
    (sum2 << 16) | sum1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v2_short_form_parses_id_below_256_with_no_name() {
        let mut body = Vec::new();
        body.push(2); // version
        body.push(1); // n_filters
        body.extend_from_slice(&1u16.to_le_bytes()); // id: deflate
        body.extend_from_slice(&0u16.to_le_bytes()); // flags
        body.extend_from_slice(&1u16.to_le_bytes()); // n_client_values
        body.extend_from_slice(&6u32.to_le_bytes()); // compression level

        let filters = parse_pipeline_message(&body).unwrap();
        assert_eq!(filters.len(), 1);
        assert_eq!(filters[0].id, 1);
        assert_eq!(filters[0].name, "deflate");
        assert_eq!(filters[0].client_data, vec![6]);
    }

    #[test]
    fn unshuffle_inverts_shuffle_for_four_byte_elements() {
        let original: [u8; 8] = [1, 2, 3, 4, 5, 6, 7, 8];
        let element_size = 4;
        let n = original.len() / element_size;
        let mut shuffled = vec![0u8; original.len()];
        for elem in 0..n {
            for byte in 0..element_size {
                shuffled[byte * n + elem] = original[elem * element_size + byte];
            }
        }
        assert_eq!(unshuffle(&shuffled, element_size), original.to_vec());
    }

    #[test]
    fn fletcher32_round_trips_through_decode() {
        let payload = b"abcdefgh".to_vec();
        let checksum = fletcher32(&payload);
        let mut framed = payload.clone();
        framed.extend_from_slice(&checksum.to_le_bytes());
        let filters = vec![Filter { id: 3, name: "fletcher32".into(), client_data: vec![] }];
        let decoded = decode(&filters, 1, framed).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn fletcher32_rejects_corrupted_payload() {
        let payload = b"abcdefgh".to_vec();
        let checksum = fletcher32(&payload) ^ 0xFFFF_FFFF;
        let mut framed = payload;
        framed.extend_from_slice(&checksum.to_le_bytes());
        let filters = vec![Filter { id: 3, name: "fletcher32".into(), client_data: vec![] }];
        assert!(decode(&filters, 1, framed).is_err());
    }
}

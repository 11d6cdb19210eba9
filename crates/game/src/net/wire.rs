use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt};
use glam::DVec2;
use serde::de::DeserializeOwned;

pub const NAME_FIELD: usize = 50;

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("datagram truncated")]
    Truncated,
    #[error("unknown packet tag {0}")]
    UnknownTag(u8),
    #[error("payload of {len} bytes exceeds the {limit} byte limit")]
    Oversize { len: usize, limit: usize },
    #[error("malformed string field")]
    BadString,
    #[error("packet kind cannot be routed through a connection")]
    Unroutable,
    #[error("malformed json payload: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<std::io::Error> for WireError {
    fn from(_: std::io::Error) -> Self {
        WireError::Truncated
    }
}

pub type Reader<'a> = Cursor<&'a [u8]>;

pub fn remaining(cur: &Reader<'_>) -> usize {
    cur.get_ref().len().saturating_sub(cur.position() as usize)
}

pub fn read_f32(cur: &mut Reader<'_>) -> Result<f32, WireError> {
    Ok(cur.read_f32::<LittleEndian>()?)
}

pub fn read_f64(cur: &mut Reader<'_>) -> Result<f64, WireError> {
    Ok(cur.read_f64::<LittleEndian>()?)
}

pub fn read_u32(cur: &mut Reader<'_>) -> Result<u32, WireError> {
    Ok(cur.read_u32::<LittleEndian>()?)
}

pub fn read_rgb(cur: &mut Reader<'_>) -> Result<[u8; 3], WireError> {
    let mut rgb = [0u8; 3];
    cur.read_exact(&mut rgb)?;
    Ok(rgb)
}

pub fn read_dvec2(cur: &mut Reader<'_>) -> Result<DVec2, WireError> {
    Ok(DVec2::new(read_f64(cur)?, read_f64(cur)?))
}

pub fn write_dvec2(buf: &mut Vec<u8>, v: DVec2) {
    buf.extend_from_slice(&v.x.to_le_bytes());
    buf.extend_from_slice(&v.y.to_le_bytes());
}

/// Fixed 50-byte Pascal string: one length byte then up to 49 bytes of
/// UTF-8, zero padded.
pub fn read_name(cur: &mut Reader<'_>) -> Result<String, WireError> {
    let mut raw = [0u8; NAME_FIELD];
    cur.read_exact(&mut raw)?;
    let len = (raw[0] as usize).min(NAME_FIELD - 1);
    String::from_utf8(raw[1..1 + len].to_vec()).map_err(|_| WireError::BadString)
}

pub fn write_name(buf: &mut Vec<u8>, name: &str) {
    let mut bytes = name.as_bytes();
    if bytes.len() > NAME_FIELD - 1 {
        let mut cut = NAME_FIELD - 1;
        while !name.is_char_boundary(cut) {
            cut -= 1;
        }
        bytes = &bytes[..cut];
    }
    buf.push(bytes.len() as u8);
    buf.extend_from_slice(bytes);
    buf.resize(buf.len() + (NAME_FIELD - 1 - bytes.len()), 0);
}

/// Consume the remainder of the buffer as a JSON document.
pub fn read_json<T: DeserializeOwned>(cur: &mut Reader<'_>) -> Result<T, WireError> {
    let pos = cur.position() as usize;
    let rest = &cur.get_ref()[pos..];
    let value = serde_json::from_slice(rest)?;
    cur.set_position(cur.get_ref().len() as u64);
    Ok(value)
}

pub fn read_utf8(cur: &mut Reader<'_>) -> Result<String, WireError> {
    let pos = cur.position() as usize;
    let rest = &cur.get_ref()[pos..];
    cur.set_position(cur.get_ref().len() as u64);
    String::from_utf8(rest.to_vec()).map_err(|_| WireError::BadString)
}

/// Pack booleans into bytes, most significant bit first.
pub fn pack_bits(flags: &[bool]) -> Vec<u8> {
    let mut out = vec![0u8; flags.len().div_ceil(8)];
    for (i, &flag) in flags.iter().enumerate() {
        if flag {
            out[i / 8] |= 0x80 >> (i % 8);
        }
    }
    out
}

/// Inverse of [`pack_bits`]: every bit of the input, MSB first.
pub fn unpack_bits(bytes: &[u8]) -> Vec<bool> {
    let mut out = Vec::with_capacity(bytes.len() * 8);
    for &byte in bytes {
        for bit in 0..8 {
            out.push(byte & (0x80 >> bit) != 0);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_round_trip() {
        let mut buf = Vec::new();
        write_name(&mut buf, "player one");
        assert_eq!(buf.len(), NAME_FIELD);
        let mut cur = Reader::new(&buf);
        assert_eq!(read_name(&mut cur).unwrap(), "player one");
    }

    #[test]
    fn long_names_are_truncated() {
        let long = "x".repeat(120);
        let mut buf = Vec::new();
        write_name(&mut buf, &long);
        assert_eq!(buf.len(), NAME_FIELD);
        let mut cur = Reader::new(&buf);
        assert_eq!(read_name(&mut cur).unwrap().len(), NAME_FIELD - 1);
    }

    #[test]
    fn bit_packing_is_msb_first() {
        let mut flags = [false; 8];
        flags[0] = true;
        flags[7] = true;
        assert_eq!(pack_bits(&flags), vec![0x81]);
        let unpacked = unpack_bits(&[0x81]);
        assert!(unpacked[0] && unpacked[7]);
        assert!(!unpacked[1] && !unpacked[6]);
    }

    #[test]
    fn bit_packing_round_trip() {
        let flags: Vec<bool> = (0..32).map(|i| i % 3 == 0).collect();
        assert_eq!(&unpack_bits(&pack_bits(&flags))[..32], &flags[..]);
    }
}

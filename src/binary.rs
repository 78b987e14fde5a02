//! Fixed-width binary encode/decode helpers.
//!
//! Thin wrappers over `byteorder` for the primitive kinds the rest of the
//! crate needs: fixed-width integers, floats, booleans, and a length-prefixed
//! "short string" (16-bit length prefix, UTF-8, at most 65535 bytes).

use crate::error::{Result, StorageError};
use byteorder::{ReadBytesExt, WriteBytesExt, LE};
use std::io::{self, Read, Write};

/// Maximum byte length of a short string's UTF-8 payload.
pub const MAX_SHORT_STRING_LEN: usize = u16::MAX as usize;

pub fn write_u8<W: Write>(w: &mut W, v: u8) -> io::Result<()> {
    w.write_u8(v)
}

pub fn read_u8<R: Read>(r: &mut R) -> io::Result<u8> {
    r.read_u8()
}

pub fn write_bool<W: Write>(w: &mut W, v: bool) -> io::Result<()> {
    w.write_u8(if v { 1 } else { 0 })
}

pub fn read_bool<R: Read>(r: &mut R) -> io::Result<bool> {
    Ok(r.read_u8()? != 0)
}

pub fn write_u16_le<W: Write>(w: &mut W, v: u16) -> io::Result<()> {
    w.write_u16::<LE>(v)
}

pub fn read_u16_le<R: Read>(r: &mut R) -> io::Result<u16> {
    r.read_u16::<LE>()
}

pub fn write_u32_le<W: Write>(w: &mut W, v: u32) -> io::Result<()> {
    w.write_u32::<LE>(v)
}

pub fn read_u32_le<R: Read>(r: &mut R) -> io::Result<u32> {
    r.read_u32::<LE>()
}

pub fn write_u64_le<W: Write>(w: &mut W, v: u64) -> io::Result<()> {
    w.write_u64::<LE>(v)
}

pub fn read_u64_le<R: Read>(r: &mut R) -> io::Result<u64> {
    r.read_u64::<LE>()
}

pub fn write_i64_le<W: Write>(w: &mut W, v: i64) -> io::Result<()> {
    w.write_i64::<LE>(v)
}

pub fn read_i64_le<R: Read>(r: &mut R) -> io::Result<i64> {
    r.read_i64::<LE>()
}

pub fn write_f64_le<W: Write>(w: &mut W, v: f64) -> io::Result<()> {
    w.write_f64::<LE>(v)
}

pub fn read_f64_le<R: Read>(r: &mut R) -> io::Result<f64> {
    r.read_f64::<LE>()
}

/// Encodes a string as a 16-bit little-endian byte-length prefix followed
/// by its UTF-8 bytes. Fails if the encoding exceeds 65535 bytes.
pub fn write_short_string<W: Write>(w: &mut W, s: &str) -> Result<()> {
    let bytes = s.as_bytes();
    if bytes.len() > MAX_SHORT_STRING_LEN {
        return Err(StorageError::argument(format!(
            "short string of {} bytes exceeds the {} byte limit",
            bytes.len(),
            MAX_SHORT_STRING_LEN
        )));
    }
    w.write_u16::<LE>(bytes.len() as u16)?;
    w.write_all(bytes)?;
    Ok(())
}

/// Reads back a short string written by [`write_short_string`].
pub fn read_short_string<R: Read>(r: &mut R) -> Result<String> {
    let len = r.read_u16::<LE>()? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|e| StorageError::corrupt(format!("invalid utf-8: {e}")))
}

/// Encoded size, in bytes, of a short string (2-byte prefix + payload).
pub fn short_string_size(s: &str) -> usize {
    2 + s.as_bytes().len()
}

/// An FNV-1a-style running accumulator over a 32-bit checksum, used to
/// guard the header's preceding fields without pulling in a CRC crate.
pub fn checksum32(bytes: &[u8]) -> u32 {
    let mut acc: u32 = 0x811c_9dc5;
    for &b in bytes {
        acc ^= b as u32;
        acc = acc.wrapping_mul(0x0100_0193);
    }
    acc
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn short_string_round_trips() {
        let mut buf = Vec::new();
        write_short_string(&mut buf, "hello, world").unwrap();
        assert_eq!(buf.len(), short_string_size("hello, world"));
        let mut cur = Cursor::new(buf);
        let s = read_short_string(&mut cur).unwrap();
        assert_eq!(s, "hello, world");
    }

    #[test]
    fn short_string_rejects_oversized_payload() {
        let s = "x".repeat(MAX_SHORT_STRING_LEN + 1);
        let mut buf = Vec::new();
        assert!(write_short_string(&mut buf, &s).is_err());
    }

    #[test]
    fn checksum_changes_with_content() {
        assert_ne!(checksum32(b"abc"), checksum32(b"abd"));
    }

    #[test]
    fn fixed_width_round_trip() {
        let mut buf = Vec::new();
        write_u64_le(&mut buf, 0x0102_0304_0506_0708).unwrap();
        write_i64_le(&mut buf, -1).unwrap();
        write_bool(&mut buf, true).unwrap();
        write_f64_le(&mut buf, 3.5).unwrap();
        let mut cur = Cursor::new(buf);
        assert_eq!(read_u64_le(&mut cur).unwrap(), 0x0102_0304_0506_0708);
        assert_eq!(read_i64_le(&mut cur).unwrap(), -1);
        assert_eq!(read_bool(&mut cur).unwrap(), true);
        assert_eq!(read_f64_le(&mut cur).unwrap(), 3.5);
    }
}

//! Little-endian encode/decode helpers for the persisted stream formats.
//!
//! Headers are assembled in a `Vec<u8>` and written with a single
//! `write_all`; on the way back they are read with `read_exact` into a
//! fixed buffer and decoded with a cursor. A short read surfaces as the
//! reader's own `UnexpectedEof`, which propagates unchanged.

use std::io::{Read, Write};

use chapterdex_error::{IndexError, Result};

pub fn append_u16_le(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_le_bytes());
}

pub fn append_u32_le(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

pub fn append_u64_le(buf: &mut Vec<u8>, value: u64) {
    buf.extend_from_slice(&value.to_le_bytes());
}

pub fn read_u16_le(bytes: &[u8], cursor: &mut usize, field: &str) -> Result<u16> {
    let raw = read_array::<2>(bytes, cursor, field)?;
    Ok(u16::from_le_bytes(raw))
}

pub fn read_u32_le(bytes: &[u8], cursor: &mut usize, field: &str) -> Result<u32> {
    let raw = read_array::<4>(bytes, cursor, field)?;
    Ok(u32::from_le_bytes(raw))
}

pub fn read_u64_le(bytes: &[u8], cursor: &mut usize, field: &str) -> Result<u64> {
    let raw = read_array::<8>(bytes, cursor, field)?;
    Ok(u64::from_le_bytes(raw))
}

pub fn read_array<const N: usize>(
    bytes: &[u8],
    cursor: &mut usize,
    field: &str,
) -> Result<[u8; N]> {
    let end = cursor
        .checked_add(N)
        .ok_or_else(|| IndexError::corrupt(format!("overflow reading field {field}")))?;
    if end > bytes.len() {
        return Err(IndexError::corrupt(format!(
            "field {field} out of bounds: need {N} bytes at offset {}, total {}",
            *cursor,
            bytes.len()
        )));
    }
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[*cursor..end]);
    *cursor = end;
    Ok(out)
}

/// Read exactly `N` bytes from a stream.
pub fn read_block<const N: usize, R: Read + ?Sized>(reader: &mut R) -> Result<[u8; N]> {
    let mut out = [0u8; N];
    reader.read_exact(&mut out)?;
    Ok(out)
}

/// Read `count` little-endian u64 values from a stream.
pub fn read_u64_les<R: Read + ?Sized>(reader: &mut R, count: usize) -> Result<Vec<u64>> {
    let mut raw = vec![0u8; count * 8];
    reader.read_exact(&mut raw)?;
    Ok(raw
        .chunks_exact(8)
        .map(|chunk| {
            let mut word = [0u8; 8];
            word.copy_from_slice(chunk);
            u64::from_le_bytes(word)
        })
        .collect())
}

/// Write a slice of u64 values little-endian.
pub fn write_u64_les<W: Write + ?Sized>(writer: &mut W, values: &[u64]) -> Result<()> {
    let mut raw = Vec::with_capacity(values.len() * 8);
    for &value in values {
        append_u64_le(&mut raw, value);
    }
    writer.write_all(&raw)?;
    Ok(())
}

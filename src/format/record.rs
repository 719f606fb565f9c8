//! Little helpers for pulling fixed-layout records out of mapped bytes.
//!
//! Every record decoder checks its input is long enough up front
//! (see [`check_len`]), after which the `read_*` helpers can't run dry.

use std::borrow::Cow;
use std::convert::TryInto;

use chrono::DateTime;
use memchr::memchr;

use crate::result::*;

/// Fails unless `bytes` holds at least `needed` bytes of `what`.
pub fn check_len(bytes: &[u8], needed: usize, what: &'static str) -> PakResult<()> {
    if bytes.len() < needed {
        return Err(MappingError::TooSmall {
            what,
            needed: needed as u64,
            available: bytes.len() as u64,
        }
        .into());
    }
    Ok(())
}

// Straight from the Rust docs:

/// Reads a little-endian u64 from the front of the provided slice, shrinking it.
pub fn read_u64(input: &mut &[u8]) -> u64 {
    let (int_bytes, rest) = input.split_at(std::mem::size_of::<u64>());
    *input = rest;
    u64::from_le_bytes(int_bytes.try_into().expect("less than eight bytes for u64"))
}

/// Reads a little-endian u32 from the front of the provided slice, shrinking it.
pub fn read_u32(input: &mut &[u8]) -> u32 {
    let (int_bytes, rest) = input.split_at(std::mem::size_of::<u32>());
    *input = rest;
    u32::from_le_bytes(int_bytes.try_into().expect("less than four bytes for u32"))
}

/// Reads a little-endian i32 from the front of the provided slice, shrinking it.
pub fn read_i32(input: &mut &[u8]) -> i32 {
    read_u32(input) as i32
}

/// Reads a little-endian u16 from the front of the provided slice, shrinking it.
pub fn read_u16(input: &mut &[u8]) -> u16 {
    let (int_bytes, rest) = input.split_at(std::mem::size_of::<u16>());
    *input = rest;
    u16::from_le_bytes(int_bytes.try_into().expect("less than two bytes for u16"))
}

/// Reads a byte from the front of the provided slice, shrinking it.
pub fn read_u8(input: &mut &[u8]) -> u8 {
    let byte = input[0];
    *input = &input[1..];
    byte
}

/// Splits `n` bytes off the front of the provided slice.
pub fn read_bytes<'a>(input: &mut &'a [u8], n: usize) -> &'a [u8] {
    let (bytes, rest) = input.split_at(n);
    *input = rest;
    bytes
}

/// Reads a fixed-size array from the front of the provided slice.
pub fn read_array<const N: usize>(input: &mut &[u8]) -> [u8; N] {
    read_bytes(input, N).try_into().expect("split_at() gave the wrong length")
}

/// Reads a little-endian u32 at `offset` without consuming anything,
/// or `None` if it doesn't fit.
pub fn u32_at(bytes: &[u8], offset: usize) -> Option<u32> {
    let end = offset.checked_add(4)?;
    let int_bytes = bytes.get(offset..end)?;
    Some(u32::from_le_bytes(int_bytes.try_into().ok()?))
}

/// Reads a little-endian u16 at `offset` without consuming anything,
/// or `None` if it doesn't fit.
pub fn u16_at(bytes: &[u8], offset: usize) -> Option<u16> {
    let end = offset.checked_add(2)?;
    let int_bytes = bytes.get(offset..end)?;
    Some(u16::from_le_bytes(int_bytes.try_into().ok()?))
}

/// The bytes of a NUL-terminated string (terminator excluded).
/// Unterminated strings run to the end of the slice.
pub fn c_bytes(bytes: &[u8]) -> &[u8] {
    match memchr(0, bytes) {
        Some(nul) => &bytes[..nul],
        None => bytes,
    }
}

/// Decodes a NUL-terminated (or NUL-padded) name.
///
/// Names in these formats are almost always ASCII;
/// anything else is replaced rather than failing the whole package.
pub fn c_str(bytes: &[u8]) -> Cow<'_, str> {
    String::from_utf8_lossy(c_bytes(bytes))
}

/// Decodes a NUL-terminated UTF-16LE name (SGA stores its archive name this way).
pub fn c_wstr(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .take_while(|&unit| unit != 0)
        .collect();
    String::from_utf16_lossy(&units)
}

/// Formats a Unix timestamp the way item attributes show dates,
/// or `None` if it's out of range.
pub fn format_unix_time(seconds: u32) -> Option<String> {
    let time = DateTime::from_timestamp(i64::from(seconds), 0)?;
    Some(time.format("%Y-%m-%d %H:%M:%S").to_string())
}

/// Formats a four-byte signature for error messages,
/// printable if it's ASCII and hex otherwise.
pub fn describe_signature(bytes: &[u8]) -> String {
    if !bytes.is_empty() && bytes.iter().all(|b| b.is_ascii_graphic() || *b == b' ') {
        format!("{:?}", String::from_utf8_lossy(bytes))
    } else {
        let hex: Vec<String> = bytes.iter().map(|b| format!("{:02x}", b)).collect();
        format!("0x{}", hex.join(""))
    }
}

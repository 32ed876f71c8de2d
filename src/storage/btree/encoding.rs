//! Varint and big-endian integer primitives for page and cell images
//!
//! Offsets handed to the `get*`/`put*` helpers are validated by the page
//! codec before use; the checked `read_*` variants are for header bytes
//! that have not been validated yet.

use crate::error::{Error, ErrorCode, Result};

/// Read a varint at the given offset, returns (value, bytes_consumed)
pub fn read_varint_at(data: &[u8], start: usize) -> (u64, usize) {
    if start >= data.len() {
        return (0, 0);
    }

    let mut value: u64 = 0;
    let mut bytes = 0;

    for i in 0..9 {
        if start + i >= data.len() {
            break;
        }
        let b = data[start + i];
        if i < 8 {
            value = (value << 7) | (b & 0x7f) as u64;
            bytes += 1;
            if b & 0x80 == 0 {
                break;
            }
        } else {
            // 9th byte uses all 8 bits
            value = (value << 8) | b as u64;
            bytes += 1;
        }
    }

    (value, bytes)
}

/// Read a varint from the given offset in a byte slice
pub fn read_varint(data: &[u8], offset: usize) -> Result<(u64, usize)> {
    let (value, consumed) = read_varint_at(data, offset);
    if consumed == 0 {
        return Err(Error::new(ErrorCode::Corrupt));
    }
    Ok((value, consumed))
}

/// Read a varint that is known to hold a 32-bit quantity (payload sizes).
/// Larger values saturate so that size checks downstream reject them.
pub fn read_varint32(data: &[u8], offset: usize) -> Result<(u32, usize)> {
    let (val, consumed) = read_varint(data, offset)?;
    Ok((u32::try_from(val).unwrap_or(u32::MAX), consumed))
}

/// Number of bytes a varint occupies, without decoding it
pub fn varint_skip(data: &[u8], offset: usize) -> usize {
    let mut n = 0;
    while n < 9 && offset + n < data.len() {
        let b = data[offset + n];
        n += 1;
        if b & 0x80 == 0 {
            break;
        }
    }
    n
}

/// Calculate the number of bytes needed to encode a varint
pub fn varint_len(value: u64) -> usize {
    if value <= 0x7f {
        1
    } else if value <= 0x3fff {
        2
    } else if value <= 0x1f_ffff {
        3
    } else if value <= 0x0fff_ffff {
        4
    } else if value <= 0x07_ffff_ffff {
        5
    } else if value <= 0x03ff_ffff_ffff {
        6
    } else if value <= 0x01_ffff_ffff_ffff {
        7
    } else if value <= 0x00ff_ffff_ffff_ffff {
        8
    } else {
        9
    }
}

/// Write a varint at the start of a buffer, returns bytes written
pub fn put_varint_at(buf: &mut [u8], value: u64) -> usize {
    let len = varint_len(value);
    if buf.len() < len {
        return 0;
    }
    if len == 9 {
        buf[8] = (value & 0xFF) as u8;
        let mut v = value >> 8;
        for i in (0..8).rev() {
            buf[i] = ((v & 0x7F) | 0x80) as u8;
            v >>= 7;
        }
    } else {
        let mut v = value;
        for i in (0..len).rev() {
            if i == len - 1 {
                buf[i] = (v & 0x7F) as u8;
            } else {
                buf[i] = ((v & 0x7F) | 0x80) as u8;
            }
            v >>= 7;
        }
    }
    len
}

/// Write a varint value to a Vec
pub fn write_varint(value: u64, out: &mut Vec<u8>) {
    let len = varint_len(value);
    let start = out.len();
    out.resize(start + len, 0);
    put_varint_at(&mut out[start..], value);
}

/// Read a u16 from a byte slice at the given offset
pub fn read_u16(data: &[u8], offset: usize) -> Option<u16> {
    if offset + 2 > data.len() {
        return None;
    }
    Some(u16::from_be_bytes([data[offset], data[offset + 1]]))
}

/// Read a u32 from a byte slice at the given offset
pub fn read_u32(data: &[u8], offset: usize) -> Option<u32> {
    if offset + 4 > data.len() {
        return None;
    }
    Some(u32::from_be_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ]))
}

#[inline]
pub fn get2(data: &[u8], offset: usize) -> usize {
    u16::from_be_bytes([data[offset], data[offset + 1]]) as usize
}

/// Like [`get2`], but a stored zero reads as 65536 (content-area start).
#[inline]
pub fn get2_nonzero(data: &[u8], offset: usize) -> usize {
    match get2(data, offset) {
        0 => 65536,
        v => v,
    }
}

/// Store the low 16 bits of `value`; 65536 is stored as zero.
#[inline]
pub fn put2(data: &mut [u8], offset: usize, value: usize) {
    data[offset..offset + 2].copy_from_slice(&(value as u16).to_be_bytes());
}

#[inline]
pub fn get4(data: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

#[inline]
pub fn put4(data: &mut [u8], offset: usize, value: u32) {
    data[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varint_lengths_match_encoding() {
        for value in [0u64, 0x7f, 0x80, 0x3fff, 0x4000, 1 << 35, u64::MAX] {
            let mut buf = Vec::new();
            write_varint(value, &mut buf);
            assert_eq!(buf.len(), varint_len(value));
            assert_eq!(read_varint(&buf, 0).unwrap(), (value, buf.len()));
            assert_eq!(varint_skip(&buf, 0), buf.len());
        }
    }

    #[test]
    fn test_negative_rowid_uses_nine_bytes() {
        let mut buf = Vec::new();
        write_varint(-1i64 as u64, &mut buf);
        assert_eq!(buf.len(), 9);
        let (value, _) = read_varint(&buf, 0).unwrap();
        assert_eq!(value as i64, -1);
    }

    #[test]
    fn test_content_start_zero_means_65536() {
        let mut data = [0u8; 4];
        put2(&mut data, 0, 65536);
        assert_eq!(get2(&data, 0), 0);
        assert_eq!(get2_nonzero(&data, 0), 65536);
        put4(&mut data, 0, 0xdead_beef);
        assert_eq!(get4(&data, 0), 0xdead_beef);
        assert_eq!(read_u32(&data, 0), Some(0xdead_beef));
        assert_eq!(read_u32(&data, 1), None);
    }

    #[test]
    fn test_truncated_varint_is_corrupt() {
        assert!(read_varint(&[], 0).is_err());
        assert!(read_varint(&[0x81], 3).is_err());
    }
}

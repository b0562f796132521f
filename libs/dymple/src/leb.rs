//! ULEB128/SLEB128 operand decoding for the linker bytecodes.

use anillo_std::{Kind, Result};

/// Read one unsigned LEB128 value, advancing `pos`.
pub fn read_uleb(bytes: &[u8], pos: &mut usize) -> Result<u64> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    loop {
        let byte = *bytes.get(*pos).ok_or(Kind::InvalidArgument)?;
        *pos += 1;
        if shift >= 64 {
            return Err(Kind::InvalidArgument);
        }
        value |= u64::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

/// Read one signed LEB128 value, advancing `pos`.
pub fn read_sleb(bytes: &[u8], pos: &mut usize) -> Result<i64> {
    let mut value: i64 = 0;
    let mut shift = 0u32;
    loop {
        let byte = *bytes.get(*pos).ok_or(Kind::InvalidArgument)?;
        *pos += 1;
        if shift >= 64 {
            return Err(Kind::InvalidArgument);
        }
        value |= i64::from(byte & 0x7F) << shift;
        shift += 7;
        if byte & 0x80 == 0 {
            // Sign-extend if the sign bit of the last group is set.
            if shift < 64 && byte & 0x40 != 0 {
                value |= -1i64 << shift;
            }
            return Ok(value);
        }
    }
}

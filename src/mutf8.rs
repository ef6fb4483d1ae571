//! Modified UTF-8, the string encoding of class-file `CONSTANT_Utf8` entries.
//!
//! Differs from standard UTF-8 in two ways: U+0000 is written as the two bytes `C0 80`,
//! and characters outside the BMP are written as two separately encoded surrogates.

use crate::error::{ClassFileError, ClassResult};

pub fn encode(s: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(s.len());
    for unit in s.encode_utf16() {
        push_unit(&mut out, unit);
    }
    out
}

fn push_unit(out: &mut Vec<u8>, unit: u16) {
    match unit {
        0x0001..=0x007F => out.push(unit as u8),
        0x0000 | 0x0080..=0x07FF => {
            out.push(0xC0 | ((unit >> 6) & 0x1F) as u8);
            out.push(0x80 | (unit & 0x3F) as u8);
        }
        _ => {
            out.push(0xE0 | ((unit >> 12) & 0x0F) as u8);
            out.push(0x80 | ((unit >> 6) & 0x3F) as u8);
            out.push(0x80 | (unit & 0x3F) as u8);
        }
    }
}

/// Decodes to UTF-16 code units, the JVM's view of a string.
pub fn decode_units(bytes: &[u8]) -> ClassResult<Vec<u16>> {
    let mut units = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if b & 0x80 == 0 {
            if b == 0 {
                return Err(ClassFileError::BadUtf8);
            }
            units.push(b as u16);
            i += 1;
        } else if b & 0xE0 == 0xC0 {
            let b2 = *bytes.get(i + 1).ok_or(ClassFileError::BadUtf8)?;
            if b2 & 0xC0 != 0x80 {
                return Err(ClassFileError::BadUtf8);
            }
            units.push((((b & 0x1F) as u16) << 6) | (b2 & 0x3F) as u16);
            i += 2;
        } else if b & 0xF0 == 0xE0 {
            let b2 = *bytes.get(i + 1).ok_or(ClassFileError::BadUtf8)?;
            let b3 = *bytes.get(i + 2).ok_or(ClassFileError::BadUtf8)?;
            if b2 & 0xC0 != 0x80 || b3 & 0xC0 != 0x80 {
                return Err(ClassFileError::BadUtf8);
            }
            units.push((((b & 0x0F) as u16) << 12) | (((b2 & 0x3F) as u16) << 6) | (b3 & 0x3F) as u16);
            i += 3;
        } else {
            return Err(ClassFileError::BadUtf8);
        }
    }
    Ok(units)
}

/// Decodes to a Rust string. Fails on malformed bytes and on unpaired surrogates.
pub fn decode(bytes: &[u8]) -> ClassResult<String> {
    let units = decode_units(bytes)?;
    String::from_utf16(&units).map_err(|_| ClassFileError::BadUtf8)
}

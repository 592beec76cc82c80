//! Order-preserving, fixed-width encoding for predicate keys.
//!
//! Every encoded key starts with a one-byte type prefix followed by a
//! big-endian payload whose width depends only on the type. Byte-wise
//! comparison of two encodings of the same type matches the type's own
//! ordering, and byte equality matches the type's equality.

use super::EncodingError;
use crate::error::Result;

// Type prefixes. Order matters: these determine cross-type ordering
pub const TYPE_BOOLEAN: u8 = 0x01;
pub const TYPE_UNSIGNED: u8 = 0x02;
pub const TYPE_SIGNED: u8 = 0x03;
pub const TYPE_CHAR: u8 = 0x04;
pub const TYPE_FIXED_BYTES: u8 = 0x05;

fn check_prefix(bytes: &[u8], prefix: u8, width: usize, name: &str) -> Result<()> {
    if bytes.is_empty() {
        return Err(EncodingError::TruncatedData.into());
    }
    if bytes[0] != prefix {
        return Err(EncodingError::InvalidFormat(format!("Not a {} key", name)).into());
    }
    if bytes.len() != width + 1 {
        return Err(EncodingError::InvalidFormat(format!(
            "{} key must be {} bytes total, got {}",
            name,
            width + 1,
            bytes.len()
        ))
        .into());
    }
    Ok(())
}

/// Encode a boolean with order preservation
pub fn encode_boolean(b: bool) -> Vec<u8> {
    vec![TYPE_BOOLEAN, if b { 0x01 } else { 0x00 }]
}

/// Decode a boolean from bytes
pub fn decode_boolean(bytes: &[u8]) -> Result<bool> {
    check_prefix(bytes, TYPE_BOOLEAN, 1, "boolean")?;
    match bytes[1] {
        0x00 => Ok(false),
        0x01 => Ok(true),
        _ => Err(EncodingError::InvalidFormat("Invalid boolean value".to_string()).into()),
    }
}

/// Encode an unsigned integer into `width` big-endian bytes.
pub fn encode_unsigned(value: u64, width: usize) -> Vec<u8> {
    debug_assert!((1..=8).contains(&width));
    let mut result = Vec::with_capacity(width + 1);
    result.push(TYPE_UNSIGNED);
    result.extend_from_slice(&value.to_be_bytes()[8 - width..]);
    result
}

/// Decode an unsigned integer encoded with `width` payload bytes.
pub fn decode_unsigned(bytes: &[u8], width: usize) -> Result<u64> {
    check_prefix(bytes, TYPE_UNSIGNED, width, "unsigned")?;
    let mut buf = [0u8; 8];
    buf[8 - width..].copy_from_slice(&bytes[1..]);
    Ok(u64::from_be_bytes(buf))
}

/// Encode a signed integer into `width` big-endian bytes.
pub fn encode_signed(value: i64, width: usize) -> Vec<u8> {
    debug_assert!((1..=8).contains(&width));
    // Flip the sign bit of the narrowed value so negatives sort first
    let bits = width * 8;
    let mask = if bits == 64 { u64::MAX } else { (1u64 << bits) - 1 };
    let unsigned = ((value as u64) & mask) ^ (1u64 << (bits - 1));
    let mut result = Vec::with_capacity(width + 1);
    result.push(TYPE_SIGNED);
    result.extend_from_slice(&unsigned.to_be_bytes()[8 - width..]);
    result
}

/// Decode a signed integer encoded with `width` payload bytes.
pub fn decode_signed(bytes: &[u8], width: usize) -> Result<i64> {
    check_prefix(bytes, TYPE_SIGNED, width, "signed")?;
    let mut buf = [0u8; 8];
    buf[8 - width..].copy_from_slice(&bytes[1..]);
    let bits = width * 8;
    let unsigned = u64::from_be_bytes(buf) ^ (1u64 << (bits - 1));
    // Sign-extend back to 64 bits
    let shift = 64 - bits;
    Ok(((unsigned << shift) as i64) >> shift)
}

/// Encode a char as its 4-byte scalar value.
pub fn encode_char(c: char) -> Vec<u8> {
    let mut result = vec![TYPE_CHAR];
    result.extend_from_slice(&(c as u32).to_be_bytes());
    result
}

/// Decode a char from bytes
pub fn decode_char(bytes: &[u8]) -> Result<char> {
    check_prefix(bytes, TYPE_CHAR, 4, "char")?;
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[1..]);
    char::from_u32(u32::from_be_bytes(buf))
        .ok_or_else(|| EncodingError::InvalidFormat("Invalid char scalar".to_string()).into())
}

/// Encode a fixed-size byte array. No escaping is needed since the width is known.
pub fn encode_fixed_bytes(bytes: &[u8]) -> Vec<u8> {
    let mut result = Vec::with_capacity(bytes.len() + 1);
    result.push(TYPE_FIXED_BYTES);
    result.extend_from_slice(bytes);
    result
}

/// Decode a fixed-size byte array of `width` bytes.
pub fn decode_fixed_bytes(bytes: &[u8], width: usize) -> Result<Vec<u8>> {
    check_prefix(bytes, TYPE_FIXED_BYTES, width, "fixed bytes")?;
    Ok(bytes[1..].to_vec())
}

/// Get the type prefix from encoded bytes
pub fn get_type_prefix(bytes: &[u8]) -> Option<u8> {
    bytes.first().copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boolean_ordering() {
        let false_encoded = encode_boolean(false);
        let true_encoded = encode_boolean(true);

        assert!(false_encoded < true_encoded);
        assert!(!decode_boolean(&false_encoded).unwrap());
        assert!(decode_boolean(&true_encoded).unwrap());
    }

    #[test]
    fn test_signed_ordering_across_widths() {
        for width in [1usize, 2, 4, 8] {
            let max = if width == 8 {
                i64::MAX
            } else {
                (1i64 << (width * 8 - 1)) - 1
            };
            let min = -max - 1;
            let values = [min, -100.max(min), -1, 0, 1, 100.min(max), max];
            let encoded: Vec<_> = values.iter().map(|v| encode_signed(*v, width)).collect();

            for i in 1..encoded.len() {
                assert!(encoded[i - 1] <= encoded[i], "width {} index {}", width, i);
            }
            for (original, bytes) in values.iter().zip(encoded.iter()) {
                assert_eq!(decode_signed(bytes, width).unwrap(), *original);
            }
        }
    }

    #[test]
    fn test_unsigned_width() {
        let encoded = encode_unsigned(0xABCD, 2);
        assert_eq!(encoded, vec![TYPE_UNSIGNED, 0xAB, 0xCD]);
        assert_eq!(decode_unsigned(&encoded, 2).unwrap(), 0xABCD);
        assert!(encode_unsigned(1, 4) < encode_unsigned(256, 4));
    }

    #[test]
    fn test_char_and_bytes() {
        assert!(encode_char('a') < encode_char('b'));
        assert_eq!(decode_char(&encode_char('λ')).unwrap(), 'λ');

        let encoded = encode_fixed_bytes(&[0x00, 0xFF, 0x10]);
        assert_eq!(encoded.len(), 4);
        assert_eq!(decode_fixed_bytes(&encoded, 3).unwrap(), vec![0x00, 0xFF, 0x10]);
    }

    #[test]
    fn test_wrong_prefix_or_width() {
        assert!(decode_boolean(&encode_unsigned(1, 1)).is_err());
        assert!(decode_unsigned(&encode_unsigned(1, 4), 8).is_err());
        assert!(decode_signed(&[], 4).is_err());
        assert_eq!(get_type_prefix(&encode_char('x')), Some(TYPE_CHAR));
    }
}

//! Remaining-length encoding.
//!
//! The fixed header carries the number of bytes that follow it as a
//! variable-length integer: 7 bits per byte, least significant group first,
//! high bit set while more bytes follow. At most four bytes are allowed,
//! which caps the value at 268,435,455.

use crate::error::{ProtocolError, Result};

/// Largest value a four byte remaining length can carry.
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

const MAX_ENCODED_BYTES: usize = 4;

/// Decode a remaining length from the start of `buf`.
///
/// Returns `Ok(Some((value, bytes_consumed)))` when complete, `Ok(None)` if
/// more bytes are needed, and an error if a fifth byte would be required.
///
/// ```
/// use xively_core::varint::decode;
/// assert_eq!(decode(&[0x80, 0x01]).unwrap(), Some((128, 2)));
/// ```
pub fn decode(buf: &[u8]) -> Result<Option<(usize, usize)>> {
    let mut value = 0usize;

    for (i, &byte) in buf.iter().enumerate() {
        if i == MAX_ENCODED_BYTES {
            return Err(ProtocolError::InvalidRemainingLength.into());
        }

        value |= ((byte & 0x7F) as usize) << (7 * i);

        if (byte & 0x80) == 0 {
            return Ok(Some((value, i + 1)));
        }
    }

    if buf.len() >= MAX_ENCODED_BYTES {
        return Err(ProtocolError::InvalidRemainingLength.into());
    }

    Ok(None)
}

/// Append the encoding of `value` to `buf`. Returns the number of bytes written.
///
/// ```
/// use xively_core::varint::encode_to_vec;
/// let mut buf = Vec::new();
/// assert_eq!(encode_to_vec(300, &mut buf), 2);
/// assert_eq!(&buf, &[0xAC, 0x02]);
/// ```
pub fn encode_to_vec(mut value: usize, buf: &mut Vec<u8>) -> usize {
    let start = buf.len();
    loop {
        let mut byte = (value % 128) as u8;
        value /= 128;
        if value > 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if value == 0 {
            break;
        }
    }
    buf.len() - start
}

/// Number of bytes needed to encode `value`.
pub fn encoded_len(mut value: usize) -> usize {
    let mut len = 0;
    loop {
        len += 1;
        value /= 128;
        if value == 0 {
            break;
        }
    }
    len
}

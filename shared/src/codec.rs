//! Minimal big-endian two's-complement integer encoding used as the
//! preimage for `bits`, `value`, `vout` and other signed/unsigned fields.

/// Encodes `n` as the shortest big-endian two's-complement byte string whose
/// sign bit (the high bit of the first byte) matches the sign of `n`.
#[must_use]
pub fn encode_int(n: i64) -> Vec<u8> {
    if n == 0 {
        return vec![0];
    }

    let negative = n < 0;
    let mut magnitude = n.unsigned_abs();
    let mut bytes = Vec::new();
    while magnitude > 0 {
        bytes.push((magnitude & 0xff) as u8);
        magnitude >>= 8;
    }
    bytes.reverse();

    if negative {
        if bytes[0] & 0x80 != 0 {
            bytes.insert(0, 0x80);
        } else {
            bytes[0] |= 0x80;
        }
    } else if bytes[0] & 0x80 != 0 {
        bytes.insert(0, 0x00);
    }
    bytes
}

/// Inverse of [`encode_int`].
#[must_use]
pub fn decode_int(bytes: &[u8]) -> i64 {
    if bytes.is_empty() {
        return 0;
    }

    let negative = bytes[0] & 0x80 != 0;
    let mut magnitude_bytes = bytes.to_vec();
    if negative {
        magnitude_bytes[0] &= 0x7f;
    }

    let mut magnitude: i64 = 0;
    for &b in &magnitude_bytes {
        magnitude = (magnitude << 8) | i64::from(b);
    }

    if negative {
        -magnitude
    } else {
        magnitude
    }
}

/// Appends `n` to `buf` as a length-prefixed [`encode_int`] field: a 4-byte
/// big-endian length followed by the minimal encoding itself. Used for the
/// variable-width integer fields of the wire format (§4.2, §6).
pub fn write_int_field(buf: &mut Vec<u8>, n: i64) {
    let encoded = encode_int(n);
    buf.extend_from_slice(&(encoded.len() as u32).to_be_bytes());
    buf.extend_from_slice(&encoded);
}

/// Inverse of [`write_int_field`]; advances `cursor` past the field and
/// returns the decoded value.
///
/// # Errors
///
/// Returns an error message if `bytes` is too short to contain the
/// declared field.
pub fn read_int_field(bytes: &[u8], cursor: &mut usize) -> Result<i64, String> {
    if *cursor + 4 > bytes.len() {
        return Err("truncated int field length".to_string());
    }
    let len = u32::from_be_bytes(bytes[*cursor..*cursor + 4].try_into().unwrap()) as usize;
    *cursor += 4;
    if *cursor + len > bytes.len() {
        return Err("truncated int field body".to_string());
    }
    let value = decode_int(&bytes[*cursor..*cursor + len]);
    *cursor += len;
    Ok(value)
}

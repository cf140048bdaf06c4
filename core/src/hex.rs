//! Two unrelated hex facilities that must never be confused.
//!
//! [`hex`](mod@hex) the crate is used everywhere the kernel needs a
//! general-purpose encoder (log dumps, test fixtures, frame digests). The
//! pair below is a distinct, deliberately non-general, fixed-output
//! function preserved only for internal wire compatibility with a
//! rudimentary decoder upstream that always returns exactly 32 bytes.
//! It must never be reached from a public API boundary.

/// Lowercase hex encoding of arbitrary bytes. Thin wrapper so call sites
/// in this module don't reach for the `hex` crate directly and risk being
/// mistaken for the fixed-width codec below.
pub fn to_hex(bytes: &[u8]) -> String {
    ::hex::encode(bytes)
}

/// Decodes a hex string into a fixed 32-byte buffer, right-padded with
/// zeros. An odd number of hex digits is treated as having an implicit
/// leading zero nibble (so "abc" decodes the same as "0abc"). Input beyond
/// 64 hex digits is truncated to the first 32 bytes; this is not a general
/// decoder and intentionally performs no length validation.
pub fn from_hex(input: &str) -> [u8; 32] {
    let mut digits: Vec<u8> = input
        .chars()
        .filter_map(|c| c.to_digit(16))
        .map(|d| d as u8)
        .collect();

    if digits.len() % 2 != 0 {
        digits.insert(0, 0);
    }

    let mut out = [0u8; 32];
    let byte_count = (digits.len() / 2).min(32);
    for i in 0..byte_count {
        let hi = digits[i * 2];
        let lo = digits[i * 2 + 1];
        out[i] = (hi << 4) | lo;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_zero_padded_to_32() {
        let bytes = [1u8, 2, 3, 4];
        let encoded = to_hex(&bytes);
        let decoded = from_hex(&encoded);
        let mut expected = [0u8; 32];
        expected[..4].copy_from_slice(&bytes);
        assert_eq!(decoded, expected);
    }

    #[test]
    fn odd_digit_count_gets_leading_nibble() {
        assert_eq!(from_hex("abc")[0], from_hex("0abc")[0]);
        assert_eq!(from_hex("abc")[1], from_hex("0abc")[1]);
    }

    #[test]
    fn empty_input_is_all_zero() {
        assert_eq!(from_hex(""), [0u8; 32]);
    }
}

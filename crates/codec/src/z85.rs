//! Z85 on-wire transport encoding.
//!
//! Z85 packs 4 input bytes into 5 output characters. Callers are responsible
//! for padding their buffer to a 4-byte boundary before encoding (see
//! [`crate::parcel::pack`]); this module only performs the raw 4:5 chunked
//! transform and never adds a trailing sentinel of its own.

use crate::Error;

const ALPHABET: &[u8; 85] =
    b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ.-:+=^!/*?&<>()[]{}@%$#";

/// Encode a buffer whose length is a multiple of 4 into a Z85 string.
///
/// # Test
///
/// ```
/// use brypt_codec::z85::{encode, decode};
///
/// let bytes = [0x86u8, 0x4f, 0xd2, 0x6f, 0xb5, 0x59, 0xf7, 0x5b];
/// let text = encode(&bytes).unwrap();
/// assert_eq!(decode(&text).unwrap(), bytes);
/// ```
pub fn encode(bytes: &[u8]) -> Result<String, Error> {
    if bytes.len() % 4 != 0 {
        return Err(Error::UnalignedBuffer);
    }

    let mut out = String::with_capacity(bytes.len() / 4 * 5);

    for chunk in bytes.chunks_exact(4) {
        let mut value: u32 = 0;
        for &b in chunk {
            value = (value << 8) | b as u32;
        }

        let mut digits = [0u8; 5];
        for i in (0..5).rev() {
            digits[i] = (value % 85) as u8;
            value /= 85;
        }

        for digit in digits {
            out.push(ALPHABET[digit as usize] as char);
        }
    }

    Ok(out)
}

/// Decode a Z85 string back into its raw bytes. The input length must be a
/// multiple of 5; every character must be a member of the Z85 alphabet.
pub fn decode(text: &str) -> Result<Vec<u8>, Error> {
    if !text.is_ascii() || text.len() % 5 != 0 {
        return Err(Error::Malformed);
    }

    let mut out = Vec::with_capacity(text.len() / 5 * 4);

    for chunk in text.as_bytes().chunks_exact(5) {
        let mut value: u32 = 0;
        for &ch in chunk {
            let digit = ALPHABET
                .iter()
                .position(|&c| c == ch)
                .ok_or(Error::Malformed)? as u32;

            value = value
                .checked_mul(85)
                .and_then(|v| v.checked_add(digit))
                .ok_or(Error::Malformed)?;
        }

        out.extend_from_slice(&value.to_be_bytes());
    }

    Ok(out)
}

/// Round a length up to the next 4-byte boundary.
pub fn padded_len(len: usize) -> usize {
    len.div_ceil(4) * 4
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unaligned_encode_input() {
        assert!(encode(&[1, 2, 3]).is_err());
    }

    #[test]
    fn rejects_unaligned_decode_input() {
        assert!(decode("abcd").is_err());
    }

    #[test]
    fn rejects_invalid_alphabet_character() {
        // '\u{1}' is outside the Z85 alphabet.
        let text = "\u{1}bcde";
        assert!(decode(text).is_err());
    }

    #[test]
    fn padding_rounds_up_to_four() {
        assert_eq!(padded_len(0), 0);
        assert_eq!(padded_len(1), 4);
        assert_eq!(padded_len(4), 4);
        assert_eq!(padded_len(5), 8);
    }

    #[test]
    fn empty_buffer_round_trips() {
        assert_eq!(encode(&[]).unwrap(), "");
        assert_eq!(decode("").unwrap(), Vec::<u8>::new());
    }
}

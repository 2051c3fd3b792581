//! Opaque, content-addressed node identifiers.
//!
//! An identifier's internal form is 16 bytes generated as a checksummed hash
//! over a random seed; equality and hashing are always defined over this
//! internal form. The external, human-readable form encodes a version byte,
//! the internal payload, and a 4-byte checksum as base32 text (34 characters
//! for the current version), matching the 34-36 byte external range.

use std::fmt;

use md5::{Digest, Md5};
use rand::RngCore;

use crate::Error;

const VERSION: u8 = 0x01;
const BASE32_ALPHABET: &[u8; 32] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

/// Reserved internal identifiers: low, non-random byte patterns that can
/// never collide with a randomly generated identifier's first byte space in
/// practice, and are never produced by [`Identifier::generate`].
mod reserved {
    pub const INVALID: [u8; 16] = [0u8; 16];
    pub const NETWORK_REQUEST: [u8; 16] = {
        let mut bytes = [0u8; 16];
        bytes[0] = 0x01;
        bytes
    };
    pub const CLUSTER_REQUEST: [u8; 16] = {
        let mut bytes = [0u8; 16];
        bytes[0] = 0x02;
        bytes
    };
}

/// A node identifier, 16 bytes internally.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Identifier([u8; 16]);

impl Identifier {
    /// The `invalid` sentinel. Never participates in routing.
    pub const INVALID: Self = Self(reserved::INVALID);

    /// The `network-request` sentinel named in the wire vocabulary.
    pub const NETWORK_REQUEST: Self = Self(reserved::NETWORK_REQUEST);

    /// The `cluster-request` sentinel named in the wire vocabulary.
    pub const CLUSTER_REQUEST: Self = Self(reserved::CLUSTER_REQUEST);

    /// Generate a fresh identifier from a random seed.
    ///
    /// # Test
    ///
    /// ```
    /// use brypt_codec::identifier::Identifier;
    ///
    /// let id = Identifier::generate();
    /// assert!(id.is_valid());
    /// assert_ne!(id, Identifier::INVALID);
    /// ```
    pub fn generate() -> Self {
        loop {
            let mut bytes = [0u8; 16];
            rand::rng().fill_bytes(&mut bytes);

            let candidate = Self(bytes);
            if candidate.is_valid() {
                return candidate;
            }
        }
    }

    /// Construct an identifier directly from its internal form. Used by
    /// callers that already hold a validated internal byte array (e.g. a
    /// parsed message header).
    pub fn from_internal(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_internal(&self) -> &[u8; 16] {
        &self.0
    }

    /// An identifier is valid when it is neither the invalid sentinel nor
    /// all zero padding left over from a truncated decode.
    pub fn is_valid(&self) -> bool {
        self.0 != reserved::INVALID
    }

    pub fn is_sentinel(&self) -> bool {
        *self == Self::NETWORK_REQUEST || *self == Self::CLUSTER_REQUEST
    }

    /// Encode the external, human-readable form.
    ///
    /// # Test
    ///
    /// ```
    /// use brypt_codec::identifier::Identifier;
    ///
    /// let id = Identifier::generate();
    /// let external = id.to_external();
    /// assert!(external.len() >= 34 && external.len() <= 36);
    /// assert_eq!(Identifier::parse_external(&external).unwrap(), id);
    /// ```
    pub fn to_external(&self) -> String {
        let mut payload = Vec::with_capacity(21);
        payload.push(VERSION);
        payload.extend_from_slice(&self.0);
        payload.extend_from_slice(&checksum(VERSION, &self.0));

        base32_encode(&payload)
    }

    /// Parse an external, human-readable identifier back into its internal
    /// form, validating the version byte and checksum.
    pub fn parse_external(text: &str) -> Result<Self, Error> {
        if text.len() < 34 || text.len() > 36 {
            return Err(Error::InvalidIdentifier);
        }

        let payload = base32_decode(text).ok_or(Error::InvalidIdentifier)?;
        if payload.len() != 21 {
            return Err(Error::InvalidIdentifier);
        }

        let version = payload[0];
        if version != VERSION {
            return Err(Error::InvalidIdentifier);
        }

        let mut internal = [0u8; 16];
        internal.copy_from_slice(&payload[1..17]);

        if payload[17..21] != checksum(version, &internal) {
            return Err(Error::InvalidIdentifier);
        }

        let identifier = Self(internal);
        if !identifier.is_valid() {
            return Err(Error::InvalidIdentifier);
        }

        Ok(identifier)
    }

    /// Reject identifier byte sizes outside the supported range without
    /// allocating, used by cheap header peeks.
    pub fn size_in_range(size: usize) -> bool {
        size == 16
    }
}

impl fmt::Debug for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identifier({})", self.to_external())
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_external())
    }
}

fn checksum(version: u8, internal: &[u8; 16]) -> [u8; 4] {
    let mut hasher = Md5::new();
    hasher.update([version]);
    hasher.update(internal);

    let digest = hasher.finalize();
    let mut out = [0u8; 4];
    out.copy_from_slice(&digest[..4]);
    out
}

fn base32_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity((bytes.len() * 8).div_ceil(5));
    let mut buffer: u32 = 0;
    let mut bits: u32 = 0;

    for &byte in bytes {
        buffer = (buffer << 8) | byte as u32;
        bits += 8;

        while bits >= 5 {
            bits -= 5;
            let index = (buffer >> bits) & 0x1f;
            out.push(BASE32_ALPHABET[index as usize] as char);
        }
    }

    if bits > 0 {
        let index = (buffer << (5 - bits)) & 0x1f;
        out.push(BASE32_ALPHABET[index as usize] as char);
    }

    out
}

fn base32_decode(text: &str) -> Option<Vec<u8>> {
    let mut buffer: u32 = 0;
    let mut bits: u32 = 0;
    let mut out = Vec::with_capacity((text.len() * 5) / 8);

    for ch in text.chars() {
        let value = BASE32_ALPHABET
            .iter()
            .position(|&c| c as char == ch.to_ascii_uppercase())? as u32;

        buffer = (buffer << 5) | value;
        bits += 5;

        if bits >= 8 {
            bits -= 8;
            out.push(((buffer >> bits) & 0xff) as u8);
        }
    }

    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinels_are_distinct_and_valid() {
        assert!(Identifier::NETWORK_REQUEST.is_valid());
        assert!(Identifier::CLUSTER_REQUEST.is_valid());
        assert!(!Identifier::INVALID.is_valid());
        assert_ne!(Identifier::NETWORK_REQUEST, Identifier::CLUSTER_REQUEST);
        assert!(Identifier::NETWORK_REQUEST.is_sentinel());
        assert!(Identifier::CLUSTER_REQUEST.is_sentinel());
        assert!(!Identifier::generate().is_sentinel());
    }

    #[test]
    fn external_round_trip_is_stable() {
        for _ in 0..64 {
            let id = Identifier::generate();
            let external = id.to_external();
            assert_eq!(Identifier::parse_external(&external).unwrap(), id);
        }
    }

    #[test]
    fn tampered_checksum_is_rejected() {
        let id = Identifier::generate();
        let mut external = id.to_external();
        let flipped = if external.starts_with('A') { 'B' } else { 'A' };
        external.replace_range(0..1, &flipped.to_string());
        assert!(Identifier::parse_external(&external).is_err());
    }

    #[test]
    fn truncated_external_is_rejected() {
        assert!(Identifier::parse_external("AAAA").is_err());
    }
}

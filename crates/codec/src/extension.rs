//! The polymorphic extension protocol carried on application and platform
//! parcels: a 16-bit key, a self-describing size, and pack/unpack/validate
//! behavior per variant, stored in an ordered map keyed by type tag.

use std::collections::BTreeMap;
use std::fmt;

use bytes::{Buf, BufMut, BytesMut};

use crate::Error;

pub const AWAITABLE_KEY: u16 = 0xaabe;
pub const STATUS_KEY: u16 = 0xc0de;

/// Capability contract every extension variant implements. The 2-byte size
/// an encoded extension reports (via [`Extension::encoded_size`]) reflects
/// the complete extension including its own 4-byte key+size header.
pub trait Extension: fmt::Debug {
    fn key(&self) -> u16;
    fn encoded_size(&self) -> u16;
    fn inject(&self, buf: &mut BytesMut);
    fn validate(&self) -> bool;
    fn clone_box(&self) -> Box<dyn Extension + Send + Sync>;
    fn as_any(&self) -> &dyn std::any::Any;
}

impl Clone for Box<dyn Extension + Send + Sync> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding {
    Invalid,
    Request,
    Response,
}

impl Binding {
    fn to_byte(self) -> u8 {
        match self {
            Self::Invalid => 0x00,
            Self::Request => 0x01,
            Self::Response => 0x10,
        }
    }

    fn from_byte(byte: u8) -> Self {
        match byte {
            0x01 => Self::Request,
            0x10 => Self::Response,
            _ => Self::Invalid,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AwaitableExtension {
    pub binding: Binding,
    pub tracker_key: [u8; 16],
}

impl Extension for AwaitableExtension {
    fn key(&self) -> u16 {
        AWAITABLE_KEY
    }

    fn encoded_size(&self) -> u16 {
        4 + 1 + 16
    }

    fn inject(&self, buf: &mut BytesMut) {
        buf.put_u16(self.key());
        buf.put_u16(self.encoded_size());
        buf.put_u8(self.binding.to_byte());
        buf.put_slice(&self.tracker_key);
    }

    fn validate(&self) -> bool {
        self.binding != Binding::Invalid && self.tracker_key != [0u8; 16]
    }

    fn clone_box(&self) -> Box<dyn Extension + Send + Sync> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

impl AwaitableExtension {
    fn parse(mut value: &[u8]) -> Result<Self, Error> {
        if value.len() != 17 {
            return Err(Error::Malformed);
        }

        let binding = Binding::from_byte(value.get_u8());
        let mut tracker_key = [0u8; 16];
        tracker_key.copy_from_slice(value);

        let extension = Self {
            binding,
            tracker_key,
        };

        if !extension.validate() {
            return Err(Error::Malformed);
        }

        Ok(extension)
    }
}

/// The HTTP-like status vocabulary carried on response parcels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Ok,
    BadRequest,
    Unauthorized,
    RequestTimeout,
    InternalError,
}

impl StatusCode {
    fn to_u16(self) -> u16 {
        match self {
            Self::Ok => 200,
            Self::BadRequest => 400,
            Self::Unauthorized => 401,
            Self::RequestTimeout => 408,
            Self::InternalError => 500,
        }
    }

    fn from_u16(code: u16) -> Option<Self> {
        Some(match code {
            200 => Self::Ok,
            400 => Self::BadRequest,
            401 => Self::Unauthorized,
            408 => Self::RequestTimeout,
            500 => Self::InternalError,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone)]
pub struct StatusExtension {
    pub code: StatusCode,
}

impl Extension for StatusExtension {
    fn key(&self) -> u16 {
        STATUS_KEY
    }

    fn encoded_size(&self) -> u16 {
        4 + 2
    }

    fn inject(&self, buf: &mut BytesMut) {
        buf.put_u16(self.key());
        buf.put_u16(self.encoded_size());
        buf.put_u16(self.code.to_u16());
    }

    fn validate(&self) -> bool {
        true
    }

    fn clone_box(&self) -> Box<dyn Extension + Send + Sync> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

impl StatusExtension {
    fn parse(mut value: &[u8]) -> Result<Self, Error> {
        if value.len() != 2 {
            return Err(Error::Malformed);
        }

        let code = StatusCode::from_u16(value.get_u16()).ok_or(Error::Malformed)?;
        Ok(Self { code })
    }
}

/// Extensions in ascending key order, keyed by their 16-bit type tag.
/// `BTreeMap` gives both deterministic ascending-key iteration (needed for
/// signature-stable packing) and a natural duplicate-key rejection point at
/// insertion.
#[derive(Debug, Clone, Default)]
pub struct ExtensionMap(BTreeMap<u16, Box<dyn Extension + Send + Sync>>);

impl ExtensionMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, extension: Box<dyn Extension + Send + Sync>) -> Result<(), Error> {
        if !extension.validate() {
            return Err(Error::Malformed);
        }

        self.0.insert(extension.key(), extension);
        Ok(())
    }

    pub fn get(&self, key: u16) -> Option<&(dyn Extension + Send + Sync)> {
        self.0.get(&key).map(|boxed| boxed.as_ref())
    }

    pub fn awaitable(&self) -> Option<&AwaitableExtension> {
        self.get(AWAITABLE_KEY)
            .and_then(|ext| ext.as_any().downcast_ref())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Box<dyn Extension + Send + Sync>> {
        self.0.values()
    }

    pub fn inject_all(&self, buf: &mut BytesMut) {
        for extension in self.0.values() {
            extension.inject(buf);
        }
    }

    /// Parse `count` extensions from `bytes`, advancing past each one's
    /// declared size. Unknown keys are skipped by their declared size;
    /// malformed or duplicate-keyed extensions fail the whole parse.
    pub fn parse(bytes: &[u8], count: u8) -> Result<(Self, usize), Error> {
        let mut map = Self::new();
        let mut cursor = 0usize;

        for _ in 0..count {
            if bytes.len() < cursor + 4 {
                return Err(Error::Truncated);
            }

            let key = u16::from_be_bytes([bytes[cursor], bytes[cursor + 1]]);
            let size = u16::from_be_bytes([bytes[cursor + 2], bytes[cursor + 3]]) as usize;

            if size < 4 || bytes.len() < cursor + size {
                return Err(Error::Malformed);
            }

            let value = &bytes[cursor + 4..cursor + size];

            let parsed: Option<Box<dyn Extension + Send + Sync>> = match key {
                AWAITABLE_KEY => Some(Box::new(AwaitableExtension::parse(value)?)),
                STATUS_KEY => Some(Box::new(StatusExtension::parse(value)?)),
                _ => None,
            };

            if let Some(extension) = parsed {
                if map.0.contains_key(&key) {
                    return Err(Error::Malformed);
                }

                map.0.insert(key, extension);
            }

            cursor += size;
        }

        Ok((map, cursor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn awaitable_extension_round_trips() {
        let extension = AwaitableExtension {
            binding: Binding::Request,
            tracker_key: [7u8; 16],
        };

        let mut buf = BytesMut::new();
        extension.inject(&mut buf);

        let (map, consumed) = ExtensionMap::parse(&buf, 1).unwrap();
        assert_eq!(consumed, buf.len());
        assert!(map.awaitable().is_some());
    }

    #[test]
    fn invalid_awaitable_extension_fails_validate() {
        let extension = AwaitableExtension {
            binding: Binding::Invalid,
            tracker_key: [1u8; 16],
        };

        assert!(!extension.validate());

        let mut map = ExtensionMap::new();
        assert!(map.insert(Box::new(extension)).is_err());
    }

    #[test]
    fn duplicate_keys_fail_parse() {
        let extension = StatusExtension {
            code: StatusCode::Ok,
        };

        let mut buf = BytesMut::new();
        extension.inject(&mut buf);
        extension.inject(&mut buf);

        assert!(ExtensionMap::parse(&buf, 2).is_err());
    }

    #[test]
    fn unknown_key_is_skipped_by_declared_size() {
        let mut buf = BytesMut::new();
        buf.put_u16(0xdead);
        buf.put_u16(8);
        buf.put_slice(&[0u8; 4]);

        let (map, consumed) = ExtensionMap::parse(&buf, 1).unwrap();
        assert!(map.is_empty());
        assert_eq!(consumed, 8);
    }

    #[test]
    fn oversized_declared_size_is_malformed() {
        let mut buf = BytesMut::new();
        buf.put_u16(0xdead);
        buf.put_u16(100);
        buf.put_slice(&[0u8; 4]);

        assert!(ExtensionMap::parse(&buf, 1).is_err());
    }
}

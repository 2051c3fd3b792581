//! The fixed + variable message header shared by application and platform
//! parcels, packed in network byte order.

use bytes::{Buf, BufMut, BytesMut};

use crate::Error;
use crate::identifier::Identifier;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParcelProtocol {
    Invalid,
    Application,
    Platform,
}

impl ParcelProtocol {
    fn to_byte(self) -> u8 {
        match self {
            Self::Invalid => 0x00,
            Self::Application => 0x01,
            Self::Platform => 0x02,
        }
    }

    fn from_byte(byte: u8) -> Self {
        match byte {
            0x01 => Self::Application,
            0x02 => Self::Platform,
            _ => Self::Invalid,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestinationType {
    Invalid,
    Node,
    Cluster,
    Network,
}

impl DestinationType {
    fn to_byte(self) -> u8 {
        match self {
            Self::Invalid => 0x00,
            Self::Node => 0x01,
            Self::Cluster => 0x02,
            Self::Network => 0x03,
        }
    }

    fn from_byte(byte: u8) -> Self {
        match byte {
            0x01 => Self::Node,
            0x02 => Self::Cluster,
            0x03 => Self::Network,
            _ => Self::Invalid,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Header {
    pub protocol: ParcelProtocol,
    pub version_major: u8,
    pub version_minor: u8,
    /// Filled last by the packer: the total encoded size of the parcel,
    /// including the signature, excluding transport padding.
    pub total_size: u32,
    pub source: Identifier,
    pub destination_type: DestinationType,
    pub destination: Option<Identifier>,
    pub timestamp_ms: u64,
    pub extension_count: u8,
}

impl Header {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.protocol.to_byte());
        buf.put_u8(self.version_major);
        buf.put_u8(self.version_minor);
        buf.put_u32(self.total_size);

        buf.put_u8(16);
        buf.put_slice(self.source.as_internal());

        buf.put_u8(self.destination_type.to_byte());
        match &self.destination {
            Some(id) => {
                buf.put_u8(16);
                buf.put_slice(id.as_internal());
            }
            None => buf.put_u8(0),
        }

        buf.put_u64(self.timestamp_ms);
        buf.put_u8(self.extension_count);
    }

    pub fn decode(bytes: &[u8]) -> Result<(Self, usize), Error> {
        // protocol + version(2) + total_size(4) + source_size(1) = 9 bytes
        // minimum before the variable-length source identifier.
        if bytes.len() < 9 {
            return Err(Error::Truncated);
        }

        let mut cursor = &bytes[..];

        let protocol = ParcelProtocol::from_byte(cursor.get_u8());
        if protocol == ParcelProtocol::Invalid {
            return Err(Error::InvalidProtocol);
        }

        let version_major = cursor.get_u8();
        let version_minor = cursor.get_u8();
        let total_size = cursor.get_u32();

        let source_size = cursor.get_u8() as usize;
        if !Identifier::size_in_range(source_size) {
            return Err(Error::BadIdentifierSize);
        }
        if cursor.remaining() < source_size {
            return Err(Error::Truncated);
        }

        let mut source_bytes = [0u8; 16];
        source_bytes.copy_from_slice(&cursor[..source_size]);
        cursor.advance(source_size);
        let source = Identifier::from_internal(source_bytes);
        if !source.is_valid() {
            return Err(Error::InvalidSource);
        }

        if cursor.remaining() < 1 {
            return Err(Error::Truncated);
        }
        let destination_type = DestinationType::from_byte(cursor.get_u8());
        if destination_type == DestinationType::Invalid {
            return Err(Error::InvalidDestinationType);
        }

        if cursor.remaining() < 1 {
            return Err(Error::Truncated);
        }
        let destination_size = cursor.get_u8() as usize;
        let destination = if destination_size == 0 {
            None
        } else {
            if !Identifier::size_in_range(destination_size) {
                return Err(Error::BadIdentifierSize);
            }
            if cursor.remaining() < destination_size {
                return Err(Error::Truncated);
            }

            let mut dest_bytes = [0u8; 16];
            dest_bytes.copy_from_slice(&cursor[..destination_size]);
            cursor.advance(destination_size);
            Some(Identifier::from_internal(dest_bytes))
        };

        if cursor.remaining() < 9 {
            return Err(Error::Truncated);
        }
        let timestamp_ms = cursor.get_u64();
        if timestamp_ms == 0 {
            return Err(Error::Malformed);
        }

        let extension_count = cursor.get_u8();

        let consumed = bytes.len() - cursor.remaining();

        Ok((
            Self {
                protocol,
                version_major,
                version_minor,
                total_size,
                source,
                destination_type,
                destination,
                timestamp_ms,
                extension_count,
            },
            consumed,
        ))
    }

    /// Cheap, prefix-only protocol peek, used by endpoints to reject
    /// malformed frames before a full decode.
    pub fn peek_protocol(bytes: &[u8]) -> Option<ParcelProtocol> {
        let protocol = ParcelProtocol::from_byte(*bytes.first()?);
        (protocol != ParcelProtocol::Invalid).then_some(protocol)
    }

    /// Cheap total-size peek: bytes `[3..7)` hold the `u32` total size.
    pub fn peek_size(bytes: &[u8]) -> Option<u32> {
        if bytes.len() < 7 {
            return None;
        }

        Some(u32::from_be_bytes([bytes[3], bytes[4], bytes[5], bytes[6]]))
    }

    /// Cheap source-identifier peek without a full header decode.
    pub fn peek_source(bytes: &[u8]) -> Option<Identifier> {
        if bytes.len() < 8 {
            return None;
        }

        let size = bytes[7] as usize;
        if !Identifier::size_in_range(size) || bytes.len() < 8 + size {
            return None;
        }

        let mut internal = [0u8; 16];
        internal.copy_from_slice(&bytes[8..8 + size]);

        let identifier = Identifier::from_internal(internal);
        identifier.is_valid().then_some(identifier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> Header {
        Header {
            protocol: ParcelProtocol::Application,
            version_major: 1,
            version_minor: 0,
            total_size: 0,
            source: Identifier::generate(),
            destination_type: DestinationType::Node,
            destination: Some(Identifier::generate()),
            timestamp_ms: 1_700_000_000_000,
            extension_count: 0,
        }
    }

    #[test]
    fn header_round_trips() {
        let header = sample_header();
        let mut buf = BytesMut::new();
        header.encode(&mut buf);

        let (decoded, _consumed) = Header::decode(&buf).unwrap();
        assert_eq!(decoded.source, header.source);
        assert_eq!(decoded.destination, header.destination);
        assert_eq!(decoded.timestamp_ms, header.timestamp_ms);
    }

    #[test]
    fn zero_timestamp_is_rejected() {
        let mut header = sample_header();
        header.timestamp_ms = 0;

        let mut buf = BytesMut::new();
        header.encode(&mut buf);

        assert!(Header::decode(&buf).is_err());
    }

    #[test]
    fn peek_helpers_agree_with_full_decode() {
        let header = sample_header();
        let mut buf = BytesMut::new();
        header.encode(&mut buf);

        assert_eq!(Header::peek_protocol(&buf), Some(ParcelProtocol::Application));
        assert_eq!(Header::peek_source(&buf), Some(header.source));
    }

    #[test]
    fn truncated_header_fails_decode() {
        assert!(Header::decode(&[0x01, 0x01]).is_err());
    }
}

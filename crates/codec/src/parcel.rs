//! Application and platform parcels: the header plus protocol-specific body
//! plus the extension set, and the pack/unpack/peek operations that move
//! parcels on and off the wire.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, BytesMut};

use crate::Error;
use crate::extension::{Extension, ExtensionMap};
use crate::header::{DestinationType, Header, ParcelProtocol};
use crate::identifier::Identifier;
use crate::z85;

/// The crypto capability contract a session binds into a parcel's packing
/// and unpacking path once it reaches the authorized state. Implementations
/// must be constant-time on equality compares of authenticators; that
/// property lives with the concrete implementation, not this contract.
pub trait SecurityCapabilities: Send + Sync {
    /// Encrypt `plaintext` for the given nonce, returning ciphertext that is
    /// length-preserving plus a small fixed overhead.
    fn encrypt(&self, plaintext: &[u8], nonce: u64) -> Result<Vec<u8>, Error>;

    /// Decrypt `ciphertext` back to plaintext, or fail.
    fn decrypt(&self, ciphertext: &[u8], nonce: u64) -> Result<Vec<u8>, Error>;

    /// Append a signature to `buffer` in place.
    fn sign(&self, buffer: &mut Vec<u8>);

    /// Check the trailing signature on `buffer` (which includes it).
    fn verify(&self, buffer: &[u8]) -> bool;

    /// The constant signature length this capability set produces.
    fn signature_size(&self) -> usize;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformType {
    Invalid,
    Handshake,
    HeartbeatRequest,
    HeartbeatResponse,
}

impl PlatformType {
    fn to_byte(self) -> u8 {
        match self {
            Self::Invalid => 0x00,
            Self::Handshake => 0x01,
            Self::HeartbeatRequest => 0x02,
            Self::HeartbeatResponse => 0x03,
        }
    }

    fn from_byte(byte: u8) -> Self {
        match byte {
            0x01 => Self::Handshake,
            0x02 => Self::HeartbeatRequest,
            0x03 => Self::HeartbeatResponse,
            _ => Self::Invalid,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApplicationParcel {
    pub header: Header,
    pub route: String,
    pub payload: Vec<u8>,
    pub extensions: ExtensionMap,
}

#[derive(Debug, Clone)]
pub struct PlatformParcel {
    pub header: Header,
    pub platform_type: PlatformType,
    pub payload: Vec<u8>,
    pub extensions: ExtensionMap,
}

#[derive(Debug, Clone)]
pub enum Parcel {
    Application(ApplicationParcel),
    Platform(PlatformParcel),
}

impl Parcel {
    pub fn header(&self) -> &Header {
        match self {
            Self::Application(p) => &p.header,
            Self::Platform(p) => &p.header,
        }
    }
}

fn current_epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock predates the unix epoch")
        .as_millis() as u64
}

/// Build an application parcel, validating route/source/destination and
/// every extension's own `validate()`.
pub fn build_application(
    source: Identifier,
    destination_type: DestinationType,
    destination: Option<Identifier>,
    route: impl Into<String>,
    payload: Vec<u8>,
    extensions: Vec<Box<dyn Extension + Send + Sync>>,
) -> Result<ApplicationParcel, Error> {
    let route = route.into();
    if route.is_empty() {
        return Err(Error::InvalidArgument);
    }

    if !source.is_valid() {
        return Err(Error::InvalidArgument);
    }

    if destination_type == DestinationType::Invalid {
        return Err(Error::InvalidArgument);
    }

    let mut map = ExtensionMap::new();
    for extension in extensions {
        map.insert(extension)?;
    }

    let header = Header {
        protocol: ParcelProtocol::Application,
        version_major: 1,
        version_minor: 0,
        total_size: 0,
        source,
        destination_type,
        destination,
        timestamp_ms: current_epoch_ms(),
        extension_count: map.len() as u8,
    };

    Ok(ApplicationParcel {
        header,
        route,
        payload,
        extensions: map,
    })
}

/// Build a platform parcel; `platform_type` must not be `Invalid`.
pub fn build_platform(
    source: Identifier,
    destination_type: DestinationType,
    destination: Option<Identifier>,
    platform_type: PlatformType,
    payload: Vec<u8>,
) -> Result<PlatformParcel, Error> {
    if !source.is_valid() {
        return Err(Error::InvalidArgument);
    }

    if destination_type == DestinationType::Invalid {
        return Err(Error::InvalidArgument);
    }

    if platform_type == PlatformType::Invalid {
        return Err(Error::InvalidArgument);
    }

    let header = Header {
        protocol: ParcelProtocol::Platform,
        version_major: 1,
        version_minor: 0,
        total_size: 0,
        source,
        destination_type,
        destination,
        timestamp_ms: current_epoch_ms(),
        extension_count: 0,
    };

    Ok(PlatformParcel {
        header,
        platform_type,
        payload,
        extensions: ExtensionMap::new(),
    })
}

/// Pack a parcel to its Z85 transport string. See `crates/codec`'s module
/// docs for the exact wire layout.
///
/// # Test
///
/// ```
/// use brypt_codec::header::DestinationType;
/// use brypt_codec::identifier::Identifier;
/// use brypt_codec::parcel::{build_application, pack, unpack};
///
/// let source = Identifier::generate();
/// let parcel = build_application(
///     source,
///     DestinationType::Node,
///     None,
///     "/ping",
///     b"hello".to_vec(),
///     Vec::new(),
/// )
/// .unwrap();
///
/// let text = pack(&parcel.into(), None).unwrap();
/// let decoded = unpack(&text, None).unwrap();
/// assert_eq!(decoded.header().source, source);
/// ```
pub fn pack(parcel: &Parcel, capabilities: Option<&dyn SecurityCapabilities>) -> Result<String, Error> {
    let mut body = Vec::new();
    let mut header = parcel.header().clone();

    match parcel {
        Parcel::Application(p) => {
            let route_bytes = p.route.as_bytes();
            if route_bytes.len() > u8::MAX as usize {
                return Err(Error::InvalidArgument);
            }

            body.push(route_bytes.len() as u8);
            body.extend_from_slice(route_bytes);

            let payload = encrypt_payload(&p.payload, header.timestamp_ms, capabilities)?;
            body.extend_from_slice(&(payload.len() as u32).to_be_bytes());
            body.extend_from_slice(&payload);

            let mut ext_buf = BytesMut::new();
            p.extensions.inject_all(&mut ext_buf);
            body.extend_from_slice(&ext_buf);
        }
        Parcel::Platform(p) => {
            body.push(p.platform_type.to_byte());

            let payload = encrypt_payload(&p.payload, header.timestamp_ms, capabilities)?;
            body.extend_from_slice(&(payload.len() as u32).to_be_bytes());
            body.extend_from_slice(&payload);

            let mut ext_buf = BytesMut::new();
            p.extensions.inject_all(&mut ext_buf);
            body.extend_from_slice(&ext_buf);
        }
    }

    let mut header_buf = BytesMut::new();
    header.encode(&mut header_buf);

    let mut out = Vec::with_capacity(header_buf.len() + body.len());
    out.extend_from_slice(&header_buf);
    out.extend_from_slice(&body);

    if let Some(caps) = capabilities {
        caps.sign(&mut out);
    }

    header.total_size = out.len() as u32;
    out[3..7].copy_from_slice(&header.total_size.to_be_bytes());

    let padded_len = z85::padded_len(out.len());
    out.resize(padded_len, 0);

    z85::encode(&out)
}

fn encrypt_payload(
    payload: &[u8],
    timestamp_ms: u64,
    capabilities: Option<&dyn SecurityCapabilities>,
) -> Result<Vec<u8>, Error> {
    match capabilities {
        Some(caps) => caps.encrypt(payload, timestamp_ms),
        None => Ok(payload.to_vec()),
    }
}

/// Unpack a Z85 transport string into a parcel. See the module docs for the
/// exact error taxonomy.
pub fn unpack(text: &str, capabilities: Option<&dyn SecurityCapabilities>) -> Result<Parcel, Error> {
    let raw = z85::decode(text)?;
    let (header, header_len) = Header::decode(&raw)?;

    let total_size = header.total_size as usize;
    if total_size == 0 || total_size > raw.len() {
        return Err(Error::Malformed);
    }

    let padding = raw.len() - total_size;
    if padding > 3 {
        return Err(Error::Malformed);
    }
    if raw[total_size..].iter().any(|&b| b != 0) {
        return Err(Error::Malformed);
    }

    let signed = &raw[..total_size];

    let content = match capabilities {
        Some(caps) => {
            if !caps.verify(signed) {
                return Err(Error::Unauthorized);
            }

            let sig_size = caps.signature_size();
            if signed.len() < sig_size {
                return Err(Error::Malformed);
            }

            &signed[..signed.len() - sig_size]
        }
        None => signed,
    };

    let mut cursor = &content[header_len..];

    match header.protocol {
        ParcelProtocol::Application => {
            if cursor.is_empty() {
                return Err(Error::Truncated);
            }

            let route_len = cursor.get_u8() as usize;
            if route_len == 0 || cursor.remaining() < route_len {
                return Err(Error::Malformed);
            }

            let route = std::str::from_utf8(&cursor[..route_len])
                .map_err(|_| Error::Malformed)?
                .to_string();
            cursor.advance(route_len);

            if cursor.remaining() < 4 {
                return Err(Error::Truncated);
            }
            let payload_size = cursor.get_u32() as usize;
            if cursor.remaining() < payload_size {
                return Err(Error::Truncated);
            }

            let payload_bytes = &cursor[..payload_size];
            cursor.advance(payload_size);

            let (extensions, ext_consumed) =
                ExtensionMap::parse(cursor, header.extension_count)?;
            cursor.advance(ext_consumed);

            if !cursor.is_empty() {
                return Err(Error::Malformed);
            }

            let payload = decrypt_payload(payload_bytes, header.timestamp_ms, capabilities)?;

            Ok(Parcel::Application(ApplicationParcel {
                header,
                route,
                payload,
                extensions,
            }))
        }
        ParcelProtocol::Platform => {
            if cursor.is_empty() {
                return Err(Error::Truncated);
            }

            let platform_type = PlatformType::from_byte(cursor.get_u8());

            if cursor.remaining() < 4 {
                return Err(Error::Truncated);
            }
            let payload_size = cursor.get_u32() as usize;
            if cursor.remaining() < payload_size {
                return Err(Error::Truncated);
            }

            let payload_bytes = &cursor[..payload_size];
            cursor.advance(payload_size);

            let (extensions, ext_consumed) =
                ExtensionMap::parse(cursor, header.extension_count)?;
            cursor.advance(ext_consumed);

            if !cursor.is_empty() {
                return Err(Error::Malformed);
            }

            let payload = decrypt_payload(payload_bytes, header.timestamp_ms, capabilities)?;

            Ok(Parcel::Platform(PlatformParcel {
                header,
                platform_type,
                payload,
                extensions,
            }))
        }
        ParcelProtocol::Invalid => Err(Error::InvalidProtocol),
    }
}

fn decrypt_payload(
    bytes: &[u8],
    timestamp_ms: u64,
    capabilities: Option<&dyn SecurityCapabilities>,
) -> Result<Vec<u8>, Error> {
    match capabilities {
        Some(caps) => caps.decrypt(bytes, timestamp_ms),
        None => Ok(bytes.to_vec()),
    }
}

/// Cheap header-only peeks, used by endpoints to reject malformed frames
/// before a full decode. Operate on the still-Z85-encoded wire text.
pub fn peek_protocol(text: &str) -> Option<ParcelProtocol> {
    let raw = z85::decode(text).ok()?;
    Header::peek_protocol(&raw)
}

pub fn peek_size(text: &str) -> Option<u32> {
    let raw = z85::decode(text).ok()?;
    Header::peek_size(&raw)
}

pub fn peek_source(text: &str) -> Option<Identifier> {
    let raw = z85::decode(text).ok()?;
    Header::peek_source(&raw)
}

impl From<ApplicationParcel> for Parcel {
    fn from(value: ApplicationParcel) -> Self {
        Self::Application(value)
    }
}

impl From<PlatformParcel> for Parcel {
    fn from(value: PlatformParcel) -> Self {
        Self::Platform(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extension::{AwaitableExtension, Binding};

    fn source() -> Identifier {
        Identifier::generate()
    }

    #[test]
    fn application_parcel_round_trips_unsigned() {
        let parcel = build_application(
            source(),
            DestinationType::Node,
            None,
            "/query",
            b"ping".to_vec(),
            vec![Box::new(AwaitableExtension {
                binding: Binding::Request,
                tracker_key: [9u8; 16],
            })],
        )
        .unwrap();

        let text = pack(&parcel.clone().into(), None).unwrap();
        let decoded = unpack(&text, None).unwrap();

        match decoded {
            Parcel::Application(p) => {
                assert_eq!(p.route, "/query");
                assert_eq!(p.payload, b"ping");
                assert_eq!(p.header.source, parcel.header.source);
                assert!(p.extensions.awaitable().is_some());
            }
            _ => panic!("expected an application parcel"),
        }
    }

    #[test]
    fn platform_parcel_round_trips() {
        let parcel = build_platform(
            source(),
            DestinationType::Node,
            None,
            PlatformType::Handshake,
            b"hello".to_vec(),
        )
        .unwrap();

        let text = pack(&parcel.clone().into(), None).unwrap();
        let decoded = unpack(&text, None).unwrap();

        match decoded {
            Parcel::Platform(p) => {
                assert_eq!(p.platform_type, PlatformType::Handshake);
                assert_eq!(p.payload, b"hello");
            }
            _ => panic!("expected a platform parcel"),
        }
    }

    #[test]
    fn empty_route_is_rejected() {
        assert!(build_application(
            source(),
            DestinationType::Node,
            None,
            "",
            Vec::new(),
            Vec::new(),
        )
        .is_err());
    }

    #[test]
    fn packing_is_deterministic_for_identical_inputs() {
        let mut parcel = build_application(
            source(),
            DestinationType::Node,
            None,
            "/ping",
            b"a".to_vec(),
            Vec::new(),
        )
        .unwrap();
        parcel.header.timestamp_ms = 1_700_000_000_000;

        let a = pack(&parcel.clone().into(), None).unwrap();
        let b = pack(&parcel.into(), None).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn peek_source_matches_packed_source() {
        let parcel = build_application(
            source(),
            DestinationType::Node,
            None,
            "/ping",
            b"a".to_vec(),
            Vec::new(),
        )
        .unwrap();

        let text = pack(&parcel.clone().into(), None).unwrap();
        assert_eq!(peek_source(&text), Some(parcel.header.source));
    }

    #[test]
    fn peek_size_matches_total_size_field() {
        let parcel = build_application(
            source(),
            DestinationType::Node,
            None,
            "/ping",
            b"a".to_vec(),
            Vec::new(),
        )
        .unwrap();

        let text = pack(&parcel.into(), None).unwrap();
        let raw = z85::decode(&text).unwrap();
        let (header, _) = Header::decode(&raw).unwrap();
        assert_eq!(peek_size(&text), Some(header.total_size));
    }

    #[test]
    fn tampered_total_size_is_malformed() {
        let parcel = build_application(
            source(),
            DestinationType::Node,
            None,
            "/ping",
            b"a".to_vec(),
            Vec::new(),
        )
        .unwrap();

        let text = pack(&parcel.into(), None).unwrap();
        let mut raw = z85::decode(&text).unwrap();
        raw[3..7].copy_from_slice(&9_000u32.to_be_bytes());

        let padded_len = z85::padded_len(raw.len());
        raw.resize(padded_len, 0);
        let tampered = z85::encode(&raw).unwrap();

        assert!(unpack(&tampered, None).is_err());
    }
}

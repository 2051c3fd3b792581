//! The Brypt message codec.
//!
//! Serializes and parses application and platform parcels: header packing,
//! route/payload/extension framing, Z85 on-wire transport encoding, and the
//! cheap header-only peeks endpoints use to reject malformed frames before a
//! full decode.

pub mod address;
pub mod extension;
pub mod header;
pub mod identifier;
pub mod parcel;
pub mod z85;

use std::array::TryFromSliceError;

#[derive(Debug)]
pub enum Error {
    InvalidArgument,
    InvalidIdentifier,
    InvalidAddress,
    InvalidProtocol,
    InvalidSource,
    InvalidDestinationType,
    BadIdentifierSize,
    UnalignedBuffer,
    Truncated,
    Malformed,
    Unauthorized,
    TryFromSliceError(TryFromSliceError),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<TryFromSliceError> for Error {
    fn from(value: TryFromSliceError) -> Self {
        Self::TryFromSliceError(value)
    }
}

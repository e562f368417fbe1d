#![forbid(unsafe_code)]

//! DisplayPort 1.4 MST sideband-message codec.
//!
//! This crate implements the wire format of section 2.11 of the DisplayPort
//! 1.4 standard: the sideband message header (link-count nibbles, relative
//! address path, transaction framing bits, 4-bit header CRC) and the message
//! bodies exchanged with branch devices (LINK_ADDRESS, ENUM_PATH_RESOURCES,
//! ALLOCATE_PAYLOAD, CLEAR_PAYLOAD_ID_TABLE, plus NAK replies).
//!
//! The codec is transport-agnostic: it produces and consumes byte slices.
//! Moving those bytes through the DPCD request/reply windows (and chunked
//! reassembly of multi-transaction replies) is the driver's job.
//!
//! Both checksums are bit-exact with real branch silicon: the header CRC is a
//! 4-bit CRC over nibbles with polynomial 0x13, the body CRC is an 8-bit CRC
//! over bytes with polynomial 0xD5.

mod crc;
mod header;
mod msg;

pub use crc::{body_crc, header_crc4};
pub use header::{RelativeAddress, SidebandMsgHeader, MAX_HEADER_LEN, MAX_RAD_HOPS};
pub use msg::{
    encode_reply, parse_reply, strip_body_crc, AllocatePayloadReply, EnumPathResourcesReply, Guid,
    LinkAddressReply, NakReply, PeerDeviceType, PortInfo, SidebandReply, SidebandRequest,
    REQ_ALLOCATE_PAYLOAD, REQ_CLEAR_PAYLOAD_ID_TABLE, REQ_ENUM_PATH_RESOURCES, REQ_LINK_ADDRESS,
};

/// Largest body (request byte + payload + trailing CRC) a single sideband
/// transaction chunk may carry; the header length field is 6 bits wide.
pub const MAX_BODY_LEN: usize = 63;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    TooShort { needed: usize, actual: usize },
    HeaderCrc { expected: u8, actual: u8 },
    BodyCrc { expected: u8, actual: u8 },
    BodyLenOverrun { claimed: usize, max: usize },
    UnknownRequestType { request_type: u8 },
    Malformed(&'static str),
}

impl core::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            DecodeError::TooShort { needed, actual } => {
                write!(f, "sideband message too short: {actual} < {needed}")
            }
            DecodeError::HeaderCrc { expected, actual } => {
                write!(f, "header CRC mismatch: computed 0x{expected:x}, got 0x{actual:x}")
            }
            DecodeError::BodyCrc { expected, actual } => {
                write!(f, "body CRC mismatch: computed 0x{expected:02x}, got 0x{actual:02x}")
            }
            DecodeError::BodyLenOverrun { claimed, max } => {
                write!(f, "body length {claimed} exceeds chunk limit {max}")
            }
            DecodeError::UnknownRequestType { request_type } => {
                write!(f, "unknown sideband request type 0x{request_type:02x}")
            }
            DecodeError::Malformed(what) => write!(f, "malformed sideband message: {what}"),
        }
    }
}

impl std::error::Error for DecodeError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    BodyTooLong { len: usize, max: usize },
    RadTooDeep { hops: usize, max: usize },
    OutputTooSmall { needed: usize, actual: usize },
}

impl core::fmt::Display for EncodeError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            EncodeError::BodyTooLong { len, max } => {
                write!(f, "sideband body too long: {len} > {max}")
            }
            EncodeError::RadTooDeep { hops, max } => {
                write!(f, "relative address too deep: {hops} hops > {max}")
            }
            EncodeError::OutputTooSmall { needed, actual } => {
                write!(f, "output buffer too small: {actual} < {needed}")
            }
        }
    }
}

impl std::error::Error for EncodeError {}

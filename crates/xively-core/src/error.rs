//! Codec error types.

use thiserror::Error;

/// Wire-level protocol violations found while decoding.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("invalid packet type: {0}")]
    InvalidPacketType(u8),

    #[error("invalid remaining length")]
    InvalidRemainingLength,

    #[error("incomplete packet: needed {needed} bytes, have {have}")]
    IncompletePacket { needed: usize, have: usize },

    #[error("invalid protocol name: {0}")]
    InvalidProtocolName(String),

    #[error("unsupported protocol version: {0}")]
    UnsupportedProtocolVersion(u8),

    #[error("invalid connect flags: {0:#04x}")]
    InvalidConnectFlags(u8),

    #[error("invalid UTF-8 string")]
    InvalidUtf8,

    #[error("invalid SUBACK return code: {0:#04x}")]
    InvalidSubackCode(u8),

    #[error("packet too large: {size} bytes exceeds {max}")]
    PacketTooLarge { size: usize, max: usize },

    #[error("malformed packet: {0}")]
    MalformedPacket(String),
}

/// Codec error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Raised before any bytes are produced for a PUBLISH whose payload
    /// exceeds the configured ceiling.
    #[error("payload too large: {size} bytes exceeds {max}")]
    PayloadTooLarge { size: usize, max: usize },

    /// A field does not fit its wire representation (string over 65535 bytes,
    /// remaining length over 268435455, missing packet id on QoS > 0).
    #[error("cannot serialise {0}")]
    Serialisation(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;

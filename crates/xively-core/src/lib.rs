//! xively-core - MQTT 3.1.1 wire codec.
//!
//! This crate provides the packet model and the encoder/decoder used by the
//! Xively client's codec layer. It performs no I/O and never blocks: the
//! decoder works on whatever bytes have arrived so far and reports when it
//! needs more.

pub mod error;
pub mod packet;
pub mod serialiser;
pub mod varint;

pub use error::{Error, ProtocolError, Result};
pub use packet::*;
pub use serialiser::{serialiser_size, serialiser_write, SerializedSize, MAX_PAYLOAD_SIZE};

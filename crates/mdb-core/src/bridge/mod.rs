//! SPI bridge microcontroller: frame protocol and client.
//!
//! The bridge performs MDB exchanges and captures keyboard (TWI) input on
//! behalf of the host. The host talks to it over SPI and learns about
//! pending data through a notify GPIO line.

pub mod client;
pub mod crc;
pub mod fields;
pub mod frame;
pub mod hw;
pub mod keys;
pub mod mock;
pub mod protocol;

pub use client::{Client, Stats, StatsSnapshot};
pub use fields::Fields;
pub use frame::{Frame, Padding, parse_header, parse_padding};
pub use hw::{NotifyLine, SpiLink};
pub use keys::{KeyEvent, KeyReader};
pub use mock::FakeBridge;
pub use protocol::{Command, Errcode, Field, MdbResult, Response};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("frame={frame} version={version} expected={}", protocol::PROTOCOL_VERSION)]
    VersionMismatch { frame: String, version: u8 },

    #[error("input length {len} too small, min={min}")]
    TooShort { len: usize, min: usize },

    #[error("frame={frame} invalid padding")]
    InvalidPadding { frame: String },

    #[error("length={len} exceeds max={max}")]
    LengthOverflow { len: usize, max: usize },

    #[error("frame={frame} crc={received:02x} actual={actual:02x}")]
    CrcMismatch {
        frame: String,
        received: u8,
        actual: u8,
    },

    #[error("frame={frame} FLAG_PAYLOAD=no payload len={len}")]
    NoPayloadFlag { frame: String, len: u8 },

    #[error("fields={data} unknown tag={tag:02x} at={at}")]
    UnknownField { tag: u8, data: String, at: usize },

    #[error("field {tag} truncated need={need} have={have}")]
    FieldTruncated { tag: Field, need: usize, have: usize },

    #[error("frame={frame} unexpected response={kind:02x?}")]
    UnexpectedResponse { frame: String, kind: Option<u8> },

    #[error("frame={frame} pad=error code={code}")]
    Remote { code: Errcode, frame: String },

    #[error("bridge response empty")]
    ResponseEmpty,

    #[error("bridge request busy")]
    RequestBusy,

    #[error("invalid write ack expected={expected} received={received}")]
    InvalidAck { expected: String, received: String },

    #[error("CRITICAL bridge protocol error: {0}")]
    Critical(String),

    #[error("bridge client closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BridgeError {
    /// Host and bridge are out of sync; the client must be re-created.
    pub fn is_critical(&self) -> bool {
        matches!(self, BridgeError::Critical(_) | BridgeError::Closed)
    }
}

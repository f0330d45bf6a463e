//! UART transport layer abstraction.
//!
//! Defines the `UartTransport` trait for the raw MDB line, allowing
//! different implementations (serial tty, helper process, SPI bridge, mock).

use std::time::Duration;

use thiserror::Error;

use crate::bridge::{BridgeError, MdbResult};
use crate::packet::PacketError;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("mdb timeout")]
    Timeout,

    #[error("mdb NAK")]
    Nak,

    #[error("mdb busy")]
    Busy,

    #[error("Invalid checksum received={received:02x} actual={actual:02x}")]
    InvalidChecksum { received: u8, actual: u8 },

    #[error("Transport not open")]
    NotOpen,

    #[error("Failed to open {path}: {message}")]
    OpenFailed { path: String, message: String },

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Packet error: {0}")]
    Packet(PacketError),

    #[error("Bridge error: {0}")]
    Bridge(#[from] BridgeError),

    #[error("bridge mdb result={result:?} error={error:02x}")]
    BridgeResult {
        result: Option<MdbResult>,
        error: u8,
    },

    #[error("Helper error: {0}")]
    Helper(String),

    #[error("Mock error: {0}")]
    Mock(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<PacketError> for TransportError {
    fn from(e: PacketError) -> Self {
        match e {
            PacketError::InvalidChecksum { received, actual } => {
                TransportError::InvalidChecksum { received, actual }
            }
            other => TransportError::Packet(other),
        }
    }
}

impl TransportError {
    /// No response from the peripheral within the response window.
    pub fn is_timeout(&self) -> bool {
        match self {
            TransportError::Timeout => true,
            TransportError::Io(e) => e.kind() == std::io::ErrorKind::TimedOut,
            _ => false,
        }
    }

    /// Unrecoverable link failure; the provider must be torn down.
    pub fn is_critical(&self) -> bool {
        matches!(self, TransportError::Bridge(e) if e.is_critical())
    }
}

/// Abstract MDB line interface.
///
/// Every method takes `&self`; implementations serialize access internally
/// so a provider can be shared behind the bus.
pub trait UartTransport: Send + Sync {
    /// Open the line at `path`. Providers that are already connected
    /// (bridge) treat this as a no-op.
    fn open(&self, path: &str) -> Result<(), TransportError>;

    /// Release the line. Idempotent.
    fn close(&self) -> Result<(), TransportError>;

    /// Hold the line in break for `keep`, then wait `settle`.
    fn brk(&self, keep: Duration, settle: Duration) -> Result<(), TransportError>;

    /// Send one request block and collect the peripheral's response payload
    /// into `response`. Returns the payload length.
    ///
    /// A single ACK from the peripheral yields an empty response.
    fn tx(&self, request: &[u8], response: &mut [u8]) -> Result<usize, TransportError>;

    /// Short provider name for logs.
    fn name(&self) -> &'static str;
}

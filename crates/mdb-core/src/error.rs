//! Bus and device level errors.
//!
//! Device errors wrap lower level causes so that a timeout three layers
//! down is still recognised by [`MdbError::is_timeout`].

use thiserror::Error;

use crate::device::DeviceState;
use crate::packet::PacketError;
use crate::transport::TransportError;

#[derive(Error, Debug)]
pub enum MdbError {
    #[error("mdb.Tx send={request} recv={response}: {source}")]
    Tx {
        request: String,
        response: String,
        #[source]
        source: TransportError,
    },

    #[error("mdb bus reset: {0}")]
    BusReset(#[source] TransportError),

    #[error("mdb close: {0}")]
    Close(#[source] TransportError),

    #[error("{device} state={state} invalid")]
    InvalidState { device: String, state: DeviceState },

    #[error("{device} is offline: {source}")]
    Offline {
        device: String,
        #[source]
        source: Box<MdbError>,
    },

    #[error("{device} request={request} state={state}: {source}")]
    Device {
        device: String,
        request: String,
        state: DeviceState,
        #[source]
        source: Box<MdbError>,
    },

    #[error("{device} {context}: {source}")]
    Context {
        device: String,
        context: String,
        #[source]
        source: Box<MdbError>,
    },

    #[error("{tag} timeout")]
    PollTimeout { tag: String },

    #[error("{device} state={state} offline duration={offline_ms}ms")]
    NotOnline {
        device: String,
        state: DeviceState,
        offline_ms: u128,
    },

    #[error("{device} unhandled errorcode={code}")]
    UnhandledErrorCode { device: String, code: i32 },

    #[error("{device} SETUP response empty")]
    EmptySetup { device: String },

    #[error("not applicable: {0}")]
    NotApplicable(String),

    #[error("Packet error: {0}")]
    Packet(#[from] PacketError),
}

impl MdbError {
    /// Wrap `self` with a device-scoped context label.
    pub fn context(self, device: &str, context: impl Into<String>) -> MdbError {
        MdbError::Context {
            device: device.to_string(),
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Peripheral did not answer. Offline errors are a kind of timeout.
    pub fn is_timeout(&self) -> bool {
        match self {
            MdbError::Tx { source, .. } | MdbError::BusReset(source) => source.is_timeout(),
            MdbError::Offline { .. } => true,
            MdbError::Device { source, .. } | MdbError::Context { source, .. } => {
                source.is_timeout()
            }
            _ => false,
        }
    }

    pub fn is_offline(&self) -> bool {
        match self {
            MdbError::Offline { .. } => true,
            MdbError::Device { source, .. } | MdbError::Context { source, .. } => {
                source.is_offline()
            }
            _ => false,
        }
    }

    /// The underlying link is broken and must be re-established.
    pub fn is_critical(&self) -> bool {
        match self {
            MdbError::Tx { source, .. } | MdbError::BusReset(source) => source.is_critical(),
            MdbError::Offline { source, .. }
            | MdbError::Device { source, .. }
            | MdbError::Context { source, .. } => source.is_critical(),
            _ => false,
        }
    }
}

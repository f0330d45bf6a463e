//! Device lifecycle states.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle state of an MDB peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum DeviceState {
    /// Not initialized yet.
    #[default]
    Invalid = 0,
    /// Initialized, no successful exchange yet.
    Inited,
    /// Answered the last request.
    Online,
    /// Online and fully configured by the driver.
    Ready,
    /// Stopped answering (timeout).
    Offline,
    /// Failed with a non-timeout error.
    Error,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceState::Invalid => write!(f, "invalid"),
            DeviceState::Inited => write!(f, "inited"),
            DeviceState::Online => write!(f, "online"),
            DeviceState::Ready => write!(f, "ready"),
            DeviceState::Offline => write!(f, "offline"),
            DeviceState::Error => write!(f, "error"),
        }
    }
}

impl DeviceState {
    /// Online or Ready.
    pub fn is_ok(&self) -> bool {
        matches!(self, DeviceState::Online | DeviceState::Ready)
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => DeviceState::Inited,
            2 => DeviceState::Online,
            3 => DeviceState::Ready,
            4 => DeviceState::Offline,
            5 => DeviceState::Error,
            _ => DeviceState::Invalid,
        }
    }
}

/// State cell readable without taking the command lock.
#[derive(Debug, Default)]
pub(crate) struct AtomicState(AtomicU8);

impl AtomicState {
    pub fn load(&self) -> DeviceState {
        DeviceState::from_u8(self.0.load(Ordering::SeqCst))
    }

    /// Store `new`, returning the previous state.
    pub fn swap(&self, new: DeviceState) -> DeviceState {
        DeviceState::from_u8(self.0.swap(new as u8, Ordering::SeqCst))
    }
}

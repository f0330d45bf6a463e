//! Bus, device and bridge notifications.
//!
//! The core reports what happened on the line through [`MdbObserver`], so a
//! console or a supervisor can follow traffic and device health.

use std::time::Duration;

use crate::device::DeviceState;
use crate::packet::Packet;

#[derive(Debug, Clone)]
pub enum MdbEvent {
    /// Request answered by a peripheral. An empty response is a plain ACK.
    Exchange { request: Packet, response: Packet },
    /// Request that got no usable answer.
    ExchangeFailed {
        request: Packet,
        timeout: bool,
        error: String,
    },
    /// Line held in break.
    BusReset { keep: Duration },
    StateChanged {
        device: String,
        from: DeviceState,
        to: DeviceState,
    },
    /// Device entered the error state.
    DeviceError { device: String, message: String },
    /// Bridge microcontroller restarted.
    BridgeReset { watchdog: bool, info: String },
}

pub trait MdbObserver: Send + Sync {
    fn on_event(&self, event: &MdbEvent);
}

/// Drops every event.
pub struct NoopObserver;

impl MdbObserver for NoopObserver {
    fn on_event(&self, _event: &MdbEvent) {}
}

/// Writes events to the `tracing` log, traffic at trace level.
pub struct LogObserver;

impl MdbObserver for LogObserver {
    fn on_event(&self, event: &MdbEvent) {
        match event {
            MdbEvent::Exchange { request, response } => {
                tracing::trace!(send = %request.format(), recv = %response.format(), "mdb");
            }
            MdbEvent::ExchangeFailed {
                request,
                timeout: true,
                ..
            } => {
                tracing::trace!(send = %request.format(), "mdb no answer");
            }
            MdbEvent::ExchangeFailed { request, error, .. } => {
                tracing::debug!(send = %request.format(), error = %error, "mdb exchange failed");
            }
            MdbEvent::BusReset { keep } => {
                tracing::debug!(keep_ms = keep.as_millis() as u64, "mdb bus reset");
            }
            MdbEvent::StateChanged { device, from, to } => {
                tracing::debug!(device = %device, "{} -> {}", from, to);
            }
            MdbEvent::DeviceError { device, message } => {
                tracing::warn!(device = %device, error = %message, "device error");
            }
            MdbEvent::BridgeReset {
                watchdog: true,
                info,
            } => {
                tracing::error!(info = %info, "bridge restarted by watchdog");
            }
            MdbEvent::BridgeReset { info, .. } => {
                tracing::info!(info = %info, "bridge reset");
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use parking_lot::Mutex;

    /// Collects events for assertions.
    #[derive(Default)]
    pub struct RecordingObserver {
        pub events: Mutex<Vec<MdbEvent>>,
    }

    impl MdbObserver for RecordingObserver {
        fn on_event(&self, event: &MdbEvent) {
            self.events.lock().push(event.clone());
        }
    }
}

//! MDB peripheral session: lifecycle state, transaction policy and reset.
//!
//! A [`Device`] owns a command lock. Every exchange with the peripheral runs
//! under that lock through a [`DeviceGuard`], which is the only place where
//! state transitions happen. State, error code and the liveness clocks are
//! atomics so observers never need the lock.

mod poll;
mod state;

pub use poll::PollDelay;
pub use state::DeviceState;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder as _, LittleEndian};
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, error, instrument};

use crate::bus::Bus;
use crate::clock::AtomicClock;
use crate::config::Delays;
use crate::error::MdbError;
use crate::events::MdbEvent;
use crate::packet::Packet;
use state::AtomicState;

/// Transaction policy flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxOpt {
    /// Classify a timeout as the device going offline.
    pub timeout_offline: bool,
    /// Refuse to send unless the device is Online or Ready.
    pub require_ok: bool,
    /// Never reset before sending, overrides the reset flags.
    pub no_reset: bool,
    pub reset_error: bool,
    pub reset_offline: bool,
}

impl TxOpt {
    /// Command the device is known to support.
    pub const KNOWN: TxOpt = TxOpt {
        timeout_offline: true,
        require_ok: false,
        no_reset: false,
        reset_error: true,
        reset_offline: true,
    };

    /// Probe for an optional feature; only sent to a healthy device.
    pub const MAYBE: TxOpt = TxOpt {
        timeout_offline: false,
        require_ok: true,
        no_reset: false,
        reset_error: false,
        reset_offline: true,
    };

    /// The RESET command itself.
    pub const RESET: TxOpt = TxOpt {
        timeout_offline: true,
        require_ok: false,
        no_reset: true,
        reset_error: false,
        reset_offline: false,
    };
}

/// Byte order of multi-byte fields in a device's responses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ByteOrder {
    #[default]
    Big,
    Little,
}

impl ByteOrder {
    /// Read a u16 at `offset`, `None` when the slice is too short.
    pub fn read_u16(&self, bytes: &[u8], offset: usize) -> Option<u16> {
        let b = bytes.get(offset..offset + 2)?;
        Some(match self {
            ByteOrder::Big => BigEndian::read_u16(b),
            ByteOrder::Little => LittleEndian::read_u16(b),
        })
    }
}

const ERROR_CODE_PRESENT: u64 = 1 << 32;

/// Optional i32 in one atomic word with an explicit presence bit.
#[derive(Debug, Default)]
struct AtomicErrorCode(AtomicU64);

impl AtomicErrorCode {
    fn load(&self) -> Option<i32> {
        let v = self.0.load(Ordering::SeqCst);
        (v & ERROR_CODE_PRESENT != 0).then_some(v as u32 as i32)
    }

    fn store(&self, code: Option<i32>) {
        let v = match code {
            Some(c) => ERROR_CODE_PRESENT | u64::from(c as u32),
            None => 0,
        };
        self.0.store(v, Ordering::SeqCst);
    }
}

/// Point-in-time view of a device for status displays.
#[derive(Debug, Clone)]
pub struct DeviceSnapshot {
    pub name: String,
    pub address: u8,
    pub state: DeviceState,
    pub error_code: Option<i32>,
    pub since_ok: Option<Duration>,
    pub since_off: Option<Duration>,
}

/// Mutable data owned by the command lock.
struct Session {
    setup_response: Packet,
}

pub struct Device {
    bus: Arc<Bus>,
    name: String,
    address: u8,
    byte_order: ByteOrder,
    delays: Delays,

    state: AtomicState,
    error_code: AtomicErrorCode,
    last_ok: AtomicClock,
    last_off: AtomicClock,
    last_reset: AtomicClock,

    packet_reset: Packet,
    packet_setup: Packet,
    packet_poll: Packet,

    session: Mutex<Session>,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("address", &format_args!("{:02x}", self.address))
            .field("state", &self.state())
            .finish()
    }
}

impl Device {
    /// New device in the Invalid state; call [`Device::init`] before use.
    pub fn new(bus: Arc<Bus>, address: u8, name: impl Into<String>, byte_order: ByteOrder) -> Self {
        Self {
            bus,
            name: name.into(),
            address,
            byte_order,
            delays: Delays::default(),
            state: AtomicState::default(),
            error_code: AtomicErrorCode::default(),
            last_ok: AtomicClock::new(),
            last_off: AtomicClock::new(),
            last_reset: AtomicClock::new(),
            packet_reset: Packet::must_from_bytes(&[address], true),
            packet_setup: Packet::must_from_bytes(&[address.wrapping_add(1)], true),
            packet_poll: Packet::must_from_bytes(&[address.wrapping_add(3)], true),
            session: Mutex::new(Session {
                setup_response: Packet::new(),
            }),
        }
    }

    pub fn with_delays(mut self, delays: Delays) -> Self {
        self.delays = delays;
        self
    }

    /// Mark initialized. The device counts as offline until its first
    /// successful response.
    pub fn init(&self) {
        let _guard = self.session.lock();
        self.error_code.store(None);
        self.last_ok.clear();
        self.last_reset.clear();
        self.last_off.set_now();
        self.set_state(DeviceState::Inited);
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.byte_order
    }

    pub fn delays(&self) -> &Delays {
        &self.delays
    }

    pub fn bus(&self) -> &Arc<Bus> {
        &self.bus
    }

    pub fn packet_reset(&self) -> &Packet {
        &self.packet_reset
    }

    pub fn packet_setup(&self) -> &Packet {
        &self.packet_setup
    }

    pub fn packet_poll(&self) -> &Packet {
        &self.packet_poll
    }

    /// Copy of the last SETUP response.
    pub fn setup_response(&self) -> Packet {
        self.session.lock().setup_response
    }

    pub fn state(&self) -> DeviceState {
        self.state.load()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == DeviceState::Ready
    }

    pub fn set_state(&self, new: DeviceState) {
        let prev = self.state.swap(new);
        if prev != new {
            self.bus.observer().on_event(&MdbEvent::StateChanged {
                device: self.name.clone(),
                from: prev,
                to: new,
            });
        }
    }

    pub fn set_ready(&self) {
        self.set_state(DeviceState::Ready);
    }

    pub fn set_online(&self) {
        self.set_state(DeviceState::Online);
    }

    /// Move to Error and report `e` upstream.
    pub fn set_error(&self, e: &MdbError) {
        self.set_state(DeviceState::Error);
        error!(device = %self.name, error = %e, "device error");
        self.bus.observer().on_event(&MdbEvent::DeviceError {
            device: self.name.clone(),
            message: e.to_string(),
        });
    }

    pub fn error_code(&self) -> Option<i32> {
        self.error_code.load()
    }

    pub fn set_error_code(&self, code: Option<i32>) {
        self.error_code.store(code);
    }

    pub fn clear_error_code(&self) {
        self.error_code.store(None);
    }

    pub fn validate_error_code(&self) -> Result<(), MdbError> {
        match self.error_code() {
            None => Ok(()),
            Some(code) => Err(MdbError::UnhandledErrorCode {
                device: self.name.clone(),
                code,
            }),
        }
    }

    pub fn validate_online(&self) -> Result<(), MdbError> {
        let state = self.state();
        if state.is_ok() {
            return Ok(());
        }
        Err(MdbError::NotOnline {
            device: self.name.clone(),
            state,
            offline_ms: self.last_off.since().unwrap_or_default().as_millis(),
        })
    }

    /// Time since the last successful response, `None` if never.
    pub fn since_ok(&self) -> Option<Duration> {
        self.last_ok.since()
    }

    /// Time since the device was first seen not answering, `None` while it
    /// is answering.
    pub fn since_off(&self) -> Option<Duration> {
        self.last_off.since()
    }

    #[cfg(test)]
    pub(crate) fn last_off_raw(&self) -> u64 {
        self.last_off.raw()
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        DeviceSnapshot {
            name: self.name.clone(),
            address: self.address,
            state: self.state(),
            error_code: self.error_code(),
            since_ok: self.since_ok(),
            since_off: self.since_off(),
        }
    }

    /// Take the command lock.
    pub fn lock(&self) -> DeviceGuard<'_> {
        DeviceGuard {
            dev: self,
            session: self.session.lock(),
        }
    }

    pub fn tx_known(&self, request: &Packet, response: &mut Packet) -> Result<(), MdbError> {
        self.lock().tx_known(request, response)
    }

    pub fn tx_maybe(&self, request: &Packet, response: &mut Packet) -> Result<(), MdbError> {
        self.lock().tx_maybe(request, response)
    }

    pub fn tx_custom(
        &self,
        request: &Packet,
        response: &mut Packet,
        opt: TxOpt,
    ) -> Result<(), MdbError> {
        self.lock().tx_custom(request, response, opt)
    }

    /// Raw exchange under the command lock, no state handling.
    pub fn tx(&self, request: &Packet, response: &mut Packet) -> Result<(), MdbError> {
        self.lock().tx(request, response)
    }

    /// SETUP with the known-command policy; response kept for drivers.
    pub fn tx_setup(&self) -> Result<(), MdbError> {
        self.lock().tx_setup()
    }

    /// Reset under the command lock, throttled.
    pub fn reset(&self) -> Result<(), MdbError> {
        self.lock().reset()
    }

    /// Unconditional RESET followed by SETUP read. Online on success.
    #[instrument(skip(self), fields(device = %self.name))]
    pub fn reset_and_setup(&self) -> Result<(), MdbError> {
        let mut guard = self.lock();
        self.last_off.set_now_if_zero();
        self.last_reset.set_now();
        self.set_state(DeviceState::Error);

        let mut response = Packet::new();
        guard.tx(&self.packet_reset, &mut response)?;
        thread::sleep(self.delays.after_reset);

        let mut setup = Packet::new();
        guard.tx(&self.packet_setup, &mut setup)?;
        guard.session.setup_response = setup;
        if setup.is_empty() {
            return Err(MdbError::EmptySetup {
                device: self.name.clone(),
            });
        }
        self.set_state(DeviceState::Online);
        Ok(())
    }
}

/// Holder of a device's command lock. All state-changing exchanges go
/// through here.
pub struct DeviceGuard<'a> {
    dev: &'a Device,
    session: MutexGuard<'a, Session>,
}

impl DeviceGuard<'_> {
    pub fn device(&self) -> &Device {
        self.dev
    }

    pub fn tx_known(&mut self, request: &Packet, response: &mut Packet) -> Result<(), MdbError> {
        self.tx_policy(request, response, TxOpt::KNOWN)
    }

    pub fn tx_maybe(&mut self, request: &Packet, response: &mut Packet) -> Result<(), MdbError> {
        let state = self.dev.state();
        self.tx_policy(request, response, TxOpt::MAYBE)
            .map_err(|e| {
                let context = format!("TxMaybe request={} state={}", request.format(), state);
                e.context(&self.dev.name, context)
            })
    }

    pub fn tx_custom(
        &mut self,
        request: &Packet,
        response: &mut Packet,
        opt: TxOpt,
    ) -> Result<(), MdbError> {
        self.tx_policy(request, response, opt)
    }

    pub fn tx(&mut self, request: &Packet, response: &mut Packet) -> Result<(), MdbError> {
        self.dev.bus.tx(request, response)
    }

    pub fn tx_setup(&mut self) -> Result<(), MdbError> {
        let mut setup = Packet::new();
        let request = self.dev.packet_setup;
        let result = self.tx_known(&request, &mut setup);
        self.session.setup_response = setup;
        result.map_err(|e| e.context(&self.dev.name, "SETUP"))
    }

    pub fn reset(&mut self) -> Result<(), MdbError> {
        self.locked_reset()
    }

    /// Policy-driven exchange: pre-send resets, state gate, outcome
    /// classification.
    fn tx_policy(
        &mut self,
        request: &Packet,
        response: &mut Packet,
        opt: TxOpt,
    ) -> Result<(), MdbError> {
        let dev = self.dev;
        let state = dev.state();
        let mut pre = Ok(());
        match state {
            DeviceState::Invalid => {
                return Err(MdbError::InvalidState {
                    device: dev.name.clone(),
                    state,
                });
            }
            DeviceState::Inited => {
                if !opt.no_reset {
                    pre = self.locked_reset();
                }
            }
            DeviceState::Online | DeviceState::Ready => {}
            DeviceState::Error => {
                if opt.reset_error && !opt.no_reset {
                    pre = self.locked_reset();
                }
            }
            DeviceState::Offline => {
                debug!(device = %dev.name, request = %request.format(), "tx while offline");
                if opt.reset_offline && !opt.no_reset {
                    pre = self.locked_reset();
                }
            }
        }
        if pre.is_ok() && opt.require_ok && !dev.state().is_ok() {
            pre = Err(MdbError::InvalidState {
                device: dev.name.clone(),
                state: dev.state(),
            });
        }

        let result = pre.and_then(|()| dev.bus.tx(request, response));
        match result {
            Ok(()) => {
                dev.last_ok.set_now();
                dev.last_off.clear();
                if dev.state() != DeviceState::Ready {
                    dev.set_state(DeviceState::Online);
                }
                dev.clear_error_code();
                Ok(())
            }
            Err(e) if e.is_timeout() && opt.timeout_offline => {
                dev.last_off.set_now_if_zero();
                dev.set_state(DeviceState::Offline);
                if e.is_offline() {
                    return Err(e);
                }
                Err(MdbError::Offline {
                    device: dev.name.clone(),
                    source: Box::new(e),
                })
            }
            Err(e) if e.is_timeout() => Err(e),
            Err(e) => {
                let e = MdbError::Device {
                    device: dev.name.clone(),
                    request: request.format(),
                    state,
                    source: Box::new(e),
                };
                dev.set_error(&e);
                Err(e)
            }
        }
    }

    /// Throttled reset. A reset requested within the offline delay of the
    /// previous attempt is skipped.
    fn locked_reset(&mut self) -> Result<(), MdbError> {
        let dev = self.dev;
        if let Some(since) = dev.last_reset.since() {
            if since < dev.delays.offline {
                debug!(device = %dev.name, since_ms = since.as_millis() as u64, "reset throttled");
                return Ok(());
            }
        }
        debug!(device = %dev.name, "reset");

        dev.last_off.set_now_if_zero();
        thread::sleep(dev.delays.before_reset);
        let mut response = Packet::new();
        let request = dev.packet_reset;
        let result = self.tx_policy(&request, &mut response, TxOpt::RESET);
        dev.last_reset.set_now();
        dev.clear_error_code();
        if let Err(e) = result {
            return Err(e.context(&dev.name, "RESET"));
        }
        thread::sleep(dev.delays.after_reset);
        Ok(())
    }
}

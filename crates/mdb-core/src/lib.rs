//! MDB-Core: vending machine MDB bus stack in Rust.
//!
//! This crate talks to vending peripherals (coin and bill validators,
//! dispensers) over the 9-bit MDB bus, either directly through a serial tty,
//! through a helper program, or through an SPI bridge microcontroller.
//!
//! # Architecture
//!
//! - **Packet**: fixed-capacity MDB block with checksum and wire encoding
//! - **Transport**: line abstraction (serial, helper, bridge, mock)
//! - **Bus**: request/response exchange and break over one transport
//! - **Device**: per-peripheral session state machine, reset policy, polling
//! - **Bridge**: SPI frame protocol, concurrent client, key input
//! - **Events**: observer pattern for telemetry
//! - **Session**: builds the configured stack
//!
//! # Example
//!
//! ```no_run
//! use mdb_core::{ByteOrder, MdbConfig, MdbSession, Packet};
//!
//! let session = MdbSession::open(MdbConfig::default()).expect("open mdb");
//! let coin = session.new_device(0x08, "coin", ByteOrder::Big);
//! coin.reset_and_setup().expect("coin setup");
//! let mut response = Packet::new();
//! coin.tx_known(coin.packet_poll(), &mut response).expect("poll");
//! ```

pub mod bridge;
pub mod bus;
pub mod clock;
pub mod config;
pub mod device;
pub mod error;
pub mod events;
pub mod packet;
pub mod session;
pub mod transport;

// Re-exports for convenience
pub use bridge::{BridgeError, Client, FakeBridge, KeyEvent, KeyReader};
pub use bus::Bus;
pub use config::{BridgeConfig, Delays, DeviceTimings, MdbConfig, UartDriver};
pub use device::{ByteOrder, Device, DeviceGuard, DeviceState, PollDelay, TxOpt};
pub use error::MdbError;
pub use events::{LogObserver, MdbEvent, MdbObserver, NoopObserver};
pub use packet::{PACKET_MAX_LENGTH, Packet, PacketError};
pub use session::MdbSession;
pub use transport::{MockReply, MockUart, TransportError, UartTransport};

//! Transport layer module.

pub mod bridge;
pub mod helper;
pub mod mock;
#[cfg(target_os = "linux")]
pub mod serial;
pub mod traits;

pub use bridge::BridgeUart;
pub use helper::HelperUart;
pub use mock::{MockReply, MockUart};
#[cfg(target_os = "linux")]
pub use serial::SerialUart;
pub use traits::{TransportError, UartTransport};

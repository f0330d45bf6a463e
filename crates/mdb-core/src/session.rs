//! MDB session: wires configuration, transport, bus and bridge together.

use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tracing::{info, instrument};

use crate::bridge::{Client, KeyReader};
use crate::bus::Bus;
use crate::config::{MdbConfig, UartDriver};
use crate::device::{ByteOrder, Device};
use crate::events::{LogObserver, MdbObserver};
use crate::transport::{BridgeUart, HelperUart, UartTransport};

/// Owner of the MDB bus and, when used, the shared bridge client.
///
/// The bridge client is created at most once, so the MDB provider and the
/// key reader share one physical link.
pub struct MdbSession {
    config: MdbConfig,
    observer: Arc<dyn MdbObserver>,
    bus: Arc<Bus>,
    bridge: Mutex<Option<Client>>,
}

impl MdbSession {
    /// Build the configured provider, open it and create the bus.
    pub fn open(config: MdbConfig) -> Result<Self> {
        Self::open_with_observer(config, Arc::new(LogObserver))
    }

    #[instrument(skip_all, fields(driver = ?config.uart_driver, device = %config.uart_device))]
    pub fn open_with_observer(config: MdbConfig, observer: Arc<dyn MdbObserver>) -> Result<Self> {
        let mut bridge = None;
        let uart: Box<dyn UartTransport> = match config.uart_driver {
            UartDriver::File => open_serial()?,
            UartDriver::Helper => Box::new(
                HelperUart::spawn(&config.helper_path)
                    .with_context(|| format!("start helper {}", config.helper_path))?,
            ),
            UartDriver::Bridge => {
                let client = open_bridge(&config, observer.clone())?;
                let uart = BridgeUart::new(&client);
                bridge = Some(client);
                Box::new(uart)
            }
        };
        uart.open(&config.uart_device)
            .with_context(|| format!("open mdb line {}", config.uart_device))?;
        info!(transport = uart.name(), "mdb session open");

        Ok(Self {
            bus: Arc::new(Bus::with_observer(uart, observer.clone())),
            config,
            observer,
            bridge: Mutex::new(bridge),
        })
    }

    /// Session over an already opened transport.
    pub fn with_transport(
        config: MdbConfig,
        uart: Box<dyn UartTransport>,
        observer: Arc<dyn MdbObserver>,
    ) -> Self {
        Self {
            bus: Arc::new(Bus::with_observer(uart, observer.clone())),
            config,
            observer,
            bridge: Mutex::new(None),
        }
    }

    /// Session whose MDB line goes through an existing bridge client.
    pub fn with_bridge(config: MdbConfig, client: Client, observer: Arc<dyn MdbObserver>) -> Self {
        let uart = Box::new(BridgeUart::new(&client));
        let session = Self::with_transport(config, uart, observer);
        *session.bridge.lock() = Some(client);
        session
    }

    pub fn config(&self) -> &MdbConfig {
        &self.config
    }

    pub fn bus(&self) -> &Arc<Bus> {
        &self.bus
    }

    /// Shared bridge client, opened on first use.
    pub fn bridge(&self) -> Result<Client> {
        let mut guard = self.bridge.lock();
        if let Some(client) = guard.as_ref() {
            return Ok(client.clone());
        }
        let client = open_bridge(&self.config, self.observer.clone())?;
        *guard = Some(client.clone());
        Ok(client)
    }

    pub fn key_reader(&self) -> Result<KeyReader> {
        Ok(KeyReader::new(&self.bridge()?))
    }

    /// Device on this bus with configured timings, ready for its first
    /// transaction.
    pub fn new_device(&self, address: u8, name: &str, byte_order: ByteOrder) -> Device {
        let dev = Device::new(self.bus.clone(), address, name, byte_order)
            .with_delays(self.config.timings.resolve());
        dev.init();
        dev
    }

    /// Close the MDB line and release the session's bridge handle. Key
    /// readers taken from this session keep the bridge alive.
    pub fn close(&self) -> Result<()> {
        self.bus.close()?;
        if let Some(client) = self.bridge.lock().take() {
            client.close();
        }
        Ok(())
    }
}

#[cfg(target_os = "linux")]
fn open_serial() -> Result<Box<dyn UartTransport>> {
    Ok(Box::new(crate::transport::SerialUart::new()))
}

#[cfg(not(target_os = "linux"))]
fn open_serial() -> Result<Box<dyn UartTransport>> {
    anyhow::bail!("uart driver 'file' requires Linux")
}

#[cfg(target_os = "linux")]
fn open_bridge(config: &MdbConfig, observer: Arc<dyn MdbObserver>) -> Result<Client> {
    Client::open_hardware(config.bridge.clone(), observer)
        .with_context(|| format!("open bridge {}", config.bridge.spi_device))
}

#[cfg(not(target_os = "linux"))]
fn open_bridge(_config: &MdbConfig, _observer: Arc<dyn MdbObserver>) -> Result<Client> {
    anyhow::bail!("bridge requires Linux spidev")
}

//! MDB line provided by the SPI bridge.

use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info};

use super::traits::{TransportError, UartTransport};
use crate::bridge::{Client, Frame, MdbResult};

const RETRIES: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_millis(10);

/// Holds one reference to a shared bridge [`Client`] while open.
pub struct BridgeUart {
    client: Mutex<Option<Client>>,
}

impl BridgeUart {
    pub fn new(client: &Client) -> Self {
        Self {
            client: Mutex::new(Some(client.clone())),
        }
    }

    /// Map the MDB result carried by a bridge reply.
    fn check_result(f: &Frame) -> Result<(), TransportError> {
        match f.fields.mdb_result {
            Some(MdbResult::Success) => Ok(()),
            Some(MdbResult::Busy) => Err(TransportError::Busy),
            Some(MdbResult::Timeout) => Err(TransportError::Timeout),
            Some(MdbResult::Nak) => Err(TransportError::Nak),
            result => Err(TransportError::BridgeResult {
                result,
                error: f.fields.mdb_error,
            }),
        }
    }

    /// Run `op` up to [`RETRIES`] times. Timeout, NAK and critical errors
    /// end the loop at once.
    fn retry<T>(
        what: &str,
        mut op: impl FnMut() -> Result<T, TransportError>,
    ) -> Result<T, TransportError> {
        let mut attempt = 1;
        loop {
            let err = match op() {
                Ok(v) => return Ok(v),
                Err(e @ (TransportError::Timeout | TransportError::Nak)) => return Err(e),
                Err(e) if e.is_critical() => return Err(e),
                Err(e) => e,
            };
            if attempt >= RETRIES {
                return Err(err);
            }
            debug!(attempt, error = %err, "bridge {} retry", what);
            attempt += 1;
            thread::sleep(RETRY_DELAY);
        }
    }

    fn tx_once(client: &Client, request: &[u8], response: &mut [u8]) -> Result<usize, TransportError> {
        let f = client.mdb_tx_simple(request)?;
        BridgeUart::check_result(&f)?;
        let data = &f.fields.mdb_data;
        if data.len() > response.len() {
            return Err(crate::packet::PacketError::Overflow { len: data.len() }.into());
        }
        response[..data.len()].copy_from_slice(data);
        Ok(data.len())
    }
}

impl UartTransport for BridgeUart {
    /// The bridge owns the physical line; nothing to open.
    fn open(&self, path: &str) -> Result<(), TransportError> {
        if self.client.lock().is_none() {
            return Err(TransportError::NotOpen);
        }
        info!(path = %path, "mdb over bridge");
        Ok(())
    }

    fn close(&self) -> Result<(), TransportError> {
        self.client.lock().take();
        Ok(())
    }

    fn brk(&self, keep: Duration, settle: Duration) -> Result<(), TransportError> {
        {
            let guard = self.client.lock();
            let client = guard.as_ref().ok_or(TransportError::NotOpen)?;
            BridgeUart::retry("bus reset", || {
                let f = client.mdb_bus_reset(keep)?;
                BridgeUart::check_result(&f)
            })?;
        }
        thread::sleep(settle);
        Ok(())
    }

    fn tx(&self, request: &[u8], response: &mut [u8]) -> Result<usize, TransportError> {
        let guard = self.client.lock();
        let client = guard.as_ref().ok_or(TransportError::NotOpen)?;
        BridgeUart::retry("mdb tx", || BridgeUart::tx_once(client, request, response))
    }

    fn name(&self) -> &'static str {
        "bridge"
    }
}

//! MDB bus: one shared line to which devices send requests.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument, trace};

use crate::error::MdbError;
use crate::events::{MdbEvent, MdbObserver, NoopObserver};
use crate::packet::{PACKET_MAX_LENGTH, Packet};
use crate::transport::UartTransport;

/// Default break hold time.
pub const DEFAULT_RESET_KEEP: Duration = Duration::from_millis(200);
/// Default settle time after break.
pub const DEFAULT_RESET_SLEEP: Duration = Duration::from_millis(500);

pub struct Bus {
    uart: Box<dyn UartTransport>,
    observer: Arc<dyn MdbObserver>,
}

impl Bus {
    pub fn new(uart: Box<dyn UartTransport>) -> Self {
        Self::with_observer(uart, Arc::new(NoopObserver))
    }

    pub fn with_observer(uart: Box<dyn UartTransport>, observer: Arc<dyn MdbObserver>) -> Self {
        Self { uart, observer }
    }

    pub fn observer(&self) -> &Arc<dyn MdbObserver> {
        &self.observer
    }

    pub fn transport_name(&self) -> &'static str {
        self.uart.name()
    }

    /// Break with default timing.
    pub fn reset_default(&self) -> Result<(), MdbError> {
        self.reset(DEFAULT_RESET_KEEP, DEFAULT_RESET_SLEEP)
    }

    /// Hold the line in break for `keep`, then wait `sleep`.
    #[instrument(skip(self), level = "debug")]
    pub fn reset(&self, keep: Duration, sleep: Duration) -> Result<(), MdbError> {
        debug!("mdb.bus.reset");
        self.uart.brk(keep, sleep).map_err(MdbError::BusReset)?;
        self.observer.on_event(&MdbEvent::BusReset { keep });
        Ok(())
    }

    /// Exchange one request for one response.
    ///
    /// An empty request is a successful no-op. `response` is overwritten
    /// with the peripheral's payload, possibly empty; it must be writable,
    /// which is checked before anything goes on the line.
    pub fn tx(&self, request: &Packet, response: &mut Packet) -> Result<(), MdbError> {
        if request.is_empty() {
            return Ok(());
        }
        response.clear()?;

        let mut buf = [0u8; PACKET_MAX_LENGTH];
        let n = match self.uart.tx(request.as_bytes(), &mut buf) {
            Ok(n) => n.min(PACKET_MAX_LENGTH),
            Err(source) => {
                trace!(request = %request.format(), error = %source, "mdb.tx failed");
                self.observer.on_event(&MdbEvent::ExchangeFailed {
                    request: *request,
                    timeout: source.is_timeout(),
                    error: source.to_string(),
                });
                return Err(MdbError::Tx {
                    request: request.format(),
                    response: String::new(),
                    source,
                });
            }
        };
        response.write(&buf[..n])?;
        trace!(request = %request.format(), response = %response.format(), "mdb.tx");

        self.observer.on_event(&MdbEvent::Exchange {
            request: *request,
            response: *response,
        });
        Ok(())
    }

    pub fn close(&self) -> Result<(), MdbError> {
        self.uart.close().map_err(MdbError::Close)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::testing::RecordingObserver;
    use crate::packet::PacketError;
    use crate::transport::{MockReply, MockUart, TransportError};

    #[test]
    fn test_tx_empty_is_noop() {
        let mock = MockUart::new();
        let bus = Bus::new(Box::new(mock.clone()));
        let mut response = Packet::new();
        bus.tx(&Packet::EMPTY, &mut response).unwrap();
        assert!(mock.requests().is_empty());
    }

    #[test]
    fn test_tx_copies_response() {
        let mock = MockUart::new();
        mock.expect("0b", "0102");
        let bus = Bus::new(Box::new(mock.clone()));
        let mut response = Packet::must_from_hex("ffffff", false);
        bus.tx(&Packet::must_from_hex("0b", true), &mut response)
            .unwrap();
        assert_eq!(response.as_bytes(), &[0x01, 0x02]);
    }

    #[test]
    fn test_tx_ack_clears_response() {
        let mock = MockUart::new();
        mock.expect("0b", "");
        let bus = Bus::new(Box::new(mock));
        let mut response = Packet::must_from_hex("aa", false);
        bus.tx(&Packet::must_from_hex("0b", true), &mut response)
            .unwrap();
        assert!(response.is_empty());
    }

    #[test]
    fn test_tx_error_carries_request() {
        let mock = MockUart::new();
        mock.expect_reply("0b", MockReply::Nak);
        let bus = Bus::new(Box::new(mock));
        let mut response = Packet::new();
        let err = bus
            .tx(&Packet::must_from_hex("0b", true), &mut response)
            .unwrap_err();
        assert!(err.to_string().contains("send=0b"));
        assert!(!err.is_timeout());
    }

    #[test]
    fn test_readonly_response_rejected_before_send() {
        let mock = MockUart::new();
        mock.expect("0b", "01");
        let bus = Bus::new(Box::new(mock.clone()));
        let mut response = Packet::ACK;
        let err = bus
            .tx(&Packet::must_from_hex("0b", true), &mut response)
            .unwrap_err();
        assert!(matches!(err, MdbError::Packet(PacketError::Readonly)), "{err}");
        assert!(mock.requests().is_empty());
    }

    #[test]
    fn test_tx_emits_exchange_events() {
        let mock = MockUart::new();
        mock.expect("0b", "0102");
        mock.expect_reply("0f", MockReply::Timeout);
        let observer = Arc::new(RecordingObserver::default());
        let bus = Bus::with_observer(Box::new(mock), observer.clone());
        let mut response = Packet::new();
        bus.tx(&Packet::must_from_hex("0b", true), &mut response)
            .unwrap();
        assert!(
            bus.tx(&Packet::must_from_hex("0f", true), &mut response)
                .is_err()
        );

        let events = observer.events.lock();
        assert!(matches!(
            &events[0],
            MdbEvent::Exchange { request, response }
                if request.as_bytes() == [0x0b] && response.as_bytes() == [0x01, 0x02]
        ));
        assert!(matches!(
            &events[1],
            MdbEvent::ExchangeFailed { timeout: true, .. }
        ));
    }

    struct StuckLine;

    impl UartTransport for StuckLine {
        fn open(&self, _path: &str) -> Result<(), TransportError> {
            Ok(())
        }
        fn close(&self) -> Result<(), TransportError> {
            Err(TransportError::NotOpen)
        }
        fn brk(&self, _keep: Duration, _settle: Duration) -> Result<(), TransportError> {
            Ok(())
        }
        fn tx(&self, _request: &[u8], _response: &mut [u8]) -> Result<usize, TransportError> {
            Err(TransportError::Timeout)
        }
        fn name(&self) -> &'static str {
            "stuck"
        }
    }

    #[test]
    fn test_close_error_kind() {
        let bus = Bus::new(Box::new(StuckLine));
        let err = bus.close().unwrap_err();
        assert!(matches!(err, MdbError::Close(TransportError::NotOpen)), "{err}");
        assert!(!err.is_timeout());
    }

    #[test]
    fn test_reset_emits_event() {
        let mock = MockUart::new();
        let observer = Arc::new(RecordingObserver::default());
        let bus = Bus::with_observer(Box::new(mock.clone()), observer.clone());
        bus.reset_default().unwrap();
        assert_eq!(mock.breaks(), 1);
        assert!(matches!(
            observer.events.lock()[0],
            MdbEvent::BusReset { keep } if keep == DEFAULT_RESET_KEEP
        ));
    }
}

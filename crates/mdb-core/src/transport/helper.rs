//! MDB line driven by an external helper program.
//!
//! The helper owns the line (typically a privileged bit-banging process) and
//! speaks a small record protocol over its stdin/stdout:
//!
//! | request                  | reply                               |
//! |--------------------------|-------------------------------------|
//! | `'O' len path`           | status                              |
//! | `'B' keep_ms:u16be`      | status                              |
//! | `'T' wire(request)`      | status, then `wire(response)` on ok |
//!
//! Status bytes: `0` ok, `1` timeout, `2` NAK, `3` busy, anything else is an
//! error. Packets travel in escaped wire form.

use std::io::{BufReader, Read, Write};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::Duration;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use super::traits::{TransportError, UartTransport};
use crate::packet::{Packet, PacketError};

const REQ_OPEN: u8 = b'O';
const REQ_BREAK: u8 = b'B';
const REQ_TX: u8 = b'T';

const STATUS_OK: u8 = 0;
const STATUS_TIMEOUT: u8 = 1;
const STATUS_NAK: u8 = 2;
const STATUS_BUSY: u8 = 3;

struct HelperIo {
    reader: BufReader<Box<dyn Read + Send>>,
    writer: Box<dyn Write + Send>,
    child: Option<Child>,
}

impl HelperIo {
    fn send(&mut self, record: &[u8]) -> Result<(), TransportError> {
        self.writer.write_all(record)?;
        self.writer.flush()?;
        Ok(())
    }

    fn status(&mut self) -> Result<(), TransportError> {
        match self.reader.read_u8()? {
            STATUS_OK => Ok(()),
            STATUS_TIMEOUT => Err(TransportError::Timeout),
            STATUS_NAK => Err(TransportError::Nak),
            STATUS_BUSY => Err(TransportError::Busy),
            other => Err(TransportError::Helper(format!("status={other:02x}"))),
        }
    }
}

pub struct HelperUart {
    io: Mutex<Option<HelperIo>>,
}

impl HelperUart {
    /// Start `program` and talk to it over its standard streams.
    #[instrument(level = "info")]
    pub fn spawn(program: &str) -> Result<Self, TransportError> {
        let mut child = Command::new(program)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .map_err(|e| TransportError::OpenFailed {
                path: program.to_string(),
                message: e.to_string(),
            })?;
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(TransportError::Helper("helper stdio unavailable".into()));
        };
        info!(pid = child.id(), "helper started");
        Ok(Self {
            io: Mutex::new(Some(HelperIo {
                reader: BufReader::new(Box::new(stdout)),
                writer: Box::new(stdin),
                child: Some(child),
            })),
        })
    }

    /// Use already connected streams instead of a child process.
    pub fn with_io(reader: Box<dyn Read + Send>, writer: Box<dyn Write + Send>) -> Self {
        Self {
            io: Mutex::new(Some(HelperIo {
                reader: BufReader::new(reader),
                writer,
                child: None,
            })),
        }
    }
}

impl UartTransport for HelperUart {
    fn open(&self, path: &str) -> Result<(), TransportError> {
        let mut guard = self.io.lock();
        let io = guard.as_mut().ok_or(TransportError::NotOpen)?;
        let len = u8::try_from(path.len())
            .map_err(|_| TransportError::Unsupported(format!("path too long: {path}")))?;
        let mut record = vec![REQ_OPEN, len];
        record.extend_from_slice(path.as_bytes());
        io.send(&record)?;
        io.status()
    }

    fn close(&self) -> Result<(), TransportError> {
        let Some(mut io) = self.io.lock().take() else {
            return Ok(());
        };
        // Dropping stdin lets the helper see EOF.
        drop(io.writer);
        if let Some(mut child) = io.child.take() {
            match child.wait() {
                Ok(status) => debug!(%status, "helper exited"),
                Err(e) => warn!(error = %e, "helper wait failed"),
            }
        }
        Ok(())
    }

    fn brk(&self, keep: Duration, settle: Duration) -> Result<(), TransportError> {
        {
            let mut guard = self.io.lock();
            let io = guard.as_mut().ok_or(TransportError::NotOpen)?;
            let mut record = vec![REQ_BREAK];
            record.write_u16::<BigEndian>(keep.as_millis().min(u16::MAX as u128) as u16)?;
            io.send(&record)?;
            io.status()?;
        }
        thread::sleep(settle);
        Ok(())
    }

    fn tx(&self, request: &[u8], response: &mut [u8]) -> Result<usize, TransportError> {
        let packet = Packet::from_bytes(request, true)?;
        let mut guard = self.io.lock();
        let io = guard.as_mut().ok_or(TransportError::NotOpen)?;

        let mut record = vec![REQ_TX];
        record.extend_from_slice(&packet.wire(true));
        io.send(&record)?;
        io.status()?;

        let (reply, received) = Packet::read_wire(&mut io.reader)?;
        reply.validate_checksum(received)?;
        let n = reply.len();
        if n > response.len() {
            return Err(PacketError::Overflow { len: n }.into());
        }
        response[..n].copy_from_slice(reply.as_bytes());
        Ok(n)
    }

    fn name(&self) -> &'static str {
        "helper"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct Sink(Arc<Mutex<Vec<u8>>>);

    impl Write for Sink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn helper(replies: Vec<u8>) -> (HelperUart, Sink) {
        let sink = Sink::default();
        let uart = HelperUart::with_io(Box::new(Cursor::new(replies)), Box::new(sink.clone()));
        (uart, sink)
    }

    #[test]
    fn test_open_record() {
        let (uart, sink) = helper(vec![STATUS_OK]);
        uart.open("/dev/tty1").unwrap();
        let mut expect = vec![b'O', 9];
        expect.extend_from_slice(b"/dev/tty1");
        assert_eq!(*sink.0.lock(), expect);
    }

    #[test]
    fn test_break_record() {
        let (uart, sink) = helper(vec![STATUS_OK]);
        uart.brk(Duration::from_millis(200), Duration::ZERO).unwrap();
        assert_eq!(*sink.0.lock(), vec![b'B', 0x00, 0xc8]);
    }

    #[test]
    fn test_tx_round_trip() {
        let reply = Packet::must_from_hex("ff01", true);
        let mut replies = vec![STATUS_OK];
        replies.extend_from_slice(&reply.wire(true));
        let (uart, sink) = helper(replies);

        let mut buf = [0u8; 40];
        let n = uart.tx(&[0x0b], &mut buf).unwrap();
        assert_eq!(&buf[..n], &[0xff, 0x01]);
        assert_eq!(*sink.0.lock(), vec![b'T', 0x0b, 0xff, 0x00, 0x0b]);
    }

    #[test]
    fn test_tx_status_codes() {
        let (uart, _) = helper(vec![STATUS_TIMEOUT, STATUS_NAK, STATUS_BUSY, 0x7f]);
        let mut buf = [0u8; 40];
        assert!(matches!(uart.tx(&[0x0b], &mut buf), Err(TransportError::Timeout)));
        assert!(matches!(uart.tx(&[0x0b], &mut buf), Err(TransportError::Nak)));
        assert!(matches!(uart.tx(&[0x0b], &mut buf), Err(TransportError::Busy)));
        assert!(matches!(uart.tx(&[0x0b], &mut buf), Err(TransportError::Helper(_))));
    }

    #[test]
    fn test_tx_checksum_mismatch() {
        let (uart, _) = helper(vec![STATUS_OK, 0x01, 0xff, 0x00, 0x05]);
        let mut buf = [0u8; 40];
        assert!(matches!(
            uart.tx(&[0x0b], &mut buf),
            Err(TransportError::InvalidChecksum {
                received: 0x05,
                actual: 0x01
            })
        ));
    }

    #[test]
    fn test_closed_helper() {
        let (uart, _) = helper(vec![]);
        uart.close().unwrap();
        uart.close().unwrap();
        assert!(matches!(
            uart.tx(&[0x0b], &mut [0u8; 40]),
            Err(TransportError::NotOpen)
        ));
    }
}

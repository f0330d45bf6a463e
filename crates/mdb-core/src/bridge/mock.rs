//! In-process bridge firmware emulator.
//!
//! [`FakeBridge`] answers the SPI exchanges a real bridge would: length
//! reads, frame reads, acknowledgements and command writes. A responder
//! closure decides which frames a command produces. Used by the client and
//! transport tests, and by the CLI's offline mode.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use super::frame::Frame;
use super::hw::{NotifyLine, SpiLink};
use super::protocol::{
    Command, Errcode, FLAG_PAYLOAD, FLAG_REQUEST_BUSY, Field, MdbResult, PAD_ERROR, PAD_OK,
    PROTOCOL_VERSION, Response, WRITE_ACK_LEN,
};

type Responder = Box<dyn FnMut(Command, &[u8]) -> Vec<Frame> + Send>;

#[derive(Default)]
struct FakeState {
    outbox: VecDeque<Frame>,
    commands: Vec<(Command, Vec<u8>)>,
    responder: Option<Responder>,
    busy_writes: u32,
    acks: u32,
}

#[derive(Clone)]
pub struct FakeBridge {
    state: Arc<Mutex<FakeState>>,
    edge_tx: Sender<()>,
    edge_rx: Receiver<()>,
}

impl Default for FakeBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeBridge {
    pub fn new() -> Self {
        let (edge_tx, edge_rx) = channel::unbounded();
        Self {
            state: Arc::new(Mutex::new(FakeState::default())),
            edge_tx,
            edge_rx,
        }
    }

    /// Bridge that answers MDB transactions with `mdb_ok(&[])` and every
    /// other command with an empty OK.
    pub fn acking() -> Self {
        let fake = Self::new();
        fake.respond_with(|cmd, _| match cmd {
            Command::MdbTransactionSimple | Command::MdbBusReset => vec![FakeBridge::mdb_ok(&[])],
            _ => vec![FakeBridge::response(Response::Ok, &[])],
        });
        fake
    }

    pub fn spi(&self) -> Box<dyn SpiLink> {
        Box::new(FakeSpi {
            state: self.state.clone(),
            edge: self.edge_tx.clone(),
        })
    }

    pub fn notify(&self) -> Box<dyn NotifyLine> {
        Box::new(FakeNotify {
            state: self.state.clone(),
            edge: self.edge_rx.clone(),
        })
    }

    /// Queue an unsolicited frame and raise the notify line.
    pub fn push_frame(&self, frame: Frame) {
        self.state.lock().outbox.push_back(frame);
        let _ = self.edge_tx.send(());
    }

    pub fn respond_with<F>(&self, f: F)
    where
        F: FnMut(Command, &[u8]) -> Vec<Frame> + Send + 'static,
    {
        self.state.lock().responder = Some(Box::new(f));
    }

    /// Reject the next `n` command writes as busy.
    pub fn set_busy_writes(&self, n: u32) {
        self.state.lock().busy_writes = n;
    }

    /// Accepted commands with their arguments, oldest first.
    pub fn commands(&self) -> Vec<(Command, Vec<u8>)> {
        self.state.lock().commands.clone()
    }

    pub fn acks(&self) -> u32 {
        self.state.lock().acks
    }

    pub fn pending(&self) -> usize {
        self.state.lock().outbox.len()
    }

    /// Reply frame with raw field bytes. Panics on oversized input, which
    /// only test code produces.
    pub fn response(kind: Response, fields: &[u8]) -> Frame {
        match Frame::new_response(kind, fields) {
            Ok(f) => f,
            Err(e) => panic!("fake bridge response: {e}"),
        }
    }

    /// Successful MDB transaction carrying `data`.
    pub fn mdb_ok(data: &[u8]) -> Frame {
        FakeBridge::mdb_result(MdbResult::Success, data)
    }

    pub fn mdb_result(result: MdbResult, data: &[u8]) -> Frame {
        let mut fields = vec![u8::from(Field::MdbResult), u8::from(result), 0];
        if !data.is_empty() {
            fields.push(u8::from(Field::MdbData));
            fields.push(data.len() as u8);
            fields.extend_from_slice(data);
        }
        FakeBridge::response(Response::Ok, &fields)
    }

    /// Captured keyboard input.
    pub fn twi(data: &[u8]) -> Frame {
        let mut fields = vec![u8::from(Field::TwiData), data.len() as u8];
        fields.extend_from_slice(data);
        FakeBridge::response(Response::TwiListen, &fields)
    }

    /// Bridge startup report with the given reset cause flags.
    pub fn reset(mcusr: u8) -> Frame {
        FakeBridge::response(Response::Reset, &[u8::from(Field::Mcusr), mcusr])
    }
}

struct FakeSpi {
    state: Arc<Mutex<FakeState>>,
    edge: Sender<()>,
}

impl FakeSpi {
    fn read_frame(state: &FakeState, buf: &mut [u8]) {
        buf.fill(PAD_OK);
        let Some(front) = state.outbox.front() else {
            buf[..2].copy_from_slice(&[PROTOCOL_VERSION, 0]);
            return;
        };
        let bs = front.bytes();
        let n = bs.len().min(buf.len());
        buf[..n].copy_from_slice(&bs[..n]);
        if n < buf.len() {
            buf[n] = 0;
        }
    }

    fn ack(&self, state: &mut FakeState, buf: &mut [u8]) {
        let (plen, crc) = (buf[2], buf[3]);
        let matches = state
            .outbox
            .front()
            .is_some_and(|f| f.plen() == plen && f.crc() == crc);
        if matches {
            state.outbox.pop_front();
            state.acks += 1;
        }
        buf.fill(0);
        buf[4..].fill(PAD_OK);
        if !state.outbox.is_empty() {
            let _ = self.edge.send(());
        }
    }

    fn write(&self, state: &mut FakeState, buf: &mut [u8]) {
        let cmd_len = (3 + buf[1] as usize).min(buf.len());
        let pad_start = (cmd_len + WRITE_ACK_LEN).min(buf.len());
        if state.busy_writes > 0 {
            state.busy_writes -= 1;
            buf.fill(0);
            buf[pad_start - 1] = u8::from(Errcode::RequestOverwrite);
            buf[pad_start..].fill(PAD_ERROR);
            return;
        }

        let command = Command::from(buf[2]);
        let args = buf[3..cmd_len - 1].to_vec();
        let crc = buf[cmd_len - 1];
        state.commands.push((command, args.clone()));

        buf.fill(0);
        buf[0] = PROTOCOL_VERSION;
        buf[cmd_len..cmd_len + 4].copy_from_slice(&[0x00, 0xff, crc, crc]);
        buf[pad_start..].fill(PAD_OK);

        if let Some(responder) = state.responder.as_mut() {
            let frames = responder(command, &args);
            if !frames.is_empty() {
                state.outbox.extend(frames);
                let _ = self.edge.send(());
            }
        }
    }
}

impl SpiLink for FakeSpi {
    fn transfer(&mut self, buf: &mut [u8]) -> io::Result<()> {
        let mut state = self.state.lock();
        if buf.len() == 2 {
            let plen = state.outbox.front().map_or(0, |f| f.plen());
            buf.copy_from_slice(&[PROTOCOL_VERSION, plen]);
        } else if buf[0] & FLAG_REQUEST_BUSY != 0 && buf.len() > 4 && buf[1] == 2 {
            self.ack(&mut state, buf);
        } else if buf[0] & FLAG_PAYLOAD != 0 && buf.len() > 3 {
            self.write(&mut state, buf);
        } else {
            FakeSpi::read_frame(&state, buf);
        }
        Ok(())
    }
}

struct FakeNotify {
    state: Arc<Mutex<FakeState>>,
    edge: Receiver<()>,
}

impl NotifyLine for FakeNotify {
    fn is_high(&mut self) -> io::Result<bool> {
        Ok(!self.state.lock().outbox.is_empty())
    }

    fn wait_rising(&mut self, timeout: Duration) -> io::Result<bool> {
        match self.edge.recv_timeout(timeout) {
            Ok(()) => Ok(true),
            Err(RecvTimeoutError::Timeout) => Ok(false),
            Err(RecvTimeoutError::Disconnected) => {
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "notify closed"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::frame::parse_padding;

    #[test]
    fn test_length_read_empty_and_pending() {
        let fake = FakeBridge::new();
        let mut spi = fake.spi();
        let mut b = [PROTOCOL_VERSION, 0];
        spi.transfer(&mut b).unwrap();
        assert_eq!(b, [PROTOCOL_VERSION, 0]);

        fake.push_frame(FakeBridge::reset(0x01));
        let mut b = [PROTOCOL_VERSION, 0];
        spi.transfer(&mut b).unwrap();
        assert_eq!(b[1], 3);
    }

    #[test]
    fn test_frame_read_and_ack() {
        let fake = FakeBridge::new();
        let frame = FakeBridge::mdb_ok(&[0x42]);
        fake.push_frame(frame.clone());
        let mut spi = fake.spi();

        let mut b = vec![0u8; frame.plen() as usize + 12];
        b[0] = PROTOCOL_VERSION;
        spi.transfer(&mut b).unwrap();
        let parsed = Frame::from_reply(&b).unwrap();
        assert_eq!(parsed.fields.mdb_data, vec![0x42]);

        let mut ack = [0u8; 14];
        ack[0] = FLAG_REQUEST_BUSY | PROTOCOL_VERSION;
        ack[1] = 2;
        ack[2] = parsed.plen();
        ack[3] = parsed.crc();
        spi.transfer(&mut ack).unwrap();
        parse_padding(&ack, true).unwrap();
        assert_eq!(fake.acks(), 1);
        assert_eq!(fake.pending(), 0);
    }

    #[test]
    fn test_write_busy_then_accept() {
        let fake = FakeBridge::acking();
        fake.set_busy_writes(1);
        let mut spi = fake.spi();
        let cmd = Frame::new_command(Command::Status, &[]).unwrap();
        let fresh = || {
            let mut b = vec![0u8; cmd.bytes().len() + WRITE_ACK_LEN + 12];
            b[..cmd.bytes().len()].copy_from_slice(cmd.bytes());
            b
        };

        let mut b = fresh();
        spi.transfer(&mut b).unwrap();
        let p = parse_padding(&b, false).unwrap();
        assert_eq!(p.code, Some(Errcode::RequestOverwrite));
        assert!(fake.commands().is_empty());

        let mut b = fresh();
        spi.transfer(&mut b).unwrap();
        let p = parse_padding(&b, false).unwrap();
        assert_eq!(p.code, None);
        assert_eq!(
            &b[p.start - WRITE_ACK_LEN..p.start - 2],
            &[0x00, 0xff, cmd.crc(), cmd.crc()]
        );
        assert_eq!(fake.commands(), vec![(Command::Status, vec![])]);
        assert_eq!(fake.pending(), 1);
    }
}

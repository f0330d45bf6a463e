//! Bridge client.
//!
//! One I/O worker thread owns the SPI link and serializes everything that
//! touches it: command transactions, background reads triggered by the
//! notify line, and raw debugging exchanges. A second thread watches the
//! notify line. Callers submit jobs and block on a per-request completion
//! channel.
//!
//! [`Client`] is a reference-counted handle; the link is closed when the last
//! handle is dropped or passed to [`Client::close`].

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};
use crossbeam::channel::{self, Receiver, Sender, TryRecvError, TrySendError, select};
use tracing::{debug, error, info, instrument, trace, warn};

use super::BridgeError;
use super::frame::{Frame, parse_header, parse_padding};
use super::hw::{NotifyLine, SpiLink};
use super::protocol::{
    BUFFER_SIZE, Command, Errcode, FLAG_REQUEST_BUSY, MdbResult, PROTOCOL_VERSION, Response,
    TOTAL_OVERHEAD, WRITE_ACK_LEN,
};
use crate::config::BridgeConfig;
use crate::events::{MdbEvent, MdbObserver};

/// Longest MDB exchange the bridge performs for a simple transaction.
const MAX_MDB_READ_TIME: Duration = Duration::from_millis(40);

/// Protocol counters.
#[derive(Debug, Default)]
pub struct Stats {
    request: AtomicU32,
    error: AtomicU32,
    twi_listen: AtomicU32,
    reset: AtomicU32,
}

/// Copy of [`Stats`] at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub request: u32,
    pub error: u32,
    pub twi_listen: u32,
    pub reset: u32,
}

impl Stats {
    fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            request: self.request.load(Ordering::Relaxed),
            error: self.error.load(Ordering::Relaxed),
            twi_listen: self.twi_listen.load(Ordering::Relaxed),
            reset: self.reset.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "request={} error={} twi_listen={} reset={}",
            self.request, self.error, self.twi_listen, self.reset
        )
    }
}

enum Job {
    Tx {
        command: Option<Frame>,
        timeout: Duration,
        done: Sender<Result<Frame, BridgeError>>,
    },
    Raw {
        bytes: Vec<u8>,
        done: Sender<Result<Vec<u8>, BridgeError>>,
    },
}

struct Shared {
    config: BridgeConfig,
    jobs: Option<Sender<Job>>,
    stop: Option<Sender<()>>,
    workers: Vec<JoinHandle<()>>,
    keys: Receiver<u16>,
    stats: Arc<Stats>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        // Disconnected channels make both workers return.
        self.jobs.take();
        self.stop.take();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!("bridge worker panicked");
            }
        }
        info!(stats = %self.stats.snapshot(), "bridge closed");
    }
}

pub struct Client {
    shared: Arc<Shared>,
}

impl Client {
    /// Handshake with the bridge over `spi` and start the worker threads.
    #[instrument(skip_all, fields(spi = %config.spi_device))]
    pub fn open(
        spi: Box<dyn SpiLink>,
        notify: Box<dyn NotifyLine>,
        config: BridgeConfig,
        observer: Arc<dyn MdbObserver>,
    ) -> Result<Client, BridgeError> {
        let stats = Arc::new(Stats::default());
        let (key_tx, key_rx) = channel::bounded(1);
        let mut link = Link {
            spi,
            config: config.clone(),
            stats: stats.clone(),
            keys: key_tx,
            observer,
        };
        link.handshake()?;

        let (job_tx, job_rx) = channel::bounded(0);
        let (notify_tx, notify_rx) = channel::bounded(0);
        let (stop_tx, stop_rx) = channel::bounded::<()>(0);
        let listener_stop = stop_rx.clone();
        let poll = config.notify_poll();

        let io = thread::Builder::new()
            .name("bridge-io".into())
            .spawn(move || link.run(job_rx, notify_rx, stop_rx))?;
        let listener = thread::Builder::new()
            .name("bridge-notify".into())
            .spawn(move || notify_loop(notify, notify_tx, listener_stop, poll))?;

        info!("bridge open");
        Ok(Client {
            shared: Arc::new(Shared {
                config,
                jobs: Some(job_tx),
                stop: Some(stop_tx),
                workers: vec![io, listener],
                keys: key_rx,
                stats,
            }),
        })
    }

    /// Open the SPI device and notify GPIO named in `config`.
    #[cfg(target_os = "linux")]
    pub fn open_hardware(
        config: BridgeConfig,
        observer: Arc<dyn MdbObserver>,
    ) -> Result<Client, BridgeError> {
        let spi = super::hw::SpidevLink::open(&config.spi_device, config.spi_speed_hz)?;
        let notify = super::hw::CdevNotify::open(&config.notify_chip, config.notify_line)?;
        Client::open(Box::new(spi), Box::new(notify), config, observer)
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.shared.config
    }

    /// Number of live handles.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.shared)
    }

    /// Release this handle. The link is torn down when the last handle goes;
    /// until then the other holders keep working.
    pub fn close(self) {
        let refs = self.ref_count();
        if refs > 1 {
            debug!(refs = refs - 1, "bridge handle released, link still in use");
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Key items captured by the bridge. Holds at most one pending item.
    pub fn key_events(&self) -> Receiver<u16> {
        self.shared.keys.clone()
    }

    fn submit(&self, job: Job) -> Result<(), BridgeError> {
        let jobs = self.shared.jobs.as_ref().ok_or(BridgeError::Closed)?;
        jobs.send(job).map_err(|_| BridgeError::Closed)
    }

    /// Send `command` (if any) and wait up to `timeout` for the reply.
    ///
    /// With no command and a zero timeout this is a non-blocking check that
    /// returns [`BridgeError::ResponseEmpty`] when nothing is pending.
    pub fn tx(&self, command: Option<Frame>, timeout: Duration) -> Result<Frame, BridgeError> {
        let (done, result) = channel::bounded(1);
        self.submit(Job::Tx {
            command,
            timeout,
            done,
        })?;
        result.recv().map_err(|_| BridgeError::Closed)?
    }

    pub fn do_timeout(
        &self,
        cmd: Command,
        data: &[u8],
        timeout: Duration,
    ) -> Result<Frame, BridgeError> {
        self.shared.stats.request.fetch_add(1, Ordering::Relaxed);
        let frame = Frame::new_command(cmd, data)?;
        self.tx(Some(frame), timeout)
    }

    pub fn status(&self) -> Result<Frame, BridgeError> {
        self.do_timeout(Command::Status, &[], self.shared.config.default_timeout())
    }

    /// Hold the MDB line in break for `keep`.
    pub fn mdb_bus_reset(&self, keep: Duration) -> Result<Frame, BridgeError> {
        let mut arg = [0u8; 2];
        BigEndian::write_u16(&mut arg, keep.as_millis().min(u16::MAX as u128) as u16);
        self.do_timeout(
            Command::MdbBusReset,
            &arg,
            keep + self.shared.config.default_timeout(),
        )
    }

    pub fn mdb_tx_simple(&self, data: &[u8]) -> Result<Frame, BridgeError> {
        self.do_timeout(
            Command::MdbTransactionSimple,
            data,
            MAX_MDB_READ_TIME + self.shared.config.default_timeout(),
        )
    }

    /// Exchange raw bytes with the bridge, bypassing framing. Debugging only.
    pub fn raw_tx(&self, bytes: &[u8]) -> Result<Vec<u8>, BridgeError> {
        let (done, result) = channel::bounded(1);
        self.submit(Job::Raw {
            bytes: bytes.to_vec(),
            done,
        })?;
        result.recv().map_err(|_| BridgeError::Closed)?
    }
}

impl Clone for Client {
    fn clone(&self) -> Self {
        let shared = self.shared.clone();
        debug!(refs = Arc::strong_count(&shared), "bridge incref");
        Client { shared }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        debug!(refs = Arc::strong_count(&self.shared) - 1, "bridge decref");
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("spi", &self.shared.config.spi_device)
            .field("refs", &self.ref_count())
            .finish()
    }
}

/// Wait for a notification. A zero timeout only takes one already pending.
fn io_wait(notify: &Receiver<()>, timeout: Duration) -> bool {
    if timeout.is_zero() {
        notify.try_recv().is_ok()
    } else {
        notify.recv_timeout(timeout).is_ok()
    }
}

fn notify_loop(
    mut line: Box<dyn NotifyLine>,
    notify: Sender<()>,
    stop: Receiver<()>,
    poll: Duration,
) {
    // Rendezvous with the worker so every edge is consumed by one read.
    let signal = |notify: &Sender<()>, stop: &Receiver<()>| -> bool {
        select! {
            send(notify, ()) -> res => res.is_ok(),
            recv(stop) -> _ => false,
        }
    };

    match line.is_high() {
        Ok(true) => {
            debug!("notify=high on start");
            if !signal(&notify, &stop) {
                return;
            }
        }
        Ok(false) => {}
        Err(e) => error!(error = %e, "notify line read failed"),
    }

    loop {
        match stop.try_recv() {
            Err(TryRecvError::Empty) => {}
            _ => return,
        }
        match line.wait_rising(poll) {
            Ok(true) => {
                if !signal(&notify, &stop) {
                    return;
                }
            }
            Ok(false) => {}
            Err(e) => {
                error!(error = %e, "notify line wait failed, stopping listener");
                return;
            }
        }
    }
}

/// Worker-owned side of the link.
struct Link {
    spi: Box<dyn SpiLink>,
    config: BridgeConfig,
    stats: Arc<Stats>,
    keys: Sender<u16>,
    observer: Arc<dyn MdbObserver>,
}

impl Link {
    fn run(mut self, jobs: Receiver<Job>, notify: Receiver<()>, stop: Receiver<()>) {
        loop {
            select! {
                recv(jobs) -> job => match job {
                    Ok(Job::Tx { command, timeout, done }) => {
                        let result = self.io_tx(command.as_ref(), timeout, &notify);
                        if let Err(e) = &result {
                            self.stats.error.fetch_add(1, Ordering::Relaxed);
                            debug!(error = %e, "bridge tx failed");
                        }
                        let _ = done.send(result);
                    }
                    Ok(Job::Raw { bytes, done }) => {
                        let _ = done.send(self.raw_tx(&bytes));
                    }
                    Err(_) => return,
                },
                recv(notify) -> msg => match msg {
                    Ok(()) => self.background_read(),
                    Err(_) => return,
                },
                recv(stop) -> _ => return,
            }
        }
    }

    /// Establish a known starting state: drain whatever the bridge has
    /// buffered until it reports a reset or has nothing to say.
    fn handshake(&mut self) -> Result<(), BridgeError> {
        let mut last_err = None;
        for attempt in 1..=self.config.handshake_tries {
            let mut f = Frame::default();
            match self.io_read_parse(&mut f) {
                Ok(()) if f.response_kind() == Some(Response::Reset) => {
                    debug!(attempt, "handshake read=RESET");
                    return Ok(());
                }
                Ok(()) => {
                    warn!(attempt, response = %f, "handshake unexpected response");
                    last_err = Some(BridgeError::UnexpectedResponse {
                        frame: hex::encode(f.bytes()),
                        kind: f.response_kind().map(u8::from),
                    });
                }
                Err(BridgeError::ResponseEmpty) => {
                    debug!(attempt, "handshake read=empty");
                    return Ok(());
                }
                Err(e) => {
                    debug!(attempt, error = %e, "handshake read failed");
                    last_err = Some(e);
                }
            }
        }
        Err(BridgeError::Critical(match last_err {
            Some(e) => format!("handshake: {e}"),
            None => "handshake: no attempts".to_string(),
        }))
    }

    fn background_read(&mut self) {
        let mut f = Frame::default();
        match self.io_read_parse(&mut f) {
            Ok(()) => match f.response_kind() {
                // Keys and resets are handled in parse.
                Some(Response::TwiListen | Response::Reset) => {}
                Some(Response::Ok)
                    if f.fields.mdb_result == Some(MdbResult::UartReadUnexpected) =>
                {
                    info!(response = %f, "bridge stray MDB data");
                }
                _ => warn!(response = %f, "bridge stray frame"),
            },
            Err(BridgeError::ResponseEmpty) => {}
            Err(e) => error!(error = %e, "bridge stray error"),
        }
    }

    fn io_tx(
        &mut self,
        command: Option<&Frame>,
        timeout: Duration,
        notify: &Receiver<()>,
    ) -> Result<Frame, BridgeError> {
        if let Some(cmd) = command {
            if let Err(e) = self.io_write(cmd) {
                debug!(command = %hex::encode(cmd.bytes()), error = %e, "bridge write failed");
                return Err(e);
            }
        }

        for attempt in 1..=self.config.read_retries {
            let notified = io_wait(notify, timeout);
            let mut response = Frame::default();
            match self.io_read_parse(&mut response) {
                Ok(()) => match response.response_kind() {
                    Some(Response::Reset) => {
                        return Err(BridgeError::Critical(
                            "bridge reset during transaction".into(),
                        ));
                    }
                    Some(Response::TwiListen) => {
                        trace!(attempt, "captured background frame, reading again");
                    }
                    _ => return Ok(response),
                },
                Err(BridgeError::ResponseEmpty) => {
                    if !notified {
                        if timeout.is_zero() {
                            return Err(BridgeError::ResponseEmpty);
                        }
                        return Err(BridgeError::Critical("response timeout".into()));
                    }
                    error!(attempt, "notified but read empty");
                }
                Err(e) => return Err(BridgeError::Critical(e.to_string())),
            }
            thread::sleep(self.config.busy_delay() * attempt);
        }
        Err(BridgeError::Critical("too many tries".into()))
    }

    /// Send a command frame, retrying while the bridge input buffer is busy.
    fn io_write(&mut self, f: &Frame) -> Result<(), BridgeError> {
        let bs = f.bytes();
        let mut buf = vec![0u8; bs.len() + WRITE_ACK_LEN + TOTAL_OVERHEAD];
        let ack_expect = [0x00, 0xff, f.crc(), f.crc()];
        let mut last_err = BridgeError::RequestBusy;

        for attempt in 1..=self.config.busy_retries {
            buf.fill(0);
            buf[..bs.len()].copy_from_slice(bs);
            self.spi.transfer(&mut buf)?;

            let padding = parse_padding(&buf, false)?;
            match padding.code {
                None => {}
                Some(Errcode::RequestOverwrite) => {
                    debug!(attempt, "bridge input buffer busy, retrying");
                    last_err = BridgeError::RequestBusy;
                    thread::sleep(self.config.busy_delay());
                    continue;
                }
                Some(code) => {
                    return Err(BridgeError::Remote {
                        code,
                        frame: hex::encode(&buf),
                    });
                }
            }
            if padding.start < WRITE_ACK_LEN {
                error!(attempt, buf = %hex::encode(&buf), "bridge write: invalid ack");
                last_err = BridgeError::InvalidAck {
                    expected: hex::encode(ack_expect),
                    received: hex::encode(&buf),
                };
                continue;
            }
            let ack = &buf[padding.start - WRITE_ACK_LEN..padding.start - 2];
            if ack != ack_expect {
                error!(
                    attempt,
                    expected = %hex::encode(ack_expect),
                    actual = %hex::encode(ack),
                    "bridge write: invalid ack"
                );
                last_err = BridgeError::InvalidAck {
                    expected: hex::encode(ack_expect),
                    received: hex::encode(ack),
                };
                continue;
            }
            if buf[0] & FLAG_REQUEST_BUSY != 0 {
                debug!(attempt, "bridge still busy with previous request, retrying");
                last_err = BridgeError::RequestBusy;
                thread::sleep(self.config.busy_delay());
                continue;
            }
            return Ok(());
        }
        Err(last_err)
    }

    /// Read the pending frame, if any, and acknowledge it.
    fn io_read_parse(&mut self, frame: &mut Frame) -> Result<(), BridgeError> {
        let mut len_buf = [PROTOCOL_VERSION, 0];
        self.spi.transfer(&mut len_buf)?;
        let (_, _, remote_len) = parse_header(&len_buf)?;
        if remote_len == 0 {
            return Err(BridgeError::ResponseEmpty);
        }

        let mut buf = vec![0u8; remote_len as usize + TOTAL_OVERHEAD];
        buf[0] = PROTOCOL_VERSION;
        self.spi.transfer(&mut buf)?;
        self.parse(&buf, frame)?;
        self.io_ack(frame)
    }

    fn io_ack(&mut self, f: &Frame) -> Result<(), BridgeError> {
        let mut buf = [0u8; 2 + TOTAL_OVERHEAD];
        buf[0] = FLAG_REQUEST_BUSY | PROTOCOL_VERSION;
        buf[1] = 2;
        buf[2] = f.plen();
        buf[3] = f.crc();
        self.spi.transfer(&mut buf)?;
        parse_padding(&buf, true)?;
        Ok(())
    }

    fn parse(&mut self, buf: &[u8], f: &mut Frame) -> Result<(), BridgeError> {
        if let Err(e) = f.parse(buf) {
            self.stats.error.fetch_add(1, Ordering::Relaxed);
            error!(buf = %hex::encode(buf), error = %e, "bridge frame parse");
            return Err(e);
        }
        if f.plen() == 0 {
            return Err(BridgeError::ResponseEmpty);
        }
        if let Err(e) = f.parse_fields() {
            self.stats.error.fetch_add(1, Ordering::Relaxed);
            error!(frame = %hex::encode(f.bytes()), error = %e, "bridge fields parse");
            return Err(e);
        }

        for pair in f.fields.twi_data.chunks_exact(2) {
            let item = BigEndian::read_u16(pair);
            if let Err(TrySendError::Full(_)) = self.keys.try_send(item) {
                debug!(item = item, "key mailbox full, dropping");
            }
        }

        match f.response_kind() {
            Some(Response::TwiListen) => {
                self.stats.twi_listen.fetch_add(1, Ordering::Relaxed);
            }
            Some(Response::Reset) => {
                self.stats.reset.fetch_add(1, Ordering::Relaxed);
                let watchdog = f.fields.is_watchdog_reset();
                if watchdog {
                    self.stats.error.fetch_add(1, Ordering::Relaxed);
                    error!(info = %f.fields, "bridge restarted by watchdog");
                } else {
                    debug!(info = %f.fields, "bridge normal reset");
                }
                self.observer.on_event(&MdbEvent::BridgeReset {
                    watchdog,
                    info: f.fields.to_string(),
                });
            }
            _ => {}
        }
        Ok(())
    }

    fn raw_tx(&mut self, bytes: &[u8]) -> Result<Vec<u8>, BridgeError> {
        if bytes.len() > BUFFER_SIZE {
            return Err(BridgeError::LengthOverflow {
                len: bytes.len(),
                max: BUFFER_SIZE,
            });
        }
        let mut buf = vec![0u8; BUFFER_SIZE + TOTAL_OVERHEAD];
        buf[..bytes.len()].copy_from_slice(bytes);
        self.spi.transfer(&mut buf)?;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::mock::FakeBridge;
    use crate::bridge::protocol::reset_flag;
    use crate::events::NoopObserver;
    use crate::events::testing::RecordingObserver;

    fn test_config() -> BridgeConfig {
        BridgeConfig {
            notify_poll_ms: 10,
            ..BridgeConfig::default()
        }
    }

    fn open(fake: &FakeBridge) -> Client {
        Client::open(
            fake.spi(),
            fake.notify(),
            test_config(),
            Arc::new(NoopObserver),
        )
        .unwrap()
    }

    #[test]
    fn test_status_round_trip() {
        let fake = FakeBridge::acking();
        let client = open(&fake);
        let r = client.status().unwrap();
        assert_eq!(r.response_kind(), Some(Response::Ok));
        assert_eq!(fake.commands(), vec![(Command::Status, vec![])]);
        assert_eq!(fake.acks(), 1);
        assert_eq!(client.stats().request, 1);
        assert_eq!(client.stats().error, 0);
    }

    #[test]
    fn test_mdb_tx_simple() {
        let fake = FakeBridge::new();
        fake.respond_with(|cmd, args| {
            assert_eq!(cmd, Command::MdbTransactionSimple);
            assert_eq!(args, &[0x30, 0x30]);
            vec![FakeBridge::mdb_ok(&[0x01, 0x02])]
        });
        let client = open(&fake);
        let r = client.mdb_tx_simple(&[0x30, 0x30]).unwrap();
        assert_eq!(r.fields.mdb_result, Some(MdbResult::Success));
        assert_eq!(r.fields.mdb_data, vec![0x01, 0x02]);
    }

    #[test]
    fn test_mdb_bus_reset_argument() {
        let fake = FakeBridge::acking();
        let client = open(&fake);
        client.mdb_bus_reset(Duration::from_millis(200)).unwrap();
        assert_eq!(fake.commands(), vec![(Command::MdbBusReset, vec![0x00, 0xc8])]);
    }

    #[test]
    fn test_key_captured_during_transaction() {
        let fake = FakeBridge::new();
        fake.respond_with(|_, _| vec![FakeBridge::twi(&[0x00, b'5']), FakeBridge::mdb_ok(&[])]);
        let client = open(&fake);
        let r = client.mdb_tx_simple(&[0x08]).unwrap();
        assert_eq!(r.response_kind(), Some(Response::Ok));
        assert_eq!(client.key_events().try_recv(), Ok(0x0035));
        assert_eq!(client.stats().twi_listen, 1);
    }

    #[test]
    fn test_key_captured_in_background() {
        let fake = FakeBridge::new();
        let client = open(&fake);
        fake.push_frame(FakeBridge::twi(&[0x00, b'7']));
        let key = client
            .key_events()
            .recv_timeout(Duration::from_secs(2))
            .unwrap();
        assert_eq!(key, u16::from(b'7'));
    }

    #[test]
    fn test_key_mailbox_drops_when_full() {
        let fake = FakeBridge::new();
        fake.respond_with(|_, _| {
            vec![
                FakeBridge::twi(&[0x00, b'1', 0x00, b'2']),
                FakeBridge::mdb_ok(&[]),
            ]
        });
        let client = open(&fake);
        client.mdb_tx_simple(&[0x08]).unwrap();
        let keys = client.key_events();
        assert_eq!(keys.try_recv(), Ok(u16::from(b'1')));
        assert!(keys.try_recv().is_err());
    }

    #[test]
    fn test_reset_during_transaction_is_critical() {
        let fake = FakeBridge::new();
        fake.respond_with(|_, _| vec![FakeBridge::reset(reset_flag::WATCHDOG)]);
        let observer = Arc::new(RecordingObserver::default());
        let client = Client::open(fake.spi(), fake.notify(), test_config(), observer.clone())
            .unwrap();
        let err = client.status().unwrap_err();
        assert!(err.is_critical(), "{err}");
        let stats = client.stats();
        assert_eq!(stats.reset, 1);
        assert_eq!(stats.error, 2);
        assert!(observer.events.lock().iter().any(|e| matches!(
            e,
            MdbEvent::BridgeReset { watchdog: true, .. }
        )));
    }

    #[test]
    fn test_response_timeout_is_critical() {
        let fake = FakeBridge::new();
        let client = open(&fake);
        let err = client
            .do_timeout(Command::Status, &[], Duration::from_millis(30))
            .unwrap_err();
        assert!(matches!(&err, BridgeError::Critical(m) if m == "response timeout"), "{err}");
    }

    #[test]
    fn test_zero_timeout_nothing_pending() {
        let fake = FakeBridge::new();
        let client = open(&fake);
        assert!(matches!(
            client.tx(None, Duration::ZERO),
            Err(BridgeError::ResponseEmpty)
        ));
    }

    #[test]
    fn test_busy_write_retried() {
        let fake = FakeBridge::acking();
        let client = open(&fake);
        fake.set_busy_writes(2);
        client.status().unwrap();
        assert_eq!(fake.commands().len(), 1);

        fake.set_busy_writes(3);
        assert!(matches!(client.status(), Err(BridgeError::RequestBusy)));
        assert_eq!(fake.commands().len(), 1);
    }

    #[test]
    fn test_handshake_consumes_reset() {
        let fake = FakeBridge::new();
        fake.push_frame(FakeBridge::reset(reset_flag::POWER_ON));
        let observer = Arc::new(RecordingObserver::default());
        let client = Client::open(fake.spi(), fake.notify(), test_config(), observer.clone())
            .unwrap();
        assert_eq!(client.stats().reset, 1);
        assert_eq!(fake.pending(), 0);
        assert!(observer.events.lock().iter().any(|e| matches!(
            e,
            MdbEvent::BridgeReset { watchdog: false, .. }
        )));
    }

    #[test]
    fn test_handshake_fails_on_garbage() {
        let fake = FakeBridge::new();
        for _ in 0..test_config().handshake_tries {
            fake.push_frame(FakeBridge::mdb_ok(&[]));
        }
        let err = Client::open(fake.spi(), fake.notify(), test_config(), Arc::new(NoopObserver))
            .unwrap_err();
        assert!(err.is_critical(), "{err}");
    }

    #[test]
    fn test_close_keeps_link_for_other_handles() {
        let fake = FakeBridge::acking();
        let client = open(&fake);
        let other = client.clone();
        assert_eq!(client.ref_count(), 2);
        client.close();
        assert_eq!(other.ref_count(), 1);
        other.status().unwrap();
        assert_eq!(fake.commands().len(), 1);
    }

    #[test]
    fn test_last_close_stops_workers() {
        let fake = FakeBridge::acking();
        let client = open(&fake);
        let keys = client.key_events();
        client.close();
        // Link side of the key mailbox is gone with the io worker.
        assert!(matches!(
            keys.recv_timeout(Duration::from_secs(2)),
            Err(channel::RecvTimeoutError::Disconnected)
        ));
    }

    #[test]
    fn test_raw_tx() {
        let fake = FakeBridge::new();
        let client = open(&fake);
        let r = client.raw_tx(&[PROTOCOL_VERSION, 0]).unwrap();
        assert_eq!(r.len(), BUFFER_SIZE + TOTAL_OVERHEAD);
        assert_eq!(&r[..2], &[PROTOCOL_VERSION, 0]);
        assert!(client.raw_tx(&[0u8; BUFFER_SIZE + 1]).is_err());
    }
}

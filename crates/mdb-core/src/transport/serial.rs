//! Direct serial MDB line on a Linux tty.
//!
//! MDB frames are 9 bits. The tty runs 8 data bits with sticky parity
//! (`CMSPAR`), so the parity bit carries the mode bit: mark for the address
//! byte, space for everything else. On input, `PARMRK` marks each byte that
//! arrives with the mode bit set as `FF 00 <byte>` and escapes a literal `FF`
//! as `FF FF`, which is the packet wire encoding, so responses are decoded
//! with [`Packet::read_wire`].

use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::thread;
use std::time::{Duration, Instant};

use nix::fcntl::OFlag;
use nix::sys::termios::{
    self, BaudRate, ControlFlags, FlushArg, InputFlags, LocalFlags, OutputFlags, SetArg,
    SpecialCharacterIndices, Termios,
};
use parking_lot::Mutex;
use tracing::{debug, info, instrument};

use super::traits::{TransportError, UartTransport};
use crate::packet::{Packet, PacketError, checksum};

/// Longest silence tolerated between response bytes.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_millis(20);

nix::ioctl_none_bad!(tiocsbrk, nix::libc::TIOCSBRK);
nix::ioctl_none_bad!(tioccbrk, nix::libc::TIOCCBRK);

/// Non-blocking source that waits up to `timeout` for each read to yield
/// data. Records whether it gave up so callers can tell silence from a
/// malformed stream.
struct GapReader<R> {
    inner: R,
    timeout: Duration,
    step: Duration,
    timed_out: bool,
}

impl<R: Read> GapReader<R> {
    fn new(inner: R, timeout: Duration) -> Self {
        Self {
            inner,
            timeout,
            step: (timeout / 16).max(Duration::from_micros(100)),
            timed_out: false,
        }
    }
}

impl<R: Read> Read for GapReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let deadline = Instant::now() + self.timeout;
        loop {
            match self.inner.read(buf) {
                Ok(0) => {}
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
            if Instant::now() >= deadline {
                self.timed_out = true;
                return Err(io::ErrorKind::TimedOut.into());
            }
            thread::sleep(self.step);
        }
    }
}

/// Read one marked response block and classify it.
fn read_response<R: Read>(src: R, timeout: Duration) -> Result<Packet, TransportError> {
    let mut reader = BufReader::new(GapReader::new(src, timeout));
    let (packet, received) = match Packet::read_wire(&mut reader) {
        Ok(v) => v,
        Err(_) if reader.get_ref().timed_out => return Err(TransportError::Timeout),
        Err(e) => return Err(e.into()),
    };
    if packet.is_empty() && received == Packet::NAK.as_bytes()[0] {
        return Err(TransportError::Nak);
    }
    packet.validate_checksum(received)?;
    Ok(packet)
}

struct Port {
    file: File,
    termios: Termios,
    path: String,
}

impl Port {
    fn open(path: &str) -> Result<Port, TransportError> {
        let open_failed = |e: &dyn std::fmt::Display| TransportError::OpenFailed {
            path: path.to_string(),
            message: e.to_string(),
        };
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags((OFlag::O_NOCTTY | OFlag::O_NONBLOCK).bits())
            .open(path)
            .map_err(|e| open_failed(&e))?;

        let mut t = termios::tcgetattr(&file).map_err(|e| open_failed(&e))?;
        t.input_flags = InputFlags::IGNBRK | InputFlags::INPCK | InputFlags::PARMRK;
        t.output_flags = OutputFlags::empty();
        t.local_flags = LocalFlags::empty();
        t.control_flags = ControlFlags::CMSPAR
            | ControlFlags::CLOCAL
            | ControlFlags::CREAD
            | ControlFlags::CS8
            | ControlFlags::PARENB;
        t.control_chars[SpecialCharacterIndices::VMIN as usize] = 0;
        t.control_chars[SpecialCharacterIndices::VTIME as usize] = 0;
        termios::cfsetspeed(&mut t, BaudRate::B9600).map_err(|e| open_failed(&e))?;
        termios::tcsetattr(&file, SetArg::TCSAFLUSH, &t).map_err(|e| open_failed(&e))?;

        Ok(Port {
            file,
            termios: t,
            path: path.to_string(),
        })
    }

    /// Select mark (mode bit set) or space parity for subsequent output.
    fn set_mark(&mut self, mark: bool) -> io::Result<()> {
        let current = self.termios.control_flags.contains(ControlFlags::PARODD);
        if current == mark {
            return Ok(());
        }
        self.termios.control_flags.set(ControlFlags::PARODD, mark);
        termios::tcsetattr(&self.file, SetArg::TCSADRAIN, &self.termios)?;
        Ok(())
    }

    /// Write `p`, the first byte with the given mode bit and the rest clear.
    fn write9(&mut self, p: &[u8], first_mark: bool) -> io::Result<()> {
        let Some((first, rest)) = p.split_first() else {
            return Ok(());
        };
        self.set_mark(first_mark)?;
        (&self.file).write_all(std::slice::from_ref(first))?;
        if !rest.is_empty() {
            self.set_mark(false)?;
            (&self.file).write_all(rest)?;
        }
        Ok(())
    }

    fn reset_read(&mut self) -> io::Result<()> {
        termios::tcflush(&self.file, FlushArg::TCIFLUSH)?;
        self.set_mark(false)
    }
}

pub struct SerialUart {
    port: Mutex<Option<Port>>,
    timeout: Duration,
}

impl Default for SerialUart {
    fn default() -> Self {
        Self::new()
    }
}

impl SerialUart {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_RESPONSE_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            port: Mutex::new(None),
            timeout,
        }
    }
}

impl UartTransport for SerialUart {
    #[instrument(skip(self), level = "info")]
    fn open(&self, path: &str) -> Result<(), TransportError> {
        let port = Port::open(path)?;
        info!(path = %path, "serial line open");
        // Replacing closes the previous descriptor.
        *self.port.lock() = Some(port);
        Ok(())
    }

    fn close(&self) -> Result<(), TransportError> {
        if let Some(port) = self.port.lock().take() {
            debug!(path = %port.path, "serial line closed");
        }
        Ok(())
    }

    fn brk(&self, keep: Duration, settle: Duration) -> Result<(), TransportError> {
        let mut guard = self.port.lock();
        let port = guard.as_mut().ok_or(TransportError::NotOpen)?;
        port.reset_read()?;
        let fd = port.file.as_raw_fd();
        // SAFETY: fd is an open tty owned by `port` for the duration of the calls.
        unsafe { tiocsbrk(fd) }.map_err(io::Error::from)?;
        thread::sleep(keep);
        // SAFETY: same fd, still owned by `port`; TIOCCBRK takes no argument.
        unsafe { tioccbrk(fd) }.map_err(io::Error::from)?;
        thread::sleep(settle);
        Ok(())
    }

    fn tx(&self, request: &[u8], response: &mut [u8]) -> Result<usize, TransportError> {
        if request.is_empty() {
            return Ok(0);
        }
        let mut guard = self.port.lock();
        let port = guard.as_mut().ok_or(TransportError::NotOpen)?;

        port.reset_read()?;
        port.write9(request, true)?;
        port.write9(&[checksum(request)], false)?;

        let packet = read_response(&port.file, self.timeout)?;
        let n = packet.len();
        if n > response.len() {
            return Err(PacketError::Overflow { len: n }.into());
        }
        response[..n].copy_from_slice(packet.as_bytes());
        if n > 0 {
            port.write9(Packet::ACK.as_bytes(), false)?;
        }
        Ok(n)
    }

    fn name(&self) -> &'static str {
        "file"
    }
}

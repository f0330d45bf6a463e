//! Hardware seams of the bridge link: SPI exchange and notify line.

use std::io;
use std::time::Duration;

/// Full-duplex SPI exchange. `buf` is sent and overwritten with the bytes
/// clocked in.
pub trait SpiLink: Send {
    fn transfer(&mut self, buf: &mut [u8]) -> io::Result<()>;
}

/// Bridge to host "data pending" signal.
pub trait NotifyLine: Send {
    fn is_high(&mut self) -> io::Result<bool>;

    /// Wait up to `timeout` for a rising edge. `Ok(false)` on timeout.
    fn wait_rising(&mut self, timeout: Duration) -> io::Result<bool>;
}

#[cfg(target_os = "linux")]
pub use linux::{CdevNotify, SpidevLink};

#[cfg(target_os = "linux")]
mod linux {
    use std::io;
    use std::os::fd::AsFd;
    use std::time::{Duration, Instant};

    use gpio_cdev::{Chip, EventRequestFlags, EventType, LineEventHandle, LineRequestFlags};
    use nix::errno::Errno;
    use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
    use spidev::{SpiModeFlags, Spidev, SpidevOptions, SpidevTransfer};
    use tracing::info;

    use super::{NotifyLine, SpiLink};

    pub struct SpidevLink {
        spi: Spidev,
    }

    impl SpidevLink {
        pub fn open(path: &str, speed_hz: u32) -> io::Result<Self> {
            let mut spi = Spidev::open(path)?;
            let options = SpidevOptions::new()
                .bits_per_word(8)
                .max_speed_hz(speed_hz)
                .mode(SpiModeFlags::SPI_MODE_0)
                .build();
            spi.configure(&options)?;
            info!(path = %path, speed_hz = speed_hz, "spi open");
            Ok(Self { spi })
        }
    }

    impl SpiLink for SpidevLink {
        fn transfer(&mut self, buf: &mut [u8]) -> io::Result<()> {
            let tx = buf.to_vec();
            let mut transfer = SpidevTransfer::read_write(&tx, buf);
            self.spi.transfer(&mut transfer)
        }
    }

    /// Notify input watched through GPIO character device edge events.
    ///
    /// The kernel queues rising edges, so a pulse shorter than the wait loop
    /// is still seen.
    pub struct CdevNotify {
        events: LineEventHandle,
    }

    impl CdevNotify {
        pub fn open(chip: &str, line: u32) -> io::Result<Self> {
            let mut chip = Chip::new(chip).map_err(io::Error::other)?;
            let events = chip
                .get_line(line)
                .and_then(|l| {
                    l.events(
                        LineRequestFlags::INPUT,
                        EventRequestFlags::RISING_EDGE,
                        "mdb-bridge-notify",
                    )
                })
                .map_err(io::Error::other)?;
            info!(line = line, "notify line open");
            Ok(Self { events })
        }
    }

    impl NotifyLine for CdevNotify {
        fn is_high(&mut self) -> io::Result<bool> {
            Ok(self.events.get_value().map_err(io::Error::other)? != 0)
        }

        fn wait_rising(&mut self, timeout: Duration) -> io::Result<bool> {
            let deadline = Instant::now() + timeout;
            loop {
                let left = deadline.saturating_duration_since(Instant::now());
                let ms = u16::try_from(left.as_millis()).unwrap_or(u16::MAX);
                let ready = {
                    let mut fds = [PollFd::new(self.events.as_fd(), PollFlags::POLLIN)];
                    poll(&mut fds, PollTimeout::from(ms))
                };
                match ready {
                    Ok(0) => return Ok(false),
                    Ok(_) => {}
                    Err(Errno::EINTR) => continue,
                    Err(e) => return Err(e.into()),
                }
                let event = self.events.get_event().map_err(io::Error::other)?;
                if event.event_type() == EventType::RisingEdge {
                    return Ok(true);
                }
                if left.is_zero() {
                    return Ok(false);
                }
            }
        }
    }
}

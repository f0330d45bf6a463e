//! Polling helpers: bounded poll loops, keepalive and adaptive poll delay.

use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, RecvTimeoutError};
use tracing::{debug, info};

use super::{Device, DeviceGuard};
use crate::config::Delays;
use crate::error::MdbError;
use crate::packet::Packet;

impl Device {
    /// Run `fun` under the command lock until it reports done, fails, or
    /// `timeout` expires. Sleeps the next-poll delay between attempts.
    ///
    /// A zero timeout allows exactly one attempt.
    pub fn fun_loop<F>(&self, tag: &str, timeout: Duration, mut fun: F) -> Result<(), MdbError>
    where
        F: FnMut(&mut DeviceGuard<'_>) -> Result<bool, MdbError>,
    {
        let tag = format!("{tag}/poll-loop");
        let begin = Instant::now();
        let mut guard = self.lock();
        loop {
            match fun(&mut guard) {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                Err(e) => return Err(e.context(&self.name, tag)),
            }
            if timeout.is_zero() {
                return Err(MdbError::NotApplicable(format!("tag={tag} timeout=0 invalid")));
            }
            thread::sleep(self.delays.next);
            if begin.elapsed() > timeout {
                let err = MdbError::PollTimeout { tag };
                self.set_error(&err);
                return Err(err);
            }
        }
    }

    /// Send `request` with the known-command policy until `fun` accepts a
    /// response.
    pub fn poll_loop<F>(
        &self,
        tag: &str,
        request: &Packet,
        timeout: Duration,
        mut fun: F,
    ) -> Result<(), MdbError>
    where
        F: FnMut(&Packet) -> Result<bool, MdbError>,
    {
        self.fun_loop(tag, timeout, |guard| {
            let mut response = Packet::new();
            guard.tx_known(request, &mut response)?;
            fun(&response)
        })
    }

    /// Send POLL whenever `interval` passes without a successful exchange.
    /// Returns when `stop` receives a value or is disconnected.
    /// Timeouts are expected while the device is away and are not logged.
    pub fn keepalive(&self, interval: Duration, stop: &Receiver<()>) {
        let mut wait = interval;
        loop {
            match stop.recv_timeout(wait.max(Duration::from_millis(1))) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
            }

            let mut guard = self.lock();
            let since_ok = self.last_ok.since().unwrap_or(Duration::MAX);
            wait = interval.saturating_sub(since_ok);
            if wait.is_zero() {
                let mut response = Packet::new();
                let request = self.packet_poll;
                if let Err(e) = guard.tx_known(&request, &mut response) {
                    if !e.is_timeout() {
                        info!(device = %self.name, error = %e, "keepalive ignoring error");
                    }
                }
                wait = interval;
            }
        }
    }
}

/// Chooses the delay before the next poll: short while the device is
/// active or erroring, idle once it has been quiet for the threshold.
#[derive(Debug, Default)]
pub struct PollDelay {
    last_active: Option<Instant>,
    last_delay: Duration,
}

impl PollDelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_delay(&mut self, delays: &Delays, active: bool, err: bool) -> Duration {
        self.next_delay_at(Instant::now(), delays, active, err)
    }

    pub fn next_delay_at(
        &mut self,
        now: Instant,
        delays: &Delays,
        active: bool,
        err: bool,
    ) -> Duration {
        let delay = if active {
            self.last_active = Some(now);
            delays.next
        } else if err {
            delays.next
        } else if self.last_delay == delays.idle {
            // Still quiet, no need to consult the clock again.
            delays.idle
        } else {
            match self.last_active {
                Some(t) if now.saturating_duration_since(t) <= delays.idle_threshold => delays.next,
                _ => delays.idle,
            }
        };
        self.last_delay = delay;
        delay
    }

    /// Sleep for the next delay. Returns false if `stop` fired first.
    pub fn wait(&mut self, dev: &Device, active: bool, err: bool, stop: &Receiver<()>) -> bool {
        let delay = self.next_delay(dev.delays(), active, err);
        match stop.recv_timeout(delay) {
            Err(RecvTimeoutError::Timeout) => true,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                debug!(device = %dev.name(), "poll stopped");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Bus;
    use crate::device::{ByteOrder, DeviceState};
    use crate::transport::MockUart;
    use crossbeam::channel;
    use std::sync::Arc;

    fn delays() -> Delays {
        Delays {
            next: Duration::from_millis(200),
            idle: Duration::from_millis(700),
            idle_threshold: Duration::from_secs(30),
            ..Delays::uniform(Duration::from_millis(1))
        }
    }

    fn device(mock: &MockUart) -> Device {
        let bus = Arc::new(Bus::new(Box::new(mock.clone())));
        let dev = Device::new(bus, 0x08, "coin", ByteOrder::Little)
            .with_delays(Delays::uniform(Duration::from_millis(1)));
        dev.init();
        dev
    }

    #[test]
    fn test_poll_delay_active_is_short() {
        let d = delays();
        let mut pd = PollDelay::new();
        let t0 = Instant::now();
        assert_eq!(pd.next_delay_at(t0, &d, true, false), d.next);
        assert_eq!(
            pd.next_delay_at(t0 + Duration::from_secs(10), &d, false, false),
            d.next
        );
        assert_eq!(
            pd.next_delay_at(t0 + Duration::from_secs(31), &d, false, false),
            d.idle
        );
        // Stays idle without activity
        assert_eq!(
            pd.next_delay_at(t0 + Duration::from_secs(32), &d, false, false),
            d.idle
        );
        // Activity brings it back
        assert_eq!(
            pd.next_delay_at(t0 + Duration::from_secs(33), &d, true, false),
            d.next
        );
    }

    #[test]
    fn test_poll_delay_error_is_short() {
        let d = delays();
        let mut pd = PollDelay::new();
        let t0 = Instant::now();
        assert_eq!(pd.next_delay_at(t0, &d, false, true), d.next);
        assert_eq!(pd.next_delay_at(t0, &d, false, false), d.idle);
        assert_eq!(pd.next_delay_at(t0, &d, false, true), d.next);
    }

    #[test]
    fn test_poll_delay_never_active_is_idle() {
        let d = delays();
        let mut pd = PollDelay::new();
        assert_eq!(pd.next_delay_at(Instant::now(), &d, false, false), d.idle);
    }

    #[test]
    fn test_fun_loop_done() {
        let mock = MockUart::new();
        let dev = device(&mock);
        let mut calls = 0;
        dev.fun_loop("count", Duration::from_secs(1), |_| {
            calls += 1;
            Ok(calls == 3)
        })
        .unwrap();
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_fun_loop_zero_timeout() {
        let mock = MockUart::new();
        let dev = device(&mock);
        let err = dev.fun_loop("once", Duration::ZERO, |_| Ok(false)).unwrap_err();
        assert!(matches!(err, MdbError::NotApplicable(_)));
        dev.fun_loop("once", Duration::ZERO, |_| Ok(true)).unwrap();
    }

    #[test]
    fn test_fun_loop_timeout_sets_error() {
        let mock = MockUart::new();
        let dev = device(&mock);
        let err = dev
            .fun_loop("slow", Duration::from_millis(5), |_| Ok(false))
            .unwrap_err();
        assert!(matches!(&err, MdbError::PollTimeout { tag } if tag == "slow/poll-loop"));
        assert_eq!(dev.state(), DeviceState::Error);
    }

    #[test]
    fn test_fun_loop_error_propagates() {
        let mock = MockUart::new();
        let dev = device(&mock);
        let err = dev
            .fun_loop("fail", Duration::from_secs(1), |_| {
                Err(MdbError::NotApplicable("nope".into()))
            })
            .unwrap_err();
        assert!(err.to_string().contains("fail/poll-loop"));
    }

    #[test]
    fn test_poll_loop_until_response() {
        let mock = MockUart::new();
        mock.expect("08", "");
        mock.expect("0b", "");
        mock.expect("0b", "");
        mock.expect("0b", "0a");
        let dev = device(&mock);
        let mut seen = Vec::new();
        let poll = *dev.packet_poll();
        dev.poll_loop("wait-data", &poll, Duration::from_secs(1), |r| {
            seen.push(r.len());
            Ok(!r.is_empty())
        })
        .unwrap();
        assert_eq!(seen, vec![0, 0, 1]);
        assert_eq!(mock.remaining(), 0);
    }

    #[test]
    fn test_keepalive_polls_and_stops() {
        let mock = MockUart::new();
        mock.answer("08", "");
        mock.answer("0b", "");
        let dev = Arc::new(device(&mock));
        let (stop_tx, stop_rx) = channel::bounded::<()>(1);
        let worker = {
            let dev = dev.clone();
            thread::spawn(move || dev.keepalive(Duration::from_millis(5), &stop_rx))
        };
        thread::sleep(Duration::from_millis(60));
        drop(stop_tx);
        worker.join().unwrap();

        let polls = mock
            .requests()
            .iter()
            .filter(|r| r.as_slice() == [0x0b])
            .count();
        assert!(polls >= 2, "polls={polls}");
        assert_eq!(dev.state(), DeviceState::Online);
    }
}

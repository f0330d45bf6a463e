//! Lock-free monotonic timestamps.

use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

fn epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

/// Monotonic instant stored as nanoseconds since a process-wide epoch.
/// Zero means "never set".
#[derive(Debug, Default)]
pub struct AtomicClock(AtomicU64);

impl AtomicClock {
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    fn now_nanos() -> u64 {
        (epoch().elapsed().as_nanos() as u64).max(1)
    }

    pub fn set_now(&self) {
        self.0.store(Self::now_nanos(), Ordering::SeqCst);
    }

    /// Set only when unset. Returns true if this call set it.
    pub fn set_now_if_zero(&self) -> bool {
        self.0
            .compare_exchange(0, Self::now_nanos(), Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn clear(&self) {
        self.0.store(0, Ordering::SeqCst);
    }

    pub fn is_zero(&self) -> bool {
        self.raw() == 0
    }

    pub fn raw(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    pub fn get(&self) -> Option<Instant> {
        match self.raw() {
            0 => None,
            n => Some(epoch() + Duration::from_nanos(n)),
        }
    }

    /// Time elapsed since the stored instant.
    pub fn since(&self) -> Option<Duration> {
        self.get().map(|t| t.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_if_zero_once() {
        let c = AtomicClock::new();
        assert!(c.is_zero());
        assert!(c.since().is_none());
        assert!(c.set_now_if_zero());
        let first = c.raw();
        std::thread::sleep(Duration::from_millis(1));
        assert!(!c.set_now_if_zero());
        assert_eq!(c.raw(), first);

        c.set_now();
        assert!(c.raw() > first);
        c.clear();
        assert!(c.is_zero());
    }
}

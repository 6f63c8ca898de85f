use std::thread;
use std::time::{Duration, Instant};

use once_cell::sync::OnceCell;

use crate::Timestamp;

static SESSION_CLOCK: OnceCell<Clock> = OnceCell::new();

/// Monotonic millisecond time source.
///
/// Every timestamp attached to an outbound message must come from the same
/// clock that was handed to the handle it is written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Clock {
    epoch: Instant,
}

impl Clock {
    /// Start a new clock at zero.
    pub fn start() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    /// Milliseconds elapsed since the clock was started.
    pub fn now(&self) -> Timestamp {
        self.epoch.elapsed().as_millis() as Timestamp
    }

    /// Suspend the calling thread for at least `ms` milliseconds.
    pub fn sleep(&self, ms: u32) {
        thread::sleep(Duration::from_millis(u64::from(ms)));
    }

    /// Suspend the calling thread until the clock reads at least `ts`.
    pub fn sleep_until(&self, ts: Timestamp) {
        while let Some(remaining) = self.until(ts) {
            thread::sleep(remaining);
        }
    }

    /// Time left before `ts` is reached, or `None` if it already passed.
    pub fn until(&self, ts: Timestamp) -> Option<Duration> {
        let now = self.now();
        if now >= ts {
            None
        } else {
            Some(Duration::from_millis(u64::from(ts - now)))
        }
    }
}

/// Start the process-wide session clock.
///
/// Only the first call creates the clock; later calls return the running one.
pub fn start() -> Clock {
    *SESSION_CLOCK.get_or_init(|| {
        tracing::debug!("session clock started");
        Clock::start()
    })
}

/// The process-wide session clock, if [`start`] has been called.
pub fn global() -> Option<Clock> {
    SESSION_CLOCK.get().copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_clock_starts_once() {
        let first = start();
        let second = start();
        assert_eq!(first, second);
        assert_eq!(global(), Some(first));
    }

    #[test]
    fn sleep_until_never_returns_early() {
        let clock = Clock::start();
        let target = clock.now() + 30;
        clock.sleep_until(target);
        assert!(clock.now() >= target);
        assert!(clock.until(target).is_none());
    }

    #[test]
    fn now_is_monotonic() {
        let clock = Clock::start();
        let a = clock.now();
        clock.sleep(5);
        let b = clock.now();
        assert!(b >= a + 5);
    }
}

//! Time source for retry delays.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use syncevo_runtime::SuspendController;

const SLEEP_SLICE: Duration = Duration::from_millis(100);

/// Clock used by [`DavSession`](crate::DavSession) to wait between attempts.
pub trait RetryClock {
    /// Current time.
    fn now(&self) -> Instant;

    /// Waits for `duration`. Returns false if the suspend state left
    /// `Normal` before the time was up.
    fn sleep(&self, duration: Duration, suspend: &SuspendController) -> bool;
}

/// Wall clock, sleeping in short slices so that CTRL-C is noticed.
///
/// The sleep blocks the calling thread, and with it the event loop of
/// that thread: retries happen inside a synchronous request, nothing else
/// is meant to make progress until the next attempt.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl RetryClock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration, suspend: &SuspendController) -> bool {
        let end = Instant::now() + duration;
        loop {
            if !suspend.is_normal() {
                return false;
            }
            let now = Instant::now();
            if now >= end {
                return true;
            }
            std::thread::sleep((end - now).min(SLEEP_SLICE));
        }
    }
}

/// Clock that only advances when asked to sleep.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Instant>,
    slept: Mutex<Vec<Duration>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    /// Starts at the current time.
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Instant::now()),
            slept: Mutex::new(Vec::new()),
        }
    }

    /// Moves the clock forward.
    pub fn advance(&self, duration: Duration) {
        *self.now.lock() += duration;
    }

    /// Every sleep requested so far.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.slept.lock().clone()
    }
}

impl RetryClock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock()
    }

    fn sleep(&self, duration: Duration, suspend: &SuspendController) -> bool {
        self.slept.lock().push(duration);
        if !suspend.is_normal() {
            return false;
        }
        self.advance(duration);
        true
    }
}

impl<C: RetryClock + ?Sized> RetryClock for &C {
    fn now(&self) -> Instant {
        (**self).now()
    }

    fn sleep(&self, duration: Duration, suspend: &SuspendController) -> bool {
        (**self).sleep(duration, suspend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances_on_sleep() {
        let clock = ManualClock::new();
        let start = clock.now();
        assert!(clock.sleep(Duration::from_secs(3), &SuspendController::new()));
        assert_eq!(clock.now() - start, Duration::from_secs(3));
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(3)]);
    }

    #[test]
    fn system_clock_sleep_is_interrupted() {
        let suspend = SuspendController::new();
        let _blocker = suspend.suspend();
        assert!(!SystemClock.sleep(Duration::from_secs(30), &suspend));
    }
}

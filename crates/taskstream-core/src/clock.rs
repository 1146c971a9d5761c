//! Time source abstraction for poll loops.
//!
//! Every blocking operation in the runtime (stream synchronize, abort
//! status polling) derives its deadline from a [`Clock`] owned by the
//! [`Runtime`](crate::runtime::Runtime). Production code uses
//! [`SystemClock`]; tests use [`VirtualClock`] so timeout behavior can be
//! exercised without wall-clock sleeps.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Injectable time source.
pub trait Clock: Send + Sync {
    /// Current instant.
    fn now(&self) -> Instant;

    /// Suspend the calling thread for `dur`.
    fn sleep(&self, dur: Duration);
}

/// Wall-clock implementation backed by `std::time`.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, dur: Duration) {
        std::thread::sleep(dur);
    }
}

/// Deterministic clock for tests.
///
/// `sleep` advances virtual time instead of suspending the thread, so a
/// poll loop that would block for a minute completes instantly while still
/// observing the same sequence of deadline checks.
pub struct VirtualClock {
    epoch: Instant,
    elapsed: Mutex<Duration>,
}

impl VirtualClock {
    /// Create a clock starting at the current instant.
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            elapsed: Mutex::new(Duration::ZERO),
        }
    }

    /// Advance virtual time without a sleep call.
    pub fn advance(&self, dur: Duration) {
        *self.elapsed.lock() += dur;
    }

    /// Total virtual time elapsed since construction.
    pub fn elapsed(&self) -> Duration {
        *self.elapsed.lock()
    }
}

impl Default for VirtualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for VirtualClock {
    fn now(&self) -> Instant {
        self.epoch + *self.elapsed.lock()
    }

    fn sleep(&self, dur: Duration) {
        self.advance(dur);
    }
}

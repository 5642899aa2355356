use std::thread;
use std::time::Duration;

/// Sleep seam for the engine's bounded readiness polls.
///
/// The device handle never waits on a deadline; every wait is a fixed
/// number of poll iterations with a pause between them. Routing the pause
/// through this trait lets test builds run those loops flat out.
pub trait Clock {
    fn sleep(&self, d: Duration);
}

/// Real clock: pauses the calling thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct MonotonicClock;

impl MonotonicClock {
    #[inline]
    pub fn new() -> Self {
        Self
    }
}

impl Clock for MonotonicClock {
    fn sleep(&self, d: Duration) {
        if !d.is_zero() {
            thread::sleep(d);
        }
    }
}

/// Deterministic clock for tests. Public (not cfg(test)) because the
/// hardware and core test binaries are separate crates; the 30 s carriage
/// waits would otherwise dominate the suite.
pub mod test_clock {
    use super::Clock;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    /// Clock whose `sleep` returns immediately, tallying the virtual time
    /// a real run would have spent. Clones share the tally, so a test can
    /// keep one half and hand the other to the device.
    #[derive(Debug, Default, Clone)]
    pub struct TestClock {
        slept_micros: Arc<AtomicU64>,
    }

    impl TestClock {
        pub fn new() -> Self {
            Self::default()
        }

        /// Virtual time all `sleep` calls have added up to.
        pub fn slept(&self) -> Duration {
            Duration::from_micros(self.slept_micros.load(Ordering::Relaxed))
        }
    }

    impl Clock for TestClock {
        fn sleep(&self, d: Duration) {
            let us = u64::try_from(d.as_micros()).unwrap_or(u64::MAX);
            self.slept_micros.fetch_add(us, Ordering::Relaxed);
        }
    }
}

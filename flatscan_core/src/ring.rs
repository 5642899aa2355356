//! Line ring shared between the producer thread and the consuming caller.
//!
//! One allocation holds every line slot; the producer and consumer only
//! ever address slots through their cursors. The margin rule keeps the
//! producer from touching any slot inside the consumer's reconstruction
//! window: `produced - consumed` never exceeds `capacity - lookahead`.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use crate::error::ScanError;

#[derive(Default)]
struct RingState {
    produced: u64,
    consumed: u64,
    cancelled: bool,
    failed: Option<ScanError>,
    producer_done: bool,
}

pub(crate) struct LineRing {
    capacity: u64,
    lookahead: u64,
    line_bytes: usize,
    state: Mutex<RingState>,
    space: Condvar,
    data: Condvar,
    slots: Box<[Mutex<Box<[u8]>>]>,
}

impl LineRing {
    pub fn new(
        capacity: usize,
        lookahead: u32,
        line_bytes: usize,
    ) -> Result<Self, ScanError> {
        debug_assert!(capacity > lookahead as usize);
        let mut slots = Vec::new();
        slots
            .try_reserve_exact(capacity)
            .map_err(|_| ScanError::OutOfMemory("line ring slots"))?;
        for _ in 0..capacity {
            let mut line = Vec::new();
            line.try_reserve_exact(line_bytes)
                .map_err(|_| ScanError::OutOfMemory("line ring storage"))?;
            line.resize(line_bytes, 0);
            slots.push(Mutex::new(line.into_boxed_slice()));
        }
        Ok(Self {
            capacity: capacity as u64,
            lookahead: u64::from(lookahead),
            line_bytes,
            state: Mutex::new(RingState::default()),
            space: Condvar::new(),
            data: Condvar::new(),
            slots: slots.into_boxed_slice(),
        })
    }

    pub fn line_bytes(&self) -> usize {
        self.line_bytes
    }

    fn lock_state(&self) -> MutexGuard<'_, RingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fits(&self, st: &RingState, count: u64) -> bool {
        st.produced + count - st.consumed <= self.capacity - self.lookahead
    }

    /// Block until `count` more lines fit under the margin rule.
    /// Returns false when the stream was cancelled instead.
    pub fn wait_space(&self, count: u64) -> bool {
        let mut st = self.lock_state();
        loop {
            if st.cancelled {
                return false;
            }
            if self.fits(&st, count) {
                return true;
            }
            st = self.space.wait(st).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Copy one raw line into its slot. Only valid between a granted
    /// `wait_space` and the matching `publish`.
    pub fn store(&self, index: u64, line: &[u8]) {
        debug_assert_eq!(line.len(), self.line_bytes);
        let slot = &self.slots[(index % self.capacity) as usize];
        let mut buf = slot.lock().unwrap_or_else(PoisonError::into_inner);
        buf.copy_from_slice(line);
    }

    pub fn publish(&self, count: u64) {
        let mut st = self.lock_state();
        st.produced += count;
        debug_assert!(st.produced - st.consumed <= self.capacity - self.lookahead);
        drop(st);
        self.data.notify_all();
    }

    /// Block until `window` lines starting at `index` are visible.
    /// Cancellation and parked producer errors surface here; the first
    /// call after a failure gets the original error, later ones get
    /// `Cancelled`.
    pub fn await_window(&self, index: u64, window: u64) -> Result<(), ScanError> {
        let mut st = self.lock_state();
        loop {
            if st.cancelled {
                return Err(ScanError::Cancelled);
            }
            if let Some(err) = st.failed.take() {
                st.cancelled = true;
                drop(st);
                self.space.notify_all();
                return Err(err);
            }
            if st.produced >= index + window {
                return Ok(());
            }
            if st.producer_done {
                return Err(ScanError::Cancelled);
            }
            st = self.data.wait(st).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Borrow one published line under its slot lock.
    pub fn with_line<R>(&self, index: u64, f: impl FnOnce(&[u8]) -> R) -> R {
        let slot = &self.slots[(index % self.capacity) as usize];
        let buf = slot.lock().unwrap_or_else(PoisonError::into_inner);
        f(&buf)
    }

    pub fn consume_one(&self) {
        let mut st = self.lock_state();
        st.consumed += 1;
        drop(st);
        self.space.notify_all();
    }

    /// Non-blocking; wakes both sides.
    pub fn cancel(&self) {
        let mut st = self.lock_state();
        st.cancelled = true;
        drop(st);
        self.space.notify_all();
        self.data.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.lock_state().cancelled
    }

    /// Claim a parked producer error, if any is still undelivered.
    pub fn take_failure(&self) -> Option<ScanError> {
        self.lock_state().failed.take()
    }

    /// Park a producer error for the consumer to pick up.
    pub fn fail(&self, err: ScanError) {
        let mut st = self.lock_state();
        st.failed = Some(err);
        st.producer_done = true;
        drop(st);
        self.data.notify_all();
    }

    pub fn finish(&self) {
        let mut st = self.lock_state();
        st.producer_done = true;
        drop(st);
        self.data.notify_all();
    }
}

#[cfg(test)]
mod ring_tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn parked_error_then_sticky_cancel() {
        let ring = LineRing::new(8, 2, 4).unwrap();
        ring.store(0, &[1, 2, 3, 4]);
        ring.publish(1);
        ring.fail(ScanError::Io("bulk read died".into()));
        assert!(matches!(
            ring.await_window(0, 3),
            Err(ScanError::Io(_))
        ));
        assert!(matches!(
            ring.await_window(0, 3),
            Err(ScanError::Cancelled)
        ));
    }

    #[test]
    fn producer_end_without_error_reads_as_cancelled() {
        let ring = LineRing::new(8, 2, 4).unwrap();
        ring.finish();
        assert!(matches!(
            ring.await_window(0, 1),
            Err(ScanError::Cancelled)
        ));
    }

    #[test]
    fn cancel_wakes_a_blocked_consumer() {
        let ring = Arc::new(LineRing::new(8, 2, 4).unwrap());
        let waiter = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || ring.await_window(0, 1))
        };
        // Let the consumer reach the wait before cancelling.
        thread::sleep(std::time::Duration::from_millis(20));
        ring.cancel();
        assert!(matches!(waiter.join().unwrap(), Err(ScanError::Cancelled)));
    }

    #[test]
    fn slots_hold_distinct_lines() {
        let ring = LineRing::new(4, 1, 2).unwrap();
        ring.store(0, &[0xAA, 0x00]);
        ring.store(1, &[0xBB, 0x01]);
        ring.publish(2);
        ring.with_line(0, |l| assert_eq!(l, &[0xAA, 0x00]));
        ring.with_line(1, |l| assert_eq!(l, &[0xBB, 0x01]));
    }

    proptest! {
        /// Any interleaving of producer and consumer steps keeps the
        /// cursor distance at or under capacity - lookahead.
        #[test]
        fn margin_rule_holds_for_all_interleavings(
            steps in proptest::collection::vec(any::<bool>(), 1..200),
            lookahead in 0u32..6,
        ) {
            let capacity = 8usize;
            let ring = LineRing::new(capacity, lookahead, 1).unwrap();
            let margin = capacity as u64 - u64::from(lookahead);
            let mut produced = 0u64;
            let mut consumed = 0u64;
            for produce in steps {
                if produce {
                    let st = ring.lock_state();
                    let can = ring.fits(&st, 1);
                    drop(st);
                    if can {
                        ring.store(produced, &[0]);
                        ring.publish(1);
                        produced += 1;
                    }
                } else if produced > consumed {
                    ring.await_window(consumed, 1).unwrap();
                    ring.consume_one();
                    consumed += 1;
                }
                prop_assert!(produced - consumed <= margin);
            }
        }
    }
}

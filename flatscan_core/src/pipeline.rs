//! Steady-state acquisition: a producer thread pulls raw lines off the
//! device while the caller reconstructs output lines from the ring.
//!
//! The producer owns the [`DeviceHandle`] for the duration of the stream
//! and hands it back at [`ScanStream::stop`]. The caller's own thread is
//! the consumer; no other component runs while a scan is streaming.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use flatscan_traits::ScanLink;
use tracing::{debug, trace};

use crate::device::DeviceHandle;
use crate::error::{Report, Result, ScanError};
use crate::gamma::GammaTable;
use crate::ring::LineRing;
use crate::session::ScanPlan;
use crate::util::avg2_round_nearest_u16;

/// Device memory spent per bulk read; sets the producer's block size.
const BLOCK_BUDGET: usize = 128 * 1024;

fn widen(v: u8) -> u16 {
    (u16::from(v) << 8) | u16::from(v)
}

fn sample_at(raw: &[u8], block_off: usize, x: usize, bps: usize) -> u16 {
    if bps == 1 {
        widen(raw[block_off + x])
    } else {
        let at = block_off + x * 2;
        u16::from_le_bytes([raw[at], raw[at + 1]])
    }
}

fn to_scan_error(err: Report) -> ScanError {
    match err.downcast::<ScanError>() {
        Ok(e) => e,
        Err(other) => ScanError::Io(format!("{other:#}")),
    }
}

/// A scan in flight. Created by [`ScanStream::start`] on an armed device;
/// every reconstructed line comes out of [`ScanStream::read_line`].
pub struct ScanStream<L: ScanLink + Send + 'static> {
    ring: Arc<LineRing>,
    plan: ScanPlan,
    gamma: GammaTable,
    delivered: u64,
    chan: Vec<u16>,
    producer: Option<JoinHandle<DeviceHandle<L>>>,
}

impl<L: ScanLink + Send + 'static> ScanStream<L> {
    /// Issue the scan-start command and launch the producer. The device
    /// must already be configured and armed for this plan.
    pub fn start(
        mut dev: DeviceHandle<L>,
        plan: &ScanPlan,
        gamma: GammaTable,
    ) -> Result<Self> {
        let line_bytes = plan.raw_line_bytes;
        let total = u64::from(plan.total_raw_lines);
        let lines_per_block = (BLOCK_BUDGET / line_bytes).max(1) as u64;
        let capacity = (u64::from(plan.lookahead) * 2 + lines_per_block * 2 + 8) as usize;
        let ring = Arc::new(LineRing::new(capacity, plan.lookahead, line_bytes)?);

        let mut chan = Vec::new();
        chan.try_reserve_exact(plan.width_px as usize)
            .map_err(|_| ScanError::OutOfMemory("line reconstruction scratch"))?;
        chan.resize(plan.width_px as usize, 0);

        let mut block_buf = Vec::new();
        block_buf
            .try_reserve_exact(lines_per_block as usize * line_bytes)
            .map_err(|_| ScanError::OutOfMemory("producer block buffer"))?;
        block_buf.resize(lines_per_block as usize * line_bytes, 0);

        dev.start_scan()?;
        debug!(
            total_raw_lines = total,
            lines_per_block, capacity, "scan stream starting"
        );

        let producer_ring = Arc::clone(&ring);
        let producer = thread::Builder::new()
            .name("scan-producer".into())
            .spawn(move || {
                producer_loop(dev, &producer_ring, total, lines_per_block, block_buf)
            })
            .map_err(|e| ScanError::Io(format!("spawning scan producer: {e}")))?;

        Ok(Self {
            ring,
            plan: plan.clone(),
            gamma,
            delivered: 0,
            chan,
            producer: Some(producer),
        })
    }

    /// Bytes one output line occupies: interleaved samples, little endian
    /// for 16-bit depth.
    #[must_use]
    pub fn output_line_bytes(&self) -> usize {
        self.plan.width_px as usize
            * self.plan.color.channels()
            * self.plan.depth.bytes_per_sample()
    }

    /// Output lines remaining before the image is complete.
    #[must_use]
    pub fn lines_remaining(&self) -> u64 {
        u64::from(self.plan.height_px) - self.delivered
    }

    /// Block for the next reconstructed output line. `out` is cleared and
    /// refilled. Cancellation and producer failures surface here; after a
    /// failure every further call reads as `Cancelled`.
    pub fn read_line(&mut self, out: &mut Vec<u8>) -> Result<()> {
        if self.delivered == u64::from(self.plan.height_px) {
            return Err(ScanError::State("scan image fully delivered".into()).into());
        }
        let window = u64::from(self.plan.lookahead) + 1;
        self.ring.await_window(self.delivered, window)?;

        out.clear();
        out.resize(self.output_line_bytes(), 0);
        let channels = self.plan.color.channels();
        for ch in 0..channels {
            self.fetch_channel(ch);
            self.emit_channel(ch, channels, out);
        }

        self.ring.consume_one();
        self.delivered += 1;
        trace!(line = self.delivered, "line delivered");
        Ok(())
    }

    /// Fill `self.chan` with channel `ch` of the current output line.
    ///
    /// Channels sit `line_distance` raw lines apart in the fixed R, G, B
    /// order. At native resolution the staggered element rows are
    /// de-interleaved column by column; below it the raw pair is averaged.
    fn fetch_channel(&mut self, ch: usize) {
        let plan = &self.plan;
        let width = plan.width_px as usize;
        let bps = plan.depth.bytes_per_sample();
        let block_off = ch * plan.valid_pixels as usize * bps;
        let base = self.delivered + u64::from(plan.line_distance) * ch as u64;
        let partner = base + u64::from(plan.pixel_distance);

        if plan.ratio_unity {
            self.ring.with_line(base, |raw| {
                for x in (0..width).step_by(2) {
                    self.chan[x] = sample_at(raw, block_off, x, bps);
                }
            });
            self.ring.with_line(partner, |raw| {
                for x in (1..width).step_by(2) {
                    self.chan[x] = sample_at(raw, block_off, x, bps);
                }
            });
        } else {
            self.ring.with_line(base, |raw| {
                for x in 0..width {
                    self.chan[x] = sample_at(raw, block_off, x, bps);
                }
            });
            if plan.pixel_distance > 0 {
                self.ring.with_line(partner, |raw| {
                    for x in 0..width {
                        self.chan[x] = avg2_round_nearest_u16(
                            self.chan[x],
                            sample_at(raw, block_off, x, bps),
                        );
                    }
                });
            }
        }
    }

    /// Gamma-map `self.chan` and interleave it into the output line.
    fn emit_channel(&self, ch: usize, channels: usize, out: &mut [u8]) {
        let bps = self.plan.depth.bytes_per_sample();
        for (x, &sample) in self.chan.iter().enumerate() {
            let mapped = self.gamma.apply(sample);
            let at = (x * channels + ch) * bps;
            if bps == 1 {
                out[at] = (mapped >> 8) as u8;
            } else {
                out[at..at + 2].copy_from_slice(&mapped.to_le_bytes());
            }
        }
    }

    /// Request cancellation. Non-blocking; the producer stops at its next
    /// block boundary and pending `read_line` calls return `Cancelled`.
    pub fn cancel(&self) {
        debug!("scan cancellation requested");
        self.ring.cancel();
    }

    /// Detached cancel trigger for use from another thread, typically a
    /// signal handler. Outlives the stream harmlessly.
    #[must_use]
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            ring: Arc::clone(&self.ring),
        }
    }

    /// Tear the stream down and recover the device handle, scan stopped
    /// and FIFO cleared. A producer error the consumer never observed is
    /// logged and dropped; the handle comes back usable either way.
    pub fn stop(mut self) -> Result<DeviceHandle<L>> {
        self.ring.cancel();
        let Some(producer) = self.producer.take() else {
            return Err(ScanError::State("scan producer already joined".into()).into());
        };
        match producer.join() {
            Ok(dev) => {
                if let Some(err) = self.ring.take_failure() {
                    debug!("producer error after consumer stopped: {err}");
                }
                Ok(dev)
            }
            Err(_) => Err(ScanError::Io("scan producer thread panicked".into()).into()),
        }
    }
}

impl<L: ScanLink + Send + 'static> Drop for ScanStream<L> {
    fn drop(&mut self) {
        if let Some(producer) = self.producer.take() {
            self.ring.cancel();
            if producer.join().is_err() {
                debug!("scan producer thread panicked during teardown");
            }
        }
    }
}

/// Owned handle that cancels the stream it came from. Cheap to clone and
/// safe to fire after the stream is gone.
#[derive(Clone)]
pub struct CancelHandle {
    ring: Arc<LineRing>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.ring.cancel();
    }
}

/// Producer body: pull raw line blocks until the image is complete, the
/// stream is cancelled, or the transport fails. Always stops the scan and
/// clears the FIFO before handing the device back.
fn producer_loop<L: ScanLink + Send + 'static>(
    mut dev: DeviceHandle<L>,
    ring: &Arc<LineRing>,
    total: u64,
    lines_per_block: u64,
    mut block_buf: Vec<u8>,
) -> DeviceHandle<L> {
    let line_bytes = ring.line_bytes();
    let mut produced = 0u64;
    let outcome = loop {
        if produced == total {
            break Ok(());
        }
        if ring.is_cancelled() {
            debug!(produced, "producer stopping on cancellation");
            break Ok(());
        }
        let block = (total - produced).min(lines_per_block);
        if !ring.wait_space(block) {
            debug!(produced, "producer stopping on cancellation");
            break Ok(());
        }
        let buf = &mut block_buf[..block as usize * line_bytes];
        match dev.bulk_read(buf) {
            Ok(()) => {
                for k in 0..block {
                    ring.store(produced + k, &buf[k as usize * line_bytes..][..line_bytes]);
                }
                ring.publish(block);
                produced += block;
            }
            Err(e) => break Err(to_scan_error(e)),
        }
    };

    let cleanup = dev.stop_scan().and_then(|()| dev.clear_fifo());
    match (outcome, cleanup) {
        (Err(e), _) => ring.fail(e),
        (Ok(()), Err(e)) => ring.fail(to_scan_error(e)),
        (Ok(()), Ok(())) => ring.finish(),
    }
    dev
}

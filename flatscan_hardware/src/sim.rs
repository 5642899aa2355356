//! In-process model of the scan controller chip.
//!
//! Implements [`ScanLink`] over a software register file, 512 KiB of
//! external memory and a deterministic synthetic sensor, so the engine can
//! be exercised end to end with no scanner attached. The model covers what
//! the engine observes: bank latching, DMA sizing, the post-write
//! acknowledge read, status polling, and an analog front end whose offset
//! and gain registers shape the generated samples.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use flatscan_traits::proto;
use flatscan_traits::ScanLink;
use tracing::{debug, trace};

use crate::error::LinkError;

const MEMORY_BYTES: usize = 512 * 1024;

/// Tunable response of the synthetic sensor.
#[derive(Debug, Clone)]
pub struct SimConfig {
    /// Electronic dark level per channel before the AFE offset applies.
    pub dark_base: [u8; 3],
    /// Full-illumination level per channel at unity gain.
    pub white_base: [u8; 3],
    /// STATUS reads reporting not-ready before READY asserts.
    pub busy_status_reads: u32,
    /// STATUS reads a home seek takes before HOME asserts.
    pub home_delay_reads: u32,
    /// Deliver a one-byte-short scan read on the Nth scan read (1-based).
    pub short_read_on_scan_read: Option<u32>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            dark_base: [30, 28, 32],
            white_base: [235, 240, 230],
            busy_status_reads: 0,
            home_delay_reads: 0,
            short_read_on_scan_read: None,
        }
    }
}

#[derive(Debug)]
struct SimState {
    cfg: SimConfig,
    regs: [[u8; 256]; proto::BANK_COUNT as usize],
    bank: u8,
    memory: Vec<u8>,
    mem_ptr: u32,
    pending_ack: bool,
    scanning: bool,
    stream_pos: u64,
    scan_reads: u32,
    busy_left: u32,
    home: bool,
    home_pending: u32,
}

#[derive(Debug, Default)]
struct Counters {
    control_writes: AtomicU32,
    control_reads: AtomicU32,
    bulk_out_calls: AtomicU32,
    scan_reads: AtomicU32,
}

/// The chip model. Cheap to clone handles of its shared state are exposed
/// through [`SimScanner::probe`] so tests keep visibility after the engine
/// takes ownership of the link.
pub struct SimScanner {
    state: Arc<Mutex<SimState>>,
    counters: Arc<Counters>,
}

/// Test-side window into a [`SimScanner`] whose link half has been handed
/// to the engine.
#[derive(Clone)]
pub struct SimProbe {
    state: Arc<Mutex<SimState>>,
    counters: Arc<Counters>,
}

impl Default for SimScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl SimScanner {
    pub fn new() -> Self {
        Self::with_config(SimConfig::default())
    }

    pub fn with_config(cfg: SimConfig) -> Self {
        let busy = cfg.busy_status_reads;
        let mut regs = [[0; 256]; proto::BANK_COUNT as usize];
        // chip identity is mask-programmed, present from power-on
        regs[0][proto::CHIP_ID as usize] = proto::CHIP_ID_VALUE;
        Self {
            state: Arc::new(Mutex::new(SimState {
                cfg,
                regs,
                bank: 0,
                memory: vec![0; MEMORY_BYTES],
                mem_ptr: 0,
                pending_ack: false,
                scanning: false,
                stream_pos: 0,
                scan_reads: 0,
                busy_left: busy,
                home: true,
                home_pending: 0,
            })),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn probe(&self) -> SimProbe {
        SimProbe {
            state: Arc::clone(&self.state),
            counters: Arc::clone(&self.counters),
        }
    }

    /// Synthetic document sample, the value a corrected scan delivers at
    /// (row, col) for channel `ch` (0 = R, 1 = G, 2 = B).
    #[must_use]
    pub fn doc_sample(row: u32, col: u32, ch: u8) -> u8 {
        ((row as u64 * 31 + col as u64 * 7 + ch as u64 * 101) % 251) as u8
    }
}

fn poisoned() -> Box<dyn std::error::Error + Send + Sync> {
    Box::new(LinkError::Transfer("sim state poisoned".into()))
}

fn stall() -> Box<dyn std::error::Error + Send + Sync> {
    Box::new(LinkError::Stall)
}

impl SimState {
    fn reg(&self, reg: u16) -> u8 {
        self.regs[proto::bank_of(reg) as usize][proto::offset_of(reg) as usize]
    }

    fn reg16(&self, lo: u16, hi: u16) -> u16 {
        u16::from(self.reg(lo)) | (u16::from(self.reg(hi)) << 8)
    }

    fn reg24(&self, base: u16) -> u32 {
        u32::from(self.reg(base))
            | (u32::from(self.reg(base + 1)) << 8)
            | (u32::from(self.reg(base + 2)) << 16)
    }

    fn dma_size(&self) -> usize {
        self.reg16(proto::DMA_SIZE_LO, proto::DMA_SIZE_HI) as usize
    }

    fn color(&self) -> bool {
        self.reg(proto::SCAN_MODE) & proto::MODE_COLOR != 0
    }

    fn bytes_per_sample(&self) -> usize {
        if self.reg(proto::SCAN_MODE) & proto::MODE_DEPTH16 != 0 {
            2
        } else {
            1
        }
    }

    fn raw_mode(&self) -> bool {
        self.reg(proto::BYPASS)
            & (proto::BYPASS_DARK_SHADING | proto::BYPASS_WHITE_SHADING)
            != 0
    }

    fn line_bytes(&self) -> usize {
        let valid = self.reg16(proto::VALID_PIXELS_LO, proto::VALID_PIXELS_HI) as usize;
        let channels = if self.color() { 3 } else { 1 };
        valid * self.bytes_per_sample() * channels
    }

    fn afe_offset_signed(&self, ch: u8) -> i32 {
        let mag = i32::from(self.reg(proto::AFE_OFFSET_R + u16::from(ch)));
        if self.reg(proto::AFE_OFFSET_SIGN) & (1 << ch) != 0 {
            -mag
        } else {
            mag
        }
    }

    fn afe_gain(&self, ch: u8) -> i32 {
        i32::from(self.reg(proto::AFE_GAIN_R + u16::from(ch)))
    }

    /// Raw (shading-bypassed) dark sample: electronic floor plus the AFE
    /// offset; a coarse bump every eighth row stands in for read noise.
    fn dark_level(&self, ch: u8, col: u32, row: u32) -> u8 {
        let ripple = i32::from(col % 3 == 0);
        let bump = if row % 8 == 0 { 6 } else { 0 };
        let v = i32::from(self.cfg.dark_base[ch as usize]) + ripple + bump
            + self.afe_offset_signed(ch);
        v.clamp(0, 255) as u8
    }

    /// Raw white sample: illumination through the PGA, then the offset.
    /// Gain code 32 is unity.
    fn white_level(&self, ch: u8, col: u32, row: u32) -> u8 {
        let droop = (col % 5) as i32;
        let dip = if row % 16 == 0 { 4 } else { 0 };
        let lit = i32::from(self.cfg.white_base[ch as usize]) - droop - dip;
        let amplified = lit.max(0) * (32 + self.afe_gain(ch)) / 64;
        (amplified + self.afe_offset_signed(ch)).clamp(0, 255) as u8
    }

    fn sample8(&self, row: u32, col: u32, ch: u8) -> u8 {
        if self.raw_mode() {
            if self.reg(proto::LAMP_CTRL) == proto::LAMP_OFF {
                self.dark_level(ch, col, row)
            } else {
                self.white_level(ch, col, row)
            }
        } else {
            SimScanner::doc_sample(row, col, ch)
        }
    }

    /// One byte of the scan stream at absolute offset `idx`. Lines are laid
    /// out as contiguous per-channel blocks, samples little-endian.
    fn stream_byte(&self, idx: u64) -> u8 {
        let lb = self.line_bytes() as u64;
        if lb == 0 {
            return 0;
        }
        let row = (idx / lb) as u32;
        let off = idx % lb;
        let bps = self.bytes_per_sample() as u64;
        let chan_bytes = lb / if self.color() { 3 } else { 1 };
        let block = (off / chan_bytes) as u8;
        let within = off % chan_bytes;
        let col = (within / bps) as u32;
        let ch = if self.color() { block } else { 1 };
        let v8 = self.sample8(row, col, ch);
        let v16 = (u16::from(v8) << 8) | u16::from(v8);
        if bps == 2 && within % 2 == 0 {
            (v16 & 0xFF) as u8
        } else {
            (v16 >> 8) as u8
        }
    }

    fn write_reg(&mut self, offset: u8, value: u8) {
        self.regs[self.bank as usize][offset as usize] = value;
        let full = (u16::from(self.bank) << 8) | u16::from(offset);
        match full {
            proto::SYS_CTRL => {
                if value & proto::SYS_SCAN_START != 0 {
                    self.scanning = true;
                    self.stream_pos = 0;
                    self.scan_reads = 0;
                    self.home = false;
                    debug!("sim: scan start");
                }
                if value & proto::SYS_SCAN_STOP != 0 {
                    self.scanning = false;
                    debug!("sim: scan stop");
                }
                // pulse register, reads back as zero
                self.regs[self.bank as usize][offset as usize] = 0;
            }
            proto::FIFO_CTRL => {
                if value & proto::FIFO_CLEAR != 0 {
                    self.pending_ack = false;
                    self.stream_pos = 0;
                    // the reset also drops the chip's bank latch
                    self.bank = 0;
                }
                self.regs[0][proto::offset_of(proto::FIFO_CTRL) as usize] = 0;
            }
            proto::MOTOR_CTRL => {
                if value & proto::MOTOR_GO != 0 {
                    let flags = self.reg(proto::MOTOR_FLAGS);
                    if flags & proto::MOTOR_HOME_SEEK != 0 {
                        self.home_pending = self.cfg.home_delay_reads;
                        if self.home_pending == 0 {
                            self.home = true;
                        }
                    } else {
                        self.home = false;
                    }
                }
                self.regs[2][offset as usize] = 0;
            }
            proto::MEM_ADDR_0 | proto::MEM_ADDR_1 | proto::MEM_ADDR_2 => {
                self.mem_ptr = self.reg24(proto::MEM_ADDR_0);
            }
            _ => {}
        }
    }

    fn read_reg(&mut self, offset: u8) -> u8 {
        let full = (u16::from(self.bank) << 8) | u16::from(offset);
        if full == proto::STATUS {
            let mut v = 0;
            if self.busy_left > 0 {
                self.busy_left -= 1;
            } else {
                v |= proto::STATUS_READY;
            }
            if self.home_pending > 0 {
                self.home_pending -= 1;
                if self.home_pending == 0 {
                    self.home = true;
                }
            }
            if self.home {
                v |= proto::STATUS_HOME;
            }
            if self.scanning {
                v |= proto::STATUS_SCANNING;
            }
            return v;
        }
        self.regs[self.bank as usize][offset as usize]
    }
}

impl ScanLink for SimScanner {
    fn control_write(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
        _data: &[u8],
        _timeout: Duration,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.counters.control_writes.fetch_add(1, Ordering::Relaxed);
        let mut s = self.state.lock().map_err(|_| poisoned())?;
        match request {
            proto::REQ_BANK_SELECT => {
                if value >= u16::from(proto::BANK_COUNT) {
                    return Err(stall());
                }
                s.bank = value as u8;
                Ok(())
            }
            proto::REQ_REG_WRITE => {
                if index > 0xFF {
                    return Err(stall());
                }
                s.write_reg(index as u8, (value & 0xFF) as u8);
                Ok(())
            }
            _ => Err(stall()),
        }
    }

    fn control_read(
        &mut self,
        request: u8,
        _value: u16,
        index: u16,
        buf: &mut [u8],
        _timeout: Duration,
    ) -> Result<usize, Box<dyn std::error::Error + Send + Sync>> {
        self.counters.control_reads.fetch_add(1, Ordering::Relaxed);
        let mut s = self.state.lock().map_err(|_| poisoned())?;
        match request {
            proto::REQ_REG_READ => {
                if buf.is_empty() || index > 0xFF {
                    return Err(stall());
                }
                buf[0] = s.read_reg(index as u8);
                Ok(1)
            }
            _ => Err(stall()),
        }
    }

    fn bulk_out(
        &mut self,
        data: &[u8],
        _timeout: Duration,
    ) -> Result<usize, Box<dyn std::error::Error + Send + Sync>> {
        self.counters.bulk_out_calls.fetch_add(1, Ordering::Relaxed);
        let mut s = self.state.lock().map_err(|_| poisoned())?;
        if data.len() != s.dma_size() {
            return Err(stall());
        }
        let at = s.mem_ptr as usize;
        if at + data.len() > s.memory.len() {
            return Err(stall());
        }
        s.memory[at..at + data.len()].copy_from_slice(data);
        s.mem_ptr = (at + data.len()) as u32;
        s.pending_ack = true;
        trace!(bytes = data.len(), at, "sim: bulk out");
        Ok(data.len())
    }

    fn bulk_in(
        &mut self,
        buf: &mut [u8],
        _timeout: Duration,
    ) -> Result<usize, Box<dyn std::error::Error + Send + Sync>> {
        let mut s = self.state.lock().map_err(|_| poisoned())?;
        if s.pending_ack && buf.len() == proto::ACK_LEN {
            s.pending_ack = false;
            buf.copy_from_slice(&[0xA5, 0x5A]);
            return Ok(proto::ACK_LEN);
        }
        if !s.scanning {
            return Err(stall());
        }
        if buf.len() != s.dma_size() {
            return Err(stall());
        }
        s.scan_reads += 1;
        self.counters.scan_reads.fetch_add(1, Ordering::Relaxed);
        let short = s
            .cfg
            .short_read_on_scan_read
            .is_some_and(|n| s.scan_reads == n);
        let want = if short { buf.len() - 1 } else { buf.len() };
        for (i, b) in buf.iter_mut().take(want).enumerate() {
            *b = s.stream_byte(s.stream_pos + i as u64);
        }
        s.stream_pos += want as u64;
        trace!(bytes = want, "sim: scan read");
        Ok(want)
    }
}

impl SimProbe {
    /// Direct register peek, bypassing the bank latch.
    pub fn reg(&self, reg: u16) -> u8 {
        self.state.lock().map(|s| s.reg(reg)).unwrap_or(0)
    }

    pub fn reg16(&self, lo: u16, hi: u16) -> u16 {
        self.state.lock().map(|s| s.reg16(lo, hi)).unwrap_or(0)
    }

    pub fn reg24(&self, base: u16) -> u32 {
        self.state.lock().map(|s| s.reg24(base)).unwrap_or(0)
    }

    /// Copy out of device memory.
    pub fn memory(&self, addr: u32, len: usize) -> Vec<u8> {
        self.state
            .lock()
            .map(|s| s.memory[addr as usize..addr as usize + len].to_vec())
            .unwrap_or_default()
    }

    pub fn control_writes(&self) -> u32 {
        self.counters.control_writes.load(Ordering::Relaxed)
    }

    pub fn control_reads(&self) -> u32 {
        self.counters.control_reads.load(Ordering::Relaxed)
    }

    pub fn bulk_out_calls(&self) -> u32 {
        self.counters.bulk_out_calls.load(Ordering::Relaxed)
    }

    /// Scan-data bulk reads served (acknowledge reads excluded).
    pub fn scan_reads(&self) -> u32 {
        self.counters.scan_reads.load(Ordering::Relaxed)
    }

    /// Raw dark sample the sensor would deliver under the current AFE
    /// programming.
    pub fn dark_level(&self, ch: u8, col: u32, row: u32) -> u8 {
        self.state
            .lock()
            .map(|s| s.dark_level(ch, col, row))
            .unwrap_or(0)
    }

    /// Raw white sample under the current AFE programming.
    pub fn white_level(&self, ch: u8, col: u32, row: u32) -> u8 {
        self.state
            .lock()
            .map(|s| s.white_level(ch, col, row))
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flatscan_traits::ScanLink;

    const T: Duration = Duration::from_millis(50);

    fn select_bank(sim: &mut SimScanner, bank: u16) {
        sim.control_write(proto::REQ_BANK_SELECT, bank, 0, &[], T)
            .unwrap();
    }

    fn write_reg(sim: &mut SimScanner, reg: u16, v: u8) {
        select_bank(sim, u16::from(proto::bank_of(reg)));
        sim.control_write(
            proto::REQ_REG_WRITE,
            u16::from(v),
            u16::from(proto::offset_of(reg)),
            &[],
            T,
        )
        .unwrap();
    }

    #[test]
    fn chip_identity_reads_back_from_power_on() {
        let mut sim = SimScanner::new();
        let mut b = [0u8; 1];
        sim.control_read(
            proto::REQ_REG_READ,
            0,
            u16::from(proto::offset_of(proto::CHIP_ID)),
            &mut b,
            T,
        )
        .unwrap();
        assert_eq!(b[0], proto::CHIP_ID_VALUE);

        // still there after a FIFO reset, the identity read follows one
        write_reg(&mut sim, proto::FIFO_CTRL, proto::FIFO_CLEAR);
        sim.control_read(
            proto::REQ_REG_READ,
            0,
            u16::from(proto::offset_of(proto::CHIP_ID)),
            &mut b,
            T,
        )
        .unwrap();
        assert_eq!(b[0], proto::CHIP_ID_VALUE);
    }

    #[test]
    fn registers_live_in_separate_banks() {
        let mut sim = SimScanner::new();
        write_reg(&mut sim, proto::AFE_GAIN_R, 0x21);
        // same offset, bank 0, must stay untouched
        select_bank(&mut sim, 0);
        let mut b = [0u8; 1];
        sim.control_read(
            proto::REQ_REG_READ,
            0,
            u16::from(proto::offset_of(proto::AFE_GAIN_R)),
            &mut b,
            T,
        )
        .unwrap();
        assert_eq!(b[0], 0);
        assert_eq!(sim.probe().reg(proto::AFE_GAIN_R), 0x21);
    }

    #[test]
    fn bulk_write_requires_programmed_dma_size() {
        let mut sim = SimScanner::new();
        assert!(sim.bulk_out(&[0u8; 16], T).is_err());
        write_reg(&mut sim, proto::DMA_SIZE_LO, 16);
        assert_eq!(sim.bulk_out(&[0u8; 16], T).unwrap(), 16);
    }

    #[test]
    fn bulk_write_lands_at_memory_window_and_arms_ack() {
        let mut sim = SimScanner::new();
        write_reg(&mut sim, proto::MEM_ADDR_0, 0x00);
        write_reg(&mut sim, proto::MEM_ADDR_1, 0x10);
        write_reg(&mut sim, proto::MEM_ADDR_2, 0x00);
        write_reg(&mut sim, proto::DMA_SIZE_LO, 4);
        sim.bulk_out(&[1, 2, 3, 4], T).unwrap();
        let mut ack = [0u8; proto::ACK_LEN];
        assert_eq!(sim.bulk_in(&mut ack, T).unwrap(), proto::ACK_LEN);
        assert_eq!(sim.probe().memory(0x1000, 4), vec![1, 2, 3, 4]);
    }

    #[test]
    fn scan_stream_is_deterministic_and_contiguous() {
        let mut sim = SimScanner::new();
        write_reg(&mut sim, proto::VALID_PIXELS_LO, 16);
        write_reg(&mut sim, proto::SCAN_MODE, 0); // gray, 8-bit
        write_reg(&mut sim, proto::DMA_SIZE_LO, 16);
        write_reg(&mut sim, proto::SYS_CTRL, proto::SYS_SCAN_START);
        let mut first = [0u8; 16];
        let mut second = [0u8; 16];
        sim.bulk_in(&mut first, T).unwrap();
        sim.bulk_in(&mut second, T).unwrap();
        // gray reads channel 1 of the document pattern, row 0 then row 1
        for (col, b) in first.iter().enumerate() {
            assert_eq!(*b, SimScanner::doc_sample(0, col as u32, 1));
        }
        for (col, b) in second.iter().enumerate() {
            assert_eq!(*b, SimScanner::doc_sample(1, col as u32, 1));
        }
    }

    #[test]
    fn status_busy_countdown_then_ready() {
        let mut sim = SimScanner::with_config(SimConfig {
            busy_status_reads: 2,
            ..SimConfig::default()
        });
        let mut b = [0u8; 1];
        for expect_ready in [false, false, true] {
            sim.control_read(
                proto::REQ_REG_READ,
                0,
                u16::from(proto::offset_of(proto::STATUS)),
                &mut b,
                T,
            )
            .unwrap();
            assert_eq!(b[0] & proto::STATUS_READY != 0, expect_ready);
        }
    }
}

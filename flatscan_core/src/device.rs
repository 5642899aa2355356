//! Device handle: lifecycle, banked register access, readiness waits.
//!
//! One [`DeviceHandle`] owns the link for the whole session. The chip keeps
//! a latched register bank; the handle caches the latch and only emits a
//! bank-select when the target bank differs, so hot register paths cost one
//! control transfer. The cache is a handle field, never process state, and
//! it resets whenever the transfer pipeline is cleared because the chip's
//! latch resets with it.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use flatscan_traits::clock::{Clock, MonotonicClock};
use flatscan_traits::{proto, ScanLink};
use tracing::{debug, trace};

use crate::error::{Result, ScanError};
use crate::map_link;

/// Timeout handed to the link for control transfers.
pub(crate) const IO_TIMEOUT: Duration = Duration::from_secs(1);

const READY_POLL: Duration = Duration::from_millis(100);
const READY_POLLS_MAX: u32 = 300; // with READY_POLL, bounds the wait near 30 s

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// Link claimed, chip not yet probed. Only seen mid-open.
    Attached,
    Opened,
    Scanning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LampMode {
    Off = proto::LAMP_OFF,
    Reflective = proto::LAMP_REFLECTIVE,
    Transparency = proto::LAMP_TRANSPARENCY,
}

/// Motion and imaging front door of one attached scanner.
pub struct DeviceHandle<L: ScanLink> {
    link: L,
    state: DeviceState,
    bank: Option<u8>,
    pub(crate) clock: Arc<dyn Clock + Send + Sync>,
}

// `L` carries no Debug bound; show the lifecycle fields only
impl<L: ScanLink> fmt::Debug for DeviceHandle<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("state", &self.state)
            .field("bank", &self.bank)
            .finish_non_exhaustive()
    }
}

impl<L: ScanLink> DeviceHandle<L> {
    /// Open the device: reset the transfer pipeline, verify the chip
    /// signature and wait for the unit to report ready.
    pub fn open(link: L) -> Result<Self> {
        Self::open_with_clock(link, Box::new(MonotonicClock::new()))
    }

    /// Like [`DeviceHandle::open`] with a caller-supplied clock; tests pass
    /// a `TestClock` so the readiness polls don't actually sleep.
    pub fn open_with_clock(link: L, clock: Box<dyn Clock + Send + Sync>) -> Result<Self> {
        let mut dev = Self {
            link,
            state: DeviceState::Attached,
            bank: None,
            clock: Arc::from(clock),
        };
        dev.clear_fifo_inner()?;
        let id = dev.read_reg_unchecked(proto::CHIP_ID)?;
        if id != proto::CHIP_ID_VALUE {
            return Err(ScanError::Protocol(format!(
                "unexpected chip id 0x{id:02X}, want 0x{:02X}",
                proto::CHIP_ID_VALUE
            ))
            .into());
        }
        dev.state = DeviceState::Opened;
        dev.wait_unit_ready()?;
        debug!("scanner opened");
        Ok(dev)
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.state == DeviceState::Attached {
            return Err(ScanError::State("device not opened".into()).into());
        }
        Ok(())
    }

    fn ensure_bank(&mut self, reg: u16) -> Result<()> {
        let bank = proto::bank_of(reg);
        if self.bank == Some(bank) {
            return Ok(());
        }
        map_link(self.link.control_write(
            proto::REQ_BANK_SELECT,
            u16::from(bank),
            0,
            &[],
            IO_TIMEOUT,
        ))?;
        self.bank = Some(bank);
        Ok(())
    }

    /// Drop the cached bank latch; the next register access re-selects.
    pub(crate) fn forget_bank(&mut self) {
        self.bank = None;
    }

    pub(crate) fn write_reg_unchecked(&mut self, reg: u16, value: u8) -> Result<()> {
        self.ensure_bank(reg)?;
        trace!(reg = format_args!("{reg:#06x}"), value, "reg write");
        map_link(self.link.control_write(
            proto::REQ_REG_WRITE,
            u16::from(value),
            u16::from(proto::offset_of(reg)),
            &[],
            IO_TIMEOUT,
        ))
    }

    fn read_reg_unchecked(&mut self, reg: u16) -> Result<u8> {
        self.ensure_bank(reg)?;
        let mut buf = [0u8; 1];
        let n = map_link(self.link.control_read(
            proto::REQ_REG_READ,
            0,
            u16::from(proto::offset_of(reg)),
            &mut buf,
            IO_TIMEOUT,
        ))?;
        if n != 1 {
            return Err(ScanError::Protocol(format!("register read returned {n} bytes")).into());
        }
        Ok(buf[0])
    }

    pub fn write_reg(&mut self, reg: u16, value: u8) -> Result<()> {
        self.ensure_open()?;
        self.write_reg_unchecked(reg, value)
    }

    pub fn read_reg(&mut self, reg: u16) -> Result<u8> {
        self.ensure_open()?;
        self.read_reg_unchecked(reg)
    }

    /// Write a little-endian pair into two explicitly named registers.
    pub fn write_reg_pair(&mut self, lo: u16, hi: u16, value: u16) -> Result<()> {
        let [l, h] = crate::util::le16(value);
        self.write_reg(lo, l)?;
        self.write_reg(hi, h)
    }

    /// Write a 24-bit little-endian value into three consecutive registers.
    pub fn write_reg_u24(&mut self, base: u16, value: u32) -> Result<()> {
        let bytes = crate::util::le24(value);
        for (i, b) in bytes.iter().enumerate() {
            self.write_reg(base + i as u16, *b)?;
        }
        Ok(())
    }

    pub fn read_status(&mut self) -> Result<u8> {
        self.read_reg(proto::STATUS)
    }

    /// Bounded poll until the unit reports ready. The only place (with
    /// [`DeviceHandle::wait_carriage_home`]) the engine retries a busy
    /// device; everything else surfaces `Busy` upward untouched.
    pub fn wait_unit_ready(&mut self) -> Result<()> {
        self.wait_status_bit(proto::STATUS_READY, "unit ready")
    }

    /// Bounded poll until the carriage sits on its home sensor.
    pub fn wait_carriage_home(&mut self) -> Result<()> {
        self.wait_status_bit(proto::STATUS_HOME, "carriage home")
    }

    /// Bounded poll until the motor sequencer finishes its programmed
    /// move. Used after capture-free positioning moves.
    pub fn wait_motor_idle(&mut self) -> Result<()> {
        for poll in 0..READY_POLLS_MAX {
            let status = self.read_status()?;
            if status & proto::STATUS_MOTOR_RUNNING == 0 {
                trace!(polls = poll, "motor idle");
                return Ok(());
            }
            self.clock.sleep(READY_POLL);
        }
        debug!("motor idle wait exhausted");
        Err(ScanError::Busy.into())
    }

    fn wait_status_bit(&mut self, bit: u8, what: &str) -> Result<()> {
        for poll in 0..READY_POLLS_MAX {
            let status = self.read_status()?;
            if status & bit != 0 {
                trace!(what, polls = poll, "status wait satisfied");
                return Ok(());
            }
            self.clock.sleep(READY_POLL);
        }
        debug!(what, "status wait exhausted");
        Err(ScanError::Busy.into())
    }

    pub fn set_lamp(&mut self, mode: LampMode) -> Result<()> {
        self.write_reg(proto::LAMP_CTRL, mode as u8)
    }

    /// Drop the analog front end into standby between sessions.
    pub fn power_save(&mut self, on: bool) -> Result<()> {
        let v = if on { proto::POWER_AFE_STANDBY } else { 0 };
        self.write_reg(proto::POWER_CTRL, v)
    }

    /// Begin streaming. Requires `Opened`; the handle is `Scanning` until
    /// [`DeviceHandle::stop_scan`].
    pub fn start_scan(&mut self) -> Result<()> {
        if self.state != DeviceState::Opened {
            return Err(ScanError::State(format!("scan start in {:?}", self.state)).into());
        }
        self.write_reg(proto::SYS_CTRL, proto::SYS_SCAN_START)?;
        self.state = DeviceState::Scanning;
        debug!("scan started");
        Ok(())
    }

    /// End streaming and return to `Opened`. Idempotent so error paths can
    /// always call it.
    pub fn stop_scan(&mut self) -> Result<()> {
        self.ensure_open()?;
        if self.state == DeviceState::Scanning {
            self.write_reg(proto::SYS_CTRL, proto::SYS_SCAN_STOP)?;
            self.state = DeviceState::Opened;
            debug!("scan stopped");
        }
        Ok(())
    }

    /// Lamp off, front end to standby, link released on drop.
    pub fn close(mut self) -> Result<()> {
        self.set_lamp(LampMode::Off)?;
        self.power_save(true)?;
        debug!("scanner closed");
        Ok(())
    }

    pub(crate) fn clear_fifo_inner(&mut self) -> Result<()> {
        self.write_reg_unchecked(proto::FIFO_CTRL, proto::FIFO_CLEAR)?;
        // the reset also drops the chip's bank latch
        self.forget_bank();
        Ok(())
    }

    pub(crate) fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }
}

//! Test and helper doubles for the link seam.

use std::collections::VecDeque;
use std::time::Duration;

use flatscan_traits::{proto, ScanLink};

type LinkResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// A link that always errors; useful for exercising failure propagation
/// without a device model.
pub struct DeadLink;

impl ScanLink for DeadLink {
    fn control_write(
        &mut self,
        _request: u8,
        _value: u16,
        _index: u16,
        _data: &[u8],
        _timeout: Duration,
    ) -> LinkResult<()> {
        Err(Box::new(std::io::Error::other("link down")))
    }

    fn control_read(
        &mut self,
        _request: u8,
        _value: u16,
        _index: u16,
        _buf: &mut [u8],
        _timeout: Duration,
    ) -> LinkResult<usize> {
        Err(Box::new(std::io::Error::other("link down")))
    }

    fn bulk_out(&mut self, _data: &[u8], _timeout: Duration) -> LinkResult<usize> {
        Err(Box::new(std::io::Error::other("link down")))
    }

    fn bulk_in(&mut self, _buf: &mut [u8], _timeout: Duration) -> LinkResult<usize> {
        Err(Box::new(std::io::Error::other("link down")))
    }
}

/// Register-level link double: acks and records every transfer, serves
/// register reads from a small store. No imaging model; tests that need
/// one use the hardware crate's chip simulator instead.
pub struct EchoLink {
    regs: [[u8; 256]; proto::BANK_COUNT as usize],
    bank: u8,
    /// Bank-select transfers seen.
    pub bank_selects: u32,
    /// Register writes seen, as `(bank, offset, value)`.
    pub reg_writes: Vec<(u8, u8, u8)>,
    /// Bulk-out payload lengths seen.
    pub bulk_out_lens: Vec<usize>,
    /// Two-byte ack reads served.
    pub ack_reads: u32,
    /// Bulk data reads served.
    pub data_reads: u32,
    /// Status values served one per read; the last one repeats.
    pub status_script: VecDeque<u8>,
    /// Fill byte for bulk data reads.
    pub fill: u8,
    /// Cut the nth (1-based) bulk data read short when set.
    pub short_read_at: Option<u32>,
}

impl EchoLink {
    /// A link whose chip reports the expected signature and an idle,
    /// homed status.
    #[must_use]
    pub fn new() -> Self {
        let mut link = Self {
            regs: [[0; 256]; proto::BANK_COUNT as usize],
            bank: 0,
            bank_selects: 0,
            reg_writes: Vec::new(),
            bulk_out_lens: Vec::new(),
            ack_reads: 0,
            data_reads: 0,
            status_script: VecDeque::new(),
            fill: 0,
            short_read_at: None,
        };
        link.regs[0][proto::CHIP_ID as usize] = proto::CHIP_ID_VALUE;
        link.regs[0][proto::STATUS as usize] = proto::STATUS_READY | proto::STATUS_HOME;
        link
    }

    #[must_use]
    pub fn with_chip_id(id: u8) -> Self {
        let mut link = Self::new();
        link.regs[0][proto::CHIP_ID as usize] = id;
        link
    }

    pub fn reg(&self, reg: u16) -> u8 {
        self.regs[proto::bank_of(reg) as usize][proto::offset_of(reg) as usize]
    }

    pub fn set_reg(&mut self, reg: u16, value: u8) {
        self.regs[proto::bank_of(reg) as usize][proto::offset_of(reg) as usize] = value;
    }
}

impl Default for EchoLink {
    fn default() -> Self {
        Self::new()
    }
}

impl ScanLink for EchoLink {
    fn control_write(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
        _data: &[u8],
        _timeout: Duration,
    ) -> LinkResult<()> {
        match request {
            proto::REQ_BANK_SELECT => {
                if value >= u16::from(proto::BANK_COUNT) {
                    return Err(Box::new(std::io::Error::other("bad bank")));
                }
                self.bank = value as u8;
                self.bank_selects += 1;
                Ok(())
            }
            proto::REQ_REG_WRITE => {
                let offset = index as u8;
                let byte = value as u8;
                self.regs[self.bank as usize][offset as usize] = byte;
                self.reg_writes.push((self.bank, offset, byte));
                Ok(())
            }
            _ => Err(Box::new(std::io::Error::other("unknown request"))),
        }
    }

    fn control_read(
        &mut self,
        request: u8,
        _value: u16,
        index: u16,
        buf: &mut [u8],
        _timeout: Duration,
    ) -> LinkResult<usize> {
        if request != proto::REQ_REG_READ || buf.is_empty() {
            return Err(Box::new(std::io::Error::other("unknown request")));
        }
        let offset = index as u8;
        let value = if self.bank == 0 && u16::from(offset) == proto::STATUS {
            match self.status_script.len() {
                0 => self.regs[0][offset as usize],
                1 => self.status_script[0],
                _ => self.status_script.pop_front().unwrap_or_default(),
            }
        } else {
            self.regs[self.bank as usize][offset as usize]
        };
        buf[0] = value;
        Ok(1)
    }

    fn bulk_out(&mut self, data: &[u8], _timeout: Duration) -> LinkResult<usize> {
        self.bulk_out_lens.push(data.len());
        Ok(data.len())
    }

    fn bulk_in(&mut self, buf: &mut [u8], _timeout: Duration) -> LinkResult<usize> {
        if buf.len() == proto::ACK_LEN {
            self.ack_reads += 1;
            buf.fill(0);
            return Ok(proto::ACK_LEN);
        }
        self.data_reads += 1;
        buf.fill(self.fill);
        if self.short_read_at == Some(self.data_reads) {
            return Ok(buf.len() / 2);
        }
        Ok(buf.len())
    }
}

//! Chunked DMA transfers over the bulk endpoints.
//!
//! Every transfer is split into fixed 32 KiB chunks and each chunk is
//! announced to the chip through the DMA size registers before it moves.
//! The chip additionally wants a 2-byte acknowledge read after every bulk
//! write before it latches the data; that read is issued here so callers
//! cannot forget it.

use std::time::Duration;

use flatscan_traits::{proto, ScanLink};
use tracing::trace;

use crate::device::DeviceHandle;
use crate::error::{Result, ScanError};
use crate::map_link;

/// Largest single DMA the chip accepts.
pub const MAX_CHUNK: usize = 32 * 1024;

// Generous: the chip throttles image reads to carriage speed.
const BULK_TIMEOUT: Duration = Duration::from_secs(10);

impl<L: ScanLink> DeviceHandle<L> {
    /// Fill `buf` from the image FIFO. A short chunk means the transfer
    /// pipeline desynced and aborts the whole read with `Io`; recovery is
    /// the caller's to decide (usually [`DeviceHandle::clear_fifo`]).
    pub fn bulk_read(&mut self, buf: &mut [u8]) -> Result<()> {
        self.ensure_open()?;
        for chunk in buf.chunks_mut(MAX_CHUNK) {
            self.set_dma_size(chunk.len())?;
            let n = map_link(self.link_mut().bulk_in(chunk, BULK_TIMEOUT))?;
            if n != chunk.len() {
                return Err(ScanError::Io(format!(
                    "short bulk read: {n} of {} bytes",
                    chunk.len()
                ))
                .into());
            }
            trace!(bytes = n, "bulk chunk in");
        }
        Ok(())
    }

    /// [`DeviceHandle::bulk_read`] into a fresh buffer. Allocation failure
    /// surfaces as `OutOfMemory` instead of aborting.
    pub fn bulk_read_vec(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut v = Vec::new();
        v.try_reserve_exact(len)
            .map_err(|_| ScanError::OutOfMemory("bulk read buffer"))?;
        v.resize(len, 0);
        self.bulk_read(&mut v)?;
        Ok(v)
    }

    /// Push `data` through the bulk-out endpoint in chunks, acknowledging
    /// each one with the chip's steal read.
    pub fn bulk_write(&mut self, data: &[u8]) -> Result<()> {
        self.ensure_open()?;
        for chunk in data.chunks(MAX_CHUNK) {
            self.set_dma_size(chunk.len())?;
            let n = map_link(self.link_mut().bulk_out(chunk, BULK_TIMEOUT))?;
            if n != chunk.len() {
                return Err(ScanError::Io(format!(
                    "short bulk write: {n} of {} bytes",
                    chunk.len()
                ))
                .into());
            }
            self.steal_read()?;
            trace!(bytes = n, "bulk chunk out");
        }
        Ok(())
    }

    /// Place `data` at a device-memory address (motor and shading tables).
    pub fn upload(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        self.ensure_open()?;
        self.write_reg_u24(proto::MEM_ADDR_0, addr)?;
        self.bulk_write(data)
    }

    /// Reset the chip's transfer pipeline. Idempotent; run before first
    /// use and after any bulk error before retrying anything.
    pub fn clear_fifo(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.clear_fifo_inner()
    }

    fn set_dma_size(&mut self, len: usize) -> Result<()> {
        debug_assert!(len > 0 && len <= MAX_CHUNK);
        self.write_reg_pair(proto::DMA_SIZE_LO, proto::DMA_SIZE_HI, len as u16)
    }

    // The chip drops a bulk write unless the host immediately reads two
    // status bytes back. Keep the quirk buried here.
    fn steal_read(&mut self) -> Result<()> {
        let mut ack = [0u8; proto::ACK_LEN];
        let n = map_link(self.link_mut().bulk_in(&mut ack, BULK_TIMEOUT))?;
        if n != proto::ACK_LEN {
            return Err(ScanError::Protocol(format!(
                "write acknowledge returned {n} bytes"
            ))
            .into());
        }
        Ok(())
    }
}

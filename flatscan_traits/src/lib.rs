pub mod clock;
pub mod proto;

pub use clock::{Clock, MonotonicClock};

/// Vendor-class USB primitives of a scanner link.
///
/// The engine is generic over this trait; real devices go through rusb,
/// tests through an in-process chip model. Implementations report failures
/// as boxed errors so the engine can classify them without depending on a
/// concrete backend.
pub trait ScanLink {
    /// Vendor control transfer, host to device.
    fn control_write(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: std::time::Duration,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;

    /// Vendor control transfer, device to host. Returns bytes received.
    fn control_read(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: std::time::Duration,
    ) -> Result<usize, Box<dyn std::error::Error + Send + Sync>>;

    /// Bulk-out transfer. Returns bytes written.
    fn bulk_out(
        &mut self,
        data: &[u8],
        timeout: std::time::Duration,
    ) -> Result<usize, Box<dyn std::error::Error + Send + Sync>>;

    /// Bulk-in transfer. Returns bytes received.
    fn bulk_in(
        &mut self,
        buf: &mut [u8],
        timeout: std::time::Duration,
    ) -> Result<usize, Box<dyn std::error::Error + Send + Sync>>;
}

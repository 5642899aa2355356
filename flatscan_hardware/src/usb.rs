//! rusb-backed [`ScanLink`] for real attached scanners.

use std::time::Duration;

use flatscan_traits::ScanLink;
use rusb::{Context, Direction, TransferType, UsbContext};
use tracing::{debug, trace, warn};

use crate::error::LinkError;

/// USB ids this driver claims.
const SUPPORTED: &[(u16, u16, &str)] = &[
    (0x055F, 0x0409, "1200 CU"),
    (0x055F, 0x040B, "1200 CU Plus"),
];

const CONTROL_TIMEOUT_FLOOR: Duration = Duration::from_millis(200);

/// A claimed scanner on the bus: one vendor interface, one bulk-in and one
/// bulk-out endpoint.
pub struct UsbScanLink {
    handle: rusb::DeviceHandle<Context>,
    iface: u8,
    ep_in: u8,
    ep_out: u8,
    model: &'static str,
}

impl UsbScanLink {
    /// Open the first supported scanner on the bus.
    pub fn open_first() -> crate::error::Result<Self> {
        Self::probe(|vid, pid| SUPPORTED.iter().find(|s| s.0 == vid && s.1 == pid).map(|s| s.2))
    }

    /// Open a specific vendor/product id (config override for rebadged units).
    pub fn open_id(vid: u16, pid: u16) -> crate::error::Result<Self> {
        Self::probe(|v, p| (v == vid && p == pid).then_some("configured id"))
    }

    fn probe(
        matches: impl Fn(u16, u16) -> Option<&'static str>,
    ) -> crate::error::Result<Self> {
        let ctx = Context::new().map_err(map_rusb)?;
        let devices = ctx.devices().map_err(map_rusb)?;
        for device in devices.iter() {
            let Ok(desc) = device.device_descriptor() else {
                continue;
            };
            let Some(model) = matches(desc.vendor_id(), desc.product_id()) else {
                continue;
            };
            debug!(
                vid = format_args!("{:04x}", desc.vendor_id()),
                pid = format_args!("{:04x}", desc.product_id()),
                model,
                "opening scanner"
            );
            let handle = device.open().map_err(map_rusb)?;
            if let Err(e) = handle.set_auto_detach_kernel_driver(true) {
                trace!(error = %e, "kernel driver auto-detach unavailable");
            }
            let (iface, ep_in, ep_out) = find_endpoints(&device)?;
            handle.claim_interface(iface).map_err(map_rusb)?;
            return Ok(Self {
                handle,
                iface,
                ep_in,
                ep_out,
                model,
            });
        }
        Err(LinkError::NotFound)
    }

    pub fn model(&self) -> &'static str {
        self.model
    }
}

impl Drop for UsbScanLink {
    fn drop(&mut self) {
        if let Err(e) = self.handle.release_interface(self.iface) {
            warn!(error = %e, "failed to release scanner interface");
        }
    }
}

/// Locate the vendor interface carrying one bulk-in and one bulk-out
/// endpoint.
fn find_endpoints(device: &rusb::Device<Context>) -> crate::error::Result<(u8, u8, u8)> {
    let config = device.active_config_descriptor().map_err(map_rusb)?;
    for interface in config.interfaces() {
        for desc in interface.descriptors() {
            let mut ep_in = None;
            let mut ep_out = None;
            for ep in desc.endpoint_descriptors() {
                if ep.transfer_type() != TransferType::Bulk {
                    continue;
                }
                match ep.direction() {
                    Direction::In => ep_in = Some(ep.address()),
                    Direction::Out => ep_out = Some(ep.address()),
                }
            }
            if let (Some(i), Some(o)) = (ep_in, ep_out) {
                return Ok((desc.interface_number(), i, o));
            }
        }
    }
    Err(LinkError::Transfer("no bulk endpoint pair".into()))
}

fn map_rusb(e: rusb::Error) -> LinkError {
    match e {
        rusb::Error::Timeout => LinkError::Timeout,
        rusb::Error::Pipe => LinkError::Stall,
        rusb::Error::NoDevice => LinkError::Disconnected,
        rusb::Error::Access => LinkError::Access(e.to_string()),
        rusb::Error::NotFound => LinkError::NotFound,
        other => LinkError::Transfer(other.to_string()),
    }
}

fn out_request() -> u8 {
    rusb::request_type(
        Direction::Out,
        rusb::RequestType::Vendor,
        rusb::Recipient::Device,
    )
}

fn in_request() -> u8 {
    rusb::request_type(
        Direction::In,
        rusb::RequestType::Vendor,
        rusb::Recipient::Device,
    )
}

impl ScanLink for UsbScanLink {
    fn control_write(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let timeout = timeout.max(CONTROL_TIMEOUT_FLOOR);
        self.handle
            .write_control(out_request(), request, value, index, data, timeout)
            .map_err(map_rusb)?;
        Ok(())
    }

    fn control_read(
        &mut self,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, Box<dyn std::error::Error + Send + Sync>> {
        let timeout = timeout.max(CONTROL_TIMEOUT_FLOOR);
        let n = self
            .handle
            .read_control(in_request(), request, value, index, buf, timeout)
            .map_err(map_rusb)?;
        Ok(n)
    }

    fn bulk_out(
        &mut self,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, Box<dyn std::error::Error + Send + Sync>> {
        let n = self
            .handle
            .write_bulk(self.ep_out, data, timeout)
            .map_err(map_rusb)?;
        trace!(bytes = n, "bulk out");
        Ok(n)
    }

    fn bulk_in(
        &mut self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, Box<dyn std::error::Error + Send + Sync>> {
        let n = self
            .handle
            .read_bulk(self.ep_in, buf, timeout)
            .map_err(map_rusb)?;
        trace!(bytes = n, "bulk in");
        Ok(n)
    }
}

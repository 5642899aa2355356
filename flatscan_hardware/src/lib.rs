//! Link implementations for the scan engine: a rusb-backed USB link behind
//! the `hardware` feature and an in-process model of the controller chip
//! for everything else (tests, CLI dry runs, CI).

pub mod error;
pub mod sim;
#[cfg(feature = "hardware")]
pub mod usb;

pub use error::{LinkError, Result};
pub use sim::{SimConfig, SimProbe, SimScanner};
#[cfg(feature = "hardware")]
pub use usb::UsbScanLink;

#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
//! Scanner engine core (transport-agnostic).
//!
//! This crate drives a banked-register scanner controller from first probe
//! to streamed image lines. All device I/O goes through the
//! `flatscan_traits::ScanLink` trait; real USB lives in `flatscan_hardware`.
//!
//! ## Architecture
//!
//! - **Device**: open/close lifecycle, banked register access with a
//!   cached bank latch, bounded readiness waits (`device`)
//! - **Bulk**: chunked DMA over the memory window, including the
//!   post-write ack quirk (`bulk`)
//! - **Motion**: stepper speed ramps and commutation tables (`motor`)
//! - **Session**: timing, geometry and motor arming state machine
//!   (`session`)
//! - **Calibration**: AFE tuning loops and the shading build (`calib`)
//! - **Pipeline**: producer thread, line ring and channel reconstruction
//!   (`pipeline`)
//!
//! ## Fixed-Point Conventions
//!
//! The resample ratio is Q15 (`0x8000` = unity), shading gains are Q12
//! (`4096` = unity), and gamma maps through a full 16-bit lookup table
//! regardless of output depth.

// Module declarations
mod bulk;
pub mod calib;
mod conversions;
pub mod device;
pub mod error;
pub mod gamma;
pub mod mocks;
pub mod motor;
pub mod pipeline;
mod ring;
pub mod session;
pub mod timing;
pub mod util;

pub use crate::calib::{AfeState, CalTargets, Calibrator, ShadingTable};
pub use crate::device::{DeviceHandle, DeviceState, LampMode};
pub use crate::error::{Report, Result, ScanError, SetupError};
pub use crate::gamma::GammaTable;
pub use crate::motor::{MotorTuning, MoveSegment};
pub use crate::pipeline::{CancelHandle, ScanStream};
pub use crate::session::{
    advance_carriage, return_home, BitDepth, ColorMode, MoveKind, ScanGeometry,
    ScanPlan, ScanPurpose, SensorProfile, SessionConfigurator, SessionState,
};

// For typed link error mapping
#[cfg(feature = "hardware-errors")]
use flatscan_hardware::error::LinkError;

/// Classify a boxed link failure into the engine's error taxonomy. Stalled
/// endpoints mean the chip rejected the request shape, which is a protocol
/// fault; everything else at the link layer is transport I/O.
fn map_link_error_dyn(e: &(dyn std::error::Error + Send + Sync + 'static)) -> ScanError {
    #[cfg(feature = "hardware-errors")]
    if let Some(link) = e.downcast_ref::<LinkError>() {
        return match link {
            LinkError::Stall => ScanError::Protocol("endpoint stalled".into()),
            other => ScanError::Io(other.to_string()),
        };
    }
    ScanError::Io(e.to_string())
}

pub(crate) fn map_link<T>(
    res: std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>,
) -> Result<T> {
    res.map_err(|e| Report::from(map_link_error_dyn(e.as_ref())))
}

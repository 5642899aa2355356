//! `From` implementations bridging `flatscan_config` types to `flatscan_core` types.
//!
//! These eliminate the manual field-by-field mapping previously scattered in the CLI.

use crate::calib::{AfeState, CalTargets};
use crate::motor::{DriverKind, MotorTuning, StepDivision};
use crate::session::{ColorMode, SensorProfile};

// ── SensorProfile ────────────────────────────────────────────────────────────

impl From<&flatscan_config::SensorCfg> for SensorProfile {
    fn from(c: &flatscan_config::SensorCfg) -> Self {
        Self {
            native_dpi: c.native_dpi,
            line_distance: c.line_distance,
            pixel_distance: c.pixel_distance,
            margin: c.margin,
            max_width_native: c.max_width,
        }
    }
}

// ── MotorTuning ──────────────────────────────────────────────────────────────

impl From<flatscan_config::StepDivisionCfg> for StepDivision {
    fn from(c: flatscan_config::StepDivisionCfg) -> Self {
        match c {
            flatscan_config::StepDivisionCfg::Full => StepDivision::Full,
            flatscan_config::StepDivisionCfg::Half => StepDivision::Half,
            flatscan_config::StepDivisionCfg::Quarter => StepDivision::Quarter,
            flatscan_config::StepDivisionCfg::Eighth => StepDivision::Eighth,
        }
    }
}

impl From<flatscan_config::DriverCfg> for DriverKind {
    fn from(c: flatscan_config::DriverCfg) -> Self {
        match c {
            flatscan_config::DriverCfg::A3955 => DriverKind::A3955,
            flatscan_config::DriverCfg::A3967 => DriverKind::A3967,
        }
    }
}

impl From<&flatscan_config::MotorCfg> for MotorTuning {
    fn from(c: &flatscan_config::MotorCfg) -> Self {
        Self {
            start_speed: c.start_speed,
            travel_speed: c.travel_speed,
            home_speed: c.home_speed,
            accel_steps: c.accel_steps,
            decel_steps: c.decel_steps,
            step_division: c.step_division.into(),
            driver: c.driver.into(),
        }
    }
}

// ── CalTargets ───────────────────────────────────────────────────────────────

impl From<&flatscan_config::CalibrationCfg> for CalTargets {
    fn from(c: &flatscan_config::CalibrationCfg) -> Self {
        Self {
            dark_band: (c.dark_band[0], c.dark_band[1]),
            dark_refine_band: (c.dark_refine_band[0], c.dark_refine_band[1]),
            white_band: (c.white_band[0], c.white_band[1]),
            white_spread_max: c.white_spread_max,
            shading_target: c.shading_target,
            offset_step: c.offset_step,
            offset_refine_step: c.offset_refine_step,
            gain_step: c.gain_step,
        }
    }
}

// ── AfeState ─────────────────────────────────────────────────────────────────

impl From<&flatscan_config::PersistedAfe> for AfeState {
    fn from(c: &flatscan_config::PersistedAfe) -> Self {
        Self {
            offset_mag: c.offsets,
            offset_negative: c.negative,
            gain: c.gains,
        }
    }
}

// ── ColorMode ────────────────────────────────────────────────────────────────

impl From<flatscan_config::ColorModeCfg> for ColorMode {
    fn from(c: flatscan_config::ColorModeCfg) -> Self {
        match c {
            flatscan_config::ColorModeCfg::Gray => ColorMode::Gray,
            flatscan_config::ColorModeCfg::Color => ColorMode::Color,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn motor_cfg_maps_division_and_driver() {
        let cfg = flatscan_config::MotorCfg::default();
        let tuning = MotorTuning::from(&cfg);
        assert_eq!(tuning.step_division, StepDivision::Eighth);
        assert_eq!(tuning.driver, DriverKind::A3967);
        assert_eq!(tuning.start_speed, cfg.start_speed);
    }

    #[test]
    fn calibration_cfg_bands_become_tuples() {
        let cfg = flatscan_config::CalibrationCfg::default();
        let targets = CalTargets::from(&cfg);
        assert_eq!(targets.dark_band, (5, 15));
        assert_eq!(targets.white_band, (220, 245));
    }

    #[test]
    fn persisted_afe_round_trips_fields() {
        let persisted = flatscan_config::PersistedAfe {
            offsets: [10, 20, 30],
            negative: [true, false, true],
            gains: [4, 5, 6],
        };
        let afe = AfeState::from(&persisted);
        assert_eq!(afe.offset_mag, [10, 20, 30]);
        assert_eq!(afe.offset_negative, [true, false, true]);
        assert_eq!(afe.gain, [4, 5, 6]);
    }
}

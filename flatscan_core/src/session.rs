//! Scan session programming: timing, geometry, motor arming.
//!
//! A [`SessionConfigurator`] walks the chip through the fixed order the
//! firmware expects: timing constants first, then window geometry, then
//! the motor tables. Each stage programs its complete register set, so a
//! failed stage leaves the configurator in its prior state and the next
//! successful call fully overwrites whatever the chip saw of the aborted
//! attempt.

use flatscan_traits::{proto, ScanLink};
use tracing::debug;

use crate::device::DeviceHandle;
use crate::error::{Result, ScanError, SetupError};
use crate::motor::{self, MotorTuning, MoveSegment};
use crate::timing;
use crate::util::round_down_align;

// Device-memory layout: per-channel pack buffers grow from the bottom,
// tables sit in the top pages. A full-width shading table ends below the
// motor table even at the sensor's maximum width.
const IMAGE_PACK_BASE: u32 = 0x0_0000;
pub(crate) const SHADING_BASE: u32 = 0x5_8000;
pub(crate) const MOTOR_TABLE_BASE: u32 = 0x7_C000;
pub(crate) const PHASE_TABLE_BASE: u32 = 0x7_F000;

/// Fixed optical description of the sensor bar.
#[derive(Debug, Clone)]
pub struct SensorProfile {
    pub native_dpi: u16,
    /// Color channel separation in scan lines at native resolution.
    pub line_distance: u16,
    /// Stagger between the odd and even element rows, in scan lines at
    /// native resolution.
    pub pixel_distance: u16,
    /// Extra pixels read around the window before alignment.
    pub margin: u32,
    /// Usable sensor width in native pixels.
    pub max_width_native: u32,
}

impl Default for SensorProfile {
    fn default() -> Self {
        Self {
            native_dpi: 1200,
            line_distance: 8,
            pixel_distance: 4,
            margin: 32,
            max_width_native: 10200,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorMode {
    Gray,
    Color,
}

impl ColorMode {
    #[must_use]
    pub fn channels(self) -> usize {
        match self {
            Self::Gray => 1,
            Self::Color => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitDepth {
    Eight,
    Sixteen,
}

impl BitDepth {
    #[must_use]
    pub fn bytes_per_sample(self) -> usize {
        match self {
            Self::Eight => 1,
            Self::Sixteen => 2,
        }
    }
}

/// What the frames are for; calibration raw frames bypass the correction
/// stages so the loops see the naked front end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanPurpose {
    Image,
    Calibration,
}

/// A requested scan window, positions and sizes in pixels at `dpi`.
#[derive(Debug, Clone)]
pub struct ScanGeometry {
    pub dpi: u16,
    pub origin_x: u32,
    pub origin_y: u32,
    pub width_px: u32,
    pub height_px: u32,
    pub color: ColorMode,
    pub depth: BitDepth,
}

impl ScanGeometry {
    pub fn validate(&self, sensor: &SensorProfile) -> std::result::Result<(), SetupError> {
        if self.width_px == 0 {
            return Err(SetupError::ZeroWidth);
        }
        if self.height_px == 0 {
            return Err(SetupError::ZeroHeight);
        }
        if self.dpi == 0 {
            return Err(SetupError::Invalid("zero resolution"));
        }
        if self.dpi > sensor.native_dpi {
            return Err(SetupError::ResolutionTooHigh);
        }
        if sensor.native_dpi % self.dpi != 0 {
            return Err(SetupError::ResolutionNotDerivable);
        }
        let scale = u32::from(sensor.native_dpi / self.dpi);
        let edge = self
            .origin_x
            .checked_add(self.width_px)
            .and_then(|e| e.checked_mul(scale));
        if edge.is_none_or(|e| e > sensor.max_width_native) {
            return Err(SetupError::Invalid("scan window exceeds the sensor"));
        }
        Ok(())
    }
}

/// Everything derived from a validated geometry: what the chip gets
/// programmed with and what the pipeline needs to reassemble lines.
#[derive(Debug, Clone)]
pub struct ScanPlan {
    pub dpi: u16,
    pub width_px: u32,
    pub height_px: u32,
    pub color: ColorMode,
    pub depth: BitDepth,
    /// Physical pixels read per channel, aligned down to 16.
    pub valid_pixels: u32,
    /// Q15 resampling ratio programmed into the chip.
    pub ratio_q15: u16,
    /// Channel separation in scan lines at this resolution.
    pub line_distance: u32,
    /// Odd/even element stagger in scan lines at this resolution.
    pub pixel_distance: u32,
    /// Ring margin the consumer's reconstruction window needs.
    pub lookahead: u32,
    /// Raw device lines the producer must stream for the full image.
    pub total_raw_lines: u32,
    /// Bytes of one raw device line (all channel blocks).
    pub raw_line_bytes: usize,
    /// True when scanning at the sensor's native resolution.
    pub ratio_unity: bool,
}

impl ScanPlan {
    pub fn derive(
        g: &ScanGeometry,
        sensor: &SensorProfile,
    ) -> std::result::Result<Self, SetupError> {
        g.validate(sensor)?;
        let valid_pixels = round_down_align(g.width_px + sensor.margin);
        debug_assert!(valid_pixels >= g.width_px);
        let ratio_q15 =
            ((u32::from(g.dpi) << 15) / u32::from(sensor.native_dpi)) as u16;
        let line_distance =
            u32::from(sensor.line_distance) * u32::from(g.dpi) / u32::from(sensor.native_dpi);
        let pixel_distance =
            u32::from(sensor.pixel_distance) * u32::from(g.dpi) / u32::from(sensor.native_dpi);
        let lookahead = line_distance * 2 + pixel_distance;
        let channels = g.color.channels();
        let raw_line_bytes =
            valid_pixels as usize * g.depth.bytes_per_sample() * channels;
        Ok(Self {
            dpi: g.dpi,
            width_px: g.width_px,
            height_px: g.height_px,
            color: g.color,
            depth: g.depth,
            valid_pixels,
            ratio_q15,
            line_distance,
            pixel_distance,
            lookahead,
            total_raw_lines: g.height_px + lookahead,
            raw_line_bytes,
            ratio_unity: g.dpi == sensor.native_dpi,
        })
    }

    /// Byte gap between consecutive per-channel pack buffers.
    #[must_use]
    pub fn pack_gap(&self) -> u32 {
        self.valid_pixels * self.depth.bytes_per_sample() as u32
    }

    pub(crate) fn mode_bits(&self) -> u8 {
        let mut v = 0;
        if self.color == ColorMode::Color {
            v |= proto::MODE_COLOR;
        }
        if self.depth == BitDepth::Sixteen {
            v |= proto::MODE_DEPTH16;
        }
        v
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    TimingProgrammed,
    GeometryProgrammed,
    Armed,
}

/// Carriage move flavors the sequencer knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveKind {
    Forward,
    Backward,
    ReturnHome,
}

/// Stages a scan on an opened device. Borrows the handle for the setup
/// phase; streaming afterwards goes through the acquisition pipeline.
pub struct SessionConfigurator<'d, L: ScanLink> {
    dev: &'d mut DeviceHandle<L>,
    sensor: SensorProfile,
    tuning: MotorTuning,
    state: SessionState,
    timing_dpi: Option<u16>,
    plan: Option<ScanPlan>,
}

impl<'d, L: ScanLink> SessionConfigurator<'d, L> {
    pub fn new(
        dev: &'d mut DeviceHandle<L>,
        sensor: SensorProfile,
        tuning: MotorTuning,
    ) -> Self {
        Self {
            dev,
            sensor,
            tuning,
            state: SessionState::Idle,
            timing_dpi: None,
            plan: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The derived plan, available once geometry is programmed.
    pub fn plan(&self) -> Option<&ScanPlan> {
        self.plan.as_ref()
    }

    /// Program the sensor/AFE timing set for the requested resolution.
    pub fn configure_timing(&mut self, dpi: u16) -> Result<()> {
        if dpi == 0 || dpi > self.sensor.native_dpi {
            return Err(SetupError::ResolutionTooHigh.into());
        }
        let set = timing::timing_for(dpi);
        self.program_timing(set)?;
        self.timing_dpi = Some(dpi);
        self.state = SessionState::TimingProgrammed;
        debug!(dpi, "timing programmed");
        Ok(())
    }

    fn program_timing(&mut self, set: &timing::TimingSet) -> Result<()> {
        self.dev.write_reg(proto::TIM_PH1_RISE, set.ph1_rise)?;
        self.dev.write_reg(proto::TIM_PH1_FALL, set.ph1_fall)?;
        self.dev.write_reg(proto::TIM_PH2_RISE, set.ph2_rise)?;
        self.dev.write_reg(proto::TIM_PH2_FALL, set.ph2_fall)?;
        self.dev.write_reg(proto::TIM_CDS1, set.cds1)?;
        self.dev.write_reg(proto::TIM_CDS2, set.cds2)?;
        self.dev.write_reg(proto::TIM_SAMPLE_POINT, set.sample_point)?;
        self.dev
            .write_reg_pair(proto::TIM_DUMMY_LO, proto::TIM_DUMMY_HI, set.dummy_cycles)?;
        self.dev
            .write_reg_pair(proto::TIM_MARGIN_LO, proto::TIM_MARGIN_HI, set.margin)
    }

    /// Derive and program the scan window. Requires programmed timing for
    /// the same resolution.
    pub fn configure_geometry(
        &mut self,
        geometry: &ScanGeometry,
        purpose: ScanPurpose,
    ) -> Result<()> {
        if self.state == SessionState::Idle {
            return Err(ScanError::State("timing not programmed".into()).into());
        }
        if self.timing_dpi != Some(geometry.dpi) {
            return Err(ScanError::State(
                "geometry resolution differs from programmed timing".into(),
            )
            .into());
        }
        let plan = ScanPlan::derive(geometry, &self.sensor)?;
        self.program_geometry(&plan, purpose)?;
        debug!(
            valid = plan.valid_pixels,
            ratio = plan.ratio_q15,
            "geometry programmed"
        );
        self.plan = Some(plan);
        self.state = SessionState::GeometryProgrammed;
        Ok(())
    }

    fn program_geometry(&mut self, plan: &ScanPlan, purpose: ScanPurpose) -> Result<()> {
        self.dev.write_reg(proto::SCAN_MODE, plan.mode_bits())?;
        let bypass = match purpose {
            ScanPurpose::Image => 0,
            ScanPurpose::Calibration => {
                proto::BYPASS_DARK_SHADING | proto::BYPASS_WHITE_SHADING | proto::BYPASS_GAMMA
            }
        };
        self.dev.write_reg(proto::BYPASS, bypass)?;
        self.dev.write_reg_pair(
            proto::VALID_PIXELS_LO,
            proto::VALID_PIXELS_HI,
            plan.valid_pixels as u16,
        )?;
        self.dev
            .write_reg_pair(proto::RATIO_LO, proto::RATIO_HI, plan.ratio_q15)?;
        // three contiguous per-channel pack buffers
        let gap = plan.pack_gap();
        self.dev
            .write_reg_u24(proto::PACK_ADDR_R_0, IMAGE_PACK_BASE)?;
        self.dev
            .write_reg_u24(proto::PACK_ADDR_G_0, IMAGE_PACK_BASE + gap)?;
        self.dev
            .write_reg_u24(proto::PACK_ADDR_B_0, IMAGE_PACK_BASE + gap * 2)
    }

    /// Upload the motion tables and point the sequencer at the segment for
    /// `kind`. Requires programmed geometry.
    pub fn arm_motor(&mut self, kind: MoveKind, total_steps: u32) -> Result<()> {
        let Some(plan) = self.plan.clone() else {
            return Err(ScanError::State("geometry not programmed".into()).into());
        };
        let scan_speed = motor::scan_speed_for(plan.dpi);
        let segment = match kind {
            MoveKind::Forward if plan.ratio_unity => MoveSegment::ForwardMaxRes,
            MoveKind::Forward => MoveSegment::ForwardScan,
            MoveKind::Backward => MoveSegment::BackwardReturn,
            MoveKind::ReturnHome => MoveSegment::HomeSeek,
        };
        program_motor(
            self.dev,
            &self.tuning,
            scan_speed,
            segment,
            kind,
            total_steps,
        )?;
        self.state = SessionState::Armed;
        debug!("motor armed");
        Ok(())
    }
}

/// Upload motion tables and program the sequencer for one move. Shared by
/// the session path and the standalone carriage helpers.
fn program_motor<L: ScanLink>(
    dev: &mut DeviceHandle<L>,
    tuning: &MotorTuning,
    scan_speed: u16,
    segment: MoveSegment,
    kind: MoveKind,
    total_steps: u32,
) -> Result<()> {
    let table = motor::build_step_table(tuning, scan_speed);
    dev.upload(MOTOR_TABLE_BASE, &table.to_bytes())?;

    let seg_slice = table.segment(segment);
    let cruise = seg_slice[motor::SEGMENT_ACCEL_LEN - 1];
    let current = motor::motor_current_for(cruise);
    let phases = motor::current_phase_table(current, tuning.step_division, tuning.driver);
    dev.upload(PHASE_TABLE_BASE, &phases.to_bytes())?;

    dev.write_reg_u24(proto::TABLE_ADDR_0, MOTOR_TABLE_BASE + segment.byte_offset())?;
    dev.write_reg_u24(proto::PHASE_TABLE_ADDR_0, PHASE_TABLE_BASE)?;
    dev.write_reg_pair(
        proto::ACCEL_STEPS_LO,
        proto::ACCEL_STEPS_HI,
        tuning.accel_steps,
    )?;
    dev.write_reg_pair(
        proto::DECEL_STEPS_LO,
        proto::DECEL_STEPS_HI,
        tuning.decel_steps,
    )?;
    dev.write_reg_pair(proto::FIXED_SPEED_LO, proto::FIXED_SPEED_HI, cruise)?;
    dev.write_reg_u24(proto::TOTAL_STEPS_0, total_steps)?;
    dev.write_reg(proto::STEP_DIV, tuning.step_division.code())?;
    dev.write_reg(proto::MOTOR_CURRENT, current)?;
    let flags = match kind {
        MoveKind::Forward => 0,
        MoveKind::Backward => proto::MOTOR_DIR_BACKWARD | proto::MOTOR_BACKTRACK,
        MoveKind::ReturnHome => proto::MOTOR_DIR_BACKWARD | proto::MOTOR_HOME_SEEK,
    };
    dev.write_reg(proto::MOTOR_FLAGS, flags)
}

/// Capture-free positioning move: advance the carriage by `steps`
/// sequencer steps at travel speed and wait for the move to finish.
/// Callers use this to reach the window origin before exposing.
pub fn advance_carriage<L: ScanLink>(
    dev: &mut DeviceHandle<L>,
    tuning: &MotorTuning,
    steps: u32,
) -> Result<()> {
    if steps == 0 {
        return Ok(());
    }
    program_motor(
        dev,
        tuning,
        motor::scan_speed_for(timing::TIMING_SPLIT_DPI),
        MoveSegment::ForwardApproach,
        MoveKind::Forward,
        steps,
    )?;
    dev.write_reg(proto::MOTOR_CTRL, proto::MOTOR_GO)?;
    dev.wait_motor_idle()
}

/// Rehome the carriage: arm a home seek, pulse the sequencer and wait on
/// the home sensor. Usable without any session state.
pub fn return_home<L: ScanLink>(
    dev: &mut DeviceHandle<L>,
    tuning: &MotorTuning,
) -> Result<()> {
    program_motor(
        dev,
        tuning,
        motor::scan_speed_for(timing::TIMING_SPLIT_DPI),
        MoveSegment::HomeSeek,
        MoveKind::ReturnHome,
        0,
    )?;
    dev.write_reg(proto::MOTOR_CTRL, proto::MOTOR_GO)?;
    dev.wait_carriage_home()
}

#[cfg(test)]
mod plan_tests {
    use super::*;

    fn geometry(dpi: u16, width: u32) -> ScanGeometry {
        ScanGeometry {
            dpi,
            origin_x: 0,
            origin_y: 0,
            width_px: width,
            height_px: 100,
            color: ColorMode::Color,
            depth: BitDepth::Eight,
        }
    }

    #[test]
    fn valid_pixels_align_down_and_cover_the_window() {
        let plan = ScanPlan::derive(&geometry(600, 2550), &SensorProfile::default()).unwrap();
        assert_eq!(plan.valid_pixels % 16, 0);
        assert!(plan.valid_pixels >= 2550);
        assert_eq!(plan.valid_pixels, 2576); // 2550 + 32 aligned down
    }

    #[test]
    fn ratio_is_q15_of_requested_over_native() {
        let sensor = SensorProfile::default();
        let native = ScanPlan::derive(&geometry(1200, 100), &sensor).unwrap();
        assert_eq!(native.ratio_q15, 0x8000);
        assert!(native.ratio_unity);
        let half = ScanPlan::derive(&geometry(600, 100), &sensor).unwrap();
        assert_eq!(half.ratio_q15, 0x4000);
        assert!(!half.ratio_unity);
    }

    #[test]
    fn lookahead_scales_with_resolution() {
        let sensor = SensorProfile::default();
        let native = ScanPlan::derive(&geometry(1200, 100), &sensor).unwrap();
        assert_eq!(native.line_distance, 8);
        assert_eq!(native.pixel_distance, 4);
        assert_eq!(native.lookahead, 20);
        let half = ScanPlan::derive(&geometry(600, 100), &sensor).unwrap();
        assert_eq!(half.lookahead, 10);
        assert_eq!(half.total_raw_lines, 110);
    }

    #[test]
    fn rejects_out_of_range_requests() {
        let sensor = SensorProfile::default();
        assert!(matches!(
            ScanPlan::derive(&geometry(2400, 100), &sensor),
            Err(SetupError::ResolutionTooHigh)
        ));
        assert!(matches!(
            ScanPlan::derive(&geometry(700, 100), &sensor),
            Err(SetupError::ResolutionNotDerivable)
        ));
        assert!(matches!(
            ScanPlan::derive(&geometry(600, 0), &sensor),
            Err(SetupError::ZeroWidth)
        ));
    }

    #[test]
    fn oversized_windows_fail_closed_instead_of_wrapping() {
        let sensor = SensorProfile::default();
        // 357_913_942 * 12 is 2^32 + 8; wrapping would sneak it under the
        // sensor limit
        let mut g = geometry(100, 357_913_942);
        assert!(matches!(
            ScanPlan::derive(&g, &sensor),
            Err(SetupError::Invalid(_))
        ));
        g.origin_x = u32::MAX;
        g.width_px = 1;
        assert!(matches!(
            ScanPlan::derive(&g, &sensor),
            Err(SetupError::Invalid(_))
        ));
    }
}

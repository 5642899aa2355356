//! Analog front end tuning and shading table construction.
//!
//! The tuning loops are bounded best-effort controllers: each iteration
//! captures a short raw frame, measures per-channel levels and nudges the
//! AFE registers one fixed step. Real front ends drift, so hitting the
//! iteration cap is not an error; the last programmed values stand.

use std::time::Duration;

use flatscan_traits::{proto, ScanLink};
use tracing::{debug, trace};

use crate::device::{DeviceHandle, LampMode};
use crate::error::{Result, ScanError, SetupError};
use crate::motor::MotorTuning;
use crate::session::{
    BitDepth, ColorMode, MoveKind, ScanGeometry, ScanPurpose, SensorProfile,
    SessionConfigurator, SHADING_BASE,
};

/// Capture rounds a tuning loop may spend before giving up.
pub const TUNE_ITERS_MAX: u32 = 10;

const TUNE_FRAME_LINES: usize = 8;
const SHADING_FRAME_LINES: usize = 40;
/// Pixels dropped from each end of a line before level statistics.
const EDGE_SKIP: usize = 16;
/// Horizontal segments a line is split into for floor/ceiling metrics.
const SEGMENTS: usize = 8;

const LAMP_WARMUP: Duration = Duration::from_millis(1500);

/// Level bands and step sizes driving the tuning loops. The defaults are
/// the values the controller was characterized with; configs may override
/// them per unit.
#[derive(Debug, Clone)]
pub struct CalTargets {
    /// Dark floor band for the first offset pass.
    pub dark_band: (u8, u8),
    /// Dark floor band for the refinement pass after gain tuning.
    pub dark_refine_band: (u8, u8),
    /// White ceiling band for gain tuning.
    pub white_band: (u8, u8),
    /// Largest acceptable ceiling-floor spread under the lamp.
    pub white_spread_max: u8,
    /// Corrected white level the shading gains normalize to.
    pub shading_target: u16,
    pub offset_step: u8,
    pub offset_refine_step: u8,
    pub gain_step: u8,
}

impl Default for CalTargets {
    fn default() -> Self {
        Self {
            dark_band: (5, 15),
            dark_refine_band: (8, 12),
            white_band: (220, 245),
            white_spread_max: 64,
            shading_target: 250,
            offset_step: 8,
            offset_refine_step: 2,
            gain_step: 4,
        }
    }
}

/// Current AFE register values, in the chip's sign-magnitude offset
/// encoding. Persisted between runs so a warm start skips most of the
/// tuning iterations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AfeState {
    pub offset_mag: [u8; 3],
    pub offset_negative: [bool; 3],
    pub gain: [u8; 3],
}

impl AfeState {
    fn sign_bits(&self) -> u8 {
        let mut bits = 0;
        for (ch, &neg) in self.offset_negative.iter().enumerate() {
            if neg {
                bits |= 1 << ch;
            }
        }
        bits
    }

    /// Write the full AFE block to the chip.
    pub fn program<L: ScanLink>(&self, dev: &mut DeviceHandle<L>) -> Result<()> {
        dev.write_reg(proto::AFE_OFFSET_R, self.offset_mag[0])?;
        dev.write_reg(proto::AFE_OFFSET_G, self.offset_mag[1])?;
        dev.write_reg(proto::AFE_OFFSET_B, self.offset_mag[2])?;
        dev.write_reg(proto::AFE_OFFSET_SIGN, self.sign_bits())?;
        dev.write_reg(proto::AFE_GAIN_R, self.gain[0])?;
        dev.write_reg(proto::AFE_GAIN_G, self.gain[1])?;
        dev.write_reg(proto::AFE_GAIN_B, self.gain[2])
    }
}

/// One controller step for a channel offset. Stepping through zero flips
/// the sign-direction flag; the outer rail saturates.
fn step_offset(
    mag: u8,
    negative: bool,
    level: u8,
    band: (u8, u8),
    step: u8,
) -> (u8, bool) {
    if level > band.1 {
        // Push the floor down: grow the negative offset.
        if negative {
            (mag.saturating_add(step), true)
        } else if mag >= step {
            (mag - step, false)
        } else {
            (step - mag, true)
        }
    } else if level < band.0 {
        // Lift the floor: grow the positive offset.
        if negative {
            if mag >= step {
                (mag - step, true)
            } else {
                (step - mag, false)
            }
        } else {
            (mag.saturating_add(step), false)
        }
    } else {
        (mag, negative)
    }
}

/// Outlier-trimmed mean of the samples inside a percentile band.
/// Sorts its scratch in place.
fn filtered_extreme(samples: &mut [u8], band: (usize, usize)) -> u8 {
    samples.sort_unstable();
    let n = samples.len();
    let lo = n * band.0 / 100;
    let hi = (n * band.1 / 100).clamp(lo + 1, n);
    let sum: u32 = samples[lo..hi].iter().map(|&v| u32::from(v)).sum();
    (sum / (hi - lo) as u32) as u8
}

/// Segment-mean floor and ceiling of one channel block in a raw line,
/// edge pixels excluded.
fn channel_stats(line: &[u8], valid: usize, channel: usize) -> (u8, u8) {
    let block = &line[channel * valid..][..valid];
    let inner = &block[EDGE_SKIP..valid - EDGE_SKIP];
    let seg = inner.len() / SEGMENTS;
    let mut floor = u32::MAX;
    let mut ceiling = 0u32;
    for s in 0..SEGMENTS {
        let part = &inner[s * seg..(s + 1) * seg];
        let mean = part.iter().map(|&v| u32::from(v)).sum::<u32>() / part.len() as u32;
        floor = floor.min(mean);
        ceiling = ceiling.max(mean);
    }
    (floor as u8, ceiling as u8)
}

/// Per-column dark offset and white gain entry, gain in Q12.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShadingEntry {
    pub dark: u16,
    pub gain: u16,
}

/// Correction table built from the reference frames: one entry per valid
/// pixel column per channel, channel blocks contiguous.
#[derive(Debug, Clone)]
pub struct ShadingTable {
    valid_pixels: u32,
    entries: Vec<ShadingEntry>,
}

impl ShadingTable {
    pub fn valid_pixels(&self) -> u32 {
        self.valid_pixels
    }

    pub fn entry(&self, channel: usize, col: usize) -> ShadingEntry {
        self.entries[channel * self.valid_pixels as usize + col]
    }

    /// Device upload image: little-endian dark then gain per entry.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.entries.len() * 4);
        for e in &self.entries {
            out.extend_from_slice(&e.dark.to_le_bytes());
            out.extend_from_slice(&e.gain.to_le_bytes());
        }
        out
    }
}

/// Runs the calibration passes for one upcoming scan window.
pub struct Calibrator<'d, L: ScanLink> {
    dev: &'d mut DeviceHandle<L>,
    sensor: SensorProfile,
    tuning: MotorTuning,
    targets: CalTargets,
    afe: AfeState,
    dpi: u16,
    width_px: u32,
}

impl<'d, L: ScanLink> Calibrator<'d, L> {
    /// `dpi` and `width_px` describe the scan the calibration is for; the
    /// reference frames are captured over the same window.
    pub fn new(
        dev: &'d mut DeviceHandle<L>,
        sensor: SensorProfile,
        tuning: MotorTuning,
        targets: CalTargets,
        dpi: u16,
        width_px: u32,
    ) -> Self {
        Self {
            dev,
            sensor,
            tuning,
            targets,
            afe: AfeState::default(),
            dpi,
            width_px,
        }
    }

    pub fn afe(&self) -> &AfeState {
        &self.afe
    }

    /// Seed the loops from a persisted AFE state instead of zeros.
    pub fn seed_afe(&mut self, state: AfeState) -> Result<()> {
        state.program(self.dev)?;
        self.afe = state;
        Ok(())
    }

    /// Full calibration: offset pass, gain pass under the lamp, offset
    /// refinement, then the shading build. Returns the uploaded table.
    pub fn run(&mut self) -> Result<ShadingTable> {
        self.tune_offsets()?;
        self.dev.set_lamp(LampMode::Reflective)?;
        self.dev.clock.sleep(LAMP_WARMUP);
        self.tune_gains()?;
        self.refine_offsets()?;
        self.build_shading()
    }

    /// First offset pass against the coarse dark band. Returns the number
    /// of capture rounds spent.
    pub fn tune_offsets(&mut self) -> Result<u32> {
        let band = self.targets.dark_band;
        let step = self.targets.offset_step;
        self.offset_loop(band, step)
    }

    /// Refinement pass with the tighter band and smaller step; run after
    /// gain tuning shifted the operating point.
    pub fn refine_offsets(&mut self) -> Result<u32> {
        let band = self.targets.dark_refine_band;
        let step = self.targets.offset_refine_step;
        self.offset_loop(band, step)
    }

    fn offset_loop(&mut self, band: (u8, u8), step: u8) -> Result<u32> {
        self.check_window()?;
        for iter in 1..=TUNE_ITERS_MAX {
            let frame = self.capture_raw(TUNE_FRAME_LINES, LampMode::Off)?;
            let (valid, line) = self.metric_line(&frame, TUNE_FRAME_LINES);
            let mut all_in_band = true;
            let mut floors = [0u8; 3];
            for ch in 0..3 {
                let (floor, _) = channel_stats(line, valid, ch);
                floors[ch] = floor;
                if floor < band.0 || floor > band.1 {
                    all_in_band = false;
                }
            }
            trace!(iter, ?floors, "dark floors");
            if all_in_band {
                debug!(iter, "offset tuning settled");
                return Ok(iter);
            }
            for ch in 0..3 {
                let (mag, neg) = step_offset(
                    self.afe.offset_mag[ch],
                    self.afe.offset_negative[ch],
                    floors[ch],
                    band,
                    step,
                );
                self.afe.offset_mag[ch] = mag;
                self.afe.offset_negative[ch] = neg;
            }
            self.afe.program(self.dev)?;
        }
        debug!("offset tuning hit the iteration cap, keeping last values");
        Ok(TUNE_ITERS_MAX)
    }

    /// Gain pass under the lamp: drive each channel's ceiling into the
    /// white band while the spread stays acceptable.
    pub fn tune_gains(&mut self) -> Result<u32> {
        self.check_window()?;
        let band = self.targets.white_band;
        let spread_max = self.targets.white_spread_max;
        let step = self.targets.gain_step;
        for iter in 1..=TUNE_ITERS_MAX {
            let frame = self.capture_raw(TUNE_FRAME_LINES, LampMode::Reflective)?;
            let (valid, line) = self.metric_line(&frame, TUNE_FRAME_LINES);
            let mut all_in_band = true;
            let mut ceilings = [0u8; 3];
            for ch in 0..3 {
                let (floor, ceiling) = channel_stats(line, valid, ch);
                ceilings[ch] = ceiling;
                let spread = ceiling.saturating_sub(floor);
                if ceiling < band.0 || ceiling > band.1 || spread > spread_max {
                    all_in_band = false;
                }
            }
            trace!(iter, ?ceilings, "white ceilings");
            if all_in_band {
                debug!(iter, "gain tuning settled");
                return Ok(iter);
            }
            for ch in 0..3 {
                if ceilings[ch] < band.0 {
                    self.afe.gain[ch] =
                        self.afe.gain[ch].saturating_add(step).min(proto::AFE_GAIN_MAX);
                } else if ceilings[ch] > band.1 {
                    self.afe.gain[ch] = self.afe.gain[ch].saturating_sub(step);
                }
            }
            self.afe.program(self.dev)?;
        }
        debug!("gain tuning hit the iteration cap, keeping last values");
        Ok(TUNE_ITERS_MAX)
    }

    /// Capture the dark and white reference frames, build the per-column
    /// table and upload it. Dark first, so the lamp is already lit for
    /// whatever scan follows.
    pub fn build_shading(&mut self) -> Result<ShadingTable> {
        self.check_window()?;
        let dark = self.capture_raw(SHADING_FRAME_LINES, LampMode::Off)?;
        let white = self.capture_raw(SHADING_FRAME_LINES, LampMode::Reflective)?;
        let valid = self.valid_pixels();
        let table = build_shading_table(
            &white,
            &dark,
            valid,
            self.targets.shading_target,
        )?;
        self.dev.upload(SHADING_BASE, &table.to_bytes())?;
        self.dev.write_reg_u24(proto::SHADING_ADDR_0, SHADING_BASE)?;
        debug!(valid, "shading table uploaded");
        Ok(table)
    }

    fn valid_pixels(&self) -> u32 {
        crate::util::round_down_align(self.width_px + self.sensor.margin)
    }

    /// The level metrics need at least one sample per segment between the
    /// edge skips; narrower windows cannot be calibrated.
    fn check_window(&self) -> Result<()> {
        if (self.valid_pixels() as usize) < 2 * EDGE_SKIP + SEGMENTS {
            return Err(SetupError::Invalid("scan window too narrow to calibrate").into());
        }
        Ok(())
    }

    /// Raw line the level metrics read: the middle of the frame, clear of
    /// the top rows some sensors smear.
    fn metric_line<'f>(&self, frame: &'f [u8], lines: usize) -> (usize, &'f [u8]) {
        let valid = self.valid_pixels() as usize;
        let line_bytes = valid * 3;
        let mid = lines / 2;
        (valid, &frame[mid * line_bytes..(mid + 1) * line_bytes])
    }

    /// One raw calibration frame over the scan window: 8-bit color with
    /// every correction stage bypassed.
    fn capture_raw(&mut self, lines: usize, lamp: LampMode) -> Result<Vec<u8>> {
        self.dev.set_lamp(lamp)?;
        let geometry = ScanGeometry {
            dpi: self.dpi,
            origin_x: 0,
            origin_y: 0,
            width_px: self.width_px,
            height_px: lines as u32,
            color: ColorMode::Color,
            depth: BitDepth::Eight,
        };
        let mut session =
            SessionConfigurator::new(self.dev, self.sensor.clone(), self.tuning.clone());
        session.configure_timing(geometry.dpi)?;
        session.configure_geometry(&geometry, ScanPurpose::Calibration)?;
        let line_bytes = match session.plan() {
            Some(plan) => plan.raw_line_bytes,
            None => return Err(ScanError::State("calibration plan missing".into()).into()),
        };
        session.arm_motor(MoveKind::Forward, lines as u32 + 16)?;

        self.dev.start_scan()?;
        let frame = self.dev.bulk_read_vec(line_bytes * lines);
        let cleanup = self
            .dev
            .stop_scan()
            .and_then(|()| self.dev.clear_fifo());
        let frame = frame?;
        cleanup?;
        Ok(frame)
    }
}

fn scratch_column(lines: usize) -> Result<Vec<u8>> {
    let mut col = Vec::new();
    col.try_reserve_exact(lines)
        .map_err(|_| ScanError::OutOfMemory("shading scratch"))?;
    col.resize(lines, 0);
    Ok(col)
}

/// Pure table construction from captured reference frames. Frames are
/// raw 8-bit color, channel blocks contiguous per line.
fn build_shading_table(
    white: &[u8],
    dark: &[u8],
    valid_pixels: u32,
    target: u16,
) -> Result<ShadingTable> {
    let valid = valid_pixels as usize;
    let line_bytes = valid * 3;
    let lines = white.len() / line_bytes;

    let mut entries = Vec::new();
    entries
        .try_reserve_exact(valid * 3)
        .map_err(|_| ScanError::OutOfMemory("shading table"))?;

    let mut wcol = scratch_column(lines)?;
    let mut dcol = scratch_column(lines)?;
    for ch in 0..3 {
        for col in 0..valid {
            for row in 0..lines {
                let at = row * line_bytes + ch * valid + col;
                wcol[row] = white[at];
                dcol[row] = dark[at];
            }
            let dark_level = filtered_extreme(&mut dcol, (20, 30));
            let white_level = filtered_extreme(&mut wcol, (70, 80));
            let spread = u32::from(white_level.saturating_sub(dark_level)).max(1);
            let gain = (u32::from(target) * 4096 / spread).min(u32::from(u16::MAX)) as u16;
            let dark16 = (u16::from(dark_level) << 8) | u16::from(dark_level);
            entries.push(ShadingEntry { dark: dark16, gain });
        }
    }
    Ok(ShadingTable {
        valid_pixels,
        entries,
    })
}

#[cfg(test)]
mod offset_step_tests {
    use super::*;

    const BAND: (u8, u8) = (5, 15);

    #[test]
    fn in_band_level_leaves_the_offset_alone() {
        assert_eq!(step_offset(24, true, 10, BAND, 8), (24, true));
    }

    #[test]
    fn high_level_grows_the_negative_offset() {
        assert_eq!(step_offset(0, false, 30, BAND, 8), (8, true));
        assert_eq!(step_offset(8, true, 30, BAND, 8), (16, true));
    }

    #[test]
    fn low_level_steps_back_and_flips_through_zero() {
        // Negative 3 stepping positive by 8 lands at positive 5.
        assert_eq!(step_offset(3, true, 2, BAND, 8), (5, false));
        assert_eq!(step_offset(3, false, 2, BAND, 8), (11, false));
    }

    #[test]
    fn outer_rail_saturates() {
        assert_eq!(step_offset(255, true, 200, BAND, 8), (255, true));
        assert_eq!(step_offset(250, false, 2, BAND, 8), (255, false));
    }
}

#[cfg(test)]
mod filtered_extreme_tests {
    use super::*;

    #[test]
    fn trimmed_mean_ignores_outliers() {
        // 0s and 255s are outside the 20th..30th percentile band.
        let mut v = vec![255u8, 0, 40, 41, 42, 43, 44, 45, 46, 47];
        let level = filtered_extreme(&mut v, (20, 30));
        assert!((40..=43).contains(&level), "level {level}");
    }

    #[test]
    fn band_always_covers_at_least_one_sample() {
        let mut v = vec![9u8, 9, 9];
        assert_eq!(filtered_extreme(&mut v, (20, 30)), 9);
    }
}

#[cfg(test)]
mod shading_build_tests {
    use super::*;

    #[test]
    fn gain_is_q12_of_target_over_spread() {
        let valid = 16u32;
        let line = valid as usize * 3;
        // Flat frames: white 200, dark 40 everywhere.
        let white = vec![200u8; line * 4];
        let dark = vec![40u8; line * 4];
        let table = build_shading_table(&white, &dark, valid, 250).unwrap();
        let e = table.entry(1, 7);
        assert_eq!(e.dark, 0x2828);
        assert_eq!(u32::from(e.gain), 250 * 4096 / 160);
    }

    #[test]
    fn zero_spread_is_clamped_not_divided() {
        let valid = 16u32;
        let line = valid as usize * 3;
        let white = vec![90u8; line * 2];
        let dark = vec![90u8; line * 2];
        let table = build_shading_table(&white, &dark, valid, 250).unwrap();
        assert_eq!(table.entry(0, 0).gain, u16::MAX);
    }
}

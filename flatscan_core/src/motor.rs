//! Stepper profile generation: per-step speed tables, per-microstep
//! current/phase waveforms and the speed-to-current ladder.
//!
//! Everything here is pure arithmetic over the tuning values; programming
//! the result into the chip happens in the session layer. Speeds are step
//! periods in sequencer ticks: a larger value is a slower carriage.

use tracing::trace;

/// Entries of the acceleration region of one segment.
pub const SEGMENT_ACCEL_LEN: usize = 512;
/// Entries of the deceleration region of one segment.
pub const SEGMENT_DECEL_LEN: usize = 256;
/// Entries of one complete segment.
pub const SEGMENT_LEN: usize = SEGMENT_ACCEL_LEN + SEGMENT_DECEL_LEN;
/// Move profiles the sequencer can index.
pub const SEGMENT_COUNT: usize = 8;
/// Entries of the full uploaded table.
pub const TABLE_LEN: usize = SEGMENT_COUNT * SEGMENT_LEN;

// Shape constant of the easing curve. Smaller pulls the ramp steeper at
// the start of the move.
const EASING_BASE: f64 = 0.09;

/// One move profile per variant, in table order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum MoveSegment {
    ForwardApproach = 0,
    ForwardScan = 1,
    ForwardMaxRes = 2,
    BackwardReturn = 3,
    BackwardFast = 4,
    HomeSeek = 5,
    CalibrationCrawl = 6,
    Uniform = 7,
}

impl MoveSegment {
    /// Byte offset of this segment inside the uploaded table.
    #[must_use]
    pub fn byte_offset(self) -> u32 {
        (self as usize * SEGMENT_LEN * 2) as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepDivision {
    Full,
    Half,
    Quarter,
    Eighth,
}

impl StepDivision {
    /// Microsteps per electrical cycle.
    #[must_use]
    pub fn entries_per_cycle(self) -> usize {
        match self {
            Self::Full => 4,
            Self::Half => 8,
            Self::Quarter => 16,
            Self::Eighth => 32,
        }
    }

    /// Register code for `STEP_DIV`.
    #[must_use]
    pub fn code(self) -> u8 {
        match self {
            Self::Full => 0,
            Self::Half => 1,
            Self::Quarter => 2,
            Self::Eighth => 3,
        }
    }
}

/// Supported driver parts. The 3967 wires one winding through an inverting
/// stage, so its phase patterns carry one flipped bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverKind {
    A3955,
    A3967,
}

const PHASE_INVERT_MASK: u8 = 0b0100;

// Quadrature winding patterns, one quadrant each: bits are A+, A-, B+, B-.
const PHASE_QUAD: [u8; 4] = [0b1010, 0b0110, 0b0101, 0b1001];

// Half-step inserts the single-winding states between quadrants.
const PHASE_HALF: [u8; 8] = [
    0b1010, 0b0010, 0b0110, 0b0100, 0b0101, 0b0001, 0b1001, 0b1000,
];

/// Carriage tuning: ramp lengths and the characteristic step periods.
#[derive(Debug, Clone)]
pub struct MotorTuning {
    /// Step period the carriage can start from without stalling.
    pub start_speed: u16,
    /// Cruise period for positioning moves.
    pub travel_speed: u16,
    /// Cruise period for the home seek.
    pub home_speed: u16,
    /// Ramp entries used of the acceleration region (≤ 512).
    pub accel_steps: u16,
    /// Ramp entries used of the deceleration region (≤ 256).
    pub decel_steps: u16,
    pub step_division: StepDivision,
    pub driver: DriverKind,
}

impl Default for MotorTuning {
    fn default() -> Self {
        Self {
            start_speed: 5400,
            travel_speed: 1200,
            home_speed: 2400,
            accel_steps: 255,
            decel_steps: 255,
            step_division: StepDivision::Eighth,
            driver: DriverKind::A3967,
        }
    }
}

/// The uploaded speed table: eight consecutive segments, each a 512-entry
/// acceleration region followed by a 256-entry deceleration region.
#[derive(Debug, Clone)]
pub struct MotorStepTable {
    entries: Box<[u16]>,
}

impl MotorStepTable {
    #[must_use]
    pub fn segment(&self, seg: MoveSegment) -> &[u16] {
        let at = seg as usize * SEGMENT_LEN;
        &self.entries[at..at + SEGMENT_LEN]
    }

    #[must_use]
    pub fn entries(&self) -> &[u16] {
        &self.entries
    }

    /// Little-endian image for the bulk upload.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.entries.len() * 2);
        for e in self.entries.iter() {
            out.extend_from_slice(&e.to_le_bytes());
        }
        out
    }
}

/// One segment's speeds. The acceleration region eases from `start` down
/// to exactly `end` over `accel_steps` entries and holds `end`; the
/// deceleration region runs the complementary curve from `end` back to
/// `start`. A profile with `end >= start` collapses to constant speed.
#[must_use]
pub fn speed_segment(
    start: u16,
    end: u16,
    accel_steps: usize,
    decel_steps: usize,
) -> [u16; SEGMENT_LEN] {
    let accel_steps = accel_steps.clamp(1, SEGMENT_ACCEL_LEN);
    let decel_steps = decel_steps.clamp(1, SEGMENT_DECEL_LEN);
    let start = start.max(end);
    let span = f64::from(start - end);

    let mut seg = [end; SEGMENT_LEN];
    let floor = ease(accel_steps - 1, accel_steps);
    for (i, slot) in seg.iter_mut().take(accel_steps).enumerate() {
        let v = span * (ease(i, accel_steps) - floor) + f64::from(end);
        *slot = quantize_speed(v);
    }
    // acceleration region holds `end` past the ramp (array init above)

    // Complementary curve, normalized so the last ramp entry lands on
    // `start` exactly instead of `start` less the easing floor.
    let floor_d = ease(decel_steps - 1, decel_steps);
    let norm = 1.0 - floor_d;
    for j in 0..SEGMENT_DECEL_LEN {
        let v = if j >= decel_steps || norm <= f64::EPSILON {
            f64::from(start)
        } else {
            span * (ease(decel_steps - 1 - j, decel_steps) - floor_d) / norm + f64::from(end)
        };
        seg[SEGMENT_ACCEL_LEN + j] = quantize_speed(v);
    }
    seg
}

fn ease(i: usize, n: usize) -> f64 {
    EASING_BASE.powf(i as f64 / n as f64)
}

fn quantize_speed(v: f64) -> u16 {
    if !v.is_finite() || v <= 0.0 {
        return 0;
    }
    if v >= f64::from(u16::MAX) {
        return u16::MAX;
    }
    v.round() as u16
}

/// Assemble the eight-segment table for one session. `scan_speed` is the
/// cruise period while exposing at the requested resolution.
#[must_use]
pub fn build_step_table(tuning: &MotorTuning, scan_speed: u16) -> MotorStepTable {
    let accel = usize::from(tuning.accel_steps);
    let decel = usize::from(tuning.decel_steps);
    let start = tuning.start_speed;
    let fast_return = tuning.travel_speed.saturating_mul(3) / 4;
    let crawl = scan_speed.saturating_mul(3);

    let mut entries = vec![0u16; TABLE_LEN].into_boxed_slice();
    let plans: [(MoveSegment, u16, u16); SEGMENT_COUNT] = [
        (MoveSegment::ForwardApproach, start, tuning.travel_speed),
        (MoveSegment::ForwardScan, start, scan_speed),
        (MoveSegment::ForwardMaxRes, start, scan_speed.saturating_mul(2)),
        (MoveSegment::BackwardReturn, start, tuning.travel_speed),
        (MoveSegment::BackwardFast, start, fast_return.max(1)),
        (MoveSegment::HomeSeek, start, tuning.home_speed),
        (MoveSegment::CalibrationCrawl, start.max(crawl), crawl),
        (MoveSegment::Uniform, tuning.travel_speed, tuning.travel_speed),
    ];
    for (seg, s, e) in plans {
        let at = seg as usize * SEGMENT_LEN;
        entries[at..at + SEGMENT_LEN].copy_from_slice(&speed_segment(s, e, accel, decel));
    }
    trace!(scan_speed, "step table assembled");
    MotorStepTable { entries }
}

/// One microstep of the winding waveform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseEntry {
    pub current_a: u8,
    pub current_b: u8,
    pub phase: u8,
}

/// Per-microstep current pair and winding pattern for one electrical
/// cycle. Quarter and eighth step weight the windings sine/cosine; full
/// and half step drive both flat.
#[derive(Debug, Clone)]
pub struct CurrentPhaseTable {
    entries: Vec<PhaseEntry>,
}

impl CurrentPhaseTable {
    #[must_use]
    pub fn entries(&self) -> &[PhaseEntry] {
        &self.entries
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.entries.len() * 3);
        for e in &self.entries {
            out.extend_from_slice(&[e.current_a, e.current_b, e.phase]);
        }
        out
    }
}

#[must_use]
pub fn current_phase_table(
    current: u8,
    division: StepDivision,
    driver: DriverKind,
) -> CurrentPhaseTable {
    let n = division.entries_per_cycle();
    let mut entries = Vec::with_capacity(n);
    for m in 0..n {
        let phase = match division {
            StepDivision::Full => PHASE_QUAD[m],
            StepDivision::Half => PHASE_HALF[m],
            StepDivision::Quarter | StepDivision::Eighth => {
                let per_quadrant = n / 4;
                PHASE_QUAD[m / per_quadrant]
            }
        };
        let phase = match driver {
            DriverKind::A3955 => phase,
            DriverKind::A3967 => phase ^ PHASE_INVERT_MASK,
        };
        let (a, b) = match division {
            StepDivision::Full | StepDivision::Half => (current, current),
            StepDivision::Quarter | StepDivision::Eighth => {
                let per_quadrant = n / 4;
                let theta = (m % per_quadrant) as f64 / per_quadrant as f64
                    * std::f64::consts::FRAC_PI_2;
                let a = (f64::from(current) * theta.cos()).round();
                let b = (f64::from(current) * theta.sin()).round();
                (a as u8, b as u8)
            }
        };
        entries.push(PhaseEntry {
            current_a: a,
            current_b: b,
            phase,
        });
    }
    CurrentPhaseTable { entries }
}

// Cruise period by requested resolution; slower carriage above 300 dpi.
const SCAN_SPEED_BY_DPI: &[(u16, u16)] = &[
    (75, 900),
    (150, 1200),
    (300, 1800),
    (600, 3600),
    (1200, 7200),
];

/// Cruise step period for a requested resolution.
#[must_use]
pub fn scan_speed_for(dpi: u16) -> u16 {
    for (d, speed) in SCAN_SPEED_BY_DPI {
        if dpi <= *d {
            return *speed;
        }
    }
    SCAN_SPEED_BY_DPI[SCAN_SPEED_BY_DPI.len() - 1].1
}

// Winding current by cruise period: a slower carriage needs more holding
// torque. Entries are (period ceiling, current code), ascending.
const CURRENT_BY_SPEED: &[(u16, u8)] = &[
    (1500, 0x10),
    (3000, 0x18),
    (4500, 0x20),
    (6000, 0x28),
    (u16::MAX, 0x30),
];

/// Winding current code for a cruise period.
#[must_use]
pub fn motor_current_for(speed: u16) -> u8 {
    for (ceiling, code) in CURRENT_BY_SPEED {
        if speed <= *ceiling {
            return *code;
        }
    }
    CURRENT_BY_SPEED[CURRENT_BY_SPEED.len() - 1].1
}

#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
//! Config schemas and gamma-curve parsing for the scanner stack.
//!
//! - `Config` and sub-structs are deserialized from TOML and validated.
//! - Gamma CSV loader enforces headers and monotonicity so a bad curve
//!   fails at load time, not mid-scan.

use serde::Deserialize;

/// Gamma CSV schema.
///
/// Expected headers:
/// input,output
///
/// Example:
/// input,output
/// 0,0
/// 32768,41303
/// 65535,65535
#[derive(Debug, Deserialize, Clone, Copy)]
pub struct GammaRow {
    pub input: u16,
    pub output: u16,
}

/// USB identity overrides; both or neither must be given. When absent the
/// hardware layer probes its built-in model table.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct DeviceCfg {
    pub usb_vid: Option<u16>,
    pub usb_pid: Option<u16>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SensorCfg {
    pub native_dpi: u16,
    /// Color channel separation in scan lines at native resolution.
    pub line_distance: u16,
    /// Odd/even element stagger in scan lines at native resolution.
    pub pixel_distance: u16,
    /// Extra pixels read around the window before alignment.
    pub margin: u32,
    /// Usable sensor width in native pixels.
    pub max_width: u32,
}

impl Default for SensorCfg {
    fn default() -> Self {
        Self {
            native_dpi: 1200,
            line_distance: 8,
            pixel_distance: 4,
            margin: 32,
            max_width: 10200,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StepDivisionCfg {
    Full,
    Half,
    Quarter,
    #[default]
    Eighth,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DriverCfg {
    A3955,
    #[default]
    A3967,
}

/// Carriage tuning. Speeds are step periods in timer ticks; larger is
/// slower.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct MotorCfg {
    pub start_speed: u16,
    pub travel_speed: u16,
    pub home_speed: u16,
    pub accel_steps: u16,
    pub decel_steps: u16,
    pub step_division: StepDivisionCfg,
    pub driver: DriverCfg,
}

impl Default for MotorCfg {
    fn default() -> Self {
        Self {
            start_speed: 5400,
            travel_speed: 1200,
            home_speed: 2400,
            accel_steps: 255,
            decel_steps: 255,
            step_division: StepDivisionCfg::Eighth,
            driver: DriverCfg::A3967,
        }
    }
}

/// Persisted AFE register values from an earlier calibration run;
/// preferred at runtime as the tuning loops' starting point.
#[derive(Debug, Deserialize, Clone, Copy)]
pub struct PersistedAfe {
    pub offsets: [u8; 3],
    pub negative: [bool; 3],
    pub gains: [u8; 3],
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct CalibrationCfg {
    /// Dark floor band for the first offset pass.
    pub dark_band: [u8; 2],
    /// Dark floor band for the refinement pass.
    pub dark_refine_band: [u8; 2],
    /// White ceiling band for gain tuning.
    pub white_band: [u8; 2],
    pub white_spread_max: u8,
    /// Corrected white level the shading gains normalize to.
    pub shading_target: u16,
    pub offset_step: u8,
    pub offset_refine_step: u8,
    pub gain_step: u8,
    /// Optional persisted AFE state; seeds the loops when present.
    pub afe: Option<PersistedAfe>,
}

impl Default for CalibrationCfg {
    fn default() -> Self {
        Self {
            dark_band: [5, 15],
            dark_refine_band: [8, 12],
            white_band: [220, 245],
            white_spread_max: 64,
            shading_target: 250,
            offset_step: 8,
            offset_refine_step: 2,
            gain_step: 4,
            afe: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ColorModeCfg {
    Gray,
    #[default]
    Color,
}

/// Scan defaults applied when the command line leaves a knob unset.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ScanCfg {
    pub dpi: u16,
    pub origin_x: u32,
    pub origin_y: u32,
    pub width: u32,
    pub height: u32,
    pub color: ColorModeCfg,
    /// Sample depth in bits, 8 or 16.
    pub depth: u8,
    /// Gamma exponent; 1.0 is identity.
    pub gamma: f64,
    /// Run the full calibration pass before scanning.
    pub calibrate: bool,
}

impl Default for ScanCfg {
    fn default() -> Self {
        Self {
            dpi: 300,
            origin_x: 0,
            origin_y: 0,
            width: 2550,
            height: 3300,
            color: ColorModeCfg::Color,
            depth: 8,
            gamma: 1.8,
            calibrate: true,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Logging {
    pub file: Option<String>,  // path to .log (JSON lines)
    pub level: Option<String>, // "info","debug"
    /// Log rotation policy: "never" | "daily" | "hourly" (default: never)
    pub rotation: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub device: DeviceCfg,
    pub sensor: SensorCfg,
    pub motor: MotorCfg,
    pub calibration: CalibrationCfg,
    pub scan: ScanCfg,
    pub logging: Logging,
}

pub fn load_toml(s: &str) -> Result<Config, toml::de::Error> {
    toml::from_str::<Config>(s)
}

impl Config {
    pub fn validate(&self) -> eyre::Result<()> {
        // Device
        if self.device.usb_vid.is_some() != self.device.usb_pid.is_some() {
            eyre::bail!("device.usb_vid and device.usb_pid must be set together");
        }

        // Sensor
        if self.sensor.native_dpi == 0 {
            eyre::bail!("sensor.native_dpi must be > 0");
        }
        if self.sensor.line_distance == 0 {
            eyre::bail!("sensor.line_distance must be >= 1");
        }
        if self.sensor.margin < 16 {
            eyre::bail!("sensor.margin must be >= 16 to survive pixel alignment");
        }
        if self.sensor.max_width == 0 {
            eyre::bail!("sensor.max_width must be > 0");
        }

        // Motor
        if self.motor.start_speed == 0 || self.motor.travel_speed == 0 || self.motor.home_speed == 0
        {
            eyre::bail!("motor speeds must be > 0");
        }
        if self.motor.start_speed < self.motor.travel_speed {
            eyre::bail!("motor.start_speed must not be a faster period than travel_speed");
        }
        if self.motor.accel_steps == 0 || self.motor.accel_steps > 512 {
            eyre::bail!("motor.accel_steps must be in 1..=512");
        }
        if self.motor.decel_steps == 0 || self.motor.decel_steps > 256 {
            eyre::bail!("motor.decel_steps must be in 1..=256");
        }

        // Calibration
        for (name, band) in [
            ("calibration.dark_band", self.calibration.dark_band),
            ("calibration.dark_refine_band", self.calibration.dark_refine_band),
            ("calibration.white_band", self.calibration.white_band),
        ] {
            if band[0] >= band[1] {
                eyre::bail!("{name} must be [low, high] with low < high");
            }
        }
        if self.calibration.offset_step == 0
            || self.calibration.offset_refine_step == 0
            || self.calibration.gain_step == 0
        {
            eyre::bail!("calibration step sizes must be >= 1");
        }
        if self.calibration.shading_target == 0 {
            eyre::bail!("calibration.shading_target must be > 0");
        }

        // Scan defaults
        if self.scan.dpi == 0 {
            eyre::bail!("scan.dpi must be > 0");
        }
        if self.scan.dpi > self.sensor.native_dpi {
            eyre::bail!("scan.dpi must not exceed sensor.native_dpi");
        }
        if self.scan.width == 0 || self.scan.height == 0 {
            eyre::bail!("scan.width and scan.height must be > 0");
        }
        if self.scan.depth != 8 && self.scan.depth != 16 {
            eyre::bail!("scan.depth must be 8 or 16");
        }
        if !self.scan.gamma.is_finite() || self.scan.gamma <= 0.0 {
            eyre::bail!("scan.gamma must be finite and > 0");
        }

        Ok(())
    }
}

/// A validated transfer curve: control points with strictly increasing
/// inputs, ready for LUT interpolation.
#[derive(Debug, Clone)]
pub struct GammaCurve {
    pub points: Vec<(u16, u16)>,
}

impl GammaCurve {
    /// Build a curve from parsed rows, enforcing the shape the LUT builder
    /// needs: at least two points, inputs strictly increasing.
    pub fn from_rows(rows: Vec<GammaRow>) -> eyre::Result<Self> {
        if rows.len() < 2 {
            eyre::bail!("gamma curve requires at least two rows, got {}", rows.len());
        }
        for i in 1..rows.len() {
            if rows[i].input <= rows[i - 1].input {
                eyre::bail!(
                    "gamma curve inputs must be strictly increasing (rows {} and {})",
                    i - 1,
                    i
                );
            }
        }
        Ok(Self {
            points: rows.iter().map(|r| (r.input, r.output)).collect(),
        })
    }
}

impl TryFrom<Vec<GammaRow>> for GammaCurve {
    type Error = eyre::Report;
    fn try_from(rows: Vec<GammaRow>) -> Result<Self, Self::Error> {
        Self::from_rows(rows)
    }
}

impl TryFrom<&[GammaRow]> for GammaCurve {
    type Error = eyre::Report;
    fn try_from(rows: &[GammaRow]) -> Result<Self, Self::Error> {
        Self::from_rows(rows.to_vec())
    }
}

pub fn load_gamma_csv(path: &std::path::Path) -> eyre::Result<GammaCurve> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)
        .map_err(|e| eyre::eyre!("open gamma CSV {:?}: {}", path, e))?;

    // Enforce exact headers
    let headers = rdr
        .headers()
        .map_err(|e| eyre::eyre!("read CSV headers {:?}: {}", path, e))?
        .clone();
    let expected = ["input", "output"];
    let actual: Vec<String> = headers.iter().map(|s| s.to_string()).collect();
    if actual != expected {
        eyre::bail!(
            "gamma CSV must have headers 'input,output', got: {}",
            actual.join(",")
        );
    }

    let mut rows = Vec::new();
    for (idx, rec) in rdr.deserialize::<GammaRow>().enumerate() {
        match rec {
            Ok(row) => rows.push(row),
            Err(e) => {
                eyre::bail!("invalid CSV row {}: {}", idx + 2, e);
            }
        }
    }

    GammaCurve::try_from(rows)
}

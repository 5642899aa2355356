//! CLI argument definitions and shared statics.

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::OnceLock;

pub static FILE_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();
/// Whether the user asked for JSON output (controls structured error output).
pub static JSON_MODE: OnceLock<bool> = OnceLock::new();
/// Effective scan window for the current run (for JSON details).
pub static LAST_SCAN: OnceLock<CliScanInfo> = OnceLock::new();

#[derive(Copy, Clone, Debug)]
pub struct CliScanInfo {
    pub dpi: u16,
    pub width_px: u32,
    pub height_px: u32,
    pub depth: u8,
}

/// Facts about a finished scan, reported as JSON when `--json` is set.
#[derive(Clone, Default)]
pub struct ScanSummary {
    pub out: Option<String>,
    pub lines: u64,
    pub bytes: u64,
}

#[derive(Parser, Debug)]
#[command(name = "flatscan", version, about = "Flatbed scanner CLI")]
pub struct Cli {
    /// Path to config TOML (typed)
    #[arg(long, value_name = "FILE", default_value = "etc/flatscan.toml")]
    pub config: PathBuf,

    /// Log as JSON lines instead of pretty
    #[arg(long, action = ArgAction::SetTrue)]
    pub json: bool,

    /// Console log level (error|warn|info|debug|trace); overrides [logging].level
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Command to execute
    #[command(subcommand)]
    pub cmd: Commands,
}

/// Channel mode for the output image.
#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum ColorArg {
    /// Single green-channel image
    Gray,
    /// Interleaved RGB image
    Color,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Scan a page to a PNM image file
    Scan {
        /// Output image file (PGM for gray, PPM for color)
        #[arg(long, value_name = "FILE")]
        out: PathBuf,
        /// Output resolution in dpi (overrides config)
        #[arg(long)]
        dpi: Option<u16>,
        /// Window origin from the left sensor edge, in output pixels
        #[arg(long, value_name = "PX")]
        origin_x: Option<u32>,
        /// Window origin from the home position, in output pixels
        #[arg(long, value_name = "PX")]
        origin_y: Option<u32>,
        /// Window width in output pixels (overrides config)
        #[arg(long, value_name = "PX")]
        width: Option<u32>,
        /// Window height in output pixels (overrides config)
        #[arg(long, value_name = "PX")]
        height: Option<u32>,
        /// Channel mode: gray or color
        #[arg(long, value_enum)]
        color: Option<ColorArg>,
        /// Sample depth in bits: 8 or 16
        #[arg(long, value_name = "BITS")]
        depth: Option<u8>,
        /// Gamma exponent applied per sample (1.0 = linear)
        #[arg(long)]
        gamma: Option<f32>,
        /// Gamma curve CSV (strict `input,output` header); overrides --gamma
        #[arg(long, value_name = "FILE")]
        gamma_csv: Option<PathBuf>,
        /// Skip the calibration pass before scanning
        #[arg(
            long,
            action = ArgAction::SetTrue,
            long_help = "Skip the offset/gain/shading calibration pass before scanning.\n\nThe analog front end is seeded from [calibration.afe] in the config when present, otherwise from power-on defaults. Shading correction still uses whatever table the device last loaded, so expect visible column banding on a cold unit. Useful for quick previews and for exercising the pipeline in tests."
        )]
        no_calibrate: bool,
    },
    /// Run offset/gain/shading calibration and print the resulting AFE state
    Calibrate {
        /// Resolution the reference frames are captured at
        #[arg(long)]
        dpi: Option<u16>,
    },
    /// Quick health check (device presence / sim ok)
    SelfCheck,
    /// Drive the carriage back to the home position
    Park,
}

//! Scan orchestration: config loading, link assembly, and the command flows.

use crate::cli::{CliScanInfo, ColorArg, ScanSummary, LAST_SCAN};
use eyre::WrapErr;
use flatscan_config::Config;
use flatscan_core::error::Result as CoreResult;
use flatscan_core::{
    advance_carriage, return_home, AfeState, BitDepth, CalTargets, Calibrator, ColorMode,
    DeviceHandle, GammaTable, MotorTuning, MoveKind, ScanError, ScanGeometry, ScanPurpose,
    ScanStream, SensorProfile, SessionConfigurator, SetupError,
};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{info, warn};

/// Slack steps past the exposed region so the sequencer never starves the
/// line FIFO at the tail of the move.
const SCAN_TAIL_STEPS: u32 = 16;

pub fn load_config(path: &Path) -> CoreResult<Config> {
    let text = std::fs::read_to_string(path)
        .wrap_err_with(|| format!("reading config {}", path.display()))?;
    let cfg = flatscan_config::load_toml(&text).wrap_err("invalid config TOML")?;
    cfg.validate().wrap_err("invalid config")?;
    Ok(cfg)
}

// Choose hardware or simulation
#[cfg(feature = "hardware")]
fn open_link(cfg: &Config) -> CoreResult<flatscan_hardware::UsbScanLink> {
    let link = match (cfg.device.usb_vid, cfg.device.usb_pid) {
        (Some(vid), Some(pid)) => flatscan_hardware::UsbScanLink::open_id(vid, pid)?,
        _ => flatscan_hardware::UsbScanLink::open_first()?,
    };
    Ok(link)
}

#[cfg(not(feature = "hardware"))]
fn open_link(_cfg: &Config) -> CoreResult<flatscan_hardware::SimScanner> {
    Ok(flatscan_hardware::SimScanner::new())
}

/// First Ctrl-C cancels the stream cooperatively; the second one gives up
/// on a clean teardown and exits hard.
fn install_cancel_handler(handle: flatscan_core::CancelHandle) {
    let presses = AtomicU32::new(0);
    let result = ctrlc::set_handler(move || {
        if presses.fetch_add(1, Ordering::SeqCst) == 0 {
            warn!("cancel requested; stopping at the next line boundary");
            handle.cancel();
        } else {
            std::process::exit(130);
        }
    });
    if let Err(e) = result {
        warn!(error = %e, "failed to install ctrl-c handler; interrupts will be abrupt");
    }
}

#[allow(clippy::too_many_arguments)]
pub fn run_scan(
    cfg: &Config,
    out: &Path,
    dpi: Option<u16>,
    origin_x: Option<u32>,
    origin_y: Option<u32>,
    width: Option<u32>,
    height: Option<u32>,
    color: Option<ColorArg>,
    depth: Option<u8>,
    gamma: Option<f32>,
    gamma_csv: Option<&Path>,
    no_calibrate: bool,
) -> CoreResult<ScanSummary> {
    // Effective settings: CLI overrides win over the [scan] section
    let dpi = dpi.unwrap_or(cfg.scan.dpi);
    let origin_x = origin_x.unwrap_or(cfg.scan.origin_x);
    let origin_y = origin_y.unwrap_or(cfg.scan.origin_y);
    let width = width.unwrap_or(cfg.scan.width);
    let height = height.unwrap_or(cfg.scan.height);
    let color = match color {
        Some(ColorArg::Gray) => ColorMode::Gray,
        Some(ColorArg::Color) => ColorMode::Color,
        None => cfg.scan.color.into(),
    };
    let depth_bits = depth.unwrap_or(cfg.scan.depth);
    let depth = match depth_bits {
        8 => BitDepth::Eight,
        16 => BitDepth::Sixteen,
        _ => return Err(SetupError::BadDepth.into()),
    };
    let _ = LAST_SCAN.set(CliScanInfo {
        dpi,
        width_px: width,
        height_px: height,
        depth: depth_bits,
    });

    let gamma_table = match gamma_csv {
        Some(path) => {
            let curve = flatscan_config::load_gamma_csv(path)?;
            GammaTable::from_curve(&curve.points)?
        }
        None => GammaTable::from_exponent(gamma.unwrap_or(cfg.scan.gamma as f32))?,
    };

    let sensor: SensorProfile = (&cfg.sensor).into();
    let tuning: MotorTuning = (&cfg.motor).into();

    // The device window always starts at the sensor edge and runs through
    // the right edge of the user window; the left crop happens per line on
    // the way into the file.
    let device_width = origin_x + width;
    let geometry = ScanGeometry {
        dpi,
        origin_x: 0,
        origin_y: 0,
        width_px: device_width,
        height_px: height,
        color,
        depth,
    };
    geometry.validate(&sensor)?;

    let link = open_link(cfg)?;
    let mut dev = DeviceHandle::open(link)?;

    if cfg.scan.calibrate && !no_calibrate {
        let targets: CalTargets = (&cfg.calibration).into();
        let mut calibrator = Calibrator::new(
            &mut dev,
            sensor.clone(),
            tuning.clone(),
            targets,
            dpi,
            device_width,
        );
        if let Some(persisted) = &cfg.calibration.afe {
            calibrator.seed_afe(persisted.into())?;
        }
        calibrator.run()?;
        info!(afe = ?calibrator.afe(), "calibration complete");
        return_home(&mut dev, &tuning)?;
    } else if let Some(persisted) = &cfg.calibration.afe {
        AfeState::from(persisted).program(&mut dev)?;
    }

    advance_carriage(&mut dev, &tuning, origin_y)?;

    let mut session = SessionConfigurator::new(&mut dev, sensor, tuning.clone());
    session.configure_timing(dpi)?;
    session.configure_geometry(&geometry, ScanPurpose::Image)?;
    let plan = match session.plan() {
        Some(p) => p.clone(),
        None => return Err(ScanError::State("scan plan missing".into()).into()),
    };
    session.arm_motor(MoveKind::Forward, plan.total_raw_lines + SCAN_TAIL_STEPS)?;
    drop(session);

    let mut writer = BufWriter::new(
        File::create(out).wrap_err_with(|| format!("creating {}", out.display()))?,
    );
    write_pnm_header(&mut writer, color, depth_bits, width, height)?;

    let mut stream = ScanStream::start(dev, &plan, gamma_table)?;
    install_cancel_handler(stream.cancel_handle());
    info!(dpi, width, height, "scan started");

    let crop = origin_x as usize * color.channels() * usize::from(depth_bits / 8);
    let mut line = Vec::new();
    let mut lines = 0u64;
    let mut bytes = 0u64;
    let mut pending: Option<flatscan_core::Report> = None;

    for _ in 0..height {
        if let Err(err) = stream.read_line(&mut line) {
            pending = Some(err);
            break;
        }
        if let Err(err) = write_image_line(&mut writer, &line[crop..], depth_bits) {
            pending = Some(err);
            break;
        }
        lines += 1;
        bytes += (line.len() - crop) as u64;
    }
    if pending.is_none() {
        if let Err(err) = writer.flush().wrap_err("flushing image file") {
            pending = Some(err);
        }
    }

    // Recover the device for parking even when the read loop failed; the
    // read error stays the one reported.
    match stream.stop() {
        Ok(mut dev) => {
            let park = return_home(&mut dev, &tuning).and_then(|()| dev.close());
            if let Some(err) = pending {
                return Err(err);
            }
            park?;
        }
        Err(stop_err) => {
            return Err(pending.unwrap_or(stop_err));
        }
    }

    info!(lines, bytes, "scan finished");
    Ok(ScanSummary {
        out: Some(out.display().to_string()),
        lines,
        bytes,
    })
}

pub fn run_calibrate(cfg: &Config, dpi: Option<u16>) -> CoreResult<AfeState> {
    let dpi = dpi.unwrap_or(cfg.scan.dpi);
    let sensor: SensorProfile = (&cfg.sensor).into();
    let tuning: MotorTuning = (&cfg.motor).into();
    let targets: CalTargets = (&cfg.calibration).into();
    let width = cfg.scan.origin_x + cfg.scan.width;

    let link = open_link(cfg)?;
    let mut dev = DeviceHandle::open(link)?;
    let mut calibrator = Calibrator::new(&mut dev, sensor, tuning.clone(), targets, dpi, width);
    if let Some(persisted) = &cfg.calibration.afe {
        calibrator.seed_afe(persisted.into())?;
    }
    calibrator.run()?;
    let afe = calibrator.afe().clone();
    return_home(&mut dev, &tuning)?;
    dev.close()?;
    Ok(afe)
}

pub fn run_self_check(cfg: &Config) -> CoreResult<u8> {
    let link = open_link(cfg)?;
    let mut dev = DeviceHandle::open(link)?;
    let status = dev.read_status()?;
    dev.close()?;
    Ok(status)
}

pub fn run_park(cfg: &Config) -> CoreResult<()> {
    let tuning: MotorTuning = (&cfg.motor).into();
    let link = open_link(cfg)?;
    let mut dev = DeviceHandle::open(link)?;
    return_home(&mut dev, &tuning)?;
    dev.close()
}

fn write_pnm_header(
    w: &mut impl Write,
    color: ColorMode,
    depth_bits: u8,
    width: u32,
    height: u32,
) -> CoreResult<()> {
    let magic = match color {
        ColorMode::Gray => "P5",
        ColorMode::Color => "P6",
    };
    let maxval = if depth_bits == 16 { 65535 } else { 255 };
    write!(w, "{magic}\n{width} {height}\n{maxval}\n").wrap_err("writing image header")
}

fn write_image_line(w: &mut impl Write, payload: &[u8], depth_bits: u8) -> CoreResult<()> {
    if depth_bits == 16 {
        // Engine lines are little endian; PNM wants the high byte first.
        for pair in payload.chunks_exact(2) {
            w.write_all(&[pair[1], pair[0]])
                .wrap_err("writing image data")?;
        }
        Ok(())
    } else {
        w.write_all(payload).wrap_err("writing image data")
    }
}

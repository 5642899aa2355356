//! Human-readable error descriptions and structured JSON error formatting.

use crate::cli::LAST_SCAN;

pub fn scan_error_name(e: &flatscan_core::ScanError) -> &'static str {
    use flatscan_core::ScanError::*;
    match e {
        Io(_) => "Io",
        Protocol(_) => "Protocol",
        OutOfMemory(_) => "OutOfMemory",
        Busy => "Busy",
        Cancelled => "Cancelled",
        State(_) => "State",
    }
}

/// Map an eyre::Report to a human-readable explanation with likely causes and fix hints.
pub fn humanize(err: &eyre::Report) -> String {
    use flatscan_core::{ScanError, SetupError};

    // Typed matches first
    if let Some(se) = err.downcast_ref::<SetupError>() {
        return match se {
            SetupError::ZeroWidth | SetupError::ZeroHeight => {
                "What happened: The requested scan window has no area.\nLikely causes: --width/--height set to 0, or a zeroed [scan] section in the config.\nHow to fix: Pass positive --width and --height (output pixels at the chosen dpi).".to_string()
            }
            SetupError::ResolutionTooHigh => {
                "What happened: Requested resolution is above what the sensor can deliver.\nLikely causes: --dpi larger than sensor.native_dpi in the config.\nHow to fix: Lower --dpi, or fix sensor.native_dpi if it understates your hardware.".to_string()
            }
            SetupError::ResolutionNotDerivable => {
                "What happened: The chip cannot resample the native resolution to the requested one.\nLikely causes: --dpi does not divide the sensor's native dpi (e.g. 500 from 1200).\nHow to fix: Pick an integer divisor of the native resolution, such as 1200, 600, 400, 300, 200, 150 or 100.".to_string()
            }
            SetupError::BadDepth => {
                "What happened: Unsupported sample depth.\nLikely causes: --depth set to something other than 8 or 16.\nHow to fix: Use --depth 8 or --depth 16.".to_string()
            }
            SetupError::Invalid(msg) => format!(
                "What happened: Invalid scan setup ({msg}).\nLikely causes: Window placement or size outside the sensor, or inconsistent config values.\nHow to fix: Check the [scan] and [sensor] sections against the values printed by self-check."
            ),
        };
    }

    if let Some(se) = err.downcast_ref::<ScanError>() {
        return match se {
            ScanError::Busy => {
                "What happened: The device did not become ready in time.\nLikely causes: Carriage still moving from a previous run, lamp warm-up, or a wedged sequencer.\nHow to fix: Wait a few seconds and retry; run `flatscan park` to rehome; power-cycle the unit if it persists.".to_string()
            }
            ScanError::Cancelled => {
                "What happened: The scan was cancelled before the page completed.\nLikely causes: Ctrl-C, or the producer stopped after an error you already saw.\nHow to fix: Re-run the scan. The partial output file is not a valid image.".to_string()
            }
            ScanError::Protocol(msg) => format!(
                "What happened: The device answered in a way the driver does not understand ({msg}).\nLikely causes: Wrong or incompatible scanner model, or a USB transfer glitch.\nHow to fix: Check the device/vid:pid in the config; replug the scanner and retry."
            ),
            ScanError::Io(msg) => format!(
                "What happened: Talking to the device failed ({msg}).\nLikely causes: Cable unplugged mid-run, USB permissions, or a bus reset.\nHow to fix: Check the connection and udev permissions, then retry. Re-run with --log-level=debug for the transfer trace."
            ),
            ScanError::OutOfMemory(what) => format!(
                "What happened: Could not allocate the {what}.\nLikely causes: A very large scan window at 16-bit depth on a small machine.\nHow to fix: Reduce the window size, resolution, or depth."
            ),
            ScanError::State(msg) => format!(
                "What happened: Operation attempted in the wrong order ({msg}).\nLikely causes: See logs.\nHow to fix: Re-run with --log-level=debug or set RUST_LOG for more detail."
            ),
        };
    }

    // String-based heuristics for errors coming from init or config
    let msg = err.to_string();
    let lower = msg.to_ascii_lowercase();

    if lower.contains("access denied") || lower.contains("permission") {
        return "What happened: The scanner was found but could not be opened.\nLikely causes: Insufficient USB permissions for this user.\nHow to fix: Add a udev rule for the device's vid:pid or run with sufficient privileges.".to_string();
    }

    if lower.contains("no matching usb device") || lower.contains("device not found") {
        return "What happened: No scanner matching the configured vid:pid was found.\nLikely causes: Device unplugged or powered off, or wrong [device] values.\nHow to fix: Check the cable and the usb_vid/usb_pid values in the config.".to_string();
    }

    if lower.contains("invalid config") {
        let details = err
            .source()
            .map_or_else(|| msg.clone(), |src| format!("{msg}: {src}"));
        return format!(
            "What happened: Configuration is invalid or incomplete.\nLikely causes: {details}.\nHow to fix: Edit the config file, then rerun. See README for a sample."
        );
    }

    // Gamma CSV header special-case
    if lower.contains("gamma csv must have headers") {
        return "Invalid headers in gamma CSV. Expected 'input,output'.".to_string();
    }

    // Generic fallback
    let mut cause = String::new();
    if let Some(src) = err.source() {
        cause = format!(" Cause: {src}");
    }
    format!(
        "Something went wrong.{cause}\nHow to fix: Re-run with --log-level=debug for details. Original: {msg}"
    )
}

/// Map typed engine errors (if present) to stable exit codes; everything else returns 1.
pub fn exit_code_for_error(err: &eyre::Report) -> i32 {
    use flatscan_core::{ScanError, SetupError};
    if err.downcast_ref::<SetupError>().is_some() {
        return 2;
    }
    if let Some(se) = err.downcast_ref::<ScanError>() {
        return match se {
            ScanError::Busy => 3,
            ScanError::Protocol(_) => 4,
            ScanError::Cancelled => 5,
            ScanError::OutOfMemory(_) => 6,
            ScanError::Io(_) | ScanError::State(_) => 1,
        };
    }
    1
}

/// Structured JSON for errors when --json is enabled.
pub fn format_error_json(err: &eyre::Report) -> String {
    use flatscan_core::ScanError;
    use serde_json::json;

    if let Some(se) = err.downcast_ref::<ScanError>() {
        let msg = humanize(err);
        let reason_name = scan_error_name(se);

        let detail_obj = LAST_SCAN.get().map(|s| {
            json!({
                "dpi": s.dpi,
                "width_px": s.width_px,
                "height_px": s.height_px,
                "depth": s.depth,
            })
        });

        let obj = if let Some(d) = detail_obj {
            json!({ "reason": reason_name, "details": d, "message": msg })
        } else {
            json!({ "reason": reason_name, "message": msg })
        };
        return obj.to_string();
    }

    // Generic error JSON
    json!({ "reason": "Error", "message": humanize(err) }).to_string()
}

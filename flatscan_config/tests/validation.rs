use flatscan_config::{load_toml, ColorModeCfg, DriverCfg, StepDivisionCfg};

#[test]
fn empty_config_uses_defaults_and_validates() {
    let cfg = load_toml("").unwrap();
    assert_eq!(cfg.sensor.native_dpi, 1200);
    assert_eq!(cfg.motor.step_division, StepDivisionCfg::Eighth);
    assert_eq!(cfg.motor.driver, DriverCfg::A3967);
    assert_eq!(cfg.scan.color, ColorModeCfg::Color);
    assert!(cfg.calibration.afe.is_none());
    cfg.validate().unwrap();
}

#[test]
fn rejects_zero_scan_dpi() {
    let toml = r"
[scan]
dpi = 0
";
    let cfg = load_toml(toml).unwrap();
    let err = cfg.validate().unwrap_err();
    assert!(err.to_string().contains("scan.dpi"));
}

#[test]
fn rejects_dpi_above_native() {
    let toml = r"
[sensor]
native_dpi = 600

[scan]
dpi = 1200
";
    let cfg = load_toml(toml).unwrap();
    let err = cfg.validate().unwrap_err();
    assert!(err.to_string().contains("native_dpi"));
}

#[test]
fn rejects_odd_bit_depth() {
    let toml = r"
[scan]
depth = 12
";
    let cfg = load_toml(toml).unwrap();
    let err = cfg.validate().unwrap_err();
    assert!(err.to_string().contains("depth"));
}

#[test]
fn rejects_ramp_longer_than_table_region() {
    let toml = r"
[motor]
accel_steps = 600
";
    let cfg = load_toml(toml).unwrap();
    let err = cfg.validate().unwrap_err();
    assert!(err.to_string().contains("accel_steps"));
}

#[test]
fn rejects_start_period_faster_than_travel() {
    let toml = r"
[motor]
start_speed = 800
travel_speed = 1200
";
    let cfg = load_toml(toml).unwrap();
    let err = cfg.validate().unwrap_err();
    assert!(err.to_string().contains("start_speed"));
}

#[test]
fn rejects_reversed_calibration_band() {
    let toml = r"
[calibration]
white_band = [245, 220]
";
    let cfg = load_toml(toml).unwrap();
    let err = cfg.validate().unwrap_err();
    assert!(err.to_string().contains("white_band"));
}

#[test]
fn rejects_margin_below_alignment() {
    let toml = r"
[sensor]
margin = 8
";
    let cfg = load_toml(toml).unwrap();
    let err = cfg.validate().unwrap_err();
    assert!(err.to_string().contains("margin"));
}

#[test]
fn rejects_vid_without_pid() {
    let toml = r"
[device]
usb_vid = 0x055F
";
    let cfg = load_toml(toml).unwrap();
    let err = cfg.validate().unwrap_err();
    assert!(err.to_string().contains("usb_vid"));
}

#[test]
fn parses_persisted_afe_block() {
    let toml = r"
[calibration.afe]
offsets = [16, 16, 18]
negative = [true, true, true]
gains = [36, 34, 38]
";
    let cfg = load_toml(toml).unwrap();
    cfg.validate().unwrap();
    let afe = cfg.calibration.afe.unwrap();
    assert_eq!(afe.offsets, [16, 16, 18]);
    assert_eq!(afe.negative, [true, true, true]);
    assert_eq!(afe.gains, [36, 34, 38]);
}

#[test]
fn unknown_step_division_fails_to_parse() {
    let toml = r#"
[motor]
step_division = "sixteenth"
"#;
    assert!(load_toml(toml).is_err());
}

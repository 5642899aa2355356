//! Session staging against the chip simulator: what the timing, geometry
//! and arming stages actually program, and the order they enforce.

use flatscan_core::motor::{
    build_step_table, current_phase_table, motor_current_for, scan_speed_for, SEGMENT_LEN,
};
use flatscan_core::{
    advance_carriage, return_home, BitDepth, ColorMode, DeviceHandle, MotorTuning, MoveKind,
    MoveSegment, ScanError, ScanGeometry, ScanPurpose, SensorProfile, SessionConfigurator,
    SessionState,
};
use flatscan_hardware::{SimConfig, SimProbe, SimScanner};
use flatscan_traits::clock::test_clock::TestClock;
use flatscan_traits::proto;

fn open_sim() -> (DeviceHandle<SimScanner>, SimProbe) {
    open_sim_with(SimConfig::default())
}

fn open_sim_with(cfg: SimConfig) -> (DeviceHandle<SimScanner>, SimProbe) {
    let sim = SimScanner::with_config(cfg);
    let probe = sim.probe();
    let dev = DeviceHandle::open_with_clock(sim, Box::new(TestClock::new())).unwrap();
    (dev, probe)
}

fn geometry(dpi: u16, width: u32, color: ColorMode, depth: BitDepth) -> ScanGeometry {
    ScanGeometry {
        dpi,
        origin_x: 0,
        origin_y: 0,
        width_px: width,
        height_px: 32,
        color,
        depth,
    }
}

#[test]
fn geometry_programs_window_ratio_and_pack_buffers() {
    let (mut dev, probe) = open_sim();
    let mut session =
        SessionConfigurator::new(&mut dev, SensorProfile::default(), MotorTuning::default());
    session.configure_timing(600).unwrap();
    session
        .configure_geometry(
            &geometry(600, 100, ColorMode::Color, BitDepth::Sixteen),
            ScanPurpose::Image,
        )
        .unwrap();

    assert_eq!(
        probe.reg16(proto::VALID_PIXELS_LO, proto::VALID_PIXELS_HI),
        128
    );
    assert_eq!(probe.reg16(proto::RATIO_LO, proto::RATIO_HI), 0x4000);
    assert_eq!(
        probe.reg(proto::SCAN_MODE),
        proto::MODE_COLOR | proto::MODE_DEPTH16
    );
    assert_eq!(probe.reg(proto::BYPASS), 0);
    // three contiguous 16-bit pack buffers, one per channel
    assert_eq!(probe.reg24(proto::PACK_ADDR_R_0), 0);
    assert_eq!(probe.reg24(proto::PACK_ADDR_G_0), 256);
    assert_eq!(probe.reg24(proto::PACK_ADDR_B_0), 512);

    let plan = session.plan().unwrap();
    assert_eq!(plan.valid_pixels, 128);
    assert_eq!(plan.raw_line_bytes, 128 * 2 * 3);
    assert_eq!(session.state(), SessionState::GeometryProgrammed);
}

#[test]
fn calibration_frames_bypass_every_correction_stage() {
    let (mut dev, probe) = open_sim();
    let mut session =
        SessionConfigurator::new(&mut dev, SensorProfile::default(), MotorTuning::default());
    session.configure_timing(300).unwrap();
    session
        .configure_geometry(
            &geometry(300, 64, ColorMode::Color, BitDepth::Eight),
            ScanPurpose::Calibration,
        )
        .unwrap();
    assert_eq!(
        probe.reg(proto::BYPASS),
        proto::BYPASS_DARK_SHADING | proto::BYPASS_WHITE_SHADING | proto::BYPASS_GAMMA
    );
}

#[test]
fn timing_set_switches_above_the_split_resolution() {
    let (mut dev, probe) = open_sim();
    let sensor = SensorProfile::default();
    let tuning = MotorTuning::default();

    SessionConfigurator::new(&mut dev, sensor.clone(), tuning.clone())
        .configure_timing(300)
        .unwrap();
    assert_eq!(probe.reg(proto::TIM_CDS1), 0x12);
    assert_eq!(probe.reg16(proto::TIM_MARGIN_LO, proto::TIM_MARGIN_HI), 0x0010);

    SessionConfigurator::new(&mut dev, sensor, tuning)
        .configure_timing(1200)
        .unwrap();
    assert_eq!(probe.reg(proto::TIM_CDS1), 0x09);
    assert_eq!(probe.reg16(proto::TIM_MARGIN_LO, proto::TIM_MARGIN_HI), 0x0030);
}

#[test]
fn stages_enforce_their_order() {
    let (mut dev, _probe) = open_sim();
    let g = geometry(300, 64, ColorMode::Gray, BitDepth::Eight);
    let mut session =
        SessionConfigurator::new(&mut dev, SensorProfile::default(), MotorTuning::default());
    assert_eq!(session.state(), SessionState::Idle);

    let err = session.configure_geometry(&g, ScanPurpose::Image).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ScanError>(),
        Some(ScanError::State(_))
    ));
    let err = session.arm_motor(MoveKind::Forward, 100).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ScanError>(),
        Some(ScanError::State(_))
    ));

    // timing for a different resolution does not satisfy the geometry stage
    session.configure_timing(600).unwrap();
    let err = session.configure_geometry(&g, ScanPurpose::Image).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ScanError>(),
        Some(ScanError::State(_))
    ));

    session.configure_timing(300).unwrap();
    session.configure_geometry(&g, ScanPurpose::Image).unwrap();
    session.arm_motor(MoveKind::Forward, 100).unwrap();
    assert_eq!(session.state(), SessionState::Armed);
}

#[test]
fn arming_uploads_the_motion_tables_and_points_the_sequencer() {
    let (mut dev, probe) = open_sim();
    let tuning = MotorTuning::default();
    {
        let mut session =
            SessionConfigurator::new(&mut dev, SensorProfile::default(), tuning.clone());
        session.configure_timing(300).unwrap();
        session
            .configure_geometry(
                &geometry(300, 64, ColorMode::Gray, BitDepth::Eight),
                ScanPurpose::Image,
            )
            .unwrap();
        session.arm_motor(MoveKind::Forward, 2000).unwrap();
    }

    // the sequencer points at the scan segment of the uploaded table
    let table = build_step_table(&tuning, scan_speed_for(300)).to_bytes();
    let base = probe.reg24(proto::TABLE_ADDR_0) - MoveSegment::ForwardScan.byte_offset();
    assert_eq!(probe.memory(base, table.len()), table);

    let current = motor_current_for(1800);
    let phases = current_phase_table(current, tuning.step_division, tuning.driver).to_bytes();
    let phase_base = probe.reg24(proto::PHASE_TABLE_ADDR_0);
    assert_eq!(probe.memory(phase_base, phases.len()), phases);

    assert_eq!(probe.reg16(proto::FIXED_SPEED_LO, proto::FIXED_SPEED_HI), 1800);
    assert_eq!(probe.reg24(proto::TOTAL_STEPS_0), 2000);
    assert_eq!(
        probe.reg16(proto::ACCEL_STEPS_LO, proto::ACCEL_STEPS_HI),
        tuning.accel_steps
    );
    assert_eq!(
        probe.reg16(proto::DECEL_STEPS_LO, proto::DECEL_STEPS_HI),
        tuning.decel_steps
    );
    assert_eq!(probe.reg(proto::STEP_DIV), tuning.step_division.code());
    assert_eq!(probe.reg(proto::MOTOR_CURRENT), current);
    assert_eq!(probe.reg(proto::MOTOR_FLAGS), 0);
}

#[test]
fn native_resolution_scans_use_the_max_res_segment() {
    let (mut dev, probe) = open_sim();
    let sensor = SensorProfile::default();
    let tuning = MotorTuning::default();

    {
        let mut session = SessionConfigurator::new(&mut dev, sensor.clone(), tuning.clone());
        session.configure_timing(1200).unwrap();
        session
            .configure_geometry(
                &geometry(1200, 64, ColorMode::Gray, BitDepth::Eight),
                ScanPurpose::Image,
            )
            .unwrap();
        session.arm_motor(MoveKind::Forward, 500).unwrap();
    }
    let native_addr = probe.reg24(proto::TABLE_ADDR_0);

    {
        let mut session = SessionConfigurator::new(&mut dev, sensor, tuning);
        session.configure_timing(300).unwrap();
        session
            .configure_geometry(
                &geometry(300, 64, ColorMode::Gray, BitDepth::Eight),
                ScanPurpose::Image,
            )
            .unwrap();
        session.arm_motor(MoveKind::Forward, 500).unwrap();
    }
    let scaled_addr = probe.reg24(proto::TABLE_ADDR_0);

    assert_eq!(native_addr - scaled_addr, (SEGMENT_LEN * 2) as u32);
}

#[test]
fn return_home_seeks_backward_to_the_sensor() {
    let (mut dev, probe) = open_sim_with(SimConfig {
        home_delay_reads: 2,
        ..SimConfig::default()
    });
    return_home(&mut dev, &MotorTuning::default()).unwrap();
    assert_eq!(
        probe.reg(proto::MOTOR_FLAGS),
        proto::MOTOR_DIR_BACKWARD | proto::MOTOR_HOME_SEEK
    );
    assert_eq!(probe.reg24(proto::TOTAL_STEPS_0), 0);
    assert_eq!(probe.reg16(proto::FIXED_SPEED_LO, proto::FIXED_SPEED_HI), 2400);
}

#[test]
fn carriage_advance_runs_the_approach_profile_and_waits_idle() {
    let (mut dev, probe) = open_sim();
    let tuning = MotorTuning::default();
    advance_carriage(&mut dev, &tuning, 320).unwrap();
    assert_eq!(probe.reg24(proto::TOTAL_STEPS_0), 320);
    assert_eq!(probe.reg(proto::MOTOR_FLAGS), 0);
    assert_eq!(
        probe.reg16(proto::FIXED_SPEED_LO, proto::FIXED_SPEED_HI),
        tuning.travel_speed
    );
    // the go pulse reads back as zero once the sequencer latches it
    assert_eq!(probe.reg(proto::MOTOR_CTRL), 0);

    // a zero-step advance is a no-op on the wire
    let before = probe.control_writes();
    advance_carriage(&mut dev, &tuning, 0).unwrap();
    assert_eq!(probe.control_writes(), before);
}

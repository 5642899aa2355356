//! Calibration loops end to end against the chip simulator: offset and
//! gain convergence, the iteration cap, seeding, and the shading build.

use flatscan_core::calib::TUNE_ITERS_MAX;
use flatscan_core::{
    AfeState, CalTargets, Calibrator, DeviceHandle, MotorTuning, SensorProfile, SetupError,
};
use flatscan_hardware::{SimConfig, SimProbe, SimScanner};
use flatscan_traits::clock::test_clock::TestClock;
use flatscan_traits::proto;

const DPI: u16 = 300;
const WIDTH: u32 = 64; // 96 valid pixels after margin and alignment

fn open_sim_with(cfg: SimConfig) -> (DeviceHandle<SimScanner>, SimProbe) {
    let sim = SimScanner::with_config(cfg);
    let probe = sim.probe();
    let dev = DeviceHandle::open_with_clock(sim, Box::new(TestClock::new())).unwrap();
    (dev, probe)
}

fn calibrator(dev: &mut DeviceHandle<SimScanner>) -> Calibrator<'_, SimScanner> {
    Calibrator::new(
        dev,
        SensorProfile::default(),
        MotorTuning::default(),
        CalTargets::default(),
        DPI,
        WIDTH,
    )
}

#[test]
fn in_band_dark_floor_settles_without_touching_the_afe() {
    let (mut dev, probe) = open_sim_with(SimConfig {
        dark_base: [10, 10, 10],
        ..SimConfig::default()
    });
    let mut cal = calibrator(&mut dev);
    assert_eq!(cal.tune_offsets().unwrap(), 1);
    assert_eq!(cal.afe(), &AfeState::default());
    assert_eq!(probe.reg(proto::AFE_OFFSET_R), 0);
    assert_eq!(probe.reg(proto::AFE_OFFSET_SIGN), 0);
}

#[test]
fn offset_loop_pushes_a_high_floor_into_band() {
    let (mut dev, probe) = open_sim_with(SimConfig::default());
    let mut cal = calibrator(&mut dev);
    let iters = cal.tune_offsets().unwrap();

    // floors start at 30/28/32 and walk down in 8-steps until all three
    // land inside the 5..15 band
    assert_eq!(iters, 4);
    assert_eq!(cal.afe().offset_mag, [16, 16, 24]);
    assert_eq!(cal.afe().offset_negative, [true, true, true]);

    assert_eq!(probe.reg(proto::AFE_OFFSET_R), 16);
    assert_eq!(probe.reg(proto::AFE_OFFSET_G), 16);
    assert_eq!(probe.reg(proto::AFE_OFFSET_B), 24);
    assert_eq!(probe.reg(proto::AFE_OFFSET_SIGN), 0b111);
}

#[test]
fn gain_loop_amplifies_to_the_white_band_under_the_lamp() {
    let (mut dev, probe) = open_sim_with(SimConfig {
        white_base: [250, 250, 250],
        ..SimConfig::default()
    });
    let mut cal = calibrator(&mut dev);
    cal.tune_offsets().unwrap();

    let iters = cal.tune_gains().unwrap();
    assert_eq!(iters, 9);
    // unity gain puts the offset-shifted ceiling straight into the band
    assert_eq!(cal.afe().gain, [32, 32, 32]);
    assert_eq!(probe.reg(proto::AFE_GAIN_G), 32);
    assert_eq!(probe.reg(proto::LAMP_CTRL), proto::LAMP_REFLECTIVE);
}

#[test]
fn gain_cap_keeps_the_last_programmed_values() {
    // the stock lamp levels leave the blue ceiling short of the band at
    // every step the cap allows
    let (mut dev, probe) = open_sim_with(SimConfig::default());
    let mut cal = calibrator(&mut dev);
    cal.tune_offsets().unwrap();

    let iters = cal.tune_gains().unwrap();
    assert_eq!(iters, TUNE_ITERS_MAX);
    assert_eq!(cal.afe().gain, [36, 32, 40]);
    assert_eq!(probe.reg(proto::AFE_GAIN_B), 40);
}

#[test]
fn full_run_lands_offsets_gains_and_a_shading_table() {
    let (mut dev, probe) = open_sim_with(SimConfig {
        white_base: [250, 250, 250],
        ..SimConfig::default()
    });
    let mut cal = calibrator(&mut dev);
    let table = cal.run().unwrap();
    assert_eq!(table.valid_pixels(), 96);

    // the refinement pass nudges red two tighter after gain tuning
    let afe = cal.afe().clone();
    assert_eq!(afe.offset_mag, [18, 16, 24]);
    assert_eq!(afe.offset_negative, [true, true, true]);
    assert_eq!(afe.gain, [32, 32, 32]);
    for ch in 0..3u16 {
        assert_eq!(
            probe.reg(proto::AFE_OFFSET_R + ch),
            afe.offset_mag[ch as usize]
        );
        assert_eq!(probe.reg(proto::AFE_GAIN_R + ch), afe.gain[ch as usize]);
    }

    // per-column entries reproduce the reference-frame statistics
    for (ch, col) in [(0usize, 0u32), (1, 7), (2, 50)] {
        let mut dcol: Vec<u8> = (0..40).map(|row| probe.dark_level(ch as u8, col, row)).collect();
        let mut wcol: Vec<u8> = (0..40).map(|row| probe.white_level(ch as u8, col, row)).collect();
        dcol.sort_unstable();
        wcol.sort_unstable();
        let dark = dcol[8..12].iter().map(|&v| u32::from(v)).sum::<u32>() / 4;
        let white = wcol[28..32].iter().map(|&v| u32::from(v)).sum::<u32>() / 4;
        let spread = (white - dark).max(1);
        let gain = (250 * 4096 / spread).min(u32::from(u16::MAX)) as u16;

        let e = table.entry(ch, col as usize);
        assert_eq!(e.dark, ((dark as u16) << 8) | dark as u16);
        assert_eq!(e.gain, gain);
    }

    // the table the chip sees is the table the caller got back
    let bytes = table.to_bytes();
    let shading_addr = probe.reg24(proto::SHADING_ADDR_0);
    assert_eq!(probe.memory(shading_addr, bytes.len()), bytes);
}

#[test]
fn seeding_programs_the_persisted_state_up_front() {
    let (mut dev, probe) = open_sim_with(SimConfig::default());
    let mut cal = calibrator(&mut dev);
    let state = AfeState {
        offset_mag: [5, 6, 7],
        offset_negative: [true, false, true],
        gain: [1, 2, 3],
    };
    cal.seed_afe(state.clone()).unwrap();
    assert_eq!(cal.afe(), &state);
    assert_eq!(probe.reg(proto::AFE_OFFSET_G), 6);
    assert_eq!(probe.reg(proto::AFE_OFFSET_SIGN), 0b101);
    assert_eq!(probe.reg(proto::AFE_GAIN_B), 3);
}

#[test]
fn too_narrow_a_window_is_rejected_before_any_capture() {
    let (mut dev, probe) = open_sim_with(SimConfig::default());
    // 10 px plus the 32 px margin aligns down to 32 valid pixels, not
    // enough for the segment metrics once the edges are skipped
    let mut cal = Calibrator::new(
        &mut dev,
        SensorProfile::default(),
        MotorTuning::default(),
        CalTargets::default(),
        DPI,
        10,
    );
    let writes_before = probe.control_writes();
    let err = cal.tune_offsets().unwrap_err();
    assert!(matches!(
        err.downcast_ref::<SetupError>(),
        Some(SetupError::Invalid(_))
    ));
    let err = cal.build_shading().unwrap_err();
    assert!(err.downcast_ref::<SetupError>().is_some());
    // rejected up front, the device never saw a capture
    assert_eq!(probe.control_writes(), writes_before);
}

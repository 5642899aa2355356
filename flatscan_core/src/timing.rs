//! Sensor/AFE phase timing constants.
//!
//! Two empirical sets cover the chip's pixel clock regimes: one for
//! physical resolutions up to 600 dpi, one above. The values are tuning
//! data measured against the sensor, carried here as opaque constants and
//! programmed wholesale by the session layer.

/// Physical dpi at and below which the slow-clock set applies.
pub const TIMING_SPLIT_DPI: u16 = 600;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingSet {
    pub ph1_rise: u8,
    pub ph1_fall: u8,
    pub ph2_rise: u8,
    pub ph2_fall: u8,
    pub cds1: u8,
    pub cds2: u8,
    pub sample_point: u8,
    pub dummy_cycles: u16,
    pub margin: u16,
}

pub const LOW_RES: TimingSet = TimingSet {
    ph1_rise: 0x08,
    ph1_fall: 0x2C,
    ph2_rise: 0x30,
    ph2_fall: 0x5A,
    cds1: 0x12,
    cds2: 0x3E,
    sample_point: 0x4B,
    dummy_cycles: 0x0020,
    margin: 0x0010,
};

pub const HIGH_RES: TimingSet = TimingSet {
    ph1_rise: 0x04,
    ph1_fall: 0x16,
    ph2_rise: 0x18,
    ph2_fall: 0x2D,
    cds1: 0x09,
    cds2: 0x1F,
    sample_point: 0x26,
    dummy_cycles: 0x0008,
    margin: 0x0030,
};

/// Select the timing set for a physical resolution.
#[must_use]
pub fn timing_for(physical_dpi: u16) -> &'static TimingSet {
    if physical_dpi <= TIMING_SPLIT_DPI {
        &LOW_RES
    } else {
        &HIGH_RES
    }
}

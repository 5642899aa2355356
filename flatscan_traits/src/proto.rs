//! Register dictionary of the scan controller, shared by the engine and by
//! link-level chip models so both sides speak the same map.
//!
//! The register space is three 256-byte banks; the high byte of a register
//! address selects the bank, the low byte the offset within it. Bank
//! selection is a separate control request and the chip latches the last
//! selected bank.

/// Vendor control request: write one register in the current bank.
/// `value` carries the register value, `index` the in-bank offset.
pub const REQ_REG_WRITE: u8 = 0xB0;
/// Vendor control request: read one register from the current bank.
pub const REQ_REG_READ: u8 = 0xB1;
/// Vendor control request: latch the register bank in `value`.
pub const REQ_BANK_SELECT: u8 = 0xB2;

/// Number of register banks the chip exposes.
pub const BANK_COUNT: u8 = 3;

/// Bytes of the acknowledge read the chip expects after every bulk write.
pub const ACK_LEN: usize = 2;

/// Bank component of a full register address.
#[must_use]
pub const fn bank_of(reg: u16) -> u8 {
    (reg >> 8) as u8
}

/// In-bank offset component of a full register address.
#[must_use]
pub const fn offset_of(reg: u16) -> u8 {
    (reg & 0x00FF) as u8
}

// ---- bank 0: system ----

pub const CHIP_ID: u16 = 0x0000;
/// Value `CHIP_ID` reads back on a healthy part.
pub const CHIP_ID_VALUE: u8 = 0x53;

pub const STATUS: u16 = 0x0001;
pub const STATUS_READY: u8 = 0x01;
pub const STATUS_HOME: u8 = 0x02;
pub const STATUS_SCANNING: u8 = 0x04;
pub const STATUS_MOTOR_RUNNING: u8 = 0x08;

pub const SYS_CTRL: u16 = 0x0002;
pub const SYS_SCAN_START: u8 = 0x01;
pub const SYS_SCAN_STOP: u8 = 0x02;

pub const FIFO_CTRL: u16 = 0x0003;
pub const FIFO_CLEAR: u8 = 0x01;

pub const DMA_SIZE_LO: u16 = 0x0004;
pub const DMA_SIZE_HI: u16 = 0x0005;

pub const MEM_ADDR_0: u16 = 0x0008;
pub const MEM_ADDR_1: u16 = 0x0009;
pub const MEM_ADDR_2: u16 = 0x000A;

pub const LAMP_CTRL: u16 = 0x000B;
pub const LAMP_OFF: u8 = 0x00;
pub const LAMP_REFLECTIVE: u8 = 0x01;
pub const LAMP_TRANSPARENCY: u8 = 0x02;

pub const POWER_CTRL: u16 = 0x000C;
pub const POWER_AFE_STANDBY: u8 = 0x01;

// ---- bank 1: analog front end and geometry ----

pub const AFE_OFFSET_R: u16 = 0x0100;
pub const AFE_OFFSET_G: u16 = 0x0101;
pub const AFE_OFFSET_B: u16 = 0x0102;
/// Bits 0..2 flag a negative offset for R, G, B respectively.
pub const AFE_OFFSET_SIGN: u16 = 0x0103;
pub const AFE_GAIN_R: u16 = 0x0104;
pub const AFE_GAIN_G: u16 = 0x0105;
pub const AFE_GAIN_B: u16 = 0x0106;
/// Largest programmable gain code (6-bit PGA).
pub const AFE_GAIN_MAX: u8 = 0x3F;

pub const SCAN_MODE: u16 = 0x0107;
pub const MODE_COLOR: u8 = 0x01;
pub const MODE_DEPTH16: u8 = 0x02;

pub const BYPASS: u16 = 0x0108;
pub const BYPASS_DARK_SHADING: u8 = 0x01;
pub const BYPASS_WHITE_SHADING: u8 = 0x02;
pub const BYPASS_GAMMA: u8 = 0x04;

pub const VALID_PIXELS_LO: u16 = 0x0109;
pub const VALID_PIXELS_HI: u16 = 0x010A;

/// Q15 resampling ratio; 0x8000 is unity (native resolution).
pub const RATIO_LO: u16 = 0x010B;
pub const RATIO_HI: u16 = 0x010C;
pub const RATIO_UNITY_Q15: u16 = 0x8000;

/// Three 24-bit per-channel pack base addresses, little-endian, R then G
/// then B, 0x010D through 0x0115.
pub const PACK_ADDR_R_0: u16 = 0x010D;
pub const PACK_ADDR_G_0: u16 = 0x0110;
pub const PACK_ADDR_B_0: u16 = 0x0113;

pub const SHADING_ADDR_0: u16 = 0x0116;
pub const SHADING_ADDR_1: u16 = 0x0117;
pub const SHADING_ADDR_2: u16 = 0x0118;

// Sensor/AFE phase timing block, programmed wholesale from a TimingSet.
pub const TIM_PH1_RISE: u16 = 0x0120;
pub const TIM_PH1_FALL: u16 = 0x0121;
pub const TIM_PH2_RISE: u16 = 0x0122;
pub const TIM_PH2_FALL: u16 = 0x0123;
pub const TIM_CDS1: u16 = 0x0124;
pub const TIM_CDS2: u16 = 0x0125;
pub const TIM_SAMPLE_POINT: u16 = 0x0126;
pub const TIM_DUMMY_LO: u16 = 0x0127;
pub const TIM_DUMMY_HI: u16 = 0x0128;
pub const TIM_MARGIN_LO: u16 = 0x0129;
pub const TIM_MARGIN_HI: u16 = 0x012A;

// ---- bank 2: motor ----

pub const MOTOR_CTRL: u16 = 0x0200;
pub const MOTOR_GO: u8 = 0x01;
pub const MOTOR_STOP: u8 = 0x02;

pub const MOTOR_FLAGS: u16 = 0x0201;
pub const MOTOR_DIR_BACKWARD: u8 = 0x01;
pub const MOTOR_BACKTRACK: u8 = 0x02;
pub const MOTOR_HOME_SEEK: u8 = 0x04;

pub const ACCEL_STEPS_LO: u16 = 0x0202;
pub const ACCEL_STEPS_HI: u16 = 0x0203;
pub const DECEL_STEPS_LO: u16 = 0x0204;
pub const DECEL_STEPS_HI: u16 = 0x0205;
pub const FIXED_SPEED_LO: u16 = 0x0206;
pub const FIXED_SPEED_HI: u16 = 0x0207;

pub const TOTAL_STEPS_0: u16 = 0x0208;
pub const TOTAL_STEPS_1: u16 = 0x0209;
pub const TOTAL_STEPS_2: u16 = 0x020A;

pub const TABLE_ADDR_0: u16 = 0x020B;
pub const TABLE_ADDR_1: u16 = 0x020C;
pub const TABLE_ADDR_2: u16 = 0x020D;

/// 0 full, 1 half, 2 quarter, 3 eighth step.
pub const STEP_DIV: u16 = 0x020E;
pub const MOTOR_CURRENT: u16 = 0x020F;

pub const PHASE_TABLE_ADDR_0: u16 = 0x0210;
pub const PHASE_TABLE_ADDR_1: u16 = 0x0211;
pub const PHASE_TABLE_ADDR_2: u16 = 0x0212;

#[cfg(test)]
mod bank_split_tests {
    use super::*;

    #[test]
    fn splits_address_into_bank_and_offset() {
        assert_eq!(bank_of(AFE_GAIN_G), 1);
        assert_eq!(offset_of(AFE_GAIN_G), 0x05);
        assert_eq!(bank_of(CHIP_ID), 0);
        assert_eq!(bank_of(MOTOR_CTRL), 2);
    }

    #[test]
    fn every_bank_is_addressable() {
        for bank in 0..BANK_COUNT {
            let reg = u16::from(bank) << 8;
            assert_eq!(bank_of(reg), bank);
        }
    }
}

//! Small pure helpers shared across the engine.

/// Pixel alignment the chip's packing unit works in.
pub const PIXEL_ALIGN: u32 = 16;

/// Round `v` down to the chip's pixel alignment.
#[inline]
#[must_use]
pub fn round_down_align(v: u32) -> u32 {
    v & !(PIXEL_ALIGN - 1)
}

/// Little-endian byte pair of a 16-bit register value.
#[inline]
#[must_use]
pub fn le16(v: u16) -> [u8; 2] {
    [(v & 0xFF) as u8, (v >> 8) as u8]
}

/// Little-endian byte triple of a 24-bit device-memory address.
#[inline]
#[must_use]
pub fn le24(v: u32) -> [u8; 3] {
    [(v & 0xFF) as u8, ((v >> 8) & 0xFF) as u8, ((v >> 16) & 0xFF) as u8]
}

/// Average of two samples rounded to nearest, ties up. Cannot overflow.
#[inline]
#[must_use]
pub fn avg2_round_nearest_u16(a: u16, b: u16) -> u16 {
    ((u32::from(a) + u32::from(b) + 1) / 2) as u16
}

#[cfg(test)]
mod align_tests {
    use super::*;

    #[test]
    fn rounds_down_to_sixteen() {
        assert_eq!(round_down_align(0), 0);
        assert_eq!(round_down_align(15), 0);
        assert_eq!(round_down_align(16), 16);
        assert_eq!(round_down_align(2601), 2592);
    }
}

#[cfg(test)]
mod le_tests {
    use super::*;

    #[test]
    fn le16_orders_low_byte_first() {
        assert_eq!(le16(0x1234), [0x34, 0x12]);
    }

    #[test]
    fn le24_covers_full_range() {
        assert_eq!(le24(0), [0, 0, 0]);
        assert_eq!(le24(0x0A_BC_DE), [0xDE, 0xBC, 0x0A]);
    }
}

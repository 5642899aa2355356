//! 16-bit gamma lookup applied per sample on the consumer side.

use crate::error::{Result, ScanError, SetupError};

/// Table entries; every 16-bit sample indexes directly.
pub const GAMMA_ENTRIES: usize = 1 << 16;

pub struct GammaTable {
    lut: Box<[u16]>,
}

impl GammaTable {
    /// Pass-through table.
    pub fn identity() -> Result<Self> {
        let mut lut = try_alloc()?;
        for (i, slot) in lut.iter_mut().enumerate() {
            *slot = i as u16;
        }
        Ok(Self {
            lut: lut.into_boxed_slice(),
        })
    }

    /// Standard display curve `out = in^(1/gamma)`. Gamma 1.0 is identity.
    pub fn from_exponent(gamma: f32) -> Result<Self> {
        if !gamma.is_finite() || gamma <= 0.0 {
            return Err(SetupError::Invalid("gamma must be a positive number").into());
        }
        if (gamma - 1.0).abs() < 1e-6 {
            return Self::identity();
        }
        let inv = f64::from(1.0 / gamma);
        let top = (GAMMA_ENTRIES - 1) as f64;
        let mut lut = try_alloc()?;
        for (i, slot) in lut.iter_mut().enumerate() {
            let v = (i as f64 / top).powf(inv) * top;
            *slot = v.round().clamp(0.0, top) as u16;
        }
        Ok(Self {
            lut: lut.into_boxed_slice(),
        })
    }

    /// Piecewise-linear curve through `(input, output)` control points.
    /// Inputs must be strictly increasing; the curve extends flat beyond
    /// the first and last point.
    pub fn from_curve(points: &[(u16, u16)]) -> Result<Self> {
        if points.len() < 2 {
            return Err(SetupError::Invalid("gamma curve needs at least two points").into());
        }
        if points.windows(2).any(|w| w[0].0 >= w[1].0) {
            return Err(SetupError::Invalid("gamma curve inputs must strictly increase").into());
        }
        let mut lut = try_alloc()?;
        let mut seg = 0usize;
        for (i, slot) in lut.iter_mut().enumerate() {
            let x = i as u16;
            *slot = if x <= points[0].0 {
                points[0].1
            } else if x >= points[points.len() - 1].0 {
                points[points.len() - 1].1
            } else {
                while points[seg + 1].0 < x {
                    seg += 1;
                }
                let (x0, y0) = points[seg];
                let (x1, y1) = points[seg + 1];
                let t = f64::from(x - x0) / f64::from(x1 - x0);
                (f64::from(y0) + t * (f64::from(y1) - f64::from(y0))).round() as u16
            };
        }
        Ok(Self {
            lut: lut.into_boxed_slice(),
        })
    }

    #[inline]
    #[must_use]
    pub fn apply(&self, sample: u16) -> u16 {
        self.lut[usize::from(sample)]
    }
}

fn try_alloc() -> Result<Vec<u16>> {
    let mut v = Vec::new();
    v.try_reserve_exact(GAMMA_ENTRIES)
        .map_err(|_| ScanError::OutOfMemory("gamma table"))?;
    v.resize(GAMMA_ENTRIES, 0);
    Ok(v)
}

#[cfg(test)]
mod gamma_tests {
    use super::*;

    #[test]
    fn identity_maps_every_sample_to_itself() {
        let g = GammaTable::identity().unwrap();
        assert_eq!(g.apply(0), 0);
        assert_eq!(g.apply(0x8000), 0x8000);
        assert_eq!(g.apply(u16::MAX), u16::MAX);
    }

    #[test]
    fn exponent_curve_lifts_midtones_and_fixes_endpoints() {
        let g = GammaTable::from_exponent(2.2).unwrap();
        assert_eq!(g.apply(0), 0);
        assert_eq!(g.apply(u16::MAX), u16::MAX);
        assert!(g.apply(0x8000) > 0x8000);
    }

    #[test]
    fn rejects_non_positive_gamma() {
        assert!(GammaTable::from_exponent(0.0).is_err());
        assert!(GammaTable::from_exponent(f32::NAN).is_err());
    }

    #[test]
    fn curve_interpolates_between_points() {
        let g = GammaTable::from_curve(&[(0, 0), (100, 200), (65535, 65535)]).unwrap();
        assert_eq!(g.apply(0), 0);
        assert_eq!(g.apply(50), 100);
        assert_eq!(g.apply(100), 200);
    }

    #[test]
    fn curve_rejects_unsorted_points() {
        assert!(GammaTable::from_curve(&[(10, 0), (10, 5)]).is_err());
        assert!(GammaTable::from_curve(&[(0, 0)]).is_err());
    }
}

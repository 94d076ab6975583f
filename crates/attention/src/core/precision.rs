//! Numeric precisions exercised by the comparison suite.
//!
//! Each [`Precision`] maps onto a candle [`DType`] and carries the acceptance
//! band used when fused results are compared against the reference. Lower
//! precisions get wider bands since their storage rounding dominates.

use std::{fmt, str::FromStr};

use candle_core::DType;
use serde::Deserialize;

/// Acceptance band for element-wise comparisons.
///
/// An element passes when `|actual - expected| <= atol + rtol * |expected|`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tolerance {
    pub rtol: f64,
    pub atol: f64,
}

impl Tolerance {
    pub fn new(rtol: f64, atol: f64) -> Self {
        Self { rtol, atol }
    }

    /// Whether `actual` lies inside the band around `expected`. NaN never
    /// does; infinities only match an infinity of the same sign.
    pub fn accepts(&self, actual: f32, expected: f32) -> bool {
        if actual == expected {
            return true;
        }
        let diff = (actual as f64 - expected as f64).abs();
        diff <= self.atol + self.rtol * (expected as f64).abs()
    }
}

/// Floating point formats accepted by the attention kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    Float32,
    Float16,
    Bfloat16,
}

impl Precision {
    pub const ALL: [Precision; 3] = [Precision::Float32, Precision::Float16, Precision::Bfloat16];

    pub fn dtype(self) -> DType {
        match self {
            Precision::Float32 => DType::F32,
            Precision::Float16 => DType::F16,
            Precision::Bfloat16 => DType::BF16,
        }
    }

    pub fn from_dtype(dtype: DType) -> Option<Self> {
        match dtype {
            DType::F32 => Some(Precision::Float32),
            DType::F16 => Some(Precision::Float16),
            DType::BF16 => Some(Precision::Bfloat16),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Precision::Float32 => "float32",
            Precision::Float16 => "float16",
            Precision::Bfloat16 => "bfloat16",
        }
    }

    /// Default comparison band for this precision.
    pub fn tolerance(self) -> Tolerance {
        match self {
            Precision::Float32 => Tolerance::new(1e-3, 1e-3),
            Precision::Float16 => Tolerance::new(5e-3, 5e-3),
            Precision::Bfloat16 => Tolerance::new(1e-1, 1e-1),
        }
    }
}

impl fmt::Display for Precision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Precision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "float32" | "fp32" | "f32" => Ok(Precision::Float32),
            "float16" | "fp16" | "f16" => Ok(Precision::Float16),
            "bfloat16" | "bf16" => Ok(Precision::Bfloat16),
            other => Err(format!(
                "unknown precision '{other}', expected float32, float16 or bfloat16"
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dtype_mapping_round_trips() {
        for precision in Precision::ALL {
            assert_eq!(Precision::from_dtype(precision.dtype()), Some(precision));
        }
        assert_eq!(Precision::from_dtype(DType::F64), None);
    }

    #[test]
    fn tolerances_widen_with_lower_precision() {
        let f32_tol = Precision::Float32.tolerance();
        let f16_tol = Precision::Float16.tolerance();
        let bf16_tol = Precision::Bfloat16.tolerance();
        assert_eq!(f32_tol, Tolerance::new(1e-3, 1e-3));
        assert!(f16_tol.atol > f32_tol.atol);
        assert!(bf16_tol.rtol > f16_tol.rtol);
    }

    #[test]
    fn parses_aliases() {
        assert_eq!("bf16".parse::<Precision>().unwrap(), Precision::Bfloat16);
        assert_eq!(" Float16 ".parse::<Precision>().unwrap(), Precision::Float16);
        assert!("int8".parse::<Precision>().is_err());
    }

    #[test]
    fn tolerance_band_is_relative_to_expected() {
        let tol = Tolerance::new(0.1, 0.0);
        assert!(tol.accepts(10.9, 10.0));
        assert!(!tol.accepts(11.1, 10.0));
        assert!(!tol.accepts(f32::NAN, 1.0));
    }

    #[test]
    fn matching_infinities_are_accepted() {
        let tol = Tolerance::new(1e-3, 1e-3);
        assert!(tol.accepts(f32::INFINITY, f32::INFINITY));
        assert!(tol.accepts(f32::NEG_INFINITY, f32::NEG_INFINITY));
        assert!(!tol.accepts(f32::INFINITY, f32::NEG_INFINITY));
        assert!(!tol.accepts(f32::INFINITY, 1.0));
        assert!(!tol.accepts(f32::NAN, f32::NAN));
    }
}

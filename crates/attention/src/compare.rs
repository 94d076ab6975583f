//! Element-wise comparison of tensors in the style of `assert_allclose`.
//!
//! Both sides are promoted to `f32` before any arithmetic so reduced precision
//! results are compared on equal footing.

use candle_core::{DType, Tensor};

use crate::core::{CheckError, Tolerance};

/// Summary of the element-wise differences between two tensors.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct DiffStats {
    pub max_abs: f32,
    pub mean_abs: f32,
    /// Largest `|actual - expected| / max(|expected|, 1e-5)`.
    pub max_rel: f32,
}

fn to_f32_vec(tensor: &Tensor) -> Result<Vec<f32>, CheckError> {
    Ok(tensor.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?)
}

/// Fail with [`CheckError::ShapeMismatch`] unless `tensor` has shape `expected`.
pub fn expect_shape(what: &str, tensor: &Tensor, expected: &[usize]) -> Result<(), CheckError> {
    if tensor.dims() == expected {
        Ok(())
    } else {
        Err(CheckError::ShapeMismatch {
            what: what.to_string(),
            expected: expected.to_vec(),
            actual: tensor.dims().to_vec(),
        })
    }
}

pub fn diff_stats(what: &str, actual: &Tensor, expected: &Tensor) -> Result<DiffStats, CheckError> {
    expect_shape(what, actual, expected.dims())?;
    let actual = to_f32_vec(actual)?;
    let expected = to_f32_vec(expected)?;
    Ok(stats_of(&actual, &expected))
}

fn stats_of(actual: &[f32], expected: &[f32]) -> DiffStats {
    if actual.is_empty() {
        return DiffStats::default();
    }
    let mut stats = DiffStats::default();
    let mut total = 0f64;
    for (a, e) in actual.iter().zip(expected) {
        let abs = if a == e { 0.0 } else { (a - e).abs() };
        let rel = abs / e.abs().max(1e-5);
        // NaN and inf must surface in the summary, so no `f32::max` here.
        if abs.is_nan() || abs > stats.max_abs {
            stats.max_abs = abs;
        }
        if rel.is_nan() || rel > stats.max_rel {
            stats.max_rel = rel;
        }
        total += abs as f64;
    }
    stats.mean_abs = (total / actual.len() as f64) as f32;
    stats
}

/// Check `actual` against `expected` within `tol` and return the diff summary.
///
/// Shapes must match exactly. Any element outside the band, or NaN on either
/// side, fails the whole comparison with [`CheckError::NotClose`].
pub fn assert_allclose(
    what: &str,
    actual: &Tensor,
    expected: &Tensor,
    tol: Tolerance,
) -> Result<DiffStats, CheckError> {
    expect_shape(what, actual, expected.dims())?;
    let actual = to_f32_vec(actual)?;
    let expected = to_f32_vec(expected)?;
    let stats = stats_of(&actual, &expected);

    let mut mismatched = 0usize;
    let mut worst_index = 0usize;
    let mut worst_excess = f64::NEG_INFINITY;
    for (index, (a, e)) in actual.iter().zip(&expected).enumerate() {
        if tol.accepts(*a, *e) {
            continue;
        }
        mismatched += 1;
        let bound = tol.atol + tol.rtol * (*e as f64).abs();
        let excess = (*a as f64 - *e as f64).abs() - bound;
        let excess = if excess.is_nan() { f64::INFINITY } else { excess };
        if excess > worst_excess {
            worst_excess = excess;
            worst_index = index;
        }
    }

    if mismatched == 0 {
        Ok(stats)
    } else {
        Err(CheckError::NotClose {
            what: what.to_string(),
            mismatched,
            total: actual.len(),
            worst_index,
            max_abs: stats.max_abs,
            max_rel: stats.max_rel,
            rtol: tol.rtol,
            atol: tol.atol,
        })
    }
}

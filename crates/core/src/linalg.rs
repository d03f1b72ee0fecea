//! Small dense linear-algebra helpers shared by kriging and the Kalman update

use crate::error::{AssimilationError, Result};
use nalgebra::DMatrix;

/// 2-norm condition number σ_max / σ_min (infinite when singular)
pub fn condition_number(m: &DMatrix<f64>) -> f64 {
    if m.is_empty() {
        return 1.0;
    }
    let sv = m.clone().svd(false, false).singular_values;
    let max = sv.max();
    let min = sv.min();
    if min <= 0.0 || !min.is_finite() {
        f64::INFINITY
    } else {
        max / min
    }
}

/// Inverse of `m`, refusing matrices whose condition number exceeds `max_condition`
///
/// Returns the inverse together with the condition number so callers can
/// record it.
///
/// # Errors
/// Returns `NumericalInstability` when `m` is singular or ill-conditioned
pub fn checked_inverse(
    m: &DMatrix<f64>,
    max_condition: f64,
    context: &'static str,
) -> Result<(DMatrix<f64>, f64)> {
    let condition_number = condition_number(m);
    if condition_number.is_nan() || condition_number > max_condition {
        return Err(AssimilationError::NumericalInstability {
            context,
            condition_number,
        });
    }
    let inverse = m
        .clone()
        .try_inverse()
        .ok_or(AssimilationError::NumericalInstability {
            context,
            condition_number,
        })?;
    Ok((inverse, condition_number))
}

/// Replace `m` by `(m + mᵀ) / 2`
pub fn symmetrize(m: &mut DMatrix<f64>) {
    let n = m.nrows();
    for i in 0..n {
        for j in (i + 1)..n {
            let avg = 0.5 * (m[(i, j)] + m[(j, i)]);
            m[(i, j)] = avg;
            m[(j, i)] = avg;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_condition_number_of_diagonal() {
        let m = DMatrix::from_diagonal(&nalgebra::DVector::from_vec(vec![4.0, 2.0, 0.5]));
        assert_relative_eq!(condition_number(&m), 8.0, epsilon = 1e-10);
    }

    #[test]
    fn test_singular_rejected() {
        let m = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 2.0, 4.0]);
        let err = checked_inverse(&m, 1e12, "test").unwrap_err();
        assert!(matches!(
            err,
            AssimilationError::NumericalInstability { context: "test", .. }
        ));
    }

    #[test]
    fn test_inverse_round_trip() {
        let m = DMatrix::from_row_slice(2, 2, &[2.0, 0.5, 0.5, 1.0]);
        let (inv, cond) = checked_inverse(&m, 1e12, "test").unwrap();
        assert!(cond >= 1.0);
        let id = &m * &inv;
        assert_relative_eq!(id, DMatrix::identity(2, 2), epsilon = 1e-12);
    }

    #[test]
    fn test_symmetrize() {
        let mut m = DMatrix::from_row_slice(2, 2, &[1.0, 0.2, 0.4, 1.0]);
        symmetrize(&mut m);
        assert_relative_eq!(m[(0, 1)], 0.3);
        assert_eq!(m, m.transpose());
    }
}

//! Distance-based correlation of moisture residuals
//!
//! Empirical linear law calibrated on station residuals:
//!
//! ρ(d) = max(0, a − b·d)
//!
//! with d the great-circle distance in km. The zero floor keeps distant
//! pairs uncorrelated rather than anti-correlated.

use crate::config::CorrelationConfig;
use crate::core_types::great_circle_distance;
use nalgebra::DMatrix;

/// Linear distance-correlation law
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpatialCorrelationModel {
    base: f64,
    slope_per_km: f64,
}

impl Default for SpatialCorrelationModel {
    fn default() -> Self {
        Self::from_config(&CorrelationConfig::default())
    }
}

impl SpatialCorrelationModel {
    /// Create the law `max(0, base - slope_per_km * d)`
    pub fn new(base: f64, slope_per_km: f64) -> Self {
        Self { base, slope_per_km }
    }

    /// Build from the configuration section
    pub fn from_config(config: &CorrelationConfig) -> Self {
        Self::new(config.base, config.slope_per_km)
    }

    /// Correlation at zero distance
    pub fn base(&self) -> f64 {
        self.base
    }

    /// Correlation at distance `km`
    #[inline]
    pub fn correlation_at(&self, km: f64) -> f64 {
        (self.base - self.slope_per_km * km).max(0.0)
    }

    /// Correlation between two lon/lat points
    #[inline]
    pub fn correlation(&self, a: (f64, f64), b: (f64, f64)) -> f64 {
        self.correlation_at(great_circle_distance(a.0, a.1, b.0, b.1))
    }

    /// N×N correlation matrix over lon/lat points
    ///
    /// Only the upper triangle is evaluated; the matrix is symmetric by
    /// construction and its diagonal equals [`base`](Self::base).
    pub fn correlation_matrix(&self, points: &[(f64, f64)]) -> DMatrix<f64> {
        let n = points.len();
        let mut c = DMatrix::zeros(n, n);
        for i in 0..n {
            c[(i, i)] = self.base;
            for j in (i + 1)..n {
                let rho = self.correlation(points[i], points[j]);
                c[(i, j)] = rho;
                c[(j, i)] = rho;
            }
        }
        c
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stations() -> Vec<(f64, f64)> {
        vec![
            (-116.60, 33.08),
            (-116.75, 33.02),
            (-116.52, 32.86),
            (-117.10, 32.87),
            (-114.00, 35.00),
        ]
    }

    #[test]
    fn test_diagonal_is_base() {
        let model = SpatialCorrelationModel::default();
        let c = model.correlation_matrix(&stations());
        for i in 0..c.nrows() {
            assert_eq!(c[(i, i)], 0.8565);
        }
    }

    #[test]
    fn test_symmetric_and_non_negative() {
        let model = SpatialCorrelationModel::default();
        let c = model.correlation_matrix(&stations());
        assert_eq!(c, c.transpose());
        assert!(c.iter().all(|&v| v >= 0.0));
        // ~400 km away: floored at zero
        assert_eq!(c[(0, 4)], 0.0);
    }

    #[test]
    fn test_non_increasing_in_distance() {
        let model = SpatialCorrelationModel::default();
        let mut previous = model.correlation_at(0.0);
        for step in 1..400 {
            let rho = model.correlation_at(f64::from(step) * 0.5);
            assert!(rho <= previous, "correlation rose at {} km", f64::from(step) * 0.5);
            previous = rho;
        }
    }

    #[test]
    fn test_zero_beyond_cutoff() {
        let model = SpatialCorrelationModel::default();
        let cutoff = 0.8565 / 0.0063;
        assert!(model.correlation_at(cutoff - 1.0) > 0.0);
        assert_eq!(model.correlation_at(cutoff + 1.0), 0.0);
    }
}

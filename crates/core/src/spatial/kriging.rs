//! Simple kriging of station observations onto the model grid
//!
//! Simple kriging with a known, non-zero trend: the mean-field prediction
//! supplies the deterministic trend both at the stations and at every grid
//! point, and only the residual `observed − trend` is interpolated.
//!
//! Covariance model between two locations p, q:
//!
//! ```text
//! cov(p, q) = σ_p · ρ(d(p, q)) · σ_q
//! ```
//!
//! where σ is the model residual standard deviation field and ρ the
//! [`SpatialCorrelationModel`]. The observation covariance adds each
//! observation's error variance η² on the diagonal:
//!
//! ```text
//! Σ = D·C·D + diag(η²)        D = diag(σ at each station's grid cell)
//! w(p) = Σ⁻¹ · c(p)           c_k(p) = σ_p · ρ(d(p, k)) · σ_k
//! K(p) = trend(p) + w(p)ᵀ · r r_k = obs_k − trend(station cell k)
//! V(p) = ρ(0)·σ_p² − w(p)ᵀ · c(p)
//! ```
//!
//! Cost is O(N_obs³) for the inversion plus O(N_grid · N_obs²) for the
//! per-point pass, which runs in parallel over grid cells.

use super::correlation::SpatialCorrelationModel;
use crate::assimilation::diagnostics::{
    Diagnostics, TAG_SKDM_COV_COND, TAG_SKDM_NEGATIVE_VARIANCE,
};
use crate::core_types::{GridField, ModelGrid, Observation, TimeSlice};
use crate::error::{AssimilationError, Result};
use crate::linalg::checked_inverse;
use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;
use tracing::debug;

/// Kriged pseudo-observation field and its variance
#[derive(Debug, Clone)]
pub struct KrigingResult {
    /// Kriged mean at every grid cell
    pub mean: GridField,
    /// Kriging variance at every grid cell (never negative)
    pub variance: GridField,
    /// Condition number of the observation covariance
    pub condition_number: f64,
    /// Cells whose variance came out negative and was clamped to zero
    pub clamped_cells: usize,
}

/// Simple-kriging interpolator for one time slice
#[derive(Debug, Clone, Copy)]
pub struct SimpleKriging {
    correlation: SpatialCorrelationModel,
    max_condition_number: f64,
}

impl SimpleKriging {
    /// Create an interpolator
    pub fn new(correlation: SpatialCorrelationModel, max_condition_number: f64) -> Self {
        Self {
            correlation,
            max_condition_number,
        }
    }

    /// Krige the observations of `slice` onto `grid`
    ///
    /// # Arguments
    /// * `slice` - Observations at this timestamp
    /// * `grid` - Model grid (cell coordinates)
    /// * `trend` - Deterministic trend field (mean-field prediction)
    /// * `residual_std` - Model residual standard deviation per cell
    /// * `obs_error_variance` - Error variance of each observation, in slice order
    /// * `diagnostics` - Receives the covariance condition number and clamp warnings
    ///
    /// # Errors
    /// - `DataAlignment` for an empty slice or an observation outside the grid
    /// - `DimensionMismatch` if the fields or variances disagree in shape
    /// - `NumericalInstability` if the observation covariance is singular or
    ///   ill-conditioned
    pub fn krige(
        &self,
        slice: &TimeSlice,
        grid: &ModelGrid,
        trend: &GridField,
        residual_std: &GridField,
        obs_error_variance: &[f64],
        diagnostics: &mut Diagnostics,
    ) -> Result<KrigingResult> {
        let n_cells = grid.len();
        let n_obs = slice.len();
        if n_obs == 0 {
            return Err(AssimilationError::DataAlignment(
                "no observations to krige".into(),
            ));
        }
        check_len("kriging trend", n_cells, trend.as_slice().len())?;
        check_len("kriging residual std", n_cells, residual_std.as_slice().len())?;
        check_len("observation error variance", n_obs, obs_error_variance.len())?;

        let observations: Vec<&Observation> = slice.iter().collect();
        if let Some(bad) = observations.iter().find(|o| o.grid_index() >= n_cells) {
            return Err(AssimilationError::DataAlignment(format!(
                "station {} maps to cell {} outside a {}-cell grid",
                bad.station(),
                bad.grid_index(),
                n_cells
            )));
        }

        let trend = trend.as_slice();
        let sigma = residual_std.as_slice();

        // residuals against the trend at each station's nearest cell
        let residuals = DVector::from_iterator(
            n_obs,
            observations.iter().map(|o| o.value() - trend[o.grid_index()]),
        );
        let obs_sigma: Vec<f64> = observations.iter().map(|o| sigma[o.grid_index()]).collect();
        let obs_lonlat: Vec<(f64, f64)> = observations.iter().map(|o| o.cell_lonlat()).collect();

        let c = self.correlation.correlation_matrix(&obs_lonlat);
        let mut cov =
            DMatrix::from_fn(n_obs, n_obs, |i, j| obs_sigma[i] * c[(i, j)] * obs_sigma[j]);
        for (k, &eta2) in obs_error_variance.iter().enumerate() {
            cov[(k, k)] += eta2;
        }

        let (cov_inv, condition_number) =
            checked_inverse(&cov, self.max_condition_number, "kriging").inspect_err(|err| {
                if let AssimilationError::NumericalInstability {
                    condition_number, ..
                } = err
                {
                    diagnostics.push(TAG_SKDM_COV_COND, *condition_number);
                }
            })?;
        diagnostics.push(TAG_SKDM_COV_COND, condition_number);

        // Σ⁻¹ r, reused by every grid point
        let weighted_residuals = &cov_inv * &residuals;
        let base = self.correlation.base();

        let cells: Vec<(f64, f64, bool)> = (0..n_cells)
            .into_par_iter()
            .map(|p| {
                let p_lonlat = grid.lonlat(p);
                let cross = DVector::from_fn(n_obs, |k, _| {
                    sigma[p] * self.correlation.correlation(p_lonlat, obs_lonlat[k]) * obs_sigma[k]
                });
                let mean = trend[p] + cross.dot(&weighted_residuals);
                let reduction = cross.dot(&(&cov_inv * &cross));
                let variance = base * sigma[p] * sigma[p] - reduction;
                if variance < 0.0 {
                    (mean, 0.0, true)
                } else {
                    (mean, variance, false)
                }
            })
            .collect();

        let shape = grid.shape();
        let mut mean = GridField::zeros(shape);
        let mut variance = GridField::zeros(shape);
        let mut clamped_cells = 0;
        for (p, (m, v, clamped)) in cells.into_iter().enumerate() {
            mean.as_mut_slice()[p] = m;
            variance.as_mut_slice()[p] = v;
            clamped_cells += usize::from(clamped);
        }

        if clamped_cells > 0 {
            diagnostics.warn(
                TAG_SKDM_NEGATIVE_VARIANCE,
                clamped_cells,
                &format!(
                    "kriging variance negative in {clamped_cells} cells \
                     (cond {condition_number:.3e}), clamped to zero"
                ),
            );
        }

        debug!(
            "Kriged {} observations onto {} cells (cond {:.3e})",
            n_obs, n_cells, condition_number
        );

        Ok(KrigingResult {
            mean,
            variance,
            condition_number,
            clamped_cells,
        })
    }
}

fn check_len(what: &'static str, expected: usize, actual: usize) -> Result<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(AssimilationError::dimension(what, expected, actual))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_types::{GridShape, StationId};
    use approx::{assert_abs_diff_eq, assert_relative_eq};
    use chrono::{TimeZone, Utc};

    fn grid() -> ModelGrid {
        ModelGrid::regular(GridShape::new(5, 5), -117.0, 33.0, 0.05, 0.05).unwrap()
    }

    fn observation(grid: &ModelGrid, id: &str, cell: usize, value: f64) -> Observation {
        let t = Utc.with_ymd_and_hms(2007, 10, 22, 12, 0, 0).unwrap();
        Observation::new(StationId::new(id), t, value, 0.0, cell, grid.lonlat(cell))
    }

    fn kriging() -> SimpleKriging {
        SimpleKriging::new(SpatialCorrelationModel::default(), 1e12)
    }

    #[test]
    fn test_exact_observation_reproduced_at_its_cell() {
        let grid = grid();
        let shape = grid.shape();
        let center = shape.offset(2, 2).unwrap();
        let slice: TimeSlice = [observation(&grid, "s1", center, 0.15)].into_iter().collect();
        let trend = GridField::with_value(shape, 0.10);
        let std = GridField::with_value(shape, 0.05);
        let mut diag = Diagnostics::new();

        let result = kriging()
            .krige(&slice, &grid, &trend, &std, &[0.0], &mut diag)
            .unwrap();

        assert_relative_eq!(result.mean.get(2, 2), 0.15, epsilon = 1e-12);
        assert_abs_diff_eq!(result.variance.get(2, 2), 0.0, epsilon = 1e-12);
        assert_eq!(diag.pull(TAG_SKDM_COV_COND).len(), 1);
    }

    #[test]
    fn test_influence_decays_with_distance() {
        let grid = grid();
        let shape = grid.shape();
        let center = shape.offset(2, 2).unwrap();
        let slice: TimeSlice = [observation(&grid, "s1", center, 0.15)].into_iter().collect();
        let trend = GridField::with_value(shape, 0.10);
        let std = GridField::with_value(shape, 0.05);
        let mut diag = Diagnostics::new();

        let result = kriging()
            .krige(&slice, &grid, &trend, &std, &[0.0001], &mut diag)
            .unwrap();

        let near = result.mean.get(2, 3);
        let far = result.mean.get(2, 4);
        assert!(result.mean.get(2, 2) > near && near > far && far > 0.10);
        assert!(result.variance.get(2, 2) < result.variance.get(2, 3));
        assert!(result.variance.get(2, 3) < result.variance.get(2, 4));
    }

    #[test]
    fn test_variance_never_negative() {
        let grid = grid();
        let shape = grid.shape();
        let slice: TimeSlice = [
            observation(&grid, "a", 0, 0.12),
            observation(&grid, "b", 7, 0.09),
            observation(&grid, "c", 18, 0.20),
        ]
        .into_iter()
        .collect();
        let trend = GridField::with_value(shape, 0.10);
        let std = GridField::from_fn(shape, |r, c| 0.02 + 0.01 * (r + c) as f64);
        let mut diag = Diagnostics::new();

        let result = kriging()
            .krige(&slice, &grid, &trend, &std, &[0.0005; 3], &mut diag)
            .unwrap();
        assert!(result.variance.as_slice().iter().all(|&v| v >= 0.0));
    }

    #[test]
    fn test_negative_variance_is_clamped_and_recorded() {
        let grid = grid();
        let shape = grid.shape();
        let center = shape.offset(2, 2).unwrap();
        let slice: TimeSlice = [observation(&grid, "s1", center, 0.15)].into_iter().collect();
        let trend = GridField::with_value(shape, 0.10);
        let std = GridField::with_value(shape, 0.05);
        // a negative error variance halves the station's covariance, so the
        // variance reduction at its cell is twice the prior variance
        let prior = SpatialCorrelationModel::default().base() * 0.05 * 0.05;
        let mut diag = Diagnostics::new();

        let result = kriging()
            .krige(&slice, &grid, &trend, &std, &[-0.5 * prior], &mut diag)
            .unwrap();

        assert!(result.clamped_cells >= 1);
        assert_eq!(result.variance.get(2, 2), 0.0);
        assert!(result.variance.as_slice().iter().all(|&v| v >= 0.0));
        assert_eq!(
            diag.pull_scalars(TAG_SKDM_NEGATIVE_VARIANCE),
            vec![result.clamped_cells as f64]
        );
    }

    #[test]
    fn test_duplicate_exact_stations_are_singular() {
        let grid = grid();
        let shape = grid.shape();
        let slice: TimeSlice = [
            observation(&grid, "a", 6, 0.12),
            observation(&grid, "b", 6, 0.13),
        ]
        .into_iter()
        .collect();
        let trend = GridField::with_value(shape, 0.10);
        let std = GridField::with_value(shape, 0.05);
        let mut diag = Diagnostics::new();

        let err = kriging()
            .krige(&slice, &grid, &trend, &std, &[0.0, 0.0], &mut diag)
            .unwrap_err();
        assert!(matches!(err, AssimilationError::NumericalInstability { .. }));
        assert_eq!(diag.pull(TAG_SKDM_COV_COND).len(), 1);
    }

    #[test]
    fn test_error_variance_length_checked() {
        let grid = grid();
        let shape = grid.shape();
        let slice: TimeSlice = [observation(&grid, "a", 3, 0.12)].into_iter().collect();
        let field = GridField::with_value(shape, 0.1);
        let mut diag = Diagnostics::new();
        let err = kriging()
            .krige(&slice, &grid, &field, &field, &[0.1, 0.1], &mut diag)
            .unwrap_err();
        assert!(matches!(err, AssimilationError::DimensionMismatch { .. }));
    }
}

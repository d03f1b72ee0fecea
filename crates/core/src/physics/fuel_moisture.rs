//! Per-cell fuel moisture timelag model with Kalman correction
//!
//! Each grid cell carries k fuel-moisture classes (1 h, 10 h, 100 h fuels
//! by default) plus one auxiliary state dE, a bias added to both
//! equilibria. Each class relaxes exponentially toward its regime target:
//!
//! M(t+dt) = M_e + (M(t) − M_e) × exp(−dt / τ)
//!
//! Regimes, evaluated per class:
//! - rain (r > r0): target = saturation S, τ = Tr / (1 − exp(−(r − r0) / rk))
//! - drying (M > Ed + dE): target = Ed + dE, τ = class timelag
//! - wetting (M < Ew + dE): target = Ew + dE, τ = class timelag
//! - otherwise the class is left unchanged
//!
//! The exact solution is linear in (M, dE) within a regime, so the covariance
//! is propagated with the regime Jacobian F: P ← F·P·Fᵀ + Q.
//!
//! # Scientific References
//! - Nelson, R.M. (2000). "Prediction of diurnal change in 10-h fuel stick moisture content"
//!   Canadian Journal of Forest Research, 30(7), 1071-1087
//! - Viney, N.R. (1991). "A review of fine fuel moisture modelling"
//!   International Journal of Wildland Fire, 1(4), 215-234

use crate::config::{FuelConfig, RainConfig};
use crate::error::{AssimilationError, Result};
use crate::linalg::{checked_inverse, symmetrize};
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

/// Innovation covariances above this condition number are treated as singular
pub const MAX_INNOVATION_CONDITION: f64 = 1.0e14;

const SECONDS_PER_HOUR: f64 = 3600.0;

/// Exponential timelag step toward `target`
///
/// # Returns
/// `(new_moisture, lag_factor)` where `lag_factor = exp(-dt / τ)` is the
/// derivative of the new moisture with respect to the old one
fn relax_toward(current: f64, target: f64, timelag_s: f64, dt_s: f64) -> (f64, f64) {
    if timelag_s <= 0.0 {
        return (target, 0.0);
    }
    let lag_factor = (-dt_s / timelag_s).exp();
    (target + (current - target) * lag_factor, lag_factor)
}

/// Which relaxation a fuel class followed in a step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MoistureRegime {
    /// Wetting toward saturation under rain
    Rain,
    /// Drying toward the drying equilibrium
    Drying,
    /// Wetting toward the wetting equilibrium
    Wetting,
    /// Between the two equilibria, unchanged
    Neutral,
}

/// Weather forcing of one cell for one step
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CellForcing {
    /// Drying equilibrium moisture (fraction)
    pub drying_equilibrium: f64,
    /// Wetting equilibrium moisture (fraction)
    pub wetting_equilibrium: f64,
    /// Rain intensity over the step (mm/h)
    pub rain_rate_mm_h: f64,
}

impl CellForcing {
    /// Dry forcing with both equilibria equal to `target`
    pub fn equilibrium(target: f64) -> Self {
        Self {
            drying_equilibrium: target,
            wetting_equilibrium: target,
            rain_rate_mm_h: 0.0,
        }
    }
}

/// State of one grid cell: moisture classes, bias state and covariance
///
/// A plain value record; the grid is a flat `Vec<CellState>` indexed by
/// linear grid offset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellState {
    /// `[M_1, ..., M_k, dE]`
    pub state: DVector<f64>,
    /// Covariance of `state`, symmetric positive semi-definite
    pub covariance: DMatrix<f64>,
    /// Cell centre `(lon, lat)`
    pub lonlat: (f64, f64),
}

impl CellState {
    /// Moisture of class `i`
    pub fn moisture(&self, class: usize) -> f64 {
        self.state[class]
    }

    /// Equilibrium bias state
    pub fn equilibrium_bias(&self) -> f64 {
        self.state[self.state.len() - 1]
    }

    /// Variance of state component `i`
    pub fn variance(&self, component: usize) -> f64 {
        self.covariance[(component, component)]
    }
}

/// Timelag dynamics shared by every cell
#[derive(Debug, Clone, PartialEq)]
pub struct CellMoistureModel {
    timelags_s: Vec<f64>,
    saturation: f64,
    rain_timelag_s: f64,
    rain_threshold: f64,
    rain_saturation_intensity: f64,
}

impl CellMoistureModel {
    /// Build the dynamics from the fuel and rain configuration
    pub fn from_config(fuel: &FuelConfig, rain: &RainConfig) -> Self {
        Self {
            timelags_s: fuel
                .time_constants_hours
                .iter()
                .map(|h| h * SECONDS_PER_HOUR)
                .collect(),
            saturation: rain.saturation,
            rain_timelag_s: rain.wetting_time_constant_hours * SECONDS_PER_HOUR,
            rain_threshold: rain.threshold_mm_h,
            rain_saturation_intensity: rain.saturation_intensity_mm_h,
        }
    }

    /// Number of fuel-moisture classes
    pub fn fuel_classes(&self) -> usize {
        self.timelags_s.len()
    }

    /// Dimension of the extended state (classes plus bias)
    pub fn state_dim(&self) -> usize {
        self.fuel_classes() + 1
    }

    /// Initial cell: every class at `moisture`, zero bias, diagonal covariance
    pub fn initial_state(&self, lonlat: (f64, f64), moisture: f64, variance: f64) -> CellState {
        let n = self.state_dim();
        let mut state = DVector::from_element(n, moisture);
        state[n - 1] = 0.0;
        CellState {
            state,
            covariance: DMatrix::from_diagonal_element(n, n, variance),
            lonlat,
        }
    }

    /// Diagonal process noise: `moisture_noise` on each class, `bias_noise` on dE
    pub fn process_noise(&self, moisture_noise: f64, bias_noise: f64) -> DMatrix<f64> {
        let n = self.state_dim();
        let mut q = DMatrix::from_diagonal_element(n, n, moisture_noise);
        q[(n - 1, n - 1)] = bias_noise;
        q
    }

    /// Regime a class with moisture `m` follows under `forcing` and bias `bias`
    pub fn regime(&self, m: f64, bias: f64, forcing: &CellForcing) -> MoistureRegime {
        if forcing.rain_rate_mm_h > self.rain_threshold {
            MoistureRegime::Rain
        } else if m > forcing.drying_equilibrium + bias {
            MoistureRegime::Drying
        } else if m < forcing.wetting_equilibrium + bias {
            MoistureRegime::Wetting
        } else {
            MoistureRegime::Neutral
        }
    }

    /// Predict step: advance state and covariance by `dt_s` seconds
    ///
    /// # Errors
    /// Returns `DimensionMismatch` if the cell or `process_noise` do not match
    /// the model's state dimension
    pub fn advance_model(
        &self,
        cell: &mut CellState,
        forcing: &CellForcing,
        dt_s: f64,
        process_noise: &DMatrix<f64>,
    ) -> Result<()> {
        let n = self.state_dim();
        self.check_cell(cell)?;
        if process_noise.shape() != (n, n) {
            return Err(AssimilationError::dimension(
                "process noise",
                n * n,
                process_noise.len(),
            ));
        }

        let bias_idx = n - 1;
        let bias = cell.state[bias_idx];
        let mut jacobian = DMatrix::identity(n, n);

        for (i, &timelag) in self.timelags_s.iter().enumerate() {
            let m = cell.state[i];
            match self.regime(m, bias, forcing) {
                MoistureRegime::Rain => {
                    let excess = forcing.rain_rate_mm_h - self.rain_threshold;
                    let intensity = 1.0 - (-excess / self.rain_saturation_intensity).exp();
                    let (m_new, lag) =
                        relax_toward(m, self.saturation, self.rain_timelag_s / intensity, dt_s);
                    cell.state[i] = m_new;
                    jacobian[(i, i)] = lag;
                }
                regime @ (MoistureRegime::Drying | MoistureRegime::Wetting) => {
                    let equilibrium = if regime == MoistureRegime::Drying {
                        forcing.drying_equilibrium
                    } else {
                        forcing.wetting_equilibrium
                    };
                    let (m_new, lag) = relax_toward(m, equilibrium + bias, timelag, dt_s);
                    cell.state[i] = m_new;
                    jacobian[(i, i)] = lag;
                    jacobian[(i, bias_idx)] = 1.0 - lag;
                }
                MoistureRegime::Neutral => {}
            }
        }

        cell.covariance = &jacobian * &cell.covariance * jacobian.transpose() + process_noise;
        symmetrize(&mut cell.covariance);
        Ok(())
    }

    /// Correct step: assimilate pseudo-observations of selected state components
    ///
    /// # Arguments
    /// * `cell` - Cell to correct in place
    /// * `observations` - Observed values z, one per entry of `observed`
    /// * `observation_variance` - Observation covariance R
    /// * `observed` - State indices observed by each entry of z
    ///
    /// # Returns
    /// The Kalman gain K (state_dim × n_obs)
    ///
    /// # Errors
    /// - `DimensionMismatch` if z, R and `observed` disagree
    /// - `NumericalInstability` if H·P·Hᵀ + R is singular; the cell is left untouched
    pub fn kalman_update(
        &self,
        cell: &mut CellState,
        observations: &DVector<f64>,
        observation_variance: &DMatrix<f64>,
        observed: &[usize],
    ) -> Result<DMatrix<f64>> {
        let n = self.state_dim();
        let n_obs = observed.len();
        self.check_cell(cell)?;
        if observations.len() != n_obs {
            return Err(AssimilationError::dimension(
                "kalman observations",
                n_obs,
                observations.len(),
            ));
        }
        if observation_variance.shape() != (n_obs, n_obs) {
            return Err(AssimilationError::dimension(
                "kalman observation variance",
                n_obs * n_obs,
                observation_variance.len(),
            ));
        }
        if let Some(&bad) = observed.iter().find(|&&i| i >= n) {
            return Err(AssimilationError::dimension("observed state index", n, bad));
        }

        let mut h = DMatrix::zeros(n_obs, n);
        for (row, &component) in observed.iter().enumerate() {
            h[(row, component)] = 1.0;
        }

        let p_ht = &cell.covariance * h.transpose();
        let innovation_cov = &h * &p_ht + observation_variance;
        let (innovation_inv, _) =
            checked_inverse(&innovation_cov, MAX_INNOVATION_CONDITION, "kalman")?;
        let gain = &p_ht * innovation_inv;

        let innovation = observations - &h * &cell.state;
        cell.state += &gain * innovation;
        cell.covariance = (DMatrix::identity(n, n) - &gain * &h) * &cell.covariance;
        symmetrize(&mut cell.covariance);
        Ok(gain)
    }

    fn check_cell(&self, cell: &CellState) -> Result<()> {
        let n = self.state_dim();
        if cell.state.len() != n {
            return Err(AssimilationError::dimension("cell state", n, cell.state.len()));
        }
        if cell.covariance.shape() != (n, n) {
            return Err(AssimilationError::dimension(
                "cell covariance",
                n * n,
                cell.covariance.len(),
            ));
        }
        Ok(())
    }
}

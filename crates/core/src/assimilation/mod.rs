//! Assimilation loop
//!
//! [`AssimilationRun`] owns the grid of cell states, the two residual
//! estimators, the mean-field model and the diagnostics context, and drives
//! one discrete step at a time:
//!
//! 1. predict every cell (parallel, no cross-cell coupling)
//! 2. gather the observed fuel class as the base field
//! 3. with observations: fit the mean field, update the observation and
//!    model residual estimators, krige onto the grid
//! 4. with a kriged field: Kalman-correct every cell (parallel)
//! 5. record diagnostics and hand a [`StepSnapshot`] to the observer
//!
//! Numerical failures in kriging or in a cell's correction skip that
//! correction and leave a diagnostic record; they never abort the run.
//! Observations whose grid index lies outside the grid are dropped and
//! recorded under `obs_dropped`.

pub mod diagnostics;
pub mod forcing;
pub mod mean_field;
pub mod snapshot;
pub mod stations;

pub use self::diagnostics::{DiagnosticRecord, DiagnosticValue, Diagnostics};
pub use forcing::{ForcingSource, InMemoryForcing, StepForcing};
pub use mean_field::{MeanFieldFallback, MeanFieldModel};
pub use snapshot::{SnapshotCollector, StepObserver, StepSnapshot};
pub use stations::{build_observation_schedule, match_time, ObservationSchedule, StationSeries};

use crate::config::AssimilationConfig;
use crate::core_types::{GridField, ModelGrid, StationId, TimeSlice};
use crate::error::{AssimilationError, Result};
use crate::linalg::condition_number;
use crate::physics::fuel_moisture::{CellForcing, CellMoistureModel, CellState};
use crate::spatial::{KrigingResult, SimpleKriging, SpatialCorrelationModel};
use crate::stats::RunningStatsEstimator;
use self::diagnostics::{
    TAG_CELL_COV_COND_MAX, TAG_KALMAN_MAX_COND, TAG_KALMAN_SKIPPED_CELLS, TAG_MFM_GAMMA,
    TAG_MODEL_RESIDUAL_VARIANCE_MEAN, TAG_OBS_DROPPED, TAG_OBS_RESIDUAL_VARIANCE,
    TAG_OBS_RE_PARTIAL_SKIP, TAG_SKDM_COV_COND, TAG_SKDM_FAILED,
};
use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;
use rustc_hash::FxHashMap;
use std::path::Path;
use tracing::{debug, info, warn};

/// State of a running assimilation
pub struct AssimilationRun {
    config: AssimilationConfig,
    grid: ModelGrid,
    model: CellMoistureModel,
    process_noise: DMatrix<f64>,
    cells: Vec<CellState>,
    mean_field: MeanFieldModel,
    kriging: SimpleKriging,
    model_residuals: RunningStatsEstimator,
    observation_residuals: RunningStatsEstimator,
    roster: FxHashMap<StationId, usize>,
    schedule: ObservationSchedule,
    diagnostics: Diagnostics,
    model_residual_variance: GridField,
    previous_precipitation: GridField,
    next_step: usize,
}

impl AssimilationRun {
    /// Set up a run from the first forcing step
    ///
    /// Every cell starts at the nominal equilibrium ½(Ed + Ew) of step 0 with
    /// a diagonal covariance of `fuel.initial_variance`. Stepping then
    /// proceeds from step 1.
    ///
    /// # Errors
    /// - `Configuration` if `config` is invalid or the forcing has no steps
    /// - `DimensionMismatch` if the forcing does not match `grid`
    pub fn new(
        config: AssimilationConfig,
        grid: ModelGrid,
        forcing: &dyn ForcingSource,
        schedule: ObservationSchedule,
    ) -> Result<Self> {
        Self::with_diagnostics(config, grid, forcing, schedule, Diagnostics::new())
    }

    /// Like [`AssimilationRun::new`], continuing an existing diagnostics
    /// context (e.g. one that recorded station pre-processing)
    pub fn with_diagnostics(
        config: AssimilationConfig,
        grid: ModelGrid,
        forcing: &dyn ForcingSource,
        schedule: ObservationSchedule,
        mut diagnostics: Diagnostics,
    ) -> Result<Self> {
        config.validate()?;
        if forcing.times().is_empty() {
            return Err(AssimilationError::Configuration(
                "forcing has no timesteps".into(),
            ));
        }
        let initial = forcing.forcing(0)?;
        initial.check_shape(grid.shape())?;

        let model = CellMoistureModel::from_config(&config.fuel, &config.rain);
        let process_noise =
            model.process_noise(config.fuel.process_noise, config.fuel.bias_process_noise);
        let nominal = initial.nominal_equilibrium();
        let cells: Vec<CellState> = nominal
            .as_slice()
            .iter()
            .enumerate()
            .map(|(idx, &e)| model.initial_state(grid.lonlat(idx), e, config.fuel.initial_variance))
            .collect();

        let priors = config.residual_priors;
        let model_residuals = RunningStatsEstimator::uniform(
            grid.len(),
            priors.model.mean,
            priors.model.variance,
            priors.model.count,
        )?;
        let roster: FxHashMap<StationId, usize> = schedule
            .roster()
            .iter()
            .enumerate()
            .map(|(k, id)| (id.clone(), k))
            .collect();
        let observation_residuals = RunningStatsEstimator::uniform(
            roster.len(),
            priors.observation.mean,
            priors.observation.variance,
            priors.observation.count,
        )?;

        let kriging = SimpleKriging::new(
            SpatialCorrelationModel::from_config(&config.correlation),
            config.kriging.max_condition_number,
        );

        diagnostics.configure_tag(TAG_MFM_GAMMA, true, true);
        diagnostics.configure_tag(TAG_SKDM_COV_COND, true, true);

        info!(
            "Assimilation run: {}x{} grid, {} fuel classes (observed class {}), \
             {} stations, {} steps with observations",
            grid.shape().rows,
            grid.shape().cols,
            model.fuel_classes(),
            config.fuel.observed_class,
            roster.len(),
            schedule.len()
        );

        let model_residual_variance = GridField::with_value(grid.shape(), priors.model.variance);
        let mean_field = MeanFieldModel::new(&config.mean_field);
        Ok(Self {
            config,
            grid,
            model,
            process_noise,
            cells,
            kriging,
            model_residuals,
            observation_residuals,
            roster,
            schedule,
            diagnostics,
            model_residual_variance,
            mean_field,
            previous_precipitation: initial.accumulated_precipitation,
            next_step: 1,
        })
    }

    /// Cell states indexed by linear grid offset
    pub fn cells(&self) -> &[CellState] {
        &self.cells
    }

    /// Model grid
    pub fn grid(&self) -> &ModelGrid {
        &self.grid
    }

    /// Diagnostics recorded so far
    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    /// Current mean-field model
    pub fn mean_field(&self) -> &MeanFieldModel {
        &self.mean_field
    }

    /// Index of the next step to run
    pub fn next_step(&self) -> usize {
        self.next_step
    }

    /// Moisture of fuel class `class` over the grid
    pub fn moisture_field(&self, class: usize) -> GridField {
        self.cell_field(|c| c.moisture(class))
    }

    /// Advance one step
    ///
    /// # Returns
    /// The step's snapshot, or `None` when the forcing is exhausted
    ///
    /// # Errors
    /// Returns non-recoverable failures (forcing errors, dimension
    /// mismatches); numerical failures are recorded and skipped
    pub fn step(&mut self, forcing: &dyn ForcingSource) -> Result<Option<StepSnapshot>> {
        let t = self.next_step;
        let times = forcing.times();
        if t >= times.len() {
            return Ok(None);
        }
        self.diagnostics.begin_step(t);

        let step_forcing = forcing.forcing(t)?;
        step_forcing.check_shape(self.grid.shape())?;
        let dt_s = (times[t] - times[t - 1]).num_milliseconds() as f64 / 1000.0;
        if dt_s <= 0.0 {
            return Err(AssimilationError::DataAlignment(format!(
                "forcing step {t} does not advance time"
            )));
        }
        let rain = self.rain_rate(&step_forcing.accumulated_precipitation, dt_s);
        self.previous_precipitation = step_forcing.accumulated_precipitation.clone();

        // 1. predict
        let model = &self.model;
        let q = &self.process_noise;
        let drying = step_forcing.drying.as_slice();
        let wetting = step_forcing.wetting.as_slice();
        self.cells
            .par_iter_mut()
            .enumerate()
            .try_for_each(|(idx, cell)| {
                let cell_forcing = CellForcing {
                    drying_equilibrium: drying[idx],
                    wetting_equilibrium: wetting[idx],
                    rain_rate_mm_h: rain[idx],
                };
                model.advance_model(cell, &cell_forcing, dt_s, q)
            })?;

        // 2. base field
        let observed_class = self.config.fuel.observed_class;
        let base = self.moisture_field(observed_class);

        // 3. mean field, residual statistics, kriging
        let slice = self.schedule.slice(t).cloned();
        let (predicted, correction) = match slice {
            Some(slice) => self.fit_and_krige(&base, &slice)?,
            None => {
                self.mean_field
                    .fall_back("no observations", &mut self.diagnostics);
                (self.mean_field.predict_field(&base), None)
            }
        };

        // 4. correct
        let kalman_gain = match &correction {
            Some(kriged) => self.correct(kriged)?,
            None => GridField::zeros(self.grid.shape()),
        };

        // 5. diagnostics
        let max_cond = self
            .cells
            .par_iter()
            .map(|c| condition_number(&c.covariance))
            .reduce(|| 1.0, f64::max);
        self.diagnostics.push(TAG_CELL_COV_COND_MAX, max_cond);

        let (kriged_mean, kriged_variance) = match correction {
            Some(kriged) => (Some(kriged.mean), Some(kriged.variance)),
            None => (None, None),
        };
        let snapshot = StepSnapshot {
            step: t,
            time: times[t],
            moisture: (0..self.model.fuel_classes())
                .map(|class| self.moisture_field(class))
                .collect(),
            observed_variance: self.cell_field(|c| c.variance(observed_class)),
            predicted,
            kriged_mean,
            kriged_variance,
            kalman_gain,
            model_residual_variance: self.model_residual_variance.clone(),
        };
        debug!(
            "Step {} ({}): mean moisture {:.4}, gamma {:.4}, corrected {}",
            t,
            times[t],
            base.mean(),
            self.mean_field.gamma(),
            snapshot.corrected()
        );
        self.next_step += 1;
        Ok(Some(snapshot))
    }

    /// Run every remaining step, reporting each snapshot to `observer`
    ///
    /// # Errors
    /// Stops at the first non-recoverable failure
    pub fn run(
        &mut self,
        forcing: &dyn ForcingSource,
        observer: &mut dyn StepObserver,
    ) -> Result<()> {
        let total = forcing.times().len();
        info!("Running assimilation steps {}..{}", self.next_step, total);
        while let Some(snapshot) = self.step(forcing)? {
            observer.observe(&snapshot);
        }
        info!(
            "Assimilation complete: final gamma {:.4}, {} diagnostic tags",
            self.mean_field.gamma(),
            self.diagnostics.tags().count()
        );
        Ok(())
    }

    /// End the run, flushing diagnostics to `path` when given
    ///
    /// # Errors
    /// Returns `Persistence` if the diagnostics cannot be written
    pub fn finish(self, path: Option<&Path>) -> Result<Diagnostics> {
        if let Some(path) = path {
            self.diagnostics.flush(path)?;
        }
        Ok(self.diagnostics)
    }

    fn cell_field(&self, f: impl Fn(&CellState) -> f64) -> GridField {
        let mut field = GridField::zeros(self.grid.shape());
        for (value, cell) in field.as_mut_slice().iter_mut().zip(&self.cells) {
            *value = f(cell);
        }
        field
    }

    /// Step rain rate (mm/h) from consecutive accumulated totals
    fn rain_rate(&self, accumulated: &GridField, dt_s: f64) -> Vec<f64> {
        let dt_h = dt_s / 3600.0;
        accumulated
            .as_slice()
            .iter()
            .zip(self.previous_precipitation.as_slice())
            .map(|(now, before)| (now - before).max(0.0) / dt_h)
            .collect()
    }

    /// Mean-field fit, residual estimator updates and kriging for one slice
    fn fit_and_krige(
        &mut self,
        base: &GridField,
        slice: &TimeSlice,
    ) -> Result<(GridField, Option<KrigingResult>)> {
        let slice = &self.inside_grid(slice);
        if slice.is_empty() {
            self.mean_field
                .fall_back("no observations inside the grid", &mut self.diagnostics);
            return Ok((self.mean_field.predict_field(base), None));
        }
        self.mean_field.fit_to_data(base, slice, &mut self.diagnostics);
        self.update_observation_residuals(base, slice)?;

        let predicted = self.mean_field.predict_field(base);
        let residual: Vec<f64> = base
            .as_slice()
            .iter()
            .zip(predicted.as_slice())
            .map(|(raw, p)| raw - p)
            .collect();
        self.model_residuals.update_with(&residual)?;
        if let Ok(variance) = self.model_residuals.get_variance() {
            let n = variance.len();
            self.model_residual_variance =
                GridField::from_vec(self.grid.shape(), variance.as_slice().to_vec())
                    .ok_or_else(|| {
                        AssimilationError::dimension("model residual variance", self.grid.len(), n)
                    })?;
        }
        self.diagnostics.push(
            TAG_MODEL_RESIDUAL_VARIANCE_MEAN,
            self.model_residual_variance.mean(),
        );
        let residual_std = self.model_residual_variance.map(f64::sqrt);

        let obs_variance = self.observation_residuals.get_variance().ok();
        let error_variance: Vec<f64> = slice
            .iter()
            .map(|o| {
                obs_variance
                    .as_ref()
                    .zip(self.roster.get(o.station()))
                    .map_or(o.residual_std().powi(2), |(v, &k)| v[k])
            })
            .collect();

        match self.kriging.krige(
            slice,
            &self.grid,
            &predicted,
            &residual_std,
            &error_variance,
            &mut self.diagnostics,
        ) {
            Ok(kriged) => Ok((predicted, Some(kriged))),
            Err(err) if err.is_recoverable() => {
                let cond = match &err {
                    AssimilationError::NumericalInstability {
                        condition_number, ..
                    } => *condition_number,
                    _ => f64::NAN,
                };
                self.diagnostics.warn(
                    TAG_SKDM_FAILED,
                    cond,
                    &format!("kriging skipped, no correction this step: {err}"),
                );
                Ok((predicted, None))
            }
            Err(err) => Err(err),
        }
    }

    /// Observations of `slice` whose grid index is on the grid
    fn inside_grid(&mut self, slice: &TimeSlice) -> TimeSlice {
        let cells = self.grid.len();
        let diagnostics = &mut self.diagnostics;
        slice
            .iter()
            .filter(|obs| {
                let inside = obs.grid_index() < cells;
                if !inside {
                    warn!(
                        "Dropping observation of {}: grid index {} outside {} cells",
                        obs.station(),
                        obs.grid_index(),
                        cells
                    );
                    diagnostics.push(
                        TAG_OBS_DROPPED,
                        format!(
                            "{} at {}: grid index {} outside the grid",
                            obs.station(),
                            obs.time(),
                            obs.grid_index()
                        ),
                    );
                }
                inside
            })
            .cloned()
            .collect()
    }

    /// Update the observation residual estimator when every station reports
    fn update_observation_residuals(&mut self, base: &GridField, slice: &TimeSlice) -> Result<()> {
        if slice.len() != self.roster.len() {
            self.diagnostics.push(TAG_OBS_RE_PARTIAL_SKIP, slice.len());
            debug!(
                "Observation residual estimator not updated: {} of {} stations reported",
                slice.len(),
                self.roster.len()
            );
            return Ok(());
        }
        let base = base.as_slice();
        let mut sample = vec![0.0; self.roster.len()];
        for obs in slice.iter() {
            let k = self.roster.get(obs.station()).copied().ok_or_else(|| {
                AssimilationError::DataAlignment(format!(
                    "station {} is not in the schedule roster",
                    obs.station()
                ))
            })?;
            sample[k] = obs.value() - base[obs.grid_index()];
        }
        self.observation_residuals.update_with(&sample)?;
        if let Ok(variance) = self.observation_residuals.get_variance() {
            self.diagnostics
                .push(TAG_OBS_RESIDUAL_VARIANCE, variance.as_slice());
        }
        Ok(())
    }

    /// Kalman-correct every cell toward the kriged field
    ///
    /// # Returns
    /// Gain of the observed class on its own pseudo-observation per cell
    fn correct(&mut self, kriged: &KrigingResult) -> Result<GridField> {
        let observed = [self.config.fuel.observed_class];
        let model = &self.model;
        let mean = kriged.mean.as_slice();
        let variance = kriged.variance.as_slice();

        let outcomes: Vec<Result<f64>> = self
            .cells
            .par_iter_mut()
            .enumerate()
            .map(|(idx, cell)| {
                let z = DVector::from_element(1, mean[idx]);
                let r = DMatrix::from_element(1, 1, variance[idx]);
                model
                    .kalman_update(cell, &z, &r, &observed)
                    .map(|gain| gain[(observed[0], 0)])
            })
            .collect();

        let mut gain = GridField::zeros(self.grid.shape());
        let mut skipped = 0usize;
        let mut worst = 0.0f64;
        for (slot, outcome) in gain.as_mut_slice().iter_mut().zip(outcomes) {
            match outcome {
                Ok(g) => *slot = g,
                Err(AssimilationError::NumericalInstability {
                    condition_number, ..
                }) => {
                    skipped += 1;
                    worst = worst.max(condition_number);
                }
                Err(err) => return Err(err),
            }
        }
        if skipped > 0 {
            warn!(
                "Kalman correction skipped in {} cells (worst condition {:.3e})",
                skipped, worst
            );
            self.diagnostics.push(TAG_KALMAN_SKIPPED_CELLS, skipped);
            self.diagnostics.push(TAG_KALMAN_MAX_COND, worst);
        }
        Ok(gain)
    }
}

//! Global scale correction between the model field and station data
//!
//! Fits a single coefficient γ minimising Σ (oₖ − γ·bₖ)² over the stations
//! reporting at a step, where bₖ is the base field at station k's grid
//! cell:
//!
//! ```text
//! γ = Σ oₖ·bₖ / Σ bₖ²
//! ```
//!
//! The predicted field γ·b is the kriging trend and the model-residual
//! reference for the rest of the step.

use crate::assimilation::diagnostics::{Diagnostics, TAG_MFM_FALLBACK, TAG_MFM_GAMMA};
use crate::config::MeanFieldConfig;
use crate::core_types::{GridField, TimeSlice};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Coefficient used when a step cannot be fit
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeanFieldFallback {
    /// Keep the last successfully fitted γ (1.0 before the first fit)
    #[default]
    ReusePrevious,
    /// Use γ = 1.0
    Identity,
}

/// Mean-field bias correction model
#[derive(Debug, Clone)]
pub struct MeanFieldModel {
    gamma: f64,
    fallback: MeanFieldFallback,
    locked_gamma: Option<f64>,
}

impl Default for MeanFieldModel {
    fn default() -> Self {
        Self::new(&MeanFieldConfig::default())
    }
}

impl MeanFieldModel {
    /// Identity model with the configured fallback and optional locked γ
    pub fn new(config: &MeanFieldConfig) -> Self {
        Self {
            gamma: config.locked_gamma.unwrap_or(1.0),
            fallback: config.fallback,
            locked_gamma: config.locked_gamma,
        }
    }

    /// Current coefficient
    pub fn gamma(&self) -> f64 {
        self.gamma
    }

    /// Fit γ to the observations of `slice` and record it under `mfm_gamma`
    ///
    /// An empty slice or an all-zero base at the stations cannot be fit;
    /// the fallback policy is applied and recorded under `mfm_fallback`.
    /// Observations outside the field are ignored.
    ///
    /// # Returns
    /// The coefficient in effect after the call
    pub fn fit_to_data(
        &mut self,
        base_field: &GridField,
        slice: &TimeSlice,
        diagnostics: &mut Diagnostics,
    ) -> f64 {
        if let Some(locked) = self.locked_gamma {
            self.gamma = locked;
            diagnostics.push(TAG_MFM_GAMMA, locked);
            return locked;
        }

        let base = base_field.as_slice();
        let (cross, norm) = slice
            .iter()
            .filter_map(|o| base.get(o.grid_index()).map(|&b| (o.value(), b)))
            .fold((0.0, 0.0), |(cross, norm), (o, b)| (cross + o * b, norm + b * b));

        let gamma = cross / norm;
        if norm > 0.0 && gamma.is_finite() {
            self.gamma = gamma;
            diagnostics.push(TAG_MFM_GAMMA, gamma);
            debug!("Mean field fit: gamma = {:.4} from {} stations", gamma, slice.len());
            gamma
        } else {
            let reason = if slice.is_empty() {
                "no observations"
            } else {
                "degenerate base field at stations"
            };
            self.fall_back(reason, diagnostics)
        }
    }

    /// Apply the fallback policy for a step without a usable fit
    ///
    /// # Returns
    /// The coefficient in effect after the call
    pub fn fall_back(&mut self, reason: &str, diagnostics: &mut Diagnostics) -> f64 {
        if let Some(locked) = self.locked_gamma {
            self.gamma = locked;
        } else if self.fallback == MeanFieldFallback::Identity {
            self.gamma = 1.0;
        }
        debug!(
            "Mean field fallback ({:?}, {}): gamma = {:.4}",
            self.fallback, reason, self.gamma
        );
        diagnostics.push(TAG_MFM_FALLBACK, self.gamma);
        self.gamma
    }

    /// γ · base at every cell
    pub fn predict_field(&self, base_field: &GridField) -> GridField {
        base_field.map(|b| self.gamma * b)
    }
}

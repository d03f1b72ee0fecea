//! Run parameters for the assimilation core
//!
//! Every field has a default matching the standard three-class fuel setup
//! (1 h, 10 h, 100 h timelags, 10 h fuel observed), so a configuration file
//! only needs to name what it changes.

use crate::assimilation::mean_field::MeanFieldFallback;
use crate::error::{AssimilationError, Result};
use serde::{Deserialize, Serialize};

/// Top-level assimilation configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AssimilationConfig {
    /// Fuel classes and their noise parameters
    pub fuel: FuelConfig,
    /// Rain-driven wetting regime
    pub rain: RainConfig,
    /// Distance-correlation law
    pub correlation: CorrelationConfig,
    /// Kriging numerical limits
    pub kriging: KrigingConfig,
    /// Mean-field bias correction
    pub mean_field: MeanFieldConfig,
    /// Priors of the residual running-statistics estimators
    pub residual_priors: ResidualPriors,
    /// Station-to-model timestamp matching
    pub time_matching: TimeMatchingConfig,
}

/// Fuel classes, observed class and noise
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FuelConfig {
    /// Time constant of each fuel class (hours)
    pub time_constants_hours: Vec<f64>,
    /// Index of the fuel class the stations measure
    pub observed_class: usize,
    /// Initial state covariance (diagonal, every state component)
    pub initial_variance: f64,
    /// Process noise added to each moisture class per step
    pub process_noise: f64,
    /// Process noise added to the equilibrium-bias state per step
    pub bias_process_noise: f64,
}

impl Default for FuelConfig {
    fn default() -> Self {
        Self {
            time_constants_hours: vec![1.0, 10.0, 100.0],
            observed_class: 1,
            initial_variance: 0.0001,
            process_noise: 0.0001,
            bias_process_noise: 0.0001,
        }
    }
}

/// Rain regime parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RainConfig {
    /// Saturation moisture level (fraction)
    pub saturation: f64,
    /// Wetting time constant at full intensity (hours)
    pub wetting_time_constant_hours: f64,
    /// Rain rate below which rain is ignored (mm/h)
    pub threshold_mm_h: f64,
    /// Rain rate scale at which wetting saturates (mm/h)
    pub saturation_intensity_mm_h: f64,
}

impl Default for RainConfig {
    fn default() -> Self {
        Self {
            saturation: 2.5,
            wetting_time_constant_hours: 14.0,
            threshold_mm_h: 0.05,
            saturation_intensity_mm_h: 8.0,
        }
    }
}

/// Linear distance-correlation law `max(0, a - b * d)`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CorrelationConfig {
    /// Correlation at zero distance
    pub base: f64,
    /// Correlation decrease per km
    pub slope_per_km: f64,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            base: 0.8565,
            slope_per_km: 0.0063,
        }
    }
}

/// Kriging limits
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KrigingConfig {
    /// Observation covariance matrices above this condition number are
    /// treated as singular
    pub max_condition_number: f64,
}

impl Default for KrigingConfig {
    fn default() -> Self {
        Self {
            max_condition_number: 1.0e12,
        }
    }
}

/// Mean-field model options
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MeanFieldConfig {
    /// Coefficient used when a step cannot be fit
    pub fallback: MeanFieldFallback,
    /// Use this coefficient instead of fitting
    pub locked_gamma: Option<f64>,
}

/// Prior of one running-statistics estimator
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StatsPrior {
    /// Prior mean
    pub mean: f64,
    /// Prior variance
    pub variance: f64,
    /// Effective prior sample count
    pub count: usize,
}

/// Priors for the model and observation residual estimators
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResidualPriors {
    /// Model residual (raw field minus mean-field prediction)
    pub model: StatsPrior,
    /// Observation residual (observed minus base field at the station)
    pub observation: StatsPrior,
}

impl Default for ResidualPriors {
    fn default() -> Self {
        Self {
            model: StatsPrior {
                mean: 0.0,
                variance: 0.03,
                count: 1,
            },
            observation: StatsPrior {
                mean: 0.0,
                variance: 0.1,
                count: 1,
            },
        }
    }
}

/// Timestamp matching policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimeMatchingConfig {
    /// Largest accepted distance between a measurement and the nearest
    /// model timestep (seconds); 0 requires exact equality
    pub tolerance_secs: i64,
}

impl AssimilationConfig {
    /// Number of fuel-moisture classes per cell
    pub fn fuel_classes(&self) -> usize {
        self.fuel.time_constants_hours.len()
    }

    /// Reject malformed parameters
    ///
    /// # Errors
    /// Returns `Configuration` naming the first invalid parameter
    pub fn validate(&self) -> Result<()> {
        let fuel = &self.fuel;
        if fuel.time_constants_hours.is_empty() {
            return Err(invalid("fuel.time_constants_hours", "needs at least one class"));
        }
        if fuel
            .time_constants_hours
            .iter()
            .any(|t| !t.is_finite() || *t <= 0.0)
        {
            return Err(invalid("fuel.time_constants_hours", "must be finite and positive"));
        }
        if fuel.observed_class >= fuel.time_constants_hours.len() {
            return Err(invalid(
                "fuel.observed_class",
                &format!(
                    "{} is not one of the {} classes",
                    fuel.observed_class,
                    fuel.time_constants_hours.len()
                ),
            ));
        }
        non_negative("fuel.initial_variance", fuel.initial_variance)?;
        non_negative("fuel.process_noise", fuel.process_noise)?;
        non_negative("fuel.bias_process_noise", fuel.bias_process_noise)?;

        positive("rain.saturation", self.rain.saturation)?;
        positive(
            "rain.wetting_time_constant_hours",
            self.rain.wetting_time_constant_hours,
        )?;
        non_negative("rain.threshold_mm_h", self.rain.threshold_mm_h)?;
        positive(
            "rain.saturation_intensity_mm_h",
            self.rain.saturation_intensity_mm_h,
        )?;

        positive("correlation.base", self.correlation.base)?;
        if self.correlation.base > 1.0 {
            return Err(invalid("correlation.base", "must not exceed 1"));
        }
        non_negative("correlation.slope_per_km", self.correlation.slope_per_km)?;

        if self.kriging.max_condition_number.is_nan() || self.kriging.max_condition_number <= 1.0 {
            return Err(invalid("kriging.max_condition_number", "must exceed 1"));
        }
        if let Some(gamma) = self.mean_field.locked_gamma {
            if !gamma.is_finite() {
                return Err(invalid("mean_field.locked_gamma", "must be finite"));
            }
        }
        non_negative(
            "residual_priors.model.variance",
            self.residual_priors.model.variance,
        )?;
        non_negative(
            "residual_priors.observation.variance",
            self.residual_priors.observation.variance,
        )?;
        if self.time_matching.tolerance_secs < 0 {
            return Err(invalid("time_matching.tolerance_secs", "must not be negative"));
        }
        Ok(())
    }
}

fn invalid(name: &str, reason: &str) -> AssimilationError {
    AssimilationError::Configuration(format!("{name}: {reason}"))
}

fn positive(name: &str, value: f64) -> Result<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(invalid(name, &format!("must be finite and positive, got {value}")))
    }
}

fn non_negative(name: &str, value: f64) -> Result<()> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(invalid(name, &format!("must be finite and non-negative, got {value}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = AssimilationConfig::default();
        config.validate().unwrap();
        assert_eq!(config.fuel_classes(), 3);
        assert_eq!(config.fuel.observed_class, 1);
    }

    #[test]
    fn test_observed_class_out_of_range() {
        let mut config = AssimilationConfig::default();
        config.fuel.observed_class = 3;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("fuel.observed_class"), "{err}");
    }

    #[test]
    fn test_non_positive_time_constant() {
        let mut config = AssimilationConfig::default();
        config.fuel.time_constants_hours = vec![1.0, 0.0];
        config.fuel.observed_class = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_correlation_base_bounded() {
        let mut config = AssimilationConfig::default();
        config.correlation.base = 1.2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: AssimilationConfig =
            serde_json::from_str(r#"{"fuel": {"observed_class": 0}}"#).unwrap();
        assert_eq!(config.fuel.observed_class, 0);
        assert_eq!(config.fuel.time_constants_hours, vec![1.0, 10.0, 100.0]);
        assert_eq!(config.correlation, CorrelationConfig::default());
    }

    #[test]
    fn test_unknown_field_rejected() {
        let parsed: std::result::Result<AssimilationConfig, _> =
            serde_json::from_str(r#"{"fuel": {"observed": 0}}"#);
        assert!(parsed.is_err());
    }
}

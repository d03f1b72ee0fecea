//! Weather forcing supplied to the assimilation loop
//!
//! The gridded weather model itself lives outside this crate; the loop
//! only sees it through [`ForcingSource`].

use crate::core_types::{GridField, GridShape};
use crate::error::{AssimilationError, Result};
use crate::physics::equilibrium::{equilibrium_fields, nominal_equilibrium};
use chrono::{DateTime, Utc};

/// Forcing fields of one model timestep
#[derive(Debug, Clone, PartialEq)]
pub struct StepForcing {
    /// Drying equilibrium moisture per cell (fraction)
    pub drying: GridField,
    /// Wetting equilibrium moisture per cell (fraction)
    pub wetting: GridField,
    /// Precipitation accumulated since the start of the run (mm)
    pub accumulated_precipitation: GridField,
}

impl StepForcing {
    /// Derive equilibria from surface pressure (Pa), mixing ratio (kg/kg)
    /// and temperature (K)
    ///
    /// # Errors
    /// Returns `DimensionMismatch` if the fields differ in shape
    pub fn from_weather(
        pressure: &GridField,
        mixing_ratio: &GridField,
        temperature: &GridField,
        accumulated_precipitation: GridField,
    ) -> Result<Self> {
        let (drying, wetting) = equilibrium_fields(pressure, mixing_ratio, temperature)?;
        let forcing = Self {
            drying,
            wetting,
            accumulated_precipitation,
        };
        forcing.check_shape(forcing.drying.shape())?;
        Ok(forcing)
    }

    /// Nominal equilibrium ½(Ed + Ew) per cell
    pub fn nominal_equilibrium(&self) -> GridField {
        let mut field = self.drying.clone();
        for (e, &w) in field.as_mut_slice().iter_mut().zip(self.wetting.as_slice()) {
            *e = nominal_equilibrium(*e, w);
        }
        field
    }

    /// Verify every field has `shape`
    ///
    /// # Errors
    /// Returns `DimensionMismatch` naming the first offending field
    pub fn check_shape(&self, shape: GridShape) -> Result<()> {
        for (what, field) in [
            ("drying equilibrium", &self.drying),
            ("wetting equilibrium", &self.wetting),
            ("accumulated precipitation", &self.accumulated_precipitation),
        ] {
            if field.shape() != shape {
                return Err(AssimilationError::dimension(
                    what,
                    shape.len(),
                    field.shape().len(),
                ));
            }
        }
        Ok(())
    }
}

/// Source of per-step weather forcing
pub trait ForcingSource {
    /// Model timestamps, one per step, in increasing order
    fn times(&self) -> &[DateTime<Utc>];

    /// Forcing at step `step`
    ///
    /// # Errors
    /// Returns `DataAlignment` if `step` is past the end of the series
    fn forcing(&self, step: usize) -> Result<StepForcing>;
}

/// Forcing held fully in memory
#[derive(Debug, Clone, Default)]
pub struct InMemoryForcing {
    times: Vec<DateTime<Utc>>,
    steps: Vec<StepForcing>,
}

impl InMemoryForcing {
    /// Empty series
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a step
    ///
    /// # Errors
    /// - `DataAlignment` if `time` does not follow the previous step
    /// - `DimensionMismatch` if the fields differ in shape from earlier steps
    pub fn push(&mut self, time: DateTime<Utc>, forcing: StepForcing) -> Result<()> {
        if let Some(&last) = self.times.last() {
            if time <= last {
                return Err(AssimilationError::DataAlignment(format!(
                    "forcing time {time} does not follow {last}"
                )));
            }
        }
        let shape = self
            .steps
            .first()
            .map_or(forcing.drying.shape(), |s| s.drying.shape());
        forcing.check_shape(shape)?;
        self.times.push(time);
        self.steps.push(forcing);
        Ok(())
    }

    /// Number of steps
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// True if no step was added
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl ForcingSource for InMemoryForcing {
    fn times(&self) -> &[DateTime<Utc>] {
        &self.times
    }

    fn forcing(&self, step: usize) -> Result<StepForcing> {
        self.steps.get(step).cloned().ok_or_else(|| {
            AssimilationError::DataAlignment(format!(
                "forcing step {step} requested, series has {}",
                self.steps.len()
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn step(shape: GridShape, e: f64) -> StepForcing {
        StepForcing {
            drying: GridField::with_value(shape, e + 0.01),
            wetting: GridField::with_value(shape, e - 0.01),
            accumulated_precipitation: GridField::zeros(shape),
        }
    }

    #[test]
    fn test_push_and_read_back() {
        let shape = GridShape::new(2, 3);
        let t0 = Utc.with_ymd_and_hms(2012, 6, 1, 0, 0, 0).unwrap();
        let mut forcing = InMemoryForcing::new();
        forcing.push(t0, step(shape, 0.1)).unwrap();
        forcing
            .push(t0 + Duration::minutes(10), step(shape, 0.2))
            .unwrap();
        assert_eq!(forcing.times().len(), 2);
        let second = forcing.forcing(1).unwrap();
        assert!((second.nominal_equilibrium().get(1, 2) - 0.2).abs() < 1e-12);
        assert!(forcing.forcing(2).is_err());
    }

    #[test]
    fn test_times_must_increase() {
        let shape = GridShape::new(1, 1);
        let t0 = Utc.with_ymd_and_hms(2012, 6, 1, 0, 0, 0).unwrap();
        let mut forcing = InMemoryForcing::new();
        forcing.push(t0, step(shape, 0.1)).unwrap();
        assert!(matches!(
            forcing.push(t0, step(shape, 0.1)),
            Err(AssimilationError::DataAlignment(_))
        ));
    }

    #[test]
    fn test_shape_must_match() {
        let t0 = Utc.with_ymd_and_hms(2012, 6, 1, 0, 0, 0).unwrap();
        let mut forcing = InMemoryForcing::new();
        forcing.push(t0, step(GridShape::new(2, 2), 0.1)).unwrap();
        let err = forcing
            .push(t0 + Duration::hours(1), step(GridShape::new(3, 2), 0.1))
            .unwrap_err();
        assert!(matches!(err, AssimilationError::DimensionMismatch { .. }));
    }

    #[test]
    fn test_from_weather() {
        let shape = GridShape::new(2, 2);
        let forcing = StepForcing::from_weather(
            &GridField::with_value(shape, 90_000.0),
            &GridField::with_value(shape, 0.006),
            &GridField::with_value(shape, 295.0),
            GridField::zeros(shape),
        )
        .unwrap();
        assert!(forcing.drying.get(0, 0) > forcing.wetting.get(0, 0));
    }
}

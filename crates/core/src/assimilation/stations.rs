//! Station pre-processing: matching measurements to grid cells and model steps
//!
//! Turns raw station series into the observation schedule consumed by the
//! assimilation loop. Measurements that cannot be aligned (station outside
//! the domain, no model step within tolerance, non-finite value, second
//! measurement for an already matched step) are dropped and recorded
//! under `obs_dropped`.

use crate::assimilation::diagnostics::{Diagnostics, TAG_OBS_DROPPED};
use crate::assimilation::forcing::ForcingSource;
use crate::core_types::{GridField, ModelGrid, Observation, StationId, TimeSlice};
use crate::error::Result;
use chrono::{DateTime, Utc};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Raw measurement series of one station
#[derive(Debug, Clone, PartialEq)]
pub struct StationSeries {
    id: StationId,
    lon: f64,
    lat: f64,
    measurements: BTreeMap<DateTime<Utc>, f64>,
}

impl StationSeries {
    /// Station with no measurements yet
    pub fn new(id: StationId, lon: f64, lat: f64) -> Self {
        Self {
            id,
            lon,
            lat,
            measurements: BTreeMap::new(),
        }
    }

    /// Add a measurement, replacing any earlier value at the same time
    pub fn insert(&mut self, time: DateTime<Utc>, value: f64) {
        self.measurements.insert(time, value);
    }

    /// Station identifier
    pub fn id(&self) -> &StationId {
        &self.id
    }

    /// `(lon, lat)` of the station
    pub fn lonlat(&self) -> (f64, f64) {
        (self.lon, self.lat)
    }

    /// Measurements in time order
    pub fn measurements(&self) -> impl Iterator<Item = (DateTime<Utc>, f64)> + '_ {
        self.measurements.iter().map(|(&t, &v)| (t, v))
    }
}

/// Step index -> observations, plus the stations that reported at least once
#[derive(Debug, Clone, Default)]
pub struct ObservationSchedule {
    slices: BTreeMap<usize, TimeSlice>,
    roster: Vec<StationId>,
}

impl ObservationSchedule {
    /// Schedule from already matched slices
    pub fn from_slices(slices: BTreeMap<usize, TimeSlice>) -> Self {
        let mut roster: Vec<StationId> = slices
            .values()
            .flat_map(|s| s.iter().map(|o| o.station().clone()))
            .collect();
        roster.sort();
        roster.dedup();
        Self { slices, roster }
    }

    /// Observations matched to step `step`
    pub fn slice(&self, step: usize) -> Option<&TimeSlice> {
        self.slices.get(&step)
    }

    /// Sorted ids of every station in the schedule
    pub fn roster(&self) -> &[StationId] {
        &self.roster
    }

    /// Number of steps with at least one observation
    pub fn len(&self) -> usize {
        self.slices.len()
    }

    /// True if no observation was matched
    pub fn is_empty(&self) -> bool {
        self.slices.is_empty()
    }

    /// Steps with observations, ascending
    pub fn steps(&self) -> impl Iterator<Item = usize> + '_ {
        self.slices.keys().copied()
    }
}

/// Index of the model time nearest to `time` within `tolerance_secs`
///
/// `times` must be increasing. Ties go to the earlier step. A tolerance of
/// 0 requires exact equality.
pub fn match_time(
    times: &[DateTime<Utc>],
    time: DateTime<Utc>,
    tolerance_secs: i64,
) -> Option<usize> {
    let after = times.partition_point(|&t| t < time);
    let distance = |idx: usize| (times[idx] - time).num_seconds().abs();
    let best = match (after.checked_sub(1), (after < times.len()).then_some(after)) {
        (Some(before), Some(after)) => {
            if distance(after) < distance(before) {
                after
            } else {
                before
            }
        }
        (Some(before), None) => before,
        (None, Some(after)) => after,
        (None, None) => return None,
    };
    (distance(best) <= tolerance_secs && (tolerance_secs > 0 || times[best] == time))
        .then_some(best)
}

struct Matched {
    step: usize,
    time: DateTime<Utc>,
    value: f64,
}

/// Build the observation schedule from raw station series
///
/// Each station is resolved to its nearest grid cell, each measurement to
/// a model step. The station's residual standard deviation is the
/// population standard deviation of (observed − ½(Ed + Ew)) at its cell over
/// all matched steps.
///
/// # Errors
/// Propagates forcing failures; alignment problems only drop measurements.
pub fn build_observation_schedule(
    stations: &[StationSeries],
    grid: &ModelGrid,
    forcing: &dyn ForcingSource,
    tolerance_secs: i64,
    diagnostics: &mut Diagnostics,
) -> Result<ObservationSchedule> {
    let times = forcing.times();
    let mut nominal: BTreeMap<usize, GridField> = BTreeMap::new();
    let mut slices: BTreeMap<usize, TimeSlice> = BTreeMap::new();
    let mut dropped = 0usize;

    for station in stations {
        let (lon, lat) = station.lonlat();
        let cell = match grid.nearest_cell(lon, lat) {
            Ok(cell) => cell,
            Err(err) => {
                let n = station.measurements.len();
                dropped += n;
                diagnostics.push(
                    TAG_OBS_DROPPED,
                    format!("{}: {err} ({n} measurements)", station.id),
                );
                continue;
            }
        };

        let mut matched: BTreeMap<usize, Matched> = BTreeMap::new();
        for (time, value) in station.measurements() {
            let reason = if !value.is_finite() {
                Some("non-finite value".to_owned())
            } else {
                match match_time(times, time, tolerance_secs) {
                    None => Some("no model step within tolerance".to_owned()),
                    Some(step) => match matched.entry(step) {
                        Entry::Occupied(_) => Some(format!("second measurement for step {step}")),
                        Entry::Vacant(slot) => {
                            slot.insert(Matched { step, time, value });
                            None
                        }
                    },
                }
            };
            if let Some(reason) = reason {
                dropped += 1;
                diagnostics.push(TAG_OBS_DROPPED, format!("{} at {time}: {reason}", station.id));
            }
        }
        if matched.is_empty() {
            continue;
        }

        let mut residuals = Vec::with_capacity(matched.len());
        for m in matched.values() {
            let field = match nominal.entry(m.step) {
                Entry::Occupied(e) => e.into_mut(),
                Entry::Vacant(e) => e.insert(forcing.forcing(m.step)?.nominal_equilibrium()),
            };
            residuals.push(m.value - field.as_slice()[cell]);
        }
        let residual_std = population_std(&residuals);
        debug!(
            "Station {} -> cell {}, {} matched, residual std {:.4}",
            station.id,
            cell,
            residuals.len(),
            residual_std
        );

        let cell_lonlat = grid.lonlat(cell);
        for m in matched.into_values() {
            let obs = Observation::new(
                station.id.clone(),
                m.time,
                m.value,
                residual_std,
                cell,
                cell_lonlat,
            )
            .at_station(lon, lat);
            slices.entry(m.step).or_default().insert(obs);
        }
    }

    let schedule = ObservationSchedule::from_slices(slices);
    info!(
        "Observation schedule: {} stations over {} steps, {} measurements dropped",
        schedule.roster().len(),
        schedule.len(),
        dropped
    );
    Ok(schedule)
}

fn population_std(values: &[f64]) -> f64 {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assimilation::forcing::{InMemoryForcing, StepForcing};
    use crate::core_types::GridShape;
    use approx::assert_relative_eq;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2012, 6, 1, 0, 0, 0).unwrap()
    }

    fn forcing(shape: GridShape, steps: usize) -> InMemoryForcing {
        let mut forcing = InMemoryForcing::new();
        for k in 0..steps {
            let e = 0.10 + 0.01 * k as f64;
            forcing
                .push(
                    t0() + Duration::minutes(10 * k as i64),
                    StepForcing {
                        drying: GridField::with_value(shape, e + 0.02),
                        wetting: GridField::with_value(shape, e - 0.02),
                        accumulated_precipitation: GridField::zeros(shape),
                    },
                )
                .unwrap();
        }
        forcing
    }

    fn grid() -> ModelGrid {
        ModelGrid::regular(GridShape::new(3, 3), -117.0, 33.0, 0.1, 0.1).unwrap()
    }

    #[test]
    fn test_match_time_exact() {
        let times: Vec<_> = (0..3).map(|k| t0() + Duration::minutes(10 * k)).collect();
        assert_eq!(match_time(&times, times[1], 0), Some(1));
        assert_eq!(match_time(&times, times[1] + Duration::seconds(1), 0), None);
    }

    #[test]
    fn test_match_time_tolerance_and_ties() {
        let times: Vec<_> = (0..3).map(|k| t0() + Duration::minutes(10 * k)).collect();
        assert_eq!(match_time(&times, t0() + Duration::minutes(4), 300), Some(0));
        assert_eq!(match_time(&times, t0() + Duration::minutes(6), 300), Some(1));
        // exactly halfway goes to the earlier step
        assert_eq!(match_time(&times, t0() + Duration::minutes(5), 300), Some(0));
        assert_eq!(match_time(&times, t0() + Duration::minutes(40), 300), None);
        assert_eq!(match_time(&[], t0(), 300), None);
    }

    #[test]
    fn test_schedule_groups_by_step() {
        let grid = grid();
        let forcing = forcing(grid.shape(), 3);
        let mut a = StationSeries::new(StationId::new("a"), -116.9, 33.1);
        a.insert(t0(), 0.12);
        a.insert(t0() + Duration::minutes(20), 0.16);
        let mut b = StationSeries::new(StationId::new("b"), -116.8, 33.2);
        b.insert(t0() + Duration::minutes(20), 0.11);
        let mut diag = Diagnostics::new();

        let schedule = build_observation_schedule(&[a, b], &grid, &forcing, 0, &mut diag).unwrap();

        assert_eq!(schedule.steps().collect::<Vec<_>>(), vec![0, 2]);
        assert_eq!(schedule.slice(2).unwrap().len(), 2);
        assert_eq!(schedule.roster().len(), 2);
        let obs = schedule.slice(0).unwrap().get(&StationId::new("a")).unwrap();
        assert_eq!(obs.grid_index(), 4);
        assert_eq!(obs.station_lonlat(), (-116.9, 33.1));
        assert_eq!(obs.cell_lonlat(), grid.lonlat(4));
        // residuals 0.12 - 0.10 and 0.16 - 0.12 -> both 0.02 and 0.04, std 0.01
        assert_relative_eq!(obs.residual_std(), 0.01, epsilon = 1e-12);
        assert!(diag.pull(TAG_OBS_DROPPED).is_empty());
    }

    #[test]
    fn test_outside_domain_and_unmatched_are_recorded() {
        let grid = grid();
        let forcing = forcing(grid.shape(), 2);
        let mut outside = StationSeries::new(StationId::new("far"), -100.0, 40.0);
        outside.insert(t0(), 0.1);
        let mut late = StationSeries::new(StationId::new("late"), -117.0, 33.0);
        late.insert(t0() + Duration::minutes(3), 0.1);
        late.insert(t0() + Duration::minutes(10), f64::NAN);
        let mut diag = Diagnostics::new();

        let schedule =
            build_observation_schedule(&[outside, late], &grid, &forcing, 0, &mut diag).unwrap();

        assert!(schedule.is_empty());
        assert_eq!(diag.pull(TAG_OBS_DROPPED).len(), 3);
    }

    #[test]
    fn test_single_match_has_zero_residual_std() {
        let grid = grid();
        let forcing = forcing(grid.shape(), 1);
        let mut s = StationSeries::new(StationId::new("s"), -117.0, 33.0);
        s.insert(t0(), 0.3);
        let mut diag = Diagnostics::new();
        let schedule = build_observation_schedule(&[s], &grid, &forcing, 0, &mut diag).unwrap();
        let obs = schedule.slice(0).unwrap().iter().next().unwrap();
        assert_eq!(obs.residual_std(), 0.0);
    }
}

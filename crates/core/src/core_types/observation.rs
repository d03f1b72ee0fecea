//! Station observations matched to the model grid

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Identifier of an observation station
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StationId(pub String);

impl StationId {
    /// Create a station identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for StationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One station measurement matched to a model time step and grid cell
///
/// Carries both the station's own coordinates and those of the cell it
/// was matched to. Spatial correlation is evaluated between cell
/// positions, so a station and the cell it sits in are treated alike.
/// Created once during pre-processing and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    station: StationId,
    time: DateTime<Utc>,
    value: f64,
    residual_std: f64,
    grid_index: usize,
    cell_lon: f64,
    cell_lat: f64,
    station_lon: f64,
    station_lat: f64,
}

impl Observation {
    /// Create an observation
    ///
    /// `grid_index` is the linear offset of the nearest model cell,
    /// `cell_lonlat` that cell's position and `residual_std` the estimated
    /// standard deviation of observed-minus-model residuals for this
    /// station. The station position defaults to the cell position; set it
    /// with [`Observation::at_station`].
    pub fn new(
        station: StationId,
        time: DateTime<Utc>,
        value: f64,
        residual_std: f64,
        grid_index: usize,
        cell_lonlat: (f64, f64),
    ) -> Self {
        Self {
            station,
            time,
            value,
            residual_std,
            grid_index,
            cell_lon: cell_lonlat.0,
            cell_lat: cell_lonlat.1,
            station_lon: cell_lonlat.0,
            station_lat: cell_lonlat.1,
        }
    }

    /// Record the station's own `(lon, lat)`
    #[must_use]
    pub fn at_station(mut self, lon: f64, lat: f64) -> Self {
        self.station_lon = lon;
        self.station_lat = lat;
        self
    }

    /// Reporting station
    pub fn station(&self) -> &StationId {
        &self.station
    }

    /// Model timestamp the measurement was matched to
    pub fn time(&self) -> DateTime<Utc> {
        self.time
    }

    /// Observed fuel moisture (fraction)
    pub fn value(&self) -> f64 {
        self.value
    }

    /// Estimated residual standard deviation
    pub fn residual_std(&self) -> f64 {
        self.residual_std
    }

    /// Linear offset of the nearest grid cell
    pub fn grid_index(&self) -> usize {
        self.grid_index
    }

    /// `(lon, lat)` of the matched grid cell
    pub fn cell_lonlat(&self) -> (f64, f64) {
        (self.cell_lon, self.cell_lat)
    }

    /// `(lon, lat)` of the station itself
    pub fn station_lonlat(&self) -> (f64, f64) {
        (self.station_lon, self.station_lat)
    }
}

/// All observations active at one timestamp, keyed by station
///
/// Iteration order is the station id order, so results computed from a
/// slice never depend on how it was assembled.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeSlice {
    observations: BTreeMap<StationId, Observation>,
}

impl TimeSlice {
    /// Empty slice
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the observation of its station
    pub fn insert(&mut self, obs: Observation) -> Option<Observation> {
        self.observations.insert(obs.station().clone(), obs)
    }

    /// Number of reporting stations
    pub fn len(&self) -> usize {
        self.observations.len()
    }

    /// True when no station reported
    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    /// Observation of `station`, if it reported
    pub fn get(&self, station: &StationId) -> Option<&Observation> {
        self.observations.get(station)
    }

    /// Observations in station order
    pub fn iter(&self) -> impl Iterator<Item = &Observation> {
        self.observations.values()
    }

    /// Observed values in station order
    pub fn values(&self) -> Vec<f64> {
        self.iter().map(Observation::value).collect()
    }
}

impl FromIterator<Observation> for TimeSlice {
    fn from_iter<I: IntoIterator<Item = Observation>>(iter: I) -> Self {
        let mut slice = Self::new();
        for obs in iter {
            slice.insert(obs);
        }
        slice
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn obs(id: &str, value: f64) -> Observation {
        let t = Utc.with_ymd_and_hms(2007, 10, 22, 12, 0, 0).unwrap();
        Observation::new(StationId::new(id), t, value, 0.02, 0, (-116.6, 33.0))
    }

    #[test]
    fn test_slice_order_independent_of_insertion() {
        let a: TimeSlice = [obs("b", 0.2), obs("a", 0.1)].into_iter().collect();
        let b: TimeSlice = [obs("a", 0.1), obs("b", 0.2)].into_iter().collect();
        assert_eq!(a, b);
        assert_eq!(a.values(), vec![0.1, 0.2]);
    }

    #[test]
    fn test_station_position_defaults_to_cell() {
        let o = obs("a", 0.1);
        assert_eq!(o.station_lonlat(), o.cell_lonlat());
        let o = o.at_station(-116.62, 33.01);
        assert_eq!(o.station_lonlat(), (-116.62, 33.01));
        assert_eq!(o.cell_lonlat(), (-116.6, 33.0));
    }

    #[test]
    fn test_slice_replaces_duplicate_station() {
        let mut slice = TimeSlice::new();
        assert!(slice.insert(obs("a", 0.1)).is_none());
        assert!(slice.insert(obs("a", 0.3)).is_some());
        assert_eq!(slice.len(), 1);
        assert_eq!(slice.get(&StationId::new("a")).unwrap().value(), 0.3);
    }
}

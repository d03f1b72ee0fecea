//! Geographic model grid and great-circle geometry

use super::field::{GridField, GridShape};
use crate::error::{AssimilationError, Result};
use serde::{Deserialize, Serialize};

/// Mean Earth radius used by the spherical approximation (km)
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Great-circle distance in km between two lon/lat points (degrees)
///
/// Haversine formula on a spherical Earth.
pub fn great_circle_distance(lon1: f64, lat1: f64, lon2: f64, lat2: f64) -> f64 {
    let (phi1, phi2) = (lat1.to_radians(), lat2.to_radians());
    let dphi = phi2 - phi1;
    let dlambda = (lon2 - lon1).to_radians();

    let a = (dphi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (dlambda / 2.0).sin().powi(2);
    // clamp guards against a > 1 from rounding for antipodal points
    2.0 * EARTH_RADIUS_KM * a.sqrt().min(1.0).asin()
}

/// Grid of cell centres with their geographic coordinates
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelGrid {
    lons: GridField,
    lats: GridField,
}

impl ModelGrid {
    /// Create a grid from longitude and latitude fields of the same shape
    ///
    /// # Errors
    /// Returns `DimensionMismatch` if the fields disagree in shape and
    /// `Configuration` for an empty grid
    pub fn new(lons: GridField, lats: GridField) -> Result<Self> {
        if lons.shape() != lats.shape() {
            return Err(AssimilationError::dimension(
                "latitude field",
                lons.shape().len(),
                lats.shape().len(),
            ));
        }
        if lons.shape().is_empty() {
            return Err(AssimilationError::Configuration(
                "model grid has no cells".into(),
            ));
        }
        Ok(Self { lons, lats })
    }

    /// Regular lon/lat lattice starting at the south-west corner
    pub fn regular(
        shape: GridShape,
        lon0: f64,
        lat0: f64,
        dlon: f64,
        dlat: f64,
    ) -> Result<Self> {
        let lons = GridField::from_fn(shape, |_, col| lon0 + dlon * col as f64);
        let lats = GridField::from_fn(shape, |row, _| lat0 + dlat * row as f64);
        Self::new(lons, lats)
    }

    /// Grid shape
    pub fn shape(&self) -> GridShape {
        self.lons.shape()
    }

    /// Number of cells
    pub fn len(&self) -> usize {
        self.shape().len()
    }

    /// Always false for a constructed grid
    pub fn is_empty(&self) -> bool {
        self.shape().is_empty()
    }

    /// `(lon, lat)` of the cell at linear offset `idx`
    pub fn lonlat(&self, idx: usize) -> (f64, f64) {
        (self.lons.as_slice()[idx], self.lats.as_slice()[idx])
    }

    /// Longitude field
    pub fn lons(&self) -> &GridField {
        &self.lons
    }

    /// Latitude field
    pub fn lats(&self) -> &GridField {
        &self.lats
    }

    /// Great-circle distance (km) between a cell and an arbitrary point
    pub fn distance_to(&self, idx: usize, lon: f64, lat: f64) -> f64 {
        let (clon, clat) = self.lonlat(idx);
        great_circle_distance(clon, clat, lon, lat)
    }

    /// Whether a point lies inside the lon/lat bounding box of the cell centres
    pub fn contains(&self, lon: f64, lat: f64) -> bool {
        let (lo_min, lo_max) = bounds(self.lons.as_slice());
        let (la_min, la_max) = bounds(self.lats.as_slice());
        (lo_min..=lo_max).contains(&lon) && (la_min..=la_max).contains(&lat)
    }

    /// Linear offset of the cell nearest to `(lon, lat)` by great-circle distance
    ///
    /// # Errors
    /// Returns `DataAlignment` when the point is outside the model domain
    pub fn nearest_cell(&self, lon: f64, lat: f64) -> Result<usize> {
        if !self.contains(lon, lat) {
            return Err(AssimilationError::DataAlignment(format!(
                "point ({lon:.4}, {lat:.4}) lies outside the model domain"
            )));
        }
        let mut best = (0, f64::INFINITY);
        for idx in 0..self.len() {
            let d = self.distance_to(idx, lon, lat);
            if d < best.1 {
                best = (idx, d);
            }
        }
        Ok(best.0)
    }
}

fn bounds(values: &[f64]) -> (f64, f64) {
    values
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_distance_zero_for_same_point() {
        assert_eq!(great_circle_distance(-116.5, 33.0, -116.5, 33.0), 0.0);
    }

    #[test]
    fn test_distance_one_degree_latitude() {
        // one degree of arc on a 6371 km sphere
        let d = great_circle_distance(0.0, 0.0, 0.0, 1.0);
        assert_relative_eq!(d, 111.19, epsilon = 0.01);
    }

    #[test]
    fn test_distance_symmetric() {
        let d1 = great_circle_distance(-117.1, 32.7, -116.6, 33.1);
        let d2 = great_circle_distance(-116.6, 33.1, -117.1, 32.7);
        assert_relative_eq!(d1, d2, epsilon = 1e-12);
    }

    #[test]
    fn test_nearest_cell() {
        let grid = ModelGrid::regular(GridShape::new(3, 3), -117.0, 33.0, 0.1, 0.1).unwrap();
        let idx = grid.nearest_cell(-116.91, 33.12).unwrap();
        assert_eq!(grid.shape().position(idx), (1, 1));
    }

    #[test]
    fn test_point_outside_domain() {
        let grid = ModelGrid::regular(GridShape::new(3, 3), -117.0, 33.0, 0.1, 0.1).unwrap();
        let err = grid.nearest_cell(-118.0, 33.1).unwrap_err();
        assert!(matches!(err, AssimilationError::DataAlignment(_)));
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        let lons = GridField::zeros(GridShape::new(2, 2));
        let lats = GridField::zeros(GridShape::new(2, 3));
        assert!(ModelGrid::new(lons, lats).is_err());
    }
}

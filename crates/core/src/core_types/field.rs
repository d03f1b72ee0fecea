//! Grid-shaped scalar fields
//!
//! Every per-cell quantity handed across module boundaries (fuel moisture of
//! one class, kriged mean, kriging variance, Kalman gain, ...) is a
//! [`GridField`]: a flat `Vec<f64>` in row-major order addressable by
//! `(row, col)` or by linear offset.

use serde::{Deserialize, Serialize};

/// Shape of the model grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GridShape {
    /// Number of rows (south-north)
    pub rows: usize,
    /// Number of columns (west-east)
    pub cols: usize,
}

impl GridShape {
    /// Create a new shape
    pub fn new(rows: usize, cols: usize) -> Self {
        Self { rows, cols }
    }

    /// Total number of cells
    pub fn len(&self) -> usize {
        self.rows * self.cols
    }

    /// True for a degenerate 0-cell grid
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Linear offset of `(row, col)`, or `None` when outside the grid
    pub fn offset(&self, row: usize, col: usize) -> Option<usize> {
        (row < self.rows && col < self.cols).then_some(row * self.cols + col)
    }

    /// Inverse of [`GridShape::offset`]
    pub fn position(&self, offset: usize) -> (usize, usize) {
        (offset / self.cols, offset % self.cols)
    }
}

/// Field data stored row-major (`row * cols + col`)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridField {
    data: Vec<f64>,
    shape: GridShape,
}

impl GridField {
    /// Field of zeros
    #[must_use]
    pub fn zeros(shape: GridShape) -> Self {
        Self::with_value(shape, 0.0)
    }

    /// Field with every cell set to `value`
    #[must_use]
    pub fn with_value(shape: GridShape, value: f64) -> Self {
        Self {
            data: vec![value; shape.len()],
            shape,
        }
    }

    /// Wrap row-major data, `None` if the length does not match the shape
    pub fn from_vec(shape: GridShape, data: Vec<f64>) -> Option<Self> {
        (data.len() == shape.len()).then_some(Self { data, shape })
    }

    /// Build a field by evaluating `f(row, col)` for each cell
    pub fn from_fn(shape: GridShape, mut f: impl FnMut(usize, usize) -> f64) -> Self {
        let data = (0..shape.len())
            .map(|idx| {
                let (row, col) = shape.position(idx);
                f(row, col)
            })
            .collect();
        Self { data, shape }
    }

    /// Grid shape
    pub fn shape(&self) -> GridShape {
        self.shape
    }

    /// Row-major values
    #[must_use]
    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    /// Mutable row-major values
    pub fn as_mut_slice(&mut self) -> &mut [f64] {
        &mut self.data
    }

    /// Consume into the underlying vector
    pub fn into_vec(self) -> Vec<f64> {
        self.data
    }

    /// Value at `(row, col)`
    ///
    /// # Panics
    ///
    /// Panics if coordinates are out of bounds
    #[must_use]
    pub fn get(&self, row: usize, col: usize) -> f64 {
        let idx = self
            .shape
            .offset(row, col)
            .expect("Coordinates out of bounds");
        self.data[idx]
    }

    /// Set value at `(row, col)`
    ///
    /// # Panics
    ///
    /// Panics if coordinates are out of bounds
    pub fn set(&mut self, row: usize, col: usize, value: f64) {
        let idx = self
            .shape
            .offset(row, col)
            .expect("Coordinates out of bounds");
        self.data[idx] = value;
    }

    /// Apply `f` to every value, returning a new field
    #[must_use]
    pub fn map(&self, f: impl Fn(f64) -> f64) -> Self {
        Self {
            data: self.data.iter().map(|&v| f(v)).collect(),
            shape: self.shape,
        }
    }

    /// Arithmetic mean over all cells (NaN for an empty grid)
    pub fn mean(&self) -> f64 {
        self.data.iter().sum::<f64>() / self.data.len() as f64
    }

    /// Largest value (NaN-free fields only)
    pub fn max(&self) -> f64 {
        self.data.iter().copied().fold(f64::NEG_INFINITY, f64::max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_creation() {
        let field = GridField::zeros(GridShape::new(10, 20));
        assert_eq!(field.shape().rows, 10);
        assert_eq!(field.shape().cols, 20);
        assert_eq!(field.as_slice().len(), 200);
        assert!(field.as_slice().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_field_get_set_row_major() {
        let mut field = GridField::zeros(GridShape::new(4, 10));
        field.set(3, 4, 0.25);
        assert_eq!(field.get(3, 4), 0.25);
        assert_eq!(field.as_slice()[3 * 10 + 4], 0.25);
    }

    #[test]
    fn test_from_vec_rejects_wrong_length() {
        assert!(GridField::from_vec(GridShape::new(2, 2), vec![0.0; 3]).is_none());
        assert!(GridField::from_vec(GridShape::new(2, 2), vec![0.0; 4]).is_some());
    }

    #[test]
    fn test_offset_position_inverse() {
        let shape = GridShape::new(3, 5);
        for idx in 0..shape.len() {
            let (row, col) = shape.position(idx);
            assert_eq!(shape.offset(row, col), Some(idx));
        }
        assert_eq!(shape.offset(3, 0), None);
        assert_eq!(shape.offset(0, 5), None);
    }

    #[test]
    #[should_panic(expected = "Coordinates out of bounds")]
    fn test_field_bounds_check() {
        let field = GridField::zeros(GridShape::new(10, 10));
        let _ = field.get(10, 5);
    }
}

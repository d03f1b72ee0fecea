//! Online mean/variance of a vector-valued residual stream
//!
//! Knuth/Welford one-pass update:
//! ```text
//! N += 1
//! δ = x − μ
//! μ += δ / N
//! M2 += δ ⊙ (x − μ)
//! ```
//! which avoids the catastrophic cancellation of a naive sum of squares on
//! long streams. The estimator can be seeded with an informative prior that
//! behaves like `N0` pseudo-samples with the given mean and variance.

use crate::error::{AssimilationError, Result};
use nalgebra::DVector;
use serde::{Deserialize, Serialize};

/// Running elementwise mean and variance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunningStatsEstimator {
    mean: DVector<f64>,
    m2: DVector<f64>,
    count: usize,
}

impl RunningStatsEstimator {
    /// Create an estimator from a prior mean, prior variance and effective
    /// prior sample count
    ///
    /// M2 is seeded as `prior_variance * max(prior_count - 1, 1)`, so with
    /// `prior_count >= 2` [`get_variance`](Self::get_variance) returns the
    /// prior variance until data arrives, and with `prior_count == 1` the
    /// first sample is combined with a prior spread of `prior_variance`.
    /// A zero prior count ignores the prior entirely.
    ///
    /// # Errors
    /// Returns `DimensionMismatch` if mean and variance differ in length and
    /// `Configuration` for negative or non-finite prior variance
    pub fn new(
        prior_mean: DVector<f64>,
        prior_variance: DVector<f64>,
        prior_count: usize,
    ) -> Result<Self> {
        if prior_mean.len() != prior_variance.len() {
            return Err(AssimilationError::dimension(
                "prior variance",
                prior_mean.len(),
                prior_variance.len(),
            ));
        }
        if prior_variance.iter().any(|v| !v.is_finite() || *v < 0.0) {
            return Err(AssimilationError::Configuration(
                "prior variance must be finite and non-negative".into(),
            ));
        }
        let scale = match prior_count {
            0 => 0.0,
            n => n.saturating_sub(1).max(1) as f64,
        };
        Ok(Self {
            mean: prior_mean,
            m2: prior_variance * scale,
            count: prior_count,
        })
    }

    /// Constant prior over `len` elements
    pub fn uniform(len: usize, mean: f64, variance: f64, prior_count: usize) -> Result<Self> {
        Self::new(
            DVector::from_element(len, mean),
            DVector::from_element(len, variance),
            prior_count,
        )
    }

    /// Acquire a new sample and update the statistics
    ///
    /// # Errors
    /// Returns `DimensionMismatch` if the sample length differs from the mean
    pub fn update_with(&mut self, sample: &[f64]) -> Result<()> {
        if sample.len() != self.mean.len() {
            return Err(AssimilationError::dimension(
                "running stats sample",
                self.mean.len(),
                sample.len(),
            ));
        }
        self.count += 1;
        let n = self.count as f64;
        for ((mean, m2), &x) in self.mean.iter_mut().zip(self.m2.iter_mut()).zip(sample) {
            let delta = x - *mean;
            *mean += delta / n;
            *m2 += delta * (x - *mean);
        }
        Ok(())
    }

    /// Sample variance `M2 / (N - 1)`
    ///
    /// # Errors
    /// Returns `InsufficientData` while `N <= 1`
    pub fn get_variance(&self) -> Result<DVector<f64>> {
        if self.count <= 1 {
            return Err(AssimilationError::InsufficientData {
                samples: self.count,
            });
        }
        Ok(&self.m2 / (self.count - 1) as f64)
    }

    /// Current mean estimate
    pub fn get_mean(&self) -> &DVector<f64> {
        &self.mean
    }

    /// Number of samples including the prior count
    pub fn count(&self) -> usize {
        self.count
    }

    /// Length of the tracked vector
    pub fn len(&self) -> usize {
        self.mean.len()
    }

    /// True for a zero-length estimator
    pub fn is_empty(&self) -> bool {
        self.mean.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// Closed-form combination of a prior (n0, mean0, m2_0) with a batch
    fn batch_with_prior(n0: usize, mean0: f64, m2_0: f64, xs: &[f64]) -> (f64, f64) {
        let n = xs.len() as f64;
        let n0 = n0 as f64;
        let xbar = xs.iter().sum::<f64>() / n;
        let ss: f64 = xs.iter().map(|x| (x - xbar).powi(2)).sum();
        let total = n0 + n;
        let mean = (n0 * mean0 + n * xbar) / total;
        let m2 = m2_0 + ss + n0 * n / total * (xbar - mean0).powi(2);
        (mean, m2 / (total - 1.0))
    }

    #[test]
    fn test_matches_batch_with_prior() {
        let xs = [0.12, 0.08, 0.15, 0.11, 0.09, 0.20, 0.14];
        for n0 in [1_usize, 2, 5] {
            let mut est = RunningStatsEstimator::uniform(1, 0.1, 0.03, n0).unwrap();
            for &x in &xs {
                est.update_with(&[x]).unwrap();
            }
            let m2_0 = 0.03 * (n0.saturating_sub(1).max(1)) as f64;
            let (mean, var) = batch_with_prior(n0, 0.1, m2_0, &xs);
            assert_relative_eq!(est.get_mean()[0], mean, epsilon = 1e-12);
            assert_relative_eq!(est.get_variance().unwrap()[0], var, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_matches_plain_sample_variance_without_prior() {
        let xs = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        let mut est = RunningStatsEstimator::uniform(1, 0.0, 0.0, 0).unwrap();
        for &x in &xs {
            est.update_with(&[x]).unwrap();
        }
        assert_relative_eq!(est.get_mean()[0], 5.0, epsilon = 1e-12);
        // sum of squared deviations is 32, n - 1 = 7
        assert_relative_eq!(est.get_variance().unwrap()[0], 32.0 / 7.0, epsilon = 1e-12);
    }

    #[test]
    fn test_elementwise_vector_update() {
        let mut est = RunningStatsEstimator::uniform(2, 0.0, 0.0, 0).unwrap();
        est.update_with(&[1.0, 10.0]).unwrap();
        est.update_with(&[3.0, 10.0]).unwrap();
        let var = est.get_variance().unwrap();
        assert_relative_eq!(est.get_mean()[0], 2.0);
        assert_relative_eq!(var[0], 2.0);
        assert_relative_eq!(var[1], 0.0);
    }

    #[test]
    fn test_stable_on_large_offset() {
        // naive sum-of-squares loses all precision here
        let offset = 1.0e9;
        let mut est = RunningStatsEstimator::uniform(1, 0.0, 0.0, 0).unwrap();
        for x in [4.0, 7.0, 13.0, 16.0] {
            est.update_with(&[offset + x]).unwrap();
        }
        assert_relative_eq!(est.get_variance().unwrap()[0], 30.0, epsilon = 1e-4);
    }

    #[test]
    fn test_variance_needs_two_samples() {
        let mut est = RunningStatsEstimator::uniform(3, 0.0, 0.0, 0).unwrap();
        assert!(matches!(
            est.get_variance(),
            Err(AssimilationError::InsufficientData { samples: 0 })
        ));
        est.update_with(&[1.0, 2.0, 3.0]).unwrap();
        assert!(matches!(
            est.get_variance(),
            Err(AssimilationError::InsufficientData { samples: 1 })
        ));
        est.update_with(&[1.0, 2.0, 3.0]).unwrap();
        assert!(est.get_variance().is_ok());
    }

    #[test]
    fn test_prior_variance_returned_before_data() {
        let est = RunningStatsEstimator::uniform(4, 0.0, 0.03, 3).unwrap();
        let var = est.get_variance().unwrap();
        assert!(var.iter().all(|&v| (v - 0.03).abs() < 1e-15));
    }

    #[test]
    fn test_zero_prior_count_ignores_prior() {
        let mut est = RunningStatsEstimator::uniform(1, 5.0, 1.0, 0).unwrap();
        est.update_with(&[1.0]).unwrap();
        est.update_with(&[3.0]).unwrap();
        assert_relative_eq!(est.get_mean()[0], 2.0);
        assert_relative_eq!(est.get_variance().unwrap()[0], 2.0);
    }

    #[test]
    fn test_sample_shape_checked() {
        let mut est = RunningStatsEstimator::uniform(3, 0.0, 0.1, 1).unwrap();
        assert!(est.update_with(&[1.0, 2.0]).is_err());
        assert_eq!(est.count(), 1);
    }
}

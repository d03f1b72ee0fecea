//! Error taxonomy for the assimilation core
//!
//! Every fallible operation in the crate returns [`AssimilationError`]. The
//! orchestrator decides per variant whether a failure aborts the run
//! (configuration, persistence) or only skips the affected step or cell
//! (numerical instability, data alignment).

use std::path::PathBuf;

/// Errors produced by the assimilation core
#[derive(Debug, thiserror::Error)]
pub enum AssimilationError {
    /// Malformed or missing run parameters, rejected at construction
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// A covariance matrix could not be inverted reliably
    #[error("numerical instability in {context} (condition number {condition_number:e})")]
    NumericalInstability {
        /// Which solve failed (e.g. `"kriging"`, `"kalman"`)
        context: &'static str,
        /// Condition number of the offending matrix (infinite when singular)
        condition_number: f64,
    },

    /// Variance requested before at least two samples were accumulated
    #[error("variance needs at least 2 samples, have {samples}")]
    InsufficientData {
        /// Sample count at the time of the request
        samples: usize,
    },

    /// Observation could not be aligned with the model grid or time axis
    #[error("data alignment: {0}")]
    DataAlignment(String),

    /// Two arrays that must agree in shape do not
    #[error("dimension mismatch in {what}: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// What was being checked
        what: &'static str,
        /// Expected length
        expected: usize,
        /// Supplied length
        actual: usize,
    },

    /// Diagnostics could not be written
    #[error("failed to persist diagnostics to {}: {source}", .path.display())]
    Persistence {
        /// Target file
        path: PathBuf,
        /// Underlying failure
        #[source]
        source: PersistenceFailure,
    },
}

/// Underlying cause of a [`AssimilationError::Persistence`] failure
#[derive(Debug, thiserror::Error)]
pub enum PersistenceFailure {
    /// Filesystem error
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// Serialization error
    #[error(transparent)]
    Serialize(#[from] serde_json::Error),
}

impl AssimilationError {
    /// Shorthand for a dimension check failure
    pub(crate) fn dimension(what: &'static str, expected: usize, actual: usize) -> Self {
        Self::DimensionMismatch {
            what,
            expected,
            actual,
        }
    }

    /// Whether the run may continue after this error by skipping the
    /// affected correction or observation
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::NumericalInstability { .. } | Self::DataAlignment(_)
        )
    }
}

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, AssimilationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_variants() {
        let err = AssimilationError::NumericalInstability {
            context: "kalman",
            condition_number: f64::INFINITY,
        };
        assert!(err.is_recoverable());
        assert!(AssimilationError::DataAlignment("late".into()).is_recoverable());
        assert!(!AssimilationError::Configuration("bad".into()).is_recoverable());
        assert!(!AssimilationError::InsufficientData { samples: 1 }.is_recoverable());
    }

    #[test]
    fn test_messages_carry_context() {
        let err = AssimilationError::dimension("sample", 9, 4);
        assert_eq!(
            err.to_string(),
            "dimension mismatch in sample: expected 9, got 4"
        );
    }
}

//! Per-step output handed to visualization and export collaborators

use crate::core_types::GridField;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Grid-shaped outputs of one assimilation step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSnapshot {
    /// Step index
    pub step: usize,
    /// Model time of the step
    pub time: DateTime<Utc>,
    /// Moisture of each fuel class after correction
    pub moisture: Vec<GridField>,
    /// State variance of the observed class after correction
    pub observed_variance: GridField,
    /// Mean-field prediction of the observed class
    pub predicted: GridField,
    /// Kriged pseudo-observations, when the step had observations
    pub kriged_mean: Option<GridField>,
    /// Kriging variance, when the step had observations
    pub kriged_variance: Option<GridField>,
    /// Kalman gain of the observed class on itself (zero where not corrected)
    pub kalman_gain: GridField,
    /// Running model residual variance
    pub model_residual_variance: GridField,
}

impl StepSnapshot {
    /// Whether a correction was applied at this step
    pub fn corrected(&self) -> bool {
        self.kriged_mean.is_some()
    }
}

/// Receives a snapshot after every step
pub trait StepObserver {
    /// Called once per step, in step order
    fn observe(&mut self, snapshot: &StepSnapshot);
}

/// Observer that keeps every snapshot
#[derive(Debug, Default)]
pub struct SnapshotCollector {
    /// Snapshots in step order
    pub snapshots: Vec<StepSnapshot>,
}

impl StepObserver for SnapshotCollector {
    fn observe(&mut self, snapshot: &StepSnapshot) {
        self.snapshots.push(snapshot.clone());
    }
}

impl<F: FnMut(&StepSnapshot)> StepObserver for F {
    fn observe(&mut self, snapshot: &StepSnapshot) {
        self(snapshot);
    }
}

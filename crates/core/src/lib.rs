//! Fuel Moisture Data Assimilation Core Library
//!
//! Assimilates sparse station observations of fuel moisture into a grid of
//! per-cell timelag models driven by weather forcing. Each step predicts
//! every cell, fits a global mean-field correction to the stations, kriges
//! the observations onto the grid and Kalman-corrects each cell against
//! the kriged field.
//!
//! ## Pipeline
//!
//! - [`stats`]: Welford running mean/variance of model and observation residuals
//! - [`spatial`]: distance correlation and simple kriging
//! - [`physics`]: equilibrium moisture and cell dynamics with Kalman correction
//! - [`assimilation`]: mean-field model, station matching, the step loop and
//!   the diagnostics store

// Core types and utilities
pub mod config;
pub mod core_types;
pub mod error;
pub(crate) mod linalg;

// Model components
pub mod assimilation;
pub mod physics;
pub mod spatial;
pub mod stats;

// Re-export core types
pub use config::AssimilationConfig;
pub use core_types::{GridField, GridShape, ModelGrid, Observation, StationId, TimeSlice};
pub use error::{AssimilationError, Result};

// Re-export pipeline types
pub use assimilation::{
    build_observation_schedule, AssimilationRun, Diagnostics, ForcingSource, InMemoryForcing,
    MeanFieldModel, ObservationSchedule, StationSeries, StepForcing, StepObserver, StepSnapshot,
};
pub use physics::{CellMoistureModel, CellState};
pub use spatial::{SimpleKriging, SpatialCorrelationModel};
pub use stats::RunningStatsEstimator;

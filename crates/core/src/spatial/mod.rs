//! Spatial statistics: distance correlation and kriging

pub mod correlation;
pub mod kriging;

pub use correlation::SpatialCorrelationModel;
pub use kriging::{KrigingResult, SimpleKriging};

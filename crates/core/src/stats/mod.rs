//! Online statistics used to drive noise parameters

pub mod running;

pub use running::RunningStatsEstimator;

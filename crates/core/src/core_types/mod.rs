//! Core types shared by every stage of the assimilation pipeline

pub mod field;
pub mod grid;
pub mod observation;

pub use field::{GridField, GridShape};
pub use grid::{great_circle_distance, ModelGrid, EARTH_RADIUS_KM};
pub use observation::{Observation, StationId, TimeSlice};

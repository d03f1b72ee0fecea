//! Fuel moisture physics: equilibria and per-cell timelag dynamics

pub mod equilibrium;
pub mod fuel_moisture;

pub use equilibrium::{equilibrium_fields, equilibrium_moisture, nominal_equilibrium};
pub use fuel_moisture::{CellForcing, CellMoistureModel, CellState, MoistureRegime};

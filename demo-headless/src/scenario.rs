//! Synthetic weather and station data for the demo run
//!
//! A regular lon/lat grid under a diurnal temperature cycle with one
//! afternoon shower over the eastern half. Stations measure the 10 h fuel
//! hourly: the nominal equilibrium at their location plus a fixed bias and
//! uniform noise.

use anyhow::Result;
use chrono::{DateTime, Duration, TimeZone, Utc};
use fmda_core::physics::nominal_equilibrium;
use fmda_core::{
    ForcingSource, GridField, GridShape, InMemoryForcing, ModelGrid, StationId, StationSeries,
    StepForcing,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use std::f64::consts::PI;

/// Scenario parameters (`[scenario]` table of the config file)
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScenarioConfig {
    /// Grid rows
    pub rows: usize,
    /// Grid columns
    pub cols: usize,
    /// South-west corner longitude
    pub lon0: f64,
    /// South-west corner latitude
    pub lat0: f64,
    /// Grid spacing (degrees)
    pub spacing_deg: f64,
    /// Model timestep (minutes)
    pub step_minutes: i64,
    /// Number of forcing steps
    pub steps: usize,
    /// Number of stations
    pub stations: usize,
    /// Station measurement interval (model steps)
    pub report_every: usize,
    /// Systematic offset of the stations from the nominal equilibrium
    pub station_bias: f64,
    /// Half-width of the uniform measurement noise
    pub station_noise: f64,
    /// Shower intensity (mm/h) over the eastern half
    pub shower_mm_h: f64,
    /// RNG seed
    pub seed: u64,
}

impl Default for ScenarioConfig {
    fn default() -> Self {
        Self {
            rows: 20,
            cols: 20,
            lon0: -117.5,
            lat0: 33.0,
            spacing_deg: 0.05,
            step_minutes: 10,
            steps: 144,
            stations: 6,
            report_every: 6,
            station_bias: 0.02,
            station_noise: 0.005,
            shower_mm_h: 3.0,
            seed: 42,
        }
    }
}

/// Everything the assimilation needs from outside the core
pub struct Scenario {
    pub grid: ModelGrid,
    pub forcing: InMemoryForcing,
    pub stations: Vec<StationSeries>,
}

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2012, 6, 1, 0, 0, 0)
        .single()
        .unwrap_or(DateTime::UNIX_EPOCH)
}

/// 2 m temperature (K) at hour `h` of the day
fn temperature(h: f64) -> f64 {
    293.0 + 8.0 * (2.0 * PI * (h - 9.0) / 24.0).sin()
}

impl Scenario {
    /// Build the synthetic scenario
    pub fn build(cfg: &ScenarioConfig) -> Result<Self> {
        let shape = GridShape::new(cfg.rows, cfg.cols);
        let grid = ModelGrid::regular(shape, cfg.lon0, cfg.lat0, cfg.spacing_deg, cfg.spacing_deg)?;
        let mut rng = StdRng::seed_from_u64(cfg.seed);

        let mut forcing = InMemoryForcing::new();
        let mut accumulated = GridField::zeros(shape);
        let dt_h = cfg.step_minutes as f64 / 60.0;
        for k in 0..cfg.steps {
            let time = start() + Duration::minutes(cfg.step_minutes * k as i64);
            let hour = k as f64 * dt_h;
            let hour_of_day = hour % 24.0;
            let showering = (14.0..16.0).contains(&hour_of_day);
            if k > 0 && showering {
                for row in 0..cfg.rows {
                    for col in cfg.cols / 2..cfg.cols {
                        let total = accumulated.get(row, col) + cfg.shower_mm_h * dt_h;
                        accumulated.set(row, col, total);
                    }
                }
            }
            let pressure = GridField::with_value(shape, 90_000.0);
            // drier toward the north-west corner
            let mixing = GridField::from_fn(shape, |row, col| {
                0.004 + 0.004 * (row + col) as f64 / (cfg.rows + cfg.cols) as f64
            });
            let temp = GridField::with_value(shape, temperature(hour_of_day));
            let step = StepForcing::from_weather(&pressure, &mixing, &temp, accumulated.clone())?;
            forcing.push(time, step)?;
        }

        let steps: Vec<StepForcing> = (0..cfg.steps)
            .map(|k| forcing.forcing(k))
            .collect::<fmda_core::Result<_>>()?;
        let times = forcing.times().to_vec();

        let mut stations = Vec::with_capacity(cfg.stations);
        let span = cfg.spacing_deg * (cfg.cols.saturating_sub(1)) as f64;
        let lat_span = cfg.spacing_deg * (cfg.rows.saturating_sub(1)) as f64;
        for s in 0..cfg.stations {
            let lon = cfg.lon0 + rng.random_range(0.0..=span);
            let lat = cfg.lat0 + rng.random_range(0.0..=lat_span);
            let mut series = StationSeries::new(StationId::new(format!("ST{s:02}")), lon, lat);
            let cell = grid.nearest_cell(lon, lat)?;
            for k in (0..cfg.steps).step_by(cfg.report_every.max(1)) {
                let e = nominal_equilibrium(
                    steps[k].drying.as_slice()[cell],
                    steps[k].wetting.as_slice()[cell],
                );
                let noise = rng.random_range(-cfg.station_noise..=cfg.station_noise);
                series.insert(times[k], e + cfg.station_bias + noise);
            }
            stations.push(series);
        }

        Ok(Self {
            grid,
            forcing,
            stations,
        })
    }
}

//! Drying and wetting equilibrium moisture from near-surface weather
//!
//! Converts surface pressure, 2 m water-vapour mixing ratio and 2 m
//! temperature (the usual mesoscale model outputs) into the pair of
//! equilibrium moisture contents fuel relaxes toward when drying (Ed) and
//! when wetting (Ew).
//!
//! # Scientific References
//! - Van Wagner, C.E. & Pickett, T.L. (1985). "Equations and FORTRAN program
//!   for the Canadian Forest Fire Weather Index System"
//! - Murphy, D.M. & Koop, T. (2005). "Review of the vapour pressures of ice
//!   and supercooled water for atmospheric applications", Q. J. R. Meteorol.
//!   Soc. 131, 1539-1565

use crate::core_types::GridField;
use crate::error::{AssimilationError, Result};

/// Ratio of molecular weights of water vapour and dry air
const EPSILON: f64 = 0.622;

/// Saturation vapour pressure over liquid water (Pa), Murphy & Koop (2005)
///
/// # Arguments
/// * `temperature` - Air temperature (K)
pub fn saturation_vapour_pressure(temperature: f64) -> f64 {
    let t = temperature;
    (54.842763 - 6763.22 / t - 4.210 * t.ln()
        + 0.000367 * t
        + (0.0415 * (t - 218.8)).tanh() * (53.878 - 1331.22 / t - 9.44523 * t.ln() + 0.014025 * t))
        .exp()
}

/// Relative humidity (%) from surface pressure, mixing ratio and temperature
///
/// # Arguments
/// * `pressure` - Surface pressure (Pa)
/// * `mixing_ratio` - Water vapour mixing ratio (kg/kg)
/// * `temperature` - Air temperature (K)
pub fn relative_humidity(pressure: f64, mixing_ratio: f64, temperature: f64) -> f64 {
    let vapour_pressure = pressure * mixing_ratio / (EPSILON + (1.0 - EPSILON) * mixing_ratio);
    100.0 * vapour_pressure / saturation_vapour_pressure(temperature)
}

/// Drying and wetting equilibrium moisture (fractions)
///
/// ```text
/// Ed = 0.924 H^0.679 + 0.000499 e^{0.1H} + 0.18 (21.1 + 273.15 − T)(1 − e^{−0.115H})
/// Ew = 0.618 H^0.753 + 0.000454 e^{0.1H} + 0.18 (21.1 + 273.15 − T)(1 − e^{−0.115H})
/// ```
///
/// # Returns
/// `(Ed, Ew)` as moisture fractions (percent / 100)
pub fn equilibrium_moisture(pressure: f64, mixing_ratio: f64, temperature: f64) -> (f64, f64) {
    let h = relative_humidity(pressure, mixing_ratio, temperature);
    let temperature_term = 0.18 * (21.1 + 273.15 - temperature) * (1.0 - (-0.115 * h).exp());
    let ed = 0.924 * h.powf(0.679) + 0.000499 * (0.1 * h).exp() + temperature_term;
    let ew = 0.618 * h.powf(0.753) + 0.000454 * (0.1 * h).exp() + temperature_term;
    (ed * 0.01, ew * 0.01)
}

/// Cellwise [`equilibrium_moisture`] over grid-shaped weather fields
///
/// # Errors
/// Returns `DimensionMismatch` if the three fields differ in shape
pub fn equilibrium_fields(
    pressure: &GridField,
    mixing_ratio: &GridField,
    temperature: &GridField,
) -> Result<(GridField, GridField)> {
    let shape = pressure.shape();
    for field in [mixing_ratio, temperature] {
        if field.shape() != shape {
            return Err(AssimilationError::dimension(
                "weather field",
                shape.len(),
                field.shape().len(),
            ));
        }
    }
    let mut drying = GridField::zeros(shape);
    let mut wetting = GridField::zeros(shape);
    let cells = pressure
        .as_slice()
        .iter()
        .zip(mixing_ratio.as_slice())
        .zip(temperature.as_slice());
    for (idx, ((&p, &q), &t)) in cells.enumerate() {
        let (ed, ew) = equilibrium_moisture(p, q, t);
        drying.as_mut_slice()[idx] = ed;
        wetting.as_mut_slice()[idx] = ew;
    }
    Ok((drying, wetting))
}

/// Nominal equilibrium ½(Ed + Ew)
pub fn nominal_equilibrium(drying: f64, wetting: f64) -> f64 {
    0.5 * (drying + wetting)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_types::GridShape;

    #[test]
    fn test_saturation_vapour_pressure_at_20c() {
        // ~2339 Pa at 20 °C
        let es = saturation_vapour_pressure(293.15);
        assert!((es - 2339.0).abs() < 30.0, "es was {es}");
    }

    #[test]
    fn test_humidity_from_half_saturated_air() {
        let t = 293.15;
        let p = 101_325.0;
        let es = saturation_vapour_pressure(t);
        // mixing ratio that gives half the saturation vapour pressure
        let e = 0.5 * es;
        let q = EPSILON * e / (p - (1.0 - EPSILON) * e);
        let h = relative_humidity(p, q, t);
        assert!((h - 50.0).abs() < 1e-6, "H was {h}");
    }

    #[test]
    fn test_drying_above_wetting() {
        let (ed, ew) = equilibrium_moisture(90_000.0, 0.006, 295.0);
        assert!(ed > ew, "Ed {ed} should exceed Ew {ew}");
        assert!(ed > 0.0 && ed < 0.4);
    }

    #[test]
    fn test_equilibrium_rises_with_humidity() {
        let (dry_ed, _) = equilibrium_moisture(90_000.0, 0.002, 300.0);
        let (humid_ed, _) = equilibrium_moisture(90_000.0, 0.012, 300.0);
        assert!(humid_ed > dry_ed);
    }

    #[test]
    fn test_field_version_matches_pointwise() {
        let shape = GridShape::new(2, 2);
        let p = GridField::with_value(shape, 95_000.0);
        let q = GridField::from_fn(shape, |r, c| 0.003 + 0.001 * (r * 2 + c) as f64);
        let t = GridField::with_value(shape, 290.0);
        let (ed, ew) = equilibrium_fields(&p, &q, &t).unwrap();
        let (ed11, ew11) = equilibrium_moisture(95_000.0, q.get(1, 1), 290.0);
        assert_eq!(ed.get(1, 1), ed11);
        assert_eq!(ew.get(1, 1), ew11);
    }
}

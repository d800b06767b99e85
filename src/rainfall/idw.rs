//! Inverse distance weighting from stations to basin cells.

use super::{Interpolator, Station};
use crate::error::{BasinError, Result};

/// Cells closer than this to a station take its value directly.
const SNAP_DISTANCE: f64 = 1e-10;

#[derive(Debug, Clone)]
pub struct Idw {
    power: f64,
    /// Normalised station weights per cell.
    weights: Vec<Vec<f64>>,
}

impl Idw {
    pub fn new(stations: &[Station], cell_xy: &[(f64, f64)], power: f64) -> Result<Self> {
        if stations.is_empty() {
            return Err(BasinError::InvalidParameter {
                name: "stations",
                reason: "IDW needs at least one station".into(),
            });
        }
        if !(power.is_finite() && power >= 0.0) {
            return Err(BasinError::InvalidParameter {
                name: "power",
                reason: format!("expected a non-negative exponent, got {}", power),
            });
        }
        let weights = cell_xy
            .iter()
            .map(|&(x, y)| {
                let dist: Vec<f64> = stations
                    .iter()
                    .map(|s| ((s.x - x).powi(2) + (s.y - y).powi(2)).sqrt())
                    .collect();
                if let Some(hit) = dist.iter().position(|&d| d < SNAP_DISTANCE) {
                    let mut w = vec![0.0; stations.len()];
                    w[hit] = 1.0;
                    return w;
                }
                let raw: Vec<f64> = dist.iter().map(|d| 1.0 / d.powf(power)).collect();
                let total: f64 = raw.iter().sum();
                raw.into_iter().map(|w| w / total).collect()
            })
            .collect();
        Ok(Idw { power, weights })
    }

    pub fn power(&self) -> f64 {
        self.power
    }
}

impl Interpolator for Idw {
    fn method(&self) -> String {
        format!("IDW p={:.2}", self.power)
    }

    fn cells(&self) -> usize {
        self.weights.len()
    }

    fn interpolate(&self, station_values: &[f64]) -> Vec<f64> {
        self.weights
            .iter()
            .map(|w| w.iter().zip(station_values).map(|(wk, v)| wk * v).sum::<f64>())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn stations() -> Vec<Station> {
        vec![
            Station { id: "a".into(), x: 0.0, y: 0.0 },
            Station { id: "b".into(), x: 4.0, y: 0.0 },
        ]
    }

    #[test]
    fn midpoint_is_the_plain_mean() {
        let idw = Idw::new(&stations(), &[(2.0, 0.0)], 1.0).unwrap();
        assert_relative_eq!(idw.interpolate(&[2.0, 6.0])[0], 4.0);
    }

    #[test]
    fn closer_station_weighs_more() {
        // d = 1 and 3 with p = 1: weights 3/4 and 1/4
        let idw = Idw::new(&stations(), &[(1.0, 0.0)], 1.0).unwrap();
        assert_relative_eq!(idw.interpolate(&[4.0, 8.0])[0], 5.0);
    }

    #[test]
    fn cell_on_station_snaps() {
        let idw = Idw::new(&stations(), &[(4.0, 0.0)], 2.0).unwrap();
        assert_eq!(idw.power(), 2.0);
        assert_eq!(idw.interpolate(&[1.0, 7.0]), vec![7.0]);
    }

    #[test]
    fn negative_power_is_rejected() {
        assert!(Idw::new(&stations(), &[(1.0, 1.0)], -1.0).is_err());
        assert!(Idw::new(&[], &[(1.0, 1.0)], 1.0).is_err());
    }
}

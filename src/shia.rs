//! Process engine interface and the linked-tank SHIA kernel.
//!
//! Each unit carries five tanks: capillary (T1), surface (T2), gravitational
//! subsurface (T3), aquifer (T4) and channel (T5). Vertical fluxes move water
//! down the cascade within a unit; horizontal fluxes move it to the unit's own
//! channel or to the matching tank of the downstream unit. Units are processed
//! upstream first, so every inflow a unit receives in a step was produced
//! earlier in the same step.

use chrono::{Duration, NaiveDateTime};
use indicatif::ProgressBar;
use log::{debug, info};
use ndarray::Array2;

use crate::config::CalibrationFactors;
use crate::error::{BasinError, Result};
use crate::io::results::RunOutput;
use crate::rainfall::RainfallSource;
use crate::state::StateBank;

const CAPILAR: usize = 0;
const SURFACE: usize = 1;
const SUBSURFACE: usize = 2;
const AQUIFER: usize = 3;
const CHANNEL: usize = 4;

/// Run settings shared by every engine.
#[derive(Debug, Clone)]
pub struct RunSetup {
    /// Step length [s].
    pub dt: f64,
    /// Time of the first step when the rainfall source carries no timestamps.
    pub start: NaiveDateTime,
    /// Rainfall record read by the first step.
    pub start_offset: usize,
    pub steps: usize,
    pub calibration: CalibrationFactors,
    /// Also report the water entering channels from each hillslope tank.
    pub separate_fluxes: bool,
}

impl RunSetup {
    pub fn new(dt: f64, start: NaiveDateTime, steps: usize, calibration: CalibrationFactors) -> Self {
        RunSetup {
            dt,
            start,
            start_offset: 0,
            steps,
            calibration,
            separate_fluxes: false,
        }
    }

    pub fn with_start_offset(mut self, offset: usize) -> Self {
        self.start_offset = offset;
        self
    }

    pub fn timestamps(&self) -> Vec<NaiveDateTime> {
        self.timestamps_from(self.start)
    }

    fn timestamps_from(&self, start: NaiveDateTime) -> Vec<NaiveDateTime> {
        let dt_ms = (self.dt * 1000.0).round() as i64;
        (0..self.steps)
            .map(|k| start + Duration::milliseconds(dt_ms * k as i64))
            .collect()
    }
}

/// Integrates the water balance of every unit over time.
pub trait ProcessEngine {
    fn name(&self) -> &'static str;

    /// Runs `setup.steps` steps starting from the storage in `bank`, leaving
    /// the final storage there.
    fn run(&mut self, bank: &mut StateBank, rain: &mut dyn RainfallSource, setup: &RunSetup) -> Result<RunOutput>;
}

#[derive(Debug, Default)]
pub struct ShiaEngine {
    progress: Option<ProgressBar>,
}

impl ShiaEngine {
    pub fn new() -> Self {
        ShiaEngine { progress: None }
    }

    pub fn with_progress(progress: ProgressBar) -> Self {
        ShiaEngine {
            progress: Some(progress),
        }
    }
}

/// Per-step totals over the whole basin [m3].
#[derive(Debug, Default, Clone, Copy)]
struct StepVolumes {
    rain: f64,
    evaporation: f64,
    losses: f64,
    outflow: f64,
}

impl ProcessEngine for ShiaEngine {
    fn name(&self) -> &'static str {
        "shia"
    }

    fn run(&mut self, bank: &mut StateBank, rain: &mut dyn RainfallSource, setup: &RunSetup) -> Result<RunOutput> {
        let n = bank.units();
        if rain.units() != n {
            return Err(BasinError::shape("rainfall units", n, rain.units()));
        }
        if !(setup.dt > 0.0) {
            return Err(BasinError::InvalidParameter {
                name: "dt",
                reason: format!("step length must be positive, got {}", setup.dt),
            });
        }
        if let Some(i) = bank.geometry.elem_area.iter().position(|&a| !(a > 0.0)) {
            return Err(BasinError::InvalidParameter {
                name: "elem_area",
                reason: format!("unit {} has no area", i),
            });
        }

        if rain.records() > 0 && setup.start_offset >= rain.records() {
            return Err(BasinError::InvalidParameter {
                name: "start_offset",
                reason: format!(
                    "record {} is past the {} rainfall records",
                    setup.start_offset,
                    rain.records()
                ),
            });
        }
        for (what, flags) in [("control", &bank.control), ("control_h", &bank.control_h)] {
            if flags.len() != n {
                return Err(BasinError::shape(what, n, flags.len()));
            }
        }

        let discharge_units: Vec<usize> = (0..n).filter(|&i| bank.control[i]).collect();
        let moisture_units: Vec<usize> = (0..n).filter(|&i| bank.control_h[i]).collect();
        let start = rain.timestamp(setup.start_offset).unwrap_or(setup.start);
        let mut output = RunOutput::new(
            setup.timestamps_from(start),
            discharge_units.clone(),
            moisture_units.clone(),
            setup.separate_fluxes,
        );
        output.initial_storage = bank.stored_volume();
        info!(
            "running {} over {} units for {} steps of {} s from record {}",
            self.name(),
            n,
            setup.steps,
            setup.dt,
            setup.start_offset
        );

        let mut q_out = vec![0.0; n];
        let mut to_channel = [0.0; 3];
        for step in 0..setup.steps {
            let field = rain.field(setup.start_offset + step)?;
            let before = bank.stored_volume();
            let volumes = step_units(bank, &field, setup, &mut q_out, &mut to_channel);
            let after = bank.stored_volume();

            let residual = before + volumes.rain - volumes.evaporation - volumes.losses - volumes.outflow - after;
            output.balance.push(residual);
            output.storage.push(after);
            output.rain_volume.push(volumes.rain);
            output.evaporation_volume.push(volumes.evaporation);
            output.loss_volume.push(volumes.losses);
            output.outflow_volume.push(volumes.outflow);
            for (j, &u) in discharge_units.iter().enumerate() {
                output.discharge[(step, j)] = q_out[u];
            }
            for (j, &u) in moisture_units.iter().enumerate() {
                output.moisture[(step, j)] = moisture(bank, u, &setup.calibration);
            }
            if let Some(fluxes) = output.fluxes.as_mut() {
                for (k, v) in to_channel.iter().enumerate() {
                    fluxes[(step, k)] = v / setup.dt;
                }
            }
            if let Some(pb) = &self.progress {
                pb.inc(1);
            }
        }
        if let Some(pb) = &self.progress {
            pb.finish_with_message("simulation complete");
        }
        debug!(
            "run finished, max |balance residual| = {:.3e} m3",
            output.balance.iter().fold(0.0_f64, |m, r| m.max(r.abs()))
        );
        Ok(output)
    }
}

/// Advances every unit by one step; `q_out` receives each unit's channel
/// outflow [m3/s], `to_channel` the volume reaching channels per hillslope tank.
fn step_units(
    bank: &mut StateBank,
    rain: &[f64],
    setup: &RunSetup,
    q_out: &mut [f64],
    to_channel: &mut [f64; 3],
) -> StepVolumes {
    let n = bank.units();
    let cal = &setup.calibration;
    let dt = setup.dt;
    let dt_h = dt / 3600.0;
    let mut inflow = Array2::<f64>::zeros((5, n));
    let mut totals = StepVolumes::default();
    *to_channel = [0.0; 3];

    for i in 0..n {
        let area = bank.geometry.elem_area[i];
        let mm_to_m3 = area / 1000.0;
        let drena = bank.geometry.drena[i];
        let mut s = [0.0; 5];
        for (k, sk) in s.iter_mut().enumerate() {
            *sk = bank.storage[(k, i)] + inflow[(k, i)] / mm_to_m3;
        }

        let r = rain[i].max(0.0);
        totals.rain += r * mm_to_m3;

        // T1: capillary retention, emptied only by evaporation
        let hu = bank.max_capilar[i] * cal.capilar_capacity();
        s[CAPILAR] += r;
        let excess = (s[CAPILAR] - hu).max(0.0);
        s[CAPILAR] -= excess;
        let evap = s[CAPILAR].min(bank.v_coef[(0, i)] * cal.evaporation() * dt_h).max(0.0);
        s[CAPILAR] -= evap;

        // T2 -> T3 infiltration, T3 -> T4 percolation, T4 losses
        s[SURFACE] += excess;
        let infiltration = s[SURFACE].min(bank.v_coef[(1, i)] * cal.infiltration() * dt_h).max(0.0);
        s[SURFACE] -= infiltration;
        s[SUBSURFACE] += infiltration;
        let percolation = s[SUBSURFACE].min(bank.v_coef[(2, i)] * cal.percolation() * dt_h).max(0.0);
        s[SUBSURFACE] -= percolation;
        let hg = bank.max_gravita[i] * cal.gravit_capacity();
        if s[SUBSURFACE] > hg {
            s[SURFACE] += s[SUBSURFACE] - hg;
            s[SUBSURFACE] = hg;
        }
        s[AQUIFER] += percolation;
        let loss = s[AQUIFER].min(bank.v_coef[(3, i)] * cal.losses() * dt_h).max(0.0);
        s[AQUIFER] -= loss;
        totals.evaporation += evap * mm_to_m3;
        totals.losses += loss * mm_to_m3;

        // Hillslope tanks drain into this unit's channel or downstream
        let own_channel = bank.geometry.unit_type[i] == 3 || drena.is_none();
        let hill_len = positive_or(bank.geometry.hill_long[i], area.sqrt());
        for (k, tank) in [SURFACE, SUBSURFACE, AQUIFER].into_iter().enumerate() {
            let v = tank_speed(
                bank.h_coef[(k, i)] * cal.speed(k),
                bank.h_exp[(k, i)],
                s[tank],
                bank.speed_type[k] == 2,
            );
            let out = s[tank] * (v * dt / hill_len).min(1.0);
            s[tank] -= out;
            match (own_channel, drena) {
                (false, Some(d)) => inflow[(tank, d)] += out * mm_to_m3,
                _ => {
                    s[CHANNEL] += out;
                    to_channel[k] += out * mm_to_m3;
                }
            }
        }

        // T5: kinematic channel
        let stream_len = positive_or(bank.geometry.stream_long[i], hill_len);
        let v = tank_speed(bank.h_coef[(3, i)] * cal.speed(3), bank.h_exp[(3, i)], s[CHANNEL], true);
        let out = s[CHANNEL] * (v * dt / stream_len).min(1.0);
        s[CHANNEL] -= out;
        q_out[i] = out * mm_to_m3 / dt;
        match drena {
            Some(d) => inflow[(CHANNEL, d)] += out * mm_to_m3,
            None => totals.outflow += out * mm_to_m3,
        }

        for (k, sk) in s.iter().enumerate() {
            bank.storage[(k, i)] = *sk;
        }
    }
    totals
}

/// Speed of a tank [m/s]: constant for a linear reservoir, growing with
/// storage as `coef * S^exp` for a kinematic one.
fn tank_speed(coef: f64, exp: f64, storage_mm: f64, kinematic: bool) -> f64 {
    let v = if kinematic {
        coef * storage_mm.max(0.0).powf(exp)
    } else {
        coef
    };
    if v.is_finite() { v.max(0.0) } else { 0.0 }
}

fn positive_or(value: f64, fallback: f64) -> f64 {
    if value > 0.0 { value } else { fallback }
}

/// Soil moisture of a unit as % of its capillary plus gravitational capacity.
fn moisture(bank: &StateBank, i: usize, cal: &CalibrationFactors) -> f64 {
    let capacity = bank.max_capilar[i] * cal.capilar_capacity() + bank.max_gravita[i] * cal.gravit_capacity();
    if capacity <= 0.0 {
        return 0.0;
    }
    ((bank.storage[(CAPILAR, i)] + bank.storage[(SUBSURFACE, i)]) / capacity * 100.0).clamp(0.0, 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rainfall::RainSeries;
    use crate::state::{ModelVariable, UnitGeometry};
    use approx::assert_abs_diff_eq;
    use chrono::NaiveDate;

    // Three units in a line, the last one is the outlet channel
    fn bank() -> StateBank {
        let mut bank = StateBank::new(3);
        let mut g = UnitGeometry::empty(3);
        g.drena = vec![Some(1), Some(2), None];
        g.unit_type = vec![1, 1, 3];
        g.hill_long = vec![100.0; 3];
        g.hill_slope = vec![0.1; 3];
        g.stream_long = vec![0.0, 0.0, 100.0];
        g.elem_area = vec![10_000.0; 3];
        bank.set_geometry(g).unwrap();
        bank.set_variable(ModelVariable::Capilar, 0, &[5.0; 3]).unwrap();
        bank.set_variable(ModelVariable::Gravit, 0, &[20.0; 3]).unwrap();
        bank.set_variable(ModelVariable::VCoef, 0, &[0.1; 3]).unwrap();
        bank.set_variable(ModelVariable::VCoef, 1, &[2.0; 3]).unwrap();
        bank.set_variable(ModelVariable::VCoef, 2, &[0.5; 3]).unwrap();
        bank.set_variable(ModelVariable::VCoef, 3, &[0.0; 3]).unwrap();
        for k in 0..4 {
            bank.set_variable(ModelVariable::HCoef, k, &[0.01; 3]).unwrap();
        }
        bank.set_variable(ModelVariable::HExp, 3, &[0.0; 3]).unwrap();
        bank.set_control(vec![false, false, true], vec![true, false, false]).unwrap();
        bank
    }

    fn setup(steps: usize) -> RunSetup {
        let start = NaiveDate::from_ymd_opt(2020, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        RunSetup::new(300.0, start, steps, CalibrationFactors::default())
    }

    #[test]
    fn dry_basin_stays_dry() {
        let mut bank = bank();
        let mut rain = RainSeries::uniform(3, &[0.0; 4]);
        let out = ShiaEngine::new().run(&mut bank, &mut rain, &setup(4)).unwrap();
        assert!(out.discharge.iter().all(|&q| q == 0.0));
        assert!(bank.storage.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn water_balance_closes_every_step() {
        let mut bank = bank();
        let mut rain = RainSeries::uniform(3, &[20.0, 10.0, 0.0, 0.0, 5.0, 0.0]);
        let out = ShiaEngine::new().run(&mut bank, &mut rain, &setup(30)).unwrap();
        for r in &out.balance {
            assert_abs_diff_eq!(*r, 0.0, epsilon = 1e-6);
        }
        assert!(out.discharge.column(0).iter().any(|&q| q > 0.0));
    }

    #[test]
    fn timestamps_advance_by_dt() {
        let s = setup(3);
        let ts = s.timestamps();
        assert_eq!(ts[2] - ts[0], Duration::seconds(600));
    }

    #[test]
    fn flux_separation_reports_three_sources() {
        let mut bank = bank();
        let mut rain = RainSeries::uniform(3, &[30.0]);
        let mut s = setup(5);
        s.separate_fluxes = true;
        let out = ShiaEngine::new().run(&mut bank, &mut rain, &s).unwrap();
        let fluxes = out.fluxes.unwrap();
        assert_eq!(fluxes.dim(), (5, 3));
        assert!(fluxes.column(0).iter().any(|&q| q > 0.0));
    }

    #[test]
    fn start_offset_skips_early_records() {
        let mut bank = bank();
        let mut rain = RainSeries::uniform(3, &[40.0, 40.0, 0.0, 0.0]);
        let s = setup(2).with_start_offset(2);
        let out = ShiaEngine::new().run(&mut bank, &mut rain, &s).unwrap();
        assert_eq!(out.total_rain(), 0.0);
        assert_eq!(out.timestamps, s.timestamps());
    }

    #[test]
    fn short_control_flags_are_rejected() {
        let mut bank = bank();
        bank.control = vec![true];
        let mut rain = RainSeries::uniform(3, &[1.0]);
        assert!(matches!(
            ShiaEngine::new().run(&mut bank, &mut rain, &setup(1)),
            Err(BasinError::ShapeMismatch { what: "control", .. })
        ));
    }

    #[test]
    fn mismatched_rain_is_rejected() {
        let mut bank = bank();
        let mut rain = RainSeries::uniform(2, &[1.0]);
        assert!(matches!(
            ShiaEngine::new().run(&mut bank, &mut rain, &setup(1)),
            Err(BasinError::ShapeMismatch { .. })
        ));
    }
}

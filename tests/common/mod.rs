#![allow(dead_code)]

use basin_rs::basin::Basin;
use basin_rs::config::{GridConfig, Resolution, UnitThresholds};
use basin_rs::grid::{DirEncoding, DirRaster, Raster};
use basin_rs::hillslope::Aggregation;
use basin_rs::shia::RunSetup;
use basin_rs::simulation::{ControlPolicy, PhysicalValue, SimuBasin};
use basin_rs::state::{ModelVariable, TANKS};
use basin_rs::CalibrationFactors;
use chrono::NaiveDate;
use std::sync::Arc;

pub const NODATA: f64 = -9999.0;

pub fn rasters(grid: GridConfig, elev: Vec<f64>, dirs: Vec<i32>) -> (Arc<Raster<f64>>, Arc<DirRaster>) {
    let dem = Raster::from_rows(grid, elev).unwrap();
    let dir = DirRaster::new(Raster::from_rows(grid, dirs).unwrap(), DirEncoding::Keypad);
    (Arc::new(dem), Arc::new(dir))
}

/// 10x10, 30 m cells. Side cells flow along their row to column 5, which
/// runs south to the outlet at (5, 9).
pub fn valley() -> (Arc<Raster<f64>>, Arc<DirRaster>) {
    let grid = GridConfig::new(10, 10, 0.0, 0.0, 30.0, NODATA);
    let mut elev = Vec::with_capacity(100);
    let mut dirs = Vec::with_capacity(100);
    for row in 0..10i32 {
        for col in 0..10i32 {
            elev.push(100.0 - 10.0 * row as f64 + 3.0 * (col - 5).abs() as f64);
            dirs.push(match col {
                c if c < 5 => 6,
                c if c > 5 => 4,
                _ => 2,
            });
        }
    }
    rasters(grid, elev, dirs)
}

/// Centre of the valley outlet cell.
pub const VALLEY_OUTLET: (f64, f64) = (165.0, 15.0);

pub fn valley_basin(threshold: f64) -> Basin {
    let (dem, dir) = valley();
    Basin::delineate("valley", VALLEY_OUTLET.0, VALLEY_OUTLET.1, dem, dir, threshold, None).unwrap()
}

/// 5x5, 10 m cells, sloping to the south-west corner. The bottom row runs
/// west to the corner, the row above drains straight into it and the rest of
/// the raster lies outside the watershed.
pub fn edge_path() -> (Arc<Raster<f64>>, Arc<DirRaster>) {
    let grid = GridConfig::new(5, 5, 0.0, 0.0, 10.0, NODATA);
    let mut elev = Vec::with_capacity(25);
    let mut dirs = Vec::with_capacity(25);
    for row in 0..5 {
        for col in 0..5 {
            elev.push(((4 - row) * 4 + col + 1) as f64);
            dirs.push(match (row, col) {
                (4, 0) => 1,
                (4, _) => 4,
                (3, _) => 2,
                _ => NODATA as i32,
            });
        }
    }
    rasters(grid, elev, dirs)
}

/// Every parameter set, empty tanks, outlet reporting.
pub fn parameterised(basin: Basin, resolution: Resolution) -> SimuBasin {
    let mut sb = SimuBasin::new(basin, resolution).unwrap();
    sb.set_geomorphology(UnitThresholds::new(5.0, 20.0).unwrap(), &PhysicalValue::Scalar(2.0))
        .unwrap();
    let scalar = |v: f64| PhysicalValue::Scalar(v);
    let set = |sb: &mut SimuBasin, var: ModelVariable, pos: usize, v: f64| {
        sb.set_physical_variable(var, &scalar(v), pos, Aggregation::Mean, None)
            .unwrap();
    };
    set(&mut sb, ModelVariable::Capilar, 0, 10.0);
    set(&mut sb, ModelVariable::Gravit, 0, 30.0);
    for (pos, rate) in [0.1, 5.0, 1.0, 0.0].into_iter().enumerate() {
        set(&mut sb, ModelVariable::VCoef, pos, rate);
        set(&mut sb, ModelVariable::VExp, pos, 1.0);
    }
    for pos in 0..4 {
        set(&mut sb, ModelVariable::HCoef, pos, 0.05);
        set(&mut sb, ModelVariable::HExp, pos, 0.5);
    }
    for tank in 0..TANKS.len() {
        sb.set_storage(&scalar(0.0), tank).unwrap();
    }
    let n = sb.basin.ncells();
    sb.set_control(&vec![false; n], &vec![false; n], ControlPolicy::AllUnits)
        .unwrap();
    sb
}

pub fn setup(steps: usize) -> RunSetup {
    let start = NaiveDate::from_ymd_opt(2022, 3, 1)
        .unwrap()
        .and_hms_opt(6, 0, 0)
        .unwrap();
    RunSetup::new(300.0, start, steps, CalibrationFactors::default())
}

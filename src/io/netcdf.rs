use log::info;
use ndarray::Array2;
use netcdf::AttributeValue;
use std::path::Path;
use std::sync::Arc;

use crate::basin::Basin;
use crate::config::{GridConfig, Resolution, UnitThresholds};
use crate::engine::{CellRecord, CellStructure};
use crate::error::{BasinError, Result};
use crate::grid::{DirEncoding, DirRaster, Raster};
use crate::hillslope::HillslopePartition;
use crate::io::csv::FLUX_COLUMNS;
use crate::io::results::RunOutput;
use crate::simulation::{SimuBasin, SimuStage};
use crate::state::{Slot, StateBank, TANKS, UnitGeometry};

const MODEL_BASIN: &str = "basin";

fn attr_value(file: &netcdf::File, name: &str) -> Result<AttributeValue> {
    let attr = file
        .attribute(name)
        .ok_or_else(|| BasinError::Parse(format!("missing global attribute '{}'", name)))?;
    Ok(attr.value()?)
}

fn attr_str(file: &netcdf::File, name: &str) -> Result<String> {
    match attr_value(file, name)? {
        AttributeValue::Str(s) => Ok(s),
        other => Err(BasinError::Parse(format!("attribute '{}' is not text: {:?}", name, other))),
    }
}

fn attr_f64(file: &netcdf::File, name: &str) -> Result<f64> {
    match attr_value(file, name)? {
        AttributeValue::Double(v) => Ok(v),
        AttributeValue::Float(v) => Ok(v as f64),
        AttributeValue::Int(v) => Ok(v as f64),
        AttributeValue::Longlong(v) => Ok(v as f64),
        AttributeValue::Ulonglong(v) => Ok(v as f64),
        other => Err(BasinError::Parse(format!("attribute '{}' is not numeric: {:?}", name, other))),
    }
}

fn attr_usize(file: &netcdf::File, name: &str) -> Result<usize> {
    Ok(attr_f64(file, name)? as usize)
}

fn var_f64(file: &netcdf::File, name: &str) -> Result<Vec<f64>> {
    let var = file
        .variable(name)
        .ok_or_else(|| BasinError::Parse(format!("missing variable '{}'", name)))?;
    Ok(var.get_values::<f64, _>(..)?)
}

fn var_i32(file: &netcdf::File, name: &str) -> Result<Vec<i32>> {
    let var = file
        .variable(name)
        .ok_or_else(|| BasinError::Parse(format!("missing variable '{}'", name)))?;
    Ok(var.get_values::<i32, _>(..)?)
}

fn put_f64(file: &mut netcdf::FileMut, name: &str, dims: &[&str], values: &[f64]) -> Result<()> {
    let mut var = file.add_variable::<f64>(name, dims)?;
    var.put_values(values, ..)?;
    Ok(())
}

fn put_i32(file: &mut netcdf::FileMut, name: &str, dims: &[&str], values: &[i32]) -> Result<()> {
    let mut var = file.add_variable::<i32>(name, dims)?;
    var.put_values(values, ..)?;
    Ok(())
}

// Integer codes that must come from a small fixed set
fn small_codes(values: Vec<i32>, name: &'static str, allowed: &[u8]) -> Result<Vec<u8>> {
    values
        .into_iter()
        .map(|v| {
            u8::try_from(v)
                .ok()
                .filter(|c| allowed.contains(c))
                .ok_or_else(|| BasinError::InvalidParameter {
                    name,
                    reason: format!("code {} is not one of {:?}", v, allowed),
                })
        })
        .collect()
}

fn optional_index(v: Option<usize>) -> i32 {
    v.map(|d| d as i32).unwrap_or(-1)
}

fn index_or_none(v: i32) -> Option<usize> {
    (v >= 0).then_some(v as usize)
}

fn flatten(tensor: &Array2<f64>) -> Vec<f64> {
    tensor.iter().copied().collect()
}

fn write_basin_parts(file: &mut netcdf::FileMut, basin: &Basin, partition: &HillslopePartition) -> Result<()> {
    let g = basin.grid();
    file.add_dimension("ncells", basin.ncells())?;
    file.add_dimension("nhills", partition.count())?;

    file.add_attribute("name", basin.name.as_str())?;
    file.add_attribute("outlet_x", basin.outlet.0)?;
    file.add_attribute("outlet_y", basin.outlet.1)?;
    file.add_attribute("ncells", basin.ncells() as i64)?;
    file.add_attribute("nhills", partition.count() as i64)?;
    file.add_attribute("threshold", basin.threshold)?;
    file.add_attribute("ncols", g.ncols as i64)?;
    file.add_attribute("nrows", g.nrows as i64)?;
    file.add_attribute("xll", g.xll)?;
    file.add_attribute("yll", g.yll)?;
    file.add_attribute("cell_size", g.cell_size)?;
    file.add_attribute("dxp", g.dxp())?;
    file.add_attribute("nodata", g.nodata)?;
    file.add_attribute("dir_encoding", basin.dir.encoding.as_str())?;

    let cells = basin.structure().cells();
    let cols: Vec<i32> = cells.iter().map(|c| c.col as i32).collect();
    let rows: Vec<i32> = cells.iter().map(|c| c.row as i32).collect();
    let dests: Vec<i32> = cells.iter().map(|c| optional_index(c.dest)).collect();
    put_i32(file, "cell_col", &["ncells"], &cols)?;
    put_i32(file, "cell_row", &["ncells"], &rows)?;
    put_i32(file, "cell_dest", &["ncells"], &dests)?;

    let as_i32 = |v: &[u32]| v.iter().map(|&x| x as i32).collect::<Vec<i32>>();
    put_i32(file, "hills_own", &["ncells"], &as_i32(&partition.own))?;
    put_i32(file, "hills_dest", &["nhills"], &as_i32(&partition.dest))?;
    put_i32(file, "hills_horton", &["nhills"], &as_i32(&partition.horton))?;
    Ok(())
}

/// Checks the persisted grid against the rasters handed in for loading.
fn check_grid(file: &netcdf::File, dem: &Raster<f64>, dir: &DirRaster) -> Result<()> {
    let stored = GridConfig::new(
        attr_usize(file, "ncols")?,
        attr_usize(file, "nrows")?,
        attr_f64(file, "xll")?,
        attr_f64(file, "yll")?,
        attr_f64(file, "cell_size")?,
        attr_f64(file, "nodata")?,
    );
    stored.ensure_same(&dem.grid, "persisted basin vs DEM")?;
    stored.ensure_same(dir.grid(), "persisted basin vs DIR")?;
    let encoding = DirEncoding::parse(&attr_str(file, "dir_encoding")?)?;
    if encoding != dir.encoding {
        return Err(BasinError::ConfigurationMismatch(format!(
            "basin was traced with {} directions, DIR raster uses {}",
            encoding.as_str(),
            dir.encoding.as_str()
        )));
    }
    Ok(())
}

fn read_basin_parts(
    file: &netcdf::File,
    dem: Arc<Raster<f64>>,
    dir: Arc<DirRaster>,
) -> Result<(Basin, HillslopePartition)> {
    check_grid(file, &dem, &dir)?;
    let ncells = attr_usize(file, "ncells")?;
    let cols = var_i32(file, "cell_col")?;
    let rows = var_i32(file, "cell_row")?;
    let dests = var_i32(file, "cell_dest")?;
    for (what, len) in [("cell_col", cols.len()), ("cell_row", rows.len()), ("cell_dest", dests.len())] {
        if len != ncells {
            return Err(BasinError::shape(what, ncells, len));
        }
    }
    let records = (0..ncells)
        .map(|i| CellRecord {
            col: cols[i] as usize,
            row: rows[i] as usize,
            dest: index_or_none(dests[i]),
        })
        .collect();
    let structure = CellStructure::from_records(records)?;

    let as_u32 = |v: Vec<i32>| v.into_iter().map(|x| x.max(0) as u32).collect::<Vec<u32>>();
    let partition = HillslopePartition::from_parts(
        as_u32(var_i32(file, "hills_own")?),
        as_u32(var_i32(file, "hills_dest")?),
        as_u32(var_i32(file, "hills_horton")?),
    )?;

    let mut dem = dem;
    let dxp = attr_f64(file, "dxp")?;
    if (dxp - dem.grid.dxp()).abs() > f64::EPSILON * dxp.abs().max(1.0) {
        let grid = dem.grid.with_projected_cell_size(dxp);
        dem = Arc::new(Raster::from_array(grid, dem.data.clone())?);
    }
    let basin = Basin::from_structure(
        &attr_str(file, "name")?,
        (attr_f64(file, "outlet_x")?, attr_f64(file, "outlet_y")?),
        dem,
        dir,
        attr_f64(file, "threshold")?,
        structure,
    )?;
    Ok((basin, partition))
}

pub fn save_basin(path: &Path, basin: &Basin) -> Result<()> {
    let partition = basin.partition(basin.threshold)?;
    let mut file = netcdf::create(path)?;
    write_basin_parts(&mut file, basin, &partition)?;
    file.add_attribute("model_type", MODEL_BASIN)?;
    info!("basin '{}' saved to {}", basin.name, path.display());
    Ok(())
}

/// Loads a basin; the DEM and DIR must match the grid it was traced on.
pub fn load_basin(path: &Path, dem: Arc<Raster<f64>>, dir: Arc<DirRaster>) -> Result<Basin> {
    let file = netcdf::open(path)?;
    let (basin, _) = read_basin_parts(&file, dem, dir)?;
    Ok(basin)
}

pub fn save_simubasin(path: &Path, sb: &SimuBasin) -> Result<()> {
    let mut file = netcdf::create(path)?;
    write_basin_parts(&mut file, &sb.basin, sb.partition())?;
    file.add_attribute("model_type", sb.resolution().as_str())?;
    file.add_attribute("stage", sb.stage().as_str())?;
    file.add_attribute("unit_lower", sb.thresholds.lower)?;
    file.add_attribute("unit_upper", sb.thresholds.upper)?;
    let slots: Vec<String> = sb.bank.set_slots().map(|s| s.name()).collect();
    file.add_attribute("set_slots", slots.join(","))?;

    let bank = &sb.bank;
    file.add_dimension("units", bank.units())?;
    file.add_dimension("rows", 4)?;
    file.add_dimension("tanks", TANKS.len())?;
    file.add_dimension("horizontal", 3)?;

    put_f64(&mut file, "v_coef", &["rows", "units"], &flatten(&bank.v_coef))?;
    put_f64(&mut file, "v_exp", &["rows", "units"], &flatten(&bank.v_exp))?;
    put_f64(&mut file, "h_coef", &["rows", "units"], &flatten(&bank.h_coef))?;
    put_f64(&mut file, "h_exp", &["rows", "units"], &flatten(&bank.h_exp))?;
    put_f64(&mut file, "max_capilar", &["units"], &bank.max_capilar)?;
    put_f64(&mut file, "max_gravita", &["units"], &bank.max_gravita)?;
    put_f64(&mut file, "storage", &["tanks", "units"], &flatten(&bank.storage))?;

    let g = &bank.geometry;
    let drena: Vec<i32> = g.drena.iter().map(|&d| optional_index(d)).collect();
    let unit_type: Vec<i32> = g.unit_type.iter().map(|&t| t as i32).collect();
    put_i32(&mut file, "drena", &["units"], &drena)?;
    put_i32(&mut file, "unit_type", &["units"], &unit_type)?;
    put_f64(&mut file, "hill_long", &["units"], &g.hill_long)?;
    put_f64(&mut file, "hill_slope", &["units"], &g.hill_slope)?;
    put_f64(&mut file, "stream_long", &["units"], &g.stream_long)?;
    put_f64(&mut file, "stream_slope", &["units"], &g.stream_slope)?;
    put_f64(&mut file, "stream_width", &["units"], &g.stream_width)?;
    put_f64(&mut file, "elem_area", &["units"], &g.elem_area)?;

    let flags = |v: &[bool]| v.iter().map(|&b| b as i32).collect::<Vec<i32>>();
    put_i32(&mut file, "control", &["units"], &flags(&bank.control))?;
    put_i32(&mut file, "control_h", &["units"], &flags(&bank.control_h))?;
    let speed: Vec<i32> = bank.speed_type.iter().map(|&s| s as i32).collect();
    put_i32(&mut file, "speed_type", &["horizontal"], &speed)?;

    info!(
        "simulation '{}' saved to {} ({} units, stage {})",
        sb.basin.name,
        path.display(),
        bank.units(),
        sb.stage().as_str()
    );
    Ok(())
}

pub fn load_simubasin(path: &Path, dem: Arc<Raster<f64>>, dir: Arc<DirRaster>) -> Result<SimuBasin> {
    let file = netcdf::open(path)?;
    let model_type = attr_str(&file, "model_type")?;
    if model_type == MODEL_BASIN {
        return Err(BasinError::InvalidState {
            expected: "a simulation file",
            actual: "a basin file",
        });
    }
    let resolution = Resolution::parse(&model_type)?;
    let (basin, partition) = read_basin_parts(&file, dem, dir)?;
    let n = match resolution {
        Resolution::ByCell => basin.ncells(),
        Resolution::ByHillslope => partition.count(),
    };

    let tensor = |name: &str, rows: usize| -> Result<Array2<f64>> {
        let values = var_f64(&file, name)?;
        let len = values.len();
        Array2::from_shape_vec((rows, n), values).map_err(|_| BasinError::shape("persisted tensor", rows * n, len))
    };
    let vector = |name: &str| -> Result<Vec<f64>> {
        let values = var_f64(&file, name)?;
        if values.len() != n {
            return Err(BasinError::shape("persisted unit vector", n, values.len()));
        }
        Ok(values)
    };

    let mut bank = StateBank::new(n);
    bank.v_coef = tensor("v_coef", 4)?;
    bank.v_exp = tensor("v_exp", 4)?;
    bank.h_coef = tensor("h_coef", 4)?;
    bank.h_exp = tensor("h_exp", 4)?;
    bank.max_capilar = vector("max_capilar")?;
    bank.max_gravita = vector("max_gravita")?;
    bank.storage = tensor("storage", TANKS.len())?;
    let geometry = UnitGeometry {
        drena: var_i32(&file, "drena")?.into_iter().map(index_or_none).collect(),
        unit_type: small_codes(var_i32(&file, "unit_type")?, "unit_type", &[1, 2, 3])?,
        hill_long: vector("hill_long")?,
        hill_slope: vector("hill_slope")?,
        stream_long: vector("stream_long")?,
        stream_slope: vector("stream_slope")?,
        stream_width: vector("stream_width")?,
        elem_area: vector("elem_area")?,
    };
    geometry.check(n)?;
    bank.geometry = geometry;

    let flags = |name: &'static str| -> Result<Vec<bool>> {
        let values = var_i32(&file, name)?;
        if values.len() != n {
            return Err(BasinError::shape(name, n, values.len()));
        }
        Ok(values.into_iter().map(|v| v != 0).collect())
    };
    bank.control = flags("control")?;
    bank.control_h = flags("control_h")?;
    let speed = small_codes(var_i32(&file, "speed_type")?, "speed_type", &[1, 2])?;
    bank.speed_type = <[u8; 3]>::try_from(speed.as_slice())
        .map_err(|_| BasinError::shape("speed_type", 3, speed.len()))?;

    let slots = attr_str(&file, "set_slots")?;
    let parsed = slots
        .split(',')
        .filter(|s| !s.trim().is_empty())
        .map(Slot::parse)
        .collect::<Result<Vec<Slot>>>()?;
    bank.mark_set(parsed);

    let thresholds = UnitThresholds::new(attr_f64(&file, "unit_lower")?, attr_f64(&file, "unit_upper")?)?;
    let stage = SimuStage::parse(&attr_str(&file, "stage")?)?;
    SimuBasin::from_parts(basin, resolution, partition, bank, thresholds, stage)
}

// Function to write run results to NetCDF
pub fn write_run_netcdf(path: &Path, output: &RunOutput) -> Result<()> {
    let mut file = netcdf::create(path)?;
    let start = output.timestamps.first().copied();

    file.add_dimension("time", output.steps())?;
    file.add_dimension("discharge_unit", output.discharge_units.len())?;
    file.add_dimension("moisture_unit", output.moisture_units.len())?;

    let mut time_var = file.add_variable::<f64>("time", &["time"])?;
    time_var.put_attribute("long_name", "valid output time")?;
    time_var.put_attribute("standard_name", "time")?;
    if let Some(t0) = start {
        time_var.put_attribute("units", format!("seconds since {}", t0.format("%Y-%m-%d %H:%M:%S")))?;
        let secs: Vec<f64> = output
            .timestamps
            .iter()
            .map(|t| (*t - t0).num_milliseconds() as f64 / 1000.0)
            .collect();
        time_var.put_values(&secs, ..)?;
    }

    let as_i32 = |v: &[usize]| v.iter().map(|&u| u as i32).collect::<Vec<i32>>();
    put_i32(&mut file, "discharge_unit", &["discharge_unit"], &as_i32(&output.discharge_units))?;
    put_i32(&mut file, "moisture_unit", &["moisture_unit"], &as_i32(&output.moisture_units))?;

    // stored (unit, time) like the other per-feature series
    let discharge: Vec<f32> = output.discharge.t().iter().map(|&q| q as f32).collect();
    let mut q_var = file.add_variable::<f32>("discharge", &["discharge_unit", "time"])?;
    q_var.put_attribute("_FillValue", -9999.0f32)?;
    q_var.put_attribute("long_name", "Discharge")?;
    q_var.put_attribute("units", "m3 s-1")?;
    q_var.put_values(&discharge, ..)?;

    let moisture: Vec<f32> = output.moisture.t().iter().map(|&m| m as f32).collect();
    let mut m_var = file.add_variable::<f32>("moisture", &["moisture_unit", "time"])?;
    m_var.put_attribute("_FillValue", -9999.0f32)?;
    m_var.put_attribute("long_name", "Soil moisture")?;
    m_var.put_attribute("units", "%")?;
    m_var.put_values(&moisture, ..)?;

    for (name, series) in [
        ("balance", &output.balance),
        ("storage", &output.storage),
        ("rain_volume", &output.rain_volume),
        ("evaporation_volume", &output.evaporation_volume),
        ("loss_volume", &output.loss_volume),
        ("outflow_volume", &output.outflow_volume),
    ] {
        put_f64(&mut file, name, &["time"], series)?;
    }
    if let Some(fluxes) = &output.fluxes {
        for (k, name) in FLUX_COLUMNS.iter().enumerate() {
            let series = fluxes.column(k).to_vec();
            let mut var = file.add_variable::<f64>(name, &["time"])?;
            var.put_attribute("units", "m3 s-1")?;
            var.put_values(&series, ..)?;
        }
    }
    file.add_attribute("initial_storage", output.initial_storage)?;

    file.add_attribute("TITLE", "OUTPUT FROM BASIN_RS")?;
    if let Some(t0) = start {
        file.add_attribute("file_reference_time", t0.format("%Y-%m-%d_%H:%M:%S").to_string())?;
    }
    info!("run results saved to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_codes_are_rejected() {
        assert_eq!(small_codes(vec![1, 2, 2], "speed_type", &[1, 2]).unwrap(), vec![1, 2, 2]);
        assert!(matches!(
            small_codes(vec![1, 7, 1], "speed_type", &[1, 2]),
            Err(BasinError::InvalidParameter { name: "speed_type", .. })
        ));
        assert!(small_codes(vec![-1], "unit_type", &[1, 2, 3]).is_err());
        assert!(small_codes(vec![259], "unit_type", &[1, 2, 3]).is_err());
    }
}

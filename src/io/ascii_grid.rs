//! ESRI ASCII grid reader and writer.

use log::debug;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::config::GridConfig;
use crate::error::{BasinError, Result};
use crate::grid::{DirEncoding, DirRaster, Raster};

const DEFAULT_NODATA: f64 = -9999.0;

pub fn read_ascii_grid(path: &Path) -> Result<Raster<f64>> {
    let text = fs::read_to_string(path)?;
    let raster = parse_ascii_grid(&text)
        .map_err(|e| BasinError::Parse(format!("{}: {}", path.display(), e)))?;
    debug!(
        "read {} ({}x{}, dx={})",
        path.display(),
        raster.grid.ncols,
        raster.grid.nrows,
        raster.grid.cell_size
    );
    Ok(raster)
}

/// Reads a flow-direction grid; values are rounded to integer codes.
pub fn read_dir_grid(path: &Path, encoding: DirEncoding) -> Result<DirRaster> {
    let raster = read_ascii_grid(path)?;
    let codes = raster.data.mapv(|v| v.round() as i32);
    Ok(DirRaster::new(Raster::from_array(raster.grid, codes)?, encoding))
}

pub fn parse_ascii_grid(text: &str) -> std::result::Result<Raster<f64>, String> {
    let mut tokens = text.split_whitespace().peekable();
    let mut ncols = None;
    let mut nrows = None;
    let mut xll = None;
    let mut yll = None;
    let mut centred = (false, false);
    let mut cell_size = None;
    let mut nodata = DEFAULT_NODATA;

    while let Some(&key) = tokens.peek() {
        if key.parse::<f64>().is_ok() {
            break;
        }
        let key = key.to_ascii_lowercase();
        tokens.next();
        let value = tokens
            .next()
            .ok_or_else(|| format!("header key '{}' has no value", key))?;
        let number = value
            .parse::<f64>()
            .map_err(|e| format!("header {} = '{}': {}", key, value, e))?;
        match key.as_str() {
            "ncols" => ncols = Some(number as usize),
            "nrows" => nrows = Some(number as usize),
            "xllcorner" => xll = Some(number),
            "yllcorner" => yll = Some(number),
            "xllcenter" => {
                xll = Some(number);
                centred.0 = true;
            }
            "yllcenter" => {
                yll = Some(number);
                centred.1 = true;
            }
            "cellsize" => cell_size = Some(number),
            "nodata_value" => nodata = number,
            other => return Err(format!("unknown header key '{}'", other)),
        }
    }

    let ncols = ncols.ok_or("missing ncols")?;
    let nrows = nrows.ok_or("missing nrows")?;
    let cell_size = cell_size.ok_or("missing cellsize")?;
    let mut xll = xll.ok_or("missing xllcorner")?;
    let mut yll = yll.ok_or("missing yllcorner")?;
    if centred.0 {
        xll -= cell_size / 2.0;
    }
    if centred.1 {
        yll -= cell_size / 2.0;
    }

    let values = tokens
        .map(|t| t.parse::<f64>().map_err(|e| format!("value '{}': {}", t, e)))
        .collect::<std::result::Result<Vec<f64>, String>>()?;
    let grid = GridConfig::new(ncols, nrows, xll, yll, cell_size, nodata);
    Raster::from_rows(grid, values).map_err(|e| e.to_string())
}

pub fn write_ascii_grid(path: &Path, raster: &Raster<f64>) -> Result<()> {
    let g = &raster.grid;
    let mut w = BufWriter::new(fs::File::create(path)?);
    writeln!(w, "ncols {}", g.ncols)?;
    writeln!(w, "nrows {}", g.nrows)?;
    writeln!(w, "xllcorner {}", g.xll)?;
    writeln!(w, "yllcorner {}", g.yll)?;
    writeln!(w, "cellsize {}", g.cell_size)?;
    writeln!(w, "NODATA_value {}", g.nodata)?;
    for row in 0..g.nrows {
        let line: Vec<String> = (0..g.ncols)
            .map(|col| raster.data[(col, row)].to_string())
            .collect();
        writeln!(w, "{}", line.join(" "))?;
    }
    w.flush()?;
    Ok(())
}

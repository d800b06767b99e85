use crate::error::{BasinError, Result};

// Grid metadata shared by a DEM/DIR pair. Every raster carries its own copy,
// there is no process-wide grid state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridConfig {
    pub ncols: usize,
    pub nrows: usize,
    pub xll: f64,
    pub yll: f64,
    pub cell_size: f64,
    pub projected_cell_size: Option<f64>,
    pub nodata: f64,
}

impl GridConfig {
    pub fn new(ncols: usize, nrows: usize, xll: f64, yll: f64, cell_size: f64, nodata: f64) -> Self {
        GridConfig {
            ncols,
            nrows,
            xll,
            yll,
            cell_size,
            projected_cell_size: None,
            nodata,
        }
    }

    /// Planar cell size used for lengths and areas when the raster is geographic.
    pub fn with_projected_cell_size(mut self, dxp: f64) -> Self {
        self.projected_cell_size = Some(dxp);
        self
    }

    /// Cell size in metres: the projected size when given, the native one otherwise.
    pub fn dxp(&self) -> f64 {
        self.projected_cell_size.unwrap_or(self.cell_size)
    }

    pub fn len(&self) -> usize {
        self.ncols * self.nrows
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn y_top(&self) -> f64 {
        self.yll + self.nrows as f64 * self.cell_size
    }

    pub fn x_right(&self) -> f64 {
        self.xll + self.ncols as f64 * self.cell_size
    }

    /// (col, row) of the cell containing (x, y); row 0 is the northern edge.
    pub fn cell_of(&self, x: f64, y: f64) -> Option<(usize, usize)> {
        if !x.is_finite() || !y.is_finite() {
            return None;
        }
        let col = ((x - self.xll) / self.cell_size).floor();
        let row = ((self.y_top() - y) / self.cell_size).floor();
        if col < 0.0 || row < 0.0 || col >= self.ncols as f64 || row >= self.nrows as f64 {
            return None;
        }
        Some((col as usize, row as usize))
    }

    pub fn cell_center(&self, col: usize, row: usize) -> (f64, f64) {
        (
            self.xll + (col as f64 + 0.5) * self.cell_size,
            self.y_top() - (row as f64 + 0.5) * self.cell_size,
        )
    }

    /// Raster corners: lower-left, upper-left, upper-right, lower-right.
    pub fn corners(&self) -> [(f64, f64); 4] {
        [
            (self.xll, self.yll),
            (self.xll, self.y_top()),
            (self.x_right(), self.y_top()),
            (self.x_right(), self.yll),
        ]
    }

    pub fn is_nodata(&self, value: f64) -> bool {
        value.is_nan() || (value - self.nodata).abs() < f64::EPSILON
    }

    pub fn ensure_same(&self, other: &GridConfig, context: &str) -> Result<()> {
        let tol = 1e-9 * self.cell_size.abs().max(1.0);
        let same = self.ncols == other.ncols
            && self.nrows == other.nrows
            && (self.xll - other.xll).abs() <= tol
            && (self.yll - other.yll).abs() <= tol
            && (self.cell_size - other.cell_size).abs() <= tol;
        if same {
            Ok(())
        } else {
            Err(BasinError::ConfigurationMismatch(format!(
                "{}: {}x{} @ ({}, {}) dx={} vs {}x{} @ ({}, {}) dx={}",
                context,
                self.ncols,
                self.nrows,
                self.xll,
                self.yll,
                self.cell_size,
                other.ncols,
                other.nrows,
                other.xll,
                other.yll,
                other.cell_size
            )))
        }
    }
}

// Simulation resolution, fixed for the lifetime of a SimuBasin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    ByCell,
    ByHillslope,
}

impl Resolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::ByCell => "cells",
            Resolution::ByHillslope => "hills",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s.trim() {
            "cells" | "cell" => Ok(Resolution::ByCell),
            "hills" | "hill" | "hillslopes" => Ok(Resolution::ByHillslope),
            other => Err(BasinError::Parse(format!("unknown resolution '{}'", other))),
        }
    }
}

// Accumulation thresholds separating hillslope, carcava and channel cells
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UnitThresholds {
    pub lower: f64,
    pub upper: f64,
}

impl Default for UnitThresholds {
    fn default() -> Self {
        UnitThresholds {
            lower: 30.0,
            upper: 500.0,
        }
    }
}

impl UnitThresholds {
    pub fn new(lower: f64, upper: f64) -> Result<Self> {
        if lower > upper {
            return Err(BasinError::InvalidParameter {
                name: "thresholds",
                reason: format!("lower ({}) above upper ({})", lower, upper),
            });
        }
        Ok(UnitThresholds { lower, upper })
    }
}

/// Multipliers handed to the process engine, in this order: evaporation,
/// infiltration, percolation, losses, surface speed, subsurface speed,
/// groundwater speed, channel speed, capillary capacity, gravitational capacity.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationFactors(pub [f64; 10]);

impl Default for CalibrationFactors {
    fn default() -> Self {
        CalibrationFactors([1.0; 10])
    }
}

impl CalibrationFactors {
    pub fn from_slice(values: &[f64]) -> Result<Self> {
        let arr: [f64; 10] = values
            .try_into()
            .map_err(|_| BasinError::shape("calibration factors", 10, values.len()))?;
        Ok(CalibrationFactors(arr))
    }

    pub fn evaporation(&self) -> f64 {
        self.0[0]
    }

    pub fn infiltration(&self) -> f64 {
        self.0[1]
    }

    pub fn percolation(&self) -> f64 {
        self.0[2]
    }

    pub fn losses(&self) -> f64 {
        self.0[3]
    }

    /// Speed factor of tank `k` (0 surface, 1 subsurface, 2 groundwater, 3 channel).
    pub fn speed(&self, k: usize) -> f64 {
        self.0[4 + k]
    }

    pub fn capilar_capacity(&self) -> f64 {
        self.0[8]
    }

    pub fn gravit_capacity(&self) -> f64 {
        self.0[9]
    }
}

// Column names of the station and rainfall tables
#[derive(Debug, Clone)]
pub struct TableConfig {
    pub station_id: String,
    pub station_x: String,
    pub station_y: String,
    pub timestamp: String,
    pub timestamp_format: String,
}

impl TableConfig {
    pub fn new() -> Self {
        TableConfig {
            station_id: "id".to_string(),
            station_x: "x".to_string(),
            station_y: "y".to_string(),
            timestamp: "timestamp".to_string(),
            timestamp_format: "%Y-%m-%d %H:%M".to_string(),
        }
    }
}

impl Default for TableConfig {
    fn default() -> Self {
        Self::new()
    }
}

// Output format configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Csv,
    #[value(name = "netcdf")]
    NetCdf,
    Both,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cell_of_and_center_agree() {
        let grid = GridConfig::new(4, 3, 100.0, 200.0, 10.0, -9999.0);
        let (x, y) = grid.cell_center(2, 1);
        assert_eq!((x, y), (125.0, 215.0));
        assert_eq!(grid.cell_of(x, y), Some((2, 1)));
        assert_eq!(grid.cell_of(99.0, 210.0), None);
        assert_eq!(grid.cell_of(141.0, 210.0), None);
    }

    #[test]
    fn ensure_same_rejects_other_extent() {
        let a = GridConfig::new(4, 3, 0.0, 0.0, 10.0, -9999.0);
        let b = GridConfig::new(4, 4, 0.0, 0.0, 10.0, -9999.0);
        assert!(a.ensure_same(&a, "dem").is_ok());
        assert!(matches!(
            a.ensure_same(&b, "dir"),
            Err(BasinError::ConfigurationMismatch(_))
        ));
    }

    #[test]
    fn calibration_needs_ten_values() {
        assert!(CalibrationFactors::from_slice(&[1.0; 9]).is_err());
        let cal = CalibrationFactors::from_slice(&[1., 2., 3., 4., 5., 6., 7., 8., 9., 10.]).unwrap();
        assert_eq!(cal.speed(3), 8.0);
        assert_eq!(cal.gravit_capacity(), 10.0);
    }

    #[test]
    fn resolution_parses_both_spellings() {
        assert_eq!(Resolution::parse("cells").unwrap(), Resolution::ByCell);
        assert_eq!(Resolution::parse("hills").unwrap(), Resolution::ByHillslope);
        assert!(Resolution::parse("tiles").is_err());
    }
}

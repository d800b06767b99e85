//! Rasters and D8 flow-direction decoding.
//!
//! Rasters are stored transposed, `(col, row)`, so indexing reads as (x, y).
//! Row 0 is the northern edge of the grid.

use ndarray::Array2;

use crate::config::GridConfig;
use crate::error::{BasinError, Result};

/// Single-band raster with its own grid metadata.
#[derive(Debug, Clone)]
pub struct Raster<T> {
    pub grid: GridConfig,
    pub data: Array2<T>,
}

impl<T: Copy> Raster<T> {
    pub fn from_array(grid: GridConfig, data: Array2<T>) -> Result<Self> {
        let (c, r) = data.dim();
        if c != grid.ncols || r != grid.nrows {
            return Err(BasinError::shape("raster data", grid.len(), c * r));
        }
        Ok(Raster { grid, data })
    }

    /// Builds a raster from row-major values (north row first), as they appear in a file.
    pub fn from_rows(grid: GridConfig, rows: Vec<T>) -> Result<Self> {
        if rows.len() != grid.len() {
            return Err(BasinError::shape("raster values", grid.len(), rows.len()));
        }
        let data = Array2::from_shape_fn((grid.ncols, grid.nrows), |(c, r)| rows[r * grid.ncols + c]);
        Ok(Raster { grid, data })
    }

    pub fn filled(grid: GridConfig, value: T) -> Self {
        Raster {
            grid,
            data: Array2::from_elem((grid.ncols, grid.nrows), value),
        }
    }

    pub fn get(&self, col: usize, row: usize) -> Option<T> {
        self.data.get((col, row)).copied()
    }

    pub fn value_at(&self, x: f64, y: f64) -> Option<T> {
        let (col, row) = self.grid.cell_of(x, y)?;
        self.get(col, row)
    }
}

/// Encoding of the values in a flow-direction raster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DirEncoding {
    /// Numeric keypad layout, 5 marks a pit:
    /// ```text
    ///   7  8  9
    ///   4  5  6
    ///   1  2  3
    /// ```
    #[default]
    Keypad,
    /// Power-of-two codes: 1 E, 2 SE, 4 S, 8 SW, 16 W, 32 NW, 64 N, 128 NE.
    Esri,
}

impl DirEncoding {
    /// (dcol, drow) offset of the receiving neighbour, `None` for pits and unknown codes.
    pub fn offset(&self, code: i32) -> Option<(isize, isize)> {
        match self {
            DirEncoding::Keypad => match code {
                7 => Some((-1, -1)),
                8 => Some((0, -1)),
                9 => Some((1, -1)),
                4 => Some((-1, 0)),
                6 => Some((1, 0)),
                1 => Some((-1, 1)),
                2 => Some((0, 1)),
                3 => Some((1, 1)),
                _ => None,
            },
            DirEncoding::Esri => match code {
                1 => Some((1, 0)),
                2 => Some((1, 1)),
                4 => Some((0, 1)),
                8 => Some((-1, 1)),
                16 => Some((-1, 0)),
                32 => Some((-1, -1)),
                64 => Some((0, -1)),
                128 => Some((1, -1)),
                _ => None,
            },
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DirEncoding::Keypad => "keypad",
            DirEncoding::Esri => "esri",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s.trim() {
            "keypad" => Ok(DirEncoding::Keypad),
            "esri" => Ok(DirEncoding::Esri),
            other => Err(BasinError::Parse(format!("unknown direction encoding '{}'", other))),
        }
    }
}

/// D8 neighbour offsets (dcol, drow)
pub const D8_OFFSETS: [(isize, isize); 8] = [
    (1, 0),
    (1, -1),
    (0, -1),
    (-1, -1),
    (-1, 0),
    (-1, 1),
    (0, 1),
    (1, 1),
];

/// Flow-direction raster together with its code convention.
#[derive(Debug, Clone)]
pub struct DirRaster {
    pub raster: Raster<i32>,
    pub encoding: DirEncoding,
}

impl DirRaster {
    pub fn new(raster: Raster<i32>, encoding: DirEncoding) -> Self {
        DirRaster { raster, encoding }
    }

    pub fn grid(&self) -> &GridConfig {
        &self.raster.grid
    }

    /// Receiving cell of (col, row); `None` at pits, no-flow codes and grid edges.
    pub fn downstream(&self, col: usize, row: usize) -> Option<(usize, usize)> {
        let code = self.raster.get(col, row)?;
        let (dc, dr) = self.encoding.offset(code)?;
        neighbour(self.grid(), col, row, dc, dr)
    }

    /// True when the DIR code at (col, row) encodes a direction at all,
    /// even one that leaves the grid.
    pub fn has_direction(&self, col: usize, row: usize) -> bool {
        self.raster
            .get(col, row)
            .and_then(|code| self.encoding.offset(code))
            .is_some()
    }

    /// Cells whose flow direction points at (col, row).
    pub fn upstream(&self, col: usize, row: usize) -> Vec<(usize, usize)> {
        let mut out = Vec::new();
        for &(dc, dr) in D8_OFFSETS.iter() {
            if let Some((nc, nr)) = neighbour(self.grid(), col, row, dc, dr) {
                if self.downstream(nc, nr) == Some((col, row)) {
                    out.push((nc, nr));
                }
            }
        }
        out
    }
}

pub fn neighbour(grid: &GridConfig, col: usize, row: usize, dc: isize, dr: isize) -> Option<(usize, usize)> {
    let nc = col as isize + dc;
    let nr = row as isize + dr;
    if nc < 0 || nr < 0 || nc >= grid.ncols as isize || nr >= grid.nrows as isize {
        return None;
    }
    Some((nc as usize, nr as usize))
}

/// Planar distance between two D8 neighbours.
pub fn step_length(dxp: f64, from: (usize, usize), to: (usize, usize)) -> f64 {
    if from.0 != to.0 && from.1 != to.1 {
        dxp * std::f64::consts::SQRT_2
    } else {
        dxp
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keypad_and_esri_agree_on_directions() {
        let pairs = [(6, 1), (3, 2), (2, 4), (1, 8), (4, 16), (7, 32), (8, 64), (9, 128)];
        for (keypad, esri) in pairs {
            assert_eq!(
                DirEncoding::Keypad.offset(keypad),
                DirEncoding::Esri.offset(esri),
                "keypad {} vs esri {}",
                keypad,
                esri
            );
        }
        assert_eq!(DirEncoding::Keypad.offset(5), None);
        assert_eq!(DirEncoding::Esri.offset(0), None);
    }

    #[test]
    fn from_rows_transposes() {
        let grid = GridConfig::new(3, 2, 0.0, 0.0, 1.0, -9999.0);
        let r = Raster::from_rows(grid, vec![1, 2, 3, 4, 5, 6]).unwrap();
        assert_eq!(r.get(2, 0), Some(3));
        assert_eq!(r.get(0, 1), Some(4));
        assert_eq!(r.data.dim(), (3, 2));
    }

    #[test]
    fn downstream_stops_at_edge() {
        let grid = GridConfig::new(2, 2, 0.0, 0.0, 1.0, -9999.0);
        // all cells flow west
        let dir = DirRaster::new(Raster::filled(grid, 4), DirEncoding::Keypad);
        assert_eq!(dir.downstream(1, 0), Some((0, 0)));
        assert_eq!(dir.downstream(0, 0), None);
        assert!(dir.has_direction(0, 0));
        assert_eq!(dir.upstream(0, 1), vec![(1, 1)]);
    }
}

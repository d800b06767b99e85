//! Grid engine: the per-cell primitives every basin operation is built on.
//!
//! All functions here work on a [`CellStructure`], the ordered list of basin
//! cells produced by [`trace_basin`]. The order is topological: a cell always
//! comes before the cell it drains to, and the outlet is the last record.

use log::debug;
use std::collections::{HashMap, VecDeque};

use crate::config::GridConfig;
use crate::error::{BasinError, Result};
use crate::grid::{DirRaster, Raster, step_length};

/// Lower bound applied to cell slopes so flat cells still route water.
pub const MIN_SLOPE: f64 = 1e-4;

/// One basin cell: its grid position and the index of its downstream cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellRecord {
    pub col: usize,
    pub row: usize,
    pub dest: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CellStructure {
    cells: Vec<CellRecord>,
}

impl CellStructure {
    /// Validates the ordering invariants before accepting the records.
    pub fn from_records(cells: Vec<CellRecord>) -> Result<Self> {
        if cells.is_empty() {
            return Err(BasinError::Tracing("cell structure is empty".into()));
        }
        let last = cells.len() - 1;
        for (i, cell) in cells.iter().enumerate() {
            match cell.dest {
                None if i != last => {
                    return Err(BasinError::Tracing(format!(
                        "cell {} has no destination but is not the outlet",
                        i
                    )));
                }
                Some(d) if d <= i || d > last => {
                    return Err(BasinError::Tracing(format!(
                        "cell {} drains to {} which breaks the upstream-first order",
                        i, d
                    )));
                }
                _ => {}
            }
        }
        if cells[last].dest.is_some() {
            return Err(BasinError::Tracing("outlet has a destination".into()));
        }
        Ok(CellStructure { cells })
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    pub fn cells(&self) -> &[CellRecord] {
        &self.cells
    }

    pub fn outlet(&self) -> usize {
        self.cells.len() - 1
    }

    pub fn dest(&self, i: usize) -> Option<usize> {
        self.cells[i].dest
    }

    /// Upstream contributors of every cell.
    pub fn upstream_lists(&self) -> Vec<Vec<usize>> {
        let mut ups = vec![Vec::new(); self.cells.len()];
        for (i, cell) in self.cells.iter().enumerate() {
            if let Some(d) = cell.dest {
                ups[d].push(i);
            }
        }
        ups
    }

    pub fn index(&self) -> HashMap<(usize, usize), usize> {
        self.cells
            .iter()
            .enumerate()
            .map(|(i, c)| ((c.col, c.row), i))
            .collect()
    }

    pub fn coordinates(&self, grid: &GridConfig) -> Vec<(f64, f64)> {
        self.cells
            .iter()
            .map(|c| grid.cell_center(c.col, c.row))
            .collect()
    }
}

/// Traces every cell draining to the pour point at (x, y).
pub fn trace_basin(dir: &DirRaster, x: f64, y: f64) -> Result<CellStructure> {
    let grid = dir.grid();
    let (col, row) = grid.cell_of(x, y).ok_or_else(|| {
        BasinError::Tracing(format!("pour point ({}, {}) outside the raster extent", x, y))
    })?;
    let code = dir.raster.get(col, row).unwrap_or(0);
    if grid.is_nodata(code as f64) {
        return Err(BasinError::Tracing(format!(
            "pour point ({}, {}) falls on a nodata direction cell, zero cells traced",
            x, y
        )));
    }

    // Breadth-first from the outlet: each cell is discovered from its downstream cell.
    let mut visited = vec![false; grid.len()];
    let mut bfs: Vec<((usize, usize), Option<usize>)> = Vec::new();
    let mut queue: VecDeque<usize> = VecDeque::new();
    visited[row * grid.ncols + col] = true;
    bfs.push(((col, row), None));
    queue.push_back(0);

    while let Some(k) = queue.pop_front() {
        let (cell, _) = bfs[k];
        for up in dir.upstream(cell.0, cell.1) {
            let flat = up.1 * grid.ncols + up.0;
            if visited[flat] {
                continue;
            }
            visited[flat] = true;
            bfs.push((up, Some(k)));
            queue.push_back(bfs.len() - 1);
        }
    }

    let n = bfs.len();
    let records = bfs
        .iter()
        .rev()
        .map(|&((c, r), parent)| CellRecord {
            col: c,
            row: r,
            dest: parent.map(|p| n - 1 - p),
        })
        .collect();
    let structure = CellStructure::from_records(records)?;
    debug!("traced {} cells upstream of ({}, {})", n, col, row);
    Ok(structure)
}

/// Per-cell fields index-aligned with the cell structure.
#[derive(Debug, Clone, PartialEq)]
pub struct CellBasics {
    /// Upstream cell count, the cell itself included.
    pub acum: Vec<f64>,
    /// Distance to the downstream neighbour [m].
    pub long: Vec<f64>,
    /// Drop to the downstream neighbour over `long` [m/m].
    pub slope: Vec<f64>,
    pub elev: Vec<f64>,
}

impl CellBasics {
    pub fn len(&self) -> usize {
        self.acum.len()
    }

    pub fn is_empty(&self) -> bool {
        self.acum.is_empty()
    }
}

pub fn accumulation(structure: &CellStructure) -> Vec<f64> {
    let mut acum = vec![1.0; structure.len()];
    for (i, cell) in structure.cells().iter().enumerate() {
        if let Some(d) = cell.dest {
            acum[d] += acum[i];
        }
    }
    acum
}

pub fn cell_basics(structure: &CellStructure, dem: &Raster<f64>, dir: &DirRaster) -> Result<CellBasics> {
    let grid = &dem.grid;
    let dxp = grid.dxp();
    let cells = structure.cells();

    let mut elev = Vec::with_capacity(cells.len());
    for c in cells {
        let z = dem.get(c.col, c.row).unwrap_or(f64::NAN);
        if grid.is_nodata(z) {
            return Err(BasinError::InvalidParameter {
                name: "dem",
                reason: format!("nodata elevation inside the basin at ({}, {})", c.col, c.row),
            });
        }
        elev.push(z);
    }

    let mut long = Vec::with_capacity(cells.len());
    let mut slope = Vec::with_capacity(cells.len());
    for (i, c) in cells.iter().enumerate() {
        let (l, drop) = match c.dest {
            Some(d) => {
                let to = (cells[d].col, cells[d].row);
                (step_length(dxp, (c.col, c.row), to), elev[i] - elev[d])
            }
            None => match dir.downstream(c.col, c.row) {
                Some(to) => {
                    let z = dem.get(to.0, to.1).unwrap_or(f64::NAN);
                    let drop = if grid.is_nodata(z) { 0.0 } else { elev[i] - z };
                    (step_length(dxp, (c.col, c.row), to), drop)
                }
                None => (dxp, 0.0),
            },
        };
        long.push(l);
        slope.push((drop / l).max(MIN_SLOPE));
    }

    Ok(CellBasics {
        acum: accumulation(structure),
        long,
        slope,
        elev,
    })
}

/// Distance along the flow path from each cell to the outlet.
pub fn flow_length(structure: &CellStructure, long: &[f64]) -> Vec<f64> {
    let mut dist = vec![0.0; structure.len()];
    for i in (0..structure.len()).rev() {
        if let Some(d) = structure.dest(i) {
            dist[i] = long[i] + dist[d];
        }
    }
    dist
}

/// Travel time from each cell to the outlet for the given per-cell speed.
pub fn time_to_outlet(structure: &CellStructure, long: &[f64], speed: &[f64]) -> Vec<f64> {
    let mut time = vec![0.0; structure.len()];
    for i in (0..structure.len()).rev() {
        if let Some(d) = structure.dest(i) {
            time[i] = long[i] / speed[i] + time[d];
        }
    }
    time
}

pub fn channel_mask(acum: &[f64], threshold: f64) -> Vec<bool> {
    acum.iter().map(|&a| a > threshold).collect()
}

/// Channel cells with no channel cell upstream.
pub fn stream_heads(structure: &CellStructure, channel: &[bool]) -> Vec<usize> {
    let mut has_channel_upstream = vec![false; structure.len()];
    for (i, cell) in structure.cells().iter().enumerate() {
        if let (true, Some(d)) = (channel[i], cell.dest) {
            has_channel_upstream[d] = true;
        }
    }
    (0..structure.len())
        .filter(|&i| channel[i] && !has_channel_upstream[i])
        .collect()
}

/// Main flow path of the basin from its head to the outlet.
#[derive(Debug, Clone, PartialEq)]
pub struct PrincipalStream {
    pub cells: Vec<usize>,
    pub elevation: Vec<f64>,
    /// Cumulative distance from the head [m].
    pub distance: Vec<f64>,
}

impl PrincipalStream {
    pub fn head(&self) -> usize {
        self.cells[0]
    }

    pub fn length(&self) -> f64 {
        self.distance.last().copied().unwrap_or(0.0)
    }
}

pub fn principal_stream(
    structure: &CellStructure,
    channel: &[bool],
    basics: &CellBasics,
    flow_len: &[f64],
) -> PrincipalStream {
    let heads = stream_heads(structure, channel);
    let candidates: Vec<usize> = if heads.is_empty() {
        (0..structure.len()).collect()
    } else {
        heads
    };
    let head = argmax(candidates.iter().map(|&i| (i, flow_len[i])));

    let mut cells = vec![head];
    let mut distance = vec![0.0];
    let mut current = head;
    while let Some(d) = structure.dest(current) {
        let prev = distance[distance.len() - 1];
        distance.push(prev + basics.long[current]);
        cells.push(d);
        current = d;
    }
    let elevation = cells.iter().map(|&i| basics.elev[i]).collect();
    PrincipalStream {
        cells,
        elevation,
        distance,
    }
}

/// Number of cell edges on the basin boundary.
pub fn perimeter_edges(structure: &CellStructure, grid: &GridConfig) -> usize {
    let mut inside = vec![false; grid.len()];
    for c in structure.cells() {
        inside[c.row * grid.ncols + c.col] = true;
    }
    let mut edges = 0;
    for c in structure.cells() {
        for (dc, dr) in [(1isize, 0isize), (-1, 0), (0, 1), (0, -1)] {
            match crate::grid::neighbour(grid, c.col, c.row, dc, dr) {
                Some((nc, nr)) if inside[nr * grid.ncols + nc] => {}
                _ => edges += 1,
            }
        }
    }
    edges
}

/// Samples an external raster at every basin cell centre. Unmapped cells take
/// the mean of their resolved neighbours, then the mean of the whole basin.
pub fn map_to_basin(structure: &CellStructure, grid: &GridConfig, raster: &Raster<f64>) -> Result<Vec<f64>> {
    let lookup = |x: f64, y: f64| -> Option<(usize, usize, f64)> {
        let (c, r) = raster.grid.cell_of(x, y)?;
        let v = raster.get(c, r)?;
        if raster.grid.is_nodata(v) { None } else { Some((c, r, v)) }
    };

    let coords = structure.coordinates(grid);
    let mut values: Vec<Option<f64>> = coords.iter().map(|&(x, y)| lookup(x, y).map(|t| t.2)).collect();
    let resolved: Vec<f64> = values.iter().flatten().copied().collect();
    if resolved.is_empty() {
        return Err(BasinError::ConfigurationMismatch(
            "external raster does not overlap the basin".into(),
        ));
    }
    let basin_mean = resolved.iter().sum::<f64>() / resolved.len() as f64;

    let mut unmapped = 0;
    for (i, &(x, y)) in coords.iter().enumerate() {
        if values[i].is_some() {
            continue;
        }
        unmapped += 1;
        let mut sum = 0.0;
        let mut n = 0;
        for &(dc, dr) in crate::grid::D8_OFFSETS.iter() {
            let nx = x + dc as f64 * raster.grid.cell_size;
            let ny = y - dr as f64 * raster.grid.cell_size;
            if let Some((_, _, v)) = lookup(nx, ny) {
                sum += v;
                n += 1;
            }
        }
        values[i] = Some(if n > 0 { sum / n as f64 } else { basin_mean });
    }
    if unmapped > 0 {
        debug!("filled {} unmapped cells with neighbour means", unmapped);
    }
    Ok(values.into_iter().map(|v| v.unwrap_or(basin_mean)).collect())
}

/// Least-squares slope and intercept of y on x.
pub fn linear_fit(x: &[f64], y: &[f64]) -> (f64, f64) {
    let n = x.len().min(y.len());
    if n < 2 {
        return (0.0, y.first().copied().unwrap_or(0.0));
    }
    let mx = x[..n].iter().sum::<f64>() / n as f64;
    let my = y[..n].iter().sum::<f64>() / n as f64;
    let mut sxy = 0.0;
    let mut sxx = 0.0;
    for i in 0..n {
        sxy += (x[i] - mx) * (y[i] - my);
        sxx += (x[i] - mx) * (x[i] - mx);
    }
    if sxx == 0.0 {
        return (0.0, my);
    }
    let slope = sxy / sxx;
    (slope, my - slope * mx)
}

fn argmax(iter: impl Iterator<Item = (usize, f64)>) -> usize {
    let mut best = (0, f64::NEG_INFINITY);
    for (i, v) in iter {
        if v > best.1 {
            best = (i, v);
        }
    }
    best.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::DirEncoding;

    // 3x3, every cell drains to the centre of the bottom row
    fn funnel() -> (Raster<f64>, DirRaster) {
        let grid = GridConfig::new(3, 3, 0.0, 0.0, 10.0, -9999.0);
        #[rustfmt::skip]
        let dirs = vec![
            3, 2, 1,
            3, 2, 1,
            6, 2, 4,
        ];
        #[rustfmt::skip]
        let elev = vec![
            9.0, 8.0, 9.0,
            6.0, 5.0, 6.0,
            3.0, 1.0, 3.0,
        ];
        let dem = Raster::from_rows(grid, elev).unwrap();
        let dir = DirRaster::new(Raster::from_rows(grid, dirs).unwrap(), DirEncoding::Keypad);
        (dem, dir)
    }

    #[test]
    fn trace_orders_outlet_last() {
        let (_, dir) = funnel();
        let s = trace_basin(&dir, 15.0, 5.0).unwrap();
        assert_eq!(s.len(), 9);
        let outlet = s.cells()[s.outlet()];
        assert_eq!((outlet.col, outlet.row), (1, 2));
        for (i, c) in s.cells().iter().enumerate() {
            if let Some(d) = c.dest {
                assert!(d > i);
            }
        }
    }

    #[test]
    fn trace_outside_extent_fails() {
        let (_, dir) = funnel();
        assert!(matches!(trace_basin(&dir, -5.0, 5.0), Err(BasinError::Tracing(_))));
    }

    #[test]
    fn accumulation_counts_upstream_cells() {
        let (dem, dir) = funnel();
        let s = trace_basin(&dir, 15.0, 5.0).unwrap();
        let basics = cell_basics(&s, &dem, &dir).unwrap();
        assert_eq!(basics.acum[s.outlet()], 9.0);
        let idx = s.index();
        assert_eq!(basics.acum[idx[&(1, 1)]], 4.0);
        assert_eq!(basics.acum[idx[&(0, 0)]], 1.0);
        // diagonal step is longer
        assert!((basics.long[idx[&(0, 1)]] - 10.0 * std::f64::consts::SQRT_2).abs() < 1e-12);
        assert!((basics.slope[idx[&(1, 1)]] - 0.4).abs() < 1e-12);
    }

    #[test]
    fn principal_stream_starts_at_farthest_head() {
        let (dem, dir) = funnel();
        let s = trace_basin(&dir, 15.0, 5.0).unwrap();
        let basics = cell_basics(&s, &dem, &dir).unwrap();
        let channel = channel_mask(&basics.acum, 2.0);
        let fl = flow_length(&s, &basics.long);
        let ppal = principal_stream(&s, &channel, &basics, &fl);
        let head = s.cells()[ppal.head()];
        assert_eq!((head.col, head.row), (1, 1));
        assert_eq!(*ppal.cells.last().unwrap(), s.outlet());
        assert_eq!(ppal.length(), 10.0);
    }

    #[test]
    fn perimeter_of_full_square() {
        let (_, dir) = funnel();
        let s = trace_basin(&dir, 15.0, 5.0).unwrap();
        assert_eq!(perimeter_edges(&s, dir.grid()), 12);
    }

    #[test]
    fn linear_fit_recovers_line() {
        let (m, b) = linear_fit(&[0.0, 1.0, 2.0], &[1.0, 3.0, 5.0]);
        assert!((m - 2.0).abs() < 1e-12);
        assert!((b - 1.0).abs() < 1e-12);
    }

    #[test]
    fn map_to_basin_fills_nodata_with_neighbour_mean() {
        let (_, dir) = funnel();
        let s = trace_basin(&dir, 15.0, 5.0).unwrap();
        let grid = *dir.grid();
        #[rustfmt::skip]
        let vals = vec![
            1.0, 1.0, 1.0,
            1.0, -9999.0, 3.0,
            1.0, 1.0, 1.0,
        ];
        let ext = Raster::from_rows(grid, vals).unwrap();
        let mapped = map_to_basin(&s, &grid, &ext).unwrap();
        let centre = s.index()[&(1, 1)];
        assert!((mapped[centre] - 10.0 / 8.0).abs() < 1e-12);
    }
}

//! Single channel path traced downstream from a high point.
//!
//! A [`Stream`] has no aggregation structure; it exists so pour points and
//! control points can be snapped onto a drainage line.

use log::debug;
use std::collections::HashSet;
use std::sync::Arc;

use crate::error::{BasinError, Result};
use crate::grid::{DirRaster, Raster, step_length};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamVertex {
    pub x: f64,
    pub y: f64,
    pub elevation: f64,
    /// Cumulative distance from the first vertex [m].
    pub distance: f64,
}

#[derive(Debug, Clone)]
pub struct Stream {
    pub name: String,
    pub dem: Arc<Raster<f64>>,
    pub dir: Arc<DirRaster>,
    pub vertices: Vec<StreamVertex>,
}

impl Stream {
    /// Follows the flow directions from (x, y) until a pit, a no-flow code or
    /// the raster edge.
    pub fn trace(name: &str, x: f64, y: f64, dem: Arc<Raster<f64>>, dir: Arc<DirRaster>) -> Result<Self> {
        dem.grid.ensure_same(dir.grid(), "stream DEM vs DIR")?;
        let grid = dem.grid;
        let mut current = grid.cell_of(x, y).ok_or_else(|| {
            BasinError::Tracing(format!("stream start ({}, {}) outside the raster extent", x, y))
        })?;

        let mut seen = HashSet::new();
        let mut vertices = Vec::new();
        let mut distance = 0.0;
        loop {
            if !seen.insert(current) {
                return Err(BasinError::Tracing(format!(
                    "stream from ({}, {}) loops at cell {:?} without reaching a sink",
                    x, y, current
                )));
            }
            let (cx, cy) = grid.cell_center(current.0, current.1);
            vertices.push(StreamVertex {
                x: cx,
                y: cy,
                elevation: dem.get(current.0, current.1).unwrap_or(grid.nodata),
                distance,
            });
            match dir.downstream(current.0, current.1) {
                Some(next) => {
                    distance += step_length(grid.dxp(), current, next);
                    current = next;
                }
                None => break,
            }
        }
        debug!("stream '{}' traced over {} cells ({:.1} m)", name, vertices.len(), distance);

        Ok(Stream {
            name: name.to_string(),
            dem,
            dir,
            vertices,
        })
    }

    pub fn len(&self) -> usize {
        self.vertices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    pub fn length(&self) -> f64 {
        self.vertices.last().map(|v| v.distance).unwrap_or(0.0)
    }

    /// Vertex closest to (x, y).
    pub fn nearest_vertex(&self, x: f64, y: f64) -> Option<&StreamVertex> {
        let points: Vec<(f64, f64)> = self.vertices.iter().map(|v| (v.x, v.y)).collect();
        nearest_point(&points, x, y).map(|i| &self.vertices[i])
    }

    /// Replaces (x, y) by the coordinates of the nearest vertex.
    pub fn snap(&self, x: f64, y: f64) -> (f64, f64) {
        match self.nearest_vertex(x, y) {
            Some(v) => (v.x, v.y),
            None => (x, y),
        }
    }
}

/// Index of the point with minimum Euclidean distance to (x, y).
pub fn nearest_point(points: &[(f64, f64)], x: f64, y: f64) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (i, &(px, py)) in points.iter().enumerate() {
        let d = ((x - px).powi(2) + (y - py).powi(2)).sqrt();
        if best.is_none_or(|(_, bd)| d < bd) {
            best = Some((i, d));
        }
    }
    best.map(|(i, _)| i)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GridConfig;
    use crate::grid::DirEncoding;

    fn slope_east(dirs: Vec<i32>) -> (Arc<Raster<f64>>, Arc<DirRaster>) {
        let grid = GridConfig::new(4, 1, 0.0, 0.0, 1.0, -9999.0);
        let dem = Raster::from_rows(grid, vec![4.0, 3.0, 2.0, 1.0]).unwrap();
        let dir = DirRaster::new(Raster::from_rows(grid, dirs).unwrap(), DirEncoding::Keypad);
        (Arc::new(dem), Arc::new(dir))
    }

    #[test]
    fn trace_runs_to_the_sink() {
        let (dem, dir) = slope_east(vec![6, 6, 6, 5]);
        let s = Stream::trace("s", 0.5, 0.5, dem, dir).unwrap();
        assert_eq!(s.len(), 4);
        assert_eq!(s.length(), 3.0);
        assert_eq!(s.vertices[3].elevation, 1.0);
    }

    #[test]
    fn loop_is_a_tracing_error() {
        let (dem, dir) = slope_east(vec![6, 4, 6, 5]);
        assert!(matches!(
            Stream::trace("s", 0.5, 0.5, dem, dir),
            Err(BasinError::Tracing(_))
        ));
    }

    #[test]
    fn nearest_point_picks_minimum_distance() {
        // distances 5, 3, 8, 10 from the origin
        let points = [(5.0, 0.0), (0.0, 3.0), (0.0, -8.0), (-10.0, 0.0)];
        assert_eq!(nearest_point(&points, 0.0, 0.0), Some(1));
        assert_eq!(nearest_point(&[], 0.0, 0.0), None);
    }
}

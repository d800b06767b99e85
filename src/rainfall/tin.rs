//! Linear interpolation over a Delaunay triangulation of the stations.
//!
//! The station set is padded with the four raster corners, each carrying the
//! value of its nearest real station, so every cell centre of the raster lies
//! inside the triangulated hull. The enclosing triangle of each cell is found
//! once; interpolating a record is then a weighted sum.

use log::{debug, warn};

use super::{Interpolator, Station, nearest_station};
use crate::config::GridConfig;
use crate::error::{BasinError, Result};

#[derive(Debug, Clone, Copy, PartialEq)]
struct Point {
    x: f64,
    y: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Triangle([usize; 3]);

#[derive(Debug, Clone)]
pub struct Tin {
    /// For every padded vertex, the real station whose value it takes.
    source: Vec<usize>,
    triangles: Vec<Triangle>,
    /// Per cell: (padded vertex, barycentric weight).
    weights: Vec<[(usize, f64); 3]>,
}

impl Tin {
    pub fn new(stations: &[Station], cell_xy: &[(f64, f64)], grid: &GridConfig) -> Result<Self> {
        if stations.is_empty() {
            return Err(BasinError::InvalidParameter {
                name: "stations",
                reason: "TIN needs at least one station".into(),
            });
        }
        let real: Vec<(f64, f64)> = stations.iter().map(|s| (s.x, s.y)).collect();
        let mut points: Vec<Point> = real.iter().map(|&(x, y)| Point { x, y }).collect();
        let mut source: Vec<usize> = (0..stations.len()).collect();
        for (cx, cy) in grid.corners() {
            let duplicate = points
                .iter()
                .any(|p| (p.x - cx).abs() < 1e-9 && (p.y - cy).abs() < 1e-9);
            if duplicate {
                continue;
            }
            if let Some(nearest) = nearest_station(&real, cx, cy) {
                points.push(Point { x: cx, y: cy });
                source.push(nearest);
            }
        }

        let triangles = delaunay(&points);
        if triangles.is_empty() {
            return Err(BasinError::InvalidParameter {
                name: "stations",
                reason: "failed to triangulate the padded station set".into(),
            });
        }

        let mut outside = 0;
        let weights = cell_xy
            .iter()
            .map(|&(x, y)| {
                enclosing(&points, &triangles, x, y).unwrap_or_else(|| {
                    outside += 1;
                    let all: Vec<(f64, f64)> = points.iter().map(|p| (p.x, p.y)).collect();
                    let k = nearest_station(&all, x, y).unwrap_or(0);
                    [(k, 1.0), (k, 0.0), (k, 0.0)]
                })
            })
            .collect();
        if outside > 0 {
            warn!("{} cells fall outside the station triangulation, using the nearest vertex", outside);
        }
        debug!(
            "TIN over {} stations ({} padded vertices): {} triangles",
            stations.len(),
            points.len(),
            triangles.len()
        );
        Ok(Tin {
            source,
            triangles,
            weights,
        })
    }

    pub fn triangle_count(&self) -> usize {
        self.triangles.len()
    }
}

impl Interpolator for Tin {
    fn method(&self) -> String {
        "TIN".to_string()
    }

    fn cells(&self) -> usize {
        self.weights.len()
    }

    fn interpolate(&self, station_values: &[f64]) -> Vec<f64> {
        let vertex_value = |k: usize| station_values.get(self.source[k]).copied().unwrap_or(0.0);
        self.weights
            .iter()
            .map(|w| w.iter().map(|&(k, wk)| wk * vertex_value(k)).sum::<f64>().max(0.0))
            .collect()
    }
}

fn enclosing(points: &[Point], triangles: &[Triangle], x: f64, y: f64) -> Option<[(usize, f64); 3]> {
    const EPS: f64 = -1e-10;
    triangles.iter().find_map(|t| {
        let [a, b, c] = t.0;
        let (u, v, w) = barycentric(x, y, &points[a], &points[b], &points[c]);
        (u >= EPS && v >= EPS && w >= EPS).then_some([(a, u), (b, v), (c, w)])
    })
}

fn barycentric(px: f64, py: f64, p0: &Point, p1: &Point, p2: &Point) -> (f64, f64, f64) {
    let (v0x, v0y) = (p1.x - p0.x, p1.y - p0.y);
    let (v1x, v1y) = (p2.x - p0.x, p2.y - p0.y);
    let (v2x, v2y) = (px - p0.x, py - p0.y);
    let d00 = v0x * v0x + v0y * v0y;
    let d01 = v0x * v1x + v0y * v1y;
    let d02 = v0x * v2x + v0y * v2y;
    let d11 = v1x * v1x + v1y * v1y;
    let d12 = v1x * v2x + v1y * v2y;
    let denom = d00 * d11 - d01 * d01;
    if denom.abs() < f64::EPSILON {
        return (-1.0, -1.0, -1.0);
    }
    let v = (d11 * d02 - d01 * d12) / denom;
    let w = (d00 * d12 - d01 * d02) / denom;
    (1.0 - v - w, v, w)
}

fn circumcircle(a: &Point, b: &Point, c: &Point) -> Option<(f64, f64, f64)> {
    let d = 2.0 * (a.x * (b.y - c.y) + b.x * (c.y - a.y) + c.x * (a.y - b.y));
    if d.abs() < 1e-12 {
        return None;
    }
    let a2 = a.x * a.x + a.y * a.y;
    let b2 = b.x * b.x + b.y * b.y;
    let c2 = c.x * c.x + c.y * c.y;
    let ux = (a2 * (b.y - c.y) + b2 * (c.y - a.y) + c2 * (a.y - b.y)) / d;
    let uy = (a2 * (c.x - b.x) + b2 * (a.x - c.x) + c2 * (b.x - a.x)) / d;
    Some((ux, uy, (a.x - ux).powi(2) + (a.y - uy).powi(2)))
}

/// Bowyer-Watson triangulation; triangle vertices index into `points`.
fn delaunay(points: &[Point]) -> Vec<Triangle> {
    if points.len() < 3 {
        return Vec::new();
    }
    let (mut min_x, mut min_y) = (f64::MAX, f64::MAX);
    let (mut max_x, mut max_y) = (f64::MIN, f64::MIN);
    for p in points {
        min_x = min_x.min(p.x);
        min_y = min_y.min(p.y);
        max_x = max_x.max(p.x);
        max_y = max_y.max(p.y);
    }
    let dx = max_x - min_x;
    let delta = dx.max(max_y - min_y).max(1.0);

    // super-triangle occupies indices 0..3
    let mut vertices = vec![
        Point { x: min_x - 10.0 * delta, y: min_y - delta },
        Point { x: min_x + 0.5 * dx, y: max_y + 10.0 * delta },
        Point { x: max_x + 10.0 * delta, y: min_y - delta },
    ];
    let mut triangles = vec![Triangle([0, 1, 2])];

    for p in points {
        let vi = vertices.len();
        vertices.push(*p);

        let bad: Vec<usize> = triangles
            .iter()
            .enumerate()
            .filter(|(_, t)| {
                let [a, b, c] = t.0;
                circumcircle(&vertices[a], &vertices[b], &vertices[c])
                    .is_some_and(|(cx, cy, r2)| (p.x - cx).powi(2) + (p.y - cy).powi(2) <= r2)
            })
            .map(|(i, _)| i)
            .collect();

        let edges_of = |t: &Triangle| {
            let [a, b, c] = t.0;
            [(a, b), (b, c), (c, a)]
        };
        let mut boundary = Vec::new();
        for &bi in &bad {
            for (ea, eb) in edges_of(&triangles[bi]) {
                let shared = bad.iter().any(|&oi| {
                    oi != bi
                        && edges_of(&triangles[oi])
                            .iter()
                            .any(|&(oa, ob)| (oa == ea && ob == eb) || (oa == eb && ob == ea))
                });
                if !shared {
                    boundary.push((ea, eb));
                }
            }
        }

        let mut bad_desc = bad;
        bad_desc.sort_unstable_by(|a, b| b.cmp(a));
        for bi in bad_desc {
            triangles.swap_remove(bi);
        }
        triangles.extend(boundary.into_iter().map(|(a, b)| Triangle([a, b, vi])));
    }

    triangles
        .into_iter()
        .filter(|t| t.0.iter().all(|&v| v >= 3))
        .map(|t| Triangle(t.0.map(|v| v - 3)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn grid() -> GridConfig {
        GridConfig::new(10, 10, 0.0, 0.0, 1.0, -9999.0)
    }

    fn station(id: &str, x: f64, y: f64) -> Station {
        Station { id: id.into(), x, y }
    }

    #[test]
    fn square_triangulates_into_two() {
        let pts = [
            Point { x: 0.0, y: 0.0 },
            Point { x: 1.0, y: 0.0 },
            Point { x: 0.0, y: 1.0 },
            Point { x: 1.0, y: 1.0 },
        ];
        assert_eq!(delaunay(&pts).len(), 2);
    }

    #[test]
    fn constant_field_is_reproduced() {
        let stations = vec![station("a", 3.0, 3.0), station("b", 7.0, 4.0), station("c", 5.0, 8.0)];
        let cells = vec![(0.5, 0.5), (5.0, 5.0), (9.5, 9.5)];
        let tin = Tin::new(&stations, &cells, &grid()).unwrap();
        for v in tin.interpolate(&[4.0, 4.0, 4.0]) {
            assert_relative_eq!(v, 4.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn station_location_takes_station_value() {
        let stations = vec![station("a", 3.0, 3.0), station("b", 7.0, 4.0), station("c", 5.0, 8.0)];
        let cells = vec![(7.0, 4.0)];
        let tin = Tin::new(&stations, &cells, &grid()).unwrap();
        assert_relative_eq!(tin.interpolate(&[1.0, 9.0, 2.0])[0], 9.0, epsilon = 1e-9);
    }

    #[test]
    fn single_station_fills_the_raster() {
        let stations = vec![station("a", 5.0, 5.0)];
        let cells = vec![(0.5, 9.5), (9.5, 0.5)];
        let tin = Tin::new(&stations, &cells, &grid()).unwrap();
        assert!(tin.triangle_count() >= 2);
        for v in tin.interpolate(&[3.0]) {
            assert_relative_eq!(v, 3.0, epsilon = 1e-9);
        }
    }
}

//! Watershed entity: delineation, geomorphology and cell-level terrain indices.

use log::{debug, info};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::GridConfig;
use crate::engine::{
    self, CellBasics, CellStructure, PrincipalStream, channel_mask, flow_length, linear_fit,
    perimeter_edges, principal_stream, time_to_outlet, trace_basin,
};
use crate::error::{BasinError, Result};
use crate::grid::{DirRaster, Raster};
use crate::hillslope::HillslopePartition;
use crate::stream::Stream;

pub const TC_METHODS: [&str; 8] = [
    "US Army",
    "Spanish Highways",
    "Kirpich",
    "Campo-Munera",
    "Giandotti",
    "John Stone",
    "Ventura",
    "Temez",
];

#[derive(Debug, Clone, PartialEq)]
pub struct GeoParameters {
    pub area_km2: f64,
    pub perimeter_km: f64,
    pub main_channel_slope_pct: f64,
    pub main_channel_length_km: f64,
    pub basin_slope_pct: f64,
    pub basin_length_km: f64,
    pub h_max: f64,
    pub h_min: f64,
    pub h_mean: f64,
    pub h_channel_max: f64,
}

impl GeoParameters {
    pub fn as_pairs(&self) -> Vec<(&'static str, f64)> {
        vec![
            ("Area [km2]", self.area_km2),
            ("Perimeter [km]", self.perimeter_km),
            ("Main channel slope [%]", self.main_channel_slope_pct),
            ("Main channel length [km]", self.main_channel_length_km),
            ("Basin slope [%]", self.basin_slope_pct),
            ("Basin length [km]", self.basin_length_km),
            ("Hmax [m]", self.h_max),
            ("Hmin [m]", self.h_min),
            ("Hmean [m]", self.h_mean),
            ("Channel Hmax [m]", self.h_channel_max),
        ]
    }
}

/// Concentration time in hours for each empirical formula.
pub fn concentration_times(g: &GeoParameters) -> BTreeMap<String, f64> {
    let area = g.area_km2;
    let lcau = g.main_channel_length_km;
    let scau = g.main_channel_slope_pct;
    let scue = g.basin_slope_pct;
    let lpma = g.basin_length_km;

    let values = [
        0.3 * (lcau / scue.powf(0.25)).powf(0.75),
        0.3 * (lcau / ((g.h_max - g.h_min) / lcau).powf(0.25)).powf(0.75),
        (0.02 * (lpma * 1000.0).powf(0.77)) / (scau / 100.0).powf(0.385) / 60.0,
        8.157 * (area.powf(0.316) / ((scau * 100.0).powf(0.17) * scue.powf(0.565))),
        (4.0 * area.sqrt() + 1.5 * lcau) / (0.8 * g.h_mean.sqrt()),
        0.4623 * lcau.sqrt() * (scue / 100.0).powf(-0.25),
        (lcau / area) * (area.sqrt() / scau),
        0.3 * (lcau / (((g.h_channel_max - g.h_min) / lcau) * 100.0).powf(0.25)).powf(0.75),
    ];
    TC_METHODS
        .iter()
        .zip(values)
        .map(|(name, tc)| (name.to_string(), tc))
        .collect()
}

/// Terrain position class from height above drainage and local slope:
/// 1 valley floor, 2 low terrace, 3 steep upland, 4 flat upland.
pub fn hand_class(hand: f64, slope: f64) -> u8 {
    if hand < 5.3 {
        1
    } else if hand <= 15.0 {
        2
    } else if slope < 0.076 {
        4
    } else {
        3
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HandResult {
    /// Height above the nearest drainage [m].
    pub hand: Vec<f64>,
    /// Horizontal distance to the nearest drainage along the flow path [m].
    pub hdnd: Vec<f64>,
    pub class: Vec<u8>,
    /// Index of the channel cell each cell drains into.
    pub drain_cell: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TravelTime {
    /// Coefficient k in v = k * sqrt(slope).
    pub speed_coef: f64,
    /// Travel time from each cell to the outlet [h].
    pub hours: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Hypsometry {
    /// (elevation, % of basin area above it)
    pub basin: Vec<(f64, f64)>,
    /// (distance from the head, elevation) along the principal stream
    pub main_stream: Vec<(f64, f64)>,
}

#[derive(Debug, Clone)]
pub struct Basin {
    pub name: String,
    pub outlet: (f64, f64),
    pub dem: Arc<Raster<f64>>,
    pub dir: Arc<DirRaster>,
    pub threshold: f64,
    structure: CellStructure,
    pub geo: Option<GeoParameters>,
    pub tc: Option<BTreeMap<String, f64>>,
    pub main_stream: Option<PrincipalStream>,
}

impl Basin {
    /// Traces the basin draining to (x, y). With a stream, the pour point is
    /// first moved to the nearest stream vertex.
    pub fn delineate(
        name: &str,
        x: f64,
        y: f64,
        dem: Arc<Raster<f64>>,
        dir: Arc<DirRaster>,
        threshold: f64,
        stream: Option<&Stream>,
    ) -> Result<Self> {
        dem.grid.ensure_same(dir.grid(), "basin DEM vs DIR")?;
        let (x, y) = match stream {
            Some(s) => {
                s.dem.grid.ensure_same(&dem.grid, "stream vs basin")?;
                let snapped = s.snap(x, y);
                debug!("pour point ({}, {}) snapped to ({}, {})", x, y, snapped.0, snapped.1);
                snapped
            }
            None => (x, y),
        };
        let structure = trace_basin(&dir, x, y)?;
        info!("basin '{}' traced with {} cells", name, structure.len());
        Ok(Basin {
            name: name.to_string(),
            outlet: (x, y),
            dem,
            dir,
            threshold,
            structure,
            geo: None,
            tc: None,
            main_stream: None,
        })
    }

    pub fn from_structure(
        name: &str,
        outlet: (f64, f64),
        dem: Arc<Raster<f64>>,
        dir: Arc<DirRaster>,
        threshold: f64,
        structure: CellStructure,
    ) -> Result<Self> {
        dem.grid.ensure_same(dir.grid(), "basin DEM vs DIR")?;
        let grid = dem.grid;
        if let Some(c) = structure
            .cells()
            .iter()
            .find(|c| c.col >= grid.ncols || c.row >= grid.nrows)
        {
            return Err(BasinError::ConfigurationMismatch(format!(
                "cell ({}, {}) lies outside the {}x{} raster",
                c.col, c.row, grid.ncols, grid.nrows
            )));
        }
        Ok(Basin {
            name: name.to_string(),
            outlet,
            dem,
            dir,
            threshold,
            structure,
            geo: None,
            tc: None,
            main_stream: None,
        })
    }

    pub fn ncells(&self) -> usize {
        self.structure.len()
    }

    pub fn structure(&self) -> &CellStructure {
        &self.structure
    }

    pub fn grid(&self) -> &GridConfig {
        &self.dem.grid
    }

    pub fn area_km2(&self) -> f64 {
        self.ncells() as f64 * self.grid().dxp().powi(2) / 1e6
    }

    pub fn cell_basics(&self) -> Result<CellBasics> {
        engine::cell_basics(&self.structure, &self.dem, &self.dir)
    }

    pub fn channel(&self) -> Vec<bool> {
        channel_mask(&engine::accumulation(&self.structure), self.threshold)
    }

    pub fn partition(&self, threshold: f64) -> Result<HillslopePartition> {
        HillslopePartition::build(&self.structure, &engine::accumulation(&self.structure), threshold)
    }

    pub fn compute_geomorphology(&mut self) -> Result<&GeoParameters> {
        let basics = self.cell_basics()?;
        let n = self.ncells();
        let dxp = self.grid().dxp();
        let channel = channel_mask(&basics.acum, self.threshold);
        let fl = flow_length(&self.structure, &basics.long);
        let farthest = (0..n)
            .max_by(|&a, &b| fl[a].total_cmp(&fl[b]))
            .unwrap_or(self.structure.outlet());
        let ppal = principal_stream(&self.structure, &channel, &basics, &fl);

        let total = ppal.length();
        let to_outlet: Vec<f64> = ppal.distance.iter().map(|d| total - d).collect();
        let (fit_slope, _) = linear_fit(&to_outlet, &ppal.elevation);

        let geo = GeoParameters {
            area_km2: n as f64 * dxp * dxp / 1e6,
            perimeter_km: perimeter_edges(&self.structure, self.grid()) as f64 * dxp / 1000.0,
            main_channel_slope_pct: fit_slope * 100.0,
            main_channel_length_km: total / 1000.0,
            basin_slope_pct: basics.slope.iter().sum::<f64>() / n as f64 * 100.0,
            basin_length_km: fl[farthest] / 1000.0,
            h_max: basics.elev[farthest],
            h_min: basics.elev[self.structure.outlet()],
            h_mean: basics.elev.iter().sum::<f64>() / n as f64,
            h_channel_max: basics.elev[ppal.head()],
        };
        self.tc = Some(concentration_times(&geo));
        self.main_stream = Some(ppal);
        debug!("geomorphology of '{}': {:?}", self.name, geo);
        Ok(self.geo.insert(geo))
    }

    /// Values of an external raster at each basin cell (nearest cell, gaps
    /// filled with neighbour means).
    pub fn transform_map_to_basin(&self, raster: &Raster<f64>) -> Result<Vec<f64>> {
        engine::map_to_basin(&self.structure, self.grid(), raster)
    }

    pub fn hand(&self) -> Result<HandResult> {
        self.hand_with_threshold(self.threshold)
    }

    /// HAND/HDND against the channel network defined by `threshold`.
    pub fn hand_with_threshold(&self, threshold: f64) -> Result<HandResult> {
        let basics = self.cell_basics()?;
        let channel = channel_mask(&basics.acum, threshold);
        let (hdnd, drain_cell) = distance_to_channel(&self.structure, &channel, &basics.long);
        let hand: Vec<f64> = (0..self.ncells())
            .map(|i| (basics.elev[i] - basics.elev[drain_cell[i]]).max(0.0))
            .collect();
        let class = hand
            .iter()
            .zip(&basics.slope)
            .map(|(&h, &s)| hand_class(h, s))
            .collect();
        Ok(HandResult {
            hand,
            hdnd,
            class,
            drain_cell,
        })
    }

    /// Per-cell travel time to the outlet, with the speed coefficient narrowed
    /// so the mean travel time approaches `tc_hours`.
    pub fn travel_time(&self, tc_hours: f64) -> Result<TravelTime> {
        let basics = self.cell_basics()?;
        let hours_for = |k: f64| -> Vec<f64> {
            let speed: Vec<f64> = basics.slope.iter().map(|s| k * s.sqrt()).collect();
            time_to_outlet(&self.structure, &basics.long, &speed)
                .into_iter()
                .map(|t| t / 3600.0)
                .collect()
        };
        let finite_mean = |v: &[f64]| -> f64 {
            let finite: Vec<f64> = v.iter().copied().filter(|t| t.is_finite()).collect();
            if finite.is_empty() { 0.0 } else { finite.iter().sum::<f64>() / finite.len() as f64 }
        };

        let mut ranges = [50.0, 25.0, 1.0];
        for _ in 0..8 {
            let means: Vec<f64> = ranges.iter().map(|&k| finite_mean(&hours_for(k))).collect();
            for j in 0..2 {
                if tc_hours > means[j] && tc_hours < means[j + 1] {
                    ranges = [ranges[j], (ranges[j] + ranges[j + 1]) / 2.0, ranges[j + 1]];
                    break;
                }
            }
        }
        let speed_coef = ranges[1];
        Ok(TravelTime {
            speed_coef,
            hours: hours_for(speed_coef),
        })
    }

    pub fn hypsometric_curve(&self, bins: usize) -> Result<Hypsometry> {
        let basics = self.cell_basics()?;
        let n = basics.elev.len() as f64;
        let min = basics.elev.iter().copied().fold(f64::INFINITY, f64::min);
        let max = basics.elev.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let bins = bins.max(1);
        let basin = (0..=bins)
            .map(|k| {
                let h = min + (max - min) * k as f64 / bins as f64;
                let above = basics.elev.iter().filter(|&&z| z >= h).count() as f64;
                (h, above / n * 100.0)
            })
            .collect();

        let channel = channel_mask(&basics.acum, self.threshold);
        let fl = flow_length(&self.structure, &basics.long);
        let ppal = principal_stream(&self.structure, &channel, &basics, &fl);
        let main_stream = ppal
            .distance
            .iter()
            .copied()
            .zip(ppal.elevation.iter().copied())
            .collect();
        Ok(Hypsometry { basin, main_stream })
    }

    /// Puts a per-cell field back on a raster cropped to the basin bounds.
    pub fn to_raster(&self, field: &[f64]) -> Result<Raster<f64>> {
        if field.len() != self.ncells() {
            return Err(BasinError::shape("per-cell field", self.ncells(), field.len()));
        }
        let cells = self.structure.cells();
        let min_c = cells.iter().map(|c| c.col).min().unwrap_or(0);
        let max_c = cells.iter().map(|c| c.col).max().unwrap_or(0);
        let min_r = cells.iter().map(|c| c.row).min().unwrap_or(0);
        let max_r = cells.iter().map(|c| c.row).max().unwrap_or(0);
        let g = self.grid();
        let crop = GridConfig {
            ncols: max_c - min_c + 1,
            nrows: max_r - min_r + 1,
            xll: g.xll + min_c as f64 * g.cell_size,
            yll: g.y_top() - (max_r + 1) as f64 * g.cell_size,
            ..*g
        };
        let mut raster = Raster::filled(crop, g.nodata);
        for (c, &v) in cells.iter().zip(field) {
            raster.data[(c.col - min_c, c.row - min_r)] = v;
        }
        Ok(raster)
    }
}

/// Flow-path distance from every cell to the first channel cell downstream,
/// and that channel cell. Cells that never meet a channel resolve to the outlet.
pub fn distance_to_channel(structure: &CellStructure, channel: &[bool], long: &[f64]) -> (Vec<f64>, Vec<usize>) {
    let n = structure.len();
    let mut dist = vec![0.0; n];
    let mut drain = vec![structure.outlet(); n];
    for i in (0..n).rev() {
        if channel[i] {
            drain[i] = i;
            continue;
        }
        if let Some(d) = structure.dest(i) {
            dist[i] = long[i] + dist[d];
            drain[i] = drain[d];
        }
    }
    (dist, drain)
}

//! Rainfall fields: interpolation of station records onto simulation units
//! and the sparse binary file the process engine reads them from.

pub mod file;
pub mod idw;
pub mod tin;

use chrono::NaiveDateTime;
use log::{debug, info};
use ndarray::Array2;
use serde::Deserialize;
use std::path::Path;

use crate::error::{BasinError, Result};
use crate::hillslope::{Aggregation, HillslopePartition};

pub use file::{RainHeader, RainReader, RainWriter};
pub use idw::Idw;
pub use tin::Tin;

/// Rain gauge location.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Station {
    pub id: String,
    pub x: f64,
    pub y: f64,
}

/// Rainfall depth per record and station [mm].
#[derive(Debug, Clone, PartialEq)]
pub struct RainRecords {
    pub timestamps: Vec<NaiveDateTime>,
    pub station_ids: Vec<String>,
    /// (records, stations)
    pub values: Array2<f64>,
}

impl RainRecords {
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    /// Reorders the station columns to match `stations`.
    pub fn aligned_to(&self, stations: &[Station]) -> Result<Array2<f64>> {
        let mut out = Array2::zeros((self.len(), stations.len()));
        for (j, st) in stations.iter().enumerate() {
            let col = self
                .station_ids
                .iter()
                .position(|id| id == &st.id)
                .ok_or_else(|| BasinError::InvalidParameter {
                    name: "records",
                    reason: format!("no rainfall column for station '{}'", st.id),
                })?;
            out.column_mut(j).assign(&self.values.column(col));
        }
        Ok(out)
    }
}

/// Spatial interpolation of station values onto basin cells.
pub trait Interpolator {
    fn method(&self) -> String;
    fn cells(&self) -> usize;
    /// Per-cell field for one set of station values.
    fn interpolate(&self, station_values: &[f64]) -> Vec<f64>;
}

/// Source of per-step rainfall fields for a simulation.
pub trait RainfallSource {
    fn units(&self) -> usize;
    fn records(&self) -> usize;
    /// Time of a record, when the source carries one.
    fn timestamp(&self, _record: usize) -> Option<NaiveDateTime> {
        None
    }
    /// Rainfall depth of each unit at `step` [mm]; steps past the end are dry.
    fn field(&mut self, step: usize) -> Result<Vec<f64>>;
}

/// Rainfall fields held in memory.
#[derive(Debug, Clone, PartialEq)]
pub struct RainSeries {
    pub fields: Vec<Vec<f64>>,
    units: usize,
}

impl RainSeries {
    pub fn new(units: usize, fields: Vec<Vec<f64>>) -> Result<Self> {
        if let Some(bad) = fields.iter().find(|f| f.len() != units) {
            return Err(BasinError::shape("rainfall field", units, bad.len()));
        }
        Ok(RainSeries { fields, units })
    }

    /// The same depth on every unit for every step.
    pub fn uniform(units: usize, depths: &[f64]) -> Self {
        RainSeries {
            fields: depths.iter().map(|&d| vec![d; units]).collect(),
            units,
        }
    }
}

impl RainfallSource for RainSeries {
    fn units(&self) -> usize {
        self.units
    }

    fn records(&self) -> usize {
        self.fields.len()
    }

    fn field(&mut self, step: usize) -> Result<Vec<f64>> {
        Ok(self
            .fields
            .get(step)
            .cloned()
            .unwrap_or_else(|| vec![0.0; self.units]))
    }
}

/// Options for turning station records into a rainfall file.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RainOptions {
    /// Intervals whose field sums to less than this [mm] are stored as dry.
    pub skip_below: Option<f64>,
}

/// Interpolates every record and writes the `.bin`/`.hdr` pair at `path`.
/// With a partition, fields are aggregated onto hillslopes with a mean.
pub fn write_rain_file<I: Interpolator>(
    interpolator: &I,
    stations: &[Station],
    records: &RainRecords,
    partition: Option<&HillslopePartition>,
    options: RainOptions,
    path: &Path,
) -> Result<RainHeader> {
    let values = records.aligned_to(stations)?;
    let ncells = interpolator.cells();
    let nhills = partition.map(|p| p.count()).unwrap_or(0);
    let units = if partition.is_some() { nhills } else { ncells };

    let mut writer = RainWriter::create(path, units, ncells, nhills, &interpolator.method())?;
    for (k, ts) in records.timestamps.iter().enumerate() {
        let row = values.row(k).to_vec();
        let dry = row.iter().all(|&v| v <= 0.0);
        if dry {
            writer.push(*ts, None)?;
            continue;
        }
        let cells = interpolator.interpolate(&row);
        let field = match partition {
            Some(p) => p.cells_to_hillslopes(&cells, Aggregation::Mean, None)?,
            None => cells,
        };
        let total: f64 = field.iter().sum();
        let skip = total <= 0.0 || options.skip_below.is_some_and(|t| total < t);
        writer.push(*ts, if skip { None } else { Some(&field) })?;
    }
    let header = writer.finish()?;
    info!(
        "rainfall written to {}: {} records, {} non-zero ({})",
        path.display(),
        header.records.len(),
        header.nonzero,
        header.method
    );
    debug!("rainfall units: {} ({} cells, {} hillslopes)", units, ncells, nhills);
    Ok(header)
}

/// Index of the station nearest to (x, y).
pub(crate) fn nearest_station(stations: &[(f64, f64)], x: f64, y: f64) -> Option<usize> {
    crate::stream::nearest_point(stations, x, y)
}

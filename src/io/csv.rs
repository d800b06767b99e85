use chrono::NaiveDateTime;
use csv::{ReaderBuilder, StringRecord, Writer, WriterBuilder};
use log::{debug, info};
use ndarray::Array2;
use serde::Deserialize;
use std::fs::File;
use std::path::Path;

use crate::config::TableConfig;
use crate::error::{BasinError, Result};
use crate::io::results::RunOutput;
use crate::rainfall::{RainRecords, Station};
use crate::state::TANKS;

fn reader(path: &Path) -> Result<csv::Reader<File>> {
    Ok(ReaderBuilder::new()
        .has_headers(true)
        .delimiter(b',')
        .flexible(false)
        .trim(csv::Trim::All)
        .from_path(path)?)
}

fn column(headers: &StringRecord, name: &str, path: &Path) -> Result<usize> {
    headers.iter().position(|h| h == name).ok_or_else(|| {
        BasinError::Parse(format!("{}: missing column '{}'", path.display(), name))
    })
}

/// Station table with id, x and y columns.
pub fn read_stations(path: &Path, cfg: &TableConfig) -> Result<Vec<Station>> {
    let mut rdr = reader(path)?;
    let headers = rdr.headers()?.clone();
    let id = column(&headers, &cfg.station_id, path)?;
    let x = column(&headers, &cfg.station_x, path)?;
    let y = column(&headers, &cfg.station_y, path)?;

    let mut stations = Vec::new();
    for result in rdr.records() {
        let record = result?;
        let row = StringRecord::from(vec![&record[id], &record[x], &record[y]]);
        let station: Station = row.deserialize(Some(&StringRecord::from(vec!["id", "x", "y"])))?;
        stations.push(station);
    }
    debug!("loaded {} stations from {}", stations.len(), path.display());
    Ok(stations)
}

/// Rainfall table: a timestamp column followed by one column per station id.
pub fn read_rain_records(path: &Path, cfg: &TableConfig) -> Result<RainRecords> {
    let mut rdr = reader(path)?;
    let headers = rdr.headers()?.clone();
    let ts_col = column(&headers, &cfg.timestamp, path)?;
    let station_cols: Vec<usize> = (0..headers.len()).filter(|&c| c != ts_col).collect();
    let station_ids: Vec<String> = station_cols.iter().map(|&c| headers[c].to_string()).collect();

    let mut timestamps = Vec::new();
    let mut values = Vec::new();
    for (line, result) in rdr.records().enumerate() {
        let record = result?;
        let ts = NaiveDateTime::parse_from_str(&record[ts_col], &cfg.timestamp_format).map_err(|e| {
            BasinError::Parse(format!("{} row {}: timestamp '{}': {}", path.display(), line + 1, &record[ts_col], e))
        })?;
        timestamps.push(ts);
        for &c in &station_cols {
            // empty cells are missing readings, taken as dry
            let v = match &record[c] {
                "" => 0.0,
                s => s.parse::<f64>().map_err(|e| {
                    BasinError::Parse(format!("{} row {}: '{}': {}", path.display(), line + 1, s, e))
                })?,
            };
            values.push(v);
        }
    }
    let values = Array2::from_shape_vec((timestamps.len(), station_ids.len()), values)
        .map_err(|e| BasinError::Parse(e.to_string()))?;
    info!(
        "loaded {} rainfall records for {} stations",
        timestamps.len(),
        station_ids.len()
    );
    Ok(RainRecords {
        timestamps,
        station_ids,
        values,
    })
}

/// How a parameter-table value is given.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    Scalar,
    File,
}

/// One row of a parameter table: `variable,position,kind,value`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ParamRow {
    pub variable: String,
    pub position: usize,
    pub kind: ParamKind,
    pub value: String,
}

pub fn read_param_table(path: &Path) -> Result<Vec<ParamRow>> {
    let mut rdr = reader(path)?;
    let rows = rdr.deserialize().collect::<std::result::Result<Vec<ParamRow>, _>>()?;
    Ok(rows)
}

/// Storage table: one column per tank, one row per unit.
pub fn write_storage(path: &Path, storage: &Array2<f64>) -> Result<()> {
    let mut wtr = WriterBuilder::new().has_headers(true).from_path(path)?;
    let mut header = vec!["unit".to_string()];
    header.extend(TANKS.iter().map(|t| t.to_string()));
    wtr.write_record(&header)?;
    for unit in 0..storage.ncols() {
        let mut row = vec![unit.to_string()];
        row.extend(storage.column(unit).iter().map(|v| v.to_string()));
        wtr.write_record(&row)?;
    }
    wtr.flush()?;
    Ok(())
}

/// Reads a storage table back as a (tanks, units) array.
pub fn read_storage(path: &Path) -> Result<Array2<f64>> {
    let mut rdr = reader(path)?;
    let mut columns: Vec<Vec<f64>> = Vec::new();
    for result in rdr.records() {
        let record = result?;
        if record.len() != TANKS.len() + 1 {
            return Err(BasinError::shape("storage row", TANKS.len() + 1, record.len()));
        }
        let row = record
            .iter()
            .skip(1)
            .map(|s| s.parse::<f64>().map_err(|e| BasinError::Parse(format!("storage value '{}': {}", s, e))))
            .collect::<Result<Vec<f64>>>()?;
        columns.push(row);
    }
    let units = columns.len();
    Ok(Array2::from_shape_fn((TANKS.len(), units), |(k, u)| columns[u][k]))
}

// Create CSV writer with headers
pub fn create_csv_writer(path: &Path) -> Result<Writer<File>> {
    let mut wtr = WriterBuilder::new().has_headers(true).from_path(path)?;
    wtr.write_record(["step", "timestamp", "unit", "discharge", "moisture"])?;
    Ok(wtr)
}

/// Long-format time series of a run: one row per step and reporting unit.
pub fn write_run_output(path: &Path, output: &RunOutput) -> Result<()> {
    let mut wtr = create_csv_writer(path)?;
    let mut units: Vec<usize> = output
        .discharge_units
        .iter()
        .chain(&output.moisture_units)
        .copied()
        .collect();
    units.sort_unstable();
    units.dedup();

    for (step, ts) in output.timestamps.iter().enumerate() {
        for &unit in &units {
            let q = output
                .discharge_units
                .iter()
                .position(|&u| u == unit)
                .map(|j| output.discharge[(step, j)].to_string())
                .unwrap_or_default();
            let m = output
                .moisture_units
                .iter()
                .position(|&u| u == unit)
                .map(|j| output.moisture[(step, j)].to_string())
                .unwrap_or_default();
            wtr.write_record([
                step.to_string(),
                ts.format("%Y-%m-%d %H:%M:%S").to_string(),
                unit.to_string(),
                q,
                m,
            ])?;
        }
    }
    wtr.flush()?;
    info!("run results saved to {}", path.display());
    Ok(())
}

/// Channel inflow columns [m3/s] from the surface, subsurface and aquifer tanks.
pub const FLUX_COLUMNS: [&str; 3] = ["surface_flux", "subsurface_flux", "groundwater_flux"];

/// Basin-wide volumes per step, with the channel inflow of each hillslope
/// tank when the run separated fluxes.
pub fn write_basin_series(path: &Path, output: &RunOutput) -> Result<()> {
    let mut wtr = WriterBuilder::new().has_headers(true).from_path(path)?;
    let mut header = vec![
        "step",
        "timestamp",
        "rain_m3",
        "evaporation_m3",
        "losses_m3",
        "outflow_m3",
        "storage_m3",
        "balance_m3",
    ];
    if output.fluxes.is_some() {
        header.extend(FLUX_COLUMNS);
    }
    wtr.write_record(&header)?;

    let at = |series: &[f64], step: usize| series.get(step).map(|v| v.to_string()).unwrap_or_default();
    for (step, ts) in output.timestamps.iter().enumerate() {
        let mut record = vec![
            step.to_string(),
            ts.format("%Y-%m-%d %H:%M:%S").to_string(),
            at(&output.rain_volume, step),
            at(&output.evaporation_volume, step),
            at(&output.loss_volume, step),
            at(&output.outflow_volume, step),
            at(&output.storage, step),
            at(&output.balance, step),
        ];
        if let Some(fluxes) = &output.fluxes {
            record.extend(fluxes.row(step).iter().map(|q| q.to_string()));
        }
        wtr.write_record(&record)?;
    }
    wtr.flush()?;
    info!("basin series saved to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn stations_honour_column_names() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stations.csv");
        fs::write(&path, "name,east,north\ns1,10.5,20\ns2,30,40\n").unwrap();
        let cfg = TableConfig {
            station_id: "name".into(),
            station_x: "east".into(),
            station_y: "north".into(),
            ..TableConfig::default()
        };
        let st = read_stations(&path, &cfg).unwrap();
        assert_eq!(st.len(), 2);
        assert_eq!(st[0], Station { id: "s1".into(), x: 10.5, y: 20.0 });
    }

    #[test]
    fn rain_records_keep_station_columns() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rain.csv");
        fs::write(&path, "timestamp,s1,s2\n2020-01-01 00:00,1.5,\n2020-01-01 00:05,0,2\n").unwrap();
        let rec = read_rain_records(&path, &TableConfig::default()).unwrap();
        assert_eq!(rec.station_ids, vec!["s1", "s2"]);
        assert_eq!(rec.values[(0, 0)], 1.5);
        assert_eq!(rec.values[(0, 1)], 0.0);
        assert_eq!(rec.values[(1, 1)], 2.0);
    }

    #[test]
    fn bad_timestamp_is_a_parse_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rain.csv");
        fs::write(&path, "timestamp,s1\nyesterday,1\n").unwrap();
        assert!(matches!(
            read_rain_records(&path, &TableConfig::default()),
            Err(BasinError::Parse(_))
        ));
    }

    #[test]
    fn storage_table_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("storage.csv");
        let storage = Array2::from_shape_fn((5, 3), |(k, u)| (k * 10 + u) as f64);
        write_storage(&path, &storage).unwrap();
        assert_eq!(read_storage(&path).unwrap(), storage);
    }

    #[test]
    fn param_table_parses_kinds() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("params.csv");
        fs::write(&path, "variable,position,kind,value\nh_coef,0,scalar,0.5\ncapilar,0,file,hu.asc\n").unwrap();
        let rows = read_param_table(&path).unwrap();
        assert_eq!(rows[0].kind, ParamKind::Scalar);
        assert_eq!(rows[1].value, "hu.asc");
    }
}

mod common;

use approx::{assert_abs_diff_eq, assert_relative_eq};
use basin_rs::config::Resolution;
use basin_rs::io::csv::{FLUX_COLUMNS, write_basin_series, write_run_output};
use basin_rs::io::netcdf::{load_basin, load_simubasin, save_basin, save_simubasin, write_run_netcdf};
use basin_rs::rainfall::{
    Idw, RainOptions, RainReader, RainRecords, RainSeries, RainWriter, RainfallSource, Station, Tin,
    write_rain_file,
};
use basin_rs::shia::ShiaEngine;
use basin_rs::simulation::{PhysicalValue, SimuStage};
use basin_rs::state::Slot;
use basin_rs::BasinError;
use chrono::{Duration, NaiveDate};
use common::{parameterised, setup, valley, valley_basin};
use ndarray::array;
use tempfile::tempdir;

#[test]
fn storm_on_the_valley_reaches_the_outlet() {
    let mut sb = parameterised(valley_basin(5.0), Resolution::ByHillslope);
    assert_eq!(sb.stage(), SimuStage::Runnable);
    assert!(sb.unset_parameters().is_empty());

    let mut rain = RainSeries::uniform(sb.units(), &[10.0, 20.0, 5.0]);
    let out = sb.run(&mut ShiaEngine::new(), &mut rain, &setup(48)).unwrap();
    assert_eq!(out.steps(), 48);

    let outlet = sb.units() - 1;
    let (_, peak) = out.peak(outlet).unwrap();
    assert!(peak > 0.0);
    for r in &out.balance {
        assert_abs_diff_eq!(*r, 0.0, epsilon = 1e-6);
    }
    assert!(out.total_outflow() <= out.total_rain());
    assert_relative_eq!(out.total_rain(), 35.0 / 1000.0 * 90_000.0, max_relative = 1e-9);
}

#[test]
fn cell_and_hillslope_runs_see_the_same_rain() {
    let mut by_cell = parameterised(valley_basin(5.0), Resolution::ByCell);
    let mut by_hill = parameterised(valley_basin(5.0), Resolution::ByHillslope);
    assert_eq!(by_cell.units(), 100);
    assert_eq!(by_hill.units(), 1);

    let mut rain_c = RainSeries::uniform(by_cell.units(), &[8.0, 8.0]);
    let mut rain_h = RainSeries::uniform(by_hill.units(), &[8.0, 8.0]);
    let out_c = by_cell.run(&mut ShiaEngine::new(), &mut rain_c, &setup(12)).unwrap();
    let out_h = by_hill.run(&mut ShiaEngine::new(), &mut rain_h, &setup(12)).unwrap();
    assert_relative_eq!(out_c.total_rain(), out_h.total_rain(), max_relative = 1e-9);
}

#[test]
fn basin_round_trips_through_netcdf() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("valley.nc");
    let basin = valley_basin(5.0);
    save_basin(&path, &basin).unwrap();

    let (dem, dirs) = valley();
    let back = load_basin(&path, dem, dirs).unwrap();
    assert_eq!(back.ncells(), basin.ncells());
    assert_eq!(back.structure(), basin.structure());
    assert_eq!(back.name, "valley");
    assert_eq!(back.outlet, basin.outlet);
    assert_relative_eq!(back.area_km2(), basin.area_km2());
}

#[test]
fn loading_on_another_grid_is_a_mismatch() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("valley.nc");
    save_basin(&path, &valley_basin(5.0)).unwrap();

    let (dem, dirs) = common::edge_path();
    assert!(matches!(
        load_basin(&path, dem, dirs),
        Err(BasinError::ConfigurationMismatch(_))
    ));
}

#[test]
fn reloaded_simulation_runs_identically() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("simu.nc");
    let mut original = parameterised(valley_basin(3.0), Resolution::ByHillslope);
    save_simubasin(&path, &original).unwrap();

    let (dem, dirs) = valley();
    let mut loaded = load_simubasin(&path, dem, dirs).unwrap();
    assert_eq!(loaded.stage(), SimuStage::Runnable);
    assert_eq!(loaded.units(), original.units());
    assert_eq!(loaded.partition(), original.partition());
    assert!(loaded.bank.is_set(Slot::Geometry));
    assert!(loaded.unset_parameters().is_empty());
    assert_eq!(loaded.bank, original.bank);

    let depths = [12.0, 0.0, 6.0, 3.0];
    let mut rain_a = RainSeries::uniform(original.units(), &depths);
    let mut rain_b = RainSeries::uniform(loaded.units(), &depths);
    let a = original.run(&mut ShiaEngine::new(), &mut rain_a, &setup(24)).unwrap();
    let b = loaded.run(&mut ShiaEngine::new(), &mut rain_b, &setup(24)).unwrap();
    assert_eq!(a.discharge, b.discharge);
    assert_eq!(a.balance, b.balance);
}

#[test]
fn basin_file_is_not_a_simulation() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("valley.nc");
    save_basin(&path, &valley_basin(5.0)).unwrap();
    let (dem, dirs) = valley();
    assert!(matches!(
        load_simubasin(&path, dem, dirs),
        Err(BasinError::InvalidState { .. })
    ));
}

fn stations() -> Vec<Station> {
    vec![
        Station { id: "north".into(), x: 150.0, y: 280.0 },
        Station { id: "west".into(), x: 20.0, y: 100.0 },
        Station { id: "east".into(), x: 280.0, y: 120.0 },
    ]
}

fn records() -> RainRecords {
    let t0 = NaiveDate::from_ymd_opt(2022, 3, 1)
        .unwrap()
        .and_hms_opt(6, 0, 0)
        .unwrap();
    RainRecords {
        timestamps: (0..3).map(|k| t0 + Duration::minutes(5 * k)).collect(),
        station_ids: vec!["east".into(), "north".into(), "west".into()],
        values: array![[4.0, 4.0, 4.0], [0.0, 0.0, 0.0], [1.0, 2.0, 1.0]],
    }
}

#[test]
fn interpolated_rain_drives_a_run() {
    let dir = tempdir().unwrap();
    let rain_path = dir.path().join("storm");
    let mut sb = parameterised(valley_basin(3.0), Resolution::ByHillslope);
    let cell_xy = sb.basin.structure().coordinates(sb.basin.grid());
    let tin = Tin::new(&stations(), &cell_xy, sb.basin.grid()).unwrap();

    let header = write_rain_file(
        &tin,
        &stations(),
        &records(),
        Some(sb.partition()),
        RainOptions::default(),
        &rain_path,
    )
    .unwrap();
    assert_eq!(header.units, sb.units());
    assert_eq!(header.records.len(), 3);
    assert_eq!(header.nonzero, 2);

    let mut reader = RainReader::open(&rain_path).unwrap();
    for v in reader.field(0).unwrap() {
        assert_relative_eq!(v, 4.0, max_relative = 1e-6);
    }
    assert!(reader.field(1).unwrap().iter().all(|&v| v == 0.0));
    let wet = reader.field(2).unwrap();
    assert!(wet.iter().all(|&v| (1.0..=2.0).contains(&v)));

    let out = sb.run(&mut ShiaEngine::new(), &mut reader, &setup(12)).unwrap();
    assert!(out.total_rain() > 0.0);
    for r in &out.balance {
        assert_abs_diff_eq!(*r, 0.0, epsilon = 1e-6);
    }
}

#[test]
fn idw_rain_skips_light_intervals() {
    let dir = tempdir().unwrap();
    let rain_path = dir.path().join("drizzle");
    let basin = valley_basin(5.0);
    let cell_xy = basin.structure().coordinates(basin.grid());
    let idw = Idw::new(&stations(), &cell_xy, 2.0).unwrap();
    // 100 cells: record 0 sums to 400 mm, record 2 to between 100 and 200 mm
    let options = RainOptions { skip_below: Some(250.0) };
    let header = write_rain_file(&idw, &stations(), &records(), None, options, &rain_path).unwrap();
    assert_eq!(header.units, basin.ncells());
    assert_eq!(header.nonzero, 1);
    assert_eq!(header.records[0].position, 1);
    assert_eq!(header.records[2].position, 0);

    // a light field over many cells still adds up past a small threshold
    let options = RainOptions { skip_below: Some(10.0) };
    let header = write_rain_file(&idw, &stations(), &records(), None, options, &rain_path).unwrap();
    assert_eq!(header.nonzero, 2);
    assert_eq!(header.records[2].position, 2);
}

#[test]
fn run_results_are_written() {
    let dir = tempdir().unwrap();
    let mut sb = parameterised(valley_basin(5.0), Resolution::ByCell);
    let mut rain = RainSeries::uniform(sb.units(), &[10.0]);
    let out = sb.run(&mut ShiaEngine::new(), &mut rain, &setup(6)).unwrap();

    let csv_path = dir.path().join("run.csv");
    write_run_output(&csv_path, &out).unwrap();
    let text = std::fs::read_to_string(&csv_path).unwrap();
    let mut lines = text.lines();
    assert_eq!(lines.next(), Some("step,timestamp,unit,discharge,moisture"));
    assert_eq!(lines.count(), 6);

    let nc_path = dir.path().join("run.nc");
    write_run_netcdf(&nc_path, &out).unwrap();
    let file = netcdf::open(&nc_path).unwrap();
    let q = file.variable("discharge").unwrap();
    assert_eq!(q.len(), 6);
}

#[test]
fn second_run_needs_new_storage() {
    let mut sb = parameterised(valley_basin(5.0), Resolution::ByHillslope);
    let mut rain = RainSeries::uniform(sb.units(), &[10.0]);
    sb.run(&mut ShiaEngine::new(), &mut rain, &setup(4)).unwrap();
    assert_eq!(sb.stage(), SimuStage::Ran);
    assert!(sb.run(&mut ShiaEngine::new(), &mut rain, &setup(4)).is_err());

    let dir = tempdir().unwrap();
    let storage = dir.path().join("storage.csv");
    sb.save_storage(&storage).unwrap();
    sb.load_storage(&storage).unwrap();
    assert_eq!(sb.stage(), SimuStage::Runnable);
    sb.set_storage(&PhysicalValue::Scalar(0.0), 4).unwrap();
    assert!(sb.run(&mut ShiaEngine::new(), &mut rain, &setup(4)).is_ok());
}

#[test]
fn run_starts_at_the_requested_rain_record() {
    let dir = tempdir().unwrap();
    let rain_path = dir.path().join("early_storm");
    let t0 = NaiveDate::from_ymd_opt(2022, 3, 1)
        .unwrap()
        .and_hms_opt(6, 0, 0)
        .unwrap();
    let mut writer = RainWriter::create(&rain_path, 1, 100, 1, "uniform").unwrap();
    for k in 0..6 {
        let field = [50.0];
        writer
            .push(t0 + Duration::minutes(5 * k), (k < 3).then_some(&field[..]))
            .unwrap();
    }
    writer.finish().unwrap();

    let mut sb = parameterised(valley_basin(5.0), Resolution::ByHillslope);
    let mut reader = RainReader::open(&rain_path).unwrap();
    let out = sb
        .run(&mut ShiaEngine::new(), &mut reader, &setup(3).with_start_offset(3))
        .unwrap();
    assert_eq!(out.total_rain(), 0.0);
    assert_eq!(out.timestamps[0], t0 + Duration::minutes(15));

    let mut sb = parameterised(valley_basin(5.0), Resolution::ByHillslope);
    let out = sb
        .run(&mut ShiaEngine::new(), &mut reader, &setup(3).with_start_offset(1))
        .unwrap();
    assert_relative_eq!(out.total_rain(), 0.1 * 90_000.0, max_relative = 1e-9);
    assert_eq!(out.timestamps[0], t0 + Duration::minutes(5));
}

#[test]
fn start_past_the_rain_records_is_rejected() {
    let mut sb = parameterised(valley_basin(5.0), Resolution::ByHillslope);
    let mut rain = RainSeries::uniform(sb.units(), &[10.0, 10.0]);
    assert!(matches!(
        sb.run(&mut ShiaEngine::new(), &mut rain, &setup(2).with_start_offset(2)),
        Err(BasinError::InvalidParameter { name: "start_offset", .. })
    ));
}

#[test]
fn storage_series_follows_the_step_volumes() {
    let mut sb = parameterised(valley_basin(3.0), Resolution::ByHillslope);
    let mut rain = RainSeries::uniform(sb.units(), &[15.0, 5.0, 0.0, 10.0]);
    let out = sb.run(&mut ShiaEngine::new(), &mut rain, &setup(24)).unwrap();
    assert_eq!(out.storage.len(), 24);
    assert_eq!(out.initial_storage, 0.0);

    for step in 0..out.steps() {
        let change = out.storage_change(step).unwrap();
        let net = out.rain_volume[step] - out.evaporation_volume[step] - out.loss_volume[step]
            - out.outflow_volume[step];
        assert_abs_diff_eq!(change, net - out.balance[step], epsilon = 1e-6);
        assert_abs_diff_eq!(change, net, epsilon = 1e-6);
    }
    assert!(out.storage[0] > 0.0);
    assert_eq!(out.storage_change(24), None);
}

#[test]
fn separated_fluxes_are_persisted() {
    let dir = tempdir().unwrap();
    let mut sb = parameterised(valley_basin(5.0), Resolution::ByHillslope);
    let mut rain = RainSeries::uniform(sb.units(), &[30.0, 10.0]);
    let mut s = setup(8);
    s.separate_fluxes = true;
    let out = sb.run(&mut ShiaEngine::new(), &mut rain, &s).unwrap();
    let fluxes = out.fluxes.clone().unwrap();

    let csv_path = dir.path().join("run_basin.csv");
    write_basin_series(&csv_path, &out).unwrap();
    let mut rdr = csv::Reader::from_path(&csv_path).unwrap();
    let headers = rdr.headers().unwrap().clone();
    assert_eq!(&headers[6], "storage_m3");
    assert_eq!(headers.iter().skip(8).collect::<Vec<_>>(), FLUX_COLUMNS.to_vec());
    let rows: Vec<csv::StringRecord> = rdr.records().map(|r| r.unwrap()).collect();
    assert_eq!(rows.len(), 8);
    for (step, row) in rows.iter().enumerate() {
        let storage: f64 = row[6].parse().unwrap();
        assert_relative_eq!(storage, out.storage[step], max_relative = 1e-12);
        for k in 0..3 {
            let q: f64 = row[8 + k].parse().unwrap();
            assert_relative_eq!(q, fluxes[(step, k)], max_relative = 1e-12);
        }
    }

    let nc_path = dir.path().join("run.nc");
    write_run_netcdf(&nc_path, &out).unwrap();
    let file = netcdf::open(&nc_path).unwrap();
    let surface: Vec<f64> = file
        .variable("surface_flux")
        .unwrap()
        .get_values::<f64, _>(..)
        .unwrap();
    assert_eq!(surface, fluxes.column(0).to_vec());
    let storage: Vec<f64> = file.variable("storage").unwrap().get_values::<f64, _>(..).unwrap();
    assert_eq!(storage, out.storage);
}

#[test]
fn basin_series_without_fluxes_has_no_flux_columns() {
    let dir = tempdir().unwrap();
    let mut sb = parameterised(valley_basin(5.0), Resolution::ByCell);
    let mut rain = RainSeries::uniform(sb.units(), &[5.0]);
    let out = sb.run(&mut ShiaEngine::new(), &mut rain, &setup(3)).unwrap();
    let path = dir.path().join("series.csv");
    write_basin_series(&path, &out).unwrap();
    let mut rdr = csv::Reader::from_path(&path).unwrap();
    assert_eq!(rdr.headers().unwrap().len(), 8);
    assert_eq!(rdr.records().count(), 3);
}

#[test]
fn unknown_speed_type_is_refused_on_load() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("simu.nc");
    let mut sb = parameterised(valley_basin(5.0), Resolution::ByHillslope);
    sb.bank.speed_type = [2, 9, 1];
    save_simubasin(&path, &sb).unwrap();

    let (dem, dirs) = valley();
    assert!(matches!(
        load_simubasin(&path, dem, dirs),
        Err(BasinError::InvalidParameter { name: "speed_type", .. })
    ));
}

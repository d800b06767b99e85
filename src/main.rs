use anyhow::{Context, Result, bail};
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use std::path::Path;
use std::sync::Arc;

mod cli;

use basin_rs::basin::{Basin, concentration_times};
use basin_rs::config::{CalibrationFactors, OutputFormat, Resolution, TableConfig, UnitThresholds};
use basin_rs::grid::{DirRaster, Raster};
use basin_rs::hillslope::Aggregation;
use basin_rs::io::ascii_grid::{read_ascii_grid, read_dir_grid, write_ascii_grid};
use basin_rs::io::csv::{ParamKind, read_param_table, read_rain_records, read_stations, write_basin_series, write_run_output};
use basin_rs::io::netcdf::{load_basin, load_simubasin, save_basin, save_simubasin, write_run_netcdf};
use basin_rs::rainfall::{Idw, RainOptions, RainReader, RainfallSource, Tin, write_rain_file};
use basin_rs::shia::{RunSetup, ShiaEngine};
use basin_rs::simulation::{ControlPolicy, OcgInputs, PhysicalValue, SimuBasin};
use basin_rs::state::{ModelVariable, TANKS};
use basin_rs::stream::Stream;
use cli::{Command, DelineateArgs, HandArgs, InterpolationMethod, PrepareArgs, RainArgs, RasterArgs, RunArgs, get_args};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = get_args();
    match cli.command {
        Command::Delineate(args) => delineate(args),
        Command::Prepare(args) => prepare(args),
        Command::Rain(args) => rain(args),
        Command::Run(args) => run(args),
        Command::Hand(args) => hand(args),
    }
}

fn load_rasters(args: &RasterArgs) -> Result<(Arc<Raster<f64>>, Arc<DirRaster>)> {
    let mut dem = read_ascii_grid(&args.dem).with_context(|| format!("Failed to read DEM: {:?}", args.dem))?;
    if let Some(dxp) = args.dxp {
        dem.grid = dem.grid.with_projected_cell_size(dxp);
    }
    let dir = read_dir_grid(&args.dir, args.encoding)
        .with_context(|| format!("Failed to read flow directions: {:?}", args.dir))?;
    dem.grid
        .ensure_same(dir.grid(), "DEM vs DIR")
        .context("DEM and DIR grids differ")?;
    Ok((Arc::new(dem), Arc::new(dir)))
}

fn delineate(args: DelineateArgs) -> Result<()> {
    let (dem, dir) = load_rasters(&args.rasters)?;
    let stream = match args.stream_from {
        Some((x, y)) => Some(
            Stream::trace("main", x, y, dem.clone(), dir.clone()).context("Failed to trace the stream")?,
        ),
        None => None,
    };
    let (x, y) = args.outlet;
    let mut basin = Basin::delineate(&args.name, x, y, dem, dir, args.threshold, stream.as_ref())
        .context("Failed to delineate the basin")?;

    let geo = basin.compute_geomorphology().context("Failed to compute geomorphology")?.clone();
    println!("\nBasin '{}': {} cells", basin.name, basin.ncells());
    for (name, value) in geo.as_pairs() {
        println!("  {:<24} {:>12.3}", name, value);
    }
    println!("Concentration times [h]:");
    for (method, hours) in concentration_times(&geo) {
        println!("  {:<24} {:>12.3}", method, hours);
    }

    save_basin(&args.output, &basin).with_context(|| format!("Failed to save basin: {:?}", args.output))?;
    println!("\nBasin saved to {}", args.output.display());
    Ok(())
}

fn prepare(args: PrepareArgs) -> Result<()> {
    let (dem, dir) = load_rasters(&args.rasters)?;
    let basin = load_basin(&args.basin, dem, dir).with_context(|| format!("Failed to load basin: {:?}", args.basin))?;
    let mut simu = SimuBasin::new(basin, args.resolution)?;
    let thresholds = UnitThresholds::new(args.lower, args.upper)?;
    simu.set_geomorphology(thresholds, &PhysicalValue::Scalar(args.stream_width))
        .context("Failed to set geomorphology")?;

    let rows = read_param_table(&args.params).with_context(|| format!("Failed to read parameters: {:?}", args.params))?;
    let base = args.params.parent().unwrap_or(Path::new("."));
    for row in rows {
        let value = match row.kind {
            ParamKind::Scalar => PhysicalValue::Scalar(
                row.value
                    .parse()
                    .with_context(|| format!("{}[{}]: '{}' is not a number", row.variable, row.position, row.value))?,
            ),
            ParamKind::File => PhysicalValue::FromFile(base.join(&row.value)),
        };
        if row.variable == "storage" {
            if row.position >= TANKS.len() {
                bail!("storage position {} out of range", row.position);
            }
            simu.set_storage(&value, row.position)
                .with_context(|| format!("Failed to set storage[{}]", row.position))?;
        } else {
            let variable = ModelVariable::parse(&row.variable)?;
            simu.set_physical_variable(variable, &value, row.position, Aggregation::Mean, None)
                .with_context(|| format!("Failed to set {}[{}]", row.variable, row.position))?;
        }
    }
    if !simu.bank.has_storage() {
        info!("no storage in {:?}, tanks start empty", args.params);
        for k in 0..TANKS.len() {
            simu.set_storage(&PhysicalValue::Scalar(0.0), k)?;
        }
    }
    if args.ocg {
        let ocg = simu.set_channel_from_ocg(&OcgInputs::default(), Aggregation::Mean)?;
        info!("OCG channel coefficients: b={:.4} w1={:.4}", ocg.b, ocg.w1);
    }

    let policy = if args.channel_controls_only {
        ControlPolicy::ChannelOwningOnly
    } else {
        ControlPolicy::AllUnits
    };
    simu.set_control_points(&args.controls, &[], policy)?;

    let unset = simu.unset_parameters();
    if !unset.is_empty() {
        warn!("{} parameter slots were not in {:?}", unset.len(), args.params);
    }
    save_simubasin(&args.output, &simu).with_context(|| format!("Failed to save simulation: {:?}", args.output))?;
    println!(
        "Simulation '{}' ({} {}, stage {}) saved to {}",
        simu.basin.name,
        simu.units(),
        simu.resolution().as_str(),
        simu.stage().as_str(),
        args.output.display()
    );
    Ok(())
}

fn rain(args: RainArgs) -> Result<()> {
    let (dem, dir) = load_rasters(&args.rasters)?;
    let simu = load_simubasin(&args.simulation, dem, dir)
        .with_context(|| format!("Failed to load simulation: {:?}", args.simulation))?;
    let tables = TableConfig::default();
    let stations = read_stations(&args.stations, &tables)
        .with_context(|| format!("Failed to read stations: {:?}", args.stations))?;
    let records = read_rain_records(&args.records, &tables)
        .with_context(|| format!("Failed to read rainfall: {:?}", args.records))?;

    let cell_xy = simu.basin.structure().coordinates(simu.basin.grid());
    let partition = match simu.resolution() {
        Resolution::ByHillslope => Some(simu.partition()),
        Resolution::ByCell => None,
    };
    let options = RainOptions {
        skip_below: args.skip_below,
    };
    let header = match args.method {
        InterpolationMethod::Tin => {
            let tin = Tin::new(&stations, &cell_xy, simu.basin.grid())?;
            write_rain_file(&tin, &stations, &records, partition, options, &args.output)?
        }
        InterpolationMethod::Idw => {
            let idw = Idw::new(&stations, &cell_xy, args.power)?;
            write_rain_file(&idw, &stations, &records, partition, options, &args.output)?
        }
    };
    println!(
        "Rainfall saved to {}: {} records, {} with rain",
        args.output.display(),
        header.records.len(),
        header.nonzero
    );
    Ok(())
}

fn run(args: RunArgs) -> Result<()> {
    let (dem, dir) = load_rasters(&args.rasters)?;
    let mut simu = load_simubasin(&args.simulation, dem, dir)
        .with_context(|| format!("Failed to load simulation: {:?}", args.simulation))?;
    if let Some(path) = &args.storage {
        simu.load_storage(path).with_context(|| format!("Failed to read storage: {:?}", path))?;
    }
    let mut rain = RainReader::open(&args.rain).with_context(|| format!("Failed to open rainfall: {:?}", args.rain))?;
    let start = rain.timestamp(args.start_record).ok_or_else(|| {
        anyhow::anyhow!(
            "Rainfall file holds {} records, cannot start at record {}",
            rain.records(),
            args.start_record
        )
    })?;
    let steps = args.steps.unwrap_or(rain.records() - args.start_record);
    let calibration = match &args.calibration {
        Some(values) => CalibrationFactors::from_slice(values)?,
        None => CalibrationFactors::default(),
    };
    let mut setup = RunSetup::new(args.dt, start, steps, calibration).with_start_offset(args.start_record);
    setup.separate_fluxes = args.separate_fluxes;

    println!("\nSimulation Configuration:");
    println!("  Basin: {} ({} {})", simu.basin.name, simu.units(), simu.resolution().as_str());
    println!("  Start: {} (record {})", start, args.start_record);
    println!("  Timestep: {} seconds", args.dt);
    println!("  Total timesteps: {}", steps);

    let pb = ProgressBar::new(steps as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} steps ({eta})")?
            .progress_chars("#>-"),
    );
    let mut engine = ShiaEngine::with_progress(pb);
    let output = simu.run(&mut engine, &mut rain, &setup).context("Simulation failed")?;

    if matches!(args.format, OutputFormat::Csv | OutputFormat::Both) {
        let path = args.output.with_extension("csv");
        write_run_output(&path, &output).with_context(|| format!("Failed to write {:?}", path))?;
        let series = basin_series_path(&args.output);
        write_basin_series(&series, &output).with_context(|| format!("Failed to write {:?}", series))?;
        println!("CSV results saved to {} and {}", path.display(), series.display());
    }
    if matches!(args.format, OutputFormat::NetCdf | OutputFormat::Both) {
        let path = args.output.with_extension("nc");
        write_run_netcdf(&path, &output).with_context(|| format!("Failed to write {:?}", path))?;
        println!("NetCDF results saved to {}", path.display());
    }
    if let Some(path) = &args.save_storage {
        simu.save_storage(path).with_context(|| format!("Failed to write {:?}", path))?;
    }
    if let Some(path) = &args.save_state {
        save_simubasin(path, &simu).with_context(|| format!("Failed to save simulation: {:?}", path))?;
    }

    let outlet = simu.units() - 1;
    if let Some((step, q)) = output.peak(outlet) {
        println!("\nPeak outlet discharge {:.3} m3/s at {}", q, output.timestamps[step]);
    }
    Ok(())
}

fn basin_series_path(output: &Path) -> std::path::PathBuf {
    let stem = output.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
    output.with_file_name(format!("{}_basin.csv", stem))
}

fn hand(args: HandArgs) -> Result<()> {
    let (dem, dir) = load_rasters(&args.rasters)?;
    let basin = load_basin(&args.basin, dem, dir).with_context(|| format!("Failed to load basin: {:?}", args.basin))?;
    let threshold = args.threshold.unwrap_or(basin.threshold);
    let result = basin.hand_with_threshold(threshold).context("Failed to compute HAND")?;

    write_ascii_grid(&args.hand, &basin.to_raster(&result.hand)?)
        .with_context(|| format!("Failed to write {:?}", args.hand))?;
    if let Some(path) = &args.class {
        let class: Vec<f64> = result.class.iter().map(|&c| c as f64).collect();
        write_ascii_grid(path, &basin.to_raster(&class)?).with_context(|| format!("Failed to write {:?}", path))?;
    }
    println!("HAND saved to {}", args.hand.display());
    Ok(())
}

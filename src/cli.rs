use basin_rs::config::{OutputFormat, Resolution};
use basin_rs::grid::DirEncoding;
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Basin delineation, geomorphology and SHIA simulation
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Trace a basin from an outlet and save it with its geomorphology
    Delineate(DelineateArgs),
    /// Build a simulation from a saved basin and a parameter table
    Prepare(PrepareArgs),
    /// Interpolate station rainfall into a rainfall field file
    Rain(RainArgs),
    /// Run the SHIA model over a rainfall file
    Run(RunArgs),
    /// Height above the nearest drainage of a saved basin
    Hand(HandArgs),
}

/// DEM and flow directions every basin is traced on.
#[derive(Args, Debug)]
pub struct RasterArgs {
    /// DEM as an ESRI ASCII grid
    #[arg(long)]
    pub dem: PathBuf,

    /// D8 flow directions as an ESRI ASCII grid
    #[arg(long)]
    pub dir: PathBuf,

    /// Direction code convention of the DIR grid
    #[arg(long, default_value = "keypad", value_parser = parse_encoding)]
    pub encoding: DirEncoding,

    /// Planar cell size [m] when the grids are geographic
    #[arg(long)]
    pub dxp: Option<f64>,
}

#[derive(Args, Debug)]
pub struct DelineateArgs {
    #[command(flatten)]
    pub rasters: RasterArgs,

    /// Basin name
    #[arg(long, default_value = "basin")]
    pub name: String,

    /// Outlet as x,y
    #[arg(long, value_parser = parse_point)]
    pub outlet: (f64, f64),

    /// Channel threshold [cells]
    #[arg(short, long, default_value_t = 50.0)]
    pub threshold: f64,

    /// Trace a stream from this x,y and snap the outlet onto it
    #[arg(long, value_parser = parse_point)]
    pub stream_from: Option<(f64, f64)>,

    /// Output netCDF file
    #[arg(short, long)]
    pub output: PathBuf,
}

#[derive(Args, Debug)]
pub struct PrepareArgs {
    #[command(flatten)]
    pub rasters: RasterArgs,

    /// Basin netCDF written by `delineate`
    #[arg(long)]
    pub basin: PathBuf,

    /// Simulation units
    #[arg(long, default_value = "hills", value_parser = parse_resolution)]
    pub resolution: Resolution,

    /// Parameter table: variable,position,kind,value
    #[arg(long)]
    pub params: PathBuf,

    /// Accumulation [cells] below which a cell is a hillslope cell
    #[arg(long, default_value_t = 30.0)]
    pub lower: f64,

    /// Accumulation [cells] from which a cell is a channel cell
    #[arg(long, default_value_t = 500.0)]
    pub upper: f64,

    /// Channel width [m]
    #[arg(long, default_value_t = 1.0)]
    pub stream_width: f64,

    /// Set channel speed from the OCG relations
    #[arg(long)]
    pub ocg: bool,

    /// Discharge control point as x,y (repeatable); the outlet always reports
    #[arg(long = "control", value_parser = parse_point)]
    pub controls: Vec<(f64, f64)>,

    /// Count discharge points only on channel-owning hillslopes
    #[arg(long)]
    pub channel_controls_only: bool,

    /// Output netCDF file
    #[arg(short, long)]
    pub output: PathBuf,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpolationMethod {
    Tin,
    Idw,
}

#[derive(Args, Debug)]
pub struct RainArgs {
    #[command(flatten)]
    pub rasters: RasterArgs,

    /// Simulation netCDF written by `prepare`
    #[arg(long)]
    pub simulation: PathBuf,

    /// Station table: id,x,y
    #[arg(long)]
    pub stations: PathBuf,

    /// Rainfall table: timestamp plus one column per station
    #[arg(long)]
    pub records: PathBuf,

    #[arg(long, value_enum, default_value_t = InterpolationMethod::Tin)]
    pub method: InterpolationMethod,

    /// IDW power
    #[arg(long, default_value_t = 1.0)]
    pub power: f64,

    /// Store intervals with a mean depth below this [mm] as dry
    #[arg(long)]
    pub skip_below: Option<f64>,

    /// Output path; `.bin` and `.hdr` are written next to it
    #[arg(short, long)]
    pub output: PathBuf,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub rasters: RasterArgs,

    /// Simulation netCDF written by `prepare`
    #[arg(long)]
    pub simulation: PathBuf,

    /// Rainfall file written by `rain`
    #[arg(long)]
    pub rain: PathBuf,

    /// Initial storage table; required again after a previous run
    #[arg(long)]
    pub storage: Option<PathBuf>,

    /// Step length [s]
    #[arg(long, default_value_t = 300.0)]
    pub dt: f64,

    /// Rainfall record the first step reads
    #[arg(long, default_value_t = 0)]
    pub start_record: usize,

    /// Number of steps, the remaining rainfall records by default
    #[arg(long)]
    pub steps: Option<usize>,

    /// Ten calibration factors, comma separated
    #[arg(long, value_delimiter = ',')]
    pub calibration: Option<Vec<f64>>,

    /// Report the water reaching channels from each hillslope tank
    #[arg(long)]
    pub separate_fluxes: bool,

    /// Result file stem
    #[arg(short, long, default_value = "shia_results")]
    pub output: PathBuf,

    #[arg(long, value_enum, default_value_t = OutputFormat::Csv)]
    pub format: OutputFormat,

    /// Write the end storage table here
    #[arg(long)]
    pub save_storage: Option<PathBuf>,

    /// Save the simulation after the run here
    #[arg(long)]
    pub save_state: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct HandArgs {
    #[command(flatten)]
    pub rasters: RasterArgs,

    /// Basin netCDF written by `delineate`
    #[arg(long)]
    pub basin: PathBuf,

    /// Channel threshold [cells], the basin's own by default
    #[arg(short, long)]
    pub threshold: Option<f64>,

    /// HAND grid output
    #[arg(long)]
    pub hand: PathBuf,

    /// Landform class grid output
    #[arg(long)]
    pub class: Option<PathBuf>,
}

fn parse_encoding(s: &str) -> Result<DirEncoding, String> {
    DirEncoding::parse(s).map_err(|e| e.to_string())
}

fn parse_resolution(s: &str) -> Result<Resolution, String> {
    Resolution::parse(s).map_err(|e| e.to_string())
}

fn parse_point(s: &str) -> Result<(f64, f64), String> {
    let (x, y) = s
        .split_once(',')
        .ok_or_else(|| format!("'{}' is not x,y", s))?;
    let x = x.trim().parse::<f64>().map_err(|e| format!("x '{}': {}", x, e))?;
    let y = y.trim().parse::<f64>().map_err(|e| format!("y '{}': {}", y, e))?;
    Ok((x, y))
}

pub fn get_args() -> Cli {
    Cli::parse()
}

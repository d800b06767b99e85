//! Distributed hydrological modelling of a basin: watershed delineation and
//! geomorphology from a DEM and flow directions, hillslope aggregation, and a
//! tank-model simulation driven by interpolated rainfall.

pub mod basin;
pub mod config;
pub mod engine;
pub mod error;
pub mod grid;
pub mod hillslope;
pub mod io;
pub mod rainfall;
pub mod shia;
pub mod simulation;
pub mod state;
pub mod stream;

pub use basin::{Basin, GeoParameters, HandResult};
pub use config::{CalibrationFactors, GridConfig, Resolution, UnitThresholds};
pub use error::{BasinError, Result};
pub use grid::{DirEncoding, DirRaster, Raster};
pub use hillslope::{Aggregation, HillslopePartition};
pub use io::results::RunOutput;
pub use shia::{ProcessEngine, RunSetup, ShiaEngine};
pub use simulation::{ControlPolicy, PhysicalValue, SimuBasin, SimuStage};
pub use stream::Stream;

//! Error types for basin operations

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BasinError {
    /// Two rasters (or a raster and a persisted basin) disagree on grid metadata.
    #[error("grid configuration mismatch: {0}")]
    ConfigurationMismatch(String),

    #[error("tracing error: {0}")]
    Tracing(String),

    #[error("shape mismatch for {what}: expected {expected}, got {actual}")]
    ShapeMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("invalid state: operation requires {expected}, basin is {actual}")]
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("invalid parameter {name}: {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("netCDF error: {0}")]
    NetCdf(#[from] netcdf::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("parse error: {0}")]
    Parse(String),
}

impl BasinError {
    pub fn shape(what: &'static str, expected: usize, actual: usize) -> Self {
        BasinError::ShapeMismatch {
            what,
            expected,
            actual,
        }
    }
}

pub type Result<T> = std::result::Result<T, BasinError>;

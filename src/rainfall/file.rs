//! Sparse rainfall field file.
//!
//! `<name>.bin` holds one little-endian `f32` array per non-zero interval.
//! `<name>.hdr` is a text header:
//!
//! ```text
//! units: 12
//! cells: 12
//! hillslopes: 0
//! records: 3
//! nonzero: 2
//! method: TIN
//! record, position, mean, timestamp
//! 0, 1, 2.5000, 2020-01-01 00:00
//! 1, 0, 0.0000, 2020-01-01 01:00
//! ```
//!
//! Position is the 1-based block in the `.bin`; 0 marks a dry interval.

use chrono::NaiveDateTime;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use super::RainfallSource;
use crate::error::{BasinError, Result};

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M";

#[derive(Debug, Clone, PartialEq)]
pub struct RainEntry {
    pub record: usize,
    pub position: usize,
    pub mean: f64,
    pub timestamp: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RainHeader {
    pub units: usize,
    pub cells: usize,
    pub hillslopes: usize,
    pub nonzero: usize,
    pub method: String,
    pub records: Vec<RainEntry>,
}

impl RainHeader {
    fn write_to(&self, path: &Path) -> Result<()> {
        let mut w = BufWriter::new(File::create(path)?);
        writeln!(w, "units: {}", self.units)?;
        writeln!(w, "cells: {}", self.cells)?;
        writeln!(w, "hillslopes: {}", self.hillslopes)?;
        writeln!(w, "records: {}", self.records.len())?;
        writeln!(w, "nonzero: {}", self.nonzero)?;
        writeln!(w, "method: {}", self.method)?;
        writeln!(w, "record, position, mean, timestamp")?;
        for e in &self.records {
            writeln!(
                w,
                "{}, {}, {:.4}, {}",
                e.record,
                e.position,
                e.mean,
                e.timestamp.format(TIMESTAMP_FORMAT)
            )?;
        }
        w.flush()?;
        Ok(())
    }

    pub fn read(path: &Path) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        let mut lines = reader.lines();
        let mut field = |key: &str| -> Result<String> {
            let line = lines
                .next()
                .ok_or_else(|| BasinError::Parse(format!("rain header ended before '{}'", key)))??;
            let (k, v) = line
                .split_once(':')
                .ok_or_else(|| BasinError::Parse(format!("expected '{}: value', got '{}'", key, line)))?;
            if k.trim() != key {
                return Err(BasinError::Parse(format!("expected '{}', got '{}'", key, k.trim())));
            }
            Ok(v.trim().to_string())
        };
        let number = |s: String, key: &str| -> Result<usize> {
            s.parse()
                .map_err(|e| BasinError::Parse(format!("rain header {}: {}", key, e)))
        };
        let units = number(field("units")?, "units")?;
        let cells = number(field("cells")?, "cells")?;
        let hillslopes = number(field("hillslopes")?, "hillslopes")?;
        let nrecords = number(field("records")?, "records")?;
        let nonzero = number(field("nonzero")?, "nonzero")?;
        let method = field("method")?;
        drop(field);
        // column names
        lines.next().transpose()?;

        let mut records = Vec::with_capacity(nrecords);
        for line in lines {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let parts: Vec<&str> = line.splitn(4, ',').map(str::trim).collect();
            if parts.len() != 4 {
                return Err(BasinError::Parse(format!("malformed rain record '{}'", line)));
            }
            let bad = |e: &dyn std::fmt::Display| BasinError::Parse(format!("rain record '{}': {}", line, e));
            records.push(RainEntry {
                record: parts[0].parse().map_err(|e| bad(&e))?,
                position: parts[1].parse().map_err(|e| bad(&e))?,
                mean: parts[2].parse().map_err(|e| bad(&e))?,
                timestamp: NaiveDateTime::parse_from_str(parts[3], TIMESTAMP_FORMAT).map_err(|e| bad(&e))?,
            });
        }
        if records.len() != nrecords {
            return Err(BasinError::Parse(format!(
                "rain header announces {} records, found {}",
                nrecords,
                records.len()
            )));
        }
        Ok(RainHeader {
            units,
            cells,
            hillslopes,
            nonzero,
            method,
            records,
        })
    }
}

/// `.bin` and `.hdr` paths for a rain file name given with or without extension.
pub fn rain_paths(path: &Path) -> (PathBuf, PathBuf) {
    (path.with_extension("bin"), path.with_extension("hdr"))
}

pub struct RainWriter {
    bin: BufWriter<File>,
    hdr_path: PathBuf,
    header: RainHeader,
}

impl RainWriter {
    pub fn create(path: &Path, units: usize, cells: usize, hillslopes: usize, method: &str) -> Result<Self> {
        let (bin_path, hdr_path) = rain_paths(path);
        Ok(RainWriter {
            bin: BufWriter::new(File::create(bin_path)?),
            hdr_path,
            header: RainHeader {
                units,
                cells,
                hillslopes,
                nonzero: 0,
                method: method.to_string(),
                records: Vec::new(),
            },
        })
    }

    /// Appends one interval; `None` records a dry interval without data.
    pub fn push(&mut self, timestamp: NaiveDateTime, field: Option<&[f64]>) -> Result<()> {
        let record = self.header.records.len();
        let (position, mean) = match field {
            Some(values) => {
                if values.len() != self.header.units {
                    return Err(BasinError::shape("rainfall field", self.header.units, values.len()));
                }
                for &v in values {
                    self.bin.write_all(&(v as f32).to_le_bytes())?;
                }
                self.header.nonzero += 1;
                let mean = values.iter().sum::<f64>() / values.len().max(1) as f64;
                (self.header.nonzero, mean)
            }
            None => (0, 0.0),
        };
        self.header.records.push(RainEntry {
            record,
            position,
            mean,
            timestamp,
        });
        Ok(())
    }

    pub fn finish(mut self) -> Result<RainHeader> {
        self.bin.flush()?;
        self.header.write_to(&self.hdr_path)?;
        Ok(self.header)
    }
}

/// Reads fields back from a rain file pair.
pub struct RainReader {
    pub header: RainHeader,
    bin: File,
}

impl RainReader {
    pub fn open(path: &Path) -> Result<Self> {
        let (bin_path, hdr_path) = rain_paths(path);
        let header = RainHeader::read(&hdr_path)?;
        let bin = File::open(bin_path)?;
        let expected = (header.nonzero * header.units * 4) as u64;
        let actual = bin.metadata()?.len();
        if actual != expected {
            return Err(BasinError::Parse(format!(
                "rain data holds {} bytes, header implies {}",
                actual, expected
            )));
        }
        Ok(RainReader { header, bin })
    }

    pub fn timestamps(&self) -> Vec<NaiveDateTime> {
        self.header.records.iter().map(|e| e.timestamp).collect()
    }
}

impl RainfallSource for RainReader {
    fn units(&self) -> usize {
        self.header.units
    }

    fn records(&self) -> usize {
        self.header.records.len()
    }

    fn timestamp(&self, record: usize) -> Option<NaiveDateTime> {
        self.header.records.get(record).map(|e| e.timestamp)
    }

    fn field(&mut self, step: usize) -> Result<Vec<f64>> {
        let units = self.header.units;
        let position = self.header.records.get(step).map(|e| e.position).unwrap_or(0);
        if position == 0 {
            return Ok(vec![0.0; units]);
        }
        self.bin
            .seek(SeekFrom::Start(((position - 1) * units * 4) as u64))?;
        let mut buf = vec![0u8; units * 4];
        self.bin.read_exact(&mut buf)?;
        Ok(buf
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f64)
            .collect())
    }
}

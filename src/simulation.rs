//! Simulation basin: a delineated basin plus the parameter and storage state
//! a process engine needs, at cell or hillslope resolution.

use log::{info, warn};
use std::path::PathBuf;

use crate::basin::{Basin, distance_to_channel};
use crate::config::{Resolution, UnitThresholds};
use crate::engine::channel_mask;
use crate::error::{BasinError, Result};
use crate::hillslope::{Aggregation, HillslopePartition};
use crate::io::ascii_grid::read_ascii_grid;
use crate::io::csv::{read_storage, write_storage};
use crate::io::results::RunOutput;
use crate::rainfall::RainfallSource;
use crate::shia::{ProcessEngine, RunSetup};
use crate::state::{ModelVariable, Slot, StateBank, TANKS, UnitGeometry};
use crate::stream::nearest_point;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SimuStage {
    Unconfigured,
    GeometryReady,
    ParametersReady,
    Runnable,
    Ran,
}

impl SimuStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            SimuStage::Unconfigured => "unconfigured",
            SimuStage::GeometryReady => "geometry_ready",
            SimuStage::ParametersReady => "parameters_ready",
            SimuStage::Runnable => "runnable",
            SimuStage::Ran => "ran",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        [
            SimuStage::Unconfigured,
            SimuStage::GeometryReady,
            SimuStage::ParametersReady,
            SimuStage::Runnable,
            SimuStage::Ran,
        ]
        .into_iter()
        .find(|st| st.as_str() == s.trim())
        .ok_or_else(|| BasinError::Parse(format!("unknown simulation stage '{}'", s)))
    }
}

/// A parameter value: a raster file, one number for every cell, or a field.
#[derive(Debug, Clone, PartialEq)]
pub enum PhysicalValue {
    FromFile(PathBuf),
    Scalar(f64),
    Field(Vec<f64>),
}

/// Which hillslopes report discharge when a flagged cell falls inside them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlPolicy {
    AllUnits,
    ChannelOwningOnly,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OcgCoefficients {
    pub b: f64,
    pub w1: f64,
    pub w2: f64,
    pub w3: f64,
}

/// Inputs of the OCG relations; defaults are the published calibration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OcgInputs {
    pub alfa: [f64; 2],
    pub sigma: [f64; 3],
    pub c1: f64,
    pub k: f64,
    pub fhi: f64,
    pub omega: f64,
}

impl Default for OcgInputs {
    fn default() -> Self {
        OcgInputs {
            alfa: [0.75, 0.2],
            sigma: [0.0, 0.225, 0.225],
            c1: 5.54,
            k: 0.5,
            fhi: 0.95,
            omega: 0.13,
        }
    }
}

pub fn ocg_params(p: &OcgInputs) -> OcgCoefficients {
    let [a0, a1] = p.alfa;
    let [s0, s1, s2] = p.sigma;
    let b = p.omega * (p.c1 * p.k.powf(a0 - a1)).powf(2.0 / 3.0 - a1);
    let e_b = 1.0 / (1.0 + a1 * (2.0 / 3.0 - s1));
    OcgCoefficients {
        b: b.powf(-e_b),
        w1: (2.0 / 3.0 - s1) * (1.0 - a1) * e_b,
        w2: (p.fhi * (0.667 - s1) * (a1 - a0) + s0) * e_b,
        w3: (0.5 - s2) * e_b,
    }
}

impl OcgCoefficients {
    /// Channel speed coefficient per cell from slope and drained area [km2].
    pub fn channel_coef(&self, slope: &[f64], area_km2: &[f64]) -> Vec<f64> {
        slope
            .iter()
            .zip(area_km2)
            .map(|(s, a)| self.b * s.powf(self.w2) * a.powf(self.w3))
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct SimuBasin {
    pub basin: Basin,
    resolution: Resolution,
    partition: HillslopePartition,
    pub bank: StateBank,
    pub thresholds: UnitThresholds,
    stage: SimuStage,
}

impl SimuBasin {
    /// Partitions the basin at its own threshold and sizes the state bank
    /// for the chosen resolution.
    pub fn new(basin: Basin, resolution: Resolution) -> Result<Self> {
        let partition = basin.partition(basin.threshold)?;
        let n = match resolution {
            Resolution::ByCell => basin.ncells(),
            Resolution::ByHillslope => partition.count(),
        };
        info!(
            "simulation basin '{}' at {} resolution: {} units",
            basin.name,
            resolution.as_str(),
            n
        );
        Ok(SimuBasin {
            basin,
            resolution,
            partition,
            bank: StateBank::new(n),
            thresholds: UnitThresholds::default(),
            stage: SimuStage::Unconfigured,
        })
    }

    pub fn from_parts(
        basin: Basin,
        resolution: Resolution,
        partition: HillslopePartition,
        bank: StateBank,
        thresholds: UnitThresholds,
        stage: SimuStage,
    ) -> Result<Self> {
        if partition.ncells() != basin.ncells() {
            return Err(BasinError::shape("hillslope ownership", basin.ncells(), partition.ncells()));
        }
        let n = match resolution {
            Resolution::ByCell => basin.ncells(),
            Resolution::ByHillslope => partition.count(),
        };
        if bank.units() != n {
            return Err(BasinError::shape("state bank units", n, bank.units()));
        }
        Ok(SimuBasin {
            basin,
            resolution,
            partition,
            bank,
            thresholds,
            stage,
        })
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn partition(&self) -> &HillslopePartition {
        &self.partition
    }

    pub fn stage(&self) -> SimuStage {
        self.stage
    }

    pub fn units(&self) -> usize {
        self.bank.units()
    }

    pub fn unset_parameters(&self) -> Vec<Slot> {
        self.bank.unset_parameters()
    }

    fn require(&self, minimum: SimuStage, expected: &'static str) -> Result<()> {
        if self.stage < minimum {
            return Err(BasinError::InvalidState {
                expected,
                actual: self.stage.as_str(),
            });
        }
        Ok(())
    }

    pub fn resolve_cells(&self, value: &PhysicalValue) -> Result<Vec<f64>> {
        let n = self.basin.ncells();
        match value {
            PhysicalValue::Scalar(v) => Ok(vec![*v; n]),
            PhysicalValue::Field(v) if v.len() == n => Ok(v.clone()),
            PhysicalValue::Field(v) => Err(BasinError::shape("per-cell field", n, v.len())),
            PhysicalValue::FromFile(path) => {
                let raster = read_ascii_grid(path)?;
                self.basin.transform_map_to_basin(&raster)
            }
        }
    }

    pub fn cells_to_units(&self, field: &[f64], aggregation: Aggregation, mask: Option<&[bool]>) -> Result<Vec<f64>> {
        match self.resolution {
            Resolution::ByCell => {
                if field.len() != self.basin.ncells() {
                    return Err(BasinError::shape("per-cell field", self.basin.ncells(), field.len()));
                }
                Ok(field.to_vec())
            }
            Resolution::ByHillslope => self.partition.cells_to_hillslopes(field, aggregation, mask),
        }
    }

    /// Channel cells for partition purposes, the outlet included.
    fn channel_cells(&self, acum: &[f64]) -> Vec<bool> {
        let mut channel = channel_mask(acum, self.basin.threshold);
        channel[self.basin.structure().outlet()] = true;
        channel
    }

    pub fn set_geomorphology(&mut self, thresholds: UnitThresholds, stream_width: &PhysicalValue) -> Result<()> {
        let width = self.resolve_cells(stream_width)?;
        let basics = self.basin.cell_basics()?;
        let structure = self.basin.structure();
        let dxp = self.basin.grid().dxp();
        let unit_type_of = |acum: f64| -> u8 {
            if acum < thresholds.lower {
                1
            } else if acum < thresholds.upper {
                2
            } else {
                3
            }
        };

        let geometry = match self.resolution {
            Resolution::ByCell => UnitGeometry {
                drena: structure.cells().iter().map(|c| c.dest).collect(),
                unit_type: basics.acum.iter().map(|&a| unit_type_of(a)).collect(),
                hill_long: basics.long.clone(),
                hill_slope: basics.slope.clone(),
                stream_long: basics.long.clone(),
                stream_slope: basics.slope.clone(),
                stream_width: width,
                elem_area: vec![dxp * dxp; structure.len()],
            },
            Resolution::ByHillslope => {
                let p = &self.partition;
                let count = p.count();
                let channel = self.channel_cells(&basics.acum);
                let (to_channel, _) = distance_to_channel(structure, &channel, &basics.long);

                let mut hill_sum = vec![0.0; count];
                let mut hill_n = vec![0usize; count];
                let mut long_sum = vec![0.0; count];
                let mut stream_long = vec![0.0; count];
                for (i, &h) in p.own.iter().enumerate() {
                    let k = h as usize - 1;
                    long_sum[k] += basics.long[i];
                    if channel[i] {
                        stream_long[k] += basics.long[i];
                    } else {
                        hill_sum[k] += to_channel[i];
                        hill_n[k] += 1;
                    }
                }
                let cells = p.cells_per_hillslope();
                let hill_long = (0..count)
                    .map(|k| {
                        if hill_n[k] > 0 {
                            hill_sum[k] / hill_n[k] as f64
                        } else {
                            long_sum[k] / cells[k] as f64
                        }
                    })
                    .collect();

                UnitGeometry {
                    drena: p.dest.iter().map(|&d| (d > 0).then(|| d as usize - 1)).collect(),
                    unit_type: vec![3; count],
                    hill_long,
                    hill_slope: p.cells_to_hillslopes(&basics.slope, Aggregation::Mean, None)?,
                    stream_long,
                    stream_slope: p.cells_to_hillslopes(&basics.slope, Aggregation::Mean, Some(&channel))?,
                    stream_width: p.cells_to_hillslopes(&width, Aggregation::Mean, Some(&channel))?,
                    elem_area: p.areas(dxp),
                }
            }
        };

        self.bank.set_geometry(geometry)?;
        self.thresholds = thresholds;
        if self.stage < SimuStage::GeometryReady {
            self.stage = SimuStage::GeometryReady;
        }
        self.refresh_stage();
        Ok(())
    }

    pub fn set_physical_variable(
        &mut self,
        variable: ModelVariable,
        value: &PhysicalValue,
        position: usize,
        aggregation: Aggregation,
        mask: Option<&[bool]>,
    ) -> Result<()> {
        self.require(SimuStage::GeometryReady, "geometry set")?;
        let cells = self.resolve_cells(value)?;
        let units = self.cells_to_units(&cells, aggregation, mask)?;
        self.bank.set_variable(variable, position, &units)?;
        if self.stage == SimuStage::GeometryReady {
            self.stage = SimuStage::ParametersReady;
        }
        self.refresh_stage();
        Ok(())
    }

    /// Sets channel speed coefficients from the OCG relations, with `w1` as
    /// the channel exponent.
    pub fn set_channel_from_ocg(&mut self, inputs: &OcgInputs, aggregation: Aggregation) -> Result<OcgCoefficients> {
        let ocg = ocg_params(inputs);
        let basics = self.basin.cell_basics()?;
        let dxp = self.basin.grid().dxp();
        let area_km2: Vec<f64> = basics.acum.iter().map(|a| a * dxp * dxp / 1e6).collect();
        let coef = ocg.channel_coef(&basics.slope, &area_km2);
        self.set_physical_variable(ModelVariable::HCoef, &PhysicalValue::Field(coef), 3, aggregation, None)?;
        self.set_physical_variable(
            ModelVariable::HExp,
            &PhysicalValue::Scalar(ocg.w1),
            3,
            Aggregation::Mean,
            None,
        )?;
        Ok(ocg)
    }

    pub fn set_speed_type(&mut self, speed_type: [u8; 3]) {
        self.bank.set_speed_type(speed_type);
    }

    /// Initial storage of one tank. Files are storage tables, fields have one
    /// value per unit.
    pub fn set_storage(&mut self, value: &PhysicalValue, position: usize) -> Result<()> {
        self.require(SimuStage::GeometryReady, "geometry set")?;
        let values = match value {
            PhysicalValue::Scalar(v) => vec![*v; self.units()],
            PhysicalValue::Field(v) => v.clone(),
            PhysicalValue::FromFile(path) => {
                let table = read_storage(path)?;
                if position >= table.nrows() {
                    return Err(BasinError::shape("storage tanks", TANKS.len(), table.nrows()));
                }
                table.row(position).to_vec()
            }
        };
        self.bank.set_storage(position, &values)?;
        if self.stage == SimuStage::Ran {
            self.stage = SimuStage::ParametersReady;
        }
        self.refresh_stage();
        Ok(())
    }

    pub fn load_storage(&mut self, path: &std::path::Path) -> Result<()> {
        for k in 0..TANKS.len() {
            self.set_storage(&PhysicalValue::FromFile(path.to_path_buf()), k)?;
        }
        Ok(())
    }

    pub fn save_storage(&self, path: &std::path::Path) -> Result<()> {
        write_storage(path, &self.bank.storage)
    }

    /// Control units from per-cell masks. The outlet unit always reports discharge.
    pub fn set_control(&mut self, discharge: &[bool], moisture: &[bool], policy: ControlPolicy) -> Result<()> {
        let n = self.basin.ncells();
        if discharge.len() != n {
            return Err(BasinError::shape("discharge control cells", n, discharge.len()));
        }
        if moisture.len() != n {
            return Err(BasinError::shape("moisture control cells", n, moisture.len()));
        }
        let (mut q, h) = match self.resolution {
            Resolution::ByCell => (discharge.to_vec(), moisture.to_vec()),
            Resolution::ByHillslope => {
                let basics_acum = crate::engine::accumulation(self.basin.structure());
                let channel = self.channel_cells(&basics_acum);
                let mut q = vec![false; self.units()];
                let mut h = vec![false; self.units()];
                for (i, &own) in self.partition.own.iter().enumerate() {
                    let k = own as usize - 1;
                    let counts = match policy {
                        ControlPolicy::AllUnits => true,
                        ControlPolicy::ChannelOwningOnly => channel[i],
                    };
                    q[k] |= discharge[i] && counts;
                    h[k] |= moisture[i];
                }
                (q, h)
            }
        };
        let last = self.units() - 1;
        q[last] = true;
        self.bank.set_control(q, h)?;
        self.refresh_stage();
        Ok(())
    }

    /// Control units from coordinates: discharge points snap to the nearest
    /// channel cell, moisture points to the nearest cell.
    pub fn set_control_points(
        &mut self,
        discharge_xy: &[(f64, f64)],
        moisture_xy: &[(f64, f64)],
        policy: ControlPolicy,
    ) -> Result<()> {
        let coords = self.basin.structure().coordinates(self.basin.grid());
        let acum = crate::engine::accumulation(self.basin.structure());
        let channel = self.channel_cells(&acum);
        let channel_idx: Vec<usize> = (0..coords.len()).filter(|&i| channel[i]).collect();
        let channel_xy: Vec<(f64, f64)> = channel_idx.iter().map(|&i| coords[i]).collect();

        let mut q = vec![false; coords.len()];
        for &(x, y) in discharge_xy {
            if let Some(j) = nearest_point(&channel_xy, x, y) {
                q[channel_idx[j]] = true;
            }
        }
        let mut h = vec![false; coords.len()];
        for &(x, y) in moisture_xy {
            if let Some(i) = nearest_point(&coords, x, y) {
                h[i] = true;
            }
        }
        self.set_control(&q, &h, policy)
    }

    fn refresh_stage(&mut self) {
        let ready = self.bank.is_set(Slot::Geometry) && self.bank.has_storage() && self.bank.is_set(Slot::Control);
        if !ready || self.stage < SimuStage::GeometryReady || self.stage >= SimuStage::Runnable {
            return;
        }
        let unset = self.bank.unset_parameters();
        if !unset.is_empty() {
            let names: Vec<String> = unset.iter().map(|s| s.name()).collect();
            warn!(
                "incomplete parameterization of '{}': {} slots keep their default of 1: {}",
                self.basin.name,
                names.len(),
                names.join(", ")
            );
        }
        self.stage = SimuStage::Runnable;
    }

    /// Runs the engine from the current storage. Afterwards the bank holds the
    /// end state and storage must be set again before another run.
    pub fn run(
        &mut self,
        engine: &mut dyn ProcessEngine,
        rain: &mut dyn RainfallSource,
        setup: &RunSetup,
    ) -> Result<RunOutput> {
        if self.stage != SimuStage::Runnable {
            return Err(BasinError::InvalidState {
                expected: "runnable (geometry, storage and control set; storage re-set after a run)",
                actual: self.stage.as_str(),
            });
        }
        let output = engine.run(&mut self.bank, rain, setup)?;
        self.bank.clear_storage_flags();
        self.stage = SimuStage::Ran;
        info!(
            "run of '{}' finished: {} steps, {:.1} m3 rain, {:.1} m3 out",
            self.basin.name,
            output.steps(),
            output.total_rain(),
            output.total_outflow()
        );
        Ok(output)
    }
}

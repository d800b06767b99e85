use chrono::NaiveDateTime;
use ndarray::Array2;

// Series produced by one simulation run
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutput {
    pub timestamps: Vec<NaiveDateTime>,
    /// Units reporting discharge, column order of `discharge`.
    pub discharge_units: Vec<usize>,
    /// (steps, discharge units) [m3/s]
    pub discharge: Array2<f64>,
    pub moisture_units: Vec<usize>,
    /// (steps, moisture units) [% of storage capacity]
    pub moisture: Array2<f64>,
    /// Storage change not explained by inputs and outputs, per step [m3].
    pub balance: Vec<f64>,
    /// Water stored over the basin before the first step [m3].
    pub initial_storage: f64,
    /// Water stored over the basin at the end of each step [m3].
    pub storage: Vec<f64>,
    pub rain_volume: Vec<f64>,
    pub evaporation_volume: Vec<f64>,
    pub loss_volume: Vec<f64>,
    pub outflow_volume: Vec<f64>,
    /// (steps, 3) water reaching channels from surface, subsurface and
    /// groundwater tanks [m3/s].
    pub fluxes: Option<Array2<f64>>,
}

impl RunOutput {
    pub fn new(
        timestamps: Vec<NaiveDateTime>,
        discharge_units: Vec<usize>,
        moisture_units: Vec<usize>,
        separate_fluxes: bool,
    ) -> Self {
        let steps = timestamps.len();
        RunOutput {
            discharge: Array2::zeros((steps, discharge_units.len())),
            moisture: Array2::zeros((steps, moisture_units.len())),
            fluxes: separate_fluxes.then(|| Array2::zeros((steps, 3))),
            timestamps,
            discharge_units,
            moisture_units,
            balance: Vec::with_capacity(steps),
            initial_storage: 0.0,
            storage: Vec::with_capacity(steps),
            rain_volume: Vec::with_capacity(steps),
            evaporation_volume: Vec::with_capacity(steps),
            loss_volume: Vec::with_capacity(steps),
            outflow_volume: Vec::with_capacity(steps),
        }
    }

    pub fn steps(&self) -> usize {
        self.timestamps.len()
    }

    /// Discharge series of one control unit.
    pub fn discharge_of(&self, unit: usize) -> Option<Vec<f64>> {
        let j = self.discharge_units.iter().position(|&u| u == unit)?;
        Some(self.discharge.column(j).to_vec())
    }

    /// (step, value) of the largest discharge at a control unit.
    pub fn peak(&self, unit: usize) -> Option<(usize, f64)> {
        self.discharge_of(unit)?
            .into_iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(&b.1))
    }

    pub fn total_rain(&self) -> f64 {
        self.rain_volume.iter().sum()
    }

    pub fn total_outflow(&self) -> f64 {
        self.outflow_volume.iter().sum()
    }

    /// Change of basin storage over one step [m3].
    pub fn storage_change(&self, step: usize) -> Option<f64> {
        let after = *self.storage.get(step)?;
        let before = match step {
            0 => self.initial_storage,
            _ => self.storage[step - 1],
        };
        Some(after - before)
    }
}

use log::warn;
use ndarray::Array2;
use std::collections::BTreeSet;

use crate::error::{BasinError, Result};

/// Tanks of the vertical cascade, in storage-row order.
pub const TANKS: [&str; 5] = ["capilar", "surface", "subsurface", "groundwater", "channel"];

/// Parameter tensors a caller can set on a simulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ModelVariable {
    HCoef,
    HExp,
    VCoef,
    VExp,
    Capilar,
    Gravit,
}

impl ModelVariable {
    pub const ALL: [ModelVariable; 6] = [
        ModelVariable::VCoef,
        ModelVariable::VExp,
        ModelVariable::HCoef,
        ModelVariable::HExp,
        ModelVariable::Capilar,
        ModelVariable::Gravit,
    ];

    /// Rows of the backing tensor; positions run `0..rows()`.
    pub fn rows(&self) -> usize {
        match self {
            ModelVariable::Capilar | ModelVariable::Gravit => 1,
            _ => 4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelVariable::HCoef => "h_coef",
            ModelVariable::HExp => "h_exp",
            ModelVariable::VCoef => "v_coef",
            ModelVariable::VExp => "v_exp",
            ModelVariable::Capilar => "capilar",
            ModelVariable::Gravit => "gravit",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        ModelVariable::ALL
            .into_iter()
            .find(|v| v.as_str() == s.trim())
            .ok_or_else(|| BasinError::Parse(format!("unknown model variable '{}'", s)))
    }
}

/// One independently settable part of the state bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Slot {
    Param(ModelVariable, usize),
    Storage(usize),
    Geometry,
    SpeedType,
    Control,
}

impl Slot {
    /// Every parameter slot a fully parameterised simulation sets.
    pub fn parameter_slots() -> Vec<Slot> {
        ModelVariable::ALL
            .into_iter()
            .flat_map(|v| (0..v.rows()).map(move |p| Slot::Param(v, p)))
            .collect()
    }

    pub fn name(&self) -> String {
        match self {
            Slot::Param(v, _) if v.rows() == 1 => v.as_str().to_string(),
            Slot::Param(v, p) => format!("{}[{}]", v.as_str(), p),
            Slot::Storage(k) => format!("storage[{}]", k),
            Slot::Geometry => "geometry".to_string(),
            Slot::SpeedType => "speed_type".to_string(),
            Slot::Control => "control".to_string(),
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        let (base, index) = match s.split_once('[') {
            Some((b, rest)) => {
                let idx = rest
                    .trim_end_matches(']')
                    .parse::<usize>()
                    .map_err(|e| BasinError::Parse(format!("slot '{}': {}", s, e)))?;
                (b, Some(idx))
            }
            None => (s, None),
        };
        match (base, index) {
            ("storage", Some(k)) => Ok(Slot::Storage(k)),
            ("geometry", None) => Ok(Slot::Geometry),
            ("speed_type", None) => Ok(Slot::SpeedType),
            ("control", None) => Ok(Slot::Control),
            (var, idx) => Ok(Slot::Param(ModelVariable::parse(var)?, idx.unwrap_or(0))),
        }
    }
}

/// Geometry of each simulation unit.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitGeometry {
    /// Downstream unit, `None` at the outlet.
    pub drena: Vec<Option<usize>>,
    /// 1 hillslope, 2 carcava, 3 channel.
    pub unit_type: Vec<u8>,
    pub hill_long: Vec<f64>,
    pub hill_slope: Vec<f64>,
    pub stream_long: Vec<f64>,
    pub stream_slope: Vec<f64>,
    pub stream_width: Vec<f64>,
    /// Unit area [m2].
    pub elem_area: Vec<f64>,
}

impl UnitGeometry {
    pub fn empty(n: usize) -> Self {
        UnitGeometry {
            drena: vec![None; n],
            unit_type: vec![1; n],
            hill_long: vec![0.0; n],
            hill_slope: vec![0.0; n],
            stream_long: vec![0.0; n],
            stream_slope: vec![0.0; n],
            stream_width: vec![0.0; n],
            elem_area: vec![0.0; n],
        }
    }

    pub fn len(&self) -> usize {
        self.drena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drena.is_empty()
    }

    pub(crate) fn check(&self, n: usize) -> Result<()> {
        let lengths = [
            ("drena", self.drena.len()),
            ("unit_type", self.unit_type.len()),
            ("hill_long", self.hill_long.len()),
            ("hill_slope", self.hill_slope.len()),
            ("stream_long", self.stream_long.len()),
            ("stream_slope", self.stream_slope.len()),
            ("stream_width", self.stream_width.len()),
            ("elem_area", self.elem_area.len()),
        ];
        for (what, len) in lengths {
            if len != n {
                return Err(BasinError::shape(what, n, len));
            }
        }
        for (i, d) in self.drena.iter().enumerate() {
            if let Some(d) = *d {
                if d <= i || d >= n {
                    return Err(BasinError::InvalidParameter {
                        name: "drena",
                        reason: format!("unit {} drains to {}, expected a later unit", i, d),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Parameter, geometry and storage tensors for N simulation units.
///
/// Every tensor's unit dimension equals N. Coefficients start at one and
/// storage at zero; each slot remembers whether a caller ever set it.
#[derive(Debug, Clone, PartialEq)]
pub struct StateBank {
    n: usize,
    /// (4, N) rows: evaporation, infiltration, percolation, losses.
    pub v_coef: Array2<f64>,
    pub v_exp: Array2<f64>,
    /// (4, N) rows: surface, subsurface, groundwater, channel.
    pub h_coef: Array2<f64>,
    pub h_exp: Array2<f64>,
    pub max_capilar: Vec<f64>,
    pub max_gravita: Vec<f64>,
    /// (5, N) in [`TANKS`] order [mm].
    pub storage: Array2<f64>,
    pub geometry: UnitGeometry,
    /// Per horizontal tank: 1 linear reservoir, 2 kinematic.
    pub speed_type: [u8; 3],
    /// Units reporting discharge.
    pub control: Vec<bool>,
    /// Units reporting soil moisture.
    pub control_h: Vec<bool>,
    set: BTreeSet<Slot>,
}

impl StateBank {
    pub fn new(n: usize) -> Self {
        StateBank {
            n,
            v_coef: Array2::ones((4, n)),
            v_exp: Array2::ones((4, n)),
            h_coef: Array2::ones((4, n)),
            h_exp: Array2::ones((4, n)),
            max_capilar: vec![1.0; n],
            max_gravita: vec![1.0; n],
            storage: Array2::zeros((TANKS.len(), n)),
            geometry: UnitGeometry::empty(n),
            speed_type: [1, 1, 1],
            control: vec![false; n],
            control_h: vec![false; n],
            set: BTreeSet::new(),
        }
    }

    pub fn units(&self) -> usize {
        self.n
    }

    pub fn set_variable(&mut self, variable: ModelVariable, position: usize, values: &[f64]) -> Result<()> {
        if position >= variable.rows() {
            return Err(BasinError::InvalidParameter {
                name: "position",
                reason: format!(
                    "{} has {} rows, position {} requested",
                    variable.as_str(),
                    variable.rows(),
                    position
                ),
            });
        }
        if values.len() != self.n {
            return Err(BasinError::shape(variable.as_str(), self.n, values.len()));
        }
        match variable {
            ModelVariable::Capilar => self.max_capilar.copy_from_slice(values),
            ModelVariable::Gravit => self.max_gravita.copy_from_slice(values),
            ModelVariable::VCoef => assign_row(&mut self.v_coef, position, values),
            ModelVariable::VExp => assign_row(&mut self.v_exp, position, values),
            ModelVariable::HCoef => assign_row(&mut self.h_coef, position, values),
            ModelVariable::HExp => assign_row(&mut self.h_exp, position, values),
        }
        self.set.insert(Slot::Param(variable, position));
        Ok(())
    }

    pub fn variable(&self, variable: ModelVariable, position: usize) -> Option<Vec<f64>> {
        match variable {
            ModelVariable::Capilar if position == 0 => Some(self.max_capilar.clone()),
            ModelVariable::Gravit if position == 0 => Some(self.max_gravita.clone()),
            ModelVariable::VCoef => row_of(&self.v_coef, position),
            ModelVariable::VExp => row_of(&self.v_exp, position),
            ModelVariable::HCoef => row_of(&self.h_coef, position),
            ModelVariable::HExp => row_of(&self.h_exp, position),
            _ => None,
        }
    }

    pub fn set_storage(&mut self, tank: usize, values: &[f64]) -> Result<()> {
        if tank >= TANKS.len() {
            return Err(BasinError::InvalidParameter {
                name: "position",
                reason: format!("storage has {} tanks, position {} requested", TANKS.len(), tank),
            });
        }
        if values.len() != self.n {
            return Err(BasinError::shape("storage", self.n, values.len()));
        }
        assign_row(&mut self.storage, tank, values);
        self.set.insert(Slot::Storage(tank));
        Ok(())
    }

    pub fn set_geometry(&mut self, geometry: UnitGeometry) -> Result<()> {
        geometry.check(self.n)?;
        self.geometry = geometry;
        self.set.insert(Slot::Geometry);
        Ok(())
    }

    pub fn set_speed_type(&mut self, speed_type: [u8; 3]) {
        self.speed_type = speed_type.map(|s| {
            if s == 1 || s == 2 {
                s
            } else {
                warn!("speed type {} is not 1 or 2, using a linear reservoir", s);
                1
            }
        });
        self.set.insert(Slot::SpeedType);
    }

    pub fn set_control(&mut self, discharge: Vec<bool>, moisture: Vec<bool>) -> Result<()> {
        if discharge.len() != self.n {
            return Err(BasinError::shape("discharge control", self.n, discharge.len()));
        }
        if moisture.len() != self.n {
            return Err(BasinError::shape("moisture control", self.n, moisture.len()));
        }
        self.control = discharge;
        self.control_h = moisture;
        self.set.insert(Slot::Control);
        Ok(())
    }

    pub fn is_set(&self, slot: Slot) -> bool {
        self.set.contains(&slot)
    }

    pub fn has_storage(&self) -> bool {
        self.set.iter().any(|s| matches!(s, Slot::Storage(_)))
    }

    /// Forgets storage assignments, so a finished run must be re-seeded.
    pub fn clear_storage_flags(&mut self) {
        self.set.retain(|s| !matches!(s, Slot::Storage(_)));
    }

    /// Parameter slots still holding their ones default.
    pub fn unset_parameters(&self) -> Vec<Slot> {
        Slot::parameter_slots()
            .into_iter()
            .filter(|s| !self.set.contains(s))
            .collect()
    }

    pub fn set_slots(&self) -> impl Iterator<Item = &Slot> {
        self.set.iter()
    }

    /// Restores set-tracking from persisted slot names.
    pub fn mark_set(&mut self, slots: impl IntoIterator<Item = Slot>) {
        self.set.extend(slots);
    }

    /// Stored water of every unit [m3].
    pub fn stored_volume(&self) -> f64 {
        (0..self.n)
            .map(|i| self.storage.column(i).sum() * self.geometry.elem_area[i] / 1000.0)
            .sum()
    }
}

fn assign_row(tensor: &mut Array2<f64>, row: usize, values: &[f64]) {
    for (dst, &v) in tensor.row_mut(row).iter_mut().zip(values) {
        *dst = v;
    }
}

fn row_of(tensor: &Array2<f64>, row: usize) -> Option<Vec<f64>> {
    (row < tensor.nrows()).then(|| tensor.row(row).to_vec())
}

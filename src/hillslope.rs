//! Hillslope partition of a basin and the transforms between cell and
//! hillslope fields.
//!
//! Channel cells are split into reaches at confluences; every cell belongs to
//! the hillslope of the first reach it meets downstream. Hillslope ids are
//! 1-based, ordered upstream-first, and the outlet hillslope has the last id.

use log::{debug, warn};
use std::collections::{HashMap, VecDeque};

use crate::engine::{CellStructure, channel_mask};
use crate::error::{BasinError, Result};

/// How a per-cell field is collapsed onto hillslopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregation {
    /// Area-weighted mean, for intensive quantities (rates, slopes).
    Mean,
    /// Sum, for extensive quantities (volumes, lengths).
    Sum,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HillslopePartition {
    /// Cell -> hillslope id (1-based).
    pub own: Vec<u32>,
    /// Hillslope -> downstream hillslope id, 0 at the outlet. Indexed by id - 1.
    pub dest: Vec<u32>,
    /// Horton/Strahler order of each hillslope's reach.
    pub horton: Vec<u32>,
}

impl HillslopePartition {
    pub fn build(structure: &CellStructure, acum: &[f64], threshold: f64) -> Result<Self> {
        let n = structure.len();
        if acum.len() != n {
            return Err(BasinError::shape("accumulation", n, acum.len()));
        }
        let outlet = structure.outlet();
        let mut channel = channel_mask(acum, threshold);
        channel[outlet] = true;

        let mut channel_ups = vec![0u32; n];
        for (i, cell) in structure.cells().iter().enumerate() {
            if let (true, Some(d)) = (channel[i], cell.dest) {
                channel_ups[d] += 1;
            }
        }

        // Reach outlets: the basin outlet and every channel cell feeding a confluence
        let mut node_id = vec![0u32; n];
        let mut count = 0u32;
        for (i, cell) in structure.cells().iter().enumerate() {
            let is_node = channel[i]
                && match cell.dest {
                    None => true,
                    Some(d) => channel_ups[d] >= 2,
                };
            if is_node {
                count += 1;
                node_id[i] = count;
            }
        }

        let mut own = vec![0u32; n];
        for i in (0..n).rev() {
            own[i] = if node_id[i] > 0 {
                node_id[i]
            } else {
                // dest exists: only the outlet lacks one and it is always a node
                own[structure.dest(i).unwrap_or(outlet)]
            };
        }

        let mut dest = vec![0u32; count as usize];
        for (i, cell) in structure.cells().iter().enumerate() {
            if node_id[i] > 0 {
                dest[node_id[i] as usize - 1] = cell.dest.map(|d| own[d]).unwrap_or(0);
            }
        }

        let horton = horton_order(&dest);
        let partition = HillslopePartition { own, dest, horton };
        partition.validate()?;
        debug!(
            "partitioned {} cells into {} hillslopes (max order {})",
            n,
            partition.count(),
            partition.horton.iter().max().copied().unwrap_or(0)
        );
        Ok(partition)
    }

    /// Rebuilds a partition from persisted arrays and checks its invariants.
    pub fn from_parts(own: Vec<u32>, dest: Vec<u32>, horton: Vec<u32>) -> Result<Self> {
        if horton.len() != dest.len() {
            return Err(BasinError::shape("hillslope horton order", dest.len(), horton.len()));
        }
        let partition = HillslopePartition { own, dest, horton };
        partition.validate()?;
        Ok(partition)
    }

    pub fn count(&self) -> usize {
        self.dest.len()
    }

    pub fn ncells(&self) -> usize {
        self.own.len()
    }

    pub fn outlet(&self) -> u32 {
        self.dest.len() as u32
    }

    pub fn cells_per_hillslope(&self) -> Vec<usize> {
        let mut counts = vec![0usize; self.count()];
        for &h in &self.own {
            counts[h as usize - 1] += 1;
        }
        counts
    }

    pub fn cells_of(&self, id: u32) -> Vec<usize> {
        self.own
            .iter()
            .enumerate()
            .filter(|&(_, &h)| h == id)
            .map(|(i, _)| i)
            .collect()
    }

    /// Area of each hillslope for a planar cell size.
    pub fn areas(&self, dxp: f64) -> Vec<f64> {
        self.cells_per_hillslope()
            .into_iter()
            .map(|c| c as f64 * dxp * dxp)
            .collect()
    }

    /// Dense ids, every hillslope owns a cell, and the drainage graph is a
    /// tree rooted at the outlet hillslope.
    pub fn validate(&self) -> Result<()> {
        let count = self.count();
        if count == 0 {
            return Err(BasinError::Tracing("partition has no hillslopes".into()));
        }
        for (i, &h) in self.own.iter().enumerate() {
            if h == 0 || h as usize > count {
                return Err(BasinError::Tracing(format!(
                    "cell {} owned by hillslope {} outside 1..={}",
                    i, h, count
                )));
            }
        }
        if let Some(empty) = self.cells_per_hillslope().iter().position(|&c| c == 0) {
            return Err(BasinError::Tracing(format!("hillslope {} owns no cells", empty + 1)));
        }
        let outlets: Vec<usize> = (0..count).filter(|&k| self.dest[k] == 0).collect();
        if outlets != [count - 1] {
            return Err(BasinError::Tracing(format!(
                "hillslope graph must drain to hillslope {} only, outlets found: {:?}",
                count,
                outlets.iter().map(|k| k + 1).collect::<Vec<_>>()
            )));
        }
        let order = self.routing_order()?;
        if order.len() != count {
            return Err(BasinError::Tracing(format!(
                "cycle detected in hillslope graph: processed {} of {}",
                order.len(),
                count
            )));
        }
        Ok(())
    }

    /// Kahn ordering of hillslope ids, headwaters first.
    pub fn routing_order(&self) -> Result<Vec<u32>> {
        let count = self.count();
        let mut in_degree = vec![0usize; count];
        for &d in &self.dest {
            if d as usize > count {
                return Err(BasinError::Tracing(format!("hillslope drains to unknown id {}", d)));
            }
            if d > 0 {
                in_degree[d as usize - 1] += 1;
            }
        }

        let mut queue: VecDeque<usize> = (0..count).filter(|&k| in_degree[k] == 0).collect();
        if queue.is_empty() {
            return Err(BasinError::Tracing(
                "no headwater hillslopes found - possible cycle in graph".into(),
            ));
        }

        let mut order = Vec::with_capacity(count);
        while let Some(k) = queue.pop_front() {
            order.push(k as u32 + 1);
            let d = self.dest[k];
            if d > 0 {
                let degree = &mut in_degree[d as usize - 1];
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(d as usize - 1);
                }
            }
        }
        Ok(order)
    }

    /// Hops from a hillslope to the outlet hillslope.
    pub fn hops_to_outlet(&self, id: u32) -> Option<usize> {
        let mut current = id;
        for hops in 0..=self.count() {
            let d = *self.dest.get((current as usize).checked_sub(1)?)?;
            if d == 0 {
                return Some(hops);
            }
            current = d;
        }
        None
    }

    /// Collapses a per-cell field onto hillslopes. With a mask only the
    /// flagged cells contribute; hillslopes left without contributors get 0.
    pub fn cells_to_hillslopes(
        &self,
        field: &[f64],
        aggregation: Aggregation,
        mask: Option<&[bool]>,
    ) -> Result<Vec<f64>> {
        let n = self.ncells();
        if field.len() != n {
            return Err(BasinError::shape("per-cell field", n, field.len()));
        }
        if let Some(m) = mask {
            if m.len() != n {
                return Err(BasinError::shape("aggregation mask", n, m.len()));
            }
        }

        let count = self.count();
        let mut base: Vec<Option<f64>> = vec![None; count];
        let mut acc = vec![0.0; count];
        let mut members = vec![0usize; count];
        for (i, &h) in self.own.iter().enumerate() {
            if mask.is_some_and(|m| !m[i]) {
                continue;
            }
            let k = h as usize - 1;
            members[k] += 1;
            match aggregation {
                Aggregation::Sum => acc[k] += field[i],
                // Shifted sum: a uniform group averages back to its value exactly
                Aggregation::Mean => {
                    let b = *base[k].get_or_insert(field[i]);
                    acc[k] += field[i] - b;
                }
            }
        }

        let mut empty = Vec::new();
        let out = (0..count)
            .map(|k| {
                if members[k] == 0 {
                    empty.push(k + 1);
                    return 0.0;
                }
                match aggregation {
                    Aggregation::Sum => acc[k],
                    Aggregation::Mean => base[k].unwrap_or(0.0) + acc[k] / members[k] as f64,
                }
            })
            .collect();
        if !empty.is_empty() {
            warn!(
                "{} hillslopes had no contributing cells and were set to 0: {:?}",
                empty.len(),
                empty
            );
        }
        Ok(out)
    }

    /// Broadcasts one value per hillslope to every cell it owns.
    pub fn hillslopes_to_cells(&self, field: &[f64]) -> Result<Vec<f64>> {
        if field.len() != self.count() {
            return Err(BasinError::shape("per-hillslope field", self.count(), field.len()));
        }
        Ok(self.own.iter().map(|&h| field[h as usize - 1]).collect())
    }
}

/// Strahler rule over an upstream-first drainage list: headwaters are order 1,
/// two or more upstream branches sharing the maximum order raise it by one.
pub fn horton_order(dest: &[u32]) -> Vec<u32> {
    let mut upstream: HashMap<usize, Vec<usize>> = HashMap::new();
    for (k, &d) in dest.iter().enumerate() {
        if d > 0 {
            upstream.entry(d as usize - 1).or_default().push(k);
        }
    }
    let mut order = vec![1u32; dest.len()];
    for k in 0..dest.len() {
        if let Some(ups) = upstream.get(&k) {
            let max = ups.iter().map(|&u| order[u]).max().unwrap_or(1);
            let at_max = ups.iter().filter(|&&u| order[u] == max).count();
            order[k] = if at_max >= 2 { max + 1 } else { max };
        }
    }
    order
}

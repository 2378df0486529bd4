//! Monte Carlo estimators of the in-cell radiation field.
//!
//! Every worker accumulates into its own copy and the copies are merged at
//! the end of the sweep, so all updates are plain additions with no
//! ordering requirements between packets.

use super::{opacity::ContinuumOpacity, opacity::PhixsScratch, TransportContext};
use crate::packets::{fpk, Packet};
use ndarray::{Array2, Array3};

/// Event counters for diagnostics.
#[derive(Clone, Debug)]
pub struct Counters {
    /// Cell boundary crossings.
    pub cell_crossings: u64,
    /// Packets that left the grid.
    pub escapes: u64,
    /// Electron scatterings.
    pub escatters: u64,
    /// Conversions to the thermal pool by free-free absorption.
    pub kpkt_from_ff: u64,
    /// Conversions to the thermal pool by bound-free absorption.
    pub kpkt_from_bf: u64,
    /// Macro-atom activations by bound-free absorption.
    pub ma_activations_bf: u64,
    /// Macro-atom activations by bound-bound absorption.
    pub ma_activations_bb: u64,
    /// Absorption count per line.
    pub line_absorptions: Vec<u64>,
}

impl Counters {
    pub(crate) fn new(n_lines: usize) -> Self {
        Self {
            cell_crossings: 0,
            escapes: 0,
            escatters: 0,
            kpkt_from_ff: 0,
            kpkt_from_bf: 0,
            ma_activations_bf: 0,
            ma_activations_bb: 0,
            line_absorptions: vec![0; n_lines],
        }
    }

    fn merge(&mut self, other: &Self) {
        self.cell_crossings += other.cell_crossings;
        self.escapes += other.escapes;
        self.escatters += other.escatters;
        self.kpkt_from_ff += other.kpkt_from_ff;
        self.kpkt_from_bf += other.kpkt_from_bf;
        self.ma_activations_bf += other.ma_activations_bf;
        self.ma_activations_bb += other.ma_activations_bb;
        for (count, &other_count) in self
            .line_absorptions
            .iter_mut()
            .zip(other.line_absorptions.iter())
        {
            *count += other_count;
        }
    }
}

/// Volume estimators of the radiation field, owned by a single worker.
#[derive(Clone, Debug)]
pub struct Estimators {
    /// Angle-averaged mean intensity estimator per model-grid cell.
    pub j: Vec<fpk>,
    /// Frequency-weighted mean intensity estimator per model-grid cell.
    pub nu_j: Vec<fpk>,
    /// Free-free heating estimator per model-grid cell.
    pub ff_heating: Vec<fpk>,
    /// Photoionization rate estimator, indexed `(mgi, element, ion)`.
    pub gamma: Array3<fpk>,
    /// Bound-free heating estimator, indexed `(mgi, element, ion)`.
    pub bf_heating: Array3<fpk>,
    /// Line radiation field contributions, indexed `(mgi, tracked line)`.
    pub line_contributions: Array2<fpk>,
    /// Event counters.
    pub counters: Counters,
    tracked_lines: Vec<usize>,
}

impl Estimators {
    /// Creates zeroed estimators for the given problem sizes.
    ///
    /// `tracked_lines` selects the lines for which the line radiation field
    /// is estimated; updates for other lines are ignored.
    pub fn new(
        n_model_cells: usize,
        n_elements: usize,
        max_n_ions: usize,
        n_lines: usize,
        tracked_lines: &[usize],
    ) -> Self {
        let mut tracked_lines = tracked_lines.to_vec();
        tracked_lines.sort_unstable();
        tracked_lines.dedup();
        Self {
            j: vec![0.0; n_model_cells],
            nu_j: vec![0.0; n_model_cells],
            ff_heating: vec![0.0; n_model_cells],
            gamma: Array3::zeros((n_model_cells, n_elements, max_n_ions)),
            bf_heating: Array3::zeros((n_model_cells, n_elements, max_n_ions)),
            line_contributions: Array2::zeros((n_model_cells, tracked_lines.len())),
            counters: Counters::new(n_lines),
            tracked_lines,
        }
    }

    /// The lines for which the line radiation field is estimated.
    pub fn tracked_lines(&self) -> &[usize] {
        &self.tracked_lines
    }

    /// Adds the given contribution to the line radiation field estimator of
    /// the cell, if the line is tracked.
    pub fn update_line_estimator(&mut self, mgi: usize, lineindex: usize, contribution: fpk) {
        if let Ok(tracked) = self.tracked_lines.binary_search(&lineindex) {
            self.line_contributions[[mgi, tracked]] += contribution;
        }
    }

    /// Merges another worker's estimators into this one.
    pub fn merged(mut self, other: Self) -> Self {
        for (a, b) in self.j.iter_mut().zip(other.j.iter()) {
            *a += b;
        }
        for (a, b) in self.nu_j.iter_mut().zip(other.nu_j.iter()) {
            *a += b;
        }
        for (a, b) in self.ff_heating.iter_mut().zip(other.ff_heating.iter()) {
            *a += b;
        }
        self.gamma += &other.gamma;
        self.bf_heating += &other.bf_heating;
        self.line_contributions += &other.line_contributions;
        self.counters.merge(&other.counters);
        self
    }
}

/// Accumulates the volume estimators for a path segment of the given
/// rest-frame length through the packet's current cell.
///
/// Called at the segment midpoint. Empty cells accumulate nothing. The
/// continuum-derived contributions (free-free heating and the ground-state
/// photoionization channels) are only added when the cached opacity belongs
/// to the segment's cell, which excludes grey cells where no continuum
/// opacity was computed.
pub fn update_estimators(
    ctx: &TransportContext,
    pkt: &Packet,
    distance: fpk,
    opacity: &ContinuumOpacity,
    scratch: &PhixsScratch,
    estimators: &mut Estimators,
) {
    let mgi = match ctx.grid.cell_model_index(pkt.cell) {
        Some(mgi) => mgi,
        None => return,
    };
    let distance_e_cmf = distance * pkt.e_cmf;
    let nu = pkt.nu_cmf;
    estimators.j[mgi] += distance_e_cmf;
    estimators.nu_j[mgi] += distance_e_cmf * nu;

    if opacity.model_cell() != Some(mgi) {
        return;
    }
    estimators.ff_heating[mgi] += distance_e_cmf * opacity.ffheating;

    let distance_e_cmf_over_nu = distance_e_cmf / nu;
    for (channel, ground) in ctx.atomic.ground_continua().iter().enumerate() {
        if nu <= ground.nu_edge {
            // sorted by threshold, so no later channel contributes
            break;
        }
        // cells without the element contribute nothing to its channels
        if ctx.model.element_abundance(mgi, ground.element) > 0.0 {
            let contr = scratch.groundcont_gamma_contr[channel];
            let gamma = &mut estimators.gamma[[mgi, ground.element, ground.ion]];
            *gamma += contr * distance_e_cmf_over_nu;
            crate::fatal_unless!(
                gamma.is_finite(),
                "photoionization estimator became non-finite: mgi {} element {} ion {} \
                 contribution {} distance_e_cmf_over_nu {}",
                mgi,
                ground.element,
                ground.ion,
                contr,
                distance_e_cmf_over_nu
            );
            estimators.bf_heating[[mgi, ground.element, ground.ion]] +=
                contr * distance_e_cmf * (1.0 - ground.nu_edge / nu);
        }
    }
}

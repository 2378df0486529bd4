//! Continuum opacity at a given cell and comoving frequency.
//!
//! Every opacity stored here is in the comoving frame. Callers working with
//! rest-frame path lengths multiply by the Doppler factor, exactly once, at
//! the call site.

use super::TransportContext;
use crate::{
    atomic::AtomicData,
    constants::{H_OVER_KB, KAPPA_FF_COEFF, SIGMA_T},
    packets::{fpk, Packet},
};

/// Relative frequency change below which cached opacities stay valid.
const CACHE_NU_TOLERANCE: fpk = 1e-4;

/// Cached continuum opacity components for one worker [1/cm].
#[derive(Clone, Debug)]
pub struct ContinuumOpacity {
    /// Total continuum opacity.
    pub total: fpk,
    /// Thomson scattering opacity.
    pub es: fpk,
    /// Free-free absorption opacity.
    pub ff: fpk,
    /// Bound-free absorption opacity.
    pub bf: fpk,
    /// Free-free heating contribution.
    pub ffheating: fpk,
    nu_cmf: fpk,
    modelgridindex: Option<usize>,
    recalculate_required: bool,
}

impl ContinuumOpacity {
    /// Creates an empty cache that forces recomputation on first use.
    pub fn new() -> Self {
        Self {
            total: 0.0,
            es: 0.0,
            ff: 0.0,
            bf: 0.0,
            ffheating: 0.0,
            nu_cmf: -1.0,
            modelgridindex: None,
            recalculate_required: true,
        }
    }

    /// The model-grid cell the cached values belong to.
    pub fn model_cell(&self) -> Option<usize> {
        self.modelgridindex
    }

    /// Forces the next lookup to recompute.
    pub fn invalidate(&mut self) {
        self.recalculate_required = true;
    }
}

impl Default for ContinuumOpacity {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-worker scratch arrays parallel to the photoionization list.
#[derive(Clone, Debug)]
pub struct PhixsScratch {
    /// Running cumulative bound-free opacity per continuum, used to sample
    /// which channel absorbs a bound-free photon.
    pub kappa_bf_sum: Vec<fpk>,
    /// Photoionization-rate contribution of each ground-state channel,
    /// consumed by the volume estimators.
    pub groundcont_gamma_contr: Vec<fpk>,
    departure_ratio: Vec<fpk>,
    departure_cell: Option<usize>,
}

impl PhixsScratch {
    /// Creates scratch arrays sized for the given dataset.
    pub fn new(atomic: &AtomicData) -> Self {
        Self {
            kappa_bf_sum: vec![0.0; atomic.n_continua()],
            groundcont_gamma_contr: vec![0.0; atomic.ground_continua().len()],
            departure_ratio: vec![-1.0; atomic.n_continua()],
            departure_cell: None,
        }
    }

    fn prepare_for_cell(&mut self, mgi: usize) {
        if self.departure_cell != Some(mgi) {
            self.departure_ratio.fill(-1.0);
            self.departure_cell = Some(mgi);
        }
        self.groundcont_gamma_contr.fill(0.0);
    }

    fn departure_ratio(&mut self, index: usize, compute: impl FnOnce() -> fpk) -> fpk {
        if self.departure_ratio[index] < 0.0 {
            self.departure_ratio[index] = compute();
        }
        self.departure_ratio[index]
    }
}

/// Fills the worker's cache with the comoving continuum opacities at the
/// packet's cell and comoving frequency.
///
/// A lookup with the same cell and a comoving frequency within
/// [`CACHE_NU_TOLERANCE`] of the cached one returns without recomputing.
pub fn calculate_continuum_opacity(
    ctx: &TransportContext,
    pkt: &Packet,
    opacity: &mut ContinuumOpacity,
    scratch: &mut PhixsScratch,
) {
    let mgi = crate::fatal_on_none!(
        ctx.grid.cell_model_index(pkt.cell),
        "continuum opacity requested for packet {} in empty cell {}",
        pkt.number,
        pkt.cell
    );
    crate::fatal_unless!(
        !ctx.model.is_thick(mgi),
        "continuum opacity requested for packet {} in grey cell (mgi {})",
        pkt.number,
        mgi
    );
    let nu_cmf = pkt.nu_cmf;
    if opacity.modelgridindex == Some(mgi)
        && !opacity.recalculate_required
        && (opacity.nu_cmf / nu_cmf - 1.0).abs() < CACHE_NU_TOLERANCE
    {
        return;
    }

    let sigma = SIGMA_T * ctx.model.electron_density(mgi);
    let kappa_ff = calculate_kappa_ff(ctx, mgi, nu_cmf);
    let kappa_bf = calculate_kappa_bf(ctx, mgi, nu_cmf, scratch);

    opacity.nu_cmf = nu_cmf;
    opacity.modelgridindex = Some(mgi);
    opacity.recalculate_required = false;
    opacity.total = sigma + kappa_ff + kappa_bf;
    opacity.es = sigma;
    opacity.ff = kappa_ff;
    opacity.bf = kappa_bf;
    opacity.ffheating = kappa_ff;

    if !opacity.total.is_finite() {
        if opacity.es.is_finite() {
            eprintln!(
                "[warning] non-finite continuum opacity (es {} ff {} bf {}) in mgi {}; \
                 falling back to Thomson scattering only",
                opacity.es, opacity.ff, opacity.bf, mgi
            );
            opacity.ff = 0.0;
            opacity.bf = 0.0;
            opacity.ffheating = 0.0;
            opacity.total = opacity.es;
        } else {
            crate::fatal!(
                "non-finite continuum opacity without a finite Thomson part \
                 (es {} ff {} bf {}) in mgi {} at nu_cmf {}",
                opacity.es,
                opacity.ff,
                opacity.bf,
                mgi,
                nu_cmf
            );
        }
    }
}

/// Free-free opacity of the cell at the given comoving frequency [1/cm].
///
/// Sums `Z_eff^2 g_ff n_ion` over all ions, skipping neutral stages.
fn calculate_kappa_ff(ctx: &TransportContext, mgi: usize, nu: fpk) -> fpk {
    debug_assert!(nu > 0.0);
    const G_FF: fpk = 1.0;

    let nne = ctx.model.electron_density(mgi);
    let t_e = ctx.model.temperature_e(mgi);

    let mut kappa_ff = 0.0;
    for element in 0..ctx.atomic.n_elements() {
        for ion in 0..ctx.atomic.n_ions(element) {
            // ionic charge, zero for the neutral stage
            let z_eff = ctx.atomic.ion_stage(element, ion) as i64 - 1;
            if z_eff > 0 {
                let nnion = ctx.model.ion_population(mgi, element, ion);
                kappa_ff += (z_eff * z_eff) as fpk * G_FF * nnion;
            }
        }
    }
    kappa_ff * KAPPA_FF_COEFF / t_e.sqrt() * nu.powi(-3) * nne
        * (1.0 - (-H_OVER_KB * nu / t_e).exp())
}

/// Bound-free opacity of the cell at the given comoving frequency [1/cm].
///
/// Walks the photoionization list in ascending threshold order, filling the
/// cumulative scratch sums end-to-end and the per-ground-channel rate
/// contributions on the way.
fn calculate_kappa_bf(
    ctx: &TransportContext,
    mgi: usize,
    nu: fpk,
    scratch: &mut PhixsScratch,
) -> fpk {
    scratch.prepare_for_cell(mgi);

    let nne = ctx.model.electron_density(mgi);
    let nnetot = ctx.model.total_electron_density(mgi);
    let t_e = ctx.model.temperature_e(mgi);

    let mut kappa_bf_sum = 0.0;
    let n_continua = ctx.atomic.n_continua();
    let mut i = 0;
    while i < n_continua {
        let cont = ctx.atomic.continuum(i);
        // only species actually present in the cell can absorb
        let included = cont.level == 0
            || ctx.model.ion_population(mgi, cont.element, cont.ion) / nnetot > 1e-6;
        if included {
            if nu < cont.nu_edge {
                // the list is sorted by threshold, so no later entry absorbs
                break;
            }
            let nnlevel = ctx.model.level_population(mgi, cont.element, cont.ion, cont.level);
            if nu <= cont.nu_max() && nnlevel > 0.0 {
                let sigma_bf = cont.cross_section_at(nu);
                let corrfactor = if ctx.options.separate_stim_recomb {
                    1.0
                } else {
                    // photoionization minus stimulated recombination
                    let departure_ratio = scratch.departure_ratio(i, || {
                        let nnupperionlevel = ctx.model.level_population(
                            mgi,
                            cont.element,
                            cont.ion + 1,
                            cont.upper_level,
                        );
                        let sf = ctx.atomic.saha_factor(
                            cont.element,
                            cont.ion,
                            cont.level,
                            cont.upper_level,
                            t_e,
                            cont.nu_edge,
                        );
                        nnupperionlevel / nnlevel * nne * sf
                    });
                    let stimfactor = departure_ratio * (-H_OVER_KB * nu / t_e).exp();
                    (1.0 - stimfactor).max(0.0)
                };
                let kappa_bf_contr = nnlevel * sigma_bf * cont.probability * corrfactor;
                if let Some(ground) = ctx.atomic.continuum_ground_index(i) {
                    scratch.groundcont_gamma_contr[ground] +=
                        sigma_bf * cont.probability * corrfactor;
                }
                kappa_bf_sum += kappa_bf_contr;
            }
        }
        scratch.kappa_bf_sum[i] = kappa_bf_sum;
        i += 1;
    }
    // keep the cumulative array valid end-to-end
    for tail in scratch.kappa_bf_sum[i..].iter_mut() {
        *tail = kappa_bf_sum;
    }
    kappa_bf_sum
}

//! Propagation of radiation packets through the expanding ejecta.
//!
//! Each sub-step of a packet draws a random optical depth and resolves, in
//! distance order, the three competing terminations: a cell boundary, the
//! end of the time step, and a physical interaction. All shared tables are
//! reached through an explicit context handle and every worker owns its
//! mutable state, so the hot loop takes no locks.

pub mod boundary;
pub mod estimators;
pub mod events;
pub mod opacity;

use crate::{
    atomic::AtomicData,
    constants::CLIGHT_PROP,
    frames::DopplerShiftScheme,
    grid::{GridGeometry, GridType, ModelGrid},
    packets::{fpk, Packet, PacketKind},
    random::PacketRng,
};
use boundary::BoundaryTarget;
use estimators::Estimators;
use opacity::{ContinuumOpacity, PhixsScratch};
use rayon::prelude::*;

#[cfg(feature = "serialization")]
use serde::Serialize;

/// Runtime configuration of the transport core.
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "serialization", derive(Serialize))]
pub struct TransportOptions {
    /// Which Doppler shift formula to apply.
    pub doppler_shift: DopplerShiftScheme,
    /// Disables the stimulated-recombination correction of the bound-free
    /// opacity, for runs that track stimulated recombination separately.
    pub separate_stim_recomb: bool,
    /// Also updates the line estimator when a line absorbs a packet, not
    /// only when a packet flies past it.
    pub detailed_line_estimators: bool,
    /// Upper bound on the length of a single sub-step [cm].
    pub max_path_step: fpk,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            doppler_shift: DopplerShiftScheme::NonRelativistic,
            separate_stim_recomb: false,
            detailed_line_estimators: false,
            max_path_step: fpk::INFINITY,
        }
    }
}

/// Handle to the immutable shared state consumed by every core operation.
#[derive(Clone, Copy, Debug)]
pub struct TransportContext<'a> {
    /// Atomic dataset (line list, photoionization continua, levels).
    pub atomic: &'a AtomicData,
    /// Propagation grid geometry.
    pub grid: &'a GridGeometry,
    /// Physical state of the model-grid cells.
    pub model: &'a ModelGrid,
    /// Runtime configuration.
    pub options: TransportOptions,
}

impl<'a> TransportContext<'a> {
    /// Assembles a context, validating that the tables fit together.
    pub fn new(
        atomic: &'a AtomicData,
        grid: &'a GridGeometry,
        model: &'a ModelGrid,
        options: TransportOptions,
    ) -> Self {
        for cell in 0..grid.n_cells() {
            if let Some(mgi) = grid.cell_model_index(cell) {
                crate::fatal_unless!(
                    mgi < model.n_cells(),
                    "cell {} maps to model cell {} but the model grid has only {} cells",
                    cell,
                    mgi,
                    model.n_cells()
                );
            }
        }
        for element in 0..atomic.n_elements() {
            for mgi in 0..model.n_cells() {
                crate::fatal_unless!(
                    atomic.n_ions(element)
                        == model.ion_population_count(mgi, element),
                    "model cell {} carries {} ion populations for element {} but the dataset \
                     has {} ions",
                    mgi,
                    model.ion_population_count(mgi, element),
                    element,
                    atomic.n_ions(element)
                );
            }
        }
        Self {
            atomic,
            grid,
            model,
            options,
        }
    }
}

/// Mutable state owned by a single worker for the duration of a sweep.
#[derive(Clone, Debug)]
pub struct ThreadContext {
    /// Deterministically seeded random number generator.
    pub rng: PacketRng,
    /// Continuum opacity cache.
    pub opacity: ContinuumOpacity,
    /// Scratch arrays parallel to the photoionization list.
    pub scratch: PhixsScratch,
    /// This worker's share of the volume estimators.
    pub estimators: Estimators,
}

impl ThreadContext {
    /// Creates the worker state for the given process rank and worker index.
    pub fn new(ctx: &TransportContext, rank: u64, worker: u64, tracked_lines: &[usize]) -> Self {
        Self {
            rng: PacketRng::seeded(rank, worker),
            opacity: ContinuumOpacity::new(),
            scratch: PhixsScratch::new(ctx.atomic),
            estimators: Estimators::new(
                ctx.model.n_cells(),
                ctx.atomic.n_elements(),
                ctx.atomic.max_n_ions(),
                ctx.atomic.n_lines(),
                tracked_lines,
            ),
        }
    }
}

/// Whether the stepper should keep stepping the same packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StepVerdict {
    Continue,
    Stop,
}

/// Advances an r-packet until it reaches `t_end`, stops being an r-packet,
/// or enters a different model-grid cell (so the caller can rebalance).
pub fn advance_rpacket(
    ctx: &TransportContext,
    thread: &mut ThreadContext,
    pkt: &mut Packet,
    t_end: fpk,
) {
    debug_assert_eq!(pkt.kind, PacketKind::RPacket);
    while step_rpacket(ctx, thread, pkt, t_end) == StepVerdict::Continue {}
}

/// Performs one sub-step: draws the optical depth to the next interaction,
/// finds the winning termination and dispatches it.
fn step_rpacket(
    ctx: &TransportContext,
    thread: &mut ThreadContext,
    pkt: &mut Packet,
    t_end: fpk,
) -> StepVerdict {
    let scheme = ctx.options.doppler_shift;
    let old_mgi = ctx.grid.cell_model_index(pkt.cell);

    // optical depth at which the next physical interaction happens
    let tau_next = -thread.rng.uniform_pos().ln();

    let (mut sdist, mut target) = boundary::boundary_cross(ctx.grid, pkt);
    if sdist == 0.0 {
        // drift guard snapped the packet across a face
        boundary::change_cell(pkt, target, &mut thread.estimators.counters);
        return continue_verdict(ctx, pkt, old_mgi);
    }

    let max_sdist = match ctx.grid.grid_type() {
        GridType::Spherical1D => {
            2.0 * ctx.grid.r_max() * (pkt.prop_time + sdist / CLIGHT_PROP) / ctx.grid.t_min()
        }
        GridType::UniformCartesian3D => ctx.grid.r_max() * pkt.prop_time / ctx.grid.t_min(),
    };
    crate::fatal_unless!(
        sdist <= max_sdist,
        "unreasonably large boundary distance {} for packet {} (grid radius {})",
        sdist,
        pkt.number,
        ctx.grid.r_max()
    );
    crate::fatal_unless!(
        sdist >= 0.0,
        "negative boundary distance {} for packet {} in cell {} (pos {} dir {})",
        sdist,
        pkt.number,
        pkt.cell,
        pkt.pos,
        pkt.dir
    );
    if sdist > ctx.options.max_path_step {
        sdist = ctx.options.max_path_step;
        target = BoundaryTarget::Cell(pkt.cell);
    }

    let tdist = (t_end - pkt.prop_time) * CLIGHT_PROP;
    crate::fatal_unless!(
        tdist >= 0.0,
        "packet {} is already past the end of the time step ({} > {})",
        pkt.number,
        pkt.prop_time,
        t_end
    );

    let thick = old_mgi.map_or(false, |mgi| ctx.model.is_thick(mgi));
    let mut event_kind = None;
    let mut find_nextline = false;
    let edist = match old_mgi {
        None => {
            // empty cells have no physical events; packets just propagate
            find_nextline = true;
            fpk::MAX
        }
        Some(mgi) if thick => {
            // grey approximation: electron scattering is the only process
            find_nextline = true;
            let kappa = ctx.model.grey_opacity(mgi)
                * ctx.model.mass_density(mgi)
                * pkt.doppler_factor(scheme);
            tau_next / kappa
        }
        Some(mgi) => {
            let (edist, kind) =
                events::get_event(ctx, mgi, pkt, thread, tau_next, tdist.min(sdist));
            event_kind = kind;
            edist
        }
    };
    crate::fatal_unless!(
        edist >= 0.0,
        "negative event distance {} for packet {}",
        edist,
        pkt.number
    );

    if sdist < tdist && sdist < edist {
        // the packet reaches the cell boundary first; estimators always
        // accumulate at the segment midpoint
        pkt.advance_with_time(sdist / 2.0, scheme);
        estimators::update_estimators(
            ctx,
            pkt,
            sdist,
            &thread.opacity,
            &thread.scratch,
            &mut thread.estimators,
        );
        pkt.advance_with_time(sdist / 2.0, scheme);

        if target != BoundaryTarget::Cell(pkt.cell) {
            boundary::change_cell(pkt, target, &mut thread.estimators.counters);
        }

        pkt.scat_count = 0;
        pkt.last_event += 100;

        // a packet can silently cross many lines inside an empty or grey
        // cell; re-seat its line-list position when line resolution resumes
        if find_nextline && pkt.kind == PacketKind::RPacket {
            if let Some(mgi) = ctx.grid.cell_model_index(pkt.cell) {
                if !ctx.model.is_thick(mgi) {
                    pkt.next_trans = ctx
                        .atomic
                        .closest_transition_reseat(pkt.nu_cmf, pkt.next_trans);
                }
            }
        }

        continue_verdict(ctx, pkt, old_mgi)
    } else if edist < sdist && edist < tdist {
        // a physical event happens within the cell
        pkt.advance_with_time(edist / 2.0, scheme);
        estimators::update_estimators(
            ctx,
            pkt,
            edist,
            &thread.opacity,
            &thread.scratch,
            &mut thread.estimators,
        );
        pkt.advance_with_time(edist / 2.0, scheme);

        if thick {
            events::rpkt_event_thickcell(ctx, pkt, thread);
        } else {
            match event_kind {
                Some(events::RpktEventKind::BoundBound) => {
                    events::rpkt_event_boundbound(pkt, &mut thread.estimators.counters);
                }
                Some(events::RpktEventKind::Continuum) => {
                    let mgi = old_mgi.unwrap();
                    events::rpkt_event_continuum(ctx, pkt, thread, mgi);
                }
                None => crate::fatal!(
                    "physical event won for packet {} without a resolved event kind",
                    pkt.number
                ),
            }
        }

        continue_verdict(ctx, pkt, old_mgi)
    } else if tdist < sdist && tdist < edist {
        // the time step ends before anything else happens
        pkt.advance_with_time(tdist / 2.0, scheme);
        estimators::update_estimators(
            ctx,
            pkt,
            tdist,
            &thread.opacity,
            &thread.scratch,
            &mut thread.estimators,
        );
        pkt.prop_time = t_end;
        pkt.advance(tdist / 2.0, scheme);
        pkt.last_event += 1000;

        if find_nextline {
            pkt.next_trans = ctx
                .atomic
                .closest_transition_reseat(pkt.nu_cmf, pkt.next_trans);
        }

        StepVerdict::Stop
    } else {
        crate::fatal!(
            "failed to identify the winning event for packet {} \
             (boundary {} time {} event {})",
            pkt.number,
            sdist,
            tdist,
            edist
        )
    }
}

fn continue_verdict(ctx: &TransportContext, pkt: &Packet, old_mgi: Option<usize>) -> StepVerdict {
    let mgi = ctx.grid.cell_model_index(pkt.cell);
    if pkt.kind == PacketKind::RPacket && (mgi.is_none() || mgi == old_mgi) {
        StepVerdict::Continue
    } else {
        StepVerdict::Stop
    }
}

/// Advances every r-packet of the slice to `t_end` or to a handoff,
/// partitioned over the worker threads, and returns the merged estimators.
///
/// Packets of other kinds are left untouched for the outer driver, as are
/// packets that convert during the sweep.
pub fn propagate_packets(
    ctx: &TransportContext,
    packets: &mut [Packet],
    t_end: fpk,
    rank: u64,
    tracked_lines: &[usize],
) -> Estimators {
    let n_workers = rayon::current_num_threads().max(1);
    let chunk_size = ((packets.len() + n_workers - 1) / n_workers).max(1);

    packets
        .par_chunks_mut(chunk_size)
        .enumerate()
        .map(|(worker, chunk)| {
            let mut thread = ThreadContext::new(ctx, rank, worker as u64, tracked_lines);
            for pkt in chunk.iter_mut() {
                while pkt.kind == PacketKind::RPacket && pkt.prop_time < t_end {
                    advance_rpacket(ctx, &mut thread, pkt, t_end);
                }
            }
            thread.estimators
        })
        .reduce_with(Estimators::merged)
        .unwrap_or_else(|| {
            Estimators::new(
                ctx.model.n_cells(),
                ctx.atomic.n_elements(),
                ctx.atomic.max_n_ions(),
                ctx.atomic.n_lines(),
                tracked_lines,
            )
        })
}

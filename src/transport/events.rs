//! Physical interaction events along a packet's path.
//!
//! The event solver walks the sorted line list in descending frequency,
//! accumulating continuum and Sobolev line optical depth until the randomly
//! drawn depth is reached, and the handlers resolve the interaction the
//! stepper dispatches to.

use super::{boundary, estimators::Counters, opacity, ThreadContext, TransportContext};
use crate::{
    constants::{CLIGHT, CLIGHTSQUARED_OVER_TWOH, CLIGHT_PROP, HCLIGHT_OVER_FOURPI},
    frames::DopplerShiftScheme,
    geometry::Vec3,
    grid::CellFace,
    packets::{fpk, AbsorptionKind, MacroAtomState, Packet, PacketKind},
};

/// The kind of physical event found by the event solver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RpktEventKind {
    /// Resonance with a line; the macro-atom state is already staked on the
    /// packet.
    BoundBound,
    /// Continuum interaction (electron scattering, free-free or bound-free).
    Continuum,
}

/// Sobolev optical depth of the given line at the given time.
///
/// Population inversions are treated as transparent.
pub fn tau_sobolev(ctx: &TransportContext, mgi: usize, lineindex: usize, time: fpk) -> fpk {
    let line = ctx.atomic.line(lineindex);
    let a_ul = ctx.atomic.einstein_a(lineindex);
    let b_ul = CLIGHTSQUARED_OVER_TWOH / line.nu.powi(3) * a_ul;
    let b_lu = ctx.atomic.stat_weight(line.element, line.ion, line.upper)
        / ctx.atomic.stat_weight(line.element, line.ion, line.lower)
        * b_ul;
    let n_u = ctx.model.level_population(mgi, line.element, line.ion, line.upper);
    let n_l = ctx.model.level_population(mgi, line.element, line.ion, line.lower);
    let tau = (b_lu * n_l - b_ul * n_u) * HCLIGHT_OVER_FOURPI * time;
    if tau < 0.0 {
        eprintln!(
            "[warning] negative Sobolev depth {} in line {} (mgi {}); treating as transparent",
            tau, lineindex, mgi
        );
        0.0
    } else {
        tau
    }
}

/// Finds the distance to the first physical event whose accumulated optical
/// depth reaches `tau_rnd`, or `fpk::MAX` if none occurs within
/// `abort_dist` (the distance to the cell boundary or the end of the time
/// step, whichever is closer).
///
/// Must only be called for non-empty, non-grey cells. The packet itself is
/// not moved, but its line-list position is committed and, for a
/// bound-bound event, its prospective macro-atom state is staked.
pub fn get_event(
    ctx: &TransportContext,
    mgi: usize,
    pkt: &mut Packet,
    thread: &mut ThreadContext,
    tau_rnd: fpk,
    abort_dist: fpk,
) -> (fpk, Option<RpktEventKind>) {
    let scheme = ctx.options.doppler_shift;
    let mut tau = 0.0;
    let mut dist = 0.0;

    // comoving frequency at the abort distance; the two half-moves mirror
    // the stepper so the frequencies agree bit for bit
    let nu_cmf_abort = {
        let mut abort_probe = pkt.clone();
        abort_probe.advance_with_time(abort_dist / 2.0, scheme);
        abort_probe.advance_with_time(abort_dist / 2.0, scheme);
        abort_probe.nu_cmf
    };
    debug_assert!(nu_cmf_abort <= pkt.nu_cmf);

    // speculative forward walk on a copy; the caller's packet is only
    // touched once the winner is known
    let mut probe = pkt.clone();

    opacity::calculate_continuum_opacity(ctx, pkt, &mut thread.opacity, &mut thread.scratch);
    let kap_cont = thread.opacity.total * pkt.doppler_factor(scheme);

    loop {
        let lineindex = match ctx.atomic.closest_transition(probe.nu_cmf, probe.next_trans) {
            Some(lineindex) => lineindex,
            None => {
                // no further line can be reached; only the continuum competes
                probe.next_trans = ctx.atomic.n_lines() + 1;
                pkt.next_trans = probe.next_trans;
                let tau_cont = kap_cont * (abort_dist - dist);
                if tau_rnd - tau > tau_cont {
                    return (fpk::MAX, None);
                }
                return (dist + (tau_rnd - tau) / kap_cont, Some(RpktEventKind::Continuum));
            }
        };

        let nu_trans = ctx.atomic.line(lineindex).nu;
        // advancing past this line immediately guarantees it cannot make the
        // packet scatter twice within this segment
        probe.next_trans = lineindex + 1;

        let mut ldist = if probe.nu_cmf <= nu_trans {
            // propagated slightly past the resonance; the line is at the packet
            0.0
        } else if ctx.options.doppler_shift == DopplerShiftScheme::NonRelativistic {
            CLIGHT * probe.prop_time * (probe.nu_cmf / nu_trans - 1.0)
        } else {
            // exact closed form of the relativistic Doppler resonance condition
            let nu_r = nu_trans / probe.nu_rf;
            let ct = CLIGHT * probe.prop_time;
            let r = probe.pos.length();
            let mu = probe.dir.dot(&probe.pos) / r;
            -mu * r
                + (ct
                    - nu_r
                        * nu_r
                        * (ct * ct
                            - (1.0 + r * r * (1.0 - mu * mu) * (1.0 + nu_r.powi(-2))))
                        .sqrt())
                    / (1.0 + nu_r * nu_r)
        };
        if ldist < 0.0 {
            eprintln!("[warning] distance to line resonance {} < 0", ldist);
            crate::fatal_unless!(
                ldist >= -100.0,
                "negative distance {} to line {} for packet {}",
                ldist,
                lineindex,
                pkt.number
            );
            ldist = 0.0;
        }

        let tau_cont = kap_cont * ldist;

        if tau_rnd - tau > tau_cont {
            // the continuum depth alone does not stop the packet before the
            // line; check the line itself

            if nu_trans < nu_cmf_abort {
                // the line lies beyond the abort boundary in frequency space,
                // which is the numerically stable form of dist > abort_dist;
                // back up one line so the next segment starts with it
                probe.next_trans -= 1;
                pkt.next_trans = probe.next_trans;
                return (fpk::MAX, None);
            }

            let tau_line = tau_sobolev(ctx, mgi, lineindex, probe.prop_time);

            if tau_rnd - tau > tau_cont + tau_line {
                // still below the drawn depth: fly past the line
                dist += ldist;
                tau += tau_cont + tau_line;
                probe.advance_with_time(ldist, scheme);
                thread.estimators.update_line_estimator(
                    mgi,
                    lineindex,
                    probe.prop_time * CLIGHT * probe.e_cmf / probe.nu_cmf,
                );
            } else {
                // bound-bound event in this line
                let line = ctx.atomic.line(lineindex);
                pkt.mastate = MacroAtomState {
                    element: line.element,
                    ion: line.ion,
                    level: line.upper,
                    activating_line: Some(lineindex),
                };

                let mut edist = dist + ldist;
                if edist >= abort_dist {
                    // can only happen through numerical drift of the
                    // relativistic resonance distance; the frequency check
                    // above proved the line is on this side of the boundary
                    let edist_new = abort_dist * (1.0 - 2e-8);
                    eprintln!(
                        "[warning] bound-bound distance {} was >= abort distance {} without \
                         redshifting past the boundary; reducing to {}",
                        edist, abort_dist, edist_new
                    );
                    edist = edist_new;
                }

                if ctx.options.detailed_line_estimators {
                    probe.advance_with_time(ldist, scheme);
                    thread.estimators.update_line_estimator(
                        mgi,
                        lineindex,
                        probe.prop_time * CLIGHT * probe.e_cmf / probe.nu_cmf,
                    );
                }

                pkt.next_trans = probe.next_trans;
                return (edist, Some(RpktEventKind::BoundBound));
            }
        } else {
            // the continuum wins before the line is reached; retry the same
            // line on the next segment
            probe.next_trans -= 1;
            pkt.next_trans = probe.next_trans;
            return (dist + (tau_rnd - tau) / kap_cont, Some(RpktEventKind::Continuum));
        }
    }
}

/// Handles the only event type in optically thick cells: coherent Thomson
/// scattering with an isotropic comoving-frame direction.
pub fn rpkt_event_thickcell(
    ctx: &TransportContext,
    pkt: &mut Packet,
    thread: &mut ThreadContext,
) {
    pkt.interactions += 1;
    pkt.nscatterings += 1;
    pkt.scat_count += 1;
    pkt.last_event = 12;
    thread.estimators.counters.escatters += 1;

    pkt.emit_rpacket(&mut thread.rng, ctx.options.doppler_shift);
    // electron scattering leaves the emission provenance untouched apart
    // from the position and time
    pkt.em_pos = pkt.pos;
    pkt.em_time = pkt.prop_time;
}

/// Resolves a continuum event into electron scattering, free-free
/// absorption or bound-free absorption according to the opacity partition.
pub fn rpkt_event_continuum(
    ctx: &TransportContext,
    pkt: &mut Packet,
    thread: &mut ThreadContext,
    mgi: usize,
) {
    let nu = pkt.nu_cmf;

    let dopplerfactor = pkt.doppler_factor(ctx.options.doppler_shift);
    let kappa_cont = thread.opacity.total * dopplerfactor;
    let sigma = thread.opacity.es * dopplerfactor;
    let kappa_ff = thread.opacity.ff * dopplerfactor;
    let kappa_bf = thread.opacity.bf * dopplerfactor;

    let zrand = thread.rng.uniform();
    if zrand * kappa_cont < sigma {
        // electron scattering; coherent in the comoving frame
        pkt.interactions += 1;
        pkt.nscatterings += 1;
        pkt.scat_count += 1;
        pkt.last_event = 12;
        thread.estimators.counters.escatters += 1;

        pkt.emit_rpacket(&mut thread.rng, ctx.options.doppler_shift);
        pkt.em_pos = pkt.pos;
        pkt.em_time = pkt.prop_time;
    } else if zrand * kappa_cont < sigma + kappa_ff {
        // free-free absorption into the thermal pool
        thread.estimators.counters.kpkt_from_ff += 1;
        pkt.interactions += 1;
        pkt.last_event = 5;
        pkt.kind = PacketKind::KPacket;
        pkt.absorption = Some(AbsorptionKind::FreeFree);
    } else if zrand * kappa_cont < sigma + kappa_ff + kappa_bf {
        pkt.absorption = Some(AbsorptionKind::BoundFree);

        // the scratch sums are comoving, so sample against the comoving bf
        let kappa_bf_inrest = thread.opacity.bf;
        let last_sum = *thread.scratch.kappa_bf_sum.last().unwrap();
        crate::fatal_unless!(
            (last_sum / kappa_bf_inrest - 1.0).abs() < 1e-10,
            "bound-free scratch sum {} does not match the cached opacity {}",
            last_sum,
            kappa_bf_inrest
        );

        // determine the continuum the absorption happens in
        let zrand2 = thread.rng.uniform();
        let kappa_bf_rand = zrand2 * kappa_bf_inrest;
        let allcontindex = thread
            .scratch
            .kappa_bf_sum
            .partition_point(|&sum| sum < kappa_bf_rand);
        crate::fatal_unless!(
            allcontindex < ctx.atomic.n_continua(),
            "bound-free channel sampling overran the continuum list (target {})",
            kappa_bf_rand
        );
        let cont = ctx.atomic.continuum(allcontindex);

        // photoionization or stimulated-recombination-corrected heating
        let zrand3 = thread.rng.uniform();
        if zrand3 < cont.nu_edge / nu {
            // the threshold fraction of the photon energy ionizes
            thread.estimators.counters.ma_activations_bf += 1;
            pkt.interactions += 1;
            pkt.last_event = 3;
            pkt.kind = PacketKind::MacroAtom;
            pkt.mastate = MacroAtomState {
                element: cont.element,
                ion: cont.ion + 1,
                level: cont.upper_level,
                activating_line: None,
            };
        } else {
            // the excess goes to the thermal pool
            thread.estimators.counters.kpkt_from_bf += 1;
            pkt.interactions += 1;
            pkt.last_event = 4;
            pkt.kind = PacketKind::KPacket;
        }
    } else {
        crate::fatal!(
            "continuum event for packet {} did not resolve into a process \
             (target {} es {} ff {} bf {} mgi {})",
            pkt.number,
            zrand * kappa_cont,
            sigma,
            kappa_ff,
            kappa_bf,
            mgi
        );
    }
}

/// Activates the macro-atom staked on the packet by the event solver.
pub fn rpkt_event_boundbound(pkt: &mut Packet, counters: &mut Counters) {
    counters.ma_activations_bb += 1;
    pkt.interactions += 1;
    pkt.last_event = 1;

    let activating_line = crate::fatal_on_none!(
        pkt.mastate.activating_line,
        "bound-bound event for packet {} without a staked line",
        pkt.number
    );
    pkt.absorption = Some(AbsorptionKind::Line(activating_line));
    pkt.absorption_freq = pkt.nu_rf;
    pkt.absorption_dir = pkt.dir;
    pkt.kind = PacketKind::MacroAtom;
    counters.line_absorptions[activating_line] += 1;
}

/// Estimates the probability that a packet emitted at the given point
/// escapes the grid, averaged over isotropically sampled directions.
///
/// Returns zero from grey cells, and treats a total optical depth above 10
/// along any direction as no escape.
pub fn rpkt_escape_probability(
    ctx: &TransportContext,
    thread: &mut ThreadContext,
    startpos: Vec3<fpk>,
    start_nu_cmf: fpk,
    startcell: usize,
    last_cross: Option<CellFace>,
    tstart: fpk,
    n_directions: usize,
) -> fpk {
    let mgi = crate::fatal_on_none!(
        ctx.grid.cell_model_index(startcell),
        "escape probability requested in empty cell {}",
        startcell
    );
    if ctx.model.is_thick(mgi) {
        return 0.0;
    }

    let mut escape_prob_sum = 0.0;
    for _ in 0..n_directions {
        let dir = thread.rng.isotropic_unit_vec();
        escape_prob_sum +=
            escape_probability_from_direction(ctx, thread, startpos, start_nu_cmf, startcell, last_cross, tstart, dir);
    }
    escape_prob_sum / n_directions as fpk
}

fn escape_probability_from_direction(
    ctx: &TransportContext,
    thread: &mut ThreadContext,
    startpos: Vec3<fpk>,
    start_nu_cmf: fpk,
    startcell: usize,
    last_cross: Option<CellFace>,
    tstart: fpk,
    dir: Vec3<fpk>,
) -> fpk {
    let scheme = ctx.options.doppler_shift;
    let mut probe = Packet::new_rpacket(usize::MAX, startcell, startpos, dir, start_nu_cmf, 0.0, tstart, scheme);
    probe.last_cross = last_cross;

    let mut tot_tau_cont = 0.0;
    let mut tot_tau_lines = 0.0;
    let mut t_future = tstart;

    loop {
        let mgi = match ctx.grid.cell_model_index(probe.cell) {
            Some(mgi) => mgi,
            None => break,
        };
        if ctx.model.is_thick(mgi) {
            return 0.0;
        }

        probe.prop_time = t_future;
        let (sdist, target) = boundary::boundary_cross(ctx.grid, &mut probe);

        if let boundary::BoundaryTarget::Cell(snext) = target {
            if let Some(next_mgi) = ctx.grid.cell_model_index(snext) {
                if ctx.model.is_thick(next_mgi) {
                    return 0.0;
                }
            }
        }

        opacity::calculate_continuum_opacity(ctx, &probe, &mut thread.opacity, &mut thread.scratch);
        tot_tau_cont += thread.opacity.total * probe.doppler_factor(scheme) * sdist;

        if tot_tau_lines + tot_tau_cont > 10.0 {
            return 0.0;
        }

        // all lines redshifted into within this cell contribute their full
        // Sobolev depth
        let mut ldist = 0.0;
        while ldist < sdist {
            let lineindex = match ctx.atomic.closest_transition(probe.nu_cmf, probe.next_trans) {
                Some(lineindex) => lineindex,
                None => {
                    probe.next_trans = ctx.atomic.n_lines() + 1;
                    break;
                }
            };
            let nu_trans = ctx.atomic.line(lineindex).nu;
            probe.next_trans = lineindex + 1;
            ldist = if probe.nu_cmf < nu_trans {
                0.0
            } else {
                CLIGHT * t_future * (probe.nu_cmf / nu_trans - 1.0)
            };
            crate::fatal_unless!(ldist >= 0.0, "negative distance {} to line resonance", ldist);
            if ldist > sdist {
                // resume from this line when entering the next cell
                probe.next_trans -= 1;
                break;
            }
            let t_line = t_future + ldist / CLIGHT;
            tot_tau_lines += tau_sobolev(ctx, mgi, lineindex, t_line);
        }

        match target {
            boundary::BoundaryTarget::Escape => break,
            boundary::BoundaryTarget::Cell(snext) => {
                if ctx.grid.cell_model_index(snext).is_none() {
                    break;
                }
                t_future += sdist / CLIGHT_PROP;
                probe.prop_time = t_future;
                probe.advance(sdist, scheme);
                boundary::change_cell(&mut probe, target, &mut thread.estimators.counters);
            }
        }
    }

    (-(tot_tau_cont + tot_tau_lines)).exp()
}

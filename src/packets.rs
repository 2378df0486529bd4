//! Radiation packet state and elementary movements.

use crate::{
    constants::CLIGHT_PROP,
    frames::{self, DopplerShiftScheme},
    geometry::{Dim3, Vec3},
    grid::CellFace,
    random::PacketRng,
};

#[cfg(feature = "serialization")]
use serde::Serialize;

/// Floating-point precision to use for packet transport.
#[allow(non_camel_case_types)]
pub type fpk = f64;

/// The closed set of packet kinds.
///
/// Only `RPacket` is propagated by this crate; the other kinds are terminal
/// here and are handed back to the outer driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serialization", derive(Serialize))]
pub enum PacketKind {
    /// A radiation packet.
    RPacket,
    /// A packet absorbed into the thermal pool.
    KPacket,
    /// A packet absorbed into an excited macro-atom.
    MacroAtom,
    /// A packet that has left the grid.
    Escape,
}

/// What absorbed the packet last, for post-processing only.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serialization", derive(Serialize))]
pub enum AbsorptionKind {
    FreeFree,
    BoundFree,
    /// Bound-bound absorption in the line with this index.
    Line(usize),
}

/// What last emitted the packet, for post-processing only.
///
/// Written by the external emission machinery; electron scattering leaves
/// it untouched.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serialization", derive(Serialize))]
pub enum EmissionKind {
    /// The packet has kept its initial energy deposition provenance.
    Initial,
    /// De-excitation through the line with this index.
    Line(usize),
    /// Emission in the continuum with this index.
    Continuum(usize),
}

/// Prospective macro-atom activation state, staked on the packet by the
/// event solver before the bound-bound event is actually dispatched.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serialization", derive(Serialize))]
pub struct MacroAtomState {
    pub element: usize,
    pub ion: usize,
    /// Level the macro-atom is activated in (the transition's upper level).
    pub level: usize,
    /// The line that activated the macro-atom, if it was a bound-bound event.
    pub activating_line: Option<usize>,
}

/// A Monte Carlo energy packet.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serialization", derive(Serialize))]
pub struct Packet {
    /// Identifier for diagnostics.
    pub number: usize,
    /// Which kind of packet this currently is.
    pub kind: PacketKind,
    /// Position in the rest frame [cm].
    pub pos: Vec3<fpk>,
    /// Propagation direction in the rest frame (unit vector).
    pub dir: Vec3<fpk>,
    /// Frequency in the rest frame [Hz].
    pub nu_rf: fpk,
    /// Frequency in the comoving frame [Hz].
    pub nu_cmf: fpk,
    /// Energy in the rest frame [erg].
    pub e_rf: fpk,
    /// Energy in the comoving frame [erg].
    pub e_cmf: fpk,
    /// Current lab-frame time [s].
    pub prop_time: fpk,
    /// Index of the propagation cell containing the packet.
    pub cell: usize,
    /// The cell face last crossed, to prevent immediate re-crossing.
    pub last_cross: Option<CellFace>,
    /// Running position in the sorted line list (0 = search from the blue
    /// end, `i + 1` after considering line `i`, `n_lines + 1` = exhausted).
    pub next_trans: usize,
    /// Stokes parameters (I, Q, U).
    pub stokes: [fpk; 3],
    /// Polarization reference direction.
    pub pol_dir: Vec3<fpk>,
    /// Position of the last emission [cm].
    pub em_pos: Vec3<fpk>,
    /// Time of the last emission [s].
    pub em_time: fpk,
    /// What last emitted the packet.
    pub emission: EmissionKind,
    /// What absorbed the packet last, if anything.
    pub absorption: Option<AbsorptionKind>,
    /// Rest-frame frequency at the last absorption [Hz].
    pub absorption_freq: fpk,
    /// Direction at the last absorption.
    pub absorption_dir: Vec3<fpk>,
    /// Kind the packet had when it escaped the grid.
    pub escape_kind: Option<PacketKind>,
    /// Time at which the packet escaped the grid [s].
    pub escape_time: fpk,
    /// Total number of interactions experienced.
    pub interactions: u32,
    /// Total number of electron scatterings experienced.
    pub nscatterings: u32,
    /// Electron scatterings since the last cell change.
    pub scat_count: u32,
    /// Code of the last event, for diagnostics.
    pub last_event: u32,
    /// Prospective macro-atom activation state.
    pub mastate: MacroAtomState,
}

impl Packet {
    /// Creates a fresh r-packet at the given phase-space point, deriving
    /// the rest-frame frequency and energy from the comoving values.
    pub fn new_rpacket(
        number: usize,
        cell: usize,
        pos: Vec3<fpk>,
        dir: Vec3<fpk>,
        nu_cmf: fpk,
        e_cmf: fpk,
        prop_time: fpk,
        scheme: DopplerShiftScheme,
    ) -> Self {
        let mut pkt = Self {
            number,
            kind: PacketKind::RPacket,
            pos,
            dir,
            nu_rf: 0.0,
            nu_cmf,
            e_rf: 0.0,
            e_cmf,
            prop_time,
            cell,
            last_cross: None,
            next_trans: 0,
            stokes: [1.0, 0.0, 0.0],
            pol_dir: Vec3::unit(Dim3::Z),
            em_pos: pos,
            em_time: prop_time,
            emission: EmissionKind::Initial,
            absorption: None,
            absorption_freq: 0.0,
            absorption_dir: Vec3::zero(),
            escape_kind: None,
            escape_time: 0.0,
            interactions: 0,
            nscatterings: 0,
            scat_count: 0,
            last_event: 0,
            mastate: MacroAtomState::default(),
        };
        let dopplerfactor = pkt.doppler_factor(scheme);
        pkt.nu_rf = nu_cmf / dopplerfactor;
        pkt.e_rf = e_cmf / dopplerfactor;
        pkt.reset_polarization();
        pkt
    }

    /// Doppler factor `nu_cmf / nu_rf` at the packet's current phase-space
    /// point.
    pub fn doppler_factor(&self, scheme: DopplerShiftScheme) -> fpk {
        frames::doppler_nucmf_on_nurf(&self.pos, &self.dir, self.prop_time, scheme)
    }

    /// Moves the packet the given distance along its direction without
    /// advancing the clock, refreshing the comoving-frame quantities.
    pub fn advance(&mut self, distance: fpk, scheme: DopplerShiftScheme) {
        debug_assert!(distance >= 0.0);
        self.pos = self.pos + self.dir * distance;
        let dopplerfactor = self.doppler_factor(scheme);
        self.nu_cmf = self.nu_rf * dopplerfactor;
        self.e_cmf = self.e_rf * dopplerfactor;
    }

    /// Moves the packet the given distance and advances its clock by the
    /// corresponding light travel time.
    pub fn advance_with_time(&mut self, distance: fpk, scheme: DopplerShiftScheme) {
        self.prop_time += distance / CLIGHT_PROP;
        self.advance(distance, scheme);
    }

    /// Re-emits the packet as an r-packet with an isotropic comoving-frame
    /// direction, used by electron scattering and by macro-atom
    /// de-excitation.
    pub fn emit_rpacket(&mut self, rng: &mut PacketRng, scheme: DopplerShiftScheme) {
        self.kind = PacketKind::RPacket;
        self.last_cross = None;

        let dir_cmf = rng.isotropic_unit_vec();
        // the rest frame moves with -v relative to the comoving frame
        let vel = frames::flow_velocity(&self.pos, -self.prop_time);
        self.dir = frames::angle_aberration(&dir_cmf, &vel);
        crate::fatal_unless!(
            (self.dir.length() - 1.0).abs() < 1e-8,
            "emitted direction {} is not a unit vector",
            self.dir
        );

        let dopplerfactor = self.doppler_factor(scheme);
        self.nu_rf = self.nu_cmf / dopplerfactor;
        self.e_rf = self.e_cmf / dopplerfactor;

        self.reset_polarization();
    }

    /// Resets the Stokes vector to unpolarized and picks a polarization
    /// reference direction orthogonal to the propagation direction.
    pub fn reset_polarization(&mut self) {
        self.stokes = [1.0, 0.0, 0.0];
        let mut pol_dir = self.dir.cross(&Vec3::unit(Dim3::Z));
        if pol_dir.squared_length() < 1e-8 {
            pol_dir = self.dir.cross(&Vec3::unit(Dim3::Y));
        }
        self.pol_dir = pol_dir.normalized();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use crate::constants::CLIGHT;

    const SCHEME: DopplerShiftScheme = DopplerShiftScheme::NonRelativistic;

    fn outward_packet() -> Packet {
        Packet::new_rpacket(
            0,
            0,
            Vec3::new(1e14, 0.0, 0.0),
            Vec3::new(1.0, 0.0, 0.0),
            5e14,
            1e40,
            1e5,
            SCHEME,
        )
    }

    #[test]
    fn construction_satisfies_doppler_consistency() {
        let pkt = outward_packet();
        let dopplerfactor = pkt.doppler_factor(SCHEME);
        assert_relative_eq!(pkt.nu_rf * dopplerfactor, pkt.nu_cmf, max_relative = 1e-10);
        assert_relative_eq!(pkt.e_rf * dopplerfactor, pkt.e_cmf, max_relative = 1e-10);
    }

    #[test]
    fn comoving_frequency_decreases_along_the_path() {
        let mut pkt = outward_packet();
        let mut nu_prev = pkt.nu_cmf;
        for _ in 0..20 {
            pkt.advance_with_time(1e13, SCHEME);
            assert!(pkt.nu_cmf <= nu_prev * (1.0 + 1e-12));
            nu_prev = pkt.nu_cmf;
        }
    }

    #[test]
    fn advance_with_time_moves_the_clock_by_light_travel_time() {
        let mut pkt = outward_packet();
        pkt.advance_with_time(CLIGHT, SCHEME);
        assert_relative_eq!(pkt.prop_time, 1e5 + 1.0, max_relative = 1e-12);
    }

    #[test]
    fn emission_resets_polarization_orthogonally() {
        let mut pkt = outward_packet();
        let mut rng = PacketRng::from_seed(11);
        pkt.emit_rpacket(&mut rng, SCHEME);
        assert_eq!(pkt.stokes, [1.0, 0.0, 0.0]);
        assert!((pkt.dir.length() - 1.0).abs() <= 1e-8);
        assert!((pkt.pol_dir.length() - 1.0).abs() <= 1e-8);
        assert!(pkt.pol_dir.dot(&pkt.dir).abs() < 1e-8);
        assert!(pkt.last_cross.is_none());
    }

    #[test]
    fn emission_preserves_comoving_but_not_rest_frame_frequency() {
        let mut pkt = outward_packet();
        let nu_cmf_before = pkt.nu_cmf;
        let nu_rf_before = pkt.nu_rf;
        let mut rng = PacketRng::from_seed(5);
        pkt.emit_rpacket(&mut rng, SCHEME);
        assert_eq!(pkt.nu_cmf, nu_cmf_before);
        assert_ne!(pkt.nu_rf, nu_rf_before);
        let dopplerfactor = pkt.doppler_factor(SCHEME);
        assert_relative_eq!(pkt.nu_rf * dopplerfactor, pkt.nu_cmf, max_relative = 1e-10);
    }
}

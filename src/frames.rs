//! Lorentz transforms between the comoving and rest frames.

use crate::{
    constants::{CLIGHT, CLIGHTSQUARED},
    geometry::Vec3,
    packets::fpk,
};

#[cfg(feature = "serialization")]
use serde::Serialize;

/// Which Doppler shift formula to apply when transforming frequencies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serialization", derive(Serialize))]
pub enum DopplerShiftScheme {
    /// First order in v/c.
    NonRelativistic,
    /// Exact special-relativistic factor including time dilation.
    Relativistic,
}

/// Velocity of the homologously expanding fluid at the given position and
/// time [cm/s].
pub fn flow_velocity(pos: &Vec3<fpk>, time: fpk) -> Vec3<fpk> {
    *pos * (1.0 / time)
}

/// Doppler factor `nu_cmf / nu_rf` for a photon at the given position,
/// direction and time.
pub fn doppler_nucmf_on_nurf(
    pos: &Vec3<fpk>,
    dir: &Vec3<fpk>,
    time: fpk,
    scheme: DopplerShiftScheme,
) -> fpk {
    debug_assert!(time > 0.0);
    let vel = flow_velocity(pos, time);
    let mut factor = 1.0 - dir.dot(&vel) / CLIGHT;
    if scheme == DopplerShiftScheme::Relativistic {
        let beta_sq = vel.squared_length() / CLIGHTSQUARED;
        factor /= (1.0 - beta_sq).sqrt();
    }
    crate::fatal_unless!(
        factor.is_finite() && factor > 0.0,
        "doppler factor {} at pos {} dir {} time {}",
        factor,
        pos,
        dir,
        time
    );
    factor
}

/// Aberrates a photon direction into the frame moving with velocity `vel`
/// relative to the frame in which `dir` was measured.
///
/// Pass the fluid velocity to go from the rest frame into the comoving
/// frame, and its negative to come back.
pub fn angle_aberration(dir: &Vec3<fpk>, vel: &Vec3<fpk>) -> Vec3<fpk> {
    let beta = *vel * (1.0 / CLIGHT);
    let beta_sq = beta.squared_length();
    debug_assert!(beta_sq < 1.0);
    let gamma = 1.0 / (1.0 - beta_sq).sqrt();
    let ndotb = dir.dot(&beta);
    let fact1 = gamma * (1.0 - ndotb);
    let fact2 = gamma * gamma * ndotb / (gamma + 1.0) - gamma;
    (*dir + beta * fact2) * (1.0 / fact1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const T: fpk = 1e5;

    #[test]
    fn doppler_factor_is_unity_for_transverse_motion_at_first_order() {
        let pos = Vec3::new(1e14, 0.0, 0.0);
        let dir = Vec3::new(0.0, 1.0, 0.0);
        let factor = doppler_nucmf_on_nurf(&pos, &dir, T, DopplerShiftScheme::NonRelativistic);
        assert_relative_eq!(factor, 1.0, max_relative = 1e-12);
    }

    #[test]
    fn relativistic_factor_carries_time_dilation() {
        let pos = Vec3::new(1e14, 0.0, 0.0);
        let dir = Vec3::new(0.0, 1.0, 0.0);
        let beta: fpk = 1e14 / T / CLIGHT;
        let factor = doppler_nucmf_on_nurf(&pos, &dir, T, DopplerShiftScheme::Relativistic);
        assert_relative_eq!(
            factor,
            1.0 / (1.0 - beta * beta).sqrt(),
            max_relative = 1e-12
        );
    }

    #[test]
    fn outward_photon_is_redshifted_in_the_comoving_frame() {
        let pos = Vec3::new(1e14, 0.0, 0.0);
        let dir = Vec3::new(1.0, 0.0, 0.0);
        let factor = doppler_nucmf_on_nurf(&pos, &dir, T, DopplerShiftScheme::NonRelativistic);
        assert!(factor < 1.0);
        assert_relative_eq!(factor, 1.0 - 1e14 / T / CLIGHT, max_relative = 1e-12);
    }

    #[test]
    fn aberration_preserves_unit_length_and_inverts() {
        let vel = Vec3::new(0.05 * CLIGHT, 0.02 * CLIGHT, -0.03 * CLIGHT);
        let dir = Vec3::new(2.0, -1.0, 0.5).normalized();
        let aberrated = angle_aberration(&dir, &vel);
        assert!((aberrated.length() - 1.0).abs() <= 1e-8);
        let back = angle_aberration(&aberrated, &(-vel));
        assert_relative_eq!(back.dot(&dir), 1.0, max_relative = 1e-10);
    }

    #[test]
    fn aberration_tilts_directions_towards_the_motion() {
        // an observer moving towards +x sees photons arrive from ahead
        let vel = Vec3::new(0.1 * CLIGHT, 0.0, 0.0);
        let dir = Vec3::new(0.0, 1.0, 0.0);
        let aberrated = angle_aberration(&dir, &vel);
        assert!(aberrated[0] < 0.0);
    }
}

//! Physical and mathematical constants in cgs units.

/// Floating-point precision to use for constants.
#[allow(non_camel_case_types)]
pub type fcn = f64;

// Physical constants

/// Speed of light in vacuum [cm/s].
pub const CLIGHT: fcn = 2.997_924_58e10;
/// Speed at which packets propagate through the grid [cm/s].
///
/// Identical to `CLIGHT`, but kept separate so that uses of the propagation
/// speed are distinguishable from frame-transform physics.
pub const CLIGHT_PROP: fcn = CLIGHT;
/// Speed of light squared [cm^2/s^2].
pub const CLIGHTSQUARED: fcn = CLIGHT * CLIGHT;
/// Planck constant [erg s].
pub const HPLANCK: fcn = 6.626_075_5e-27;
/// Boltzmann constant [erg/K].
pub const KBOLTZMANN: fcn = 1.380_658e-16;
/// Thomson cross-section [cm^2].
pub const SIGMA_T: fcn = 6.652_4e-25;
/// Electron mass [g].
pub const M_ELECTRON: fcn = 9.109_389_7e-28;

// Derived combinations appearing in the transport kernels

/// h / k_B [K s].
pub const H_OVER_KB: fcn = HPLANCK / KBOLTZMANN;
/// c^2 / 2h, converts Einstein A into stimulated-emission B coefficients.
pub const CLIGHTSQUARED_OVER_TWOH: fcn = CLIGHTSQUARED / 2. / HPLANCK;
/// h c / 4 pi [erg cm], Sobolev optical depth prefactor.
pub const HCLIGHT_OVER_FOURPI: fcn = HPLANCK * CLIGHT / 4. / std::f64::consts::PI;
/// Saha equation prefactor (h^2 / 2 pi m_e k_B)^(3/2) [cm^3 K^(3/2)].
pub const SAHACONST: fcn = 2.070_665_9e-16;
/// Free-free opacity prefactor [cgs].
pub const KAPPA_FF_COEFF: fcn = 3.692_55e8;

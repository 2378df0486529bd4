//! Monte Carlo radiative transfer tools for supernova and kilonova ejecta
//! in Rust.
//!
//! This crate implements the radiation-packet propagation core of a
//! time-dependent Monte Carlo radiative transfer engine: packets carrying a
//! frequency, direction, polarization state and comoving-frame energy are
//! advanced through a homologously expanding grid, resolving cell-boundary
//! crossings, time-step ends and physical interactions in distance order
//! while accumulating volume estimators of the radiation field.

#![allow(clippy::too_many_arguments)]

pub mod atomic;
pub mod constants;
pub mod error;
pub mod frames;
pub mod geometry;
pub mod grid;
pub mod packets;
pub mod random;
pub mod transport;

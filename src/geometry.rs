//! Geometric utility objects for packet transport.

use num::Float;
use std::{
    fmt,
    ops::{Add, Index, IndexMut, Mul, Neg, Sub},
};

#[cfg(feature = "serialization")]
use serde::Serialize;

/// Denotes the x-, y- or z-dimension.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dim3 {
    X = 0,
    Y = 1,
    Z = 2,
}

impl Dim3 {
    /// Creates an array for iterating over the x-, y- and z-dimensions.
    pub fn slice() -> [Self; 3] {
        [Self::X, Self::Y, Self::Z]
    }
}

impl fmt::Display for Dim3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::X => "x",
                Self::Y => "y",
                Self::Z => "z",
            }
        )
    }
}

/// A 3D vector.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serialization", derive(Serialize))]
pub struct Vec3<F>([F; 3]);

impl<F: Float> Vec3<F> {
    /// Creates a new 3D vector given the three components.
    pub fn new(x: F, y: F, z: F) -> Self {
        Self([x, y, z])
    }

    /// Creates a new vector with all components zero.
    pub fn zero() -> Self {
        Self([F::zero(); 3])
    }

    /// Creates a new unit vector along the given dimension.
    pub fn unit(dim: Dim3) -> Self {
        let mut components = [F::zero(); 3];
        components[dim as usize] = F::one();
        Self(components)
    }

    /// Computes the dot product with another vector.
    pub fn dot(&self, other: &Self) -> F {
        self.0[0] * other.0[0] + self.0[1] * other.0[1] + self.0[2] * other.0[2]
    }

    /// Computes the cross product with another vector.
    pub fn cross(&self, other: &Self) -> Self {
        Self([
            self.0[1] * other.0[2] - self.0[2] * other.0[1],
            self.0[2] * other.0[0] - self.0[0] * other.0[2],
            self.0[0] * other.0[1] - self.0[1] * other.0[0],
        ])
    }

    /// Computes the squared length of the vector.
    pub fn squared_length(&self) -> F {
        self.dot(self)
    }

    /// Computes the length of the vector.
    pub fn length(&self) -> F {
        self.squared_length().sqrt()
    }

    /// Returns the vector scaled to unit length.
    pub fn normalized(&self) -> Self {
        *self * (F::one() / self.length())
    }

    /// Returns the vector with every component multiplied by the given factor.
    pub fn scaled(&self, factor: F) -> Self {
        *self * factor
    }
}

impl<F: Float> Index<Dim3> for Vec3<F> {
    type Output = F;
    fn index(&self, dim: Dim3) -> &Self::Output {
        &self.0[dim as usize]
    }
}

impl<F: Float> IndexMut<Dim3> for Vec3<F> {
    fn index_mut(&mut self, dim: Dim3) -> &mut Self::Output {
        &mut self.0[dim as usize]
    }
}

impl<F: Float> Index<usize> for Vec3<F> {
    type Output = F;
    fn index(&self, idx: usize) -> &Self::Output {
        &self.0[idx]
    }
}

impl<F: Float> IndexMut<usize> for Vec3<F> {
    fn index_mut(&mut self, idx: usize) -> &mut Self::Output {
        &mut self.0[idx]
    }
}

impl<F: Float> Add for Vec3<F> {
    type Output = Self;
    fn add(self, other: Self) -> Self {
        Self([
            self.0[0] + other.0[0],
            self.0[1] + other.0[1],
            self.0[2] + other.0[2],
        ])
    }
}

impl<F: Float> Sub for Vec3<F> {
    type Output = Self;
    fn sub(self, other: Self) -> Self {
        Self([
            self.0[0] - other.0[0],
            self.0[1] - other.0[1],
            self.0[2] - other.0[2],
        ])
    }
}

impl<F: Float> Mul<F> for Vec3<F> {
    type Output = Self;
    fn mul(self, factor: F) -> Self {
        Self([self.0[0] * factor, self.0[1] * factor, self.0[2] * factor])
    }
}

impl<F: Float> Neg for Vec3<F> {
    type Output = Self;
    fn neg(self) -> Self {
        Self([-self.0[0], -self.0[1], -self.0[2]])
    }
}

impl<F: Float> From<[F; 3]> for Vec3<F> {
    fn from(components: [F; 3]) -> Self {
        Self(components)
    }
}

impl<F: Float + fmt::Display> fmt::Display for Vec3<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.0[0], self.0[1], self.0[2])
    }
}

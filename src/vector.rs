//! A small three dimensional vector type, plus the loosely-typed
//! [VectorInput] that configuration files and command lines hand us before
//! we know whether they actually describe a 3-vector.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Mul, Neg, Sub};

/// A point or direction in ℝ³.
#[derive(Debug, Default, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vec3 {
    pub const ZERO: Vec3 = Vec3::new(0.0, 0.0, 0.0);

    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// Builds a unit vector from an azimuth `theta` (measured from +x in the
    /// x-y plane) and a polar angle `phi` (measured from +z).
    pub fn from_spherical(theta: f64, phi: f64) -> Self {
        Self {
            x: phi.sin() * theta.cos(),
            y: phi.sin() * theta.sin(),
            z: phi.cos(),
        }
    }

    /// Returns `(theta, phi)`, the inverse of [Vec3::from_spherical] for unit
    /// vectors.
    pub fn to_spherical(&self) -> (f64, f64) {
        let r = self.norm();
        if r == 0.0 {
            return (0.0, 0.0);
        }
        let theta = self.y.atan2(self.x);
        let phi = (self.z / r).clamp(-1.0, 1.0).acos();
        (theta, phi)
    }

    pub fn dot(&self, other: &Self) -> f64 {
        self.x * other.x + self.y * other.y + self.z * other.z
    }

    pub fn cross(&self, other: &Self) -> Self {
        Self {
            x: self.y * other.z - self.z * other.y,
            y: self.z * other.x - self.x * other.z,
            z: self.x * other.y - self.y * other.x,
        }
    }

    pub fn norm(&self) -> f64 {
        self.dot(self).sqrt()
    }

    /// Scales the vector to unit length, or returns `None` if it has no
    /// length to speak of.
    pub fn normalized(&self) -> Option<Self> {
        let n = self.norm();
        if n > f64::EPSILON && n.is_finite() {
            Some(*self * (1.0 / n))
        } else {
            None
        }
    }

    pub fn abs_dist(&self, other: &Self) -> f64 {
        (*self - *other).norm()
    }

    pub fn to_array(self) -> [f64; 3] {
        [self.x, self.y, self.z]
    }
}

impl From<[f64; 3]> for Vec3 {
    fn from([x, y, z]: [f64; 3]) -> Self {
        Self { x, y, z }
    }
}

impl Add for Vec3 {
    type Output = Vec3;
    fn add(self, rhs: Vec3) -> Vec3 {
        Vec3::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl Sub for Vec3 {
    type Output = Vec3;
    fn sub(self, rhs: Vec3) -> Vec3 {
        Vec3::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

impl Mul<f64> for Vec3 {
    type Output = Vec3;
    fn mul(self, rhs: f64) -> Vec3 {
        Vec3::new(self.x * rhs, self.y * rhs, self.z * rhs)
    }
}

impl Neg for Vec3 {
    type Output = Vec3;
    fn neg(self) -> Vec3 {
        Vec3::new(-self.x, -self.y, -self.z)
    }
}

impl fmt::Display for Vec3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.3}, {:.3}, {:.3})", self.x, self.y, self.z)
    }
}

/// An array-like value of unknown shape. Configuration files are free to
/// write `[1, 2, 3]` or `[[1, 2, 3]]`; only the former is a vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VectorInput {
    /// A rank-1 list of components
    Flat(Vec<f64>),
    /// A rank-2 list of lists, never a valid vector
    Nested(Vec<Vec<f64>>),
}

impl VectorInput {
    /// Number of array dimensions.
    pub fn rank(&self) -> usize {
        match self {
            VectorInput::Flat(_) => 1,
            VectorInput::Nested(_) => 2,
        }
    }

    /// Shape of the input, outermost dimension first.
    pub fn shape(&self) -> Vec<usize> {
        match self {
            VectorInput::Flat(v) => vec![v.len()],
            VectorInput::Nested(rows) => {
                vec![rows.len(), rows.first().map_or(0, |r| r.len())]
            }
        }
    }
}

impl From<Vec3> for VectorInput {
    fn from(v: Vec3) -> Self {
        VectorInput::Flat(v.to_array().to_vec())
    }
}

impl From<&[f64]> for VectorInput {
    fn from(v: &[f64]) -> Self {
        VectorInput::Flat(v.to_vec())
    }
}

/// Why a [VectorInput] could not become a [Vec3].
#[derive(Debug, Clone, PartialEq)]
pub enum ShapeError {
    /// Right rank, wrong number of components
    WrongArity(usize),
    /// A matrix (or worse) where a vector was expected
    WrongRank(Vec<usize>),
}

impl fmt::Display for ShapeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShapeError::WrongArity(n) => write!(f, "expected 3 components, found {}", n),
            ShapeError::WrongRank(shape) => {
                write!(f, "expected a rank-1 vector, found shape {:?}", shape)
            }
        }
    }
}

impl std::error::Error for ShapeError {}

impl TryFrom<&VectorInput> for Vec3 {
    type Error = ShapeError;

    fn try_from(input: &VectorInput) -> Result<Self, Self::Error> {
        match input {
            VectorInput::Flat(v) => match v.as_slice() {
                &[x, y, z] => Ok(Vec3::new(x, y, z)),
                other => Err(ShapeError::WrongArity(other.len())),
            },
            nested => Err(ShapeError::WrongRank(nested.shape())),
        }
    }
}

impl TryFrom<VectorInput> for Vec3 {
    type Error = ShapeError;

    fn try_from(input: VectorInput) -> Result<Self, Self::Error> {
        Vec3::try_from(&input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cross_follows_right_hand_rule() {
        let x = Vec3::new(1.0, 0.0, 0.0);
        let y = Vec3::new(0.0, 1.0, 0.0);
        assert_eq!(x.cross(&y), Vec3::new(0.0, 0.0, 1.0));
        assert_eq!(y.cross(&Vec3::new(0.0, 0.0, 1.0)), x);
    }

    #[test]
    fn spherical_conversion() {
        let v = Vec3::from_spherical(std::f64::consts::FRAC_PI_2, std::f64::consts::FRAC_PI_2);
        assert!(v.abs_dist(&Vec3::new(0.0, 1.0, 0.0)) < 1e-12);
        let (theta, phi) = Vec3::new(-1.0, 0.0, 0.0).to_spherical();
        assert!((theta - std::f64::consts::PI).abs() < 1e-12);
        assert!((phi - std::f64::consts::FRAC_PI_2).abs() < 1e-12);
    }

    #[test]
    fn zero_has_no_direction() {
        assert_eq!(Vec3::ZERO.normalized(), None);
    }

    #[test]
    fn vector_input_shapes() {
        let flat = VectorInput::Flat(vec![1.0, 2.0, 3.0]);
        assert_eq!(Vec3::try_from(&flat), Ok(Vec3::new(1.0, 2.0, 3.0)));

        let short = VectorInput::Flat(vec![1.0, 2.0]);
        assert_eq!(Vec3::try_from(&short), Err(ShapeError::WrongArity(2)));

        let nested = VectorInput::Nested(vec![vec![1.0, 2.0, 3.0]]);
        assert_eq!(nested.rank(), 2);
        assert_eq!(Vec3::try_from(&nested), Err(ShapeError::WrongRank(vec![1, 3])));
    }

    #[test]
    fn vector_input_from_ron() {
        let flat: VectorInput = ron::from_str("[0.0, -1.0, 0.0]").unwrap();
        assert_eq!(flat.rank(), 1);
        let nested: VectorInput = ron::from_str("[[0.0, -1.0, 0.0]]").unwrap();
        assert_eq!(nested.rank(), 2);
    }
}

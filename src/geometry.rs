//! Source planes: the flat surfaces (walls, floors) a tracked source is
//! assumed to live on. A [SourcePlane] only knows how to intersect rays, an
//! [OrientedSourcePlane] also carries an in-plane 2D basis so that points on
//! it can be expressed as `(u, v)` plane coordinates.

use crate::vector::{ShapeError, Vec3, VectorInput};
use std::fmt;

/// Relative tolerance under which a ray is considered parallel to a plane.
const PARALLEL_TOLERANCE: f64 = 1e-12;

/// Things that go wrong while building or querying a plane.
#[derive(Debug, Clone, PartialEq)]
pub enum GeometryError {
    /// A named input was not a rank-1, 3 component vector
    InvalidVector {
        /// Which argument was malformed
        name: &'static str,
        /// What was wrong with it
        reason: ShapeError,
    },
    /// The plane normal has zero length
    ZeroNormal,
    /// The up vector of an oriented plane is parallel to its normal
    DegenerateUp,
    /// The queried ray never meets the plane
    ParallelRay,
}

impl fmt::Display for GeometryError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            GeometryError::InvalidVector { name, reason } => {
                write!(f, "invalid {}: {}", name, reason)
            }
            GeometryError::ZeroNormal => write!(f, "plane normal has zero length"),
            GeometryError::DegenerateUp => write!(f, "up vector is parallel to the plane normal"),
            GeometryError::ParallelRay => write!(f, "ray is parallel to the plane"),
        }
    }
}

impl std::error::Error for GeometryError {}

/// Validates a loosely typed input as a 3-vector, naming it on failure.
pub fn require_vec3(name: &'static str, input: &VectorInput) -> Result<Vec3, GeometryError> {
    Vec3::try_from(input).map_err(|reason| GeometryError::InvalidVector { name, reason })
}

/// The capability shared by every plane kind.
pub trait Intersect {
    /// The plane normal, not necessarily of unit length.
    fn normal(&self) -> Vec3;

    /// A point lying on the plane.
    fn offset(&self) -> Vec3;

    /// Finds where the line `line_origin + t * direction` meets the plane.
    /// `t` is unrestricted, so the result may lie "behind" the origin, and
    /// the plane is treated as infinite.
    fn line_intersection(&self, direction: Vec3, line_origin: Vec3) -> Result<Vec3, GeometryError> {
        let normal = self.normal();
        let denom = normal.dot(&direction);
        if denom.abs() <= PARALLEL_TOLERANCE * normal.norm() * direction.norm() {
            return Err(GeometryError::ParallelRay);
        }
        let t = -normal.dot(&(line_origin - self.offset())) / denom;
        Ok(line_origin + direction * t)
    }

    /// Signed distance-like residual `normal · (point - offset)`; zero on the
    /// plane.
    fn residual(&self, point: Vec3) -> f64 {
        self.normal().dot(&(point - self.offset()))
    }
}

/// An infinite plane given by a normal and a point on it.
#[derive(Debug, Clone, PartialEq)]
pub struct SourcePlane {
    normal: Vec3,
    offset: Vec3,
}

impl SourcePlane {
    /// Builds a plane from already typed vectors. Only a zero normal is
    /// rejected here, shape was settled by the type system.
    pub fn new(normal: Vec3, offset: Vec3) -> Result<Self, GeometryError> {
        if normal.normalized().is_none() {
            return Err(GeometryError::ZeroNormal);
        }
        Ok(Self { normal, offset })
    }

    /// Builds a plane from loosely typed input, validating arity and rank
    /// before any geometry is attempted.
    pub fn from_input(normal: &VectorInput, offset: &VectorInput) -> Result<Self, GeometryError> {
        let normal = require_vec3("normal", normal)?;
        let offset = require_vec3("offset", offset)?;
        Self::new(normal, offset)
    }
}

impl Intersect for SourcePlane {
    fn normal(&self) -> Vec3 {
        self.normal
    }

    fn offset(&self) -> Vec3 {
        self.offset
    }
}

/// A [SourcePlane] with an in-plane orthonormal basis `(right, up)`, where
/// `right = normal × up`.
#[derive(Debug, Clone, PartialEq)]
pub struct OrientedSourcePlane {
    plane: SourcePlane,
    right: Vec3,
    up: Vec3,
}

impl OrientedSourcePlane {
    /// Builds an oriented plane. `up` must not be parallel to `normal`; if it
    /// leans out of the plane, its in-plane component is used.
    pub fn new(normal: Vec3, up: Vec3, offset: Vec3) -> Result<Self, GeometryError> {
        let plane = SourcePlane::new(normal, offset)?;
        let unit_normal = normal.normalized().ok_or(GeometryError::ZeroNormal)?;
        let in_plane_up = up - unit_normal * unit_normal.dot(&up);
        let up = in_plane_up.normalized().ok_or(GeometryError::DegenerateUp)?;
        let right = unit_normal
            .cross(&up)
            .normalized()
            .ok_or(GeometryError::DegenerateUp)?;
        Ok(Self { plane, right, up })
    }

    /// Same as [OrientedSourcePlane::new], from loosely typed input.
    pub fn from_input(
        normal: &VectorInput,
        up: &VectorInput,
        offset: &VectorInput,
    ) -> Result<Self, GeometryError> {
        let normal = require_vec3("normal", normal)?;
        let up = require_vec3("up", up)?;
        let offset = require_vec3("offset", offset)?;
        Self::new(normal, up, offset)
    }

    pub fn right(&self) -> Vec3 {
        self.right
    }

    pub fn up(&self) -> Vec3 {
        self.up
    }

    /// Expresses a world point in plane coordinates. Points off the plane
    /// are projected onto it first.
    pub fn to_plane_coords(&self, world: Vec3) -> (f64, f64) {
        let rel = world - self.plane.offset;
        (rel.dot(&self.right), rel.dot(&self.up))
    }

    /// Inverse of [OrientedSourcePlane::to_plane_coords].
    pub fn to_world(&self, u: f64, v: f64) -> Vec3 {
        self.plane.offset + self.right * u + self.up * v
    }
}

impl Intersect for OrientedSourcePlane {
    fn normal(&self) -> Vec3 {
        self.plane.normal
    }

    fn offset(&self) -> Vec3 {
        self.plane.offset
    }
}

/// Either kind of plane, as stored by the search space.
#[derive(Debug, Clone, PartialEq)]
pub enum Surface {
    Plain(SourcePlane),
    Oriented(OrientedSourcePlane),
}

impl Surface {
    /// The oriented plane, if this surface has a 2D basis.
    pub fn as_oriented(&self) -> Option<&OrientedSourcePlane> {
        match self {
            Surface::Plain(_) => None,
            Surface::Oriented(p) => Some(p),
        }
    }
}

impl Intersect for Surface {
    fn normal(&self) -> Vec3 {
        match self {
            Surface::Plain(p) => p.normal(),
            Surface::Oriented(p) => p.normal(),
        }
    }

    fn offset(&self) -> Vec3 {
        match self {
            Surface::Plain(p) => p.offset(),
            Surface::Oriented(p) => p.offset(),
        }
    }
}

impl From<SourcePlane> for Surface {
    fn from(p: SourcePlane) -> Self {
        Surface::Plain(p)
    }
}

impl From<OrientedSourcePlane> for Surface {
    fn from(p: OrientedSourcePlane) -> Self {
        Surface::Oriented(p)
    }
}

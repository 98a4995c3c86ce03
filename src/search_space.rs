//! The search space ties the microphone array to the physical world: where
//! the array sits, which way it faces, and which planes a source may be
//! found on. Directions coming out of the tracker live in the microphone's
//! own frame; the search space rotates them into the world and drops them
//! onto a plane.
//!
//! The microphone frame is right handed with its y axis along `forward`,
//! its z axis along `above` and its x axis along `forward × above`.

use crate::geometry::{GeometryError, Intersect, Surface};
use crate::vector::Vec3;
use std::f64::consts::{FRAC_PI_2, PI};
use std::fmt;

/// Things that go wrong when building or querying a [SearchSpace].
#[derive(Debug, Clone, PartialEq)]
pub enum SearchSpaceError {
    /// `forward` and `above` do not span a plane
    DegenerateFrame,
    /// No plane was supplied
    NoPlanes,
    /// A plane index past the end of the plane list
    NoSuchPlane(usize),
    /// The plane exists but has no 2D basis
    NotOriented(usize),
    /// The underlying plane query failed
    Geometry(GeometryError),
}

impl fmt::Display for SearchSpaceError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SearchSpaceError::DegenerateFrame => {
                write!(f, "microphone forward and above vectors are parallel")
            }
            SearchSpaceError::NoPlanes => write!(f, "search space has no source planes"),
            SearchSpaceError::NoSuchPlane(i) => write!(f, "no source plane with index {}", i),
            SearchSpaceError::NotOriented(i) => write!(f, "source plane {} is not oriented", i),
            SearchSpaceError::Geometry(e) => write!(f, "geometry error: {}", e),
        }
    }
}

impl std::error::Error for SearchSpaceError {}

impl From<GeometryError> for SearchSpaceError {
    fn from(value: GeometryError) -> Self {
        Self::Geometry(value)
    }
}

/// A spherical grid coordinate: azimuth `theta` and polar angle `phi`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SphericalCoord {
    pub theta: f64,
    pub phi: f64,
}

/// Microphone and camera placement plus the candidate source planes.
#[derive(Debug, Clone)]
pub struct SearchSpace {
    mic_loc: Vec3,
    camera_loc: Vec3,
    planes: Vec<Surface>,
    // columns of the mic-to-world rotation
    mic_x: Vec3,
    mic_y: Vec3,
    mic_z: Vec3,
}

impl SearchSpace {
    pub fn new(
        mic_loc: Vec3,
        camera_loc: Vec3,
        planes: Vec<Surface>,
        mic_forward: Vec3,
        mic_above: Vec3,
    ) -> Result<Self, SearchSpaceError> {
        if planes.is_empty() {
            return Err(SearchSpaceError::NoPlanes);
        }
        let mic_y = mic_forward
            .normalized()
            .ok_or(SearchSpaceError::DegenerateFrame)?;
        // Gram-Schmidt, so a slightly tilted `above` still yields a rotation
        let mic_z = (mic_above - mic_y * mic_y.dot(&mic_above))
            .normalized()
            .ok_or(SearchSpaceError::DegenerateFrame)?;
        let mic_x = mic_y.cross(&mic_z);
        Ok(Self {
            mic_loc,
            camera_loc,
            planes,
            mic_x,
            mic_y,
            mic_z,
        })
    }

    pub fn mic_loc(&self) -> Vec3 {
        self.mic_loc
    }

    pub fn camera_loc(&self) -> Vec3 {
        self.camera_loc
    }

    pub fn planes(&self) -> &[Surface] {
        &self.planes
    }

    pub fn plane(&self, index: usize) -> Result<&Surface, SearchSpaceError> {
        self.planes
            .get(index)
            .ok_or(SearchSpaceError::NoSuchPlane(index))
    }

    /// Rotates a direction from the microphone frame into the world frame.
    pub fn mic_to_world(&self, direction: Vec3) -> Vec3 {
        self.mic_x * direction.x + self.mic_y * direction.y + self.mic_z * direction.z
    }

    /// Rotates a world direction into the microphone frame.
    pub fn world_to_mic(&self, direction: Vec3) -> Vec3 {
        Vec3::new(
            self.mic_x.dot(&direction),
            self.mic_y.dot(&direction),
            self.mic_z.dot(&direction),
        )
    }

    /// Where a ray leaving the microphone along `mic_direction` (in the
    /// microphone frame) hits plane `plane_index`.
    pub fn direction_to_location(
        &self,
        mic_direction: Vec3,
        plane_index: usize,
    ) -> Result<Vec3, SearchSpaceError> {
        let plane = self.plane(plane_index)?;
        let world_dir = self.mic_to_world(mic_direction);
        Ok(plane.line_intersection(world_dir, self.mic_loc)?)
    }

    /// Like [SearchSpace::direction_to_location], but expressed in the 2D
    /// coordinates of an oriented plane.
    pub fn direction_to_plane_coords(
        &self,
        mic_direction: Vec3,
        plane_index: usize,
    ) -> Result<(f64, f64), SearchSpaceError> {
        let oriented = self
            .plane(plane_index)?
            .as_oriented()
            .ok_or(SearchSpaceError::NotOriented(plane_index))?;
        let location = self.direction_to_location(mic_direction, plane_index)?;
        Ok(oriented.to_plane_coords(location))
    }

    /// The spherical coordinates of the direction grid, in grid order.
    ///
    /// The grid is always `n_phi` rows of `n_theta`. With `n_phi > 1` the
    /// first and last rows sit on the poles, so each holds `n_theta` copies
    /// of one direction. Lookups resolve those ties to the first index in
    /// the row.
    pub fn spherical_grid(n_theta: usize, n_phi: usize) -> Vec<SphericalCoord> {
        let phis: Vec<f64> = if n_phi == 1 {
            vec![FRAC_PI_2]
        } else {
            linspace(0.0, PI, n_phi)
        };
        let thetas = linspace(0.0, PI, n_theta);
        phis.iter()
            .flat_map(|&phi| thetas.iter().map(move |&theta| SphericalCoord { theta, phi }))
            .collect()
    }

    /// Candidate unit directions, microphone frame, `phi` major. Always the
    /// same grid for the same arguments.
    pub fn enumerate_directions(n_theta: usize, n_phi: usize) -> Vec<Vec3> {
        Self::spherical_grid(n_theta, n_phi)
            .into_iter()
            .map(|c| Vec3::from_spherical(c.theta, c.phi))
            .collect()
    }
}

/// `n` evenly spaced points from `start` to `end` inclusive.
fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    match n {
        0 => vec![],
        1 => vec![start],
        _ => {
            let step = (end - start) / (n - 1) as f64;
            (0..n).map(|i| start + step * i as f64).collect()
        }
    }
}

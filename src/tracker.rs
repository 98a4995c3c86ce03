//! A particle filter that tracks the direction of a single sound source.
//!
//! Each particle is a unit direction in the microphone frame. Every step
//! the particles are diffused with a von Mises kernel (the motion model),
//! reweighted against the latest observation, and resampled once their
//! weights have collapsed. The observation is the grid direction with the
//! most steered power, and its likelihood is a mixture of a von Mises bump
//! around that direction and a uniform floor. The floor soaks up frames
//! where the loudest direction is a reflection or nothing at all.
//!
//! Directions are folded into the front half space (`y >= 0` in the
//! microphone frame), which is all the direction grid covers.

use crate::search_space::{SearchSpace, SearchSpaceError, SphericalCoord};
use crate::spectrum::SpectralFrame;
use crate::vector::Vec3;
use crate::von_mises;
use log::warn;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustfft::num_complex::Complex64;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::fmt;
use std::sync::Arc;

/// Speed of sound in air at room temperature, m/s.
pub const SPEED_OF_SOUND: f64 = 343.0;

const EPS: f64 = 1e-12;

/// Which per-direction feature to compute from a spectral frame.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureKind {
    /// Steered response power of the aligned channel sum
    Srp,
    /// Steered response power after whitening each bin (GCC-PHAT)
    #[default]
    Gcc,
}

/// When to resample the particle set.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ResamplePolicy {
    /// After every step
    EveryStep,
    /// When the effective sample size falls below this fraction of the
    /// particle count
    EffectiveSampleSize(f64),
}

impl Default for ResamplePolicy {
    fn default() -> Self {
        ResamplePolicy::EffectiveSampleSize(0.5)
    }
}

/// The tunable parameters of a [VonMisesTracker].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerParams {
    pub n_particles: usize,
    /// Concentration of the motion model; higher is a slower source
    pub state_kappa: f64,
    /// Concentration of the observation likelihood
    pub observation_kappa: f64,
    /// Weight of the uniform component of the observation likelihood
    pub outlier_prob: f64,
    pub n_theta: usize,
    pub n_phi: usize,
    pub speed_of_sound: f64,
    pub feature: FeatureKind,
    pub resample: ResamplePolicy,
    /// Seed for the particle RNG; entropy when absent
    pub seed: Option<u64>,
}

impl Default for TrackerParams {
    fn default() -> Self {
        Self {
            n_particles: 80,
            state_kappa: 40.0,
            observation_kappa: 50.0,
            outlier_prob: 0.0,
            n_theta: 100,
            n_phi: 1,
            speed_of_sound: SPEED_OF_SOUND,
            feature: FeatureKind::Gcc,
            resample: ResamplePolicy::default(),
            seed: None,
        }
    }
}

/// Things that go wrong when building or stepping a tracker.
#[derive(Debug, Clone, PartialEq)]
pub enum TrackerError {
    /// A parameter is out of its valid range
    InvalidParams(&'static str),
    /// A spectral frame does not match the array or the DFT size
    FrameShape {
        expected_channels: usize,
        channels: usize,
        expected_bins: usize,
        bins: usize,
    },
    /// A feature or grid array has the wrong length
    GridLength { expected: usize, found: usize },
    /// Mapping the estimate onto the search space failed
    SearchSpace(SearchSpaceError),
}

impl fmt::Display for TrackerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TrackerError::InvalidParams(what) => write!(f, "invalid tracker parameters: {}", what),
            TrackerError::FrameShape {
                expected_channels,
                channels,
                expected_bins,
                bins,
            } => write!(
                f,
                "expected a frame of {} channels x {} bins, got {} x {}",
                expected_channels, expected_bins, channels, bins
            ),
            TrackerError::GridLength { expected, found } => {
                write!(f, "expected {} grid values, got {}", expected, found)
            }
            TrackerError::SearchSpace(e) => write!(f, "search space error: {}", e),
        }
    }
}

impl std::error::Error for TrackerError {}

impl From<SearchSpaceError> for TrackerError {
    fn from(value: SearchSpaceError) -> Self {
        Self::SearchSpace(value)
    }
}

/// Phase factors that undo each microphone's propagation delay for one
/// look direction, laid out channel major.
#[derive(Debug, Clone)]
pub struct AlignmentMatrix {
    factors: Vec<Complex64>,
    n_bins: usize,
}

impl AlignmentMatrix {
    /// Factor for `channel` at frequency bin `bin`.
    pub fn get(&self, channel: usize, bin: usize) -> Complex64 {
        self.factors[channel * self.n_bins + bin]
    }

    pub fn channel(&self, channel: usize) -> &[Complex64] {
        &self.factors[channel * self.n_bins..(channel + 1) * self.n_bins]
    }

    pub fn n_bins(&self) -> usize {
        self.n_bins
    }
}

/// A weighted set of direction particles.
#[derive(Debug, Clone, PartialEq)]
pub struct ParticleSet {
    particles: Vec<Vec3>,
    weights: Vec<f64>,
}

impl ParticleSet {
    /// Uniformly weighted particles.
    pub fn uniform(particles: Vec<Vec3>) -> Self {
        let n = particles.len();
        Self {
            particles,
            weights: vec![1.0 / n as f64; n],
        }
    }

    pub fn len(&self) -> usize {
        self.particles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.particles.is_empty()
    }

    pub fn particles(&self) -> &[Vec3] {
        &self.particles
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    /// `1 / sum(w^2)`: `N` for uniform weights, 1 when one particle holds
    /// all the mass.
    pub fn effective_sample_size(&self) -> f64 {
        let sum_sq: f64 = self.weights.iter().map(|w| w * w).sum();
        if sum_sq > 0.0 {
            1.0 / sum_sq
        } else {
            0.0
        }
    }

    /// Weighted mean direction, renormalized. Falls back to the heaviest
    /// particle when the mean cancels out.
    pub fn estimate(&self) -> Vec3 {
        let mean = self
            .particles
            .iter()
            .zip(&self.weights)
            .fold(Vec3::ZERO, |acc, (p, &w)| acc + *p * w);
        mean.normalized().unwrap_or_else(|| {
            self.weights
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(b.1))
                .map_or(Vec3::new(0.0, 1.0, 0.0), |(i, _)| self.particles[i])
        })
    }

    /// Rescales the weights to sum to one. Degenerate weights (all zero,
    /// negative or not finite) are replaced by a uniform distribution.
    /// Returns false when that reset happened.
    fn normalize(&mut self) -> bool {
        let total: f64 = self.weights.iter().sum();
        let sane = total.is_finite()
            && total > 0.0
            && self.weights.iter().all(|w| w.is_finite() && *w >= 0.0);
        if sane {
            self.weights.iter_mut().for_each(|w| *w /= total);
        } else {
            let n = self.weights.len() as f64;
            self.weights.iter_mut().for_each(|w| *w = 1.0 / n);
        }
        sane
    }

    /// Systematic resampling. Keeps the particle count and leaves every
    /// weight at `1 / N`.
    fn resample<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        let n = self.particles.len();
        if n == 0 {
            return;
        }
        let step = 1.0 / n as f64;
        let mut target = rng.gen::<f64>() * step;
        let mut cumulative = self.weights[0];
        let mut source = 0;
        let mut drawn = Vec::with_capacity(n);
        for _ in 0..n {
            while cumulative <= target && source < n - 1 {
                source += 1;
                cumulative += self.weights[source];
            }
            drawn.push(self.particles[source]);
            target += step;
        }
        self.particles = drawn;
        self.weights.iter_mut().for_each(|w| *w = step);
    }
}

/// Builder for [VonMisesTracker].
#[derive(Debug, Clone)]
pub struct VonMisesTrackerBuilder {
    space: Arc<SearchSpace>,
    mic_positions: Vec<Vec3>,
    params: TrackerParams,
    dft_len: usize,
    sample_rate: u32,
}

impl VonMisesTrackerBuilder {
    fn new(space: Arc<SearchSpace>) -> Self {
        Self {
            space,
            mic_positions: Vec::new(),
            params: TrackerParams::default(),
            dft_len: 2048,
            sample_rate: 44100,
        }
    }

    /// Microphone positions in the microphone frame, in channel order.
    pub fn mic_positions(mut self, mic_positions: Vec<Vec3>) -> Self {
        self.mic_positions = mic_positions;
        self
    }

    pub fn params(mut self, params: TrackerParams) -> Self {
        self.params = params;
        self
    }

    pub fn outlier_prob(mut self, outlier_prob: f64) -> Self {
        self.params.outlier_prob = outlier_prob;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.params.seed = Some(seed);
        self
    }

    pub fn dft_len(mut self, dft_len: usize) -> Self {
        self.dft_len = dft_len;
        self
    }

    pub fn sample_rate(mut self, sample_rate: u32) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    pub fn build(self) -> Result<VonMisesTracker, TrackerError> {
        let p = &self.params;
        if self.mic_positions.is_empty() {
            return Err(TrackerError::InvalidParams("no microphones"));
        }
        if p.n_particles == 0 {
            return Err(TrackerError::InvalidParams("particle count must be positive"));
        }
        if p.n_theta == 0 || p.n_phi == 0 {
            return Err(TrackerError::InvalidParams("direction grid must be non-empty"));
        }
        if !(0.0..=1.0).contains(&p.outlier_prob) {
            return Err(TrackerError::InvalidParams("outlier_prob must lie in [0, 1]"));
        }
        if !(p.state_kappa >= 0.0 && p.observation_kappa >= 0.0) {
            return Err(TrackerError::InvalidParams("kappas must be non-negative"));
        }
        if self.dft_len < 2 || self.sample_rate == 0 {
            return Err(TrackerError::InvalidParams("dft_len and sample_rate must be positive"));
        }
        if p.speed_of_sound <= 0.0 {
            return Err(TrackerError::InvalidParams("speed of sound must be positive"));
        }
        if let ResamplePolicy::EffectiveSampleSize(f) = p.resample {
            if !(0.0..=1.0).contains(&f) {
                return Err(TrackerError::InvalidParams("resample threshold must lie in [0, 1]"));
            }
        }

        let spher_directions = SearchSpace::spherical_grid(p.n_theta, p.n_phi);
        let directions = SearchSpace::enumerate_directions(p.n_theta, p.n_phi);
        let align_mats = directions
            .iter()
            .map(|d| {
                alignment_matrix(
                    d,
                    &self.mic_positions,
                    self.dft_len,
                    self.sample_rate,
                    p.speed_of_sound,
                )
            })
            .collect();

        // spread the initial particles evenly over the grid
        let n_dirs = directions.len();
        let initial = (0..p.n_particles)
            .map(|i| directions[i * n_dirs / p.n_particles])
            .collect();

        let rng = match p.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Ok(VonMisesTracker {
            space: self.space,
            mic_positions: self.mic_positions,
            n_bins: self.dft_len / 2 + 1,
            dft_len: self.dft_len,
            sample_rate: self.sample_rate,
            directions,
            spher_directions,
            align_mats,
            particles: ParticleSet::uniform(initial),
            rng,
            params: self.params,
            steps: 0,
        })
    }
}

/// Phase factors `exp(-j 2 pi f (r . d) / c)` for look direction `d`.
fn alignment_matrix(
    direction: &Vec3,
    mic_positions: &[Vec3],
    dft_len: usize,
    sample_rate: u32,
    speed_of_sound: f64,
) -> AlignmentMatrix {
    let n_bins = dft_len / 2 + 1;
    let factors = mic_positions
        .iter()
        .flat_map(|r| {
            let lead = r.dot(direction) / speed_of_sound;
            (0..n_bins).map(move |k| {
                let freq = k as f64 * sample_rate as f64 / dft_len as f64;
                Complex64::from_polar(1.0, -2.0 * PI * freq * lead)
            })
        })
        .collect();
    AlignmentMatrix { factors, n_bins }
}

/// Index of the first largest value, or 0 for an empty iterator.
fn first_max(values: impl Iterator<Item = f64>) -> usize {
    let mut best = (0, f64::NEG_INFINITY);
    for (i, v) in values.enumerate() {
        if v > best.1 {
            best = (i, v);
        }
    }
    best.0
}

/// Keeps a direction on the side of the array the grid covers.
fn fold_front(v: Vec3) -> Vec3 {
    Vec3::new(v.x, v.y.abs(), v.z)
}

/// The von Mises particle filter.
#[derive(Debug)]
pub struct VonMisesTracker {
    space: Arc<SearchSpace>,
    mic_positions: Vec<Vec3>,
    params: TrackerParams,
    dft_len: usize,
    sample_rate: u32,
    n_bins: usize,
    directions: Vec<Vec3>,
    spher_directions: Vec<SphericalCoord>,
    align_mats: Vec<AlignmentMatrix>,
    particles: ParticleSet,
    rng: StdRng,
    steps: u64,
}

impl VonMisesTracker {
    /// Make a [VonMisesTrackerBuilder] tracking sources in `space`.
    pub fn builder(space: Arc<SearchSpace>) -> VonMisesTrackerBuilder {
        VonMisesTrackerBuilder::new(space)
    }

    pub fn params(&self) -> &TrackerParams {
        &self.params
    }

    pub fn search_space(&self) -> &SearchSpace {
        &self.space
    }

    pub fn mic_positions(&self) -> &[Vec3] {
        &self.mic_positions
    }

    pub fn dft_len(&self) -> usize {
        self.dft_len
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Number of filter steps taken so far.
    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// The direction grid, microphone frame, in grid order.
    pub fn get_directions(&self) -> &[Vec3] {
        &self.directions
    }

    /// The direction grid as spherical coordinates.
    pub fn get_spher_directions(&self) -> &[SphericalCoord] {
        &self.spher_directions
    }

    /// One alignment matrix per grid direction, for steering a beamformer.
    pub fn get_pos_align_mat(&self) -> &[AlignmentMatrix] {
        &self.align_mats
    }

    /// The current posterior.
    pub fn particles(&self) -> &ParticleSet {
        &self.particles
    }

    fn is_planar(&self) -> bool {
        self.params.n_phi == 1
    }

    fn check_frame(&self, frame: &SpectralFrame) -> Result<(), TrackerError> {
        if frame.n_channels() != self.mic_positions.len()
            || frame.n_bins() != self.n_bins
            || !frame.is_rectangular()
        {
            return Err(TrackerError::FrameShape {
                expected_channels: self.mic_positions.len(),
                channels: frame.n_channels(),
                expected_bins: self.n_bins,
                bins: frame.n_bins(),
            });
        }
        Ok(())
    }

    /// Steered power of `frame` in every grid direction.
    pub fn features(
        &self,
        frame: &SpectralFrame,
        kind: FeatureKind,
    ) -> Result<Vec<f64>, TrackerError> {
        self.check_frame(frame)?;
        let whitened: Vec<Vec<Complex64>>;
        let channels: &[Vec<Complex64>] = match kind {
            FeatureKind::Srp => frame.channels(),
            FeatureKind::Gcc => {
                whitened = frame
                    .channels()
                    .iter()
                    .map(|ch| {
                        ch.iter()
                            .map(|c| {
                                let mag = c.norm();
                                if mag > EPS {
                                    c / mag
                                } else {
                                    Complex64::new(0.0, 0.0)
                                }
                            })
                            .collect()
                    })
                    .collect();
                &whitened
            }
        };

        let features = self
            .align_mats
            .iter()
            .map(|align| {
                let power: f64 = (0..self.n_bins)
                    .map(|k| {
                        channels
                            .iter()
                            .enumerate()
                            .map(|(m, ch)| ch[k] * align.get(m, k))
                            .sum::<Complex64>()
                            .norm_sqr()
                    })
                    .sum();
                power / self.n_bins as f64
            })
            .collect();
        Ok(features)
    }

    /// The normalized feature over the direction grid together with the
    /// frame energy. Leaves the filter untouched.
    pub fn get_distribution_real(
        &self,
        frame: &SpectralFrame,
        kind: FeatureKind,
    ) -> Result<(Vec<f64>, f64), TrackerError> {
        let features = self.features(frame, kind)?;
        let min = features.iter().copied().fold(f64::INFINITY, f64::min);
        let shifted: Vec<f64> = features.iter().map(|f| f - min).collect();
        let total: f64 = shifted.iter().sum();
        let dist = if total > EPS && total.is_finite() {
            shifted.iter().map(|f| f / total).collect()
        } else {
            vec![1.0 / shifted.len() as f64; shifted.len()]
        };
        Ok((dist, frame.energy()))
    }

    /// Runs one predict / weight / resample step on `frame` and returns the
    /// posterior.
    pub fn get_distribution(
        &mut self,
        frame: &SpectralFrame,
    ) -> Result<&ParticleSet, TrackerError> {
        let features = self.features(frame, self.params.feature)?;
        self.update_features(&features)
    }

    /// Runs one filter step on a precomputed per-direction feature.
    pub fn update_features(&mut self, features: &[f64]) -> Result<&ParticleSet, TrackerError> {
        if features.len() != self.directions.len() {
            return Err(TrackerError::GridLength {
                expected: self.directions.len(),
                found: features.len(),
            });
        }
        self.predict();

        if !features.is_empty() {
            let mu = self.directions[first_max(features.iter().copied())];
            self.weight(&mu);
        }

        if !self.particles.normalize() {
            warn!(
                "particle weights degenerated at step {}, reset to uniform",
                self.steps
            );
        }
        let resample = match self.params.resample {
            ResamplePolicy::EveryStep => true,
            ResamplePolicy::EffectiveSampleSize(fraction) => {
                self.particles.effective_sample_size() < fraction * self.particles.len() as f64
            }
        };
        if resample {
            self.particles.resample(&mut self.rng);
        }
        self.steps += 1;
        Ok(&self.particles)
    }

    /// Diffuses every particle with the motion model.
    fn predict(&mut self) {
        let kappa = self.params.state_kappa;
        let planar = self.is_planar();
        let rng = &mut self.rng;
        for p in self.particles.particles.iter_mut() {
            let moved = if planar {
                let (theta, _) = p.to_spherical();
                let theta = theta + von_mises::sample_circular(rng, kappa);
                Vec3::from_spherical(theta, PI / 2.0)
            } else {
                von_mises::sample_spherical(rng, p, kappa)
            };
            *p = fold_front(moved);
        }
    }

    /// Multiplies each weight by the observation likelihood around `mu`.
    fn weight(&mut self, mu: &Vec3) {
        let likelihoods: Vec<f64> = self
            .particles
            .particles
            .iter()
            .map(|p| self.likelihood(p, mu))
            .collect();
        for (w, l) in self.particles.weights.iter_mut().zip(likelihoods) {
            *w *= l;
        }
    }

    /// Observation likelihood of a source at `p` given the loudest grid
    /// direction `mu`. Both terms are densities over the front half of the
    /// circle (planar grid) or the sphere.
    fn likelihood(&self, p: &Vec3, mu: &Vec3) -> f64 {
        let kappa = self.params.observation_kappa;
        let outlier = self.params.outlier_prob;
        let (inlier, uniform) = if self.is_planar() {
            let (theta, _) = p.to_spherical();
            let (mu_theta, _) = mu.to_spherical();
            (
                von_mises::circular_density(theta - mu_theta, kappa),
                2.0 * von_mises::circular_uniform(),
            )
        } else {
            (
                von_mises::spherical_density(p, mu, kappa),
                2.0 * von_mises::spherical_uniform(),
            )
        };
        (1.0 - outlier) * inlier + outlier * uniform
    }

    /// Grid index of the direction closest to `direction`. Ties, such as
    /// the repeated pole directions, go to the lowest index.
    pub fn nearest_index(&self, direction: &Vec3) -> usize {
        first_max(self.directions.iter().map(|d| d.dot(direction)))
    }

    /// Grid index nearest the current estimate, for steering a beamformer.
    pub fn estimate_index(&self) -> usize {
        self.nearest_index(&self.particles.estimate())
    }

    /// The posterior binned onto the direction grid.
    pub fn posterior_grid(&self) -> Vec<f64> {
        let mut grid = vec![0.0; self.directions.len()];
        for (p, w) in self.particles.particles().iter().zip(self.particles.weights()) {
            grid[self.nearest_index(p)] += w;
        }
        grid
    }

    /// Where the current estimate lands on source plane `plane_index`.
    pub fn estimate_location(&self, plane_index: usize) -> Result<Vec3, TrackerError> {
        Ok(self
            .space
            .direction_to_location(self.particles.estimate(), plane_index)?)
    }

    /// Reshapes grid-ordered values into `n_phi` rows of `n_theta` values.
    pub fn to_spher_grid(&self, values: &[f64]) -> Result<Vec<Vec<f64>>, TrackerError> {
        if values.len() != self.directions.len() {
            return Err(TrackerError::GridLength {
                expected: self.directions.len(),
                found: values.len(),
            });
        }
        Ok(values
            .chunks(self.params.n_theta)
            .map(<[f64]>::to_vec)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::OrientedSourcePlane;

    fn space() -> Arc<SearchSpace> {
        let wall = OrientedSourcePlane::new(
            Vec3::new(0.0, -1.0, 0.0),
            Vec3::new(0.0, 0.0, 1.0),
            Vec3::new(0.0, 1.0, 0.0),
        )
        .unwrap();
        Arc::new(
            SearchSpace::new(
                Vec3::ZERO,
                Vec3::ZERO,
                vec![wall.into()],
                Vec3::new(0.0, 1.0, 0.0),
                Vec3::new(0.0, 0.0, 1.0),
            )
            .unwrap(),
        )
    }

    fn mics() -> Vec<Vec3> {
        [0.03, -0.01, 0.01, -0.03]
            .iter()
            .map(|&x| Vec3::new(x, 0.0, 0.0))
            .collect()
    }

    fn tracker(outlier_prob: f64, seed: u64) -> VonMisesTracker {
        VonMisesTracker::builder(space())
            .mic_positions(mics())
            .params(TrackerParams {
                n_particles: 200,
                ..TrackerParams::default()
            })
            .outlier_prob(outlier_prob)
            .dft_len(256)
            .sample_rate(16000)
            .seed(seed)
            .build()
            .unwrap()
    }

    /// A feature that is 1 at grid index `peak` and 0 elsewhere.
    fn peaked(len: usize, peak: usize) -> Vec<f64> {
        (0..len).map(|i| if i == peak { 1.0 } else { 0.0 }).collect()
    }

    /// A plane wave from `direction` as seen by each microphone.
    fn plane_wave_frame(t: &VonMisesTracker, direction: &Vec3) -> SpectralFrame {
        let n_bins = t.dft_len() / 2 + 1;
        let channels = t
            .mic_positions()
            .iter()
            .map(|r| {
                let lead = r.dot(direction) / SPEED_OF_SOUND;
                (0..n_bins)
                    .map(|k| {
                        let freq = k as f64 * t.sample_rate() as f64 / t.dft_len() as f64;
                        Complex64::from_polar(1.0, 2.0 * PI * freq * lead)
                    })
                    .collect()
            })
            .collect();
        SpectralFrame::new(channels)
    }

    #[test]
    fn rejects_bad_params() {
        let res = VonMisesTracker::builder(space()).build();
        assert!(matches!(res, Err(TrackerError::InvalidParams(_))));

        let res = VonMisesTracker::builder(space())
            .mic_positions(mics())
            .outlier_prob(1.5)
            .build();
        assert!(matches!(res, Err(TrackerError::InvalidParams(_))));
    }

    #[test]
    fn grid_accessors() {
        let t = tracker(0.0, 1);
        assert_eq!(t.get_directions().len(), 100);
        assert_eq!(t.get_spher_directions().len(), 100);
        assert_eq!(t.get_pos_align_mat().len(), 100);
        assert_eq!(t.get_pos_align_mat()[0].n_bins(), 129);
        assert_eq!(t.particles().len(), 200);

        let rows = t.to_spher_grid(&vec![1.0; 100]).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].len(), 100);
        assert!(t.to_spher_grid(&[1.0; 3]).is_err());
    }

    #[test]
    fn weights_stay_normalized() {
        let mut t = tracker(0.2, 2);
        for step in 0..20 {
            let post = t.update_features(&peaked(100, (step * 7) % 100)).unwrap();
            let total: f64 = post.weights().iter().sum();
            assert!((total - 1.0).abs() < 1e-9);
            assert!(post.weights().iter().all(|w| *w >= 0.0));
            assert_eq!(post.len(), 200);
        }
    }

    #[test]
    fn converges_on_a_steady_peak() {
        let mut t = tracker(0.0, 3);
        let target = 25; // theta near pi / 4
        let target_dir = t.get_directions()[target];
        for _ in 0..30 {
            t.update_features(&peaked(100, target)).unwrap();
        }
        let estimate = t.particles().estimate();
        let angle = estimate.dot(&target_dir).clamp(-1.0, 1.0).acos();
        assert!(angle < 0.2, "estimate {} is {} rad off", estimate, angle);
        assert!(t.estimate_index().abs_diff(target) <= 7);
    }

    #[test]
    fn outliers_suppress_tracking() {
        // Same seed, so both filters diffuse identically; with the uniform
        // component dominating, the observation barely moves the weights.
        let mut nearly_blind = tracker(0.999, 4);
        let mut blind = tracker(1.0, 4);
        for _ in 0..10 {
            nearly_blind.update_features(&peaked(100, 80)).unwrap();
            blind.update_features(&peaked(100, 80)).unwrap();
        }
        assert_eq!(nearly_blind.particles().particles(), blind.particles().particles());
        let w = nearly_blind.particles().weights();
        let max = w.iter().copied().fold(f64::MIN, f64::max);
        let min = w.iter().copied().fold(f64::MAX, f64::min);
        assert!(max / min < 1.25);
        assert!(blind
            .particles()
            .weights()
            .iter()
            .all(|w| (w - 1.0 / 200.0).abs() < 1e-12));
    }

    #[test]
    fn outlier_density_covers_the_front_half() {
        let mu = Vec3::new(0.0, 1.0, 0.0);
        let n = 2_000;
        let step = PI / n as f64;

        let planar = tracker(1.0, 13);
        let total: f64 = (0..n)
            .map(|i| Vec3::from_spherical(step * (i as f64 + 0.5), PI / 2.0))
            .map(|p| planar.likelihood(&p, &mu) * step)
            .sum();
        assert!((total - 1.0).abs() < 1e-9, "planar integral {}", total);

        // a peak in the middle of the half circle keeps almost all its mass
        let sharp = tracker(0.0, 13);
        let total: f64 = (0..n)
            .map(|i| Vec3::from_spherical(step * (i as f64 + 0.5), PI / 2.0))
            .map(|p| sharp.likelihood(&p, &mu) * step)
            .sum();
        assert!((total - 1.0).abs() < 1e-3, "planar inlier integral {}", total);

        let spherical = VonMisesTracker::builder(space())
            .mic_positions(mics())
            .params(TrackerParams {
                n_theta: 20,
                n_phi: 10,
                ..TrackerParams::default()
            })
            .outlier_prob(1.0)
            .dft_len(128)
            .seed(13)
            .build()
            .unwrap();
        // theta and phi both over [0, pi] sweep the y >= 0 hemisphere
        let m = 400;
        let h = PI / m as f64;
        let mut total = 0.0;
        for i in 0..m {
            for j in 0..m {
                let (theta, phi) = (h * (i as f64 + 0.5), h * (j as f64 + 0.5));
                let p = Vec3::from_spherical(theta, phi);
                total += spherical.likelihood(&p, &mu) * phi.sin() * h * h;
            }
        }
        assert!((total - 1.0).abs() < 1e-4, "hemisphere integral {}", total);
    }

    #[test]
    fn resampling_keeps_count_and_flattens_weights() {
        let mut set = ParticleSet {
            particles: (0..10).map(|i| Vec3::new(i as f64, 1.0, 0.0)).collect(),
            weights: vec![0.0; 10],
        };
        set.weights[3] = 0.75;
        set.weights[7] = 0.25;
        let mut rng = StdRng::seed_from_u64(5);
        set.resample(&mut rng);
        assert_eq!(set.len(), 10);
        assert!(set.weights().iter().all(|w| (*w - 0.1).abs() < 1e-12));
        let from_3 = set.particles().iter().filter(|p| p.x == 3.0).count();
        let from_7 = set.particles().iter().filter(|p| p.x == 7.0).count();
        assert_eq!(from_3 + from_7, 10);
        assert!((7..=8).contains(&from_3));
    }

    #[test]
    fn degenerate_weights_reset_to_uniform() {
        let mut set = ParticleSet::uniform(vec![Vec3::new(0.0, 1.0, 0.0); 4]);
        set.weights = vec![0.0, f64::NAN, 0.0, 0.0];
        assert!(!set.normalize());
        assert!(set.weights().iter().all(|w| *w == 0.25));

        set.weights = vec![0.0; 4];
        assert!(!set.normalize());
        assert!(set.weights().iter().all(|w| *w == 0.25));
    }

    #[test]
    fn effective_sample_size() {
        let mut set = ParticleSet::uniform(vec![Vec3::new(0.0, 1.0, 0.0); 4]);
        assert!((set.effective_sample_size() - 4.0).abs() < 1e-12);
        set.weights = vec![1.0, 0.0, 0.0, 0.0];
        assert!((set.effective_sample_size() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn steered_power_peaks_at_the_source() {
        let t = tracker(0.0, 6);
        let source = t.get_directions()[30];
        let frame = plane_wave_frame(&t, &source);
        for kind in [FeatureKind::Srp, FeatureKind::Gcc] {
            let features = t.features(&frame, kind).unwrap();
            let peak = features
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(b.1))
                .map(|(i, _)| i);
            assert_eq!(peak, Some(30), "{:?}", kind);
        }
    }

    #[test]
    fn distribution_real_is_normalized() {
        let t = tracker(0.0, 7);
        let frame = plane_wave_frame(&t, &t.get_directions()[60]);
        let (dist, energy) = t.get_distribution_real(&frame, FeatureKind::Gcc).unwrap();
        assert_eq!(dist.len(), 100);
        assert!((dist.iter().sum::<f64>() - 1.0).abs() < 1e-9);
        assert!((energy - 1.0).abs() < 1e-9);
        assert_eq!(t.steps(), 0);
    }

    #[test]
    fn tracks_a_plane_wave() {
        let mut t = tracker(0.2, 8);
        let source = t.get_directions()[70];
        let frame = plane_wave_frame(&t, &source);
        for _ in 0..30 {
            t.get_distribution(&frame).unwrap();
        }
        let angle = t.particles().estimate().dot(&source).clamp(-1.0, 1.0).acos();
        assert!(angle < 0.2, "{} rad off", angle);
        let location = t.estimate_location(0).unwrap();
        assert!((location.y - 1.0).abs() < 1e-9);
    }

    #[test]
    fn malformed_frames_leave_state_alone() {
        let mut t = tracker(0.0, 9);
        let before = t.particles().clone();
        let frame = SpectralFrame::new(vec![vec![Complex64::new(1.0, 0.0); 129]; 3]);
        assert!(matches!(
            t.get_distribution(&frame),
            Err(TrackerError::FrameShape { .. })
        ));
        assert!(matches!(
            t.update_features(&[1.0; 7]),
            Err(TrackerError::GridLength { .. })
        ));
        assert_eq!(t.particles(), &before);
        assert_eq!(t.steps(), 0);
    }

    #[test]
    fn pole_particles_bin_into_one_cell() {
        let mut t = VonMisesTracker::builder(space())
            .mic_positions(mics())
            .params(TrackerParams {
                n_particles: 10,
                n_theta: 6,
                n_phi: 5,
                ..TrackerParams::default()
            })
            .dft_len(64)
            .seed(14)
            .build()
            .unwrap();
        let pole = Vec3::new(0.0, 0.0, 1.0);
        assert_eq!(t.nearest_index(&pole), 0);
        assert_eq!(t.nearest_index(&-pole), 24);

        t.particles = ParticleSet::uniform(vec![pole; 10]);
        let grid = t.posterior_grid();
        assert!((grid[0] - 1.0).abs() < 1e-12);
        assert!(grid[1..].iter().all(|w| *w == 0.0));
        let rows = t.to_spher_grid(&grid).unwrap();
        assert_eq!(rows.len(), 5);
        assert!(rows.iter().all(|r| r.len() == 6));
    }

    #[test]
    fn posterior_grid_sums_to_one() {
        let mut t = tracker(0.0, 10);
        t.update_features(&peaked(100, 50)).unwrap();
        let grid = t.posterior_grid();
        assert_eq!(grid.len(), 100);
        assert!((grid.iter().sum::<f64>() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn spherical_tracking() {
        let mut t = VonMisesTracker::builder(space())
            .mic_positions(mics())
            .params(TrackerParams {
                n_particles: 300,
                n_theta: 20,
                n_phi: 10,
                ..TrackerParams::default()
            })
            .dft_len(128)
            .seed(12)
            .build()
            .unwrap();
        let target = 4 * 20 + 8;
        let target_dir = t.get_directions()[target];
        for _ in 0..30 {
            t.update_features(&peaked(200, target)).unwrap();
        }
        let estimate = t.particles().estimate();
        assert!((estimate.norm() - 1.0).abs() < 1e-9);
        assert!(estimate.y >= 0.0);
        assert!(estimate.dot(&target_dir) > 0.9);
    }
}

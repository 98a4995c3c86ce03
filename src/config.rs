//! Runtime configuration, read from a [ron] file.
//!
//! Every field has a default matching the reference deployment: a four
//! microphone linear array at 44.1 kHz looking at a wall one metre in front
//! of it. A config file only needs to name the fields it changes:
//!
//! ```text
//! (
//!     sample_rate: 48000,
//!     tracker: (n_particles: 200, seed: Some(7)),
//!     outlier_probs: [0.0, 0.5],
//! )
//! ```

use crate::geometry::{require_vec3, GeometryError, OrientedSourcePlane, SourcePlane, Surface};
use crate::search_space::{SearchSpace, SearchSpaceError};
use crate::tracker::{TrackerError, TrackerParams, VonMisesTracker};
use crate::vector::{Vec3, VectorInput};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Errors from loading or applying a [Config].
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Ron(ron::de::SpannedError),
    Geometry(GeometryError),
    SearchSpace(SearchSpaceError),
    Tracker(TrackerError),
    /// A value that parses but makes no sense
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "could not read config: {}", e),
            ConfigError::Ron(e) => write!(f, "could not parse config: {}", e),
            ConfigError::Geometry(e) => write!(f, "bad geometry in config: {}", e),
            ConfigError::SearchSpace(e) => write!(f, "bad search space in config: {}", e),
            ConfigError::Tracker(e) => write!(f, "bad tracker in config: {}", e),
            ConfigError::Invalid(what) => write!(f, "invalid config: {}", what),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<ron::de::SpannedError> for ConfigError {
    fn from(value: ron::de::SpannedError) -> Self {
        Self::Ron(value)
    }
}

impl From<GeometryError> for ConfigError {
    fn from(value: GeometryError) -> Self {
        Self::Geometry(value)
    }
}

impl From<SearchSpaceError> for ConfigError {
    fn from(value: SearchSpaceError) -> Self {
        Self::SearchSpace(value)
    }
}

impl From<TrackerError> for ConfigError {
    fn from(value: TrackerError) -> Self {
        Self::Tracker(value)
    }
}

/// One candidate source plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PlaneConfig {
    Plain {
        normal: VectorInput,
        offset: VectorInput,
    },
    Oriented {
        normal: VectorInput,
        up: VectorInput,
        offset: VectorInput,
    },
}

impl PlaneConfig {
    pub fn build(&self) -> Result<Surface, GeometryError> {
        Ok(match self {
            PlaneConfig::Plain { normal, offset } => {
                SourcePlane::from_input(normal, offset)?.into()
            }
            PlaneConfig::Oriented { normal, up, offset } => {
                OrientedSourcePlane::from_input(normal, up, offset)?.into()
            }
        })
    }
}

/// Where the array and camera sit and which way the array faces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpaceConfig {
    pub mic_loc: VectorInput,
    pub camera_loc: VectorInput,
    pub mic_forward: VectorInput,
    pub mic_above: VectorInput,
    /// Candidate planes; estimates are reported on the first
    pub planes: Vec<PlaneConfig>,
}

impl Default for SpaceConfig {
    fn default() -> Self {
        Self {
            mic_loc: Vec3::ZERO.into(),
            camera_loc: Vec3::ZERO.into(),
            mic_forward: Vec3::new(0.0, 1.0, 0.0).into(),
            mic_above: Vec3::new(0.0, 0.0, 1.0).into(),
            planes: vec![PlaneConfig::Oriented {
                normal: Vec3::new(0.0, -1.0, 0.0).into(),
                up: Vec3::new(0.0, 0.0, 1.0).into(),
                offset: Vec3::new(0.0, 1.0, 0.0).into(),
            }],
        }
    }
}

/// Everything needed to run a pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sample_rate: u32,
    /// Frames per processing window; also the DFT length
    pub frames_per_buf: usize,
    pub n_channels_in: usize,
    pub n_channels_out: usize,
    /// Ring buffer capacity in windows
    pub buffer_headroom: usize,
    /// How long the processing loop waits for a window, in milliseconds
    pub timeout_ms: u64,
    /// Frames below this spectral energy are reported as gated
    pub energy_gate: f64,
    pub space: SpaceConfig,
    /// Microphone positions in the microphone frame, one per input channel
    pub mic_layout: Vec<VectorInput>,
    pub tracker: TrackerParams,
    /// One tracker is run per entry; empty means a single tracker using
    /// `tracker.outlier_prob`
    pub outlier_probs: Vec<f64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sample_rate: 44100,
            frames_per_buf: 2048,
            n_channels_in: 4,
            n_channels_out: 1,
            buffer_headroom: 4,
            timeout_ms: 1000,
            energy_gate: 1e-6,
            space: SpaceConfig::default(),
            mic_layout: [0.03, -0.01, 0.01, -0.03]
                .iter()
                .map(|&x| Vec3::new(x, 0.0, 0.0).into())
                .collect(),
            tracker: TrackerParams::default(),
            outlier_probs: vec![0.0, 0.2, 0.999],
        }
    }
}

impl Config {
    /// Reads and validates a RON config file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_ron(&text)
    }

    /// Parses and validates RON text.
    pub fn from_ron(text: &str) -> Result<Self, ConfigError> {
        let config: Config = ron::de::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the values that serde cannot.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sample_rate == 0 {
            return Err(ConfigError::Invalid("sample_rate must be positive".into()));
        }
        if self.frames_per_buf < 2 {
            return Err(ConfigError::Invalid("frames_per_buf must be at least 2".into()));
        }
        if self.n_channels_in == 0 || self.n_channels_out == 0 {
            return Err(ConfigError::Invalid("channel counts must be positive".into()));
        }
        if self.buffer_headroom == 0 {
            return Err(ConfigError::Invalid("buffer_headroom must be positive".into()));
        }
        if self.mic_layout.len() != self.n_channels_in {
            return Err(ConfigError::Invalid(format!(
                "{} microphones for {} input channels",
                self.mic_layout.len(),
                self.n_channels_in
            )));
        }
        if let Some(p) = self
            .outlier_probs
            .iter()
            .find(|p| !(0.0..=1.0).contains(*p))
        {
            return Err(ConfigError::Invalid(format!("outlier probability {} not in [0, 1]", p)));
        }
        Ok(())
    }

    /// Ring buffer capacity in frames.
    pub fn ring_capacity(&self) -> usize {
        self.frames_per_buf * self.buffer_headroom
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn build_search_space(&self) -> Result<SearchSpace, ConfigError> {
        let s = &self.space;
        let planes = s
            .planes
            .iter()
            .map(PlaneConfig::build)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(SearchSpace::new(
            require_vec3("mic_loc", &s.mic_loc)?,
            require_vec3("camera_loc", &s.camera_loc)?,
            planes,
            require_vec3("mic_forward", &s.mic_forward)?,
            require_vec3("mic_above", &s.mic_above)?,
        )?)
    }

    pub fn mic_positions(&self) -> Result<Vec<Vec3>, ConfigError> {
        Ok(self
            .mic_layout
            .iter()
            .map(|m| require_vec3("mic_layout", m))
            .collect::<Result<Vec<_>, _>>()?)
    }

    /// The outlier probability of each tracker to run.
    pub fn tracker_outlier_probs(&self) -> Vec<f64> {
        if self.outlier_probs.is_empty() {
            vec![self.tracker.outlier_prob]
        } else {
            self.outlier_probs.clone()
        }
    }

    /// One tracker per outlier probability, sharing `space`. With a fixed
    /// seed, tracker `i` is seeded with `seed + i`.
    pub fn build_trackers(
        &self,
        space: Arc<SearchSpace>,
    ) -> Result<Vec<VonMisesTracker>, ConfigError> {
        let mics = self.mic_positions()?;
        self.tracker_outlier_probs()
            .into_iter()
            .enumerate()
            .map(|(i, outlier_prob)| -> Result<VonMisesTracker, ConfigError> {
                let mut params = self.tracker.clone();
                params.outlier_prob = outlier_prob;
                params.seed = params.seed.map(|s| s.wrapping_add(i as u64));
                let tracker = VonMisesTracker::builder(space.clone())
                    .mic_positions(mics.clone())
                    .params(params)
                    .dft_len(self.frames_per_buf)
                    .sample_rate(self.sample_rate)
                    .build()?;
                Ok(tracker)
            })
            .collect()
    }
}

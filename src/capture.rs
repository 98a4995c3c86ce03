//! Audio capture. A [CaptureSource] yields fixed-size blocks of interleaved
//! samples, and [spawn_capture] pushes them into the pipeline's input ring
//! buffer from its own thread, paced to real time if asked to.
//!
//! Two sources are provided: [SyntheticSource], which simulates a source
//! moving across a plane of the search space, and [WavSource], which replays
//! a multichannel WAV file.

use crate::geometry::OrientedSourcePlane;
use crate::pipeline::PipelineContext;
use crate::ring_buffer::RingBufferError;
use crate::search_space::{SearchSpace, SearchSpaceError};
use crate::tracker::SPEED_OF_SOUND;
use crate::vector::Vec3;
use hound::{SampleFormat, WavReader, WavSpec};
use log::{debug, info};
use rand::prelude::*;
use std::f64::consts::PI;
use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Things that go wrong while producing audio.
#[derive(Debug)]
pub enum CaptureError {
    Hound(hound::Error),
    Io(std::io::Error),
    /// The source does not have one channel per microphone
    ChannelMismatch { expected: usize, found: usize },
    InvalidParams(&'static str),
    SearchSpace(SearchSpaceError),
    RingBuffer(RingBufferError),
}

impl fmt::Display for CaptureError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CaptureError::Hound(e) => write!(f, "wav error: {}", e),
            CaptureError::Io(e) => write!(f, "io error: {}", e),
            CaptureError::ChannelMismatch { expected, found } => {
                write!(f, "expected {} capture channels, found {}", expected, found)
            }
            CaptureError::InvalidParams(what) => write!(f, "invalid capture parameters: {}", what),
            CaptureError::SearchSpace(e) => write!(f, "search space error: {}", e),
            CaptureError::RingBuffer(e) => write!(f, "ring buffer error: {}", e),
        }
    }
}

impl std::error::Error for CaptureError {}

impl From<hound::Error> for CaptureError {
    fn from(value: hound::Error) -> Self {
        Self::Hound(value)
    }
}

impl From<std::io::Error> for CaptureError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<SearchSpaceError> for CaptureError {
    fn from(value: SearchSpaceError) -> Self {
        Self::SearchSpace(value)
    }
}

impl From<RingBufferError> for CaptureError {
    fn from(value: RingBufferError) -> Self {
        Self::RingBuffer(value)
    }
}

/// Anything that produces interleaved multichannel audio in blocks.
pub trait CaptureSource: Send {
    fn n_channels(&self) -> usize;

    fn sample_rate(&self) -> u32;

    /// The next `frames` frames, interleaved, or `None` once the source is
    /// exhausted. A short final block is padded with silence.
    fn next_block(&mut self, frames: usize) -> Result<Option<Vec<f32>>, CaptureError>;
}

/// What a capture thread did before it stopped.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CaptureStats {
    pub blocks: u64,
    pub frames_written: u64,
    pub frames_dropped: u64,
}

/// Pulls blocks of `block_frames` from `source` into the context's input
/// buffer until the source runs dry or the context is cancelled. Marks the
/// capture as finished on the way out, whatever the outcome.
pub fn spawn_capture(
    mut source: Box<dyn CaptureSource>,
    ctx: Arc<PipelineContext>,
    block_frames: usize,
    paced: bool,
) -> JoinHandle<Result<CaptureStats, CaptureError>> {
    thread::spawn(move || {
        let period = Duration::from_secs_f64(block_frames as f64 / source.sample_rate() as f64);
        let n_channels = source.n_channels().max(1);
        let mut stats = CaptureStats::default();

        let result = loop {
            if ctx.is_done() {
                break Ok(());
            }
            let started = Instant::now();
            let block = match source.next_block(block_frames) {
                Ok(Some(block)) => block,
                Ok(None) => {
                    info!("capture : source exhausted after {} blocks.", stats.blocks);
                    break Ok(());
                }
                Err(error) => break Err(error),
            };
            let frames = (block.len() / n_channels) as u64;
            match ctx.input().write(&block) {
                Ok(written) => {
                    stats.blocks += 1;
                    stats.frames_written += written as u64;
                    stats.frames_dropped += frames - written as u64;
                }
                Err(error) => break Err(error.into()),
            }
            if paced {
                if let Some(rest) = period.checked_sub(started.elapsed()) {
                    spin_sleep::sleep(rest);
                }
            }
        };

        ctx.finish_capture();
        if stats.frames_dropped > 0 {
            debug!("capture : {} frames dropped.", stats.frames_dropped);
        }
        info!("capture : terminated.");
        result.map(|()| stats)
    })
}

/// Simulates one sound source sweeping back and forth along an oriented
/// plane of the search space, heard by each microphone with its own exact
/// propagation delay.
///
/// The source is a sum of tones with random phases. It can be made
/// intermittent with a duty cycle, and every channel gets independent
/// uniform noise.
pub struct SyntheticSource {
    plane: OrientedSourcePlane,
    space: Arc<SearchSpace>,
    mics_world: Vec<Vec3>,
    sample_rate: u32,
    center: f64,
    sweep: f64,
    period: f64,
    duty: f64,
    burst: f64,
    noise: f64,
    amplitude: f64,
    tones: Vec<(f64, f64)>,
    rng: StdRng,
    position: u64,
}

/// Builder for [SyntheticSource].
pub struct SyntheticSourceBuilder {
    space: Arc<SearchSpace>,
    mic_positions: Vec<Vec3>,
    plane_index: usize,
    sample_rate: u32,
    center: f64,
    sweep: f64,
    period: f64,
    duty: f64,
    burst: f64,
    noise: f64,
    n_tones: usize,
    seed: Option<u64>,
}

impl SyntheticSourceBuilder {
    /// Which plane of the search space the source moves on.
    pub fn plane_index(self, plane_index: usize) -> Self {
        Self { plane_index, ..self }
    }

    pub fn sample_rate(self, sample_rate: u32) -> Self {
        Self { sample_rate, ..self }
    }

    /// Middle of the sweep, in metres along the plane's right axis.
    pub fn center(self, center: f64) -> Self {
        Self { center, ..self }
    }

    /// Half the length of the sweep, in metres along the plane.
    pub fn sweep(self, sweep: f64) -> Self {
        Self { sweep, ..self }
    }

    /// Seconds for one full back-and-forth sweep.
    pub fn period(self, period: f64) -> Self {
        Self { period, ..self }
    }

    /// Fraction of each burst during which the source is audible.
    pub fn duty(self, duty: f64) -> Self {
        Self { duty, ..self }
    }

    /// Length of one on/off cycle, in seconds.
    pub fn burst(self, burst: f64) -> Self {
        Self { burst, ..self }
    }

    /// Peak amplitude of the per-channel noise.
    pub fn noise(self, noise: f64) -> Self {
        Self { noise, ..self }
    }

    pub fn n_tones(self, n_tones: usize) -> Self {
        Self { n_tones, ..self }
    }

    pub fn seed(self, seed: Option<u64>) -> Self {
        Self { seed, ..self }
    }

    pub fn build(self) -> Result<SyntheticSource, CaptureError> {
        if self.mic_positions.is_empty() {
            return Err(CaptureError::InvalidParams("no microphones"));
        }
        if self.sample_rate == 0 {
            return Err(CaptureError::InvalidParams("sample rate must be positive"));
        }
        if self.period <= 0.0 || self.burst <= 0.0 {
            return Err(CaptureError::InvalidParams("period and burst must be positive"));
        }
        if !(0.0..=1.0).contains(&self.duty) {
            return Err(CaptureError::InvalidParams("duty must lie in [0, 1]"));
        }
        if self.n_tones == 0 || self.noise < 0.0 {
            return Err(CaptureError::InvalidParams(
                "need at least one tone and non-negative noise",
            ));
        }

        let plane = self
            .space
            .plane(self.plane_index)?
            .as_oriented()
            .ok_or(SearchSpaceError::NotOriented(self.plane_index))?
            .clone();
        let mics_world = self
            .mic_positions
            .iter()
            .map(|r| self.space.mic_loc() + self.space.mic_to_world(*r))
            .collect();

        let mut rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        // log spaced tones, kept below Nyquist
        let (low, high) = (300.0_f64, 4000.0_f64.min(0.45 * self.sample_rate as f64));
        let tones = (0..self.n_tones)
            .map(|i| {
                let frac = if self.n_tones == 1 {
                    0.0
                } else {
                    i as f64 / (self.n_tones - 1) as f64
                };
                let freq = low * (high / low).powf(frac);
                (freq, rng.gen_range(0.0..2.0 * PI))
            })
            .collect();

        Ok(SyntheticSource {
            plane,
            space: self.space,
            mics_world,
            sample_rate: self.sample_rate,
            center: self.center,
            sweep: self.sweep,
            period: self.period,
            duty: self.duty,
            burst: self.burst,
            noise: self.noise,
            amplitude: 0.5 / (self.n_tones as f64).sqrt(),
            tones,
            rng,
            position: 0,
        })
    }
}

impl SyntheticSource {
    /// Make a [SyntheticSourceBuilder] for an array with `mic_positions`
    /// (microphone frame) placed in `space`.
    pub fn builder(space: Arc<SearchSpace>, mic_positions: Vec<Vec3>) -> SyntheticSourceBuilder {
        SyntheticSourceBuilder {
            space,
            mic_positions,
            plane_index: 0,
            sample_rate: 44100,
            center: 0.0,
            sweep: 1.0,
            period: 8.0,
            duty: 1.0,
            burst: 0.5,
            noise: 0.01,
            n_tones: 48,
            seed: None,
        }
    }

    /// Where the source is `t` seconds into the simulation, world frame.
    pub fn location_at(&self, t: f64) -> Vec3 {
        let u = self.center + self.sweep * (2.0 * PI * t / self.period).sin();
        self.plane.to_world(u, 0.0)
    }

    /// Unit direction from the array to the source, microphone frame.
    pub fn direction_at(&self, t: f64) -> Option<Vec3> {
        self.space
            .world_to_mic(self.location_at(t) - self.space.mic_loc())
            .normalized()
    }

    /// Whether the source is audible `t` seconds in.
    pub fn is_active(&self, t: f64) -> bool {
        (t / self.burst).fract() < self.duty
    }

    /// Seconds of audio produced so far.
    pub fn elapsed(&self) -> f64 {
        self.position as f64 / self.sample_rate as f64
    }
}

impl CaptureSource for SyntheticSource {
    fn n_channels(&self) -> usize {
        self.mics_world.len()
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn next_block(&mut self, frames: usize) -> Result<Option<Vec<f32>>, CaptureError> {
        let mut block = Vec::with_capacity(frames * self.mics_world.len());
        for n in 0..frames {
            let t = (self.position + n as u64) as f64 / self.sample_rate as f64;
            let source = self.location_at(t);
            let gain = if self.is_active(t) { self.amplitude } else { 0.0 };
            for mic in &self.mics_world {
                let heard_at = t - mic.abs_dist(&source) / SPEED_OF_SOUND;
                let signal: f64 = self
                    .tones
                    .iter()
                    .map(|(freq, phase)| (2.0 * PI * freq * heard_at + phase).sin())
                    .sum();
                let noise = self.noise * (2.0 * self.rng.gen::<f64>() - 1.0);
                block.push((gain * signal + noise) as f32);
            }
        }
        self.position += frames as u64;
        Ok(Some(block))
    }
}

/// Replays a WAV file, one channel per microphone. Integer samples are
/// scaled into `[-1, 1)`.
pub struct WavSource {
    reader: WavReader<BufReader<File>>,
    spec: WavSpec,
    looped: bool,
}

impl WavSource {
    /// Opens `path`; with `looped` the file restarts when it runs out.
    pub fn open(path: impl AsRef<Path>, looped: bool) -> Result<Self, CaptureError> {
        let reader = WavReader::open(path)?;
        let spec = reader.spec();
        if spec.channels == 0 {
            return Err(CaptureError::InvalidParams("wav file has no channels"));
        }
        Ok(Self {
            reader,
            spec,
            looped,
        })
    }

    pub fn spec(&self) -> WavSpec {
        self.spec
    }

    fn read_samples(&mut self, count: usize, out: &mut Vec<f32>) -> Result<(), CaptureError> {
        match self.spec.sample_format {
            SampleFormat::Float => {
                for sample in self.reader.samples::<f32>().take(count) {
                    out.push(sample?);
                }
            }
            SampleFormat::Int => {
                let scale = 1.0 / (1u64 << (self.spec.bits_per_sample - 1)) as f32;
                for sample in self.reader.samples::<i32>().take(count) {
                    out.push(sample? as f32 * scale);
                }
            }
        }
        Ok(())
    }
}

impl CaptureSource for WavSource {
    fn n_channels(&self) -> usize {
        self.spec.channels as usize
    }

    fn sample_rate(&self) -> u32 {
        self.spec.sample_rate
    }

    fn next_block(&mut self, frames: usize) -> Result<Option<Vec<f32>>, CaptureError> {
        let wanted = frames * self.n_channels();
        let mut block = Vec::with_capacity(wanted);
        self.read_samples(wanted, &mut block)?;
        if block.is_empty() && self.looped && self.reader.duration() > 0 {
            self.reader.seek(0)?;
            self.read_samples(wanted, &mut block)?;
        }
        if block.is_empty() {
            return Ok(None);
        }
        block.resize(wanted, 0.0);
        Ok(Some(block))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{OrientedSourcePlane, SourcePlane};
    use hound::WavWriter;
    use tempfile::tempdir;

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

    #[test]
    fn synthetic_blocks_have_the_right_shape() {
        let mut source = SyntheticSource::builder(space(), mics())
            .seed(Some(1))
            .build()
            .unwrap();
        let block = source.next_block(128).unwrap().unwrap();
        assert_eq!(block.len(), 128 * 4);
        assert!(block.iter().all(|s| s.is_finite()));
        assert!((source.elapsed() - 128.0 / 44100.0).abs() < 1e-12);
    }

    #[test]
    fn synthetic_source_is_reproducible() {
        let make = || {
            SyntheticSource::builder(space(), mics())
                .seed(Some(9))
                .build()
                .unwrap()
        };
        let (mut a, mut b) = (make(), make());
        assert_eq!(a.next_block(64).unwrap(), b.next_block(64).unwrap());
    }

    #[test]
    fn synthetic_source_goes_quiet_off_duty() {
        let mut source = SyntheticSource::builder(space(), mics())
            .duty(0.5)
            .burst(0.01)
            .noise(0.0)
            .sample_rate(1000)
            .seed(Some(2))
            .build()
            .unwrap();
        // 10 samples per burst, the back half of each is silent
        let block = source.next_block(20).unwrap().unwrap();
        for frame in 0..20 {
            let samples = &block[frame * 4..frame * 4 + 4];
            if frame % 10 >= 6 {
                assert!(samples.iter().all(|s| *s == 0.0), "frame {}", frame);
            }
        }
        assert!(block.iter().any(|s| *s != 0.0));
    }

    #[test]
    fn synthetic_source_moves_on_the_plane() {
        let source = SyntheticSource::builder(space(), mics())
            .sweep(0.5)
            .period(4.0)
            .seed(Some(3))
            .build()
            .unwrap();
        assert!(source.location_at(0.0).abs_dist(&Vec3::new(0.0, 1.0, 0.0)) < 1e-12);
        let quarter = source.location_at(1.0);
        assert!((quarter.y - 1.0).abs() < 1e-12);
        assert!((quarter.x.abs() - 0.5).abs() < 1e-12);
        let dir = source.direction_at(0.0).unwrap();
        assert!(dir.abs_dist(&Vec3::new(0.0, 1.0, 0.0)) < 1e-12);
    }

    #[test]
    fn synthetic_source_needs_an_oriented_plane() {
        let plain = SourcePlane::new(Vec3::new(0.0, -1.0, 0.0), Vec3::new(0.0, 1.0, 0.0)).unwrap();
        let space = Arc::new(
            SearchSpace::new(
                Vec3::ZERO,
                Vec3::ZERO,
                vec![plain.into()],
                Vec3::new(0.0, 1.0, 0.0),
                Vec3::new(0.0, 0.0, 1.0),
            )
            .unwrap(),
        );
        assert!(matches!(
            SyntheticSource::builder(space, mics()).build(),
            Err(CaptureError::SearchSpace(SearchSpaceError::NotOriented(0)))
        ));
    }

    fn write_wav(path: &Path, frames: usize) {
        let spec = WavSpec {
            channels: 2,
            sample_rate: 8000,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut writer = WavWriter::create(path, spec).unwrap();
        for n in 0..frames {
            writer.write_sample(n as i16 * 100).unwrap();
            writer.write_sample(-16384i16).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn wav_source_replays_and_pads() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("two.wav");
        write_wav(&path, 10);

        let mut source = WavSource::open(&path, false).unwrap();
        assert_eq!(source.n_channels(), 2);
        assert_eq!(source.sample_rate(), 8000);

        let first = source.next_block(8).unwrap().unwrap();
        assert_eq!(first.len(), 16);
        assert_eq!(first[1], -0.5);
        assert!((first[2] - 100.0 / 32768.0).abs() < 1e-7);

        let last = source.next_block(8).unwrap().unwrap();
        assert_eq!(last.len(), 16);
        assert_eq!(last[3], -0.5);
        assert!(last[4..].iter().all(|s| *s == 0.0));

        assert!(source.next_block(8).unwrap().is_none());
    }

    #[test]
    fn looped_wav_source_restarts() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("loop.wav");
        write_wav(&path, 4);

        let mut source = WavSource::open(&path, true).unwrap();
        let first = source.next_block(4).unwrap().unwrap();
        let again = source.next_block(4).unwrap().unwrap();
        assert_eq!(first, again);
    }

    #[test]
    fn missing_wav_is_an_error() {
        assert!(matches!(
            WavSource::open("/no/such/file.wav", false),
            Err(CaptureError::Hound(_))
        ));
    }

    #[test]
    fn capture_thread_fills_the_input_buffer() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fill.wav");
        write_wav(&path, 10);

        let ctx = Arc::new(PipelineContext::new(64, 2, 1).unwrap());
        let source = WavSource::open(&path, false).unwrap();
        let stats = spawn_capture(Box::new(source), ctx.clone(), 4, false)
            .join()
            .unwrap()
            .unwrap();
        assert_eq!(stats.blocks, 3);
        assert_eq!(stats.frames_written, 12);
        assert_eq!(stats.frames_dropped, 0);
        assert_eq!(ctx.input().available_read(), 12);
        assert!(ctx.capture_finished());
    }
}

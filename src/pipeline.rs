//! The running system: a capture thread feeding the input ring buffer, a
//! tracking thread turning windows into [TrackingReport]s, an output drain
//! emptying the output ring buffer, and optionally a recorder.
//!
//! All of them share one [PipelineContext] and check its `done` flag at the
//! top of every loop. Every blocking wait is bounded, so cancelling the
//! context always brings the threads home.

use crate::capture::{spawn_capture, CaptureError, CaptureSource, CaptureStats};
use crate::component::{run_component, run_windowed, Component, ComponentError};
use crate::config::{Config, ConfigError};
use crate::recorder::WavRecorder;
use crate::ring_buffer::{RingBuffer, RingBufferError};
use crate::search_space::SearchSpace;
use crate::spectrum::{FeatureExtractor, HannSpectrum};
use crate::tracker::{FeatureKind, TrackerError, VonMisesTracker};
use crate::vector::Vec3;
use log::{debug, info, warn};
use std::fmt;
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// State shared by every pipeline thread.
#[derive(Debug)]
pub struct PipelineContext {
    input: RingBuffer,
    output: RingBuffer,
    done: AtomicBool,
    capture_finished: AtomicBool,
}

impl PipelineContext {
    /// Input and output buffers of `capacity` frames each.
    pub fn new(
        capacity: usize,
        n_channels_in: usize,
        n_channels_out: usize,
    ) -> Result<Self, RingBufferError> {
        Ok(Self {
            input: RingBuffer::new(capacity, n_channels_in)?,
            output: RingBuffer::new(capacity, n_channels_out)?,
            done: AtomicBool::new(false),
            capture_finished: AtomicBool::new(false),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, RingBufferError> {
        Self::new(config.ring_capacity(), config.n_channels_in, config.n_channels_out)
    }

    pub fn input(&self) -> &RingBuffer {
        &self.input
    }

    pub fn output(&self) -> &RingBuffer {
        &self.output
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Asks every thread to stop.
    pub fn cancel(&self) {
        self.done.store(true, Ordering::Release);
    }

    /// Whether the producer will write no more.
    pub fn capture_finished(&self) -> bool {
        self.capture_finished.load(Ordering::Acquire)
    }

    pub fn finish_capture(&self) {
        self.capture_finished.store(true, Ordering::Release);
    }
}

/// One tracker's view of one window.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackEstimate {
    pub outlier_prob: f64,
    /// Estimated unit direction, microphone frame
    pub direction: Vec3,
    pub azimuth: f64,
    pub polar: f64,
    /// Grid index nearest the estimate, for steering a beamformer
    pub beam_index: usize,
    /// Where the direction meets the first plane, if it does
    pub location: Option<Vec3>,
    /// `location` in plane coordinates, for oriented planes
    pub plane_coords: Option<(f64, f64)>,
    /// `(azimuth, weight)` for every particle
    pub particles: Vec<(f64, f64)>,
}

impl TrackEstimate {
    fn from_tracker(tracker: &VonMisesTracker) -> Self {
        let posterior = tracker.particles();
        let direction = posterior.estimate();
        let (azimuth, polar) = direction.to_spherical();
        let space = tracker.search_space();
        let location = space.direction_to_location(direction, 0).ok();
        let plane_coords = space.direction_to_plane_coords(direction, 0).ok();
        let particles = posterior
            .particles()
            .iter()
            .zip(posterior.weights())
            .map(|(p, w)| (p.to_spherical().0, *w))
            .collect();
        Self {
            outlier_prob: tracker.params().outlier_prob,
            direction,
            azimuth,
            polar,
            beam_index: tracker.estimate_index(),
            location,
            plane_coords,
            particles,
        }
    }
}

/// Everything the trackers made of one window.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackingReport {
    /// Index of the window since the pipeline started
    pub frame: u64,
    /// Mean spectral power of the window
    pub energy: f64,
    /// Whether the window was too quiet to trust
    pub gated: bool,
    pub tracks: Vec<TrackEstimate>,
}

impl fmt::Display for TrackingReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "frame {:>5} energy {:.3e}", self.frame, self.energy)?;
        if self.gated {
            write!(f, " (gated)")?;
        }
        for track in &self.tracks {
            write!(
                f,
                " | p={:.3} az={:6.1}°",
                track.outlier_prob,
                track.azimuth.to_degrees()
            )?;
            if let Some(location) = track.location {
                write!(f, " at {}", location)?;
            }
        }
        Ok(())
    }
}

/// Turns input windows into tracking reports, passing the audio through
/// to the output buffer on the way. The trackers must share one direction
/// grid and microphone array, as those built from one [Config] do.
pub struct TrackingStage {
    extractor: Box<dyn FeatureExtractor + Send>,
    trackers: Vec<VonMisesTracker>,
    ctx: Arc<PipelineContext>,
    energy_gate: f64,
    frame: u64,
    gated: u64,
}

impl TrackingStage {
    pub fn new(
        extractor: Box<dyn FeatureExtractor + Send>,
        trackers: Vec<VonMisesTracker>,
        ctx: Arc<PipelineContext>,
        energy_gate: f64,
    ) -> Self {
        Self {
            extractor,
            trackers,
            ctx,
            energy_gate,
            frame: 0,
            gated: 0,
        }
    }

    pub fn trackers(&self) -> &[VonMisesTracker] {
        &self.trackers
    }

    fn pass_through(&self, window: &[f32]) {
        let output = self.ctx.output();
        let mixed = RingBuffer::reduce_channels(
            window,
            self.ctx.input().n_channels(),
            output.n_channels(),
        );
        if let Err(error) = output.write(&mixed) {
            warn!("{} : pass through failed: {}.", self, error);
        }
    }
}

impl Component for TrackingStage {
    type InData = Vec<f32>;
    type OutData = Result<TrackingReport, TrackerError>;

    fn convert(&mut self, window: Vec<f32>) -> Result<TrackingReport, TrackerError> {
        self.pass_through(&window);

        let spectrum = self.extractor.extract(&window);
        let energy = spectrum.energy();
        let gated = energy < self.energy_gate;
        if gated {
            self.gated += 1;
        }

        // one feature vector per kind, shared by every tracker that uses it
        let mut features: Vec<(FeatureKind, Vec<f64>)> = Vec::new();
        let mut tracks = Vec::with_capacity(self.trackers.len());
        for tracker in self.trackers.iter_mut() {
            let kind = tracker.params().feature;
            let index = match features.iter().position(|(k, _)| *k == kind) {
                Some(index) => index,
                None => {
                    features.push((kind, tracker.features(&spectrum, kind)?));
                    features.len() - 1
                }
            };
            tracker.update_features(&features[index].1)?;
            tracks.push(TrackEstimate::from_tracker(tracker));
        }

        let report = TrackingReport {
            frame: self.frame,
            energy,
            gated,
            tracks,
        };
        self.frame += 1;
        info!("{}", report);
        Ok(report)
    }

    fn finalize(&mut self) -> Result<(), ComponentError> {
        info!(
            "{} : processed {} windows, {} gated.",
            self, self.frame, self.gated
        );
        Ok(())
    }
}

impl fmt::Display for TrackingStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TrackingStage")
    }
}

/// What the output drain did before it stopped.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainStats {
    pub blocks: u64,
    /// Blocks replaced by silence because the output buffer ran short
    pub silent_blocks: u64,
}

/// Pulls `block_frames` blocks from the output buffer, as an audio device
/// would, substituting silence when a block is not ready within `period`.
/// Blocks go to `sink` when there is one. On cancellation whatever is left
/// in the buffer is flushed to the sink.
pub fn spawn_output_drain(
    ctx: Arc<PipelineContext>,
    block_frames: usize,
    period: Duration,
    sink: Option<Sender<Vec<f32>>>,
) -> JoinHandle<DrainStats> {
    thread::spawn(move || {
        let n_channels = ctx.output().n_channels();
        let mut stats = DrainStats::default();
        while !ctx.is_done() {
            let block = if ctx.output().wait_for_read(block_frames, period) {
                match ctx.output().read(block_frames) {
                    Ok(block) => block,
                    Err(error) => {
                        warn!("output drain : {}.", error);
                        continue;
                    }
                }
            } else {
                stats.silent_blocks += 1;
                vec![0.0; block_frames * n_channels]
            };
            stats.blocks += 1;
            if let Some(sink) = &sink {
                if sink.send(block).is_err() {
                    debug!("output drain : sink closed.");
                }
            }
        }
        let rest = ctx.output().read_whole_buffer();
        if let (Some(sink), false) = (&sink, rest.is_empty()) {
            let _ = sink.send(rest);
        }
        info!("output drain : terminated.");
        stats
    })
}

/// Cancels `ctx` when a line reading `q` arrives on `reader`, or when the
/// reader closes. Meant for stdin, so the thread is never joined.
pub fn spawn_quit_watcher<R: BufRead + Send + 'static>(
    reader: R,
    ctx: Arc<PipelineContext>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        for line in reader.lines() {
            if ctx.is_done() {
                return;
            }
            match line {
                Ok(line) if line.trim().eq_ignore_ascii_case("q") => break,
                Ok(_) => continue,
                Err(error) => {
                    warn!("quit watcher : {}.", error);
                    break;
                }
            }
        }
        if !ctx.is_done() {
            info!("quit watcher : cancelling.");
            ctx.cancel();
        }
    })
}

/// Failures while starting or stopping a pipeline.
#[derive(Debug)]
pub enum PipelineError {
    Config(ConfigError),
    RingBuffer(RingBufferError),
    Capture(CaptureError),
    Recorder(hound::Error),
    /// A pipeline thread panicked
    JoinError(&'static str),
}

impl fmt::Display for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineError::Config(e) => write!(f, "{}", e),
            PipelineError::RingBuffer(e) => write!(f, "ring buffer error: {}", e),
            PipelineError::Capture(e) => write!(f, "capture error: {}", e),
            PipelineError::Recorder(e) => write!(f, "recorder error: {}", e),
            PipelineError::JoinError(which) => write!(f, "{} thread panicked", which),
        }
    }
}

impl std::error::Error for PipelineError {}

impl From<ConfigError> for PipelineError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value)
    }
}

impl From<RingBufferError> for PipelineError {
    fn from(value: RingBufferError) -> Self {
        Self::RingBuffer(value)
    }
}

impl From<CaptureError> for PipelineError {
    fn from(value: CaptureError) -> Self {
        Self::Capture(value)
    }
}

impl From<hound::Error> for PipelineError {
    fn from(value: hound::Error) -> Self {
        Self::Recorder(value)
    }
}

/// How to run a pipeline, beyond what the config says.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Pace capture to real time
    pub paced: bool,
    /// Record the output buffer to this WAV file
    pub record: Option<PathBuf>,
}

/// What a pipeline did, collected on shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineSummary {
    pub capture: CaptureStats,
    pub drain: DrainStats,
    pub recorded_frames: u64,
}

/// A running pipeline. Dropping it without [Pipeline::shutdown] leaves the
/// threads running until their context is cancelled.
pub struct Pipeline {
    ctx: Arc<PipelineContext>,
    capture: JoinHandle<Result<CaptureStats, CaptureError>>,
    processing: JoinHandle<()>,
    drain: JoinHandle<DrainStats>,
    recorder: Option<(JoinHandle<()>, Receiver<Result<usize, hound::Error>>)>,
}

impl Pipeline {
    /// Builds the search space and trackers from `config` and starts every
    /// thread. Reports arrive on the returned receiver, which closes once
    /// the tracking thread stops.
    pub fn start(
        config: &Config,
        source: Box<dyn CaptureSource>,
        options: RunOptions,
    ) -> Result<(Self, Receiver<Result<TrackingReport, TrackerError>>), PipelineError> {
        config.validate()?;
        if source.n_channels() != config.n_channels_in {
            return Err(CaptureError::ChannelMismatch {
                expected: config.n_channels_in,
                found: source.n_channels(),
            }
            .into());
        }
        if source.sample_rate() != config.sample_rate {
            warn!(
                "source runs at {} Hz but the trackers expect {} Hz",
                source.sample_rate(),
                config.sample_rate
            );
        }

        let space: Arc<SearchSpace> = Arc::new(config.build_search_space()?);
        let trackers = config.build_trackers(space)?;
        let ctx = Arc::new(PipelineContext::from_config(config)?);
        let window = config.frames_per_buf;
        let period = Duration::from_secs_f64(window as f64 / config.sample_rate as f64);

        let (sink, recorder) = match &options.record {
            Some(path) => {
                let recorder = WavRecorder::create(
                    path,
                    config.n_channels_out as u16,
                    config.sample_rate,
                )?;
                let (block_tx, block_rx) = mpsc::channel();
                let (result_tx, result_rx) = mpsc::channel();
                let handle = run_component(Box::new(recorder), block_rx, result_tx);
                (Some(block_tx), Some((handle, result_rx)))
            }
            None => (None, None),
        };

        let stage = TrackingStage::new(
            Box::new(HannSpectrum::new(window, config.n_channels_in)),
            trackers,
            ctx.clone(),
            config.energy_gate,
        );
        let (report_tx, report_rx) = mpsc::channel();
        let processing = run_windowed(
            Box::new(stage),
            ctx.clone(),
            window,
            config.timeout(),
            report_tx,
        );
        let drain = spawn_output_drain(ctx.clone(), window, period, sink);
        let capture = spawn_capture(source, ctx.clone(), window, options.paced);
        info!(
            "pipeline : started, {} Hz, {} frame windows, {} channels in.",
            config.sample_rate, window, config.n_channels_in
        );

        Ok((
            Self {
                ctx,
                capture,
                processing,
                drain,
                recorder,
            },
            report_rx,
        ))
    }

    pub fn context(&self) -> &Arc<PipelineContext> {
        &self.ctx
    }

    /// Cancels the context and joins every thread.
    pub fn shutdown(self) -> Result<PipelineSummary, PipelineError> {
        self.ctx.cancel();
        let capture = self
            .capture
            .join()
            .map_err(|_| PipelineError::JoinError("capture"))??;
        self.processing
            .join()
            .map_err(|_| PipelineError::JoinError("tracking"))?;
        let drain = self
            .drain
            .join()
            .map_err(|_| PipelineError::JoinError("output drain"))?;

        let mut recorded_frames = 0;
        if let Some((handle, results)) = self.recorder {
            // the drain held the only sender, so the recorder has finished
            handle.join().map_err(|_| PipelineError::JoinError("recorder"))?;
            for result in results.try_iter() {
                recorded_frames += result? as u64;
            }
        }
        info!("pipeline : shut down.");
        Ok(PipelineSummary {
            capture,
            drain,
            recorded_frames,
        })
    }
}

// Commandline argument parser using clap for PlaneScope

use crate::capture::{CaptureSource, SyntheticSource, WavSource};
use crate::config::{Config, ConfigError};
use crate::pipeline::PipelineError;
use crate::vector::{Vec3, VectorInput};
use clap::{Args, Parser, Subcommand};
use nom::{
    character::complete::{char, multispace0},
    combinator::{all_consuming, map},
    error::Error,
    multi::separated_list1,
    number::complete::double,
    sequence::{delimited, tuple},
    Finish, IResult,
};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

#[derive(Debug, Parser, Clone)]
#[clap(version, about)]
pub struct ScopeArgs {
    #[command(subcommand)]
    /// Where the audio comes from
    pub source: SourceCommand,

    /// RON configuration file; built-in defaults are used without one
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Stop after this many processing windows
    #[arg(short = 'n', long = "frames")]
    pub frames: Option<u64>,

    /// Outlier probabilities of the trackers to run side by side
    #[arg(short = 'o', long = "outliers")]
    #[clap(num_args = 1..)]
    pub outliers: Vec<f64>,

    /// Microphone positions in the array frame, e.g. "0.03,0,0; -0.03,0,0"
    #[arg(short = 'm', long = "mics")]
    pub mics: Option<MicLayout>,

    /// Sample rate of the capture, in Hz
    #[arg(short = 's', long = "samp")]
    pub samp_rate: Option<u32>,

    /// Seed for every random number generator
    #[arg(long = "seed")]
    pub seed: Option<u64>,

    /// Run as fast as possible instead of in real time
    #[arg(long = "fast")]
    pub fast: bool,

    /// Record the pass-through audio to this WAV file
    #[arg(short = 'r', long = "record")]
    pub record: Option<PathBuf>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum SourceCommand {
    /// Simulate a source sweeping along the first plane
    #[command(about)]
    Synthetic(SyntheticCommand),

    /// Replay a multichannel WAV file, one channel per microphone
    #[command(about)]
    Wav(WavCommand),
}

#[derive(Debug, Args, Clone)]
pub struct SyntheticCommand {
    /// Middle of the sweep, in metres along the plane
    #[arg(long, default_value_t = 0.0)]
    pub center: f64,

    /// Half the length of the sweep, in metres
    #[arg(long, default_value_t = 1.0)]
    pub sweep: f64,

    /// Seconds for one back-and-forth sweep
    #[arg(long, default_value_t = 8.0)]
    pub period: f64,

    /// Fraction of each half second during which the source is audible
    #[arg(long, default_value_t = 1.0)]
    pub duty: f64,

    /// Peak amplitude of the per-channel noise
    #[arg(long, default_value_t = 0.01)]
    pub noise: f64,
}

#[derive(Debug, Args, Clone)]
pub struct WavCommand {
    /// The file to replay
    #[arg(short = 'f', long = "file")]
    pub file: PathBuf,

    /// Start over when the file runs out
    #[arg(short = 'l', long = "loop")]
    pub looped: bool,
}

/// Microphone positions given on the command line, as semicolon separated
/// `x,y,z` triples.
#[derive(Debug, Clone, PartialEq)]
pub struct MicLayout(pub Vec<Vec3>);

fn parse_component(s: &str) -> IResult<&str, f64> {
    delimited(multispace0, double, multispace0)(s)
}

fn parse_position(s: &str) -> IResult<&str, Vec3> {
    map(
        tuple((
            parse_component,
            char(','),
            parse_component,
            char(','),
            parse_component,
        )),
        |(x, _, y, _, z)| Vec3::new(x, y, z),
    )(s)
}

fn parse_layout(s: &str) -> IResult<&str, Vec<Vec3>> {
    all_consuming(separated_list1(char(';'), parse_position))(s)
}

impl FromStr for MicLayout {
    type Err = Error<String>;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match parse_layout(s).finish() {
            Ok((_remaining, positions)) => Ok(MicLayout(positions)),
            Err(Error { input, code }) => Err(Error {
                input: input.to_string(),
                code,
            }),
        }
    }
}

impl ScopeArgs {
    /// Loads the config file, if any, and applies the overrides given on
    /// the command line.
    pub fn load_config(&self) -> Result<Config, ConfigError> {
        let mut config = match &self.config {
            Some(path) => Config::from_path(path)?,
            None => Config::default(),
        };
        if let Some(MicLayout(mics)) = &self.mics {
            config.mic_layout = mics.iter().map(|m| VectorInput::from(*m)).collect();
            config.n_channels_in = mics.len();
        }
        if !self.outliers.is_empty() {
            config.outlier_probs = self.outliers.clone();
        }
        if let Some(rate) = self.samp_rate {
            config.sample_rate = rate;
        }
        if let Some(seed) = self.seed {
            config.tracker.seed = Some(seed);
        }
        config.validate()?;
        Ok(config)
    }

    /// Opens the capture source named by the subcommand.
    pub fn open_source(&self, config: &Config) -> Result<Box<dyn CaptureSource>, PipelineError> {
        match &self.source {
            SourceCommand::Synthetic(cmd) => {
                let space = Arc::new(config.build_search_space()?);
                let source = SyntheticSource::builder(space, config.mic_positions()?)
                    .sample_rate(config.sample_rate)
                    .center(cmd.center)
                    .sweep(cmd.sweep)
                    .period(cmd.period)
                    .duty(cmd.duty)
                    .noise(cmd.noise)
                    .seed(self.seed)
                    .build()?;
                Ok(Box::new(source))
            }
            SourceCommand::Wav(cmd) => {
                let source = WavSource::open(&cmd.file, cmd.looped)?;
                Ok(Box::new(source))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_layout() {
        let layout: MicLayout = "0.03,0,0; -0.01, 0, 0;0.01,0,0 ;-3e-2,0,0".parse().unwrap();
        assert_eq!(
            layout,
            MicLayout(vec![
                Vec3::new(0.03, 0.0, 0.0),
                Vec3::new(-0.01, 0.0, 0.0),
                Vec3::new(0.01, 0.0, 0.0),
                Vec3::new(-0.03, 0.0, 0.0),
            ])
        );
    }

    #[test]
    fn rejects_bad_layouts() {
        assert!("0.03,0".parse::<MicLayout>().is_err());
        assert!("0.03,0,0;".parse::<MicLayout>().is_err());
        assert!("0.03,0,0,1".parse::<MicLayout>().is_err());
        assert!("".parse::<MicLayout>().is_err());
    }

    #[test]
    fn parses_synthetic_command_line() {
        let args = ScopeArgs::try_parse_from([
            "planescope",
            "--frames",
            "20",
            "--outliers",
            "0.0",
            "0.5",
            "--mics",
            "0.05,0,0;-0.05,0,0",
            "--seed",
            "4",
            "synthetic",
            "--sweep",
            "0.5",
        ])
        .unwrap();
        assert_eq!(args.frames, Some(20));
        assert!(matches!(&args.source, SourceCommand::Synthetic(cmd) if cmd.sweep == 0.5));

        let config = args.load_config().unwrap();
        assert_eq!(config.n_channels_in, 2);
        assert_eq!(config.outlier_probs, vec![0.0, 0.5]);
        assert_eq!(config.tracker.seed, Some(4));

        let source = args.open_source(&config).unwrap();
        assert_eq!(source.n_channels(), 2);
        assert_eq!(source.sample_rate(), 44100);
    }

    #[test]
    fn parses_wav_command_line() {
        let args =
            ScopeArgs::try_parse_from(["planescope", "--fast", "wav", "-f", "in.wav", "--loop"])
                .unwrap();
        assert!(args.fast);
        match args.source {
            SourceCommand::Wav(cmd) => {
                assert_eq!(cmd.file, PathBuf::from("in.wav"));
                assert!(cmd.looped);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn rejects_out_of_range_outliers() {
        let args =
            ScopeArgs::try_parse_from(["planescope", "-o", "1.5", "--fast", "synthetic"]).unwrap();
        assert!(args.load_config().is_err());
    }
}

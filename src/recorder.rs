//! A wrapper for the hound WavWriter that records the pipeline's output
//! blocks to a file.

use crate::component::{Component, ComponentError};
use hound::{SampleFormat, WavSpec, WavWriter};
use std::fmt;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

/// Writes interleaved `f32` blocks to a 32-bit float WAV file.
pub struct WavRecorder {
    writer: Option<WavWriter<BufWriter<File>>>,
    n_channels: usize,
}

impl WavRecorder {
    /// Creates (or truncates) `path`.
    pub fn create(
        path: impl AsRef<Path>,
        n_channels: u16,
        sample_rate: u32,
    ) -> Result<Self, hound::Error> {
        let spec = WavSpec {
            channels: n_channels,
            sample_rate,
            bits_per_sample: 32,
            sample_format: SampleFormat::Float,
        };
        Ok(Self {
            writer: Some(WavWriter::create(path, spec)?),
            n_channels: n_channels as usize,
        })
    }
}

impl Component for WavRecorder {
    type InData = Vec<f32>;
    type OutData = Result<usize, hound::Error>;

    /// Appends a block and returns how many frames it held.
    fn convert(&mut self, block: Vec<f32>) -> Result<usize, hound::Error> {
        let writer = match self.writer.as_mut() {
            Some(writer) => writer,
            None => return Ok(0),
        };
        for sample in &block {
            writer.write_sample(*sample)?;
        }
        // keep the header current so a killed process leaves a readable file
        writer.flush()?;
        Ok(block.len() / self.n_channels.max(1))
    }

    fn finalize(&mut self) -> Result<(), ComponentError> {
        match self.writer.take() {
            Some(writer) => Ok(writer.finalize()?),
            None => Ok(()),
        }
    }
}

impl fmt::Display for WavRecorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WavRecorder")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hound::WavReader;
    use tempfile::tempdir;

    #[test]
    fn records_blocks() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.wav");

        let mut recorder = WavRecorder::create(&path, 2, 16000).unwrap();
        assert_eq!(recorder.convert(vec![0.25, -0.25, 0.5, -0.5]).unwrap(), 2);
        assert_eq!(recorder.convert(vec![0.0; 6]).unwrap(), 3);
        recorder.finalize().unwrap();
        // finalizing twice is harmless
        recorder.finalize().unwrap();
        assert_eq!(recorder.convert(vec![1.0; 2]).unwrap(), 0);

        let mut reader = WavReader::open(&path).unwrap();
        assert_eq!(reader.spec().channels, 2);
        assert_eq!(reader.spec().sample_rate, 16000);
        let samples: Vec<f32> = reader.samples::<f32>().map(|s| s.unwrap()).collect();
        assert_eq!(samples.len(), 10);
        assert_eq!(&samples[..4], &[0.25, -0.25, 0.5, -0.5]);
    }
}

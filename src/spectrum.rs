//! Turns a window of interleaved time-domain samples into one spectral
//! frame per channel. This is the feature extraction boundary: the tracker
//! only ever sees [SpectralFrame]s, so anything that can produce them can
//! stand in for [HannSpectrum].

use rustfft::num_complex::Complex64;
use rustfft::{Fft, FftPlanner};
use std::f64::consts::PI;
use std::sync::Arc;

/// The one-sided spectrum of each channel of a window, `dft_len / 2 + 1`
/// bins per channel.
#[derive(Debug, Clone, PartialEq)]
pub struct SpectralFrame {
    channels: Vec<Vec<Complex64>>,
}

impl SpectralFrame {
    pub fn new(channels: Vec<Vec<Complex64>>) -> Self {
        Self { channels }
    }

    pub fn n_channels(&self) -> usize {
        self.channels.len()
    }

    /// Bin count of the first channel; zero for an empty frame.
    pub fn n_bins(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    /// Whether every channel has the same number of bins.
    pub fn is_rectangular(&self) -> bool {
        let n = self.n_bins();
        self.channels.iter().all(|c| c.len() == n)
    }

    pub fn channel(&self, index: usize) -> &[Complex64] {
        &self.channels[index]
    }

    pub fn channels(&self) -> &[Vec<Complex64>] {
        &self.channels
    }

    /// Mean power per bin per channel.
    pub fn energy(&self) -> f64 {
        let count: usize = self.channels.iter().map(Vec::len).sum();
        if count == 0 {
            return 0.0;
        }
        let total: f64 = self.channels.iter().flatten().map(|c| c.norm_sqr()).sum();
        total / count as f64
    }
}

/// Anything that produces a spectral frame from a window of samples.
pub trait FeatureExtractor {
    /// Channels expected in each window.
    fn n_channels(&self) -> usize;

    /// Frames expected in each window.
    fn window_len(&self) -> usize;

    /// Transforms an interleaved window of `window_len * n_channels`
    /// samples. Short windows are zero padded, long ones truncated.
    fn extract(&mut self, window: &[f32]) -> SpectralFrame;
}

/// A Hann-windowed real FFT over each channel.
pub struct HannSpectrum {
    fft: Arc<dyn Fft<f64>>,
    window: Vec<f64>,
    n_channels: usize,
    scratch: Vec<Complex64>,
}

impl HannSpectrum {
    /// One window of `dft_len` frames, transformed with a `dft_len` point
    /// FFT.
    pub fn new(dft_len: usize, n_channels: usize) -> Self {
        let mut planner = FftPlanner::<f64>::new();
        let fft = planner.plan_fft_forward(dft_len);
        // periodic Hann
        let window = (0..dft_len)
            .map(|n| 0.5 - 0.5 * (2.0 * PI * n as f64 / dft_len as f64).cos())
            .collect();
        Self {
            fft,
            window,
            n_channels,
            scratch: vec![Complex64::new(0.0, 0.0); dft_len],
        }
    }

    pub fn dft_len(&self) -> usize {
        self.window.len()
    }
}

impl FeatureExtractor for HannSpectrum {
    fn n_channels(&self) -> usize {
        self.n_channels
    }

    fn window_len(&self) -> usize {
        self.window.len()
    }

    fn extract(&mut self, window: &[f32]) -> SpectralFrame {
        let dft_len = self.window.len();
        let n_bins = dft_len / 2 + 1;
        let channels = (0..self.n_channels)
            .map(|ch| {
                for (n, slot) in self.scratch.iter_mut().enumerate() {
                    let sample = window
                        .get(n * self.n_channels + ch)
                        .copied()
                        .unwrap_or(0.0) as f64;
                    *slot = Complex64::new(sample * self.window[n], 0.0);
                }
                self.fft.process(&mut self.scratch);
                self.scratch[..n_bins].to_vec()
            })
            .collect();
        SpectralFrame::new(channels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_shape() {
        let mut spec = HannSpectrum::new(64, 3);
        let frame = spec.extract(&vec![0.5; 64 * 3]);
        assert_eq!(frame.n_channels(), 3);
        assert_eq!(frame.n_bins(), 33);
        assert!(frame.is_rectangular());
    }

    #[test]
    fn sine_peaks_in_its_bin() {
        let dft_len = 256;
        let bin = 20;
        let mut spec = HannSpectrum::new(dft_len, 2);
        let window: Vec<f32> = (0..dft_len)
            .flat_map(|n| {
                let s = (2.0 * PI * bin as f64 * n as f64 / dft_len as f64).sin() as f32;
                [s, 0.0]
            })
            .collect();
        let frame = spec.extract(&window);
        let peak = frame
            .channel(0)
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.norm().total_cmp(&b.1.norm()))
            .map(|(i, _)| i);
        assert_eq!(peak, Some(bin));
        assert!(frame.channel(1).iter().all(|c| c.norm() < 1e-9));
    }

    #[test]
    fn silence_has_no_energy() {
        let mut spec = HannSpectrum::new(32, 2);
        assert_eq!(spec.extract(&[0.0; 64]).energy(), 0.0);
        assert_eq!(SpectralFrame::new(vec![]).energy(), 0.0);
    }
}

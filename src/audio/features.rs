//! Spectral feature extraction for the acoustic trigger
//!
//! Each fixed-size mono block is reduced to two numbers: its peak absolute
//! amplitude and the share of spectral energy that falls inside the horn band.

use std::f32::consts::PI;
use std::ops::Range;
use std::sync::Arc;

use rustfft::{num_complex::Complex, Fft, FftPlanner};
use tokio::time::Instant;

/// Features of one audio block
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpectralFrame {
    pub amplitude_peak: f32,
    pub band_energy_ratio: f32,
    pub captured_at: Instant,
}

/// FFT-based band energy analyzer
///
/// The FFT plan, window and scratch buffers are allocated up front so that
/// per-block analysis is allocation free.
pub struct SpectralExtractor {
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    buffer: Vec<Complex<f32>>,
    scratch: Vec<Complex<f32>>,
    band_bins: Range<usize>,
    sample_rate: u32,
}

impl SpectralExtractor {
    pub fn new(sample_rate: u32, block_size: usize, band_hz: (f32, f32)) -> Self {
        let block_size = block_size.max(2);
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(block_size);
        let scratch = vec![Complex::new(0.0, 0.0); fft.get_inplace_scratch_len()];

        let window = (0..block_size).map(|i| hann_window(i, block_size)).collect();

        Self {
            band_bins: band_bins(sample_rate, block_size, band_hz),
            fft,
            window,
            buffer: vec![Complex::new(0.0, 0.0); block_size],
            scratch,
            sample_rate,
        }
    }

    pub fn block_size(&self) -> usize {
        self.window.len()
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Peak absolute amplitude of a block
    pub fn amplitude_peak(block: &[f32]) -> f32 {
        block.iter().fold(0.0f32, |peak, s| peak.max(s.abs()))
    }

    /// Ratio of in-band energy to total energy (DC excluded), in [0, 1]
    ///
    /// Blocks shorter than the configured size are zero-padded; longer blocks
    /// are truncated.
    pub fn band_energy_ratio(&mut self, block: &[f32]) -> f32 {
        for (i, slot) in self.buffer.iter_mut().enumerate() {
            let sample = block.get(i).copied().unwrap_or(0.0);
            *slot = Complex::new(sample * self.window[i], 0.0);
        }

        self.fft.process_with_scratch(&mut self.buffer, &mut self.scratch);

        let nyquist_bin = self.buffer.len() / 2;
        let mut total = 0.0f32;
        let mut in_band = 0.0f32;
        for (bin, value) in self.buffer[1..=nyquist_bin].iter().enumerate() {
            let energy = value.norm_sqr();
            total += energy;
            if self.band_bins.contains(&(bin + 1)) {
                in_band += energy;
            }
        }

        if total <= f32::EPSILON {
            0.0
        } else {
            (in_band / total).clamp(0.0, 1.0)
        }
    }

    /// Both features for one block
    pub fn extract(&mut self, block: &[f32], captured_at: Instant) -> SpectralFrame {
        SpectralFrame {
            amplitude_peak: Self::amplitude_peak(block),
            band_energy_ratio: self.band_energy_ratio(block),
            captured_at,
        }
    }
}

/// FFT bins whose center frequency lies inside `band_hz` (inclusive)
fn band_bins(sample_rate: u32, block_size: usize, band_hz: (f32, f32)) -> Range<usize> {
    let bin_width = sample_rate as f32 / block_size as f32;
    let nyquist_bin = block_size / 2;
    let (low, high) = if band_hz.0 <= band_hz.1 {
        band_hz
    } else {
        (band_hz.1, band_hz.0)
    };

    let first = ((low / bin_width).ceil() as usize).max(1);
    let last = ((high / bin_width).floor() as usize).min(nyquist_bin);
    first..(last + 1).max(first)
}

/// Hann window function for FFT analysis
pub fn hann_window(index: usize, size: usize) -> f32 {
    0.5 * (1.0 - ((2.0 * PI * index as f32) / (size as f32 - 1.0)).cos())
}

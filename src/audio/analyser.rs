//! Frequency analyser producing byte-scaled bin magnitudes
//!
//! Works like a browser `AnalyserNode`: the most recent `fft_size` mono
//! samples are Blackman-windowed, transformed, smoothed over time and mapped
//! from the [-100 dB, -30 dB] range onto 0..=255.

use anyhow::{bail, Result};
use realfft::{RealFftPlanner, RealToComplex};
use std::collections::VecDeque;
use std::sync::Arc;

/// Transform size used by the clap detector
pub const FFT_SIZE: usize = 256;

const SMOOTHING_TIME_CONSTANT: f32 = 0.8;
const MIN_DECIBELS: f32 = -100.0;
const MAX_DECIBELS: f32 = -30.0;

pub struct SpectrumAnalyser {
    fft_size: usize,
    fft: Arc<dyn RealToComplex<f32>>,
    window: Vec<f32>,
    history: VecDeque<f32>,
    input: Vec<f32>,
    output: Vec<realfft::num_complex::Complex<f32>>,
    scratch: Vec<realfft::num_complex::Complex<f32>>,
    smoothed: Vec<f32>,
    closed: bool,
}

impl SpectrumAnalyser {
    /// Create an analyser; `fft_size` must be a power of two in 32..=32768.
    pub fn new(fft_size: usize) -> Result<Self> {
        if !fft_size.is_power_of_two() || !(32..=32768).contains(&fft_size) {
            bail!("FFT size must be a power of two between 32 and 32768, got {}", fft_size);
        }

        let fft = RealFftPlanner::<f32>::new().plan_fft_forward(fft_size);
        let input = fft.make_input_vec();
        let output = fft.make_output_vec();
        let scratch = fft.make_scratch_vec();

        Ok(Self {
            fft_size,
            window: blackman_window(fft_size),
            history: VecDeque::from(vec![0.0; fft_size]),
            input,
            output,
            scratch,
            smoothed: vec![0.0; fft_size / 2],
            fft,
            closed: false,
        })
    }

    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    /// Number of bins returned per analysis (half the transform size)
    pub fn frequency_bin_count(&self) -> usize {
        self.fft_size / 2
    }

    /// Append newly captured mono samples, keeping only the latest window.
    pub fn push_samples(&mut self, samples: &[f32]) {
        let skip = samples.len().saturating_sub(self.fft_size);
        for &s in &samples[skip..] {
            self.history.pop_front();
            self.history.push_back(s);
        }
    }

    /// Fill `out` with the current byte magnitudes (one value per bin).
    pub fn byte_frequency_data(&mut self, out: &mut [u8]) -> Result<()> {
        if self.closed {
            bail!("Analyser is closed");
        }

        for ((dst, &sample), &w) in self.input.iter_mut().zip(&self.history).zip(&self.window) {
            *dst = sample * w;
        }

        self.fft
            .process_with_scratch(&mut self.input, &mut self.output, &mut self.scratch)
            .map_err(|e| anyhow::anyhow!("FFT failed: {}", e))?;

        let scale = 1.0 / self.fft_size as f32;
        let range = MAX_DECIBELS - MIN_DECIBELS;

        for (k, dst) in out.iter_mut().take(self.smoothed.len()).enumerate() {
            let magnitude = self.output[k].norm() * scale;
            let prev = self.smoothed[k];
            let mut smoothed =
                SMOOTHING_TIME_CONSTANT * prev + (1.0 - SMOOTHING_TIME_CONSTANT) * magnitude;
            if !smoothed.is_finite() {
                smoothed = 0.0;
            }
            self.smoothed[k] = smoothed;

            let db = 20.0 * smoothed.log10();
            let scaled = (u8::MAX as f32 / range) * (db - MIN_DECIBELS);
            *dst = if scaled.is_nan() {
                0
            } else {
                scaled.clamp(0.0, u8::MAX as f32) as u8
            };
        }

        Ok(())
    }

    /// Release the analyser; later reads fail.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            bail!("Analyser already closed");
        }
        self.closed = true;
        self.history.clear();
        Ok(())
    }
}

fn blackman_window(n: usize) -> Vec<f32> {
    let alpha = 0.16f32;
    let a0 = 0.5 * (1.0 - alpha);
    let a1 = 0.5;
    let a2 = 0.5 * alpha;
    (0..n)
        .map(|i| {
            let x = i as f32 / n as f32;
            a0 - a1 * (2.0 * std::f32::consts::PI * x).cos()
                + a2 * (4.0 * std::f32::consts::PI * x).cos()
        })
        .collect()
}

//! Live visualizer feed.
//!
//! Collects raw samples from the capture callback, computes a frequency-domain
//! snapshot per rendering tick (windowed FFT reduced to a fixed number of
//! bars), applies EMA smoothing, and publishes `VisualizerFrame`s for the UI
//! consumer at ~30fps. The emitter runs only while the session is actively
//! recording: a watch gate suspends it during pause, and a cancellation token
//! stops it the tick after the session leaves the recording state.

use std::collections::VecDeque;
use std::time::Duration;

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::interval;
use tokio_util::sync::CancellationToken;

use crate::EngineEvent;

/// Number of visualization bars.
pub const NUM_BARS: usize = 48;

/// FFT window length in samples.
const FFT_SIZE: usize = 1024;

/// Ring buffer capacity (~250ms at 16kHz mono).
const BUFFER_CAPACITY: usize = 4096;

/// EMA smoothing factor (0.3 = 30% new value, 70% previous).
const EMA_ALPHA: f32 = 0.3;

/// A derived, ephemeral snapshot of signal energy: `NUM_BARS` normalized
/// magnitudes in `[0, 1]`, low frequencies first.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VisualizerFrame {
    pub bars: Vec<f32>,
}

/// Ring buffer for the samples feeding the analyzer.
pub struct SampleBuffer {
    samples: VecDeque<i16>,
    capacity: usize,
}

impl SampleBuffer {
    pub fn new() -> Self {
        Self {
            samples: VecDeque::with_capacity(BUFFER_CAPACITY),
            capacity: BUFFER_CAPACITY,
        }
    }

    /// Add samples, discarding the oldest once at capacity.
    pub fn push_samples(&mut self, samples: &[i16]) {
        let len = samples.len();

        // If the incoming window alone exceeds capacity, keep its tail.
        if len >= self.capacity {
            self.samples.clear();
            self.samples.extend(&samples[len - self.capacity..]);
            return;
        }

        let to_remove = (self.samples.len() + len).saturating_sub(self.capacity);
        if to_remove > 0 {
            self.samples.drain(0..to_remove);
        }

        self.samples.extend(samples);
    }

    /// The most recent `n` samples normalized to `[-1, 1]`, zero-padded at
    /// the front when fewer are available.
    pub fn latest(&self, n: usize) -> Vec<f32> {
        let mut out = vec![0.0f32; n];
        let have = self.samples.len().min(n);
        let start = self.samples.len() - have;
        for (i, sample) in self.samples.iter().skip(start).enumerate() {
            out[n - have + i] = *sample as f32 / i16::MAX as f32;
        }
        out
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.samples.len()
    }
}

impl Default for SampleBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Reduces a sample window to `NUM_BARS` frequency buckets.
///
/// Applies a Hann window, runs a forward FFT, and averages contiguous
/// frequency bins (DC excluded) into each bar.
pub struct SpectrumAnalyzer {
    fft: Arc<dyn Fft<f32>>,
    hann: Vec<f32>,
}

impl SpectrumAnalyzer {
    pub fn new() -> Self {
        let fft = FftPlanner::<f32>::new().plan_fft_forward(FFT_SIZE);
        let hann = (0..FFT_SIZE)
            .map(|n| {
                let x = n as f32 / (FFT_SIZE - 1) as f32;
                0.5 * (1.0 - (2.0 * std::f32::consts::PI * x).cos())
            })
            .collect();
        Self { fft, hann }
    }

    /// Compute bars from a window of `FFT_SIZE` normalized samples.
    pub fn compute(&self, window: &[f32]) -> [f32; NUM_BARS] {
        debug_assert_eq!(window.len(), FFT_SIZE);

        let mut buffer: Vec<Complex<f32>> = window
            .iter()
            .zip(self.hann.iter())
            .map(|(s, w)| Complex::new(s * w, 0.0))
            .collect();
        self.fft.process(&mut buffer);

        // Usable bins: 1..FFT_SIZE/2 (skip DC, skip the mirrored half).
        let usable = FFT_SIZE / 2 - 1;
        let bins_per_bar = (usable / NUM_BARS).max(1);
        let scale = 4.0 / FFT_SIZE as f32;

        let mut bars = [0.0f32; NUM_BARS];
        for (bar_idx, bar) in bars.iter_mut().enumerate() {
            let start = 1 + bar_idx * bins_per_bar;
            let end = (start + bins_per_bar).min(FFT_SIZE / 2);
            if start >= end {
                break;
            }

            let sum: f32 = buffer[start..end]
                .iter()
                .map(|c| (c.norm() * scale).clamp(0.0, 1.0))
                .sum();
            let mean = sum / (end - start) as f32;

            // Square root lifts quiet signal into the visible range.
            *bar = mean.sqrt().clamp(0.0, 1.0);
        }

        bars
    }
}

impl Default for SpectrumAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

/// EMA (Exponential Moving Average) smoothing state.
///
/// smoothed[i] = alpha * current[i] + (1 - alpha) * previous[i]
struct EmaState {
    prev_bars: [f32; NUM_BARS],
    initialized: bool,
}

impl EmaState {
    fn new() -> Self {
        Self {
            prev_bars: [0.0f32; NUM_BARS],
            initialized: false,
        }
    }

    fn apply(&mut self, bars: &mut [f32; NUM_BARS]) {
        if !self.initialized {
            // First frame: use raw values as initial state.
            self.prev_bars = *bars;
            self.initialized = true;
            return;
        }

        for (bar, prev) in bars.iter_mut().zip(self.prev_bars.iter()) {
            *bar = EMA_ALPHA * *bar + (1.0 - EMA_ALPHA) * prev;
        }

        self.prev_bars = *bars;
    }

    fn reset(&mut self) {
        self.prev_bars = [0.0f32; NUM_BARS];
        self.initialized = false;
    }
}

/// Run the visualizer emitter task.
///
/// Each tick it drains the sample channel into the ring buffer and, while the
/// gate reads true, publishes one smoothed `VisualizerFrame`. The task exits
/// when the cancellation token fires; no frame is read or published after
/// that tick.
pub async fn run_waveform_emitter(
    events: broadcast::Sender<EngineEvent>,
    mut samples_rx: mpsc::Receiver<Vec<i16>>,
    gate_rx: watch::Receiver<bool>,
    cancel: CancellationToken,
    frame_interval: Duration,
) {
    let mut buffer = SampleBuffer::new();
    let analyzer = SpectrumAnalyzer::new();
    let mut ema = EmaState::new();
    let mut tick = interval(frame_interval);

    log::debug!("visualizer emitter started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {
                while let Ok(samples) = samples_rx.try_recv() {
                    buffer.push_samples(&samples);
                }

                // Suspended while paused: no reads, no frames.
                if !*gate_rx.borrow() {
                    continue;
                }

                let window = buffer.latest(FFT_SIZE);
                let mut bars = analyzer.compute(&window);
                ema.apply(&mut bars);

                let _ = events.send(EngineEvent::Visualizer {
                    frame: VisualizerFrame {
                        bars: bars.to_vec(),
                    },
                });
            }
        }
    }

    buffer.clear();
    ema.reset();

    log::debug!("visualizer emitter stopped");
}

//! Audio pipeline for the voice-note engine.
//!
//! Capture (CPAL), in-memory artifact assembly (hound WAV container), the
//! live visualizer feed, and playback (rodio).

pub mod artifact;
pub mod capture;
pub mod playback;
pub mod waveform;

pub use artifact::{Chunk, FinalizedArtifact, PlaybackLocator, VoiceNote};
pub use capture::{AudioCapture, CaptureError, CaptureFormat, CaptureHandle};
pub use playback::{
    format_timestamp, AudioSink, NullSink, PlaybackEngine, PlaybackError, PlaybackState,
    PlayerEvent, RodioSink,
};
pub use waveform::{run_waveform_emitter, SampleBuffer, SpectrumAnalyzer, VisualizerFrame, NUM_BARS};

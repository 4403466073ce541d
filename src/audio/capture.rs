//! Microphone capture using CPAL.
//!
//! The capture device is acquired on a dedicated OS thread because cpal
//! streams are not `Send`; the session owns a `CaptureHandle` that talks to
//! the thread over a command channel. The audio callback converts incoming
//! samples to 16-bit PCM, emits one encoded chunk per configured interval,
//! and mirrors the raw samples to the visualizer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample, StreamConfig};
use tokio::sync::mpsc;

use super::artifact::Chunk;
use crate::settings::EngineSettings;
use crate::state_machine::SessionError;

/// Errors that can occur while acquiring or running the capture device.
#[derive(Debug, Clone)]
pub enum CaptureError {
    PermissionDenied(String),
    NoInputDevice,
    NoSupportedConfig,
    StreamCreationFailed(String),
}

impl std::fmt::Display for CaptureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CaptureError::PermissionDenied(e) => write!(f, "microphone access denied: {}", e),
            CaptureError::NoInputDevice => write!(f, "no audio input device found"),
            CaptureError::NoSupportedConfig => write!(f, "no supported audio configuration"),
            CaptureError::StreamCreationFailed(e) => {
                write!(f, "failed to create audio stream: {}", e)
            }
        }
    }
}

impl std::error::Error for CaptureError {}

impl From<CaptureError> for SessionError {
    fn from(err: CaptureError) -> Self {
        match err {
            CaptureError::PermissionDenied(message) => SessionError::PermissionDenied { message },
            CaptureError::NoInputDevice => SessionError::DeviceUnavailable {
                message: "no audio input device found".into(),
            },
            CaptureError::NoSupportedConfig => SessionError::DeviceUnavailable {
                message: "no supported audio configuration".into(),
            },
            CaptureError::StreamCreationFailed(message) => {
                SessionError::DeviceUnavailable { message }
            }
        }
    }
}

/// Negotiated stream format, carried into artifact finalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureFormat {
    pub sample_rate: u32,
    pub channels: u16,
}

impl Default for CaptureFormat {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            channels: 1,
        }
    }
}

enum CaptureCmd {
    Pause,
    Resume,
    Shutdown,
}

/// Handle to a live capture thread. Exclusively owned by one session.
///
/// Shutting down sends the stop command and joins the thread, so by the time
/// `shutdown()` returns the device is released. Dropping the handle runs the
/// same path.
pub struct CaptureHandle {
    cmd_tx: std_mpsc::Sender<CaptureCmd>,
    join: Option<thread::JoinHandle<()>>,
    format: CaptureFormat,
}

impl CaptureHandle {
    pub fn format(&self) -> CaptureFormat {
        self.format
    }

    pub fn pause(&self) {
        let _ = self.cmd_tx.send(CaptureCmd::Pause);
    }

    pub fn resume(&self) {
        let _ = self.cmd_tx.send(CaptureCmd::Resume);
    }

    /// Stop the stream and release the device. Idempotent.
    pub fn shutdown(&mut self) {
        let _ = self.cmd_tx.send(CaptureCmd::Shutdown);
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                log::warn!("capture thread panicked during shutdown");
            }
        }
    }
}

impl Drop for CaptureHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Splits a converted sample stream into fixed-size encoded chunks.
struct ChunkAssembler {
    pending: Vec<i16>,
    samples_per_chunk: usize,
}

impl ChunkAssembler {
    fn new(samples_per_chunk: usize) -> Self {
        Self {
            pending: Vec::with_capacity(samples_per_chunk),
            samples_per_chunk: samples_per_chunk.max(1),
        }
    }

    /// Append samples; returns every full chunk that became available.
    fn push(&mut self, samples: &[i16]) -> Vec<Chunk> {
        self.pending.extend_from_slice(samples);
        let mut out = Vec::new();
        while self.pending.len() >= self.samples_per_chunk {
            let rest = self.pending.split_off(self.samples_per_chunk);
            let full = std::mem::replace(&mut self.pending, rest);
            out.push(Chunk::new(
                full.iter().flat_map(|s| s.to_le_bytes()).collect(),
            ));
        }
        out
    }
}

/// Microphone capture factory. Device discovery and stream construction both
/// happen on the capture thread; `start()` blocks until the device is granted
/// or refused, so callers run it under `spawn_blocking`.
pub struct AudioCapture {
    chunk_interval_ms: u64,
}

impl AudioCapture {
    pub fn new(settings: &EngineSettings) -> Self {
        Self {
            chunk_interval_ms: settings.chunk_interval_ms,
        }
    }

    /// Acquire the default input device and start capturing.
    ///
    /// Encoded chunks go to `chunk_tx`, raw sample windows to `waveform_tx`,
    /// and mid-stream failures to `error_tx`.
    pub fn start(
        &self,
        chunk_tx: mpsc::Sender<Chunk>,
        waveform_tx: mpsc::Sender<Vec<i16>>,
        error_tx: mpsc::Sender<String>,
    ) -> Result<CaptureHandle, CaptureError> {
        let (cmd_tx, cmd_rx) = std_mpsc::channel();
        let (ready_tx, ready_rx) = std_mpsc::sync_channel(1);
        let chunk_interval_ms = self.chunk_interval_ms;

        let join = thread::Builder::new()
            .name("voicenote-capture".into())
            .spawn(move || {
                run_capture_thread(
                    chunk_interval_ms,
                    chunk_tx,
                    waveform_tx,
                    error_tx,
                    ready_tx,
                    cmd_rx,
                );
            })
            .map_err(|e| CaptureError::StreamCreationFailed(e.to_string()))?;

        // Blocks until the OS grants or refuses the device (this is where a
        // permission prompt would sit).
        let format = match ready_rx.recv() {
            Ok(Ok(format)) => format,
            Ok(Err(e)) => {
                let _ = join.join();
                return Err(e);
            }
            Err(_) => {
                let _ = join.join();
                return Err(CaptureError::StreamCreationFailed(
                    "capture thread exited before reporting readiness".into(),
                ));
            }
        };

        log::info!(
            "capture started: {} Hz, {} channel(s)",
            format.sample_rate,
            format.channels
        );

        Ok(CaptureHandle {
            cmd_tx,
            join: Some(join),
            format,
        })
    }
}

fn run_capture_thread(
    chunk_interval_ms: u64,
    chunk_tx: mpsc::Sender<Chunk>,
    waveform_tx: mpsc::Sender<Vec<i16>>,
    error_tx: mpsc::Sender<String>,
    ready_tx: std_mpsc::SyncSender<Result<CaptureFormat, CaptureError>>,
    cmd_rx: std_mpsc::Receiver<CaptureCmd>,
) {
    let host = cpal::default_host();

    let device = match host.default_input_device() {
        Some(d) => d,
        None => {
            let _ = ready_tx.send(Err(CaptureError::NoInputDevice));
            return;
        }
    };

    log::info!("using audio input device: {:?}", device.name());

    let supported = match device.default_input_config() {
        Ok(c) => c,
        Err(_) => {
            let _ = ready_tx.send(Err(CaptureError::NoSupportedConfig));
            return;
        }
    };

    let sample_format = supported.sample_format();
    let config: StreamConfig = supported.into();
    let format = CaptureFormat {
        sample_rate: config.sample_rate.0,
        channels: config.channels,
    };

    let samples_per_chunk =
        (format.sample_rate as u64 * format.channels as u64 * chunk_interval_ms / 1000) as usize;

    // Gate checked inside the audio callback; pausing must work even on
    // backends where Stream::pause is unsupported.
    let capturing = Arc::new(AtomicBool::new(true));

    let stream = match build_stream(
        &device,
        &config,
        sample_format,
        samples_per_chunk,
        chunk_tx,
        waveform_tx,
        error_tx,
        capturing.clone(),
    ) {
        Ok(s) => s,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    if let Err(e) = stream.play() {
        let _ = ready_tx.send(Err(CaptureError::StreamCreationFailed(e.to_string())));
        return;
    }

    let _ = ready_tx.send(Ok(format));

    while let Ok(cmd) = cmd_rx.recv() {
        match cmd {
            CaptureCmd::Pause => {
                capturing.store(false, Ordering::SeqCst);
                if let Err(e) = stream.pause() {
                    log::debug!("stream pause unsupported, relying on gate: {}", e);
                }
            }
            CaptureCmd::Resume => {
                capturing.store(true, Ordering::SeqCst);
                if let Err(e) = stream.play() {
                    log::warn!("failed to resume stream: {}", e);
                }
            }
            CaptureCmd::Shutdown => break,
        }
    }

    // Stream dropped here: the device is released.
    log::info!("capture thread exiting, device released");
}

#[allow(clippy::too_many_arguments)]
fn build_stream(
    device: &cpal::Device,
    config: &StreamConfig,
    sample_format: SampleFormat,
    samples_per_chunk: usize,
    chunk_tx: mpsc::Sender<Chunk>,
    waveform_tx: mpsc::Sender<Vec<i16>>,
    error_tx: mpsc::Sender<String>,
    capturing: Arc<AtomicBool>,
) -> Result<cpal::Stream, CaptureError> {
    match sample_format {
        SampleFormat::I16 => build_stream_typed::<i16>(
            device,
            config,
            samples_per_chunk,
            chunk_tx,
            waveform_tx,
            error_tx,
            capturing,
        ),
        SampleFormat::U16 => build_stream_typed::<u16>(
            device,
            config,
            samples_per_chunk,
            chunk_tx,
            waveform_tx,
            error_tx,
            capturing,
        ),
        SampleFormat::F32 => build_stream_typed::<f32>(
            device,
            config,
            samples_per_chunk,
            chunk_tx,
            waveform_tx,
            error_tx,
            capturing,
        ),
        _ => Err(CaptureError::NoSupportedConfig),
    }
}

fn build_stream_typed<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    samples_per_chunk: usize,
    chunk_tx: mpsc::Sender<Chunk>,
    waveform_tx: mpsc::Sender<Vec<i16>>,
    error_tx: mpsc::Sender<String>,
    capturing: Arc<AtomicBool>,
) -> Result<cpal::Stream, CaptureError>
where
    T: SizedSample + Send + 'static,
    i16: FromSample<T>,
{
    let mut assembler = ChunkAssembler::new(samples_per_chunk);

    let err_fn = move |err: cpal::StreamError| {
        log::error!("audio stream error: {}", err);
        let _ = error_tx.try_send(err.to_string());
    };

    let stream = device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                if !capturing.load(Ordering::SeqCst) {
                    return;
                }

                let converted: Vec<i16> = data.iter().map(|s| sample_to_i16(*s)).collect();

                // Mirror samples to the visualizer; dropping a window under
                // backpressure is harmless.
                let _ = waveform_tx.try_send(converted.clone());

                for chunk in assembler.push(&converted) {
                    if chunk_tx.try_send(chunk).is_err() {
                        log::warn!("chunk channel full, dropping a segment");
                    }
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| match e {
            cpal::BuildStreamError::DeviceNotAvailable => CaptureError::NoInputDevice,
            cpal::BuildStreamError::BackendSpecific { err } => {
                CaptureError::PermissionDenied(err.to_string())
            }
            other => CaptureError::StreamCreationFailed(other.to_string()),
        })?;

    Ok(stream)
}

/// Convert any supported sample type to i16 for the encoded chunk stream.
fn sample_to_i16<T>(sample: T) -> i16
where
    T: Sample,
    i16: FromSample<T>,
{
    i16::from_sample(sample)
}

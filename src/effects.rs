//! Effect runner for the recording engine.
//!
//! Executes the effects produced by the state machine: device acquisition and
//! release, pause/resume, the session clock, and session statistics.
//! `CaptureEffectRunner` drives the real microphone; `StubEffectRunner`
//! simulates grants, denials, chunk arrival, and failures for tests and
//! hosts without capture hardware.
//!
//! The runner owns the active-session registry. An entry holds the capture
//! handle, the visualizer gate, and the cancellation token for the session's
//! periodic tasks; removing the entry releases the device synchronously, so
//! a subsequent start can never observe a still-held handle.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::audio::artifact::Chunk;
use crate::audio::capture::{AudioCapture, CaptureFormat, CaptureHandle};
use crate::audio::waveform::run_waveform_emitter;
use crate::metrics::MetricsCollector;
use crate::settings::EngineSettings;
use crate::state_machine::{Effect, Event, SessionError, SessionOutcome};
use crate::EngineEvent;

/// Trait for running effects asynchronously.
/// Completion events are sent back via the provided channel.
pub trait EffectRunner: Send + Sync + 'static {
    fn spawn(&self, effect: Effect, tx: mpsc::Sender<Event>);
}

/// Periodic session clock shared by both runners: ticks until the session is
/// released or the engine goes away. The first tick lands one full period
/// after the start, so a fresh recording reads zero elapsed seconds.
fn spawn_session_clock<F>(id: Uuid, tick: Duration, is_active: F, tx: mpsc::Sender<Event>)
where
    F: Fn() -> bool + Send + 'static,
{
    tokio::spawn(async move {
        let start = tokio::time::Instant::now() + tick;
        let mut interval = tokio::time::interval_at(start, tick);
        loop {
            interval.tick().await;
            if !is_active() {
                log::debug!("clock stopping - session {} released", id);
                break;
            }
            if tx.send(Event::ClockTick { id }).await.is_err() {
                log::debug!("clock stopping - event channel closed");
                break;
            }
        }
    });
}

/// Resources held on behalf of one live session.
struct ActiveSession {
    capture: CaptureHandle,
    /// Visualizer gate: true while sampling is permitted.
    gate: watch::Sender<bool>,
    /// Cancels the session's visualizer task.
    cancel: CancellationToken,
}

/// Real effect runner backed by the CPAL capture pipeline.
pub struct CaptureEffectRunner {
    settings: EngineSettings,
    active: Arc<StdMutex<HashMap<Uuid, ActiveSession>>>,
    metrics: Arc<Mutex<MetricsCollector>>,
    events: broadcast::Sender<EngineEvent>,
}

impl CaptureEffectRunner {
    pub fn new(settings: EngineSettings, events: broadcast::Sender<EngineEvent>) -> Arc<Self> {
        Arc::new(Self {
            settings,
            active: Arc::new(StdMutex::new(HashMap::new())),
            metrics: Arc::new(Mutex::new(MetricsCollector::new())),
            events,
        })
    }

    /// Number of sessions currently holding a device handle.
    pub fn active_sessions(&self) -> usize {
        self.active.lock().unwrap().len()
    }

    pub fn metrics(&self) -> Arc<Mutex<MetricsCollector>> {
        self.metrics.clone()
    }

    /// Release everything held for `id`: cancel the visualizer, close the
    /// gate, stop the capture thread, and drop the device. Idempotent.
    fn release(&self, id: Uuid) {
        let session = self.active.lock().unwrap().remove(&id);
        match session {
            Some(mut session) => {
                session.cancel.cancel();
                let _ = session.gate.send(false);
                session.capture.shutdown();
                log::info!("released capture for session {}", id);
            }
            None => log::debug!("release for session {}: nothing held", id),
        }
    }
}

impl EffectRunner for CaptureEffectRunner {
    fn spawn(&self, effect: Effect, tx: mpsc::Sender<Event>) {
        match effect {
            Effect::AcquireCapture { id } => {
                let settings = self.settings.clone();
                let active = self.active.clone();
                let metrics = self.metrics.clone();
                let events = self.events.clone();

                tokio::spawn(async move {
                    metrics.lock().await.start_session(id);

                    let (chunk_tx, mut chunk_rx) = mpsc::channel::<Chunk>(256);
                    let (waveform_tx, waveform_rx) = mpsc::channel::<Vec<i16>>(64);
                    let (error_tx, mut error_rx) = mpsc::channel::<String>(4);

                    // Device discovery and stream construction block (this is
                    // where a permission prompt sits), so run them off the
                    // async runtime.
                    let capture = AudioCapture::new(&settings);
                    let start = tokio::task::spawn_blocking(move || {
                        capture.start(chunk_tx, waveform_tx, error_tx)
                    })
                    .await;

                    let handle = match start {
                        Ok(Ok(handle)) => handle,
                        Ok(Err(e)) => {
                            let error: SessionError = e.into();
                            metrics.lock().await.session_failed(error.to_string());
                            let _ = tx.send(Event::CaptureStartFail { id, error }).await;
                            return;
                        }
                        Err(e) => {
                            let error = SessionError::DeviceUnavailable {
                                message: format!("capture startup task failed: {}", e),
                            };
                            metrics.lock().await.session_failed(error.to_string());
                            let _ = tx.send(Event::CaptureStartFail { id, error }).await;
                            return;
                        }
                    };

                    let format = handle.format();
                    let (gate_tx, gate_rx) = watch::channel(true);
                    let cancel = CancellationToken::new();

                    tokio::spawn(run_waveform_emitter(
                        events,
                        waveform_rx,
                        gate_rx,
                        cancel.clone(),
                        Duration::from_millis(settings.frame_interval_ms.max(1)),
                    ));

                    // Forward encoded chunks into the engine's event channel.
                    // FIFO delivery through the single channel is what keeps
                    // chunk appends ordered before a stop command.
                    let chunk_fwd = tx.clone();
                    tokio::spawn(async move {
                        while let Some(chunk) = chunk_rx.recv().await {
                            if chunk_fwd
                                .send(Event::ChunkArrived { id, chunk })
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                    });

                    // A stream error mid-capture is fatal for the session.
                    let fail_fwd = tx.clone();
                    tokio::spawn(async move {
                        if let Some(message) = error_rx.recv().await {
                            let _ = fail_fwd
                                .send(Event::CaptureFailed {
                                    id,
                                    error: SessionError::Encoding { message },
                                })
                                .await;
                        }
                    });

                    // Store before reporting: pause/release effects may chase
                    // the grant immediately.
                    active.lock().unwrap().insert(
                        id,
                        ActiveSession {
                            capture: handle,
                            gate: gate_tx,
                            cancel,
                        },
                    );

                    let _ = tx.send(Event::CaptureStartOk { id, format }).await;
                });
            }

            Effect::ReleaseCapture { id } => {
                // Synchronous: by the time the next command is reduced, the
                // device is free.
                self.release(id);
            }

            Effect::PauseCapture { id } => {
                let guard = self.active.lock().unwrap();
                if let Some(session) = guard.get(&id) {
                    session.capture.pause();
                    let _ = session.gate.send(false);
                } else {
                    log::debug!("pause for session {}: nothing held", id);
                }
            }

            Effect::ResumeCapture { id } => {
                let guard = self.active.lock().unwrap();
                if let Some(session) = guard.get(&id) {
                    session.capture.resume();
                    let _ = session.gate.send(true);
                } else {
                    log::debug!("resume for session {}: nothing held", id);
                }
            }

            Effect::StartClock { id } => {
                let active = self.active.clone();
                let tick = Duration::from_millis(self.settings.clock_tick_ms.max(1));
                spawn_session_clock(
                    id,
                    tick,
                    move || active.lock().unwrap().contains_key(&id),
                    tx,
                );
            }

            Effect::TrackStopped {
                id,
                duration_secs,
                artifact_bytes,
            } => {
                let metrics = self.metrics.clone();
                tokio::spawn(async move {
                    let mut m = metrics.lock().await;
                    if m.is_active_session(id) {
                        m.session_stopped(duration_secs, artifact_bytes as u64);
                    }
                });
            }

            Effect::FinishSession { id, outcome } => {
                let metrics = self.metrics.clone();
                tokio::spawn(async move {
                    let mut m = metrics.lock().await;
                    if m.is_active_session(id) {
                        m.session_finished(outcome);
                    }
                });
            }

            Effect::EmitState
            | Effect::EmitElapsed { .. }
            | Effect::EmitArtifactReady { .. }
            | Effect::EmitCommitted { .. }
            | Effect::EmitError { .. } => {
                unreachable!("emit effects are handled in run_state_loop");
            }
        }
    }
}

/// Scriptable effect runner for tests and hosts without a microphone.
///
/// Simulates the grant/denial latency of a permission prompt, synthetic
/// chunk arrival at the configured interval, and an optional mid-stream
/// failure after a given number of chunks.
pub struct StubEffectRunner {
    settings: EngineSettings,
    deny_permission: bool,
    grant_delay: Duration,
    fail_after_chunks: Option<usize>,
    active: Arc<StdMutex<HashSet<Uuid>>>,
    paused: Arc<StdMutex<HashSet<Uuid>>>,
    finished: Arc<StdMutex<Vec<(Uuid, SessionOutcome)>>>,
}

impl StubEffectRunner {
    /// A runner that grants the device after a short simulated prompt.
    pub fn granting(settings: EngineSettings) -> Self {
        Self {
            settings,
            deny_permission: false,
            grant_delay: Duration::from_millis(10),
            fail_after_chunks: None,
            active: Arc::new(StdMutex::new(HashSet::new())),
            paused: Arc::new(StdMutex::new(HashSet::new())),
            finished: Arc::new(StdMutex::new(Vec::new())),
        }
    }

    /// A runner that refuses every acquisition.
    pub fn denying(settings: EngineSettings) -> Self {
        Self {
            deny_permission: true,
            ..Self::granting(settings)
        }
    }

    /// Stretch the simulated permission prompt.
    pub fn grant_delay(mut self, delay: Duration) -> Self {
        self.grant_delay = delay;
        self
    }

    /// Inject a capture failure after `n` synthetic chunks.
    pub fn fail_after_chunks(mut self, n: usize) -> Self {
        self.fail_after_chunks = Some(n);
        self
    }

    /// Number of sessions currently holding the simulated device.
    pub fn active_sessions(&self) -> usize {
        self.active.lock().unwrap().len()
    }

    /// Terminal outcomes reported so far, in order.
    pub fn finished_sessions(&self) -> Vec<(Uuid, SessionOutcome)> {
        self.finished.lock().unwrap().clone()
    }
}

impl EffectRunner for StubEffectRunner {
    fn spawn(&self, effect: Effect, tx: mpsc::Sender<Event>) {
        match effect {
            Effect::AcquireCapture { id } => {
                let deny = self.deny_permission;
                let grant_delay = self.grant_delay;
                let chunk_interval =
                    Duration::from_millis(self.settings.chunk_interval_ms.max(1));
                let fail_after = self.fail_after_chunks;
                let active = self.active.clone();
                let paused = self.paused.clone();

                tokio::spawn(async move {
                    tokio::time::sleep(grant_delay).await;

                    if deny {
                        let _ = tx
                            .send(Event::CaptureStartFail {
                                id,
                                error: SessionError::PermissionDenied {
                                    message: "denied by test double".into(),
                                },
                            })
                            .await;
                        return;
                    }

                    active.lock().unwrap().insert(id);

                    // Synthetic chunk pump, alive until release.
                    let pump_tx = tx.clone();
                    let pump_active = active.clone();
                    tokio::spawn(async move {
                        let start = tokio::time::Instant::now() + chunk_interval;
                        let mut interval = tokio::time::interval_at(start, chunk_interval);
                        let mut sent = 0usize;
                        loop {
                            interval.tick().await;
                            if !pump_active.lock().unwrap().contains(&id) {
                                break;
                            }
                            if paused.lock().unwrap().contains(&id) {
                                continue;
                            }
                            sent += 1;
                            if fail_after == Some(sent) {
                                let _ = pump_tx
                                    .send(Event::CaptureFailed {
                                        id,
                                        error: SessionError::Encoding {
                                            message: "simulated stream failure".into(),
                                        },
                                    })
                                    .await;
                                break;
                            }
                            let chunk = Chunk::new(vec![0u8; 64]);
                            if pump_tx
                                .send(Event::ChunkArrived { id, chunk })
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                    });

                    let _ = tx
                        .send(Event::CaptureStartOk {
                            id,
                            format: CaptureFormat::default(),
                        })
                        .await;
                });
            }

            Effect::ReleaseCapture { id } => {
                self.active.lock().unwrap().remove(&id);
                self.paused.lock().unwrap().remove(&id);
            }

            Effect::PauseCapture { id } => {
                self.paused.lock().unwrap().insert(id);
            }

            Effect::ResumeCapture { id } => {
                self.paused.lock().unwrap().remove(&id);
            }

            Effect::StartClock { id } => {
                let active = self.active.clone();
                let tick = Duration::from_millis(self.settings.clock_tick_ms.max(1));
                spawn_session_clock(
                    id,
                    tick,
                    move || active.lock().unwrap().contains(&id),
                    tx,
                );
            }

            Effect::TrackStopped { id, .. } => {
                log::debug!("stub: session {} stopped", id);
            }

            Effect::FinishSession { id, outcome } => {
                self.finished.lock().unwrap().push((id, outcome));
            }

            Effect::EmitState
            | Effect::EmitElapsed { .. }
            | Effect::EmitArtifactReady { .. }
            | Effect::EmitCommitted { .. }
            | Effect::EmitError { .. } => {
                unreachable!("emit effects are handled in run_state_loop");
            }
        }
    }
}

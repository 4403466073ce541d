//! Voice-note engine: capture, visualize, finalize, and play back voice
//! notes attached to posts and comments.
//!
//! The engine is a single-writer event loop. Host commands and device
//! callbacks all become [`state_machine::Event`]s delivered through one
//! channel; the reducer owns every session field, and the resulting effects
//! are executed by an [`effects::EffectRunner`]. Subscribers receive
//! [`EngineEvent`]s (state snapshots, elapsed-time ticks, visualizer frames,
//! the finalized artifact, errors) over a broadcast channel.
//!
//! ```no_run
//! use voicenote::{EngineSettings, Recorder};
//!
//! # async fn demo() {
//! let (recorder, _runner) = Recorder::launch(EngineSettings::default());
//! let mut events = recorder.subscribe();
//! recorder.handle().start().await.ok();
//! while let Ok(event) = events.recv().await {
//!     println!("{:?}", event);
//! }
//! # }
//! ```

pub mod audio;
pub mod effects;
pub mod metrics;
pub mod settings;
pub mod state_machine;

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc};

pub use audio::artifact::{Chunk, FinalizedArtifact, PlaybackLocator, VoiceNote};
pub use audio::capture::CaptureFormat;
pub use audio::playback::{
    format_timestamp, AudioSink, NullSink, PlaybackEngine, PlaybackError, PlaybackState,
    PlayerEvent, RodioSink,
};
pub use audio::waveform::{VisualizerFrame, NUM_BARS};
pub use effects::{CaptureEffectRunner, EffectRunner, StubEffectRunner};
pub use settings::{load_settings, save_settings, EngineSettings};
pub use state_machine::{Effect, Event, SessionError, SessionOutcome, State};

/// Broadcast buffer for engine events. Slow subscribers that fall further
/// behind than this lose the oldest events (visualizer frames dominate).
const EVENT_CAPACITY: usize = 256;

/// Serializable projection of the recorder state for UI binding.
/// Tagged union format: `{ "status": "idle" }` or
/// `{ "status": "recording", "elapsedSecs": 5 }`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum RecorderSnapshot {
    Idle,
    RequestingPermission,
    Recording {
        #[serde(rename = "elapsedSecs")]
        elapsed_secs: u64,
    },
    Paused {
        #[serde(rename = "elapsedSecs")]
        elapsed_secs: u64,
    },
    Stopped {
        #[serde(rename = "durationSecs")]
        duration_secs: u64,
    },
    Discarded,
    Committed,
}

/// Project the internal state for subscribers.
pub fn snapshot(state: &State) -> RecorderSnapshot {
    match state {
        State::Idle => RecorderSnapshot::Idle,
        State::RequestingPermission { .. } => RecorderSnapshot::RequestingPermission,
        State::Recording { elapsed_secs, .. } => RecorderSnapshot::Recording {
            elapsed_secs: *elapsed_secs,
        },
        State::Paused { elapsed_secs, .. } => RecorderSnapshot::Paused {
            elapsed_secs: *elapsed_secs,
        },
        State::Stopped { artifact, .. } => RecorderSnapshot::Stopped {
            duration_secs: artifact.duration_secs(),
        },
        State::Discarded => RecorderSnapshot::Discarded,
        State::Committed => RecorderSnapshot::Committed,
    }
}

/// Outbound engine events delivered to subscribers.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// The recorder changed state.
    State { snapshot: RecorderSnapshot },
    /// One second of recording elapsed.
    Elapsed { secs: u64 },
    /// A fresh visualizer frame (only while actively recording).
    Visualizer { frame: VisualizerFrame },
    /// The session stopped and its artifact is ready for preview. Emitted
    /// exactly once per session that reaches the stopped state.
    ArtifactReady {
        duration_secs: u64,
        locator: PlaybackLocator,
    },
    /// The artifact was committed; the note now belongs to the receiver.
    Committed { note: VoiceNote },
    /// A device or pipeline error, per the session taxonomy.
    Error { error: SessionError },
}

/// Command API for the recorder. Cheap to clone; all commands are routed
/// through the engine's event channel.
#[derive(Clone)]
pub struct RecorderHandle {
    tx: mpsc::Sender<Event>,
}

impl RecorderHandle {
    /// Send a raw event to the state machine.
    pub async fn send(&self, event: Event) -> Result<(), mpsc::error::SendError<Event>> {
        self.tx.send(event).await
    }

    pub async fn start(&self) -> Result<(), mpsc::error::SendError<Event>> {
        self.send(Event::Start).await
    }

    pub async fn pause(&self) -> Result<(), mpsc::error::SendError<Event>> {
        self.send(Event::Pause).await
    }

    pub async fn resume(&self) -> Result<(), mpsc::error::SendError<Event>> {
        self.send(Event::Resume).await
    }

    pub async fn stop(&self) -> Result<(), mpsc::error::SendError<Event>> {
        self.send(Event::Stop).await
    }

    pub async fn discard(&self) -> Result<(), mpsc::error::SendError<Event>> {
        self.send(Event::Discard).await
    }

    pub async fn commit(&self) -> Result<(), mpsc::error::SendError<Event>> {
        self.send(Event::Commit).await
    }

    /// Forced teardown: discards whatever is in flight, releases every
    /// handle, and shuts the engine loop down. Further commands fail.
    pub async fn teardown(&self) -> Result<(), mpsc::error::SendError<Event>> {
        self.send(Event::Teardown).await
    }
}

/// A running recorder engine.
pub struct Recorder {
    handle: RecorderHandle,
    events: broadcast::Sender<EngineEvent>,
}

impl Recorder {
    /// Launch with the real capture pipeline. Returns the runner too so the
    /// host can query session statistics.
    pub fn launch(settings: EngineSettings) -> (Self, Arc<CaptureEffectRunner>) {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let runner = CaptureEffectRunner::new(settings.clone(), events.clone());
        let recorder = Self::launch_inner(settings, events, runner.clone());
        (recorder, runner)
    }

    /// Launch with a custom effect runner (simulation, tests).
    pub fn launch_with(settings: EngineSettings, runner: Arc<dyn EffectRunner>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self::launch_inner(settings, events, runner)
    }

    fn launch_inner(
        settings: EngineSettings,
        events: broadcast::Sender<EngineEvent>,
        runner: Arc<dyn EffectRunner>,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<Event>(64);
        let handle = RecorderHandle { tx: tx.clone() };
        tokio::spawn(run_state_loop(settings, rx, tx, runner, events.clone()));
        Self { handle, events }
    }

    pub fn handle(&self) -> RecorderHandle {
        self.handle.clone()
    }

    /// Subscribe to engine events. Only events emitted after the call are
    /// delivered, so subscribe before issuing commands.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }
}

/// Run the main state loop: receive events, reduce, execute effects.
async fn run_state_loop(
    settings: EngineSettings,
    mut rx: mpsc::Receiver<Event>,
    tx: mpsc::Sender<Event>,
    runner: Arc<dyn EffectRunner>,
    events: broadcast::Sender<EngineEvent>,
) {
    let mut state = State::default();

    let _ = events.send(EngineEvent::State {
        snapshot: snapshot(&state),
    });
    log::info!("recorder state loop started");

    while let Some(event) = rx.recv().await {
        let ends_loop = matches!(event, Event::Teardown);

        let before = state.name();
        let (next, effects) = state_machine::reduce(state, event, &settings);
        if before != next.name() {
            log::info!("state transition: {} -> {}", before, next.name());
        }
        state = next;

        for effect in effects {
            match effect {
                Effect::EmitState => {
                    let _ = events.send(EngineEvent::State {
                        snapshot: snapshot(&state),
                    });
                }
                Effect::EmitElapsed { secs } => {
                    let _ = events.send(EngineEvent::Elapsed { secs });
                }
                Effect::EmitArtifactReady {
                    duration_secs,
                    locator,
                } => {
                    let _ = events.send(EngineEvent::ArtifactReady {
                        duration_secs,
                        locator,
                    });
                }
                Effect::EmitCommitted { note } => {
                    let _ = events.send(EngineEvent::Committed { note });
                }
                Effect::EmitError { error } => {
                    log::warn!("session error: {}", error);
                    let _ = events.send(EngineEvent::Error { error });
                }
                other => runner.spawn(other, tx.clone()),
            }
        }

        if ends_loop {
            log::info!("teardown complete, recorder loop shutting down");
            break;
        }
    }

    log::info!("recorder state loop ended");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshots_serialize_as_a_tagged_union() {
        let json = serde_json::to_value(RecorderSnapshot::Idle).unwrap();
        assert_eq!(json, serde_json::json!({ "status": "idle" }));

        let json = serde_json::to_value(RecorderSnapshot::Recording { elapsed_secs: 5 }).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "status": "recording", "elapsedSecs": 5 })
        );

        let json =
            serde_json::to_value(RecorderSnapshot::RequestingPermission).unwrap();
        assert_eq!(json, serde_json::json!({ "status": "requestingPermission" }));

        let json = serde_json::to_value(RecorderSnapshot::Stopped { duration_secs: 7 }).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "status": "stopped", "durationSecs": 7 })
        );
    }

    #[test]
    fn session_errors_serialize_with_their_kind() {
        let err = SessionError::PermissionDenied {
            message: "declined".into(),
        };
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "permission_denied");
        assert_eq!(json["message"], "declined");
    }
}

//! Recording session state machine.
//!
//! This module implements the core state machine using a single-writer
//! pattern. All session mutation goes through the `reduce()` function, which
//! returns a new state and a list of effects to execute. Events arrive from
//! the command API, the capture device, and the session clock; the reducer is
//! the only code allowed to touch session fields.

use serde::Serialize;
use uuid::Uuid;

use crate::audio::artifact::{self, Chunk, FinalizedArtifact, PlaybackLocator, VoiceNote};
use crate::audio::capture::CaptureFormat;
use crate::settings::EngineSettings;

/// Session-level error taxonomy surfaced to the host.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionError {
    /// The user declined device access. Recoverable; the session returns to idle.
    PermissionDenied { message: String },
    /// No capture device present or usable. Recoverable; the session returns to idle.
    DeviceUnavailable { message: String },
    /// The capture pipeline failed mid-stream. Fatal for the current session.
    Encoding { message: String },
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::PermissionDenied { message } => {
                write!(f, "microphone access denied: {}", message)
            }
            SessionError::DeviceUnavailable { message } => {
                write!(f, "capture device unavailable: {}", message)
            }
            SessionError::Encoding { message } => write!(f, "capture failed: {}", message),
        }
    }
}

impl std::error::Error for SessionError {}

/// Terminal outcome of a session, reported to the statistics collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    Committed,
    Discarded,
}

/// Authoritative state of the recording workflow.
#[derive(Debug, Clone)]
pub enum State {
    Idle,
    RequestingPermission {
        session_id: Uuid,
    },
    Recording {
        session_id: Uuid,
        format: CaptureFormat,
        elapsed_secs: u64,
        chunks: Vec<Chunk>,
    },
    Paused {
        session_id: Uuid,
        format: CaptureFormat,
        elapsed_secs: u64,
        chunks: Vec<Chunk>,
    },
    Stopped {
        session_id: Uuid,
        artifact: FinalizedArtifact,
    },
    Discarded,
    Committed,
}

impl State {
    /// Short state name for logging (full `Debug` output would dump chunks).
    pub fn name(&self) -> &'static str {
        match self {
            State::Idle => "idle",
            State::RequestingPermission { .. } => "requesting_permission",
            State::Recording { .. } => "recording",
            State::Paused { .. } => "paused",
            State::Stopped { .. } => "stopped",
            State::Discarded => "discarded",
            State::Committed => "committed",
        }
    }
}

impl Default for State {
    fn default() -> Self {
        State::Idle
    }
}

/// Events that can trigger state transitions.
#[derive(Debug, Clone)]
pub enum Event {
    // Commands from the host
    Start,
    Pause,
    Resume,
    Stop,
    Discard,
    Commit,
    /// Forced teardown (the host is going away mid-session). Runs the same
    /// release path as an explicit discard.
    Teardown,

    // Capture device events (include an id to reject stale deliveries)
    CaptureStartOk { id: Uuid, format: CaptureFormat },
    CaptureStartFail { id: Uuid, error: SessionError },
    ChunkArrived { id: Uuid, chunk: Chunk },
    CaptureFailed { id: Uuid, error: SessionError },

    // Session clock (includes an id to reject stale ticks)
    ClockTick { id: Uuid },
}

/// Effects to be executed after a state transition.
///
/// `Emit*` effects are handled by the engine loop itself; everything else is
/// dispatched to the `EffectRunner`.
#[derive(Debug, Clone)]
pub enum Effect {
    AcquireCapture {
        id: Uuid,
    },
    /// Release the device and cancel the clock and sampler for the session.
    /// Idempotent; safe when nothing was ever acquired.
    ReleaseCapture {
        id: Uuid,
    },
    PauseCapture {
        id: Uuid,
    },
    ResumeCapture {
        id: Uuid,
    },
    StartClock {
        id: Uuid,
    },
    TrackStopped {
        id: Uuid,
        duration_secs: u64,
        artifact_bytes: usize,
    },
    FinishSession {
        id: Uuid,
        outcome: SessionOutcome,
    },
    /// Signal the engine loop to broadcast the current state snapshot.
    EmitState,
    EmitElapsed {
        secs: u64,
    },
    EmitArtifactReady {
        duration_secs: u64,
        locator: PlaybackLocator,
    },
    EmitCommitted {
        note: VoiceNote,
    },
    EmitError {
        error: SessionError,
    },
}

/// Reducer function: (state, event) -> (next_state, effects)
///
/// Key rules:
/// - Events carrying a session id that no longer matches are dropped
/// - A stale device grant still releases the device it acquired
/// - Commands the current state does not accept are logged and ignored
pub fn reduce(state: State, event: Event, settings: &EngineSettings) -> (State, Vec<Effect>) {
    use Effect::*;
    use Event::*;
    use State::*;

    match (state, event) {
        // -----------------
        // Idle / terminal -> new session
        // -----------------
        (Idle, Start) | (Discarded, Start) | (Committed, Start) => {
            let id = Uuid::new_v4();
            (
                RequestingPermission { session_id: id },
                vec![AcquireCapture { id }, EmitState],
            )
        }

        // -----------------
        // RequestingPermission
        // -----------------
        (RequestingPermission { session_id }, CaptureStartOk { id, format })
            if session_id == id =>
        {
            (
                Recording {
                    session_id,
                    format,
                    elapsed_secs: 0,
                    chunks: Vec::new(),
                },
                vec![StartClock { id }, EmitState],
            )
        }
        (RequestingPermission { session_id }, CaptureStartFail { id, error })
            if session_id == id =>
        {
            (Idle, vec![EmitError { error }, EmitState])
        }
        // Discard while the permission request is in flight is unconditional.
        // If the grant lands later, the stale-grant arm below releases it.
        (RequestingPermission { session_id }, Discard)
        | (RequestingPermission { session_id }, Teardown) => (
            Discarded,
            vec![
                ReleaseCapture { id: session_id },
                FinishSession {
                    id: session_id,
                    outcome: SessionOutcome::Discarded,
                },
                EmitState,
            ],
        ),

        // -----------------
        // Recording
        // -----------------
        (
            Recording {
                session_id,
                format,
                elapsed_secs,
                mut chunks,
            },
            ChunkArrived { id, chunk },
        ) if session_id == id => {
            chunks.push(chunk);
            (
                Recording {
                    session_id,
                    format,
                    elapsed_secs,
                    chunks,
                },
                vec![],
            )
        }
        (
            Recording {
                session_id,
                format,
                elapsed_secs,
                chunks,
            },
            ClockTick { id },
        ) if session_id == id => {
            let elapsed = elapsed_secs + 1;
            if elapsed >= settings.max_duration_secs {
                log::warn!(
                    "recording {} reached the {}s limit, stopping",
                    session_id,
                    settings.max_duration_secs
                );
                stop_session(session_id, format, chunks, elapsed)
            } else {
                (
                    Recording {
                        session_id,
                        format,
                        elapsed_secs: elapsed,
                        chunks,
                    },
                    vec![EmitElapsed { secs: elapsed }],
                )
            }
        }
        (
            Recording {
                session_id,
                format,
                elapsed_secs,
                chunks,
            },
            Pause,
        ) => (
            Paused {
                session_id,
                format,
                elapsed_secs,
                chunks,
            },
            vec![PauseCapture { id: session_id }, EmitState],
        ),

        // -----------------
        // Paused
        // -----------------
        (
            Paused {
                session_id,
                format,
                elapsed_secs,
                chunks,
            },
            Resume,
        ) => (
            Recording {
                session_id,
                format,
                elapsed_secs,
                chunks,
            },
            vec![ResumeCapture { id: session_id }, EmitState],
        ),
        // Elapsed time is frozen while paused; the clock keeps ticking but
        // its ticks are not counted.
        (state @ Paused { .. }, ClockTick { .. }) => (state, vec![]),

        // -----------------
        // Stop / discard from an active session
        // -----------------
        (
            Recording {
                session_id,
                format,
                elapsed_secs,
                chunks,
            },
            Stop,
        )
        | (
            Paused {
                session_id,
                format,
                elapsed_secs,
                chunks,
            },
            Stop,
        ) => stop_session(session_id, format, chunks, elapsed_secs),

        (Recording { session_id, .. }, Discard)
        | (Recording { session_id, .. }, Teardown)
        | (Paused { session_id, .. }, Discard)
        | (Paused { session_id, .. }, Teardown) => (
            Discarded,
            vec![
                ReleaseCapture { id: session_id },
                FinishSession {
                    id: session_id,
                    outcome: SessionOutcome::Discarded,
                },
                EmitState,
            ],
        ),

        // A mid-stream capture failure is fatal for the session.
        (Recording { session_id, .. }, CaptureFailed { id, error })
        | (Paused { session_id, .. }, CaptureFailed { id, error })
            if session_id == id =>
        {
            (
                Discarded,
                vec![
                    ReleaseCapture { id: session_id },
                    FinishSession {
                        id: session_id,
                        outcome: SessionOutcome::Discarded,
                    },
                    EmitError { error },
                    EmitState,
                ],
            )
        }

        // -----------------
        // Stopped
        // -----------------
        (Stopped { session_id, artifact }, Commit) => {
            let note = artifact.into_voice_note();
            (
                Committed,
                vec![
                    FinishSession {
                        id: session_id,
                        outcome: SessionOutcome::Committed,
                    },
                    EmitCommitted { note },
                    EmitState,
                ],
            )
        }
        // Dropping the stopped state drops the artifact's backing buffer, so
        // every outstanding locator stops resolving from here on.
        (Stopped { session_id, .. }, Discard) | (Stopped { session_id, .. }, Teardown) => (
            Discarded,
            vec![
                ReleaseCapture { id: session_id },
                FinishSession {
                    id: session_id,
                    outcome: SessionOutcome::Discarded,
                },
                EmitState,
            ],
        ),

        // -----------------
        // Teardown with nothing held
        // -----------------
        (Idle, Teardown) | (Committed, Teardown) => (Discarded, vec![EmitState]),

        // Repeated discard: same observable effect as a single discard.
        (Discarded, Discard) | (Discarded, Teardown) => (Discarded, vec![]),

        // -----------------
        // Stale device/clock events (drop, but never leak a grant)
        // -----------------
        (state, CaptureStartOk { id, .. }) => {
            log::debug!(
                "capture grant for defunct session {} arrived while {}; releasing",
                id,
                state.name()
            );
            (state, vec![ReleaseCapture { id }])
        }
        (state, CaptureStartFail { .. }) => (state, vec![]),
        (state, ChunkArrived { .. }) => (state, vec![]),
        (state, ClockTick { .. }) => (state, vec![]),
        (state, CaptureFailed { .. }) => (state, vec![]),

        // -----------------
        // Invalid command: no transition, logged, never surfaced
        // -----------------
        (state, event) => {
            log::debug!("ignoring {:?} while {}", event, state.name());
            (state, vec![])
        }
    }
}

/// Shared stop path: finalize the accumulated chunks into an artifact and
/// release everything the session holds. A finalize failure is treated like
/// any other encoder failure: the session is discarded with a full release.
fn stop_session(
    session_id: Uuid,
    format: CaptureFormat,
    chunks: Vec<Chunk>,
    elapsed_secs: u64,
) -> (State, Vec<Effect>) {
    use Effect::*;

    match artifact::finalize(&chunks, format, elapsed_secs) {
        Ok(finalized) => {
            let locator = finalized.locator();
            let artifact_bytes = finalized.len();
            (
                State::Stopped {
                    session_id,
                    artifact: finalized,
                },
                vec![
                    ReleaseCapture { id: session_id },
                    TrackStopped {
                        id: session_id,
                        duration_secs: elapsed_secs,
                        artifact_bytes,
                    },
                    EmitArtifactReady {
                        duration_secs: elapsed_secs,
                        locator,
                    },
                    EmitState,
                ],
            )
        }
        Err(e) => {
            log::error!("failed to finalize session {}: {}", session_id, e);
            (
                State::Discarded,
                vec![
                    ReleaseCapture { id: session_id },
                    FinishSession {
                        id: session_id,
                        outcome: SessionOutcome::Discarded,
                    },
                    EmitError {
                        error: SessionError::Encoding {
                            message: e.to_string(),
                        },
                    },
                    EmitState,
                ],
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> EngineSettings {
        EngineSettings::default()
    }

    fn recording(session_id: Uuid, elapsed_secs: u64, chunks: Vec<Chunk>) -> State {
        State::Recording {
            session_id,
            format: CaptureFormat::default(),
            elapsed_secs,
            chunks,
        }
    }

    fn chunk() -> Chunk {
        // 4 i16 samples, little endian
        Chunk::new(vec![0, 0, 64, 0, 128, 0, 255, 0])
    }

    fn has_release(effects: &[Effect], id: Uuid) -> bool {
        effects
            .iter()
            .any(|e| matches!(e, Effect::ReleaseCapture { id: rid } if *rid == id))
    }

    #[test]
    fn start_from_idle_requests_permission() {
        let (next, effects) = reduce(State::Idle, Event::Start, &settings());
        assert!(matches!(next, State::RequestingPermission { .. }));
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::AcquireCapture { .. })));
        assert!(effects.iter().any(|e| matches!(e, Effect::EmitState)));
    }

    #[test]
    fn grant_transitions_to_recording_and_starts_clock() {
        let id = Uuid::new_v4();
        let state = State::RequestingPermission { session_id: id };
        let (next, effects) = reduce(
            state,
            Event::CaptureStartOk {
                id,
                format: CaptureFormat::default(),
            },
            &settings(),
        );
        assert!(matches!(next, State::Recording { elapsed_secs: 0, .. }));
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::StartClock { .. })));
    }

    #[test]
    fn denied_grant_returns_to_idle_with_error() {
        let id = Uuid::new_v4();
        let state = State::RequestingPermission { session_id: id };
        let (next, effects) = reduce(
            state,
            Event::CaptureStartFail {
                id,
                error: SessionError::PermissionDenied {
                    message: "declined".into(),
                },
            },
            &settings(),
        );
        assert!(matches!(next, State::Idle));
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::EmitError {
                error: SessionError::PermissionDenied { .. }
            }
        )));
        // Nothing was acquired, so nothing to release.
        assert!(!has_release(&effects, id));
    }

    #[test]
    fn stale_grant_is_released_not_leaked() {
        let stale = Uuid::new_v4();
        let (next, effects) = reduce(
            State::Discarded,
            Event::CaptureStartOk {
                id: stale,
                format: CaptureFormat::default(),
            },
            &settings(),
        );
        assert!(matches!(next, State::Discarded));
        assert!(has_release(&effects, stale));
    }

    #[test]
    fn chunks_append_only_while_recording() {
        let id = Uuid::new_v4();
        let state = recording(id, 1, vec![]);
        let (next, effects) = reduce(
            state,
            Event::ChunkArrived { id, chunk: chunk() },
            &settings(),
        );
        assert!(effects.is_empty());
        let State::Recording { chunks, .. } = next else {
            panic!("expected recording");
        };
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn chunk_while_paused_is_dropped() {
        let id = Uuid::new_v4();
        let state = State::Paused {
            session_id: id,
            format: CaptureFormat::default(),
            elapsed_secs: 2,
            chunks: vec![chunk()],
        };
        let (next, effects) = reduce(
            state,
            Event::ChunkArrived { id, chunk: chunk() },
            &settings(),
        );
        assert!(effects.is_empty());
        let State::Paused { chunks, .. } = next else {
            panic!("expected paused");
        };
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn tick_increments_elapsed_while_recording_only() {
        let id = Uuid::new_v4();
        let (next, effects) =
            reduce(recording(id, 3, vec![]), Event::ClockTick { id }, &settings());
        assert!(matches!(next, State::Recording { elapsed_secs: 4, .. }));
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::EmitElapsed { secs: 4 })));

        let paused = State::Paused {
            session_id: id,
            format: CaptureFormat::default(),
            elapsed_secs: 4,
            chunks: vec![],
        };
        let (next, effects) = reduce(paused, Event::ClockTick { id }, &settings());
        assert!(matches!(next, State::Paused { elapsed_secs: 4, .. }));
        assert!(effects.is_empty());
    }

    #[test]
    fn stale_tick_is_ignored() {
        let id = Uuid::new_v4();
        let stale = Uuid::new_v4();
        let (next, effects) = reduce(
            recording(id, 2, vec![]),
            Event::ClockTick { id: stale },
            &settings(),
        );
        assert!(matches!(next, State::Recording { elapsed_secs: 2, .. }));
        assert!(effects.is_empty());
    }

    #[test]
    fn pause_resume_preserves_elapsed_and_chunks() {
        let id = Uuid::new_v4();
        let (paused, effects) = reduce(recording(id, 3, vec![chunk()]), Event::Pause, &settings());
        assert!(matches!(paused, State::Paused { elapsed_secs: 3, .. }));
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::PauseCapture { .. })));

        let (resumed, effects) = reduce(paused, Event::Resume, &settings());
        let State::Recording {
            elapsed_secs,
            chunks,
            ..
        } = resumed
        else {
            panic!("expected recording");
        };
        assert_eq!(elapsed_secs, 3);
        assert_eq!(chunks.len(), 1);
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::ResumeCapture { .. })));
    }

    // Record for 3 ticks, pause for 2 ticks, resume for 2 ticks, stop: the
    // pause ticks must not count toward the recorded duration.
    #[test]
    fn elapsed_excludes_paused_ticks() {
        let id = Uuid::new_v4();
        let cfg = settings();
        let mut state = recording(id, 0, vec![chunk()]);
        for _ in 0..3 {
            state = reduce(state, Event::ClockTick { id }, &cfg).0;
        }
        state = reduce(state, Event::Pause, &cfg).0;
        for _ in 0..2 {
            state = reduce(state, Event::ClockTick { id }, &cfg).0;
        }
        state = reduce(state, Event::Resume, &cfg).0;
        for _ in 0..2 {
            state = reduce(state, Event::ClockTick { id }, &cfg).0;
        }
        let (stopped, effects) = reduce(state, Event::Stop, &cfg);
        assert!(matches!(stopped, State::Stopped { .. }));
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::EmitArtifactReady {
                duration_secs: 5,
                ..
            }
        )));
    }

    #[test]
    fn stop_finalizes_with_clock_duration() {
        let id = Uuid::new_v4();
        let (next, effects) = reduce(
            recording(id, 5, vec![chunk(), chunk()]),
            Event::Stop,
            &settings(),
        );
        let State::Stopped { artifact, .. } = &next else {
            panic!("expected stopped");
        };
        assert_eq!(artifact.duration_secs(), 5);
        assert!(has_release(&effects, id));
        let ready = effects.iter().find_map(|e| match e {
            Effect::EmitArtifactReady {
                duration_secs,
                locator,
            } => Some((*duration_secs, locator.clone())),
            _ => None,
        });
        let (duration, locator) = ready.expect("artifact ready effect");
        assert_eq!(duration, 5);
        assert!(locator.resolve().is_some());
    }

    #[test]
    fn stop_from_paused_finalizes() {
        let id = Uuid::new_v4();
        let paused = State::Paused {
            session_id: id,
            format: CaptureFormat::default(),
            elapsed_secs: 2,
            chunks: vec![chunk()],
        };
        let (next, _) = reduce(paused, Event::Stop, &settings());
        assert!(matches!(next, State::Stopped { .. }));
    }

    #[test]
    fn discard_releases_and_never_finalizes() {
        let id = Uuid::new_v4();
        let (next, effects) = reduce(recording(id, 2, vec![chunk()]), Event::Discard, &settings());
        assert!(matches!(next, State::Discarded));
        assert!(has_release(&effects, id));
        assert!(!effects
            .iter()
            .any(|e| matches!(e, Effect::EmitArtifactReady { .. })));
    }

    #[test]
    fn discard_twice_has_no_second_effect() {
        let (state, _) = reduce(
            recording(Uuid::new_v4(), 1, vec![]),
            Event::Discard,
            &settings(),
        );
        let (next, effects) = reduce(state, Event::Discard, &settings());
        assert!(matches!(next, State::Discarded));
        assert!(effects.is_empty());
    }

    #[test]
    fn commit_hands_off_the_note() {
        let id = Uuid::new_v4();
        let (stopped, _) = reduce(recording(id, 4, vec![chunk()]), Event::Stop, &settings());
        let (next, effects) = reduce(stopped, Event::Commit, &settings());
        assert!(matches!(next, State::Committed));
        let note = effects.iter().find_map(|e| match e {
            Effect::EmitCommitted { note } => Some(note.clone()),
            _ => None,
        });
        let note = note.expect("committed note");
        assert_eq!(note.duration_secs, 4);
        assert!(!note.bytes.is_empty());
    }

    #[test]
    fn discard_after_stop_invalidates_outstanding_locators() {
        let id = Uuid::new_v4();
        let (stopped, effects) = reduce(recording(id, 1, vec![chunk()]), Event::Stop, &settings());
        let locator = effects
            .iter()
            .find_map(|e| match e {
                Effect::EmitArtifactReady { locator, .. } => Some(locator.clone()),
                _ => None,
            })
            .expect("locator");
        assert!(locator.resolve().is_some());

        let (next, _) = reduce(stopped, Event::Discard, &settings());
        assert!(matches!(next, State::Discarded));
        assert!(locator.resolve().is_none());
    }

    #[test]
    fn capture_failure_mid_stream_forces_discard() {
        let id = Uuid::new_v4();
        let (next, effects) = reduce(
            recording(id, 2, vec![chunk()]),
            Event::CaptureFailed {
                id,
                error: SessionError::Encoding {
                    message: "stream died".into(),
                },
            },
            &settings(),
        );
        assert!(matches!(next, State::Discarded));
        assert!(has_release(&effects, id));
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::EmitError {
                error: SessionError::Encoding { .. }
            }
        )));
    }

    #[test]
    fn recording_auto_stops_at_max_duration() {
        let id = Uuid::new_v4();
        let cfg = EngineSettings {
            max_duration_secs: 2,
            ..EngineSettings::default()
        };
        let state = recording(id, 1, vec![chunk()]);
        let (next, effects) = reduce(state, Event::ClockTick { id }, &cfg);
        assert!(matches!(next, State::Stopped { .. }));
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::EmitArtifactReady {
                duration_secs: 2,
                ..
            }
        )));
    }

    #[test]
    fn teardown_during_permission_request_discards_and_releases() {
        let id = Uuid::new_v4();
        let state = State::RequestingPermission { session_id: id };
        let (next, effects) = reduce(state, Event::Teardown, &settings());
        assert!(matches!(next, State::Discarded));
        assert!(has_release(&effects, id));
    }

    #[test]
    fn start_is_allowed_again_after_a_terminal_state() {
        let (next, effects) = reduce(State::Discarded, Event::Start, &settings());
        assert!(matches!(next, State::RequestingPermission { .. }));
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::AcquireCapture { .. })));
    }

    #[test]
    fn invalid_command_is_a_silent_noop() {
        let (next, effects) = reduce(State::Idle, Event::Pause, &settings());
        assert!(matches!(next, State::Idle));
        assert!(effects.is_empty());

        let (next, effects) = reduce(State::Idle, Event::Stop, &settings());
        assert!(matches!(next, State::Idle));
        assert!(effects.is_empty());
    }
}

//! Voice-note playback.
//!
//! `PlaybackEngine` is an independent state machine (idle / playing / paused /
//! ended) driving a preview or feed-embedded player: transport controls,
//! seek-by-position, volume and mute, and position events at a UI-refresh
//! cadence while playing. Audio output goes through the `AudioSink` trait;
//! `RodioSink` plays through the default output device on a dedicated thread,
//! `NullSink` keeps the engine fully functional on headless hosts and in
//! tests. Position and duration are engine-authoritative: the session clock's
//! value wins over anything the decoder might report.

use std::io::Cursor;
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time;
use tokio_util::sync::CancellationToken;

use super::artifact::{PlaybackLocator, VoiceNote};
use crate::settings::EngineSettings;

/// Playback transport state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    Idle,
    Playing,
    Paused,
    Ended,
}

/// Events published to player subscribers.
#[derive(Debug, Clone)]
pub enum PlayerEvent {
    StateChanged { state: PlaybackState },
    Position { secs: f64 },
}

#[derive(Debug, Clone)]
pub enum PlaybackError {
    /// No artifact attached yet.
    NoArtifact,
    /// The locator no longer resolves (its session was discarded).
    InvalidLocator,
    /// The output device could not be opened.
    OutputUnavailable(String),
}

impl std::fmt::Display for PlaybackError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlaybackError::NoArtifact => write!(f, "no artifact attached"),
            PlaybackError::InvalidLocator => write!(f, "locator no longer resolves"),
            PlaybackError::OutputUnavailable(e) => write!(f, "audio output unavailable: {}", e),
        }
    }
}

impl std::error::Error for PlaybackError {}

/// Audio output seam. Implementations must tolerate commands in any order;
/// the engine's state machine is the source of truth, the sink is best-effort
/// output.
pub trait AudioSink: Send + 'static {
    fn load(&mut self, bytes: Arc<Vec<u8>>);
    fn play(&mut self);
    fn pause(&mut self);
    fn seek(&mut self, position: Duration);
    fn set_volume(&mut self, volume: f32);
    fn stop(&mut self);
}

/// Silent sink for tests and headless hosts.
pub struct NullSink;

impl AudioSink for NullSink {
    fn load(&mut self, _bytes: Arc<Vec<u8>>) {}
    fn play(&mut self) {}
    fn pause(&mut self) {}
    fn seek(&mut self, _position: Duration) {}
    fn set_volume(&mut self, _volume: f32) {}
    fn stop(&mut self) {}
}

struct PlayerInner {
    state: PlaybackState,
    position_secs: f64,
    duration_secs: u64,
    volume: f32,
    muted: bool,
    source: Option<Arc<Vec<u8>>>,
    sink: Box<dyn AudioSink>,
    ticker: Option<CancellationToken>,
}

/// Player for finalized artifacts and previously-published voice notes.
#[derive(Clone)]
pub struct PlaybackEngine {
    inner: Arc<Mutex<PlayerInner>>,
    events: broadcast::Sender<PlayerEvent>,
    tick: Duration,
}

impl PlaybackEngine {
    pub fn new(sink: Box<dyn AudioSink>, settings: &EngineSettings) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Mutex::new(PlayerInner {
                state: PlaybackState::Idle,
                position_secs: 0.0,
                duration_secs: 0,
                volume: 1.0,
                muted: false,
                source: None,
                sink,
                ticker: None,
            })),
            events,
            tick: Duration::from_millis(settings.playback_tick_ms.max(1)),
        }
    }

    /// Player wired to the default output device.
    pub fn with_default_output(settings: &EngineSettings) -> Result<Self, PlaybackError> {
        let sink = RodioSink::spawn()?;
        Ok(Self::new(Box::new(sink), settings))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlayerEvent> {
        self.events.subscribe()
    }

    /// Attach an artifact by locator. Fails if the owning session has
    /// already discarded the buffer.
    pub fn attach(&self, locator: &PlaybackLocator) -> Result<(), PlaybackError> {
        let bytes = locator.resolve().ok_or(PlaybackError::InvalidLocator)?;
        self.attach_bytes(bytes, locator.duration_secs());
        Ok(())
    }

    /// Attach a committed voice note.
    pub fn attach_note(&self, note: &VoiceNote) {
        self.attach_bytes(note.bytes.clone(), note.duration_secs);
    }

    fn attach_bytes(&self, bytes: Arc<Vec<u8>>, duration_secs: u64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(ticker) = inner.ticker.take() {
            ticker.cancel();
        }
        inner.sink.stop();
        inner.sink.load(bytes.clone());
        inner.source = Some(bytes);
        inner.duration_secs = duration_secs;
        inner.position_secs = 0.0;
        inner.state = PlaybackState::Idle;
        let _ = self.events.send(PlayerEvent::StateChanged {
            state: PlaybackState::Idle,
        });
    }

    /// Start or restart playback. From `Ended` this restarts at position 0.
    pub fn play(&self) -> Result<(), PlaybackError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.source.is_none() {
            return Err(PlaybackError::NoArtifact);
        }
        if inner.state == PlaybackState::Playing {
            return Ok(());
        }
        if inner.state == PlaybackState::Ended {
            inner.position_secs = 0.0;
        }

        let position = Duration::from_secs_f64(inner.position_secs);
        inner.sink.seek(position);
        inner.sink.play();
        inner.state = PlaybackState::Playing;

        let cancel = CancellationToken::new();
        inner.ticker = Some(cancel.clone());
        drop(inner);

        let _ = self.events.send(PlayerEvent::StateChanged {
            state: PlaybackState::Playing,
        });

        let engine = self.clone();
        let tick = self.tick;
        tokio::spawn(async move {
            let mut interval = time::interval_at(time::Instant::now() + tick, tick);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => engine.advance(tick.as_secs_f64()),
                }
            }
        });

        Ok(())
    }

    pub fn pause(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != PlaybackState::Playing {
            log::debug!("pause ignored while {:?}", inner.state);
            return;
        }
        if let Some(ticker) = inner.ticker.take() {
            ticker.cancel();
        }
        inner.sink.pause();
        inner.state = PlaybackState::Paused;
        drop(inner);
        let _ = self.events.send(PlayerEvent::StateChanged {
            state: PlaybackState::Paused,
        });
    }

    /// Seek to a position, clamped to `[0, duration]`. Seeking out of
    /// `Ended` leaves the player paused at the target.
    pub fn seek(&self, secs: f64) {
        let mut inner = self.inner.lock().unwrap();
        let clamped = secs.clamp(0.0, inner.duration_secs as f64);
        inner.position_secs = clamped;
        inner.sink.seek(Duration::from_secs_f64(clamped));
        if inner.state == PlaybackState::Ended {
            inner.state = PlaybackState::Paused;
            drop(inner);
            let _ = self.events.send(PlayerEvent::StateChanged {
                state: PlaybackState::Paused,
            });
        }
    }

    pub fn set_volume(&self, volume: f32) {
        let mut inner = self.inner.lock().unwrap();
        inner.volume = volume.clamp(0.0, 1.0);
        if !inner.muted {
            let v = inner.volume;
            inner.sink.set_volume(v);
        }
    }

    /// Returns the new muted flag.
    pub fn toggle_mute(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        inner.muted = !inner.muted;
        let v = if inner.muted { 0.0 } else { inner.volume };
        inner.sink.set_volume(v);
        inner.muted
    }

    pub fn state(&self) -> PlaybackState {
        self.inner.lock().unwrap().state
    }

    pub fn position_secs(&self) -> f64 {
        self.inner.lock().unwrap().position_secs
    }

    pub fn duration_secs(&self) -> u64 {
        self.inner.lock().unwrap().duration_secs
    }

    pub fn volume(&self) -> f32 {
        self.inner.lock().unwrap().volume
    }

    pub fn muted(&self) -> bool {
        self.inner.lock().unwrap().muted
    }

    /// Advance the position clock by one tick. Reaching the end resets the
    /// position, releases the tick subscription, and goes quiet until the
    /// next `play()`.
    fn advance(&self, dt_secs: f64) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != PlaybackState::Playing {
            return;
        }

        inner.position_secs += dt_secs;
        if inner.position_secs + 1e-9 >= inner.duration_secs as f64 {
            inner.position_secs = 0.0;
            inner.state = PlaybackState::Ended;
            inner.sink.stop();
            if let Some(ticker) = inner.ticker.take() {
                ticker.cancel();
            }
            drop(inner);
            let _ = self.events.send(PlayerEvent::StateChanged {
                state: PlaybackState::Ended,
            });
        } else {
            let secs = inner.position_secs;
            drop(inner);
            let _ = self.events.send(PlayerEvent::Position { secs });
        }
    }
}

/// Format a second count for transport displays: `m:ss`.
pub fn format_timestamp(total_secs: u64) -> String {
    format!("{}:{:02}", total_secs / 60, total_secs % 60)
}

// ── rodio-backed sink ───────────────────────────────────────────────

enum SinkCmd {
    Load(Arc<Vec<u8>>),
    Play,
    Pause,
    Seek(Duration),
    SetVolume(f32),
    Stop,
    Shutdown,
}

/// Shared-buffer reader for the decoder.
struct ArcBytes(Arc<Vec<u8>>);

impl AsRef<[u8]> for ArcBytes {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Plays artifacts through the default output device.
///
/// rodio's output stream is not `Send`, so it lives on a dedicated thread fed
/// by a command channel, mirroring how the capture side owns its stream.
pub struct RodioSink {
    cmd_tx: std_mpsc::Sender<SinkCmd>,
    join: Option<thread::JoinHandle<()>>,
}

impl RodioSink {
    pub fn spawn() -> Result<Self, PlaybackError> {
        let (cmd_tx, cmd_rx) = std_mpsc::channel();
        let (ready_tx, ready_rx) = std_mpsc::sync_channel(1);

        let join = thread::Builder::new()
            .name("voicenote-playback".into())
            .spawn(move || run_playback_thread(cmd_rx, ready_tx))
            .map_err(|e| PlaybackError::OutputUnavailable(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                cmd_tx,
                join: Some(join),
            }),
            Ok(Err(e)) => {
                let _ = join.join();
                Err(PlaybackError::OutputUnavailable(e))
            }
            Err(_) => {
                let _ = join.join();
                Err(PlaybackError::OutputUnavailable(
                    "playback thread exited before reporting readiness".into(),
                ))
            }
        }
    }

    fn send(&self, cmd: SinkCmd) {
        let _ = self.cmd_tx.send(cmd);
    }
}

impl AudioSink for RodioSink {
    fn load(&mut self, bytes: Arc<Vec<u8>>) {
        self.send(SinkCmd::Load(bytes));
    }

    fn play(&mut self) {
        self.send(SinkCmd::Play);
    }

    fn pause(&mut self) {
        self.send(SinkCmd::Pause);
    }

    fn seek(&mut self, position: Duration) {
        self.send(SinkCmd::Seek(position));
    }

    fn set_volume(&mut self, volume: f32) {
        self.send(SinkCmd::SetVolume(volume));
    }

    fn stop(&mut self) {
        self.send(SinkCmd::Stop);
    }
}

impl Drop for RodioSink {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(SinkCmd::Shutdown);
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                log::warn!("playback thread panicked during shutdown");
            }
        }
    }
}

fn run_playback_thread(
    cmd_rx: std_mpsc::Receiver<SinkCmd>,
    ready_tx: std_mpsc::SyncSender<Result<(), String>>,
) {
    let (_stream, handle) = match rodio::OutputStream::try_default() {
        Ok(pair) => pair,
        Err(e) => {
            let _ = ready_tx.send(Err(e.to_string()));
            return;
        }
    };
    let _ = ready_tx.send(Ok(()));

    let mut bytes: Option<Arc<Vec<u8>>> = None;
    let mut sink: Option<rodio::Sink> = None;
    let mut volume: f32 = 1.0;

    while let Ok(cmd) = cmd_rx.recv() {
        match cmd {
            SinkCmd::Load(b) => {
                if let Some(s) = sink.take() {
                    s.stop();
                }
                bytes = Some(b);
            }
            SinkCmd::Play => {
                let drained = sink.as_ref().map(|s| s.empty()).unwrap_or(true);
                if drained {
                    sink = bytes.clone().and_then(|b| build_sink(&handle, b, volume));
                }
                if let Some(s) = &sink {
                    s.play();
                }
            }
            SinkCmd::Pause => {
                if let Some(s) = &sink {
                    s.pause();
                }
            }
            SinkCmd::Seek(position) => {
                if let Some(s) = &sink {
                    if let Err(e) = s.try_seek(position) {
                        log::debug!("sink seek failed: {}", e);
                    }
                }
            }
            SinkCmd::SetVolume(v) => {
                volume = v;
                if let Some(s) = &sink {
                    s.set_volume(v);
                }
            }
            SinkCmd::Stop => {
                if let Some(s) = sink.take() {
                    s.stop();
                }
            }
            SinkCmd::Shutdown => break,
        }
    }

    log::debug!("playback thread exiting");
}

fn build_sink(
    handle: &rodio::OutputStreamHandle,
    bytes: Arc<Vec<u8>>,
    volume: f32,
) -> Option<rodio::Sink> {
    let sink = match rodio::Sink::try_new(handle) {
        Ok(s) => s,
        Err(e) => {
            log::warn!("failed to open playback sink: {}", e);
            return None;
        }
    };
    match rodio::Decoder::new(Cursor::new(ArcBytes(bytes))) {
        Ok(decoder) => {
            sink.pause();
            sink.append(decoder);
            sink.set_volume(volume);
            Some(sink)
        }
        Err(e) => {
            log::warn!("failed to decode artifact: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::artifact::{finalize, Chunk};
    use crate::audio::capture::CaptureFormat;

    fn note(duration_secs: u64) -> VoiceNote {
        VoiceNote {
            bytes: Arc::new(vec![0u8; 64]),
            duration_secs,
        }
    }

    fn engine() -> PlaybackEngine {
        PlaybackEngine::new(Box::new(NullSink), &EngineSettings::default())
    }

    #[tokio::test]
    async fn seek_clamps_to_duration() {
        let player = engine();
        player.attach_note(&note(10));

        player.seek(15.0);
        assert_eq!(player.position_secs(), 10.0);

        player.seek(-3.0);
        assert_eq!(player.position_secs(), 0.0);
    }

    #[tokio::test]
    async fn play_without_artifact_is_an_error() {
        let player = engine();
        assert!(matches!(player.play(), Err(PlaybackError::NoArtifact)));
    }

    #[tokio::test]
    async fn attach_fails_once_the_locator_is_invalidated() {
        let artifact = finalize(
            &[Chunk::new(vec![1, 0])],
            CaptureFormat::default(),
            1,
        )
        .unwrap();
        let locator = artifact.locator();

        let player = engine();
        assert!(player.attach(&locator).is_ok());

        drop(artifact);
        assert!(matches!(
            player.attach(&locator),
            Err(PlaybackError::InvalidLocator)
        ));
    }

    #[tokio::test]
    async fn reaching_the_end_resets_position_and_goes_quiet() {
        let player = engine();
        player.attach_note(&note(2));
        let mut events = player.subscribe();
        player.play().unwrap();

        // Drive the clock by hand for determinism; the spawned ticker is
        // cancelled at the end transition and guards on the playing state.
        player.advance(1.0);
        player.advance(1.5);

        assert_eq!(player.state(), PlaybackState::Ended);
        assert_eq!(player.position_secs(), 0.0);

        // A tick after the end must not produce anything.
        player.advance(1.0);

        let mut saw_ended = false;
        while let Ok(event) = events.try_recv() {
            if let PlayerEvent::StateChanged {
                state: PlaybackState::Ended,
            } = event
            {
                assert!(!saw_ended, "ended emitted twice");
                saw_ended = true;
                continue;
            }
            if saw_ended {
                panic!("event after ended: {:?}", event);
            }
        }
        assert!(saw_ended);
    }

    #[tokio::test]
    async fn play_after_ended_restarts_from_zero() {
        let player = engine();
        player.attach_note(&note(1));
        player.play().unwrap();
        player.advance(1.0);
        assert_eq!(player.state(), PlaybackState::Ended);

        player.play().unwrap();
        assert_eq!(player.state(), PlaybackState::Playing);
        assert_eq!(player.position_secs(), 0.0);
        player.pause();
    }

    #[tokio::test]
    async fn ticker_drives_playback_to_the_end() {
        let settings = EngineSettings {
            playback_tick_ms: 10,
            ..EngineSettings::default()
        };
        let player = PlaybackEngine::new(Box::new(NullSink), &settings);
        player.attach_note(&note(1));
        let mut events = player.subscribe();
        player.play().unwrap();

        let ended = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match events.recv().await {
                    Ok(PlayerEvent::StateChanged {
                        state: PlaybackState::Ended,
                    }) => break true,
                    Ok(_) => continue,
                    Err(_) => break false,
                }
            }
        })
        .await
        .expect("playback ends before timeout");
        assert!(ended);
        assert_eq!(player.position_secs(), 0.0);
    }

    #[tokio::test]
    async fn volume_clamps_and_mute_round_trips() {
        let player = engine();
        player.set_volume(1.7);
        assert_eq!(player.volume(), 1.0);
        player.set_volume(-0.5);
        assert_eq!(player.volume(), 0.0);
        player.set_volume(0.4);

        assert!(player.toggle_mute());
        assert!(player.muted());
        assert!(!player.toggle_mute());
        assert_eq!(player.volume(), 0.4);
    }

    #[tokio::test]
    async fn seeking_out_of_ended_leaves_the_player_paused() {
        let player = engine();
        player.attach_note(&note(4));
        player.play().unwrap();
        player.advance(4.0);
        assert_eq!(player.state(), PlaybackState::Ended);

        player.seek(2.0);
        assert_eq!(player.state(), PlaybackState::Paused);
        assert_eq!(player.position_secs(), 2.0);
    }

    #[test]
    fn timestamps_format_as_minutes_and_seconds() {
        assert_eq!(format_timestamp(0), "0:00");
        assert_eq!(format_timestamp(5), "0:05");
        assert_eq!(format_timestamp(65), "1:05");
        assert_eq!(format_timestamp(600), "10:00");
    }
}

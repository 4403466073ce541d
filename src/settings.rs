use std::path::Path;

use serde::{Deserialize, Serialize};

/// Engine tuning knobs. Defaults match the documented contract; hosts may
/// persist overrides with `load_settings`/`save_settings`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Amount of audio per encoded chunk delivered while recording.
    pub chunk_interval_ms: u64,

    /// Session clock period. One tick advances the displayed elapsed time by
    /// one second; the default is the 1 Hz contract.
    pub clock_tick_ms: u64,

    /// Visualizer frame period (~30fps by default).
    pub frame_interval_ms: u64,

    /// Playback position update period while playing.
    pub playback_tick_ms: u64,

    /// Recordings stop themselves once the clock reaches this many ticks.
    pub max_duration_secs: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            chunk_interval_ms: 100,
            clock_tick_ms: 1000,
            frame_interval_ms: 33,
            playback_tick_ms: 100,
            max_duration_secs: 600,
        }
    }
}

pub fn load_settings(path: &Path) -> EngineSettings {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<EngineSettings>(&contents) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("settings: failed to parse {:?}: {}", path, e);
                EngineSettings::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => EngineSettings::default(),
        Err(e) => {
            log::warn!("settings: failed to read {:?}: {}", path, e);
            EngineSettings::default()
        }
    }
}

pub fn save_settings(path: &Path, settings: &EngineSettings) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory {:?}: {}", parent, e))?;
    }

    let contents =
        serde_json::to_string_pretty(settings).map_err(|e| format!("Serialize settings: {}", e))?;

    // Write atomically: write to a temp file in the same directory, then
    // rename. This prevents a partial/corrupt settings file if the host
    // crashes mid-write.
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &contents)
        .map_err(|e| format!("Write temp settings {:?}: {}", tmp_path, e))?;

    // On Unix, rename will atomically replace the destination. On Windows,
    // rename fails if the destination exists, so we remove it first
    // (ignoring NotFound).
    if cfg!(windows) && path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(format!("Remove existing settings file {:?}: {}", path, e));
            }
        }
    }

    std::fs::rename(&tmp_path, path)
        .map_err(|e| format!("Rename temp settings {:?} to {:?}: {}", tmp_path, path, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_settings(&dir.path().join("nope.json"));
        assert_eq!(settings.clock_tick_ms, 1000);
        assert_eq!(settings.max_duration_secs, 600);
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");

        let settings = EngineSettings {
            chunk_interval_ms: 50,
            max_duration_secs: 120,
            ..EngineSettings::default()
        };
        save_settings(&path, &settings).unwrap();

        let loaded = load_settings(&path);
        assert_eq!(loaded.chunk_interval_ms, 50);
        assert_eq!(loaded.max_duration_secs, 120);
        assert_eq!(loaded.frame_interval_ms, 33);
    }

    #[test]
    fn unknown_or_missing_fields_use_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        std::fs::write(&path, r#"{"clock_tick_ms": 10}"#).unwrap();

        let loaded = load_settings(&path);
        assert_eq!(loaded.clock_tick_ms, 10);
        assert_eq!(loaded.chunk_interval_ms, 100);
    }

    #[test]
    fn corrupt_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        std::fs::write(&path, "{not json").unwrap();

        let loaded = load_settings(&path);
        assert_eq!(loaded.clock_tick_ms, 1000);
    }
}

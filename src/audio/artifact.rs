//! Artifact assembly: encoded chunks into a playable in-memory voice note.
//!
//! Finalization concatenates the chunks accumulated by a recording session,
//! in arrival order, into a single WAV buffer. The buffer is reference
//! counted: the stopped session holds the only strong reference, locators
//! handed to players hold weak references, and commit transfers the strong
//! reference to the downstream consumer. Discarding a stopped session
//! therefore invalidates every outstanding locator at once.

use std::io::Cursor;
use std::sync::{Arc, Weak};

use hound::{WavSpec, WavWriter};

use super::capture::CaptureFormat;

/// One encoded audio segment (16-bit little-endian PCM) delivered by the
/// capture device while recording.
#[derive(Clone, PartialEq, Eq)]
pub struct Chunk(Vec<u8>);

impl Chunk {
    pub fn new(bytes: Vec<u8>) -> Self {
        Chunk(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Chunk({} bytes)", self.0.len())
    }
}

/// Errors raised while assembling the artifact container.
#[derive(Debug, Clone)]
pub struct ArtifactError(String);

impl std::fmt::Display for ArtifactError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "artifact assembly failed: {}", self.0)
    }
}

impl std::error::Error for ArtifactError {}

/// The finalized, playable audio object produced once per stopped session.
///
/// Owns the only strong reference to the backing buffer until committed.
#[derive(Clone)]
pub struct FinalizedArtifact {
    bytes: Arc<Vec<u8>>,
    duration_secs: u64,
}

impl FinalizedArtifact {
    /// Size of the encoded buffer in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Recorded duration as reported by the session clock. Authoritative for
    /// display; intentionally not recomputed from the byte length.
    pub fn duration_secs(&self) -> u64 {
        self.duration_secs
    }

    /// Hand out a weak reference a player can use without taking ownership.
    pub fn locator(&self) -> PlaybackLocator {
        PlaybackLocator {
            bytes: Arc::downgrade(&self.bytes),
            duration_secs: self.duration_secs,
        }
    }

    /// Transfer ownership of the buffer to the committing consumer.
    pub fn into_voice_note(self) -> VoiceNote {
        VoiceNote {
            bytes: self.bytes,
            duration_secs: self.duration_secs,
        }
    }
}

impl std::fmt::Debug for FinalizedArtifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FinalizedArtifact")
            .field("bytes", &self.bytes.len())
            .field("duration_secs", &self.duration_secs)
            .finish()
    }
}

/// A dereferenceable handle to an artifact's buffer, valid only while some
/// owner still holds the buffer. Resolving after the owning session was
/// discarded yields `None`.
#[derive(Clone)]
pub struct PlaybackLocator {
    bytes: Weak<Vec<u8>>,
    duration_secs: u64,
}

impl PlaybackLocator {
    pub fn resolve(&self) -> Option<Arc<Vec<u8>>> {
        self.bytes.upgrade()
    }

    pub fn is_valid(&self) -> bool {
        self.bytes.strong_count() > 0
    }

    pub fn duration_secs(&self) -> u64 {
        self.duration_secs
    }
}

impl std::fmt::Debug for PlaybackLocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackLocator")
            .field("valid", &self.is_valid())
            .field("duration_secs", &self.duration_secs)
            .finish()
    }
}

/// The committed payload handed to the post-composition collaborator.
/// Opaque and immutable from the engine's point of view.
#[derive(Clone)]
pub struct VoiceNote {
    pub bytes: Arc<Vec<u8>>,
    pub duration_secs: u64,
}

impl std::fmt::Debug for VoiceNote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoiceNote")
            .field("bytes", &self.bytes.len())
            .field("duration_secs", &self.duration_secs)
            .finish()
    }
}

/// Concatenate `chunks` in arrival order and wrap them in a WAV container.
///
/// Pure given the chunk sequence; invoked exactly once per session, at the
/// stop transition. `duration_secs` comes from the session clock.
pub fn finalize(
    chunks: &[Chunk],
    format: CaptureFormat,
    duration_secs: u64,
) -> Result<FinalizedArtifact, ArtifactError> {
    let spec = WavSpec {
        channels: format.channels,
        sample_rate: format.sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut buf: Vec<u8> = Vec::new();
    {
        let mut writer = WavWriter::new(Cursor::new(&mut buf), spec)
            .map_err(|e| ArtifactError(e.to_string()))?;
        for chunk in chunks {
            // Chunk bytes are i16 little endian; a trailing odd byte would be
            // a device bug, so it is dropped rather than misread.
            for pair in chunk.as_bytes().chunks_exact(2) {
                let sample = i16::from_le_bytes([pair[0], pair[1]]);
                writer
                    .write_sample(sample)
                    .map_err(|e| ArtifactError(e.to_string()))?;
            }
        }
        writer.finalize().map_err(|e| ArtifactError(e.to_string()))?;
    }

    log::debug!(
        "finalized artifact: {} chunks, {} bytes, {}s",
        chunks.len(),
        buf.len(),
        duration_secs
    );

    Ok(FinalizedArtifact {
        bytes: Arc::new(buf),
        duration_secs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use hound::WavReader;

    fn chunk_of(samples: &[i16]) -> Chunk {
        Chunk::new(samples.iter().flat_map(|s| s.to_le_bytes()).collect())
    }

    #[test]
    fn finalize_preserves_chunk_order() {
        let chunks = vec![chunk_of(&[1, 2, 3]), chunk_of(&[4, 5]), chunk_of(&[6])];
        let artifact = finalize(&chunks, CaptureFormat::default(), 1).unwrap();

        let bytes = artifact.locator().resolve().unwrap();
        let reader = WavReader::new(Cursor::new(&bytes[..])).unwrap();
        let samples: Vec<i16> = reader.into_samples().map(|s| s.unwrap()).collect();
        assert_eq!(samples, vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn finalize_carries_the_capture_format() {
        let format = CaptureFormat {
            sample_rate: 44_100,
            channels: 2,
        };
        let artifact = finalize(&[chunk_of(&[0, 0])], format, 1).unwrap();
        let bytes = artifact.locator().resolve().unwrap();
        let reader = WavReader::new(Cursor::new(&bytes[..])).unwrap();
        assert_eq!(reader.spec().sample_rate, 44_100);
        assert_eq!(reader.spec().channels, 2);
        assert_eq!(reader.spec().bits_per_sample, 16);
    }

    #[test]
    fn duration_is_the_clock_value_not_the_byte_length() {
        // One sample of audio but a 7-second clock: the clock wins.
        let artifact = finalize(&[chunk_of(&[42])], CaptureFormat::default(), 7).unwrap();
        assert_eq!(artifact.duration_secs(), 7);
    }

    #[test]
    fn empty_session_still_finalizes() {
        let artifact = finalize(&[], CaptureFormat::default(), 0).unwrap();
        assert!(artifact.len() > 0); // container header only
        let bytes = artifact.locator().resolve().unwrap();
        let reader = WavReader::new(Cursor::new(&bytes[..])).unwrap();
        assert_eq!(reader.len(), 0);
    }

    #[test]
    fn trailing_odd_byte_is_dropped() {
        let mut bytes: Vec<u8> = 7i16.to_le_bytes().to_vec();
        bytes.push(0xff);
        let artifact = finalize(&[Chunk::new(bytes)], CaptureFormat::default(), 1).unwrap();
        let buf = artifact.locator().resolve().unwrap();
        let reader = WavReader::new(Cursor::new(&buf[..])).unwrap();
        assert_eq!(reader.len(), 1);
    }

    #[test]
    fn dropping_the_artifact_invalidates_locators() {
        let artifact = finalize(&[chunk_of(&[1])], CaptureFormat::default(), 1).unwrap();
        let locator = artifact.locator();
        assert!(locator.is_valid());
        drop(artifact);
        assert!(!locator.is_valid());
        assert!(locator.resolve().is_none());
    }

    #[test]
    fn commit_transfers_the_buffer_and_keeps_locators_alive() {
        let artifact = finalize(&[chunk_of(&[1])], CaptureFormat::default(), 3).unwrap();
        let locator = artifact.locator();
        let note = artifact.into_voice_note();
        assert_eq!(note.duration_secs, 3);
        // The committed consumer now owns the buffer the locator points at.
        assert!(Arc::ptr_eq(&note.bytes, &locator.resolve().unwrap()));
    }
}

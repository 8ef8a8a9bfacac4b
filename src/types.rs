//! Core data model shared across the SDK.

use crate::version::{SemanticVersion, split_versioned_id};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Opaque identifier for a loaded model instance (or an in-flight download).
///
/// Value 0 is reserved for "invalid"; handles are never reused within a
/// process lifetime.
pub type ModelHandle = u64;

/// The reserved invalid handle.
pub const INVALID_HANDLE: ModelHandle = 0;

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

/// Issue a fresh process-unique handle.
pub(crate) fn next_handle() -> ModelHandle {
    NEXT_HANDLE.fetch_add(1, Ordering::Relaxed)
}

/// The three model families the SDK executes.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ModelType {
    /// Large language model (text generation).
    #[default]
    Llm,
    /// Speech-to-text.
    Stt,
    /// Text-to-speech.
    Tts,
}

/// Minimum device requirements declared by a registry entry.
///
/// Zero values mean "no requirement"; an empty platform list means "all
/// platforms".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelRequirements {
    pub min_ram_bytes: u64,
    pub min_storage_bytes: u64,
    pub supported_platforms: Vec<String>,
}

/// A registry entry describing one downloadable model version.
///
/// The canonical installed id is `"{base_id}-{version}"`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub model_type: ModelType,
    pub version: String,
    pub size_bytes: u64,
    pub download_url: String,
    pub checksum_sha256: String,
    pub metadata: BTreeMap<String, String>,
    pub requirements: ModelRequirements,
}

impl ModelInfo {
    /// The id with the trailing `-MAJOR.MINOR.PATCH` stripped, when present.
    pub fn base_id(&self) -> &str {
        split_versioned_id(&self.id).map_or(self.id.as_str(), |(base, _)| base)
    }

    /// The parsed semantic version, when `version` is well-formed.
    pub fn semver(&self) -> Option<SemanticVersion> {
        SemanticVersion::parse(&self.version)
    }
}

/// Storage accounting for the model directory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageInfo {
    /// Total bytes of the filesystem holding the model directory.
    pub total_bytes: u64,
    /// Bytes currently available on that filesystem.
    pub available_bytes: u64,
    /// Bytes consumed by installed model artifacts.
    pub used_by_models_bytes: u64,
}

/// One word of a transcription with timing and confidence.
#[derive(Debug, Clone, PartialEq)]
pub struct WordTiming {
    pub text: String,
    /// Seconds from the start of the audio.
    pub start_time: f32,
    pub end_time: f32,
    /// Confidence in `[0, 1]`.
    pub confidence: f32,
}

/// Result of a speech-to-text transcription.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Transcription {
    pub text: String,
    /// Overall confidence in `[0, 1]`; never NaN or infinite.
    pub confidence: f32,
    /// BCP-47-ish language tag, e.g. `"en"`.
    pub language: String,
    pub words: Vec<WordTiming>,
}

/// A voiced region of audio in seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AudioSegment {
    pub start_time: f32,
    pub end_time: f32,
}

impl AudioSegment {
    pub fn duration(&self) -> f32 {
        (self.end_time - self.start_time).max(0.0)
    }
}

/// Voice gender classification for TTS catalog entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoiceGender {
    Male,
    Female,
    Neutral,
}

/// One entry of a TTS voice catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceInfo {
    pub id: String,
    pub name: String,
    /// Language tag, e.g. `"en-GB"`.
    pub language: String,
    pub gender: VoiceGender,
}

/// One completed user/assistant exchange in the voice pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationTurn {
    pub user_text: String,
    pub assistant_text: String,
    /// Seconds since the pipeline epoch; monotonically non-decreasing
    /// across turns.
    pub timestamp: f32,
}

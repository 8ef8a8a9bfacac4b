//! Configuration types for the SDK and its operations.

use crate::logging::LogLevel;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default remote registry endpoint.
pub const DEFAULT_REGISTRY_URL: &str = "https://models.saorsalabs.com/v1/registry.json";

/// Top-level SDK configuration, passed to `Sdk::initialize`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SdkConfig {
    /// Root directory for model artifacts and the local catalog. Required.
    pub model_directory: PathBuf,
    /// Remote registry endpoint (HTTPS).
    pub registry_url: String,
    /// Backend compute threads, `1..=64`.
    pub thread_count: u32,
    /// Process-wide log level.
    pub log_level: LogLevel,
    /// Byte budget for resident models; `0` = unlimited.
    pub memory_limit: u64,
    /// Opt-in local metrics collection.
    pub enable_telemetry: bool,
    /// Worker threads for the asynchronous callback dispatcher.
    pub callback_thread_count: u32,
    /// Run user callbacks inline on the caller thread instead of the pool.
    pub synchronous_callbacks: bool,
}

impl Default for SdkConfig {
    fn default() -> Self {
        Self {
            model_directory: PathBuf::new(),
            registry_url: DEFAULT_REGISTRY_URL.to_owned(),
            thread_count: default_thread_count(),
            log_level: LogLevel::default(),
            memory_limit: 0,
            enable_telemetry: false,
            callback_thread_count: 1,
            synchronous_callbacks: false,
        }
    }
}

/// Hardware concurrency clamped to the supported `1..=64` range.
pub fn default_thread_count() -> u32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(4)
        .clamp(1, 64)
}

/// Sampling and length parameters for LLM generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Maximum tokens to generate.
    pub max_tokens: u32,
    /// Sampling temperature; `0.0` is greedy and fully deterministic.
    pub temperature: f32,
    /// Nucleus sampling mass.
    pub top_p: f32,
    /// Top-k sampling cutoff.
    pub top_k: u32,
    /// Penalty applied to recently-emitted tokens.
    pub repetition_penalty: f32,
    /// Generation halts before any of these would appear in the output.
    pub stop_sequences: Vec<String>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_tokens: 512,
            temperature: 0.7,
            top_p: 0.9,
            top_k: 40,
            repetition_penalty: 1.1,
            stop_sequences: Vec::new(),
        }
    }
}

/// Options for speech-to-text transcription.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscriptionConfig {
    /// Expected language tag; `None` = auto-detect.
    pub language: Option<String>,
    /// Translate the transcription to English.
    pub translate_to_english: bool,
    /// Include per-word timestamps in the result.
    pub word_timestamps: bool,
}

/// Options for text-to-speech synthesis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesisConfig {
    /// Voice catalog id; empty selects the first catalog entry.
    pub voice_id: String,
    /// Playback speed multiplier, `0.5..=2.0`.
    pub speed: f32,
    /// Pitch offset in octaves, `-1.0..=1.0`; `0.0` leaves pitch unchanged.
    pub pitch: f32,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            voice_id: String::new(),
            speed: 1.0,
            pitch: 0.0,
        }
    }
}

/// Configuration for the conversational voice pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Gate turns on voice activity before transcribing.
    pub vad_enabled: bool,
    /// Energy threshold for the VAD gate, `0.0..=1.0`.
    pub vad_threshold: f32,
    /// Generation parameters for the LLM stage.
    pub generation: GenerationConfig,
    /// Transcription parameters for the STT stage.
    pub transcription: TranscriptionConfig,
    /// Synthesis parameters for the TTS stage.
    pub synthesis: SynthesisConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            vad_enabled: true,
            vad_threshold: 0.5,
            generation: GenerationConfig::default(),
            transcription: TranscriptionConfig::default(),
            synthesis: SynthesisConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn generation_defaults_match_contract() {
        let config = GenerationConfig::default();
        assert_eq!(config.max_tokens, 512);
        assert!((config.temperature - 0.7).abs() < f32::EPSILON);
        assert!((config.top_p - 0.9).abs() < f32::EPSILON);
        assert_eq!(config.top_k, 40);
        assert!((config.repetition_penalty - 1.1).abs() < f32::EPSILON);
        assert!(config.stop_sequences.is_empty());
    }

    #[test]
    fn synthesis_defaults_are_neutral() {
        let config = SynthesisConfig::default();
        assert!(config.voice_id.is_empty());
        assert!((config.speed - 1.0).abs() < f32::EPSILON);
        assert_eq!(config.pitch, 0.0);
    }

    #[test]
    fn sdk_defaults_are_sane() {
        let config = SdkConfig::default();
        assert!(config.model_directory.as_os_str().is_empty());
        assert!(config.registry_url.starts_with("https://"));
        assert!((1..=64).contains(&config.thread_count));
        assert_eq!(config.memory_limit, 0);
        assert_eq!(config.callback_thread_count, 1);
        assert!(!config.synchronous_callbacks);
    }

    #[test]
    fn sdk_config_deserializes_with_partial_fields() {
        let config: SdkConfig = serde_json::from_str(
            r#"{"model_directory":"/tmp/models","memory_limit":1048576}"#,
        )
        .expect("deserialize");
        assert_eq!(config.model_directory, PathBuf::from("/tmp/models"));
        assert_eq!(config.memory_limit, 1_048_576);
        assert_eq!(config.registry_url, DEFAULT_REGISTRY_URL);
    }

    #[test]
    fn pipeline_defaults() {
        let config = PipelineConfig::default();
        assert!(config.vad_enabled);
        assert!((config.vad_threshold - 0.5).abs() < f32::EPSILON);
    }
}

//! Selkie: on-device AI SDK.
//!
//! Loads and executes three families of neural models (large language
//! models, speech-to-text and text-to-speech) entirely locally, wires them
//! into a conversational voice pipeline, and manages the full model
//! lifecycle: discovery, verified resumable downloads, versioning with
//! pinning, storage accounting and memory-budgeted eviction.
//!
//! # Architecture
//!
//! The [`sdk::Sdk`] façade owns one instance of each subsystem:
//! - **Memory broker**: byte accounting, LRU ordering and eviction
//!   arbitration shared by every engine
//! - **Callback dispatcher**: bounded worker pool delivering user callbacks
//! - **Model registry**: persisted local catalog, remote listing, verified
//!   downloads, semantic-version pinning
//! - **Engines**: LLM (generation + streaming), STT (VAD + transcription),
//!   TTS (multi-voice synthesis)
//! - **Voice pipeline**: audio in → STT → LLM → TTS → audio out with
//!   multi-turn history
//!
//! All inference is in-process; the network is used only to fetch model
//! artifacts and registry metadata, over HTTPS.

pub mod accel;
pub mod audio;
pub mod config;
pub mod device;
pub mod dispatch;
pub mod download;
pub mod error;
pub mod hash;
pub mod http;
pub mod llm;
pub mod logging;
pub mod memory;
pub mod pipeline;
pub mod recovery;
pub mod registry;
pub mod sdk;
pub mod stt;
pub mod tts;
pub mod types;
pub mod version;

pub use audio::AudioData;
pub use config::{
    GenerationConfig, PipelineConfig, SdkConfig, SynthesisConfig, TranscriptionConfig,
};
pub use error::{ErrorKind, Result, SdkError};
pub use logging::LogLevel;
pub use sdk::Sdk;
pub use types::{
    ConversationTurn, INVALID_HANDLE, ModelHandle, ModelInfo, ModelType, Transcription,
    VoiceInfo,
};

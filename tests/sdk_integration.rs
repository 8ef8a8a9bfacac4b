//! SDK façade lifecycle against the real component stack: initialize,
//! load models through the façade's engines, run a conversation, shut down.
//!
//! The façade instance is process-global, so every test here serializes on
//! one lock.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use selkie::config::{GenerationConfig, PipelineConfig};
use selkie::pipeline::AudioSource;
use selkie::{AudioData, ErrorKind, Sdk, SdkConfig};
use std::sync::{Arc, Mutex};

static TEST_LOCK: Mutex<()> = Mutex::new(());

fn guarded() -> std::sync::MutexGuard<'static, ()> {
    let guard = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    Sdk::shutdown();
    guard
}

fn config_in(dir: &std::path::Path) -> SdkConfig {
    SdkConfig {
        model_directory: dir.join("models"),
        synchronous_callbacks: true,
        ..SdkConfig::default()
    }
}

fn write_model(dir: &std::path::Path, name: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("{name} artifact")).expect("write model");
    path
}

fn speech_chunk() -> AudioData {
    let sample_rate = 16_000u32;
    let samples = (0..sample_rate as usize)
        .map(|i| {
            0.4 * (2.0 * std::f32::consts::PI * 440.0 * i as f32 / sample_rate as f32).sin()
        })
        .collect();
    AudioData::new(samples, sample_rate)
}

#[test]
fn full_voice_conversation_through_the_facade() {
    let _guard = guarded();
    let dir = tempfile::tempdir().expect("tempdir");
    let sdk = Sdk::initialize(config_in(dir.path())).expect("initialize");

    let stt_handle = sdk
        .stt_engine()
        .load_model(&write_model(dir.path(), "whisper-tiny-1.0.0"))
        .expect("stt");
    let llm_handle = sdk
        .llm_engine()
        .load_model(&write_model(dir.path(), "llama-3b-1.0.0"))
        .expect("llm");
    let tts_handle = sdk
        .tts_engine()
        .load_model(&write_model(dir.path(), "kokoro-mini-1.0.0"))
        .expect("tts");

    let pipeline_config = PipelineConfig {
        generation: GenerationConfig {
            temperature: 0.0,
            max_tokens: 16,
            ..GenerationConfig::default()
        },
        ..PipelineConfig::default()
    };
    sdk.voice_pipeline()
        .configure(stt_handle, llm_handle, tts_handle, pipeline_config)
        .expect("configure");

    let mut remaining = 2u32;
    let source: AudioSource = Box::new(move || {
        if remaining == 0 {
            AudioData::end_of_stream()
        } else {
            remaining -= 1;
            speech_chunk()
        }
    });
    let spoken = Arc::new(Mutex::new(Vec::<usize>::new()));
    let audio_sink = Arc::clone(&spoken);

    sdk.voice_pipeline()
        .start_conversation(
            source,
            Box::new(move |audio| audio_sink.lock().unwrap().push(audio.samples.len())),
            Arc::new(|_| {}),
            Arc::new(|_| {}),
        )
        .expect("conversation");

    assert_eq!(spoken.lock().unwrap().len(), 2);
    assert_eq!(sdk.voice_pipeline().get_history().len(), 2);
    assert!(sdk.memory_broker().total_bytes() > 0);

    Sdk::shutdown();
    assert!(Sdk::instance().is_none());
    assert_eq!(sdk.memory_broker().total_bytes(), 0, "models force-unloaded");
}

#[test]
fn facade_rejects_invalid_configuration_without_side_effects() {
    let _guard = guarded();
    let err = Sdk::initialize(SdkConfig::default()).unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidInputConfiguration);
    assert!(Sdk::instance().is_none());

    let dir = tempfile::tempdir().expect("tempdir");
    let bad_threads = SdkConfig {
        thread_count: 0,
        ..config_in(dir.path())
    };
    let err = Sdk::initialize(bad_threads).unwrap_err();
    assert_eq!(err.kind, ErrorKind::InvalidInputParameterValue);
    assert!(Sdk::instance().is_none());
}

#[test]
fn registry_is_usable_through_the_facade_offline() {
    let _guard = guarded();
    let dir = tempfile::tempdir().expect("tempdir");
    let sdk = Sdk::initialize(config_in(dir.path())).expect("initialize");

    let registry = sdk.model_registry();
    assert!(registry.list_downloaded_models().is_empty());
    assert!(!registry.is_model_downloaded("llama-3b-1.0.0"));
    let storage = registry.get_storage_info();
    assert_eq!(storage.used_by_models_bytes, 0);

    Sdk::shutdown();
}

#[test]
fn memory_limit_flows_from_config_to_broker() {
    let _guard = guarded();
    let dir = tempfile::tempdir().expect("tempdir");
    let config = SdkConfig {
        memory_limit: 50_000,
        ..config_in(dir.path())
    };
    let sdk = Sdk::initialize(config).expect("initialize");
    assert_eq!(sdk.memory_broker().memory_limit(), 50_000);

    sdk.set_memory_limit(80_000);
    assert_eq!(sdk.memory_broker().memory_limit(), 80_000);
    Sdk::shutdown();
}

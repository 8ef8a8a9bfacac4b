//! End-to-end tests over the engine stack without the SDK façade:
//! broker-accounted loads, a full conversation through the voice pipeline,
//! and the streaming/synchronous equivalence contract.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use selkie::config::{GenerationConfig, PipelineConfig};
use selkie::dispatch::{CallbackDispatcher, DispatcherConfig};
use selkie::llm::LlmEngine;
use selkie::memory::MemoryBroker;
use selkie::pipeline::{AudioSink, AudioSource, TextCallback, VoicePipeline};
use selkie::stt::SttEngine;
use selkie::tts::TtsEngine;
use selkie::{AudioData, ModelHandle};
use std::path::Path;
use std::sync::{Arc, Mutex};

struct Stack {
    broker: Arc<MemoryBroker>,
    stt: Arc<SttEngine>,
    llm: Arc<LlmEngine>,
    tts: Arc<TtsEngine>,
    pipeline: Arc<VoicePipeline>,
    stt_handle: ModelHandle,
    llm_handle: ModelHandle,
    tts_handle: ModelHandle,
    _dir: tempfile::TempDir,
}

fn write_model(dir: &Path, name: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("{name} weights for integration tests"))
        .expect("write model file");
    path
}

fn stack(synchronous_callbacks: bool) -> Stack {
    let dir = tempfile::tempdir().expect("tempdir");
    let broker = Arc::new(MemoryBroker::new(0));
    let dispatcher = Arc::new(CallbackDispatcher::new(DispatcherConfig {
        synchronous: synchronous_callbacks,
        thread_count: 1,
        max_queue_size: 256,
    }));
    let stt = Arc::new(SttEngine::new(Arc::clone(&broker)));
    let llm = Arc::new(LlmEngine::new(Arc::clone(&broker), Arc::clone(&dispatcher)));
    let tts = Arc::new(TtsEngine::new(Arc::clone(&broker), Arc::clone(&dispatcher)));

    let stt_handle = stt
        .load_model(&write_model(dir.path(), "whisper-tiny-1.0.0"))
        .expect("stt load");
    let llm_handle = llm
        .load_model(&write_model(dir.path(), "llama-3b-1.0.0"))
        .expect("llm load");
    let tts_handle = tts
        .load_model(&write_model(dir.path(), "kokoro-mini-1.0.0"))
        .expect("tts load");

    let pipeline = Arc::new(VoicePipeline::new(
        Arc::clone(&stt),
        Arc::clone(&llm),
        Arc::clone(&tts),
        Arc::clone(&dispatcher),
    ));
    Stack {
        broker,
        stt,
        llm,
        tts,
        pipeline,
        stt_handle,
        llm_handle,
        tts_handle,
        _dir: dir,
    }
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

fn chunk_source(chunks: Vec<AudioData>) -> AudioSource {
    let mut queue = chunks.into_iter();
    Box::new(move || queue.next().unwrap_or_else(AudioData::end_of_stream))
}

fn greedy_pipeline_config() -> PipelineConfig {
    PipelineConfig {
        generation: GenerationConfig {
            temperature: 0.0,
            max_tokens: 24,
            ..GenerationConfig::default()
        },
        ..PipelineConfig::default()
    }
}

#[test]
fn broker_accounts_every_engine() {
    let stack = stack(true);
    let before = stack.broker.total_bytes();
    assert!(before > 0);

    stack.stt.unload_model(stack.stt_handle).expect("unload stt");
    stack.llm.unload_model(stack.llm_handle).expect("unload llm");
    stack.tts.unload_model(stack.tts_handle).expect("unload tts");
    assert_eq!(stack.broker.total_bytes(), 0);
}

#[test]
fn conversation_round_trip_with_synchronous_callbacks() {
    let stack = stack(true);
    stack
        .pipeline
        .configure(
            stack.stt_handle,
            stack.llm_handle,
            stack.tts_handle,
            greedy_pipeline_config(),
        )
        .expect("configure");

    let transcriptions = Arc::new(Mutex::new(Vec::<String>::new()));
    let replies = Arc::new(Mutex::new(Vec::<String>::new()));
    let spoken = Arc::new(Mutex::new(0usize));

    let t_sink = Arc::clone(&transcriptions);
    let r_sink = Arc::clone(&replies);
    let audio_counter = Arc::clone(&spoken);
    let sink: AudioSink = Box::new(move |audio| {
        assert!(!audio.samples.is_empty());
        assert!(audio.sample_rate >= 16_000);
        *audio_counter.lock().unwrap() += 1;
    });
    let on_transcription: TextCallback =
        Arc::new(move |text| t_sink.lock().unwrap().push(text.to_owned()));
    let on_reply: TextCallback =
        Arc::new(move |text| r_sink.lock().unwrap().push(text.to_owned()));

    stack
        .pipeline
        .start_conversation(
            chunk_source(vec![speech_chunk(), speech_chunk()]),
            sink,
            on_transcription,
            on_reply,
        )
        .expect("conversation");

    assert_eq!(transcriptions.lock().unwrap().len(), 2);
    assert_eq!(replies.lock().unwrap().len(), 2);
    assert_eq!(*spoken.lock().unwrap(), 2);

    let history = stack.pipeline.get_history();
    assert_eq!(history.len(), 2);
    assert!(history[1].timestamp >= history[0].timestamp);

    // The LLM saw both turns.
    let llm_history = stack
        .llm
        .get_conversation_history(stack.llm_handle)
        .expect("llm history");
    assert_eq!(llm_history.len(), 4);
}

#[test]
fn conversation_delivers_callbacks_from_async_pool() {
    let stack = stack(false);
    stack
        .pipeline
        .configure(
            stack.stt_handle,
            stack.llm_handle,
            stack.tts_handle,
            greedy_pipeline_config(),
        )
        .expect("configure");

    let replies = Arc::new(Mutex::new(Vec::<String>::new()));
    let r_sink = Arc::clone(&replies);
    stack
        .pipeline
        .start_conversation(
            chunk_source(vec![speech_chunk()]),
            Box::new(|_| {}),
            Arc::new(|_| {}),
            Arc::new(move |text| r_sink.lock().unwrap().push(text.to_owned())),
        )
        .expect("conversation");

    // The async dispatcher may still be draining; wait briefly.
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
    while replies.lock().unwrap().is_empty() && std::time::Instant::now() < deadline {
        std::thread::sleep(std::time::Duration::from_millis(5));
    }
    assert_eq!(replies.lock().unwrap().len(), 1);
}

#[test]
fn streaming_generation_matches_pipeline_reply() {
    let stack = stack(true);
    let config = GenerationConfig {
        temperature: 0.0,
        max_tokens: 24,
        ..GenerationConfig::default()
    };

    let reply = stack
        .llm
        .generate(stack.llm_handle, "integration prompt", &config)
        .expect("generate");
    stack.llm.clear_context(stack.llm_handle).expect("clear");

    let streamed = Arc::new(Mutex::new(String::new()));
    let sink = Arc::clone(&streamed);
    stack
        .llm
        .generate_streaming(
            stack.llm_handle,
            "integration prompt",
            move |token| {
                sink.lock().unwrap().push_str(token);
                true
            },
            &config,
        )
        .expect("stream");
    assert_eq!(*streamed.lock().unwrap(), reply);
}

#[test]
fn synthesized_reply_survives_wav_round_trip() {
    let stack = stack(true);
    let audio = stack
        .tts
        .synthesize(
            stack.tts_handle,
            "round trip",
            &selkie::SynthesisConfig::default(),
        )
        .expect("synthesize");

    let wav = audio.to_wav(16).expect("encode");
    let decoded = AudioData::from_wav(&wav).expect("decode");
    assert_eq!(decoded.sample_rate, audio.sample_rate);
    assert_eq!(decoded.samples.len(), audio.samples.len());
    for (got, want) in decoded.samples.iter().zip(audio.samples.iter()) {
        assert!((got - want).abs() <= 0.01);
    }
}

#[test]
fn transcription_feeds_generation_directly() {
    let stack = stack(true);
    let transcription = stack
        .stt
        .transcribe(
            stack.stt_handle,
            &speech_chunk(),
            &selkie::TranscriptionConfig::default(),
        )
        .expect("transcribe");
    assert!(!transcription.text.is_empty());

    let reply = stack
        .llm
        .generate(
            stack.llm_handle,
            &transcription.text,
            &GenerationConfig {
                temperature: 0.0,
                ..GenerationConfig::default()
            },
        )
        .expect("generate from transcription");
    assert!(!reply.is_empty());
}

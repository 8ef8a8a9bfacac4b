//! Conversational voice pipeline: audio in → STT → LLM → TTS → audio out.
//!
//! The pipeline pulls audio chunks from a caller-supplied source until it
//! yields the empty end-of-stream sentinel or the conversation is stopped.
//! Each chunk becomes at most one turn: a VAD gate, a transcription, a
//! generated reply and synthesized audio pushed to the sink. Intermediate
//! text results are delivered through the callback dispatcher. A failed
//! turn is logged and skipped; later turns still proceed.

use crate::audio::AudioData;
use crate::config::PipelineConfig;
use crate::dispatch::CallbackDispatcher;
use crate::error::{ErrorKind, Result, SdkError};
use crate::llm::LlmEngine;
use crate::stt::SttEngine;
use crate::tts::TtsEngine;
use crate::types::{ConversationTurn, INVALID_HANDLE, ModelHandle};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Pulls the next audio chunk; empty audio ends the conversation.
pub type AudioSource = Box<dyn FnMut() -> AudioData + Send>;

/// Receives synthesized reply audio.
pub type AudioSink = Box<dyn FnMut(AudioData) + Send>;

/// Receives intermediate text results (transcriptions, LLM replies).
pub type TextCallback = Arc<dyn Fn(&str) + Send + Sync>;

struct PipelineSetup {
    stt_handle: ModelHandle,
    llm_handle: ModelHandle,
    tts_handle: ModelHandle,
    config: PipelineConfig,
}

/// Orchestrates the STT → LLM → TTS loop with multi-turn history.
pub struct VoicePipeline {
    stt: Arc<SttEngine>,
    llm: Arc<LlmEngine>,
    tts: Arc<TtsEngine>,
    dispatcher: Arc<CallbackDispatcher>,
    setup: Mutex<Option<PipelineSetup>>,
    history: Mutex<Vec<ConversationTurn>>,
    running: AtomicBool,
    stop_requested: AtomicBool,
    interrupt_requested: AtomicBool,
    epoch: Instant,
}

impl VoicePipeline {
    pub fn new(
        stt: Arc<SttEngine>,
        llm: Arc<LlmEngine>,
        tts: Arc<TtsEngine>,
        dispatcher: Arc<CallbackDispatcher>,
    ) -> Self {
        Self {
            stt,
            llm,
            tts,
            dispatcher,
            setup: Mutex::new(None),
            history: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            interrupt_requested: AtomicBool::new(false),
            epoch: Instant::now(),
        }
    }

    /// Bind the three engine handles and the pipeline configuration.
    pub fn configure(
        &self,
        stt_handle: ModelHandle,
        llm_handle: ModelHandle,
        tts_handle: ModelHandle,
        config: PipelineConfig,
    ) -> Result<()> {
        for (name, handle) in [
            ("stt_handle", stt_handle),
            ("llm_handle", llm_handle),
            ("tts_handle", tts_handle),
        ] {
            if handle == INVALID_HANDLE {
                return Err(SdkError::new(
                    ErrorKind::InvalidInputModelHandle,
                    "pipeline requires a valid handle for every stage",
                    format!("parameter={name} value={handle}"),
                ));
            }
        }
        if !(0.0..=1.0).contains(&config.vad_threshold) || !config.vad_threshold.is_finite()
        {
            return Err(SdkError::new(
                ErrorKind::InvalidInputParameterValue,
                "VAD threshold must lie within the unit interval",
                format!("parameter=vad_threshold value={}", config.vad_threshold),
            ));
        }
        *self.lock_setup() = Some(PipelineSetup {
            stt_handle,
            llm_handle,
            tts_handle,
            config,
        });
        info!(stt_handle, llm_handle, tts_handle, "pipeline configured");
        Ok(())
    }

    /// Run the conversation loop on the caller thread.
    ///
    /// Returns after the source yields end-of-stream or
    /// [`VoicePipeline::stop_conversation`] is called. Only one conversation
    /// may run at a time.
    pub fn start_conversation(
        &self,
        mut source: AudioSource,
        mut sink: AudioSink,
        on_transcription: TextCallback,
        on_llm_text: TextCallback,
    ) -> Result<()> {
        if self.lock_setup().is_none() {
            return Err(SdkError::new(
                ErrorKind::InvalidInputConfiguration,
                "pipeline has not been configured with engine handles",
                "call configure before start_conversation",
            ));
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(SdkError::new(
                ErrorKind::InvalidInputConfiguration,
                "a conversation is already running on this pipeline",
                "call stop_conversation first",
            ));
        }
        self.stop_requested.store(false, Ordering::SeqCst);
        self.interrupt_requested.store(false, Ordering::SeqCst);
        info!("conversation started");

        while !self.stop_requested.load(Ordering::SeqCst) {
            let chunk = source();
            if chunk.is_end_of_stream() {
                debug!("audio source reached end of stream");
                break;
            }
            match self.run_turn(&chunk, &mut sink, &on_transcription, &on_llm_text) {
                Ok(()) => {}
                Err(e) if e.kind == ErrorKind::OperationCancelled => {
                    debug!("turn interrupted, continuing with next chunk");
                    self.interrupt_requested.store(false, Ordering::SeqCst);
                }
                Err(e) => warn!(error = %e, "pipeline turn failed, skipping"),
            }
        }

        self.running.store(false, Ordering::SeqCst);
        info!("conversation finished");
        Ok(())
    }

    /// End the conversation loop after the in-flight turn.
    pub fn stop_conversation(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        self.interrupt_requested.store(true, Ordering::SeqCst);
    }

    /// Abort the in-flight turn; the loop continues with the next chunk.
    pub fn interrupt(&self) {
        self.interrupt_requested.store(true, Ordering::SeqCst);
    }

    /// Completed turns, oldest first.
    pub fn get_history(&self) -> Vec<ConversationTurn> {
        self.lock_history().clone()
    }

    /// Drop the turn history and clear the LLM context.
    pub fn clear_history(&self) -> Result<()> {
        self.lock_history().clear();
        let llm_handle = self.lock_setup().as_ref().map(|s| s.llm_handle);
        if let Some(handle) = llm_handle {
            self.llm.clear_context(handle)?;
        }
        Ok(())
    }

    fn run_turn(
        &self,
        chunk: &AudioData,
        sink: &mut AudioSink,
        on_transcription: &TextCallback,
        on_llm_text: &TextCallback,
    ) -> Result<()> {
        let (stt_handle, llm_handle, tts_handle, config) = {
            let setup = self.lock_setup();
            let setup = setup.as_ref().ok_or_else(|| {
                SdkError::new(
                    ErrorKind::InvalidInputConfiguration,
                    "pipeline has not been configured with engine handles",
                    "call configure before start_conversation",
                )
            })?;
            (
                setup.stt_handle,
                setup.llm_handle,
                setup.tts_handle,
                setup.config.clone(),
            )
        };

        if config.vad_enabled {
            let segments = self
                .stt
                .detect_voice_activity(chunk, config.vad_threshold)?;
            if segments.is_empty() {
                debug!("no voice activity in chunk, skipping turn");
                return Ok(());
            }
        }

        let transcription = self
            .stt
            .transcribe(stt_handle, chunk, &config.transcription)?;
        let user_text = transcription.text.trim().to_owned();
        if user_text.is_empty() {
            debug!("empty transcription, skipping turn");
            return Ok(());
        }
        self.deliver_text(stt_handle, on_transcription, &user_text);
        self.check_interrupt()?;

        let assistant_text = self
            .llm
            .generate(llm_handle, &user_text, &config.generation)?;
        self.deliver_text(llm_handle, on_llm_text, &assistant_text);
        self.check_interrupt()?;

        let reply_audio = self
            .tts
            .synthesize(tts_handle, &assistant_text, &config.synthesis)?;
        sink(reply_audio);

        let mut history = self.lock_history();
        let previous = history.last().map_or(0.0, |turn| turn.timestamp);
        let timestamp = self.epoch.elapsed().as_secs_f32().max(previous);
        history.push(ConversationTurn {
            user_text,
            assistant_text,
            timestamp,
        });
        Ok(())
    }

    fn deliver_text(&self, key: ModelHandle, callback: &TextCallback, text: &str) {
        let callback = Arc::clone(callback);
        let text = text.to_owned();
        loop {
            let callback = Arc::clone(&callback);
            let text = text.clone();
            let accepted = self
                .dispatcher
                .dispatch_keyed(key, Box::new(move || callback(&text)));
            if accepted {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
    }

    fn check_interrupt(&self) -> Result<()> {
        if self.interrupt_requested.load(Ordering::SeqCst) {
            return Err(SdkError::new(
                ErrorKind::OperationCancelled,
                "conversation turn was interrupted by the caller",
                "stage=pipeline",
            ));
        }
        Ok(())
    }

    fn lock_setup(&self) -> std::sync::MutexGuard<'_, Option<PipelineSetup>> {
        self.setup.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_history(&self) -> std::sync::MutexGuard<'_, Vec<ConversationTurn>> {
        self.history.lock().unwrap_or_else(|e| e.into_inner())
    }
}

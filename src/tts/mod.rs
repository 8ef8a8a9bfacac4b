//! Text-to-speech engine: synthesis with speed/pitch control, a multi-voice
//! catalog and streaming chunk delivery.
//!
//! Speed is applied as a time-stretch after synthesis so output duration
//! inversely tracks the speed factor; pitch shifts the voice fundamental by
//! `2^pitch` octaves. Streaming emits contiguous in-order chunks through the
//! callback dispatcher whose concatenation equals the one-shot result.

mod backend;

use crate::accel::{
    AcceleratorType, HardwareAccelerationConfig, detect_accelerators, select_accelerator,
};
use crate::audio::AudioData;
use crate::config::SynthesisConfig;
use crate::dispatch::CallbackDispatcher;
use crate::error::{ErrorKind, Result, SdkError};
use crate::memory::MemoryBroker;
use crate::recovery::CleanupGuard;
use crate::types::{INVALID_HANDLE, ModelHandle, VoiceInfo, next_handle};
use backend::{OUTPUT_SAMPLE_RATE, TtsBackend};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info};

/// Samples per streamed audio chunk.
const STREAM_CHUNK_SAMPLES: usize = 4_096;

struct LoadedTts {
    backend: Box<dyn TtsBackend>,
}

/// Speech-synthesis engine over broker-accounted loaded models.
pub struct TtsEngine {
    models: RwLock<HashMap<ModelHandle, Arc<Mutex<LoadedTts>>>>,
    broker: Arc<MemoryBroker>,
    dispatcher: Arc<CallbackDispatcher>,
    accelerator: Mutex<AcceleratorType>,
}

impl TtsEngine {
    pub fn new(broker: Arc<MemoryBroker>, dispatcher: Arc<CallbackDispatcher>) -> Self {
        let accelerator = select_accelerator(
            &HardwareAccelerationConfig::default_for_speech(),
            &detect_accelerators(),
        )
        .unwrap_or(AcceleratorType::Cpu);
        Self {
            models: RwLock::new(HashMap::new()),
            broker,
            dispatcher,
            accelerator: Mutex::new(accelerator),
        }
    }

    /// Select the accelerator used for subsequent loads, walking the
    /// preference list in order.
    pub fn configure_acceleration(
        &self,
        config: &HardwareAccelerationConfig,
    ) -> Result<AcceleratorType> {
        let selected = select_accelerator(config, &detect_accelerators())?;
        *self.accelerator.lock().unwrap_or_else(|e| e.into_inner()) = selected;
        info!(accelerator = %selected, "TTS acceleration configured");
        Ok(selected)
    }

    /// The accelerator currently selected for this engine.
    pub fn accelerator(&self) -> AcceleratorType {
        *self.accelerator.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Load a model artifact and its voice catalog.
    pub fn load_model(&self, path: &Path) -> Result<ModelHandle> {
        if !path.is_file() {
            return Err(SdkError::new(
                ErrorKind::ModelFileNotFound,
                "model file does not exist or is not a regular file",
                format!("path={}", path.display()),
            )
            .with_recovery("download the model through the registry first"));
        }
        let size = std::fs::metadata(path)?.len();

        if self.broker.needs_eviction(size) {
            self.evict_for(size)?;
        }

        let handle = next_handle();
        self.broker.track_allocation(handle, size);
        let rollback_broker = Arc::clone(&self.broker);
        let mut rollback =
            CleanupGuard::new(move || rollback_broker.track_deallocation(handle));

        let backend = backend::open(path)?;
        rollback.dismiss();

        self.models_mut()
            .insert(handle, Arc::new(Mutex::new(LoadedTts { backend })));
        info!(handle, path = %path.display(), size, "TTS model loaded");
        Ok(handle)
    }

    /// Unload a model and release its memory accounting.
    pub fn unload_model(&self, handle: ModelHandle) -> Result<()> {
        match self.models_mut().remove(&handle) {
            Some(_) => {
                self.broker.track_deallocation(handle);
                info!(handle, "TTS model unloaded");
                Ok(())
            }
            None => Err(invalid_handle(handle)),
        }
    }

    /// Unload every loaded model. Used by SDK shutdown.
    pub fn unload_all(&self) {
        let handles: Vec<ModelHandle> = self.models().keys().copied().collect();
        for handle in handles {
            let _ = self.unload_model(handle);
        }
    }

    pub fn is_loaded(&self, handle: ModelHandle) -> bool {
        self.models().contains_key(&handle)
    }

    pub fn loaded_model_count(&self) -> usize {
        self.models().len()
    }

    /// The loaded model's voice catalog.
    pub fn get_available_voices(&self, handle: ModelHandle) -> Result<Vec<VoiceInfo>> {
        let model = self.model(handle)?;
        self.broker.record_access(handle);
        let guard = lock_model(&model);
        Ok(guard.backend.voices().iter().map(|v| v.info.clone()).collect())
    }

    /// Synthesize `text` to mono PCM.
    pub fn synthesize(
        &self,
        handle: ModelHandle,
        text: &str,
        config: &SynthesisConfig,
    ) -> Result<AudioData> {
        let model = self.model(handle)?;
        validate_config(config)?;
        if text.is_empty() {
            return Err(SdkError::new(
                ErrorKind::InferenceInvalidInput,
                "cannot synthesize empty text",
                "parameter=text value=\"\"",
            ));
        }

        self.broker.record_access(handle);
        self.broker.increment_ref_count(handle);
        let active_broker = Arc::clone(&self.broker);
        let _active = CleanupGuard::new(move || active_broker.decrement_ref_count(handle));

        let mut guard = lock_model(&model);
        let voice_index = resolve_voice(guard.backend.as_ref(), &config.voice_id)?;
        debug!(handle, voice_index, speed = config.speed, pitch = config.pitch, "synthesizing");
        let rendered = guard.backend.synthesize(text, voice_index, config.pitch);
        let samples = time_stretch(&rendered, config.speed);
        Ok(AudioData::new(samples, OUTPUT_SAMPLE_RATE))
    }

    /// Synthesize `text`, delivering contiguous in-order chunks through the
    /// dispatcher. The concatenation of all chunks equals the one-shot
    /// [`TtsEngine::synthesize`] output.
    pub fn synthesize_streaming<F>(
        &self,
        handle: ModelHandle,
        text: &str,
        chunk_callback: F,
        config: &SynthesisConfig,
    ) -> Result<()>
    where
        F: FnMut(AudioData) + Send + 'static,
    {
        let audio = self.synthesize(handle, text, config)?;
        let callback = Arc::new(Mutex::new(chunk_callback));
        for chunk in audio.samples.chunks(STREAM_CHUNK_SAMPLES) {
            let chunk_audio = AudioData::new(chunk.to_vec(), audio.sample_rate);
            loop {
                let callback = Arc::clone(&callback);
                let chunk_audio = chunk_audio.clone();
                let accepted = self.dispatcher.dispatch_keyed(
                    handle,
                    Box::new(move || {
                        let mut cb = callback.lock().unwrap_or_else(|e| e.into_inner());
                        (cb)(chunk_audio);
                    }),
                );
                if accepted {
                    break;
                }
                std::thread::sleep(std::time::Duration::from_millis(1));
            }
        }
        Ok(())
    }

    fn models(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, HashMap<ModelHandle, Arc<Mutex<LoadedTts>>>> {
        self.models.read().unwrap_or_else(|e| e.into_inner())
    }

    fn models_mut(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<ModelHandle, Arc<Mutex<LoadedTts>>>> {
        self.models.write().unwrap_or_else(|e| e.into_inner())
    }

    fn model(&self, handle: ModelHandle) -> Result<Arc<Mutex<LoadedTts>>> {
        if handle == INVALID_HANDLE {
            return Err(invalid_handle(handle));
        }
        self.models()
            .get(&handle)
            .cloned()
            .ok_or_else(|| invalid_handle(handle))
    }

    fn evict_for(&self, required: u64) -> Result<()> {
        for victim in self.broker.get_eviction_candidates(required) {
            if !self.broker.needs_eviction(required) {
                break;
            }
            if !self.is_loaded(victim) {
                continue;
            }
            info!(victim, required, "evicting LRU model to make room");
            self.unload_model(victim)?;
        }
        if self.broker.needs_eviction(required) {
            return Err(SdkError::new(
                ErrorKind::ResourceOutOfMemory,
                "memory budget cannot accommodate this model",
                format!(
                    "required={required} resident={} limit={}",
                    self.broker.total_bytes(),
                    self.broker.memory_limit()
                ),
            )
            .with_recovery("unload unused models or raise the memory limit"));
        }
        Ok(())
    }
}

fn lock_model(model: &Arc<Mutex<LoadedTts>>) -> std::sync::MutexGuard<'_, LoadedTts> {
    model.lock().unwrap_or_else(|e| e.into_inner())
}

fn invalid_handle(handle: ModelHandle) -> SdkError {
    SdkError::new(
        ErrorKind::InvalidInputModelHandle,
        "model handle does not refer to a loaded TTS model",
        format!("handle={handle}"),
    )
    .with_recovery("load a model and use the handle it returns")
}

fn validate_config(config: &SynthesisConfig) -> Result<()> {
    if !(0.5..=2.0).contains(&config.speed) || !config.speed.is_finite() {
        return Err(SdkError::new(
            ErrorKind::InvalidInputParameterValue,
            "speed must lie within the supported range",
            format!("parameter=speed value={} range=[0.5,2.0]", config.speed),
        ));
    }
    if !(-1.0..=1.0).contains(&config.pitch) || !config.pitch.is_finite() {
        return Err(SdkError::new(
            ErrorKind::InvalidInputParameterValue,
            "pitch must lie within the supported range",
            format!("parameter=pitch value={} range=[-1.0,1.0]", config.pitch),
        ));
    }
    Ok(())
}

/// Resolve a requested voice id against the catalog; empty selects the
/// first entry.
fn resolve_voice(backend: &dyn TtsBackend, voice_id: &str) -> Result<usize> {
    if voice_id.is_empty() {
        return Ok(0);
    }
    backend
        .voices()
        .iter()
        .position(|v| v.info.id == voice_id)
        .ok_or_else(|| {
            let catalog = backend
                .voices()
                .iter()
                .map(|v| v.info.id.as_str())
                .collect::<Vec<_>>()
                .join(",");
            SdkError::new(
                ErrorKind::InvalidInputParameterValue,
                "requested voice is not in the catalog",
                format!("voice_id={voice_id} available=[{catalog}]"),
            )
            .with_recovery("pick a voice id from get_available_voices")
        })
}

/// Stretch playback time by `1/speed` via linear interpolation, keeping the
/// sample rate fixed.
fn time_stretch(samples: &[f32], speed: f32) -> Vec<f32> {
    if (speed - 1.0).abs() < f32::EPSILON || samples.is_empty() {
        return samples.to_vec();
    }
    let out_len = ((samples.len() as f64) / f64::from(speed)).round() as usize;
    let mut out = Vec::with_capacity(out_len.max(1));
    for i in 0..out_len.max(1) {
        let pos = i as f64 * f64::from(speed);
        let idx = pos as usize;
        let frac = (pos - idx as f64) as f32;
        let a = samples[idx.min(samples.len() - 1)];
        let b = samples[(idx + 1).min(samples.len() - 1)];
        out.push(a + (b - a) * frac);
    }
    out
}

//! Speech-to-text engine: audio preprocessing, voice activity detection and
//! transcription with confidences.
//!
//! Audio is resampled to the model rate and peak-normalized before decoding.
//! VAD frames audio at 30 ms and thresholds each frame's RMS energy
//! relative to the loudest frame, so the `[0, 1]` threshold is meaningful
//! regardless of recording level.

mod backend;

use crate::accel::{
    AcceleratorType, HardwareAccelerationConfig, detect_accelerators, select_accelerator,
};
use crate::audio::AudioData;
use crate::config::TranscriptionConfig;
use crate::error::{ErrorKind, Result, SdkError};
use crate::memory::MemoryBroker;
use crate::recovery::CleanupGuard;
use crate::types::{AudioSegment, INVALID_HANDLE, ModelHandle, Transcription, next_handle};
use backend::{MODEL_SAMPLE_RATE, SttBackend, root_mean_square};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info};

/// VAD analysis frame length.
const VAD_FRAME_MS: u32 = 30;

struct LoadedStt {
    backend: Box<dyn SttBackend>,
}

/// Speech-to-text engine over broker-accounted loaded models.
pub struct SttEngine {
    models: RwLock<HashMap<ModelHandle, Arc<Mutex<LoadedStt>>>>,
    broker: Arc<MemoryBroker>,
    accelerator: Mutex<AcceleratorType>,
}

impl SttEngine {
    pub fn new(broker: Arc<MemoryBroker>) -> Self {
        let accelerator = select_accelerator(
            &HardwareAccelerationConfig::default_for_speech(),
            &detect_accelerators(),
        )
        .unwrap_or(AcceleratorType::Cpu);
        Self {
            models: RwLock::new(HashMap::new()),
            broker,
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
        info!(accelerator = %selected, "STT acceleration configured");
        Ok(selected)
    }

    /// The accelerator currently selected for this engine.
    pub fn accelerator(&self) -> AcceleratorType {
        *self.accelerator.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Load a model artifact and return its handle.
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
            .insert(handle, Arc::new(Mutex::new(LoadedStt { backend })));
        info!(handle, path = %path.display(), size, "STT model loaded");
        Ok(handle)
    }

    /// Unload a model and release its memory accounting.
    pub fn unload_model(&self, handle: ModelHandle) -> Result<()> {
        match self.models_mut().remove(&handle) {
            Some(_) => {
                self.broker.track_deallocation(handle);
                info!(handle, "STT model unloaded");
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

    /// Transcribe audio to text with confidences.
    pub fn transcribe(
        &self,
        handle: ModelHandle,
        audio: &AudioData,
        config: &TranscriptionConfig,
    ) -> Result<Transcription> {
        let model = self.model(handle)?;
        validate_audio(audio)?;

        self.broker.record_access(handle);
        self.broker.increment_ref_count(handle);
        let active_broker = Arc::clone(&self.broker);
        let _active = CleanupGuard::new(move || active_broker.decrement_ref_count(handle));

        let prepared = audio.resample(MODEL_SAMPLE_RATE).normalized_peak();
        debug!(
            handle,
            duration_s = prepared.duration_seconds(),
            "transcribing audio segment"
        );
        let mut guard = model.lock().unwrap_or_else(|e| e.into_inner());
        Ok(guard.backend.transcribe(&prepared.samples, config))
    }

    /// Energy-based voice activity detection.
    ///
    /// Returns time-ordered, non-overlapping voiced segments. `threshold`
    /// is relative to the loudest frame and must lie in `[0, 1]`; pure
    /// silence yields an empty vec. Does not require a loaded model.
    pub fn detect_voice_activity(
        &self,
        audio: &AudioData,
        threshold: f32,
    ) -> Result<Vec<AudioSegment>> {
        if !(0.0..=1.0).contains(&threshold) || !threshold.is_finite() {
            return Err(SdkError::new(
                ErrorKind::InvalidInputParameterValue,
                "VAD threshold must lie within the unit interval",
                format!("parameter=threshold value={threshold}"),
            ));
        }
        validate_audio(audio)?;
        Ok(frame_segments(&audio.samples, audio.sample_rate, threshold))
    }

    fn models(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, HashMap<ModelHandle, Arc<Mutex<LoadedStt>>>> {
        self.models.read().unwrap_or_else(|e| e.into_inner())
    }

    fn models_mut(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<ModelHandle, Arc<Mutex<LoadedStt>>>> {
        self.models.write().unwrap_or_else(|e| e.into_inner())
    }

    fn model(&self, handle: ModelHandle) -> Result<Arc<Mutex<LoadedStt>>> {
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

fn invalid_handle(handle: ModelHandle) -> SdkError {
    SdkError::new(
        ErrorKind::InvalidInputModelHandle,
        "model handle does not refer to a loaded STT model",
        format!("handle={handle}"),
    )
    .with_recovery("load a model and use the handle it returns")
}

fn validate_audio(audio: &AudioData) -> Result<()> {
    if audio.samples.is_empty() || audio.sample_rate == 0 {
        return Err(SdkError::new(
            ErrorKind::InvalidInputAudioFormat,
            "audio must contain samples at a positive sample rate",
            format!(
                "samples={} sample_rate={}",
                audio.samples.len(),
                audio.sample_rate
            ),
        ));
    }
    Ok(())
}

/// Frame `samples` at [`VAD_FRAME_MS`] and merge frames whose RMS energy,
/// relative to the loudest frame, exceeds `threshold`.
pub(crate) fn frame_segments(
    samples: &[f32],
    sample_rate: u32,
    threshold: f32,
) -> Vec<AudioSegment> {
    if samples.is_empty() || sample_rate == 0 {
        return Vec::new();
    }
    let frame_len = ((sample_rate * VAD_FRAME_MS / 1_000) as usize).max(1);
    let energies: Vec<f32> = samples
        .chunks(frame_len)
        .map(root_mean_square)
        .collect();
    let peak = energies.iter().copied().fold(0.0f32, f32::max);
    if peak <= f32::EPSILON {
        return Vec::new();
    }

    let mut segments = Vec::new();
    let mut current_start: Option<usize> = None;
    for (i, energy) in energies.iter().enumerate() {
        let voiced = energy / peak > threshold;
        match (voiced, current_start) {
            (true, None) => current_start = Some(i),
            (false, Some(start)) => {
                segments.push(segment_from_frames(start, i, frame_len, sample_rate));
                current_start = None;
            }
            _ => {}
        }
    }
    if let Some(start) = current_start {
        segments.push(segment_from_frames(
            start,
            energies.len(),
            frame_len,
            sample_rate,
        ));
    }
    segments
}

fn segment_from_frames(
    start_frame: usize,
    end_frame: usize,
    frame_len: usize,
    sample_rate: u32,
) -> AudioSegment {
    AudioSegment {
        start_time: (start_frame * frame_len) as f32 / sample_rate as f32,
        end_time: (end_frame * frame_len) as f32 / sample_rate as f32,
    }
}

//! Large language model engine: loading, tokenization, synchronous and
//! streaming generation, KV-context accounting and conversation history.
//!
//! Each loaded model is serialized by its own generation lock; distinct
//! handles generate in parallel. Loads consult the memory broker and may
//! evict least-recently-used models this engine owns; streaming tokens are
//! delivered through the callback dispatcher keyed by handle so one
//! generation's tokens stay ordered.

mod backend;

use crate::accel::{
    AcceleratorType, HardwareAccelerationConfig, detect_accelerators, select_accelerator,
};
use crate::config::GenerationConfig;
use crate::dispatch::CallbackDispatcher;
use crate::error::{ErrorKind, Result, SdkError};
use crate::memory::MemoryBroker;
use crate::recovery::CleanupGuard;
use crate::types::{INVALID_HANDLE, ModelHandle, next_handle};
use backend::LlmBackend;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::{debug, info};

/// Context window of the built-in backend.
const DEFAULT_CONTEXT_SIZE: u32 = 4_096;

struct LoadedLlm {
    backend: Box<dyn LlmBackend>,
    context_used: u32,
    history: Vec<String>,
}

struct GenerationOutcome {
    prompt_tokens: u32,
    emitted_tokens: u32,
    text: String,
}

/// Text-generation engine over broker-accounted loaded models.
pub struct LlmEngine {
    models: RwLock<HashMap<ModelHandle, Arc<Mutex<LoadedLlm>>>>,
    broker: Arc<MemoryBroker>,
    dispatcher: Arc<CallbackDispatcher>,
    accelerator: Mutex<AcceleratorType>,
}

impl LlmEngine {
    pub fn new(broker: Arc<MemoryBroker>, dispatcher: Arc<CallbackDispatcher>) -> Self {
        let accelerator = select_accelerator(
            &HardwareAccelerationConfig::default_for_text(),
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
        info!(accelerator = %selected, "LLM acceleration configured");
        Ok(selected)
    }

    /// The accelerator currently selected for this engine.
    pub fn accelerator(&self) -> AcceleratorType {
        *self.accelerator.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Load a model artifact and return its handle.
    ///
    /// When the memory budget would be exceeded, least-recently-used models
    /// owned by this engine are unloaded first; if that cannot free enough,
    /// the load fails with `ResourceOutOfMemory`.
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

        let backend = backend::open(path, DEFAULT_CONTEXT_SIZE)?;
        rollback.dismiss();

        self.models_mut().insert(
            handle,
            Arc::new(Mutex::new(LoadedLlm {
                backend,
                context_used: 0,
                history: Vec::new(),
            })),
        );
        info!(handle, path = %path.display(), size, "LLM model loaded");
        Ok(handle)
    }

    /// Unload a model and release its memory accounting.
    pub fn unload_model(&self, handle: ModelHandle) -> Result<()> {
        match self.models_mut().remove(&handle) {
            Some(_) => {
                self.broker.track_deallocation(handle);
                info!(handle, "LLM model unloaded");
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

    /// Tokenize text with the model's tokenizer.
    pub fn tokenize(&self, handle: ModelHandle, text: &str) -> Result<Vec<i32>> {
        let model = self.model(handle)?;
        self.broker.record_access(handle);
        let mut guard = lock_model(&model);
        Ok(guard.backend.tokenize(text))
    }

    /// Inverse of [`LlmEngine::tokenize`] up to whitespace normalization.
    pub fn detokenize(&self, handle: ModelHandle, tokens: &[i32]) -> Result<String> {
        let model = self.model(handle)?;
        self.broker.record_access(handle);
        let mut guard = lock_model(&model);
        Ok(guard.backend.detokenize(tokens))
    }

    /// Generate a completion synchronously.
    pub fn generate(
        &self,
        handle: ModelHandle,
        prompt: &str,
        config: &GenerationConfig,
    ) -> Result<String> {
        let model = self.model(handle)?;
        self.broker.record_access(handle);
        self.broker.increment_ref_count(handle);
        let active_broker = Arc::clone(&self.broker);
        let _active = CleanupGuard::new(move || active_broker.decrement_ref_count(handle));

        let mut guard = lock_model(&model);
        let outcome = run_generation(&mut guard, prompt, config, &mut |_| true)?;
        let text = outcome.text.clone();
        commit_turn(&mut guard, prompt, outcome);
        Ok(text)
    }

    /// Generate a completion, delivering each token through the dispatcher.
    ///
    /// `on_token` returns `true` to continue; returning `false` stops the
    /// generation cleanly: tokens already delivered stay committed to the
    /// conversation history and the call returns `Ok`.
    pub fn generate_streaming<F>(
        &self,
        handle: ModelHandle,
        prompt: &str,
        on_token: F,
        config: &GenerationConfig,
    ) -> Result<()>
    where
        F: FnMut(&str) -> bool + Send + 'static,
    {
        let model = self.model(handle)?;
        self.broker.record_access(handle);
        self.broker.increment_ref_count(handle);
        let active_broker = Arc::clone(&self.broker);
        let _active = CleanupGuard::new(move || active_broker.decrement_ref_count(handle));

        let callback = Arc::new(Mutex::new(on_token));
        let stop = Arc::new(AtomicBool::new(false));
        let dispatcher = Arc::clone(&self.dispatcher);

        let mut guard = lock_model(&model);
        let outcome = run_generation(&mut guard, prompt, config, &mut |token| {
            deliver_token(&dispatcher, handle, &callback, &stop, token);
            !stop.load(Ordering::SeqCst)
        })?;
        commit_turn(&mut guard, prompt, outcome);
        Ok(())
    }

    /// Reset the model's KV cache, token accounting and history.
    pub fn clear_context(&self, handle: ModelHandle) -> Result<()> {
        let model = self.model(handle)?;
        let mut guard = lock_model(&model);
        guard.backend.reset();
        guard.context_used = 0;
        guard.history.clear();
        debug!(handle, "context cleared");
        Ok(())
    }

    /// Tokens currently resident in the context window.
    pub fn get_context_usage(&self, handle: ModelHandle) -> Result<u32> {
        let model = self.model(handle)?;
        let guard = lock_model(&model);
        Ok(guard.context_used)
    }

    /// Context window capacity in tokens.
    pub fn get_context_capacity(&self, handle: ModelHandle) -> Result<u32> {
        let model = self.model(handle)?;
        let guard = lock_model(&model);
        Ok(guard.backend.context_size())
    }

    /// Alternating `"User: …"` / `"Assistant: …"` history entries.
    pub fn get_conversation_history(&self, handle: ModelHandle) -> Result<Vec<String>> {
        let model = self.model(handle)?;
        let guard = lock_model(&model);
        Ok(guard.history.clone())
    }

    fn models(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, HashMap<ModelHandle, Arc<Mutex<LoadedLlm>>>> {
        self.models.read().unwrap_or_else(|e| e.into_inner())
    }

    fn models_mut(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<ModelHandle, Arc<Mutex<LoadedLlm>>>> {
        self.models.write().unwrap_or_else(|e| e.into_inner())
    }

    fn model(&self, handle: ModelHandle) -> Result<Arc<Mutex<LoadedLlm>>> {
        if handle == INVALID_HANDLE {
            return Err(invalid_handle(handle));
        }
        self.models()
            .get(&handle)
            .cloned()
            .ok_or_else(|| invalid_handle(handle))
    }

    /// Unload LRU candidates this engine owns until `required` bytes fit.
    fn evict_for(&self, required: u64) -> Result<()> {
        for victim in self.broker.get_eviction_candidates(required) {
            if !self.broker.needs_eviction(required) {
                break;
            }
            if !self.is_loaded(victim) {
                // Another engine owns this handle; it must arbitrate its own
                // unloads.
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

fn lock_model(model: &Arc<Mutex<LoadedLlm>>) -> std::sync::MutexGuard<'_, LoadedLlm> {
    model.lock().unwrap_or_else(|e| e.into_inner())
}

fn invalid_handle(handle: ModelHandle) -> SdkError {
    SdkError::new(
        ErrorKind::InvalidInputModelHandle,
        "model handle does not refer to a loaded LLM model",
        format!("handle={handle}"),
    )
    .with_recovery("load a model and use the handle it returns")
}

/// Deliver one token through the dispatcher with per-handle ordering.
///
/// Backpressure waits for queue space instead of dropping the token, so
/// every generated token is delivered exactly once in order.
fn deliver_token<F>(
    dispatcher: &Arc<CallbackDispatcher>,
    handle: ModelHandle,
    callback: &Arc<Mutex<F>>,
    stop: &Arc<AtomicBool>,
    token: &str,
) where
    F: FnMut(&str) -> bool + Send + 'static,
{
    loop {
        let token_owned = token.to_owned();
        let callback = Arc::clone(callback);
        let stop_flag = Arc::clone(stop);
        let accepted = dispatcher.dispatch_keyed(
            handle,
            Box::new(move || {
                let mut cb = callback.lock().unwrap_or_else(|e| e.into_inner());
                if !(cb)(&token_owned) {
                    stop_flag.store(true, Ordering::SeqCst);
                }
            }),
        );
        if accepted || stop.load(Ordering::SeqCst) {
            break;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// Shared decode loop for synchronous and streaming generation.
///
/// `emit` receives each token in order and returns `false` to stop; stop
/// sequences halt generation before they would appear in the output.
fn run_generation(
    model: &mut LoadedLlm,
    prompt: &str,
    config: &GenerationConfig,
    emit: &mut dyn FnMut(&str) -> bool,
) -> Result<GenerationOutcome> {
    if config.max_tokens == 0 {
        return Err(SdkError::new(
            ErrorKind::InvalidInputParameterValue,
            "max_tokens must be at least one token",
            "parameter=max_tokens value=0",
        ));
    }
    if config.temperature < 0.0 || !config.temperature.is_finite() {
        return Err(SdkError::new(
            ErrorKind::InvalidInputParameterValue,
            "temperature must be a finite non-negative value",
            format!("parameter=temperature value={}", config.temperature),
        ));
    }

    let prompt_tokens = model.backend.tokenize(prompt).len() as u32;
    let capacity = model.backend.context_size();
    let projected = u64::from(model.context_used)
        + u64::from(prompt_tokens)
        + u64::from(config.max_tokens);
    if projected > u64::from(capacity) {
        return Err(SdkError::new(
            ErrorKind::InferenceContextWindowExceeded,
            "prompt and requested tokens exceed the context window",
            format!(
                "used={} prompt_tokens={prompt_tokens} max_tokens={} capacity={capacity}",
                model.context_used, config.max_tokens
            ),
        )
        .with_recovery("clear the context or reduce max_tokens"));
    }

    let planned = model.backend.plan_tokens(prompt, config);
    let mut text = String::new();
    let mut emitted = 0u32;
    for token in planned {
        if emitted >= config.max_tokens {
            break;
        }
        let would_contain_stop = config
            .stop_sequences
            .iter()
            .filter(|stop| !stop.is_empty())
            .any(|stop| format!("{text}{token}").contains(stop.as_str()));
        if would_contain_stop {
            break;
        }
        text.push_str(&token);
        emitted += 1;
        if !emit(&token) {
            break;
        }
    }

    Ok(GenerationOutcome {
        prompt_tokens,
        emitted_tokens: emitted,
        text,
    })
}

fn commit_turn(model: &mut LoadedLlm, prompt: &str, outcome: GenerationOutcome) {
    model.history.push(format!("User: {prompt}"));
    model.history.push(format!("Assistant: {}", outcome.text));
    model.context_used = model
        .context_used
        .saturating_add(outcome.prompt_tokens)
        .saturating_add(outcome.emitted_tokens);
}

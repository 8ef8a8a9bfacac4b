//! Process-wide SDK façade: configuration, component wiring and lifecycle.
//!
//! Exactly one SDK instance exists at a time. `initialize` validates the
//! configuration, builds the memory broker, callback dispatcher, registry
//! and the three engines in order, and publishes the instance through a
//! mutex-guarded slot; under concurrent initialization exactly one caller
//! wins. `shutdown` is idempotent and tears everything down in reverse.

use crate::config::SdkConfig;
use crate::device::DeviceCapabilities;
use crate::dispatch::{CallbackDispatcher, DispatcherConfig};
use crate::error::{ErrorKind, Result, SdkError};
use crate::http::HttpClient;
use crate::llm::LlmEngine;
use crate::logging::{self, LogLevel};
use crate::memory::MemoryBroker;
use crate::pipeline::VoicePipeline;
use crate::registry::ModelRegistry;
use crate::stt::SttEngine;
use crate::tts::TtsEngine;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

static INSTANCE: Mutex<Option<Arc<Sdk>>> = Mutex::new(None);

/// The assembled SDK: owns every component singleton.
pub struct Sdk {
    config: Mutex<SdkConfig>,
    broker: Arc<MemoryBroker>,
    dispatcher: Arc<CallbackDispatcher>,
    registry: Arc<ModelRegistry>,
    llm: Arc<LlmEngine>,
    stt: Arc<SttEngine>,
    tts: Arc<TtsEngine>,
    pipeline: Arc<VoicePipeline>,
}

impl std::fmt::Debug for Sdk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sdk").finish_non_exhaustive()
    }
}

impl Sdk {
    /// Build and publish the process-wide instance.
    ///
    /// Fails when the configuration is invalid or an instance already
    /// exists. The model directory is created when missing.
    pub fn initialize(config: SdkConfig) -> Result<Arc<Sdk>> {
        validate_config(&config)?;

        let mut slot = lock_instance();
        if slot.is_some() {
            return Err(SdkError::new(
                ErrorKind::InvalidInputConfiguration,
                "the SDK is already initialized in this process",
                "call shutdown before initializing again",
            ));
        }

        logging::init(config.log_level);
        std::fs::create_dir_all(&config.model_directory)?;

        let broker = Arc::new(MemoryBroker::new(config.memory_limit));
        broker.set_memory_pressure_callback(Arc::new(|usage, limit| {
            warn!(usage, limit, "model memory usage crossed the pressure threshold");
        }));

        let dispatcher = Arc::new(CallbackDispatcher::new(dispatcher_config(&config)));
        let transport = Arc::new(HttpClient::new());
        let registry = Arc::new(ModelRegistry::new(
            config.model_directory.clone(),
            config.registry_url.clone(),
            transport,
        )?);

        let llm = Arc::new(LlmEngine::new(
            Arc::clone(&broker),
            Arc::clone(&dispatcher),
        ));
        let stt = Arc::new(SttEngine::new(Arc::clone(&broker)));
        let tts = Arc::new(TtsEngine::new(
            Arc::clone(&broker),
            Arc::clone(&dispatcher),
        ));
        let pipeline = Arc::new(VoicePipeline::new(
            Arc::clone(&stt),
            Arc::clone(&llm),
            Arc::clone(&tts),
            Arc::clone(&dispatcher),
        ));

        let sdk = Arc::new(Sdk {
            config: Mutex::new(config),
            broker,
            dispatcher,
            registry,
            llm,
            stt,
            tts,
            pipeline,
        });
        *slot = Some(Arc::clone(&sdk));
        info!("SDK initialized");
        Ok(sdk)
    }

    /// The published instance, when one exists.
    pub fn instance() -> Option<Arc<Sdk>> {
        lock_instance().clone()
    }

    /// Tear down the published instance. Idempotent.
    ///
    /// Engines are force-unloaded, the dispatcher drains and joins its
    /// workers, then the instance slot is cleared.
    pub fn shutdown() {
        let taken = lock_instance().take();
        if let Some(sdk) = taken {
            sdk.pipeline.stop_conversation();
            sdk.llm.unload_all();
            sdk.stt.unload_all();
            sdk.tts.unload_all();
            sdk.dispatcher.shutdown();
            info!("SDK shut down");
        }
    }

    // ---- component access --------------------------------------------------

    pub fn memory_broker(&self) -> &Arc<MemoryBroker> {
        &self.broker
    }

    pub fn callback_dispatcher(&self) -> &Arc<CallbackDispatcher> {
        &self.dispatcher
    }

    pub fn model_registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn llm_engine(&self) -> &Arc<LlmEngine> {
        &self.llm
    }

    pub fn stt_engine(&self) -> &Arc<SttEngine> {
        &self.stt
    }

    pub fn tts_engine(&self) -> &Arc<TtsEngine> {
        &self.tts
    }

    pub fn voice_pipeline(&self) -> &Arc<VoicePipeline> {
        &self.pipeline
    }

    /// Snapshot of the active configuration.
    pub fn config(&self) -> SdkConfig {
        self.lock_config().clone()
    }

    /// Capabilities of the device this SDK runs on.
    pub fn device_capabilities(&self) -> DeviceCapabilities {
        DeviceCapabilities::detect(&self.lock_config().model_directory)
    }

    // ---- runtime setters ---------------------------------------------------

    /// Update the backend thread count. Out-of-range values are silently
    /// ignored.
    pub fn set_thread_count(&self, thread_count: u32) {
        if !(1..=64).contains(&thread_count) {
            warn!(thread_count, "ignoring out-of-range thread count");
            return;
        }
        self.lock_config().thread_count = thread_count;
    }

    /// Update the log level for subsequently-created subscribers. The
    /// process-wide subscriber keeps its original filter.
    pub fn set_log_level(&self, log_level: LogLevel) {
        self.lock_config().log_level = log_level;
    }

    /// Update the model memory budget; `0` = unlimited.
    pub fn set_memory_limit(&self, memory_limit: u64) {
        self.lock_config().memory_limit = memory_limit;
        self.broker.set_memory_limit(memory_limit);
    }

    /// Update the model directory used by the next initialization. Empty
    /// values are silently ignored; the running registry keeps its
    /// directory.
    pub fn set_model_directory(&self, model_directory: &std::path::Path) {
        if model_directory.as_os_str().is_empty() {
            warn!("ignoring empty model directory");
            return;
        }
        self.lock_config().model_directory = model_directory.to_path_buf();
    }

    /// Switch the dispatcher between synchronous and asynchronous delivery.
    pub fn set_synchronous_callbacks(&self, synchronous: bool) {
        let new_config = {
            let mut config = self.lock_config();
            config.synchronous_callbacks = synchronous;
            dispatcher_config(&config)
        };
        self.dispatcher.reconfigure(new_config);
    }

    /// Resize the asynchronous dispatcher pool. Zero is silently ignored.
    pub fn set_callback_thread_count(&self, callback_thread_count: u32) {
        if callback_thread_count == 0 {
            warn!("ignoring zero callback thread count");
            return;
        }
        let new_config = {
            let mut config = self.lock_config();
            config.callback_thread_count = callback_thread_count;
            dispatcher_config(&config)
        };
        self.dispatcher.reconfigure(new_config);
    }

    fn lock_config(&self) -> std::sync::MutexGuard<'_, SdkConfig> {
        self.config.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn lock_instance() -> std::sync::MutexGuard<'static, Option<Arc<Sdk>>> {
    INSTANCE.lock().unwrap_or_else(|e| e.into_inner())
}

fn dispatcher_config(config: &SdkConfig) -> DispatcherConfig {
    DispatcherConfig {
        synchronous: config.synchronous_callbacks,
        thread_count: config.callback_thread_count.max(1) as usize,
        max_queue_size: 1_024,
    }
}

fn validate_config(config: &SdkConfig) -> Result<()> {
    if !(1..=64).contains(&config.thread_count) {
        return Err(SdkError::new(
            ErrorKind::InvalidInputParameterValue,
            "thread count must lie between 1 and 64",
            format!("parameter=thread_count value={}", config.thread_count),
        ));
    }
    if config.model_directory.as_os_str().is_empty() {
        return Err(SdkError::new(
            ErrorKind::InvalidInputConfiguration,
            "a model directory is required to initialize the SDK",
            "parameter=model_directory value=\"\"",
        )
        .with_recovery("set model_directory to a writable path"));
    }
    Ok(())
}

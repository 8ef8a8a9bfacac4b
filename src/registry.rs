//! Local model catalog, remote registry queries and lifecycle management.
//!
//! The catalog is a JSON file (`registry.json`) in the model directory,
//! rewritten whole on every change; version pins live alongside it in
//! `pinned_versions.json`. Remote listing, filtering and recommendation are
//! pure functions over the fetched registry; downloads hand off to the
//! download engine and insert into the catalog on success.
//!
//! Multiple versions of one base id coexist freely; deletion is always
//! explicit.

use crate::device::{DeviceCapabilities, available_storage_bytes, total_storage_bytes};
use crate::download::{DownloadEngine, DownloadProgress, DownloadRequest, tmp_path};
use crate::error::{ErrorKind, Result, SdkError};
use crate::http::{CancelFlag, Transport};
use crate::recovery::{RetryConfig, with_retry};
use crate::types::{ModelHandle, ModelInfo, ModelType, StorageInfo, next_handle};
use crate::version::{SemanticVersion, is_valid_semantic_version, split_versioned_id};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

const REGISTRY_FILE: &str = "registry.json";
const PINNED_FILE: &str = "pinned_versions.json";
const REGISTRY_SCHEMA_VERSION: &str = "1.0";

/// On-disk catalog layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryFile {
    pub version: String,
    pub models: Vec<ModelInfo>,
}

struct ActiveDownload {
    cancel: CancelFlag,
    tmp: PathBuf,
}

struct RegistryState {
    catalog: BTreeMap<String, ModelInfo>,
    pinned: BTreeMap<String, String>,
    active_downloads: HashMap<ModelHandle, ActiveDownload>,
}

/// Persisted catalog of installed models plus remote registry operations.
pub struct ModelRegistry {
    model_dir: PathBuf,
    registry_url: String,
    transport: Arc<dyn Transport>,
    engine: DownloadEngine,
    retry: RetryConfig,
    state: Mutex<RegistryState>,
}

impl ModelRegistry {
    /// Open (or create) the catalog under `model_dir`.
    ///
    /// Creates the directory, loads both JSON files when present, and sweeps
    /// stale `*.tmp` artifacts left by crashed downloads.
    pub fn new(
        model_dir: impl Into<PathBuf>,
        registry_url: impl Into<String>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        let model_dir = model_dir.into();
        std::fs::create_dir_all(&model_dir)?;
        let catalog = load_catalog(&model_dir.join(REGISTRY_FILE));
        let pinned = load_pins(&model_dir.join(PINNED_FILE));
        let registry = Self {
            model_dir,
            registry_url: registry_url.into(),
            engine: DownloadEngine::new(Arc::clone(&transport)),
            transport,
            retry: RetryConfig::default(),
            state: Mutex::new(RegistryState {
                catalog,
                pinned,
                active_downloads: HashMap::new(),
            }),
        };
        registry.cleanup_incomplete_downloads();
        Ok(registry)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The directory holding artifacts and catalog files.
    pub fn model_directory(&self) -> &Path {
        &self.model_dir
    }

    /// Remove `*.tmp` files that no in-progress download owns.
    pub fn cleanup_incomplete_downloads(&self) {
        let active: Vec<PathBuf> = {
            let state = self.lock();
            state
                .active_downloads
                .values()
                .map(|d| d.tmp.clone())
                .collect()
        };
        let mut removed = 0usize;
        let entries = match std::fs::read_dir(&self.model_dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(dir = %self.model_dir.display(), error = %e, "cannot scan model directory");
                return;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let is_tmp = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e == "tmp");
            if is_tmp && !active.contains(&path) && std::fs::remove_file(&path).is_ok() {
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, "removed incomplete download artifacts");
        }
    }

    // ---- remote operations -------------------------------------------------

    /// Fetch and parse the remote registry, retrying transient failures.
    fn fetch_remote(&self) -> Result<Vec<ModelInfo>> {
        with_retry(&self.retry, |_, _| {}, || {
            let body = self.transport.fetch_text(&self.registry_url)?;
            serde_json::from_str::<Vec<ModelInfo>>(&body).map_err(|e| {
                SdkError::new(
                    ErrorKind::NetworkHTTPError,
                    "remote registry returned an unparseable payload",
                    format!("url={} error={e}", self.registry_url),
                )
            })
        })
    }

    /// Remote models compatible with this device, optionally filtered by
    /// type. Order-preserving over the remote listing.
    pub fn list_available_models(
        &self,
        type_filter: Option<ModelType>,
        device: &DeviceCapabilities,
    ) -> Result<Vec<ModelInfo>> {
        let remote = self.fetch_remote()?;
        Ok(filter_models(remote, type_filter, device))
    }

    /// Up to ten compatible models, best first.
    pub fn recommend_models(
        &self,
        type_filter: Option<ModelType>,
        device: &DeviceCapabilities,
    ) -> Result<Vec<ModelInfo>> {
        let mut candidates = self.list_available_models(type_filter, device)?;
        candidates.sort_by(|a, b| {
            recommendation_score(b, device)
                .partial_cmp(&recommendation_score(a, device))
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.semver().cmp(&a.semver()))
        });
        candidates.truncate(10);
        Ok(candidates)
    }

    /// Versions of `base_id` available remotely, newest first.
    pub fn get_available_versions(&self, base_id: &str) -> Result<Vec<String>> {
        let remote = self.fetch_remote()?;
        let mut versions: Vec<SemanticVersion> = remote
            .iter()
            .filter(|info| info.base_id() == base_id)
            .filter_map(ModelInfo::semver)
            .collect();
        versions.sort_unstable_by(|a, b| b.cmp(a));
        versions.dedup();
        Ok(versions.iter().map(ToString::to_string).collect())
    }

    /// Whether a newer version of the installed `versioned_id` exists
    /// remotely. Returns that version's registry entry when it does.
    pub fn check_for_updates(&self, versioned_id: &str) -> Result<Option<ModelInfo>> {
        let (base_id, current) = {
            let state = self.lock();
            let installed = state.catalog.get(versioned_id).ok_or_else(|| {
                not_in_registry(versioned_id, "model is not installed locally")
            })?;
            let current = installed.semver().ok_or_else(|| {
                SdkError::new(
                    ErrorKind::InvalidInputParameterValue,
                    "installed model carries an invalid version string",
                    format!("id={versioned_id} version={}", installed.version),
                )
            })?;
            (installed.base_id().to_owned(), current)
        };
        let remote = self.fetch_remote()?;
        let newest = remote
            .into_iter()
            .filter(|info| info.base_id() == base_id)
            .filter(|info| info.semver().is_some_and(|v| v > current))
            .max_by_key(ModelInfo::semver);
        Ok(newest)
    }

    /// Download and install a model.
    ///
    /// `id` may be a versioned id (exact match) or a base id (the newest
    /// remote version is selected). Returns a handle usable with
    /// [`ModelRegistry::cancel_download`] from another thread. Blocks until
    /// the artifact is installed and the catalog persisted.
    pub fn download_model(
        &self,
        id: &str,
        progress: DownloadProgress,
    ) -> Result<ModelHandle> {
        let remote = self.fetch_remote()?;
        let info = resolve_remote(&remote, id)?;
        if !is_valid_semantic_version(&info.version) {
            return Err(SdkError::new(
                ErrorKind::InvalidInputParameterValue,
                "remote registry entry carries an invalid version string",
                format!("id={} version={}", info.id, info.version),
            ));
        }

        {
            let state = self.lock();
            if state.catalog.contains_key(&info.id) {
                return Err(SdkError::new(
                    ErrorKind::InvalidInputParameterValue,
                    "this model version is already installed",
                    format!("id={}", info.id),
                )
                .with_recovery("delete the installed version first to re-download"));
            }
        }

        let handle = next_handle();
        let cancel = CancelFlag::new();
        let dest_path = self.model_dir.join(&info.id);
        self.lock().active_downloads.insert(
            handle,
            ActiveDownload {
                cancel: cancel.clone(),
                tmp: tmp_path(&dest_path),
            },
        );

        let request = DownloadRequest {
            url: info.download_url.clone(),
            dest_path,
            expected_size: info.size_bytes,
            expected_sha256: info.checksum_sha256.clone(),
            retry: self.retry.clone(),
        };
        let outcome = self.engine.download(&request, &progress, &cancel);
        self.lock().active_downloads.remove(&handle);
        outcome?;

        let mut installed = info;
        installed.metadata.insert(
            "download_timestamp".to_owned(),
            chrono::Utc::now().timestamp().to_string(),
        );
        {
            let mut state = self.lock();
            state.catalog.insert(installed.id.clone(), installed);
            self.persist_catalog(&state)?;
        }
        info!(id, handle, "model installed");
        Ok(handle)
    }

    /// Cancel an in-flight download by its handle.
    pub fn cancel_download(&self, handle: ModelHandle) -> Result<()> {
        let state = self.lock();
        match state.active_downloads.get(&handle) {
            Some(download) => {
                download.cancel.cancel();
                Ok(())
            }
            None => Err(SdkError::new(
                ErrorKind::InvalidInputModelHandle,
                "no in-flight download matches this handle",
                format!("handle={handle}"),
            )),
        }
    }

    // ---- local reads -------------------------------------------------------

    /// Catalog entry for an installed versioned id.
    pub fn get_model_info(&self, versioned_id: &str) -> Result<ModelInfo> {
        self.lock()
            .catalog
            .get(versioned_id)
            .cloned()
            .ok_or_else(|| not_in_registry(versioned_id, "model is not installed locally"))
    }

    /// Whether `versioned_id` is installed.
    pub fn is_model_downloaded(&self, versioned_id: &str) -> bool {
        self.lock().catalog.contains_key(versioned_id)
    }

    /// Filesystem path of an installed artifact.
    pub fn get_model_path(&self, versioned_id: &str) -> Result<PathBuf> {
        if !self.is_model_downloaded(versioned_id) {
            return Err(not_in_registry(
                versioned_id,
                "model is not installed locally",
            ));
        }
        Ok(self.model_dir.join(versioned_id))
    }

    /// All installed models, ordered by id.
    pub fn list_downloaded_models(&self) -> Vec<ModelInfo> {
        self.lock().catalog.values().cloned().collect()
    }

    /// Storage accounting for the model directory.
    pub fn get_storage_info(&self) -> StorageInfo {
        let used = {
            let state = self.lock();
            state
                .catalog
                .iter()
                .map(|(id, info)| {
                    std::fs::metadata(self.model_dir.join(id))
                        .map_or(info.size_bytes, |m| m.len())
                })
                .sum()
        };
        StorageInfo {
            total_bytes: total_storage_bytes(&self.model_dir),
            available_bytes: available_storage_bytes(&self.model_dir),
            used_by_models_bytes: used,
        }
    }

    /// Resolve a base id to an installed entry: the pinned version when a
    /// valid pin exists, otherwise the newest installed version.
    pub fn get_model_info_by_base_id(&self, base_id: &str) -> Result<ModelInfo> {
        let state = self.lock();
        if let Some(version) = state.pinned.get(base_id) {
            let id = format!("{base_id}-{version}");
            if let Some(info) = state.catalog.get(&id) {
                return Ok(info.clone());
            }
            warn!(base_id, version, "pinned version is no longer installed");
        }
        state
            .catalog
            .values()
            .filter(|info| info.base_id() == base_id)
            .max_by_key(|info| info.semver())
            .cloned()
            .ok_or_else(|| {
                not_in_registry(base_id, "no installed version under this base id")
            })
    }

    /// Remove an installed model: artifact file, catalog entry, persisted.
    pub fn delete_model(&self, versioned_id: &str) -> Result<()> {
        let mut state = self.lock();
        if state.catalog.remove(versioned_id).is_none() {
            return Err(not_in_registry(
                versioned_id,
                "model is not installed locally",
            ));
        }
        let path = self.model_dir.join(versioned_id);
        if let Err(e) = std::fs::remove_file(&path) {
            // Keep the catalog consistent even when the artifact is already
            // gone.
            warn!(path = %path.display(), error = %e, "artifact removal failed");
        }
        self.persist_catalog(&state)?;
        info!(id = versioned_id, "model deleted");
        Ok(())
    }

    // ---- version pinning ---------------------------------------------------

    /// Pin `base_id` to an installed `version`.
    pub fn pin_model_version(&self, base_id: &str, version: &str) -> Result<()> {
        if !is_valid_semantic_version(version) {
            return Err(SdkError::new(
                ErrorKind::InvalidInputParameterValue,
                "pin target is not a valid semantic version",
                format!("base_id={base_id} version={version}"),
            ));
        }
        let mut state = self.lock();
        let id = format!("{base_id}-{version}");
        if !state.catalog.contains_key(&id) {
            return Err(not_in_registry(&id, "cannot pin a version that is not installed"));
        }
        state.pinned.insert(base_id.to_owned(), version.to_owned());
        self.persist_pins(&state)?;
        info!(base_id, version, "version pinned");
        Ok(())
    }

    /// Remove the pin for `base_id`. Unpinning a non-pinned base id is an
    /// error.
    pub fn unpin_model_version(&self, base_id: &str) -> Result<()> {
        let mut state = self.lock();
        if state.pinned.remove(base_id).is_none() {
            return Err(SdkError::new(
                ErrorKind::InvalidInputParameterValue,
                "base id has no pinned version to remove",
                format!("base_id={base_id}"),
            ));
        }
        self.persist_pins(&state)?;
        info!(base_id, "version unpinned");
        Ok(())
    }

    /// Whether `base_id` currently has a pin.
    pub fn is_model_version_pinned(&self, base_id: &str) -> bool {
        self.lock().pinned.contains_key(base_id)
    }

    /// The pinned version of `base_id`, when any.
    pub fn get_pinned_version(&self, base_id: &str) -> Option<String> {
        self.lock().pinned.get(base_id).cloned()
    }

    // ---- persistence -------------------------------------------------------

    fn persist_catalog(&self, state: &RegistryState) -> Result<()> {
        let file = RegistryFile {
            version: REGISTRY_SCHEMA_VERSION.to_owned(),
            models: state.catalog.values().cloned().collect(),
        };
        let json = serde_json::to_string_pretty(&file).map_err(serialize_error)?;
        write_whole(&self.model_dir.join(REGISTRY_FILE), &json)
    }

    fn persist_pins(&self, state: &RegistryState) -> Result<()> {
        let json = serde_json::to_string_pretty(&state.pinned).map_err(serialize_error)?;
        write_whole(&self.model_dir.join(PINNED_FILE), &json)
    }
}

/// Whole-file replacement via tmp + rename.
fn write_whole(path: &Path, contents: &str) -> Result<()> {
    let tmp = tmp_path(path);
    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn serialize_error(e: serde_json::Error) -> SdkError {
    SdkError::new(
        ErrorKind::StorageReadError,
        "catalog serialization failed unexpectedly",
        e.to_string(),
    )
}

fn not_in_registry(id: &str, message: &str) -> SdkError {
    SdkError::new(
        ErrorKind::ModelNotFoundInRegistry,
        message,
        format!("id={id}"),
    )
    .with_recovery("list available models to see what can be downloaded")
}

fn load_catalog(path: &Path) -> BTreeMap<String, ModelInfo> {
    let Ok(contents) = std::fs::read_to_string(path) else {
        return BTreeMap::new();
    };
    match serde_json::from_str::<RegistryFile>(&contents) {
        Ok(file) => file
            .models
            .into_iter()
            .map(|info| (info.id.clone(), info))
            .collect(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "catalog unreadable, starting empty");
            BTreeMap::new()
        }
    }
}

fn load_pins(path: &Path) -> BTreeMap<String, String> {
    let Ok(contents) = std::fs::read_to_string(path) else {
        return BTreeMap::new();
    };
    match serde_json::from_str(&contents) {
        Ok(pins) => pins,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "pin map unreadable, starting empty");
            BTreeMap::new()
        }
    }
}

/// Resolve a user-supplied id against the remote listing: exact versioned
/// match first, then newest version under the base id.
fn resolve_remote(remote: &[ModelInfo], id: &str) -> Result<ModelInfo> {
    if split_versioned_id(id).is_some() {
        if let Some(info) = remote.iter().find(|info| info.id == id) {
            return Ok(info.clone());
        }
    }
    remote
        .iter()
        .filter(|info| info.base_id() == id)
        .max_by_key(|info| info.semver())
        .cloned()
        .ok_or_else(|| not_in_registry(id, "no such model in the remote registry"))
}

/// Device/type compatibility predicate. Pure: no I/O, no ordering effects.
pub fn matches_device(
    info: &ModelInfo,
    type_filter: Option<ModelType>,
    device: &DeviceCapabilities,
) -> bool {
    if let Some(wanted) = type_filter {
        if info.model_type != wanted {
            return false;
        }
    }
    let platforms = &info.requirements.supported_platforms;
    let platform_ok = platforms.is_empty()
        || platforms.iter().any(|p| p == "all" || *p == device.platform);
    if !platform_ok {
        return false;
    }
    let req = &info.requirements;
    if req.min_ram_bytes > 0 && device.ram_bytes > 0 && req.min_ram_bytes > device.ram_bytes
    {
        return false;
    }
    if req.min_storage_bytes > 0
        && device.storage_bytes > 0
        && req.min_storage_bytes > device.storage_bytes
    {
        return false;
    }
    true
}

/// Filter a remote listing, preserving its order.
pub fn filter_models(
    models: Vec<ModelInfo>,
    type_filter: Option<ModelType>,
    device: &DeviceCapabilities,
) -> Vec<ModelInfo> {
    models
        .into_iter()
        .filter(|info| matches_device(info, type_filter, device))
        .collect()
}

/// Recommendation score: smaller models that fit the device rank higher;
/// an accelerator match adds a bonus.
fn recommendation_score(info: &ModelInfo, device: &DeviceCapabilities) -> f64 {
    let size_gb = info.size_bytes as f64 / 1_000_000_000.0;
    let mut score = 1.0 / (1.0 + size_gb);
    if let Some(wanted) = info.metadata.get("preferred_accelerator") {
        if device.accelerators.iter().any(|a| a.as_str() == wanted) {
            score += 0.25;
        }
    }
    if info.requirements.min_ram_bytes > 0
        && device.ram_bytes >= info.requirements.min_ram_bytes.saturating_mul(2)
    {
        score += 0.1;
    }
    score
}

//! Model catalog, lazy loading, and the per-size context cache.
//!
//! Each configured size maps to at most one loaded `WhisperContext` for the
//! process lifetime. Loading goes through a per-size slot: concurrent first
//! callers for a size queue behind a single load, and a failed load leaves
//! the slot empty so the next caller retries. The map lock is only held to
//! hand out slots, never across a load, so residency checks and other sizes
//! answer while a download or load is in flight. Loaded handles are shared
//! read-only; per-call inference state is created fresh by the engine, so no
//! lock is held while inference runs.

use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::OnceCell;
use tokio::task;
use tracing::info;
use whisper_rs::{WhisperContext, WhisperContextParameters};

use crate::config::AppConfig;
use crate::error::AppError;

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(600);

/// Supported whisper.cpp model sizes.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum ModelSize {
    Tiny,
    Base,
    Small,
    Medium,
    Large,
}

impl ModelSize {
    pub const ALL: [ModelSize; 5] = [
        ModelSize::Tiny,
        ModelSize::Base,
        ModelSize::Small,
        ModelSize::Medium,
        ModelSize::Large,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tiny => "tiny",
            Self::Base => "base",
            Self::Small => "small",
            Self::Medium => "medium",
            Self::Large => "large",
        }
    }

    /// ggml snapshot filename published for this size.
    pub fn ggml_filename(self) -> &'static str {
        match self {
            Self::Tiny => "ggml-tiny.bin",
            Self::Base => "ggml-base.bin",
            Self::Small => "ggml-small.bin",
            Self::Medium => "ggml-medium.bin",
            // Plain "large" is not published as a ggml snapshot; v3 is the
            // current large checkpoint.
            Self::Large => "ggml-large-v3.bin",
        }
    }

    /// Rough audio-seconds-per-wall-second throughput, used only for
    /// advisory progress estimates.
    pub fn realtime_factor(self) -> f64 {
        match self {
            Self::Tiny => 32.0,
            Self::Base => 16.0,
            Self::Small => 6.0,
            Self::Medium => 2.0,
            Self::Large => 1.0,
        }
    }

    pub fn catalog_names() -> Vec<&'static str> {
        Self::ALL.iter().map(|size| size.as_str()).collect()
    }
}

impl fmt::Display for ModelSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelSize {
    type Err = AppError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "tiny" => Ok(Self::Tiny),
            "base" => Ok(Self::Base),
            "small" => Ok(Self::Small),
            "medium" => Ok(Self::Medium),
            "large" => Ok(Self::Large),
            _ => Err(AppError::invalid_request(format!(
                "unsupported model size {raw:?}; expected one of {}",
                Self::catalog_names().join(", ")
            ))),
        }
    }
}

/// One loaded model instance for one size.
pub struct WhisperModel {
    context: WhisperContext,
}

impl WhisperModel {
    pub(crate) fn context(&self) -> &WhisperContext {
        &self.context
    }
}

// `WhisperContext` has no `Debug` impl; report the handle opaquely.
impl fmt::Debug for WhisperModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WhisperModel").finish_non_exhaustive()
    }
}

/// Outcome of an explicit warm-up request.
#[derive(Debug, Clone, Copy)]
pub struct ModelReport {
    pub size: ModelSize,
    pub already_loaded: bool,
    pub load_time_secs: f64,
}

/// Lazy get-or-load cache of model handles.
pub struct ModelManager {
    model_dir: PathBuf,
    auto_download: bool,
    use_gpu: bool,
    slots: Mutex<HashMap<ModelSize, Arc<OnceCell<Arc<WhisperModel>>>>>,
}

impl ModelManager {
    pub fn new(cfg: &AppConfig) -> Self {
        Self {
            model_dir: PathBuf::from(&cfg.model_dir),
            auto_download: cfg.model_auto_download,
            use_gpu: cfg.use_gpu,
            slots: Mutex::new(HashMap::new()),
        }
    }

    // Slots are insert-only Arcs, so a map behind a poisoned lock is still
    // internally consistent; recover instead of unwinding every caller.
    fn slot_map(&self) -> MutexGuard<'_, HashMap<ModelSize, Arc<OnceCell<Arc<WhisperModel>>>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hands out the load slot for `size`, creating it on first reference.
    fn slot(&self, size: ModelSize) -> Arc<OnceCell<Arc<WhisperModel>>> {
        Arc::clone(self.slot_map().entry(size).or_default())
    }

    /// Returns the cached handle for `size`, loading it first if absent.
    ///
    /// Concurrent first callers for a size queue on its slot and exactly one
    /// load runs; a failed load leaves the slot empty for the next caller.
    pub async fn get_or_load(&self, size: ModelSize) -> Result<Arc<WhisperModel>, AppError> {
        let slot = self.slot(size);
        let model = slot
            .get_or_try_init(|| async {
                let path = self.model_path(size);
                let auto_download = self.auto_download;
                let use_gpu = self.use_gpu;
                let started = Instant::now();
                info!(model = size.as_str(), path = %path.display(), "loading whisper model");

                let context = task::spawn_blocking(move || {
                    ensure_weights(&path, size, auto_download)?;
                    load_context(&path, use_gpu)
                })
                .await
                .map_err(|err| AppError::internal(format!("model load task failed: {err}")))??;

                info!(
                    model = size.as_str(),
                    load_ms = started.elapsed().as_millis() as u64,
                    "whisper model ready"
                );
                Ok(Arc::new(WhisperModel { context }))
            })
            .await?;
        Ok(Arc::clone(model))
    }

    /// Explicit warm-up used by the model administration endpoint.
    pub async fn ensure(&self, size: ModelSize) -> Result<ModelReport, AppError> {
        let already_loaded = self.is_loaded(size);
        let started = Instant::now();
        self.get_or_load(size).await?;
        Ok(ModelReport {
            size,
            already_loaded,
            load_time_secs: started.elapsed().as_secs_f64(),
        })
    }

    pub fn is_loaded(&self, size: ModelSize) -> bool {
        self.slot_map()
            .get(&size)
            .map_or(false, |slot| slot.get().is_some())
    }

    /// Loaded sizes in catalog order.
    pub fn loaded_sizes(&self) -> Vec<ModelSize> {
        let slots = self.slot_map();
        ModelSize::ALL
            .iter()
            .copied()
            .filter(|size| slots.get(size).map_or(false, |slot| slot.get().is_some()))
            .collect()
    }

    fn model_path(&self, size: ModelSize) -> PathBuf {
        self.model_dir.join(size.ggml_filename())
    }
}

fn weights_present(path: &Path) -> bool {
    fs::metadata(path)
        .map(|meta| meta.is_file() && meta.len() > 0)
        .unwrap_or(false)
}

fn ensure_weights(path: &Path, size: ModelSize, auto_download: bool) -> Result<(), AppError> {
    if weights_present(path) {
        return Ok(());
    }
    if !auto_download {
        return Err(AppError::model_load(format!(
            "model file not found at {path:?}; place {} there or enable MODEL_AUTO_DOWNLOAD",
            size.ggml_filename()
        )));
    }
    download_weights(path, size)
}

fn download_weights(path: &Path, size: ModelSize) -> Result<(), AppError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|err| {
            AppError::model_load(format!(
                "failed to create model directory {parent:?}: {err}"
            ))
        })?;
    }

    let url = hf_weights_url(size);
    info!(model = size.as_str(), url = %url, "downloading model weights");

    let client = reqwest::blocking::Client::builder()
        .timeout(DOWNLOAD_TIMEOUT)
        .build()
        .map_err(|err| AppError::model_load(format!("failed to create HTTP client: {err}")))?;

    let mut response = client.get(&url).send().map_err(|err| {
        AppError::model_load(format!(
            "failed to download weights from {url}: {err}; check network connectivity"
        ))
    })?;

    if !response.status().is_success() {
        return Err(AppError::model_load(format!(
            "weights download from {url} failed with HTTP status {}",
            response.status()
        )));
    }

    let tmp_path = path.with_extension("part");
    let mut out = File::create(&tmp_path).map_err(|err| {
        AppError::model_load(format!(
            "failed to create temporary weights file {tmp_path:?}: {err}"
        ))
    })?;
    std::io::copy(&mut response, &mut out).map_err(|err| {
        AppError::model_load(format!(
            "failed writing downloaded weights to {tmp_path:?}: {err}"
        ))
    })?;
    out.flush().map_err(|err| {
        AppError::model_load(format!(
            "failed to flush downloaded weights file {tmp_path:?}: {err}"
        ))
    })?;

    let size_bytes = out.metadata().map(|meta| meta.len()).unwrap_or_default();
    if size_bytes == 0 {
        let _ = fs::remove_file(&tmp_path);
        return Err(AppError::model_load(format!(
            "downloaded empty weights file from {url}; refusing to continue"
        )));
    }

    fs::rename(&tmp_path, path).map_err(|err| {
        AppError::model_load(format!(
            "failed to move weights from {tmp_path:?} to {path:?}: {err}"
        ))
    })
}

fn hf_weights_url(size: ModelSize) -> String {
    format!(
        "https://huggingface.co/ggerganov/whisper.cpp/resolve/main/{}",
        size.ggml_filename()
    )
}

fn load_context(path: &Path, use_gpu: bool) -> Result<WhisperContext, AppError> {
    let path_str = path
        .to_str()
        .ok_or_else(|| AppError::model_load(format!("model path {path:?} is not valid UTF-8")))?;

    let mut params = WhisperContextParameters::default();
    params.use_gpu(use_gpu);

    WhisperContext::new_with_params(path_str, params)
        .map_err(|err| AppError::model_load(format!("failed to load model at {path:?}: {err}")))
}

//! Transcription pipeline and bounded inference execution.
//!
//! The HTTP layer depends on the [`Transcriber`] trait instead of a concrete
//! implementation, which keeps request handling decoupled from the pipeline.
//! [`TranscriptionEngine`] is the real implementation: probe the upload,
//! normalize it through the converter, make sure the model is loaded, then run
//! the blocking model call on a worker thread under a fixed number of
//! semaphore slots shared by the synchronous and job APIs. Requests past the
//! slot count queue FIFO; nothing in this module retries on failure.

mod whisper;

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tempfile::TempPath;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task;
use tracing::{debug, info};

use crate::audio;
use crate::config::AppConfig;
use crate::convert::{ConvertedAudio, Converter};
use crate::error::AppError;
use crate::model::{ModelManager, ModelReport, ModelSize};
use crate::probe::{self, MediaKind};

/// Type of inference task requested by the client.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub enum TaskKind {
    /// Convert speech to text in the same language as the input audio.
    #[default]
    Transcribe,
    /// Convert speech to English text.
    Translate,
}

impl TaskKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transcribe => "transcribe",
            Self::Translate => "translate",
        }
    }

    /// Parses the multipart `task` field.
    pub fn parse(raw: &str) -> Result<Self, AppError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "transcribe" => Ok(Self::Transcribe),
            "translate" => Ok(Self::Translate),
            _ => Err(AppError::invalid_request(format!(
                "invalid task={raw:?}; expected transcribe or translate"
            ))),
        }
    }
}

/// One upload to transcribe, as handed over by the HTTP layer.
#[derive(Debug)]
pub struct TranscribeRequest {
    /// Raw upload bytes; the prober decides what they are.
    pub bytes: Vec<u8>,
    /// Requested size, or the configured default when absent.
    pub model_size: Option<ModelSize>,
    /// Optional language hint such as `"en"`.
    pub language: Option<String>,
    pub task: TaskKind,
}

/// Timestamped span of recognized speech.
#[derive(Debug, Clone, Serialize)]
pub struct Segment {
    /// Start time in seconds.
    #[serde(rename = "start")]
    pub start_secs: f64,
    /// End time in seconds.
    #[serde(rename = "end")]
    pub end_secs: f64,
    pub text: String,
    /// Per-segment confidence when the backend provides one.
    pub confidence: Option<f32>,
}

/// One-shot segment sequence from a single inference call.
///
/// The stream is consumed by value, so a drained stream cannot be iterated
/// again; re-reading segments would mean re-running inference, which is
/// unrepresentable here.
pub struct SegmentStream {
    inner: std::vec::IntoIter<Segment>,
}

impl SegmentStream {
    pub(crate) fn new(segments: Vec<Segment>) -> Self {
        Self {
            inner: segments.into_iter(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }
}

impl Iterator for SegmentStream {
    type Item = Segment;

    fn next(&mut self) -> Option<Segment> {
        self.inner.next()
    }
}

impl ExactSizeIterator for SegmentStream {}

/// Raw model output before assembly.
pub(crate) struct RawTranscript {
    pub(crate) segments: SegmentStream,
    pub(crate) language: Option<String>,
}

/// Completed transcription, returned in-band or stored on a job record.
#[derive(Debug, Clone, Serialize)]
pub struct TranscriptionResult {
    /// Segment texts joined with single spaces.
    pub text: String,
    pub language: Option<String>,
    /// Audio duration in seconds, from the canonical probe.
    pub duration: f64,
    pub segments: Vec<Segment>,
    /// Mean of per-segment confidences; absent when no segment carries one.
    pub confidence: Option<f32>,
    pub model_used: String,
    /// Wall-clock seconds around the blocking model call, queue wait excluded.
    pub processing_time: f64,
    pub completed_at: DateTime<Utc>,
}

/// Phase notifications emitted while a request moves through the pipeline.
///
/// The job worker uses these to time status transitions; the synchronous path
/// passes no hook.
#[derive(Debug, Clone, Copy)]
pub enum EngineEvent {
    /// A worker slot was acquired and the blocking call is about to start.
    InferenceStarted {
        duration_secs: f64,
        estimated_secs: f64,
    },
}

pub type ProgressHook = Box<dyn FnMut(EngineEvent) + Send>;

/// Point-in-time engine state for health and model endpoints.
#[derive(Debug, Clone)]
pub struct EngineStatus {
    pub default_model: ModelSize,
    pub loaded: Vec<ModelSize>,
    pub active_inferences: usize,
    pub uptime_secs: f64,
}

/// Pipeline contract implemented by the engine (and by test doubles).
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Runs the full pipeline for one upload and returns the result.
    async fn transcribe(
        &self,
        req: TranscribeRequest,
        hook: Option<ProgressHook>,
    ) -> Result<TranscriptionResult, AppError>;

    /// Loads a model ahead of use.
    async fn warm_up(&self, size: ModelSize) -> Result<ModelReport, AppError>;

    /// Reports engine state without side effects; never triggers a load.
    async fn status(&self) -> EngineStatus;
}

/// Production pipeline: probe, convert, load, bounded blocking inference.
pub struct TranscriptionEngine {
    default_model: ModelSize,
    models: ModelManager,
    converter: Converter,
    slots: Arc<Semaphore>,
    queue_limit: Option<usize>,
    queued: Arc<AtomicUsize>,
    active: Arc<AtomicUsize>,
    started_at: Instant,
    upload_dir: PathBuf,
}

impl TranscriptionEngine {
    pub fn new(cfg: &AppConfig) -> Self {
        Self {
            default_model: cfg.default_model,
            models: ModelManager::new(cfg),
            converter: Converter::new(cfg),
            slots: Arc::new(Semaphore::new(cfg.inference_workers)),
            queue_limit: cfg.queue_limit,
            queued: Arc::new(AtomicUsize::new(0)),
            active: Arc::new(AtomicUsize::new(0)),
            started_at: Instant::now(),
            upload_dir: PathBuf::from(&cfg.upload_dir),
        }
    }

    /// Writes upload bytes to a scoped temp file the converter can read.
    async fn spool_upload(&self, bytes: &[u8], kind: MediaKind) -> Result<TempPath, AppError> {
        let path = tempfile::Builder::new()
            .prefix("upload-")
            .suffix(&format!(".{}", kind.extension()))
            .tempfile_in(&self.upload_dir)
            .map_err(|err| {
                AppError::internal(format!(
                    "failed to create spool file in {:?}: {err}",
                    self.upload_dir
                ))
            })?
            .into_temp_path();

        tokio::fs::write(&path, bytes).await.map_err(|err| {
            AppError::internal(format!("failed to spool upload to {path:?}: {err}"))
        })?;
        Ok(path)
    }

    /// Waits for an inference slot; FIFO across both API modes.
    async fn acquire_slot(&self) -> Result<(OwnedSemaphorePermit, Duration), AppError> {
        if let Some(limit) = self.queue_limit {
            if self.slots.available_permits() == 0
                && self.queued.load(Ordering::Acquire) >= limit
            {
                return Err(AppError::queue_saturated(format!(
                    "transcription queue is full ({limit} waiting); retry later"
                )));
            }
        }

        let _waiting = CounterGuard::new(&self.queued);
        let waited = Instant::now();
        let permit = Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|_| AppError::internal("inference pool is closed"))?;
        Ok((permit, waited.elapsed()))
    }
}

#[async_trait]
impl Transcriber for TranscriptionEngine {
    async fn transcribe(
        &self,
        req: TranscribeRequest,
        mut hook: Option<ProgressHook>,
    ) -> Result<TranscriptionResult, AppError> {
        let kind = probe::detect(&req.bytes).ok_or_else(|| {
            AppError::unsupported_format(
                "unrecognized media signature; supported inputs: \
                 mp3, wav, flac, ogg, m4a, wma, mp4, matroska, avi",
            )
        })?;
        let size = req.model_size.unwrap_or(self.default_model);
        debug!(
            input_kind = kind.as_str(),
            model = size.as_str(),
            upload_bytes = req.bytes.len(),
            "accepted transcription request"
        );

        let spooled = self.spool_upload(&req.bytes, kind).await?;
        let ConvertedAudio { wav, duration_secs } =
            self.converter.to_model_wav(&spooled, kind).await?;
        drop(spooled);

        let model = self.models.get_or_load(size).await?;

        let (permit, queue_wait) = self.acquire_slot().await?;
        let active = CounterGuard::new(&self.active);

        let estimated_secs = estimate_processing_secs(duration_secs, size);
        if let Some(hook) = hook.as_mut() {
            hook(EngineEvent::InferenceStarted {
                duration_secs,
                estimated_secs,
            });
        }

        let options = whisper::InferenceOptions {
            language: req.language.clone(),
            task: req.task,
        };
        let inference_started = Instant::now();
        let raw = task::spawn_blocking(move || {
            // The permit, the active-count guard, and `wav` are owned by the
            // closure: the slot stays held, the count stays up, and the file
            // stays alive until the model call finishes, even if the awaiting
            // request has been dropped by a disconnect.
            let _permit = permit;
            let _active = active;
            let samples = audio::load_wav_samples(&wav)?;
            whisper::run_inference(model.context(), &samples, &options)
        })
        .await
        .map_err(|err| AppError::internal(format!("inference task failed: {err}")))??;
        let processing_time = inference_started.elapsed();

        let result = assemble_result(raw, duration_secs, size, processing_time);
        info!(
            model = size.as_str(),
            input_kind = kind.as_str(),
            duration_secs,
            queue_wait_ms = queue_wait.as_millis() as u64,
            processing_ms = processing_time.as_millis() as u64,
            segments = result.segments.len(),
            "transcription finished"
        );
        Ok(result)
    }

    async fn warm_up(&self, size: ModelSize) -> Result<ModelReport, AppError> {
        self.models.ensure(size).await
    }

    async fn status(&self) -> EngineStatus {
        EngineStatus {
            default_model: self.default_model,
            loaded: self.models.loaded_sizes(),
            active_inferences: self.active.load(Ordering::Acquire),
            uptime_secs: self.started_at.elapsed().as_secs_f64(),
        }
    }
}

/// Owns a +1 on a shared counter from construction until drop. The guard can
/// be moved into the blocking closure, so the active count follows the model
/// call rather than the request future that awaits it.
struct CounterGuard {
    counter: Arc<AtomicUsize>,
}

impl CounterGuard {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self {
            counter: Arc::clone(counter),
        }
    }
}

impl Drop for CounterGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Advisory processing estimate: audio seconds over the size's realtime
/// factor, floored at one second.
pub(crate) fn estimate_processing_secs(duration_secs: f64, size: ModelSize) -> f64 {
    (duration_secs / size.realtime_factor()).max(1.0)
}

/// Drains the segment stream exactly once and derives the aggregate fields.
fn assemble_result(
    raw: RawTranscript,
    duration_secs: f64,
    size: ModelSize,
    processing_time: Duration,
) -> TranscriptionResult {
    let mut text = String::new();
    let mut segments = Vec::with_capacity(raw.segments.len());
    let mut confidence_sum = 0.0f32;
    let mut confidence_count = 0usize;

    for segment in raw.segments {
        if !text.is_empty() && !segment.text.is_empty() {
            text.push(' ');
        }
        text.push_str(&segment.text);
        if let Some(value) = segment.confidence {
            confidence_sum += value;
            confidence_count += 1;
        }
        segments.push(segment);
    }

    let confidence = if confidence_count > 0 {
        Some(confidence_sum / confidence_count as f32)
    } else {
        None
    };

    TranscriptionResult {
        text,
        language: raw.language,
        duration: duration_secs,
        segments,
        confidence,
        model_used: size.as_str().to_string(),
        processing_time: round_millis(processing_time.as_secs_f64()),
        completed_at: Utc::now(),
    }
}

fn round_millis(secs: f64) -> f64 {
    (secs * 1000.0).round() / 1000.0
}

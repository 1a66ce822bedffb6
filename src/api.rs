//! HTTP surface for synchronous and job-based transcription.
//!
//! This module owns request parsing, input validation, and response shaping
//! while delegating pipeline work to the engine and job bookkeeping to the
//! job store.

use std::sync::Arc;

use axum::extract::multipart::MultipartError;
use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::engine::{TaskKind, TranscribeRequest, Transcriber, TranscriptionResult};
use crate::error::AppError;
use crate::jobs::{run_job, JobRecord, JobStatus, JobStore};
use crate::model::ModelSize;

/// Human-readable service name returned by the health endpoint.
pub const APP_NAME: &str = "whisper-job-server";
/// Service version string returned by the health endpoint.
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Headroom over the upload ceiling for multipart framing, so oversized
/// files reach the explicit size check instead of dying at the transport.
const UPLOAD_SLACK_BYTES: usize = 64 * 1024;

/// Shared state injected into all route handlers.
pub struct AppState {
    /// Runtime configuration loaded at startup.
    pub cfg: AppConfig,
    /// Transcription pipeline implementation.
    pub engine: Arc<dyn Transcriber>,
    /// Registry of asynchronous jobs.
    pub jobs: Arc<JobStore>,
}

impl AppState {
    /// Constructs shared handler state.
    pub fn new(cfg: AppConfig, engine: Arc<dyn Transcriber>, jobs: Arc<JobStore>) -> Self {
        Self { cfg, engine, jobs }
    }
}

/// Builds the Axum router for all public endpoints.
pub fn build_router(state: Arc<AppState>) -> Router {
    let body_limit = state.cfg.max_upload_bytes() + UPLOAD_SLACK_BYTES;
    Router::new()
        .route("/health", get(health))
        .route("/model/info", get(model_info))
        .route("/model/load/:size", post(model_load))
        .route("/transcribe", post(transcribe_sync))
        .route("/jobs", post(submit_job))
        .route("/jobs/:id/progress", get(job_progress))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub version: &'static str,
    pub model_loaded: bool,
    pub default_model: String,
    pub loaded_models: Vec<String>,
    pub active_inferences: usize,
    pub uptime_secs: f64,
}

#[derive(Debug, Serialize)]
pub struct ModelInfoResponse {
    pub default_model: String,
    pub loaded_models: Vec<String>,
    pub available_models: Vec<&'static str>,
}

#[derive(Debug, Serialize)]
pub struct ModelLoadResponse {
    pub model: String,
    pub already_loaded: bool,
    pub load_time_secs: f64,
}

#[derive(Debug, Serialize)]
pub struct JobAccepted {
    pub job_id: Uuid,
    pub status: JobStatus,
}

#[derive(Debug, Serialize)]
pub struct JobProgressResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub progress: f32,
    pub created_at: String,
    pub updated_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<TranscriptionResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Reports service liveness and engine state (`GET /health`).
///
/// Read-only: polling health never triggers a model load.
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let status = state.engine.status().await;
    let model_loaded = status.loaded.contains(&status.default_model);
    Json(HealthResponse {
        status: if model_loaded { "healthy" } else { "degraded" },
        service: APP_NAME,
        version: APP_VERSION,
        model_loaded,
        default_model: status.default_model.to_string(),
        loaded_models: status.loaded.iter().map(ToString::to_string).collect(),
        active_inferences: status.active_inferences,
        uptime_secs: status.uptime_secs,
    })
}

/// Describes the model catalog and what is currently resident (`GET /model/info`).
pub async fn model_info(State(state): State<Arc<AppState>>) -> Json<ModelInfoResponse> {
    let status = state.engine.status().await;
    Json(ModelInfoResponse {
        default_model: status.default_model.to_string(),
        loaded_models: status.loaded.iter().map(ToString::to_string).collect(),
        available_models: ModelSize::catalog_names(),
    })
}

/// Loads a model ahead of first use (`POST /model/load/{size}`).
pub async fn model_load(
    State(state): State<Arc<AppState>>,
    Path(size): Path<String>,
) -> Result<Json<ModelLoadResponse>, AppError> {
    let size = size.parse::<ModelSize>()?;
    let report = state.engine.warm_up(size).await?;
    Ok(Json(ModelLoadResponse {
        model: report.size.to_string(),
        already_loaded: report.already_loaded,
        load_time_secs: report.load_time_secs,
    }))
}

/// Runs the whole pipeline in-band and returns the transcript (`POST /transcribe`).
pub async fn transcribe_sync(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<TranscriptionResult>, AppError> {
    let request = parse_transcribe_form(&state.cfg, &mut multipart).await?;
    let result = state.engine.transcribe(request, None).await?;
    Ok(Json(result))
}

/// Registers a job, schedules it on the runtime, and returns 202 (`POST /jobs`).
pub async fn submit_job(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<JobAccepted>), AppError> {
    let request = parse_transcribe_form(&state.cfg, &mut multipart).await?;
    let record = state.jobs.create();
    info!(job_id = %record.id, upload_bytes = request.bytes.len(), "job accepted");

    tokio::spawn(run_job(
        Arc::clone(&state.engine),
        Arc::clone(&state.jobs),
        record.id,
        request,
    ));

    Ok((
        StatusCode::ACCEPTED,
        Json(JobAccepted {
            job_id: record.id,
            status: record.status,
        }),
    ))
}

/// Polls a job's current state (`GET /jobs/{id}/progress`).
pub async fn job_progress(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<JobProgressResponse>, AppError> {
    let parsed = Uuid::parse_str(id.trim())
        .map_err(|_| AppError::invalid_request(format!("malformed job id {id:?}")))?;
    let job = state
        .jobs
        .get(parsed)
        .ok_or_else(|| AppError::job_not_found(parsed.to_string()))?;
    Ok(Json(job_progress_response(&job)))
}

fn job_progress_response(job: &JobRecord) -> JobProgressResponse {
    JobProgressResponse {
        job_id: job.id,
        status: job.status,
        progress: round_progress(job.progress_now()),
        created_at: to_rfc3339(job.created_at),
        updated_at: to_rfc3339(job.updated_at),
        result: job.result.clone(),
        error: job.error.clone(),
    }
}

fn to_rfc3339(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn round_progress(value: f32) -> f32 {
    (value * 10.0).round() / 10.0
}

/// Parses and validates multipart form fields shared by both submit modes.
async fn parse_transcribe_form(
    cfg: &AppConfig,
    multipart: &mut Multipart,
) -> Result<TranscribeRequest, AppError> {
    let mut file_bytes: Option<Vec<u8>> = None;
    let mut model_size: Option<ModelSize> = None;
    let mut language: Option<String> = None;
    let mut task = TaskKind::Transcribe;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| multipart_read_error(err, cfg, "invalid multipart body"))?
    {
        let Some(name) = field.name().map(ToOwned::to_owned) else {
            continue;
        };

        match name.as_str() {
            // The filename is ignored on purpose; classification is by bytes.
            "file" => {
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|err| multipart_read_error(err, cfg, "failed to read file bytes"))?;
                if bytes.len() > cfg.max_upload_bytes() {
                    return Err(AppError::file_too_large(format!(
                        "upload of {} bytes exceeds the {} MB limit",
                        bytes.len(),
                        cfg.max_upload_mb
                    )));
                }
                file_bytes = Some(bytes.to_vec());
            }
            "model_size" => {
                let raw = field
                    .text()
                    .await
                    .map_err(|err| multipart_read_error(err, cfg, "invalid model_size field"))?;
                let trimmed = raw.trim();
                if !trimmed.is_empty() {
                    model_size = Some(trimmed.parse::<ModelSize>()?);
                }
            }
            "language" => {
                language = Some(
                    field
                        .text()
                        .await
                        .map_err(|err| {
                            multipart_read_error(err, cfg, "invalid language field")
                        })?
                        .trim()
                        .to_string(),
                )
                .filter(|v| !v.is_empty());
            }
            "task" => {
                let raw = field
                    .text()
                    .await
                    .map_err(|err| multipart_read_error(err, cfg, "invalid task field"))?;
                if !raw.trim().is_empty() {
                    task = TaskKind::parse(&raw)?;
                }
            }
            _ => {}
        }
    }

    let bytes = file_bytes
        .ok_or_else(|| AppError::invalid_request("missing required multipart field: file"))?;
    if bytes.is_empty() {
        return Err(AppError::invalid_request("uploaded file is empty"));
    }

    Ok(TranscribeRequest {
        bytes,
        model_size,
        language,
        task,
    })
}

/// Maps a multipart read failure. A body cut off by the transport limit is
/// reported as the size error, not as malformed framing.
fn multipart_read_error(err: MultipartError, cfg: &AppConfig, context: &str) -> AppError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        AppError::file_too_large(format!("upload exceeds the {} MB limit", cfg.max_upload_mb))
    } else {
        AppError::bad_multipart(format!("{context}: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use chrono::Utc;
    use serde_json::Value;
    use tower::ServiceExt;

    use crate::config::AppConfig;
    use crate::engine::{
        EngineEvent, EngineStatus, ProgressHook, Segment, TranscribeRequest, Transcriber,
        TranscriptionResult,
    };
    use crate::error::AppError;
    use crate::jobs::JobStore;
    use crate::model::{ModelReport, ModelSize};

    use super::{build_router, AppState};

    const BOUNDARY: &str = "X-BOUNDARY";

    #[derive(Clone)]
    enum MockBehavior {
        /// Fires the start event, then succeeds immediately.
        Succeed,
        /// Fails before any start event, like a probe rejection would.
        FailUnsupported,
        /// Fails before any start event with a saturated queue.
        FailSaturated,
        /// Sleeps before the start event, imitating a long queue wait.
        SlowStart(Duration),
        /// Fires the start event, then holds the slot before succeeding.
        HoldAfterStart(Duration),
    }

    struct MockEngine {
        behavior: MockBehavior,
        loaded: Vec<ModelSize>,
    }

    fn mock_result(req: &TranscribeRequest) -> TranscriptionResult {
        let model = req.model_size.unwrap_or(ModelSize::Base);
        TranscriptionResult {
            text: "hello world".to_string(),
            language: req.language.clone().or_else(|| Some("en".to_string())),
            duration: 1.2,
            segments: vec![Segment {
                start_secs: 0.0,
                end_secs: 1.2,
                text: "hello world".to_string(),
                confidence: Some(0.9),
            }],
            confidence: Some(0.9),
            model_used: model.to_string(),
            processing_time: 0.05,
            completed_at: Utc::now(),
        }
    }

    #[async_trait]
    impl Transcriber for MockEngine {
        async fn transcribe(
            &self,
            req: TranscribeRequest,
            mut hook: Option<ProgressHook>,
        ) -> Result<TranscriptionResult, AppError> {
            let mut fire = |estimated_secs: f64| {
                if let Some(hook) = hook.as_mut() {
                    hook(EngineEvent::InferenceStarted {
                        duration_secs: 1.2,
                        estimated_secs,
                    });
                }
            };

            match self.behavior {
                MockBehavior::Succeed => {
                    fire(1.0);
                    Ok(mock_result(&req))
                }
                MockBehavior::FailUnsupported => Err(AppError::unsupported_format(
                    "unrecognized media signature",
                )),
                MockBehavior::FailSaturated => {
                    Err(AppError::queue_saturated("transcription queue is full"))
                }
                MockBehavior::SlowStart(wait) => {
                    tokio::time::sleep(wait).await;
                    fire(1.0);
                    Ok(mock_result(&req))
                }
                MockBehavior::HoldAfterStart(hold) => {
                    fire(60.0);
                    tokio::time::sleep(hold).await;
                    Ok(mock_result(&req))
                }
            }
        }

        async fn warm_up(&self, size: ModelSize) -> Result<ModelReport, AppError> {
            Ok(ModelReport {
                size,
                already_loaded: self.loaded.contains(&size),
                load_time_secs: 1.25,
            })
        }

        async fn status(&self) -> EngineStatus {
            EngineStatus {
                default_model: ModelSize::Base,
                loaded: self.loaded.clone(),
                active_inferences: 0,
                uptime_secs: 12.5,
            }
        }
    }

    fn test_cfg() -> AppConfig {
        AppConfig {
            host: "127.0.0.1".to_string(),
            port: 8000,
            default_model: ModelSize::Base,
            model_dir: "/tmp/models".to_string(),
            model_auto_download: false,
            model_preload: false,
            use_gpu: false,
            inference_workers: 2,
            queue_limit: None,
            max_upload_mb: 1,
            upload_dir: "/tmp/uploads".to_string(),
            ffmpeg_bin: "ffmpeg".to_string(),
            ffprobe_bin: "ffprobe".to_string(),
            convert_timeout_secs: 120,
            job_max_age_secs: 3600,
            job_sweep_interval_secs: 60,
        }
    }

    fn app_with(behavior: MockBehavior, loaded: Vec<ModelSize>) -> axum::Router {
        let state = Arc::new(AppState::new(
            test_cfg(),
            Arc::new(MockEngine { behavior, loaded }),
            Arc::new(JobStore::new()),
        ));
        build_router(state)
    }

    fn app() -> axum::Router {
        app_with(MockBehavior::Succeed, vec![ModelSize::Base])
    }

    fn multipart_body(file: Option<&[u8]>, fields: &[(&str, &str)]) -> Vec<u8> {
        let mut body = Vec::new();
        if let Some(bytes) = file {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; \
                     filename=\"clip.wav\"\r\nContent-Type: audio/wav\r\n\r\n"
                )
                .as_bytes(),
            );
            body.extend_from_slice(bytes);
            body.extend_from_slice(b"\r\n");
        }
        for (name, value) in fields {
            body.extend_from_slice(
                format!(
                    "--{BOUNDARY}\r\nContent-Disposition: form-data; \
                     name=\"{name}\"\r\n\r\n{value}\r\n"
                )
                .as_bytes(),
            );
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    fn multipart_request(uri: &str, body: Vec<u8>) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .method("POST")
            .header(
                "Content-Type",
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .expect("request")
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .method("GET")
            .body(Body::empty())
            .expect("request")
    }

    async fn parse_json_response(res: axum::response::Response) -> Value {
        let bytes = to_bytes(res.into_body(), 1024 * 1024)
            .await
            .expect("body bytes");
        serde_json::from_slice(&bytes).expect("json body")
    }

    async fn poll_job(app: &axum::Router, id: &str) -> Value {
        let res = app
            .clone()
            .oneshot(get_request(&format!("/jobs/{id}/progress")))
            .await
            .expect("response");
        assert_eq!(res.status(), StatusCode::OK);
        parse_json_response(res).await
    }

    async fn poll_until(app: &axum::Router, id: &str, want: &str) -> Value {
        for _ in 0..200 {
            let payload = poll_job(app, id).await;
            if payload["status"] == want {
                return payload;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {id} never reached {want}");
    }

    async fn submit(app: &axum::Router) -> String {
        let body = multipart_body(Some(b"RIFF____WAVEfake-audio"), &[]);
        let res = app
            .clone()
            .oneshot(multipart_request("/jobs", body))
            .await
            .expect("response");
        assert_eq!(res.status(), StatusCode::ACCEPTED);

        let payload = parse_json_response(res).await;
        assert_eq!(payload["status"], "PENDING");
        payload["job_id"].as_str().expect("job id").to_string()
    }

    #[tokio::test]
    async fn health_reports_degraded_until_default_model_loads() {
        let app = app_with(MockBehavior::Succeed, Vec::new());
        let payload =
            parse_json_response(app.oneshot(get_request("/health")).await.expect("response"))
                .await;

        assert_eq!(payload["status"], "degraded");
        assert_eq!(payload["model_loaded"], false);
        assert_eq!(payload["default_model"], "base");
    }

    #[tokio::test]
    async fn health_reports_healthy_once_default_model_is_resident() {
        let payload =
            parse_json_response(app().oneshot(get_request("/health")).await.expect("response"))
                .await;

        assert_eq!(payload["status"], "healthy");
        assert_eq!(payload["model_loaded"], true);
        assert_eq!(payload["loaded_models"][0], "base");
    }

    #[tokio::test]
    async fn model_info_lists_the_full_catalog() {
        let payload = parse_json_response(
            app()
                .oneshot(get_request("/model/info"))
                .await
                .expect("response"),
        )
        .await;

        let available = payload["available_models"]
            .as_array()
            .expect("array")
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>();
        assert_eq!(available, vec!["tiny", "base", "small", "medium", "large"]);
        assert_eq!(payload["default_model"], "base");
    }

    #[tokio::test]
    async fn model_load_reports_residency() {
        let app = app();

        let res = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/model/load/base")
                    .method("POST")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(res.status(), StatusCode::OK);
        let payload = parse_json_response(res).await;
        assert_eq!(payload["already_loaded"], true);

        let res = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/model/load/small")
                    .method("POST")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        let payload = parse_json_response(res).await;
        assert_eq!(payload["already_loaded"], false);
        assert_eq!(payload["model"], "small");
    }

    #[tokio::test]
    async fn model_load_rejects_unknown_sizes() {
        let res = app()
            .oneshot(
                Request::builder()
                    .uri("/model/load/huge")
                    .method("POST")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        let payload = parse_json_response(res).await;
        assert_eq!(payload["error"]["kind"], "invalid_request");
    }

    #[tokio::test]
    async fn transcribe_returns_the_transcript_inline() {
        let body = multipart_body(Some(b"RIFF____WAVEfake-audio"), &[]);
        let res = app()
            .oneshot(multipart_request("/transcribe", body))
            .await
            .expect("response");
        assert_eq!(res.status(), StatusCode::OK);

        let payload = parse_json_response(res).await;
        assert_eq!(payload["text"], "hello world");
        assert_eq!(payload["model_used"], "base");
        assert_eq!(payload["segments"][0]["start"], 0.0);
        assert_eq!(payload["segments"][0]["end"], 1.2);
    }

    #[tokio::test]
    async fn transcribe_honors_model_size_and_language_fields() {
        let body = multipart_body(
            Some(b"RIFF____WAVEfake-audio"),
            &[("model_size", "small"), ("language", "de")],
        );
        let res = app()
            .oneshot(multipart_request("/transcribe", body))
            .await
            .expect("response");
        assert_eq!(res.status(), StatusCode::OK);

        let payload = parse_json_response(res).await;
        assert_eq!(payload["model_used"], "small");
        assert_eq!(payload["language"], "de");
    }

    #[tokio::test]
    async fn transcribe_rejects_unknown_model_size() {
        let body = multipart_body(Some(b"RIFF____WAVEfake-audio"), &[("model_size", "huge")]);
        let res = app()
            .oneshot(multipart_request("/transcribe", body))
            .await
            .expect("response");
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        let payload = parse_json_response(res).await;
        assert_eq!(payload["error"]["kind"], "invalid_request");
    }

    #[tokio::test]
    async fn transcribe_rejects_missing_file_field() {
        let body = multipart_body(None, &[("model_size", "base")]);
        let res = app()
            .oneshot(multipart_request("/transcribe", body))
            .await
            .expect("response");
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        let payload = parse_json_response(res).await;
        assert_eq!(payload["error"]["kind"], "invalid_request");
    }

    #[tokio::test]
    async fn transcribe_rejects_empty_file() {
        let body = multipart_body(Some(b""), &[]);
        let res = app()
            .oneshot(multipart_request("/transcribe", body))
            .await
            .expect("response");
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn transcribe_rejects_uploads_over_the_ceiling() {
        // test_cfg caps uploads at 1 MB.
        let oversized = vec![0u8; 1024 * 1024 + 1];
        let body = multipart_body(Some(&oversized), &[]);
        let res = app()
            .oneshot(multipart_request("/transcribe", body))
            .await
            .expect("response");
        assert_eq!(res.status(), StatusCode::PAYLOAD_TOO_LARGE);

        let payload = parse_json_response(res).await;
        assert_eq!(payload["error"]["kind"], "file_too_large");
    }

    #[tokio::test]
    async fn transcribe_rejects_uploads_far_over_the_ceiling() {
        // Large enough that the transport cuts the body off before the
        // handler's own size check could see the full file.
        let oversized = vec![0u8; 2 * 1024 * 1024];
        let body = multipart_body(Some(&oversized), &[]);
        let res = app()
            .oneshot(multipart_request("/transcribe", body))
            .await
            .expect("response");
        assert_eq!(res.status(), StatusCode::PAYLOAD_TOO_LARGE);

        let payload = parse_json_response(res).await;
        assert_eq!(payload["error"]["kind"], "file_too_large");
    }

    #[tokio::test]
    async fn transcribe_maps_probe_rejection_to_415() {
        let body = multipart_body(Some(b"\x89PNG\r\n\x1a\nrest-of-a-png"), &[]);
        let res = app_with(MockBehavior::FailUnsupported, vec![ModelSize::Base])
            .oneshot(multipart_request("/transcribe", body))
            .await
            .expect("response");
        assert_eq!(res.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);

        let payload = parse_json_response(res).await;
        assert_eq!(payload["error"]["kind"], "unsupported_format");
    }

    #[tokio::test]
    async fn transcribe_maps_saturation_to_429() {
        let body = multipart_body(Some(b"RIFF____WAVEfake-audio"), &[]);
        let res = app_with(MockBehavior::FailSaturated, vec![ModelSize::Base])
            .oneshot(multipart_request("/transcribe", body))
            .await
            .expect("response");
        assert_eq!(res.status(), StatusCode::TOO_MANY_REQUESTS);

        let payload = parse_json_response(res).await;
        assert_eq!(payload["error"]["kind"], "queue_saturated");
    }

    #[tokio::test]
    async fn submitted_job_completes_and_embeds_the_result() {
        let app = app();
        let id = submit(&app).await;

        let payload = poll_until(&app, &id, "COMPLETED").await;
        assert_eq!(payload["progress"], 100.0);
        assert_eq!(payload["result"]["text"], "hello world");
        assert!(payload.get("error").is_none());
    }

    #[tokio::test]
    async fn job_is_pending_before_a_slot_opens() {
        let app = app_with(
            MockBehavior::SlowStart(Duration::from_millis(300)),
            vec![ModelSize::Base],
        );
        let id = submit(&app).await;

        let payload = poll_job(&app, &id).await;
        assert_eq!(payload["status"], "PENDING");
        assert_eq!(payload["progress"], 0.0);
        assert!(payload.get("result").is_none());
    }

    #[tokio::test]
    async fn job_reports_processing_with_bounded_progress() {
        let app = app_with(
            MockBehavior::HoldAfterStart(Duration::from_secs(2)),
            vec![ModelSize::Base],
        );
        let id = submit(&app).await;

        let payload = poll_until(&app, &id, "PROCESSING").await;
        let progress = payload["progress"].as_f64().expect("progress");
        assert!(progress >= 5.0);
        assert!(progress <= 99.0);
        assert!(payload.get("result").is_none());
    }

    #[tokio::test]
    async fn job_progress_never_decreases_while_processing() {
        let app = app_with(
            MockBehavior::HoldAfterStart(Duration::from_secs(2)),
            vec![ModelSize::Base],
        );
        let id = submit(&app).await;
        poll_until(&app, &id, "PROCESSING").await;

        let mut last = 0.0f64;
        for _ in 0..5 {
            let payload = poll_job(&app, &id).await;
            let progress = payload["progress"].as_f64().expect("progress");
            assert!(progress >= last);
            last = progress;
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn failed_job_surfaces_the_error_and_no_result() {
        let app = app_with(MockBehavior::FailUnsupported, vec![ModelSize::Base]);
        let id = submit(&app).await;

        let payload = poll_until(&app, &id, "FAILED").await;
        assert!(payload["error"]
            .as_str()
            .expect("error")
            .contains("unrecognized media signature"));
        assert!(payload.get("result").is_none());
        assert!(payload["progress"].as_f64().expect("progress") < 100.0);
    }

    #[tokio::test]
    async fn unknown_job_id_is_404() {
        let res = app()
            .oneshot(get_request(
                "/jobs/00000000-0000-0000-0000-000000000000/progress",
            ))
            .await
            .expect("response");
        assert_eq!(res.status(), StatusCode::NOT_FOUND);

        let payload = parse_json_response(res).await;
        assert_eq!(payload["error"]["kind"], "job_not_found");
    }

    #[tokio::test]
    async fn malformed_job_id_is_400() {
        let res = app()
            .oneshot(get_request("/jobs/not-a-uuid/progress"))
            .await
            .expect("response");
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);

        let payload = parse_json_response(res).await;
        assert_eq!(payload["error"]["kind"], "invalid_request");
    }
}

//! Configuration loading from environment variables.
//!
//! Values are intentionally validated early so startup fails fast with
//! actionable errors.

use crate::error::AppError;
use crate::model::ModelSize;
use std::env;

pub const DEFAULT_INFERENCE_WORKERS: usize = 2;
pub const MAX_INFERENCE_WORKERS: usize = 8;
pub const DEFAULT_MAX_UPLOAD_MB: usize = 25;
pub const MAX_MAX_UPLOAD_MB: usize = 512;
pub const MAX_QUEUE_LIMIT: usize = 1024;

/// Runtime configuration for the HTTP server, converter, and inference engine.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Host interface to bind, for example `127.0.0.1`.
    pub host: String,
    /// TCP port to bind.
    pub port: u16,
    /// Model size loaded when a request does not ask for one.
    pub default_model: ModelSize,
    /// Directory holding (or receiving) ggml model files.
    pub model_dir: String,
    /// Enables on-demand download when a model file is missing.
    pub model_auto_download: bool,
    /// Loads the default model at startup instead of on first use.
    pub model_preload: bool,
    /// Passes GPU offload on to whisper.cpp context creation.
    pub use_gpu: bool,
    /// Number of inference slots shared by both API modes.
    pub inference_workers: usize,
    /// Optional cap on requests waiting for a slot; `None` queues unboundedly.
    pub queue_limit: Option<usize>,
    /// Upload size ceiling in megabytes.
    pub max_upload_mb: usize,
    /// Directory for spooled uploads and converted audio.
    pub upload_dir: String,
    /// Transcoder binary name or path.
    pub ffmpeg_bin: String,
    /// Duration probe binary name or path.
    pub ffprobe_bin: String,
    /// Hard deadline for one transcode or probe subprocess, in seconds.
    pub convert_timeout_secs: u64,
    /// Age past which finished or abandoned job records are swept, in seconds.
    pub job_max_age_secs: u64,
    /// Interval between job sweeps, in seconds.
    pub job_sweep_interval_secs: u64,
}

impl AppConfig {
    /// Builds configuration from environment variables.
    ///
    /// Variables:
    /// - `HOST` (default `127.0.0.1`)
    /// - `PORT` (default `8000`)
    /// - `MODEL_SIZE` (default `base`; one of `tiny|base|small|medium|large`)
    /// - `MODEL_DIR` (default `$HOME/.cache/whispercpp/models`)
    /// - `MODEL_AUTO_DOWNLOAD` (default `true`)
    /// - `MODEL_PRELOAD` (default `false`)
    /// - `WHISPER_USE_GPU` (default `false`)
    /// - `INFERENCE_WORKERS` (default `2`, min `1`, max `8`)
    /// - `INFERENCE_QUEUE_LIMIT` (optional; absent means unbounded FIFO)
    /// - `MAX_UPLOAD_MB` (default `25`)
    /// - `UPLOAD_DIR` (default `<system tmp>/whisper-job-server`)
    /// - `FFMPEG_BIN` (default `ffmpeg`)
    /// - `FFPROBE_BIN` (default `ffprobe`)
    /// - `CONVERT_TIMEOUT_SECS` (default `120`)
    /// - `JOB_MAX_AGE_SECS` (default `3600`)
    /// - `JOB_SWEEP_INTERVAL_SECS` (default `60`)
    pub fn from_env() -> Result<Self, AppError> {
        let host = env_str("HOST", "127.0.0.1");
        let port = env_u16("PORT", 8000)?;

        let raw_model = env_str("MODEL_SIZE", "base");
        let default_model = raw_model.parse::<ModelSize>().map_err(|_| {
            AppError::internal(format!(
                "invalid MODEL_SIZE={raw_model:?}; expected one of {}",
                ModelSize::catalog_names().join("|")
            ))
        })?;

        let inference_workers = env_usize_bounded(
            "INFERENCE_WORKERS",
            DEFAULT_INFERENCE_WORKERS,
            1,
            MAX_INFERENCE_WORKERS,
        )?;
        let queue_limit = match env_opt("INFERENCE_QUEUE_LIMIT") {
            Some(raw) => Some(parse_usize_bounded(
                "INFERENCE_QUEUE_LIMIT",
                &raw,
                1,
                MAX_QUEUE_LIMIT,
            )?),
            None => None,
        };

        Ok(Self {
            host,
            port,
            default_model,
            model_dir: env_str("MODEL_DIR", &default_model_dir()),
            model_auto_download: env_bool("MODEL_AUTO_DOWNLOAD", true)?,
            model_preload: env_bool("MODEL_PRELOAD", false)?,
            use_gpu: env_bool("WHISPER_USE_GPU", false)?,
            inference_workers,
            queue_limit,
            max_upload_mb: env_usize_bounded(
                "MAX_UPLOAD_MB",
                DEFAULT_MAX_UPLOAD_MB,
                1,
                MAX_MAX_UPLOAD_MB,
            )?,
            upload_dir: env_str("UPLOAD_DIR", &default_upload_dir()),
            ffmpeg_bin: env_str("FFMPEG_BIN", "ffmpeg"),
            ffprobe_bin: env_str("FFPROBE_BIN", "ffprobe"),
            convert_timeout_secs: env_u64("CONVERT_TIMEOUT_SECS", 120)?,
            job_max_age_secs: env_u64("JOB_MAX_AGE_SECS", 3600)?,
            job_sweep_interval_secs: env_u64("JOB_SWEEP_INTERVAL_SECS", 60)?,
        })
    }

    /// Upload ceiling in bytes.
    pub fn max_upload_bytes(&self) -> usize {
        self.max_upload_mb * 1024 * 1024
    }
}

fn default_model_dir() -> String {
    format!(
        "{}/.cache/whispercpp/models",
        std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string())
    )
}

fn default_upload_dir() -> String {
    std::env::temp_dir()
        .join("whisper-job-server")
        .to_string_lossy()
        .to_string()
}

fn env_str(name: &str, default: &str) -> String {
    match env::var(name) {
        Ok(value) => {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                default.to_string()
            } else {
                trimmed.to_string()
            }
        }
        Err(_) => default.to_string(),
    }
}

fn env_opt(name: &str) -> Option<String> {
    match env::var(name) {
        Ok(value) => {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        }
        Err(_) => None,
    }
}

fn env_u16(name: &str, default: u16) -> Result<u16, AppError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    let parsed = raw.trim().parse::<u16>().map_err(|_| {
        AppError::internal(format!("invalid {name}={raw:?}; expected integer 1-65535"))
    })?;
    if parsed == 0 {
        return Err(AppError::internal(format!(
            "invalid {name}={raw:?}; expected > 0"
        )));
    }
    Ok(parsed)
}

fn env_u64(name: &str, default: u64) -> Result<u64, AppError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    let parsed = raw.trim().parse::<u64>().map_err(|_| {
        AppError::internal(format!("invalid {name}={raw:?}; expected integer seconds"))
    })?;
    if parsed == 0 {
        return Err(AppError::internal(format!(
            "invalid {name}={raw:?}; expected > 0"
        )));
    }
    Ok(parsed)
}

fn env_bool(name: &str, default: bool) -> Result<bool, AppError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    let normalized = raw.trim().to_ascii_lowercase();
    match normalized.as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(AppError::internal(format!(
            "invalid {name}={raw:?}; expected true/false"
        ))),
    }
}

fn env_usize_bounded(
    name: &str,
    default: usize,
    min: usize,
    max: usize,
) -> Result<usize, AppError> {
    let raw = env::var(name).unwrap_or_else(|_| default.to_string());
    parse_usize_bounded(name, &raw, min, max)
}

fn parse_usize_bounded(name: &str, raw: &str, min: usize, max: usize) -> Result<usize, AppError> {
    let trimmed = raw.trim();
    let parsed = trimmed.parse::<usize>().map_err(|_| {
        AppError::internal(format!(
            "invalid {name}={raw:?}; expected integer in range [{min}, {max}]"
        ))
    })?;
    if parsed < min || parsed > max {
        return Err(AppError::internal(format!(
            "invalid {name}={raw:?}; expected integer in range [{min}, {max}]"
        )));
    }
    Ok(parsed)
}

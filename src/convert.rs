//! Audio normalization through external transcoder subprocesses.
//!
//! Codec handling is deliberately pushed out to `ffmpeg`: every supported
//! input, video included, is rewritten as mono 16 kHz `pcm_s16le` WAV, and the
//! duration is then read back from the converted file with `ffprobe` so one
//! canonical probe covers all input kinds. Both subprocesses run under a hard
//! deadline and are killed when it expires.

use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use tempfile::TempPath;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use crate::audio::MODEL_SAMPLE_RATE;
use crate::config::AppConfig;
use crate::error::AppError;
use crate::probe::MediaKind;

const STDERR_EXCERPT_MAX: usize = 400;

/// Converted model-ready audio. Dropping it removes the WAV file.
#[derive(Debug)]
pub struct ConvertedAudio {
    /// Scoped path to the mono 16 kHz WAV; deleted on drop.
    pub wav: TempPath,
    /// Duration reported by the probe subprocess, in seconds.
    pub duration_secs: f64,
}

/// Runs the transcoder and duration probe for one request at a time.
pub struct Converter {
    ffmpeg_bin: String,
    ffprobe_bin: String,
    deadline: Duration,
    work_dir: PathBuf,
}

impl Converter {
    pub fn new(cfg: &AppConfig) -> Self {
        Self {
            ffmpeg_bin: cfg.ffmpeg_bin.clone(),
            ffprobe_bin: cfg.ffprobe_bin.clone(),
            deadline: Duration::from_secs(cfg.convert_timeout_secs),
            work_dir: PathBuf::from(&cfg.upload_dir),
        }
    }

    /// Transcodes `input` into model-ready WAV and probes its duration.
    pub async fn to_model_wav(
        &self,
        input: &Path,
        kind: MediaKind,
    ) -> Result<ConvertedAudio, AppError> {
        let out_path = tempfile::Builder::new()
            .prefix("converted-")
            .suffix(".wav")
            .tempfile_in(&self.work_dir)
            .map_err(|err| {
                AppError::internal(format!(
                    "failed to create converted-audio file in {:?}: {err}",
                    self.work_dir
                ))
            })?
            .into_temp_path();

        let started = Instant::now();
        let mut cmd = Command::new(&self.ffmpeg_bin);
        cmd.args(ffmpeg_args(input, &out_path, kind.is_video()))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match timeout(self.deadline, cmd.output()).await {
            Ok(result) => result.map_err(|err| spawn_error(&self.ffmpeg_bin, &err))?,
            // Dropping the unfinished future kills the child via kill_on_drop.
            Err(_) => {
                return Err(AppError::conversion_timeout(format!(
                    "{} did not finish within {}s while converting {} input",
                    self.ffmpeg_bin,
                    self.deadline.as_secs(),
                    kind.as_str()
                )));
            }
        };

        if !output.status.success() {
            return Err(AppError::conversion_failed(format!(
                "{} exited with {} while converting {} input: {}",
                self.ffmpeg_bin,
                output.status,
                kind.as_str(),
                stderr_excerpt(&output.stderr)
            )));
        }

        let duration_secs = self.probe_duration(&out_path).await?;
        debug!(
            input_kind = kind.as_str(),
            duration_secs,
            convert_ms = started.elapsed().as_millis() as u64,
            "converted upload to model-ready wav"
        );

        Ok(ConvertedAudio {
            wav: out_path,
            duration_secs,
        })
    }

    async fn probe_duration(&self, wav: &Path) -> Result<f64, AppError> {
        let mut cmd = Command::new(&self.ffprobe_bin);
        cmd.args([
            "-v",
            "error",
            "-show_entries",
            "format=duration",
            "-of",
            "default=noprint_wrappers=1:nokey=1",
        ])
        .arg(wav)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

        let output = match timeout(self.deadline, cmd.output()).await {
            Ok(result) => result.map_err(|err| spawn_error(&self.ffprobe_bin, &err))?,
            Err(_) => {
                return Err(AppError::conversion_timeout(format!(
                    "{} did not finish within {}s while probing converted audio",
                    self.ffprobe_bin,
                    self.deadline.as_secs()
                )));
            }
        };

        if !output.status.success() {
            return Err(AppError::conversion_failed(format!(
                "{} exited with {} while probing converted audio: {}",
                self.ffprobe_bin,
                output.status,
                stderr_excerpt(&output.stderr)
            )));
        }

        parse_probed_duration(&String::from_utf8_lossy(&output.stdout)).ok_or_else(|| {
            AppError::conversion_failed(format!(
                "{} reported no parseable duration for converted audio",
                self.ffprobe_bin
            ))
        })
    }
}

fn spawn_error(bin: &str, err: &std::io::Error) -> AppError {
    if err.kind() == ErrorKind::NotFound {
        return AppError::conversion_failed(format!(
            "{bin} not found on PATH; install ffmpeg or point FFMPEG_BIN/FFPROBE_BIN at it"
        ));
    }
    AppError::conversion_failed(format!("failed to run {bin}: {err}"))
}

/// Builds the transcode argument list: mono, 16 kHz, s16 PCM in a WAV
/// container, with the video stream stripped when the container may carry one.
fn ffmpeg_args(input: &Path, output: &Path, strip_video: bool) -> Vec<OsString> {
    let mut args: Vec<OsString> = ["-nostdin", "-hide_banner", "-loglevel", "error", "-y", "-i"]
        .iter()
        .map(OsString::from)
        .collect();
    args.push(input.as_os_str().to_os_string());
    if strip_video {
        args.push(OsString::from("-vn"));
    }
    args.push(OsString::from("-ac"));
    args.push(OsString::from("1"));
    args.push(OsString::from("-ar"));
    args.push(OsString::from(MODEL_SAMPLE_RATE.to_string()));
    for arg in ["-acodec", "pcm_s16le", "-f", "wav"] {
        args.push(OsString::from(arg));
    }
    args.push(output.as_os_str().to_os_string());
    args
}

fn parse_probed_duration(stdout: &str) -> Option<f64> {
    let value = stdout.trim().parse::<f64>().ok()?;
    if value.is_finite() && value >= 0.0 {
        Some(value)
    } else {
        None
    }
}

/// Tail of the subprocess stderr, bounded so error bodies stay readable.
fn stderr_excerpt(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return "no diagnostic output".to_string();
    }
    if trimmed.len() <= STDERR_EXCERPT_MAX {
        return trimmed.to_string();
    }
    // ffmpeg prints the decisive error last; keep the tail.
    let mut start = trimmed.len() - STDERR_EXCERPT_MAX;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &trimmed[start..])
}

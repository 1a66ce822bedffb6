//! Blocking whisper.cpp calls via `whisper-rs`.
//!
//! Each call creates a fresh state from the shared context, so concurrent
//! inferences never contend on a lock around the model weights. Runs are
//! single-shot: a failed or empty decode is reported as-is, never re-run
//! with different parameters.

use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperState};

use super::{RawTranscript, Segment, SegmentStream, TaskKind};
use crate::error::AppError;

/// Caps how far into the audio the first timestamp may land.
const MAX_INITIAL_TS: f32 = 5.0;

/// Timestamps come back in centiseconds.
const CENTISECOND: f64 = 0.01;

pub(crate) struct InferenceOptions {
    pub(crate) language: Option<String>,
    pub(crate) task: TaskKind,
}

/// Runs one decode over 16 kHz mono samples. Blocking; callers hold a
/// worker slot and run this on a blocking thread.
pub(crate) fn run_inference(
    context: &WhisperContext,
    samples: &[f32],
    options: &InferenceOptions,
) -> Result<RawTranscript, AppError> {
    let mut state = context
        .create_state()
        .map_err(|err| AppError::inference(format!("failed to create inference state: {err}")))?;

    let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
    params.set_print_special(false);
    params.set_print_progress(false);
    params.set_print_realtime(false);
    params.set_print_timestamps(false);
    params.set_no_timestamps(false);
    params.set_max_initial_ts(MAX_INITIAL_TS);
    params.set_translate(matches!(options.task, TaskKind::Translate));
    match options.language.as_deref() {
        Some(language) => params.set_language(Some(language)),
        None => params.set_detect_language(true),
    }

    state
        .full(params, samples)
        .map_err(|err| AppError::inference(format!("model inference failed: {err}")))?;

    let segments = extract_segments(&state)?;
    let language = match options.language.clone() {
        Some(language) => Some(language),
        None => detected_language(&state),
    };

    Ok(RawTranscript {
        segments: SegmentStream::new(segments),
        language,
    })
}

fn extract_segments(state: &WhisperState) -> Result<Vec<Segment>, AppError> {
    let count = state.full_n_segments();
    let mut segments = Vec::with_capacity(count.max(0) as usize);
    for index in 0..count {
        let Some(segment) = state.get_segment(index) else {
            continue;
        };
        let text = segment.to_str_lossy().map_err(|err| {
            AppError::inference(format!("segment {index} is not valid text: {err}"))
        })?;
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        segments.push(Segment {
            start_secs: segment.start_timestamp() as f64 * CENTISECOND,
            end_secs: segment.end_timestamp() as f64 * CENTISECOND,
            text: trimmed.to_string(),
            // whisper-rs exposes no per-segment confidence.
            confidence: None,
        });
    }
    Ok(segments)
}

fn detected_language(state: &WhisperState) -> Option<String> {
    whisper_rs::get_lang_str(state.full_lang_id_from_state()).map(str::to_string)
}

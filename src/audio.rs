//! Sample loading for converted audio.
//!
//! The converter guarantees mono 16 kHz `pcm_s16le` WAV, so this module only
//! has to turn that one container into the `f32` sample buffer whisper.cpp
//! consumes. A resample fallback stays in place in case a nonstandard
//! transcoder build ever hands back a different rate.

use std::io::{Cursor, ErrorKind};
use std::path::Path;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::default::{get_codecs, get_probe};

use crate::error::AppError;

/// Sample rate whisper.cpp expects.
pub const MODEL_SAMPLE_RATE: u32 = 16_000;

/// Reads a converted WAV file into normalized mono samples.
pub fn load_wav_samples(path: &Path) -> Result<Vec<f32>, AppError> {
    let bytes = std::fs::read(path).map_err(|err| {
        AppError::internal(format!("failed to read converted audio {path:?}: {err}"))
    })?;
    decode_wav_bytes(&bytes)
}

/// Decodes WAV bytes into mono `f32` samples at [`MODEL_SAMPLE_RATE`].
pub(crate) fn decode_wav_bytes(bytes: &[u8]) -> Result<Vec<f32>, AppError> {
    let cursor = Cursor::new(bytes.to_vec());
    let mss = MediaSourceStream::new(Box::new(cursor), Default::default());

    let mut hint = Hint::new();
    hint.with_extension("wav");

    let probed = get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|err| AppError::internal(format!("converted audio is not readable wav: {err}")))?;

    let mut format = probed.format;
    let track = format
        .default_track()
        .ok_or_else(|| AppError::internal("converted audio has no track"))?;

    if track.codec_params.codec == CODEC_TYPE_NULL {
        return Err(AppError::internal(
            "converted audio is missing codec information",
        ));
    }

    let mut decoder = get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|err| {
            AppError::internal(format!("no decoder for converted audio codec: {err}"))
        })?;

    let mut sample_rate = track.codec_params.sample_rate.unwrap_or(MODEL_SAMPLE_RATE);
    let track_id = track.id;
    let mut mono = Vec::new();

    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(err)) if err.kind() == ErrorKind::UnexpectedEof => break,
            Err(err) => {
                return Err(AppError::internal(format!(
                    "failed while reading converted audio: {err}"
                )));
            }
        };

        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(_)) => continue,
            Err(err) => {
                return Err(AppError::internal(format!(
                    "failed to decode converted audio packet: {err}"
                )));
            }
        };

        sample_rate = decoded.spec().rate;
        let channels = decoded.spec().channels.count();

        let mut sample_buffer =
            SampleBuffer::<f32>::new(decoded.capacity() as u64, *decoded.spec());
        sample_buffer.copy_interleaved_ref(decoded);
        let samples = sample_buffer.samples();

        if channels <= 1 {
            mono.extend_from_slice(samples);
            continue;
        }

        // The converter asks for mono; average defensively if it ever is not.
        for frame in samples.chunks(channels) {
            let sum: f32 = frame.iter().copied().sum();
            mono.push(sum / channels as f32);
        }
    }

    if mono.is_empty() {
        return Err(AppError::internal("converted audio decoded to zero samples"));
    }

    let normalized = mono
        .into_iter()
        .map(|s| s.clamp(-1.0, 1.0))
        .collect::<Vec<_>>();

    Ok(if sample_rate == MODEL_SAMPLE_RATE {
        normalized
    } else {
        resample_linear(&normalized, sample_rate, MODEL_SAMPLE_RATE)
    })
}

/// Resamples a mono signal from `src_rate` to `dst_rate` via linear interpolation.
fn resample_linear(input: &[f32], src_rate: u32, dst_rate: u32) -> Vec<f32> {
    if src_rate == dst_rate || input.len() < 2 {
        return input.to_vec();
    }

    let ratio = src_rate as f64 / dst_rate as f64;
    let out_len = ((input.len() as f64) * (dst_rate as f64) / (src_rate as f64)).round() as usize;
    let out_len = out_len.max(1);

    let mut out = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let src_pos = i as f64 * ratio;
        let idx = src_pos.floor() as usize;
        let frac = (src_pos - idx as f64) as f32;

        let a = input[idx.min(input.len() - 1)];
        let b = input[(idx + 1).min(input.len() - 1)];
        out.push(a + (b - a) * frac);
    }

    out
}

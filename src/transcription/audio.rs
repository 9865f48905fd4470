//! Audio decoding and resampling to 16kHz mono f32.
//!
//! Containers and codecs symphonia understands (wav, mp3, flac, ogg/vorbis,
//! m4a/aac, matroska/webm with vorbis or pcm) are decoded in-process. Anything
//! else, notably Opus in webm as recorded by browsers, is handed to `ffmpeg`.

use anyhow::{anyhow, Context, Result};
use std::fs::File;
use std::path::Path;
use std::process::Command;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

/// Sample rate the Whisper feature extractor expects.
pub const TARGET_SAMPLE_RATE: u32 = 16_000;

/// Executable used for formats symphonia cannot decode.
const FFMPEG: &str = "ffmpeg";

/// Outcome of an in-process decode attempt.
enum NativeError {
    /// Container or codec unknown to symphonia; worth trying ffmpeg
    Unsupported(String),
    Failed(anyhow::Error),
}

impl From<anyhow::Error> for NativeError {
    fn from(err: anyhow::Error) -> Self {
        NativeError::Failed(err)
    }
}

/// Decode an audio file into 16kHz mono samples in `[-1.0, 1.0]`.
///
/// The container is detected from its content; the file extension is only a
/// hint. Multi-channel audio is averaged down to mono.
pub fn decode_file(path: &Path) -> Result<Vec<f32>> {
    let file = File::open(path).with_context(|| format!("cannot open {}", path.display()))?;

    let (samples, source_rate) = match decode_native(file, path) {
        Ok(decoded) => decoded,
        Err(NativeError::Failed(e)) => return Err(e),
        Err(NativeError::Unsupported(reason)) => {
            tracing::debug!("{}; decoding {} with {}", reason, path.display(), FFMPEG);
            let samples = decode_with_ffmpeg(path)
                .with_context(|| format!("{} and the {} fallback failed", reason, FFMPEG))?;
            (samples, TARGET_SAMPLE_RATE)
        }
    };

    if samples.is_empty() {
        return Err(anyhow!("no audio samples decoded"));
    }

    let samples = if source_rate != TARGET_SAMPLE_RATE {
        resample(&samples, source_rate, TARGET_SAMPLE_RATE)?
    } else {
        samples
    };

    tracing::debug!(
        "Decoded {} samples ({:.2}s) from {} Hz source",
        samples.len(),
        samples.len() as f64 / TARGET_SAMPLE_RATE as f64,
        source_rate
    );

    Ok(samples)
}

/// Mono samples and their sample rate, decoded with symphonia.
fn decode_native(file: File, path: &Path) -> Result<(Vec<f32>, u32), NativeError> {
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let detected = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(|e| NativeError::Unsupported(format!("unrecognized audio format: {e}")))?;

    let mut format = detected.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| NativeError::Unsupported("no decodable audio track".to_string()))?;

    let codec_params = track.codec_params.clone();
    let track_id = track.id;
    let source_rate = codec_params.sample_rate.unwrap_or(TARGET_SAMPLE_RATE);

    let mut decoder = symphonia::default::get_codecs()
        .make(&codec_params, &DecoderOptions::default())
        .map_err(|e| NativeError::Unsupported(format!("unsupported codec: {e}")))?;

    let mut samples: Vec<f32> = Vec::new();

    loop {
        let packet = match format.next_packet() {
            Ok(p) => p,
            Err(SymphoniaError::IoError(ref e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break;
            }
            Err(e) => return Err(anyhow!("failed to read audio packet: {e}").into()),
        };

        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            // A corrupt frame is skipped, the rest of the stream is still usable
            Err(SymphoniaError::DecodeError(e)) => {
                tracing::warn!("Skipping undecodable audio frame: {}", e);
                continue;
            }
            Err(e) => return Err(anyhow!("failed to decode audio: {e}").into()),
        };

        let spec = *decoded.spec();
        let channels = spec.channels.count().max(1);
        let mut sample_buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
        sample_buf.copy_interleaved_ref(decoded);

        if channels > 1 {
            samples.extend(
                sample_buf
                    .samples()
                    .chunks(channels)
                    .map(|frame| frame.iter().sum::<f32>() / channels as f32),
            );
        } else {
            samples.extend_from_slice(sample_buf.samples());
        }
    }

    Ok((samples, source_rate))
}

/// Decode with `ffmpeg` straight to 16kHz mono signed 16-bit PCM on stdout.
fn decode_with_ffmpeg(path: &Path) -> Result<Vec<f32>> {
    let output = Command::new(FFMPEG)
        .args(["-nostdin", "-threads", "0", "-i"])
        .arg(path)
        .args(["-f", "s16le", "-ac", "1", "-acodec", "pcm_s16le", "-ar"])
        .arg(TARGET_SAMPLE_RATE.to_string())
        .arg("-")
        .output()
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => anyhow!("{} is not installed", FFMPEG),
            _ => anyhow!("cannot run {}: {}", FFMPEG, e),
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let last_line = stderr.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("");
        return Err(anyhow!("{} exited with {}: {}", FFMPEG, output.status, last_line.trim()));
    }

    Ok(pcm_s16le_to_f32(&output.stdout))
}

/// Little-endian 16-bit PCM bytes to samples in `[-1.0, 1.0)`.
fn pcm_s16le_to_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / 32_768.0)
        .collect()
}

/// Resample mono audio from `from_rate` to `to_rate` using rubato.
///
/// The sinc filter delays its output; that delay is dropped from the front and
/// the filter is flushed at the end, so the result lines up with the input.
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    use rubato::{
        Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
    };

    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };

    let ratio = f64::from(to_rate) / f64::from(from_rate);
    let chunk_size = 1024;

    let mut resampler = SincFixedIn::<f32>::new(ratio, 2.0, params, chunk_size, 1)
        .map_err(|e| anyhow!("resampler init failed: {e}"))?;

    let delay = resampler.output_delay();
    let expected_len = (samples.len() as f64 * ratio).round() as usize;
    let mut output = Vec::with_capacity(delay + expected_len + chunk_size);

    let mut chunks = samples.chunks_exact(chunk_size);
    for chunk in &mut chunks {
        let resampled = resampler
            .process(&[chunk][..], None)
            .map_err(|e| anyhow!("resampling failed: {e}"))?;
        output.extend_from_slice(&resampled[0]);
    }

    let remainder = chunks.remainder();
    if !remainder.is_empty() {
        let resampled = resampler
            .process_partial(Some(&[remainder][..]), None)
            .map_err(|e| anyhow!("resampling failed: {e}"))?;
        output.extend_from_slice(&resampled[0]);
    }

    // Push zeros through until the delayed tail has come out
    while output.len() < delay + expected_len {
        let resampled = resampler
            .process_partial::<&[f32]>(None, None)
            .map_err(|e| anyhow!("resampling failed: {e}"))?;
        if resampled[0].is_empty() {
            break;
        }
        output.extend_from_slice(&resampled[0]);
    }

    output.drain(..delay.min(output.len()));
    output.truncate(expected_len);
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    /// Minimal PCM WAV file: 16-bit little endian.
    fn wav_bytes(sample_rate: u32, channels: u16, samples: &[i16]) -> Vec<u8> {
        let data_len = (samples.len() * 2) as u32;
        let byte_rate = sample_rate * channels as u32 * 2;
        let mut out = Vec::with_capacity(44 + data_len as usize);
        out.extend_from_slice(b"RIFF");
        out.extend_from_slice(&(36 + data_len).to_le_bytes());
        out.extend_from_slice(b"WAVE");
        out.extend_from_slice(b"fmt ");
        out.extend_from_slice(&16u32.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&channels.to_le_bytes());
        out.extend_from_slice(&sample_rate.to_le_bytes());
        out.extend_from_slice(&byte_rate.to_le_bytes());
        out.extend_from_slice(&(channels * 2).to_le_bytes());
        out.extend_from_slice(&16u16.to_le_bytes());
        out.extend_from_slice(b"data");
        out.extend_from_slice(&data_len.to_le_bytes());
        for s in samples {
            out.extend_from_slice(&s.to_le_bytes());
        }
        out
    }

    fn write_temp(bytes: &[u8], suffix: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(bytes).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_decode_mono_wav() {
        let samples: Vec<i16> = (0..1600).map(|i| ((i % 100) * 100) as i16).collect();
        let file = write_temp(&wav_bytes(16_000, 1, &samples), ".wav");

        let decoded = decode_file(file.path()).unwrap();
        assert_eq!(decoded.len(), 1600);
        assert!(decoded.iter().all(|s| (-1.0..=1.0).contains(s)));
    }

    #[test]
    fn test_decode_stereo_wav_is_mixed_down() {
        // Left at full scale, right silent: the mono mix is half scale
        let samples: Vec<i16> = (0..800).flat_map(|_| [16_384i16, 0i16]).collect();
        let file = write_temp(&wav_bytes(16_000, 2, &samples), ".wav");

        let decoded = decode_file(file.path()).unwrap();
        assert_eq!(decoded.len(), 800);
        assert!(decoded.iter().all(|s| (s - 0.25).abs() < 1e-3));
    }

    #[test]
    fn test_decode_resamples_to_16k() {
        let samples = vec![0i16; 48_000];
        let file = write_temp(&wav_bytes(48_000, 1, &samples), ".wav");

        let decoded = decode_file(file.path()).unwrap();
        assert_eq!(decoded.len(), 16_000);
    }

    #[test]
    fn test_decode_garbage_fails() {
        let file = write_temp(b"definitely not audio", ".bin");
        assert!(decode_file(file.path()).is_err());
    }

    #[test]
    fn test_decode_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(decode_file(&dir.path().join("gone.wav")).is_err());
    }

    #[test]
    fn test_decode_garbage_reports_fallback() {
        let file = write_temp(b"\x1a\x45\xdf\xa3 broken matroska", ".webm");
        let err = decode_file(file.path()).unwrap_err();
        assert!(err.to_string().contains("fallback failed"), "{err:#}");
    }

    fn ffmpeg_available() -> bool {
        Command::new(FFMPEG)
            .arg("-version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    #[test]
    fn test_decode_webm_opus_recording() {
        if !ffmpeg_available() {
            eprintln!("ffmpeg not installed, skipping webm/opus decode");
            return;
        }

        // One second of 440 Hz at 48 kHz, the way browsers record voice notes
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recording.webm");
        let status = Command::new(FFMPEG)
            .args(["-nostdin", "-loglevel", "error", "-f", "lavfi", "-i"])
            .arg("sine=frequency=440:sample_rate=48000:duration=1")
            .args(["-c:a", "libopus", "-f", "webm"])
            .arg(&path)
            .status()
            .unwrap();
        if !status.success() {
            eprintln!("ffmpeg built without libopus, skipping webm/opus decode");
            return;
        }

        let decoded = decode_file(&path).unwrap();
        assert!(
            (decoded.len() as i64 - 16_000).abs() < 800,
            "decoded {} samples",
            decoded.len()
        );
        assert!(decoded.iter().any(|s| s.abs() > 0.1));
        assert!(decoded.iter().all(|s| (-1.0..=1.0).contains(s)));
    }

    #[test]
    fn test_pcm_s16le_conversion() {
        let bytes = [0x00, 0x00, 0x00, 0x40, 0x00, 0x80, 0xff, 0x7f, 0x01];
        let samples = pcm_s16le_to_f32(&bytes);
        assert_eq!(samples.len(), 4);
        assert_eq!(samples[0], 0.0);
        assert_eq!(samples[1], 0.5);
        assert_eq!(samples[2], -1.0);
        assert!((samples[3] - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_resample_keeps_signal_aligned() {
        // Silence for the first half second, then a constant level
        let samples: Vec<f32> = (0..48_000).map(|i| if i < 24_000 { 0.0 } else { 0.5 }).collect();
        let result = resample(&samples, 48_000, 16_000).unwrap();

        assert_eq!(result.len(), 16_000);
        assert!(result[..7_000].iter().all(|s| s.abs() < 0.05));
        assert!(result[9_000..15_000].iter().all(|s| (s - 0.5).abs() < 0.05));
    }

    #[test]
    fn test_resample_short_input() {
        let samples = vec![0.25f32; 300];
        let result = resample(&samples, 44_100, 16_000).unwrap();
        assert_eq!(result.len(), (300.0f64 * 16_000.0 / 44_100.0).round() as usize);
    }

    #[test]
    fn test_resample_downsample_ratio() {
        let samples: Vec<f32> = (0..48_000).map(|i| (i as f32 / 48_000.0).sin()).collect();
        let result = resample(&samples, 48_000, 16_000).unwrap();
        assert_eq!(result.len(), 16_000);
    }
}

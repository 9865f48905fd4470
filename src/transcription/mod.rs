//! # Transcription Module
//!
//! The speech model behind `POST /transcribe`. Handlers only see the
//! [`SpeechModel`] trait: a loaded model that turns an audio file on disk into a
//! [`Transcript`]. The production implementation is a Whisper model running on
//! Candle; tests inject a stub.
//!
//! ## Components:
//! - **model**: variant names, Hugging Face download, the `WhisperModel` provider
//! - **options**: the fixed decoding parameters (Portuguese, beam search)
//! - **audio**: decoding the staged file to 16kHz mono samples
//! - **mel**: the mel filterbank used for log-mel features
//! - **decoder**: beam search / sampling, timestamp rules and segmentation

pub mod audio;
pub mod decoder;
pub mod mel;
pub mod model;
pub mod options;

pub use model::{ModelVariant, WhisperModel};
pub use options::{DecodingOptions, Task};

use std::path::Path;

/// A time-stamped span of recognized speech.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    /// Start of the span, in seconds from the beginning of the audio
    pub start: f64,
    /// End of the span, in seconds from the beginning of the audio
    pub end: f64,
    pub text: String,
    pub tokens: Vec<u32>,
    /// Mean log-probability of the tokens that produced this span
    pub avg_logprob: f64,
}

/// Raw output of a speech model for one audio file.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Transcript {
    /// Recognized text, untrimmed
    pub text: String,
    /// Language code reported by the model, if any
    pub language: Option<String>,
    /// Ordered segments; empty when nothing was recognized
    pub segments: Vec<Segment>,
}

/// A loaded speech-to-text model.
///
/// ## Contract:
/// - Loaded once, never mutated afterwards: `transcribe` takes `&self` and may be
///   called from several threads at once.
/// - `transcribe` is blocking and compute-bound; async callers must move it off
///   the async workers (see `web::block` in the transcribe handler).
pub trait SpeechModel: Send + Sync {
    /// Variant name the model was loaded from (e.g. "medium").
    fn variant(&self) -> &str;

    /// Transcribe the audio file at `path`.
    fn transcribe(&self, path: &Path, options: &DecodingOptions) -> anyhow::Result<Transcript>;
}

//! Decoding parameters passed to the speech model on every request.

/// What the decoder is asked to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Task {
    /// Text in the spoken language
    Transcribe,
    /// English text regardless of the spoken language
    Translate,
}

/// Configuration for one transcription call.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodingOptions {
    /// Forced language (ISO 639-1 code); detection is never attempted
    pub language: String,

    pub task: Task,

    /// Beam width used when `temperature == 0.0`
    pub beam_size: usize,

    /// Independent samples drawn when `temperature > 0.0`; the best one wins
    pub best_of: usize,

    /// Sampling temperature (0.0 = deterministic beam search)
    pub temperature: f64,

    /// Reduced-precision (F16) inference
    pub fp16: bool,
}

impl DecodingOptions {
    /// The bundle used by `POST /transcribe`: Portuguese, transcription, beam
    /// search of width 5, full precision.
    pub fn portuguese() -> Self {
        Self {
            language: "pt".to_string(),
            task: Task::Transcribe,
            beam_size: 5,
            best_of: 5,
            temperature: 0.0,
            fp16: false,
        }
    }

    /// Whether decoding is deterministic (beam search) rather than sampled.
    pub fn is_greedy(&self) -> bool {
        self.temperature <= 0.0
    }
}

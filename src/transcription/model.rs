//! # Whisper Model
//!
//! Loads a Whisper checkpoint from the Hugging Face hub and runs it with
//! Candle. This is the production [`SpeechModel`].
//!
//! ## Loading Process:
//! 1. Resolve the variant name to a repository ("medium" -> `openai/whisper-medium`)
//! 2. Download `config.json`, `tokenizer.json` and `model.safetensors` (cached locally)
//! 3. Map the weights onto the selected device in full precision (F32)
//! 4. Build the mel filterbank for the model's number of mel bins
//!
//! ## Transcription:
//! The staged file is decoded to 16kHz mono, converted to log-mel features and
//! consumed in 30 second windows. Each window is encoded once, decoded with the
//! requested search strategy and split into time-stamped segments.

use super::decoder::{split_segments, LogitSource, SpecialTokens, WindowDecoder};
use super::{audio, mel, DecodingOptions, Segment, SpeechModel, Transcript};
use anyhow::{anyhow, Context, Result};
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::whisper::{self as m, audio as whisper_audio, Config};
use hf_hub::api::tokio::{ApiBuilder, ApiRepo};
use hf_hub::{Repo, RepoType};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokenizers::Tokenizer;

/// Available Whisper checkpoints.
///
/// ## Trade-offs:
/// Larger models are more accurate on Portuguese (and on clinical vocabulary)
/// but slower and heavier; "medium" is the default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelVariant {
    Tiny,
    Base,
    Small,
    Medium,
    LargeV1,
    LargeV2,
    LargeV3,
    Turbo,
}

impl ModelVariant {
    /// Hugging Face model repository.
    pub fn repo_name(&self) -> &'static str {
        match self {
            ModelVariant::Tiny => "openai/whisper-tiny",
            ModelVariant::Base => "openai/whisper-base",
            ModelVariant::Small => "openai/whisper-small",
            ModelVariant::Medium => "openai/whisper-medium",
            ModelVariant::LargeV1 => "openai/whisper-large",
            ModelVariant::LargeV2 => "openai/whisper-large-v2",
            ModelVariant::LargeV3 => "openai/whisper-large-v3",
            ModelVariant::Turbo => "openai/whisper-large-v3-turbo",
        }
    }

    /// Approximate size of the weights in MB.
    pub fn size_mb(&self) -> u32 {
        match self {
            ModelVariant::Tiny => 151,
            ModelVariant::Base => 290,
            ModelVariant::Small => 967,
            ModelVariant::Medium => 3055,
            ModelVariant::LargeV1 | ModelVariant::LargeV2 | ModelVariant::LargeV3 => 6173,
            ModelVariant::Turbo => 3235,
        }
    }
}

impl std::str::FromStr for ModelVariant {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "tiny" => Ok(ModelVariant::Tiny),
            "base" => Ok(ModelVariant::Base),
            "small" => Ok(ModelVariant::Small),
            "medium" => Ok(ModelVariant::Medium),
            "large-v1" => Ok(ModelVariant::LargeV1),
            "large-v2" => Ok(ModelVariant::LargeV2),
            "large" | "large-v3" => Ok(ModelVariant::LargeV3),
            "turbo" | "large-v3-turbo" => Ok(ModelVariant::Turbo),
            _ => Err(anyhow!("Unknown Whisper model variant: {}", s)),
        }
    }
}

impl std::fmt::Display for ModelVariant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ModelVariant::Tiny => "tiny",
            ModelVariant::Base => "base",
            ModelVariant::Small => "small",
            ModelVariant::Medium => "medium",
            ModelVariant::LargeV1 => "large-v1",
            ModelVariant::LargeV2 => "large-v2",
            ModelVariant::LargeV3 => "large-v3",
            ModelVariant::Turbo => "turbo",
        };
        write!(f, "{}", name)
    }
}

/// A loaded Whisper model ready for transcription.
///
/// ## Thread Safety:
/// Never mutated after loading. Candle tensors are reference counted, so each
/// call clones the network (cheap) and owns its attention caches.
pub struct WhisperModel {
    /// Variant name exactly as configured
    name: String,
    model: m::model::Whisper,
    config: Config,
    tokenizer: Tokenizer,
    mel_filters: Vec<f32>,
    device: Device,
}

impl WhisperModel {
    /// Download (or reuse the cached copy of) a Whisper checkpoint and load it.
    ///
    /// ## Parameters:
    /// - **name**: configured variant name, reported back by `/health`
    /// - **revision**: repository revision ("main" unless pinned)
    /// - **device**: device to load the weights on
    pub async fn load(name: &str, revision: &str, device: Device) -> Result<Self> {
        let variant: ModelVariant = name.parse()?;
        let start_time = Instant::now();
        tracing::info!(
            "Loading Whisper {} model (~{} MB) from {} on {}",
            variant,
            variant.size_mb(),
            variant.repo_name(),
            crate::device::describe(&device)
        );

        let files = download(variant, revision).await?;

        let config: Config = serde_json::from_reader(std::fs::File::open(&files.config)?)
            .context("invalid model config.json")?;
        tracing::debug!("Model config: {:?}", config);

        let tokenizer = Tokenizer::from_file(&files.tokenizer)
            .map_err(|e| anyhow!("Failed to load tokenizer: {}", e))?;

        let mel_filters = mel::filterbank(config.num_mel_bins, mel::N_FFT, m::SAMPLE_RATE as u32);

        // SAFETY: the weights file is owned by the hub cache and not modified while mapped
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&[files.weights], DType::F32, &device)?
        };
        let model = m::model::Whisper::load(&vb, config.clone())?;

        tracing::info!(
            "Whisper {} model loaded in {:.2}s",
            variant,
            start_time.elapsed().as_secs_f64()
        );

        Ok(Self {
            name: name.to_string(),
            model,
            config,
            tokenizer,
            mel_filters,
            device,
        })
    }

    fn token_id(&self, token: &str) -> Result<u32> {
        self.tokenizer
            .token_to_id(token)
            .ok_or_else(|| anyhow!("tokenizer has no id for {}", token))
    }

    fn special_tokens(&self, language: &str) -> Result<SpecialTokens> {
        let no_timestamps = self.token_id(m::NO_TIMESTAMPS_TOKEN)?;
        let language = self
            .token_id(&format!("<|{}|>", language))
            .with_context(|| format!("unsupported language '{}'", language))?;

        Ok(SpecialTokens {
            sot: self.token_id(m::SOT_TOKEN)?,
            eot: self.token_id(m::EOT_TOKEN)?,
            transcribe: self.token_id(m::TRANSCRIBE_TOKEN)?,
            translate: self.token_id(m::TRANSLATE_TOKEN)?,
            no_timestamps,
            // Older tokenizer files omit the timestamp tokens; they follow <|notimestamps|>
            timestamp_begin: self.tokenizer.token_to_id("<|0.00|>").unwrap_or(no_timestamps + 1),
            language,
            space: self.tokenizer.token_to_id("Ġ"),
            no_speech: m::NO_SPEECH_TOKENS
                .iter()
                .find_map(|token| self.tokenizer.token_to_id(token)),
        })
    }

    fn detokenize(&self, tokens: &[u32]) -> Result<String> {
        self.tokenizer
            .decode(tokens, true)
            .map_err(|e| anyhow!("Tokenizer decode error: {}", e))
    }
}

impl SpeechModel for WhisperModel {
    fn variant(&self) -> &str {
        &self.name
    }

    fn transcribe(&self, path: &Path, options: &DecodingOptions) -> Result<Transcript> {
        let start_time = Instant::now();

        if options.fp16 {
            tracing::debug!("F16 inference requested; weights are loaded in F32");
        }

        let pcm = audio::decode_file(path)?;
        let specials = self.special_tokens(&options.language)?;

        let n_mels = self.config.num_mel_bins;
        let mel = whisper_audio::pcm_to_mel(&self.config, &pcm, &self.mel_filters);
        let mel_frames = mel.len() / n_mels;
        let mel = Tensor::from_vec(mel, (1, n_mels, mel_frames), &self.device)?;

        let content_frames = pcm.len() / m::HOP_LENGTH;
        let frames_per_timestamp = m::N_FRAMES / self.config.max_source_positions;
        let decoder = WindowDecoder::new(
            &specials,
            &self.config.suppress_tokens,
            options,
            self.config.max_target_positions / 2,
        );

        let mut model = self.model.clone();
        let mut segments: Vec<Segment> = Vec::new();
        let mut seek = 0;

        while seek < content_frames {
            let segment_frames = usize::min(content_frames - seek, m::N_FRAMES);
            let window_frames = usize::min(m::N_FRAMES, mel_frames - seek);
            let time_offset = (seek * m::HOP_LENGTH) as f64 / m::SAMPLE_RATE as f64;

            let mel_window = mel.narrow(2, seek, window_frames)?;
            let audio_features = model.encoder.forward(&mel_window, true)?;

            let mut source = DecoderLogits {
                decoder: &mut model.decoder,
                audio_features,
                cached_batch: None,
            };
            let window = decoder.decode(&mut source)?;

            let out = split_segments(
                &window,
                &specials,
                time_offset,
                segment_frames,
                frames_per_timestamp,
                &|tokens: &[u32]| self.detokenize(tokens),
            )?;

            tracing::debug!(
                "Window at {:.2}s: {} tokens, {} segments, avg logprob {:.3}",
                time_offset,
                window.tokens.len(),
                out.segments.len(),
                window.avg_logprob
            );

            segments.extend(out.segments);
            seek += out.seek_frames;
        }

        let text: String = segments.iter().map(|s| s.text.as_str()).collect();

        tracing::debug!(
            "Transcribed {:.2}s of audio in {:.2}s",
            pcm.len() as f64 / m::SAMPLE_RATE as f64,
            start_time.elapsed().as_secs_f64()
        );

        Ok(Transcript {
            text,
            language: Some(options.language.clone()),
            segments,
        })
    }
}

/// Next-token logits from the Whisper text decoder for one encoded window.
struct DecoderLogits<'a> {
    decoder: &'a mut m::model::TextDecoder,
    /// Encoder output for the window, batch size 1
    audio_features: Tensor,
    /// Batch size the cross-attention cache was built for
    cached_batch: Option<usize>,
}

impl LogitSource for DecoderLogits<'_> {
    fn next_logits(&mut self, sequences: &[Vec<u32>]) -> Result<Vec<Vec<f32>>> {
        let batch = sequences.len();
        let seq_len = sequences.first().map(Vec::len).unwrap_or(0);
        if batch == 0 || seq_len == 0 || sequences.iter().any(|s| s.len() != seq_len) {
            return Err(anyhow!("decoder needs non-empty sequences of equal length"));
        }

        let device = self.audio_features.device();
        let tokens = Tensor::from_vec(sequences.concat(), (batch, seq_len), device)?;
        let audio_features = if batch == 1 {
            self.audio_features.clone()
        } else {
            self.audio_features.repeat((batch, 1, 1))?
        };

        // Cross-attention keys/values only depend on the audio, so they stay
        // valid while the batch size is unchanged
        let flush = self.cached_batch != Some(batch);
        self.cached_batch = Some(batch);

        let ys = self.decoder.forward(&tokens, &audio_features, flush)?;
        let logits = self
            .decoder
            .final_linear(&ys.i((.., seq_len - 1..))?)?
            .squeeze(1)?
            .to_dtype(DType::F32)?;

        Ok(logits.to_vec2::<f32>()?)
    }
}

struct ModelFiles {
    config: PathBuf,
    tokenizer: PathBuf,
    weights: PathBuf,
}

/// Fetch the checkpoint files through the hub cache.
///
/// ## Environment:
/// - `HF_TOKEN`: access token for gated or private repositories
/// - `HF_HUB_CACHE` / `HF_HOME`: cache location
async fn download(variant: ModelVariant, revision: &str) -> Result<ModelFiles> {
    let mut builder = ApiBuilder::new().with_progress(false);

    builder = builder.with_token(std::env::var("HF_TOKEN").ok());

    if let Ok(cache_dir) = std::env::var("HF_HUB_CACHE") {
        builder = builder.with_cache_dir(cache_dir.into());
    } else if let Ok(hf_home) = std::env::var("HF_HOME") {
        builder = builder.with_cache_dir(PathBuf::from(hf_home).join("hub"));
    }

    let api = builder
        .build()
        .map_err(|e| anyhow!("Failed to create Hugging Face client: {}", e))?;

    let repo = api.repo(Repo::with_revision(
        variant.repo_name().to_string(),
        RepoType::Model,
        revision.to_string(),
    ));

    Ok(ModelFiles {
        config: fetch(&repo, variant, "config.json").await?,
        tokenizer: fetch(&repo, variant, "tokenizer.json").await?,
        weights: fetch(&repo, variant, "model.safetensors").await?,
    })
}

async fn fetch(repo: &ApiRepo, variant: ModelVariant, file: &str) -> Result<PathBuf> {
    tracing::debug!("Fetching {} from {}", file, variant.repo_name());
    repo.get(file)
        .await
        .map_err(|e| anyhow!("Failed to download {} from {}: {}", file, variant.repo_name(), e))
}

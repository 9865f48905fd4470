//! # Token Decoding
//!
//! Turns next-token logits into a token sequence for one 30 second window, and
//! a window's tokens into time-stamped segments.
//!
//! The model side is abstracted behind [`LogitSource`] so the search itself can
//! be exercised without weights:
//! - **Beam search** when the temperature is zero (`beam_size` live beams)
//! - **Best-of sampling** otherwise (`best_of` independent samples)
//!
//! Both rank finished candidates by mean log-probability of the sampled tokens.

use super::options::DecodingOptions;
use super::Segment;
use anyhow::{anyhow, Result};
use rand::distr::weighted::WeightedIndex;
use rand::distr::Distribution;

/// Seconds represented by one timestamp token step.
pub const TIME_PRECISION: f64 = 0.02;

/// Latest allowed first timestamp, in timestamp steps (1.0 s).
const MAX_INITIAL_TIMESTAMP_INDEX: u32 = 50;

/// Ids of the special tokens the decoder needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpecialTokens {
    pub sot: u32,
    pub eot: u32,
    pub transcribe: u32,
    pub translate: u32,
    pub no_timestamps: u32,
    /// First timestamp token (`<|0.00|>`); every id at or above it is a timestamp
    pub timestamp_begin: u32,
    /// Forced language token (`<|pt|>`)
    pub language: u32,
    /// Single space token, suppressed as the first sampled token
    pub space: Option<u32>,
    pub no_speech: Option<u32>,
}

impl SpecialTokens {
    pub fn is_timestamp(&self, token: u32) -> bool {
        token >= self.timestamp_begin
    }

    /// Tokens that may never be sampled.
    pub fn always_suppressed(&self, model_suppress: &[u32]) -> Vec<u32> {
        let mut suppress = model_suppress.to_vec();
        suppress.extend([self.sot, self.transcribe, self.translate, self.no_timestamps]);
        suppress.extend(self.no_speech);
        suppress.sort_unstable();
        suppress.dedup();
        suppress
    }
}

/// Something that can score the next token of several equal-length sequences.
pub trait LogitSource {
    /// Unnormalized next-token logits, one row per sequence.
    fn next_logits(&mut self, sequences: &[Vec<u32>]) -> Result<Vec<Vec<f32>>>;
}

/// Best candidate for one window.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedWindow {
    /// Sampled tokens, without the prompt and without the end-of-text token
    pub tokens: Vec<u32>,
    pub sum_logprob: f64,
    pub avg_logprob: f64,
}

#[derive(Debug, Clone)]
struct Candidate {
    tokens: Vec<u32>,
    sum_logprob: f64,
}

/// Decoder for a single window: prompt, search strategy and logit filters.
pub struct WindowDecoder<'a> {
    specials: &'a SpecialTokens,
    suppress: Vec<u32>,
    options: &'a DecodingOptions,
    sample_len: usize,
}

impl<'a> WindowDecoder<'a> {
    pub fn new(
        specials: &'a SpecialTokens,
        model_suppress: &[u32],
        options: &'a DecodingOptions,
        sample_len: usize,
    ) -> Self {
        Self {
            specials,
            suppress: specials.always_suppressed(model_suppress),
            options,
            sample_len,
        }
    }

    /// `<|startoftranscript|><|lang|><|task|>`, timestamps enabled.
    pub fn prompt(&self) -> Vec<u32> {
        let task = match self.options.task {
            super::Task::Transcribe => self.specials.transcribe,
            super::Task::Translate => self.specials.translate,
        };
        vec![self.specials.sot, self.specials.language, task]
    }

    pub fn decode(&self, source: &mut dyn LogitSource) -> Result<DecodedWindow> {
        let best = if self.options.is_greedy() {
            self.beam_search(source, self.options.beam_size.max(1))?
        } else {
            self.best_of_sampling(source, self.options.best_of.max(1))?
        };

        let length = best.tokens.len().max(1) as f64;
        Ok(DecodedWindow {
            avg_logprob: best.sum_logprob / length,
            sum_logprob: best.sum_logprob,
            tokens: best.tokens,
        })
    }

    fn beam_search(&self, source: &mut dyn LogitSource, beam_size: usize) -> Result<Candidate> {
        let prompt = self.prompt();
        let prompt_len = prompt.len();
        let eot = self.specials.eot;

        let mut beams = vec![Candidate { tokens: prompt, sum_logprob: 0.0 }];
        let mut finished: Vec<Candidate> = Vec::new();

        for _ in 0..self.sample_len {
            let sequences: Vec<Vec<u32>> = beams.iter().map(|b| b.tokens.clone()).collect();
            let rows = source.next_logits(&sequences)?;
            if rows.len() != beams.len() {
                return Err(anyhow!(
                    "expected {} logit rows, model returned {}",
                    beams.len(),
                    rows.len()
                ));
            }

            let mut candidates = Vec::with_capacity(beams.len() * (beam_size + 1));
            for (beam, mut logits) in beams.iter().zip(rows) {
                self.apply_filters(&mut logits, &beam.tokens[prompt_len..]);
                let logprobs = log_softmax(&logits);

                for (token, logprob) in top_k(&logprobs, beam_size + 1) {
                    let mut tokens = beam.tokens.clone();
                    tokens.push(token);
                    candidates.push(Candidate {
                        tokens,
                        sum_logprob: beam.sum_logprob + logprob as f64,
                    });
                }
            }

            candidates.sort_by(|a, b| b.sum_logprob.total_cmp(&a.sum_logprob));

            let mut next = Vec::with_capacity(beam_size);
            for candidate in candidates {
                if candidate.tokens.last() == Some(&eot) {
                    if finished.len() < beam_size {
                        finished.push(candidate);
                    }
                } else {
                    next.push(candidate);
                    if next.len() == beam_size {
                        break;
                    }
                }
            }
            beams = next;

            if finished.len() >= beam_size || beams.is_empty() {
                break;
            }
        }

        // Out of budget: unfinished beams compete with the finished ones
        if finished.len() < beam_size {
            let missing = beam_size - finished.len();
            finished.extend(beams.into_iter().take(missing));
        }

        finished
            .into_iter()
            .map(|c| strip(c, prompt_len, eot))
            .max_by(|a, b| mean_logprob(a).total_cmp(&mean_logprob(b)))
            .ok_or_else(|| anyhow!("beam search produced no candidates"))
    }

    fn best_of_sampling(&self, source: &mut dyn LogitSource, best_of: usize) -> Result<Candidate> {
        let prompt = self.prompt();
        let prompt_len = prompt.len();
        let eot = self.specials.eot;
        let temperature = self.options.temperature as f32;
        let mut rng = rand::rng();

        let mut samples = Vec::with_capacity(best_of);
        for _ in 0..best_of {
            let mut candidate = Candidate { tokens: prompt.clone(), sum_logprob: 0.0 };

            for _ in 0..self.sample_len {
                let mut rows = source.next_logits(std::slice::from_ref(&candidate.tokens))?;
                let mut logits = rows.pop().ok_or_else(|| anyhow!("model returned no logits"))?;
                self.apply_filters(&mut logits, &candidate.tokens[prompt_len..]);

                let logprobs = log_softmax(&logits);
                if logprobs.iter().all(|lp| *lp == f32::NEG_INFINITY) {
                    return Err(anyhow!("every token is masked, nothing to sample"));
                }
                let weights: Vec<f32> =
                    logprobs.iter().map(|lp| (lp / temperature).exp()).collect();
                let dist = WeightedIndex::new(&weights)
                    .map_err(|e| anyhow!("cannot sample next token: {e}"))?;
                let token = dist.sample(&mut rng) as u32;

                candidate.sum_logprob += logprobs[token as usize] as f64;
                candidate.tokens.push(token);
                if token == eot {
                    break;
                }
            }

            samples.push(strip(candidate, prompt_len, eot));
        }

        samples
            .into_iter()
            .max_by(|a, b| mean_logprob(a).total_cmp(&mean_logprob(b)))
            .ok_or_else(|| anyhow!("sampling produced no candidates"))
    }

    /// Mask logits that may not be sampled after `sampled` (tokens after the prompt).
    pub fn apply_filters(&self, logits: &mut [f32], sampled: &[u32]) {
        let vocab = logits.len();
        let tb = (self.specials.timestamp_begin as usize).min(vocab);
        let eot = self.specials.eot as usize;

        for &token in &self.suppress {
            if let Some(logit) = logits.get_mut(token as usize) {
                *logit = f32::NEG_INFINITY;
            }
        }

        // Blank start: neither a space nor an immediate end of text
        if sampled.is_empty() {
            if let Some(space) = self.specials.space {
                if let Some(logit) = logits.get_mut(space as usize) {
                    *logit = f32::NEG_INFINITY;
                }
            }
            if eot < vocab {
                logits[eot] = f32::NEG_INFINITY;
            }
        }

        self.apply_timestamp_rules(logits, sampled, tb, eot.min(vocab));
    }

    fn apply_timestamp_rules(&self, logits: &mut [f32], sampled: &[u32], tb: usize, eot: usize) {
        let specials = self.specials;
        let last_was_timestamp = sampled.last().is_some_and(|&t| specials.is_timestamp(t));
        let penultimate_was_timestamp =
            sampled.len() < 2 || specials.is_timestamp(sampled[sampled.len() - 2]);

        // Timestamps come in pairs: after a lone one, text is not allowed (only
        // another timestamp or the end); after a pair, a timestamp is not allowed
        if last_was_timestamp {
            if penultimate_was_timestamp {
                fill(&mut logits[tb..], f32::NEG_INFINITY);
            } else {
                fill(&mut logits[..eot], f32::NEG_INFINITY);
            }
        }

        // Timestamps never go backwards; a closing timestamp may repeat the opening one
        if let Some(&last_ts) = sampled.iter().rev().find(|&&t| specials.is_timestamp(t)) {
            let floor = if last_was_timestamp && !penultimate_was_timestamp {
                last_ts as usize
            } else {
                last_ts as usize + 1
            };
            let floor = floor.min(logits.len());
            if floor > tb {
                fill(&mut logits[tb..floor], f32::NEG_INFINITY);
            }
        }

        // The first sampled token is a timestamp no later than one second
        if sampled.is_empty() {
            fill(&mut logits[..tb], f32::NEG_INFINITY);
            let last_allowed = tb + MAX_INITIAL_TIMESTAMP_INDEX as usize;
            if last_allowed + 1 < logits.len() {
                fill(&mut logits[last_allowed + 1..], f32::NEG_INFINITY);
            }
        }

        // When the timestamps together are likelier than any text token, force one
        let logprobs = log_softmax(logits);
        let timestamp_logprob = log_sum_exp(&logprobs[tb..]);
        let max_text_logprob = logprobs[..tb].iter().copied().fold(f32::NEG_INFINITY, f32::max);
        if timestamp_logprob > max_text_logprob {
            fill(&mut logits[..tb], f32::NEG_INFINITY);
        }
    }
}

fn strip(mut candidate: Candidate, prompt_len: usize, eot: u32) -> Candidate {
    candidate.tokens.drain(..prompt_len);
    if let Some(pos) = candidate.tokens.iter().position(|&t| t == eot) {
        candidate.tokens.truncate(pos);
    }
    candidate
}

fn mean_logprob(candidate: &Candidate) -> f64 {
    candidate.sum_logprob / candidate.tokens.len().max(1) as f64
}

fn fill(values: &mut [f32], value: f32) {
    values.iter_mut().for_each(|v| *v = value);
}

/// Numerically stable log-softmax; an all `-inf` row stays `-inf`.
pub fn log_softmax(logits: &[f32]) -> Vec<f32> {
    let lse = log_sum_exp(logits);
    if lse == f32::NEG_INFINITY {
        return vec![f32::NEG_INFINITY; logits.len()];
    }
    logits.iter().map(|&l| l - lse).collect()
}

fn log_sum_exp(values: &[f32]) -> f32 {
    let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if max == f32::NEG_INFINITY {
        return f32::NEG_INFINITY;
    }
    let sum: f32 = values.iter().map(|&v| (v - max).exp()).sum();
    max + sum.ln()
}

/// The `k` most likely finite tokens, best first.
fn top_k(logprobs: &[f32], k: usize) -> Vec<(u32, f32)> {
    let mut indexed: Vec<(u32, f32)> = logprobs
        .iter()
        .enumerate()
        .filter(|(_, lp)| lp.is_finite())
        .map(|(i, &lp)| (i as u32, lp))
        .collect();
    indexed.sort_by(|a, b| b.1.total_cmp(&a.1));
    indexed.truncate(k);
    indexed
}

/// Segments of one window and how far the window cursor moves.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowSegments {
    pub segments: Vec<Segment>,
    /// Mel frames consumed by this window
    pub seek_frames: usize,
}

/// Split a window's tokens into time-stamped segments.
///
/// ## Parameters:
/// - **time_offset**: seconds from the start of the audio to the window start
/// - **segment_frames**: mel frames of real audio in the window
/// - **frames_per_timestamp**: mel frames per timestamp step (2 for Whisper)
/// - **detokenize**: renders text tokens (ids below end-of-text) as a string
pub fn split_segments(
    window: &DecodedWindow,
    specials: &SpecialTokens,
    time_offset: f64,
    segment_frames: usize,
    frames_per_timestamp: usize,
    detokenize: &dyn Fn(&[u32]) -> Result<String>,
) -> Result<WindowSegments> {
    let tokens = &window.tokens;
    let is_ts: Vec<bool> = tokens.iter().map(|&t| specials.is_timestamp(t)).collect();
    let ts_time = |t: u32| t.saturating_sub(specials.timestamp_begin) as f64 * TIME_PRECISION;

    let single_timestamp_ending =
        is_ts.len() >= 2 && !is_ts[is_ts.len() - 2] && is_ts[is_ts.len() - 1];

    let consecutive: Vec<usize> = (1..tokens.len()).filter(|&i| is_ts[i - 1] && is_ts[i]).collect();

    let mut segments = Vec::new();
    let mut make_segment = |slice: &[u32], start: f64, end: f64| -> Result<()> {
        let text_tokens: Vec<u32> = slice.iter().copied().filter(|&t| t < specials.eot).collect();
        let text = detokenize(&text_tokens)?;
        if end > start && !text.trim().is_empty() {
            segments.push(Segment {
                start,
                end,
                text,
                tokens: slice.to_vec(),
                avg_logprob: window.avg_logprob,
            });
        }
        Ok(())
    };

    let seek_frames = if !consecutive.is_empty() {
        let mut slices = consecutive.clone();
        if single_timestamp_ending {
            slices.push(tokens.len());
        }

        let mut last_slice = 0;
        for &current in &slices {
            let slice = &tokens[last_slice..current];
            let start = time_offset + ts_time(slice[0]);
            let end = time_offset + ts_time(slice[slice.len() - 1]);
            make_segment(slice, start, end)?;
            last_slice = current;
        }

        if single_timestamp_ending {
            segment_frames
        } else {
            // Resume from the last closed timestamp; the rest is decoded again
            let last_timestamp = tokens[last_slice - 1].saturating_sub(specials.timestamp_begin);
            let advance = last_timestamp as usize * frames_per_timestamp;
            if advance == 0 {
                segment_frames
            } else {
                advance.min(segment_frames)
            }
        }
    } else {
        let mut duration = segment_frames as f64 * TIME_PRECISION / frames_per_timestamp as f64;
        if let Some(&last_ts) = tokens.iter().rev().find(|&&t| specials.is_timestamp(t)) {
            if last_ts != specials.timestamp_begin {
                duration = ts_time(last_ts);
            }
        }
        make_segment(tokens, time_offset, time_offset + duration)?;
        segment_frames
    };

    Ok(WindowSegments { segments, seek_frames })
}

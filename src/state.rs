//! # Application State
//!
//! State shared by every request handler.
//!
//! ## What is shared:
//! - **config**: read once at startup, never changed (`Arc<AppConfig>`)
//! - **model**: the loaded speech model, read-only (`Arc<dyn SpeechModel>`)
//! - **metrics**: counters updated by middleware and the transcribe handler
//!   (`Arc<RwLock<AppMetrics>>`, the only mutable piece)
//!
//! The model is injected rather than global, so tests can hand in a stub.

use crate::config::AppConfig;
use crate::transcription::SpeechModel;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub model: Arc<dyn SpeechModel>,
    pub metrics: Arc<RwLock<AppMetrics>>,
    /// When the server started (never changes)
    pub start_time: Instant,
}

/// Counters collected across all HTTP requests.
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed since server start
    pub request_count: u64,

    /// Total number of 4xx/5xx responses since server start
    pub error_count: u64,

    /// Transcriptions currently running on the blocking pool
    pub active_transcriptions: u32,

    pub transcriptions_completed: u64,

    pub transcriptions_failed: u64,

    /// Sum of `duration_seconds` over completed transcriptions
    pub audio_seconds_transcribed: f64,

    /// Key: "METHOD /path"
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    pub fn new(config: AppConfig, model: Arc<dyn SpeechModel>) -> Self {
        Self {
            config: Arc::new(config),
            model,
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
        }
    }

    fn with_metrics<R>(&self, f: impl FnOnce(&mut AppMetrics) -> R) -> R {
        // Counters stay usable even if a writer panicked mid-update
        let mut metrics = self.metrics.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut metrics)
    }

    pub fn increment_request_count(&self) {
        self.with_metrics(|m| m.request_count += 1);
    }

    pub fn increment_error_count(&self) {
        self.with_metrics(|m| m.error_count += 1);
    }

    /// Record one request against its endpoint.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        self.with_metrics(|m| {
            let metric = m.endpoint_metrics.entry(endpoint.to_string()).or_default();
            metric.request_count += 1;
            metric.total_duration_ms += duration_ms;
            if is_error {
                metric.error_count += 1;
            }
        });
    }

    pub fn transcription_started(&self) {
        self.with_metrics(|m| m.active_transcriptions += 1);
    }

    /// Record the end of a transcription; `audio_seconds` is `None` on failure.
    pub fn transcription_finished(&self, audio_seconds: Option<f64>) {
        self.with_metrics(|m| {
            m.active_transcriptions = m.active_transcriptions.saturating_sub(1);
            match audio_seconds {
                Some(seconds) => {
                    m.transcriptions_completed += 1;
                    m.audio_seconds_transcribed += seconds;
                }
                None => m.transcriptions_failed += 1,
            }
        });
    }

    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Fraction of failed requests, 0.0 to 1.0.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::transcription::{DecodingOptions, SpeechModel, Transcript};
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;

    /// Speech model double: returns a canned result and records what it saw.
    pub struct StubModel {
        pub variant: String,
        pub result: Result<Transcript, String>,
        /// (path, file existed during the call, bytes read, options)
        pub calls: Mutex<Vec<(PathBuf, bool, Vec<u8>, DecodingOptions)>>,
    }

    impl StubModel {
        pub fn returning(transcript: Transcript) -> Self {
            Self {
                variant: "medium".to_string(),
                result: Ok(transcript),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn failing(message: &str) -> Self {
            Self {
                variant: "medium".to_string(),
                result: Err(message.to_string()),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    impl SpeechModel for StubModel {
        fn variant(&self) -> &str {
            &self.variant
        }

        fn transcribe(&self, path: &Path, options: &DecodingOptions) -> anyhow::Result<Transcript> {
            let bytes = std::fs::read(path).unwrap_or_default();
            self.calls
                .lock()
                .unwrap()
                .push((path.to_path_buf(), path.exists(), bytes, options.clone()));
            self.result.clone().map_err(|e| anyhow::anyhow!(e))
        }
    }
}

//! # Transcription Handler
//!
//! `POST /transcribe`: accepts one audio file as the multipart field `file` and
//! returns its Portuguese transcription.
//!
//! ## Request flow:
//! 1. Find the `file` field and check its declared content-type (400 on failure,
//!    before any bytes are read)
//! 2. Read the field and stage it to a temporary file
//! 3. Run the speech model on the blocking thread pool
//! 4. Map the transcript to a [`TranscriptionResponse`]
//!
//! Every failure after step 1 is a 500 carrying the underlying error text. The
//! staged file is removed on every path once the model is done with it.

use crate::error::{AppError, AppResult};
use crate::state::AppState;
use crate::transcription::{DecodingOptions, Transcript};
use crate::upload::{self, StagedUpload};
use actix_multipart::{Field, Multipart};
use actix_web::{http::header, web, HttpResponse};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{info, warn, Instrument};
use uuid::Uuid;

/// Name of the multipart field carrying the audio.
pub const FILE_FIELD: &str = "file";

/// Language reported when the model does not report one.
const DEFAULT_LANGUAGE: &str = "pt";

/// Characters of transcribed text included in the success log line.
const LOG_PREVIEW_CHARS: usize = 200;

/// JSON body of a successful transcription.
///
/// ```json
/// { "text": "olá mundo", "language": "pt", "duration_seconds": 2.5 }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptionResponse {
    pub text: String,
    pub language: String,
    /// End of the last segment, or 0.0 when nothing was recognized
    pub duration_seconds: f64,
}

impl TranscriptionResponse {
    /// Map raw model output to the response body.
    ///
    /// A non-finite segment end means the model produced garbage, which is
    /// reported as a transcription failure.
    pub fn from_transcript(transcript: Transcript) -> AppResult<Self> {
        let duration_seconds = match transcript.segments.last() {
            Some(segment) if !segment.end.is_finite() => {
                return Err(AppError::Transcription(format!(
                    "malformed result: segment end is {}",
                    segment.end
                )));
            }
            Some(segment) => segment.end,
            None => 0.0,
        };

        Ok(Self {
            text: transcript.text.trim().to_string(),
            language: transcript
                .language
                .unwrap_or_else(|| DEFAULT_LANGUAGE.to_string()),
            duration_seconds,
        })
    }
}

/// The `file` field after validation, read into memory.
struct AudioUpload {
    filename: Option<String>,
    bytes: Vec<u8>,
}

/// Transcribe an uploaded audio file.
///
/// ## Endpoint: `POST /transcribe`
///
/// ## Errors:
/// - 400 `invalid_upload`: no `file` field, or its content-type is neither
///   `audio/*` nor `application/octet-stream`
/// - 500 `transcription_error`: the upload could not be read or staged, the
///   model failed, or its result was malformed
pub async fn transcribe(state: web::Data<AppState>, payload: Multipart) -> AppResult<HttpResponse> {
    let request_id = Uuid::new_v4();
    let span = tracing::info_span!("transcribe", %request_id);

    async move {
        let max_bytes = state.config.upload.max_bytes;
        let Some(upload) = next_audio_field(payload, max_bytes).await? else {
            return Err(AppError::InvalidUpload(format!("missing '{}' field", FILE_FIELD)));
        };

        state.transcription_started();
        let result = process(&state, upload).await;
        state.transcription_finished(result.as_ref().ok().map(|r| r.duration_seconds));

        let response = result?;
        let preview: String = response.text.chars().take(LOG_PREVIEW_CHARS).collect();
        info!(
            chars = response.text.chars().count(),
            duration_seconds = response.duration_seconds,
            "Transcription completed: {}",
            preview
        );

        Ok(HttpResponse::Ok().json(response))
    }
    .instrument(span)
    .await
}

/// Scan the multipart stream for the `file` field.
///
/// Returns `Ok(None)` when the stream ends without one. The content-type check
/// happens before the field body is touched.
async fn next_audio_field(
    mut payload: Multipart,
    max_bytes: usize,
) -> AppResult<Option<AudioUpload>> {
    while let Some(field) = payload.next().await {
        let field = field.map_err(|e| AppError::InvalidUpload(e.to_string()))?;

        let is_file_field = field
            .content_disposition()
            .and_then(|cd| cd.get_name())
            .map_or(false, |name| name == FILE_FIELD);
        if !is_file_field {
            continue;
        }

        // The declared header verbatim: no case folding, no MIME parsing
        let content_type = field
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        if !upload::is_accepted_content_type(content_type.as_deref()) {
            warn!(content_type = ?content_type, "Rejected upload");
            return Err(AppError::InvalidUpload(upload::AUDIO_REQUIRED.to_string()));
        }

        let filename = field
            .content_disposition()
            .and_then(|cd| cd.get_filename())
            .map(str::to_owned);
        let bytes = read_field(field, max_bytes).await?;

        return Ok(Some(AudioUpload { filename, bytes }));
    }

    Ok(None)
}

async fn read_field(mut field: Field, max_bytes: usize) -> AppResult<Vec<u8>> {
    let mut bytes = Vec::new();
    while let Some(chunk) = field.next().await {
        let chunk =
            chunk.map_err(|e| AppError::Transcription(format!("cannot read upload: {}", e)))?;
        if bytes.len() + chunk.len() > max_bytes {
            return Err(AppError::Transcription(format!("upload exceeds {} bytes", max_bytes)));
        }
        bytes.extend_from_slice(&chunk);
    }
    Ok(bytes)
}

/// Stage, transcribe, map.
async fn process(state: &AppState, upload: AudioUpload) -> AppResult<TranscriptionResponse> {
    let staged = StagedUpload::create(
        state.config.upload.staging_dir.as_deref(),
        upload.filename.as_deref(),
        &upload.bytes,
    )
    .map_err(|e| AppError::Transcription(format!("{:#}", e)))?;
    drop(upload);

    info!(
        path = %staged.path().display(),
        model = state.model.variant(),
        "Transcribing staged upload"
    );

    // The staged file moves into the blocking job, so it outlives a dropped
    // client connection and is removed only when the model is finished.
    let model = state.model.clone();
    let outcome = web::block(move || {
        let result = model.transcribe(staged.path(), &DecodingOptions::portuguese());
        if let Err(e) = staged.cleanup() {
            warn!("Failed to remove staged upload: {:#}", e);
        }
        result
    })
    .await;

    match outcome {
        Ok(Ok(transcript)) => TranscriptionResponse::from_transcript(transcript),
        Ok(Err(e)) => Err(AppError::Transcription(format!("{:#}", e))),
        Err(e) => Err(AppError::Transcription(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::state::test_support::StubModel;
    use crate::transcription::{Segment, Task};
    use actix_web::http::StatusCode;
    use actix_web::{test as actix_test, App};
    use serde_json::Value;
    use std::path::Path;
    use std::sync::Arc;
    use tempfile::TempDir;

    const BOUNDARY: &str = "----icu-whisper-test-boundary";

    fn segment(start: f64, end: f64, text: &str) -> Segment {
        Segment {
            start,
            end,
            text: text.to_string(),
            tokens: Vec::new(),
            avg_logprob: -0.1,
        }
    }

    fn transcript(text: &str, language: Option<&str>, segments: Vec<Segment>) -> Transcript {
        Transcript {
            text: text.to_string(),
            language: language.map(str::to_string),
            segments,
        }
    }

    fn multipart_body(
        field: &str,
        filename: &str,
        content_type: Option<&str>,
        data: &[u8],
    ) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
        body.extend_from_slice(
            format!(
                "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n",
                field, filename
            )
            .as_bytes(),
        );
        if let Some(ct) = content_type {
            body.extend_from_slice(format!("Content-Type: {}\r\n", ct).as_bytes());
        }
        body.extend_from_slice(b"\r\n");
        body.extend_from_slice(data);
        body.extend_from_slice(format!("\r\n--{}--\r\n", BOUNDARY).as_bytes());
        body
    }

    fn state_with(model: Arc<StubModel>, staging: &Path, max_bytes: usize) -> AppState {
        let mut config = AppConfig::default();
        config.upload.staging_dir = Some(staging.to_path_buf());
        config.upload.max_bytes = max_bytes;
        AppState::new(config, model)
    }

    async fn post(state: AppState, body: Vec<u8>) -> (StatusCode, Value) {
        let app = actix_test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/transcribe", web::post().to(transcribe)),
        )
        .await;

        let req = actix_test::TestRequest::post()
            .uri("/transcribe")
            .insert_header((
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={}", BOUNDARY),
            ))
            .set_payload(body)
            .to_request();
        let resp = actix_test::call_service(&app, req).await;
        let status = resp.status();
        let json: Value = actix_test::read_body_json(resp).await;
        (status, json)
    }

    fn staged_files(dir: &Path) -> usize {
        std::fs::read_dir(dir).unwrap().count()
    }

    #[actix_web::test]
    async fn test_transcribes_wav_upload() {
        let staging = TempDir::new().unwrap();
        let model = Arc::new(StubModel::returning(transcript(
            "  olá mundo  ",
            Some("pt"),
            vec![segment(0.0, 1.2, " olá"), segment(1.2, 2.5, " mundo")],
        )));
        let state = state_with(model.clone(), staging.path(), 1024);

        let body = multipart_body("file", "sample.wav", Some("audio/wav"), b"RIFF....WAVE");
        let (status, json) = post(state.clone(), body).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["text"], "olá mundo");
        assert_eq!(json["language"], "pt");
        assert_eq!(json["duration_seconds"], 2.5);

        let calls = model.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        let (path, existed, bytes, options) = &calls[0];
        assert!(existed, "staged file must exist while the model runs");
        assert_eq!(bytes, b"RIFF....WAVE");
        assert!(path.to_string_lossy().ends_with("_sample.wav"));
        assert_eq!(path.parent().unwrap(), staging.path());
        assert_eq!(options.language, "pt");
        assert_eq!(options.task, Task::Transcribe);
        assert_eq!(options.beam_size, 5);
        assert_eq!(options.best_of, 5);
        assert_eq!(options.temperature, 0.0);
        assert!(!options.fp16);

        assert_eq!(staged_files(staging.path()), 0);
        let metrics = state.get_metrics_snapshot();
        assert_eq!(metrics.transcriptions_completed, 1);
        assert_eq!(metrics.audio_seconds_transcribed, 2.5);
    }

    #[actix_web::test]
    async fn test_octet_stream_without_segments() {
        let staging = TempDir::new().unwrap();
        let model = Arc::new(StubModel::returning(transcript("teste", None, Vec::new())));
        let state = state_with(model, staging.path(), 1024);

        let body = multipart_body(
            "file",
            "clip.bin",
            Some("application/octet-stream"),
            b"\x00\x01\x02",
        );
        let (status, json) = post(state, body).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["text"], "teste");
        assert_eq!(json["language"], "pt");
        assert_eq!(json["duration_seconds"], 0.0);
        assert_eq!(staged_files(staging.path()), 0);
    }

    #[actix_web::test]
    async fn test_reported_language_passed_through() {
        let staging = TempDir::new().unwrap();
        let model = Arc::new(StubModel::returning(transcript(
            "hello",
            Some("en"),
            vec![segment(0.0, 0.8, "hello")],
        )));
        let (status, json) = post(
            state_with(model, staging.path(), 1024),
            multipart_body("file", "a.mp3", Some("audio/mpeg"), b"ID3"),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["language"], "en");
        assert_eq!(json["duration_seconds"], 0.8);
    }

    #[actix_web::test]
    async fn test_rejects_non_audio_content_type() {
        let staging = TempDir::new().unwrap();
        let model = Arc::new(StubModel::returning(Transcript::default()));
        let state = state_with(model.clone(), staging.path(), 1024);

        let body = multipart_body("file", "notes.txt", Some("text/plain"), b"not audio");
        let (status, json) = post(state, body).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"]["type"], "invalid_upload");
        assert!(json["error"]["message"]
            .as_str()
            .unwrap()
            .contains("file must be audio"));
        assert!(model.calls.lock().unwrap().is_empty());
        assert_eq!(staged_files(staging.path()), 0);
    }

    #[actix_web::test]
    async fn test_content_type_checked_as_declared() {
        for (content_type, expected) in [
            ("AUDIO/WAV", StatusCode::BAD_REQUEST),
            ("Audio/Wav", StatusCode::BAD_REQUEST),
            ("audio/x wav", StatusCode::OK),
            ("audio/webm;codecs=opus", StatusCode::OK),
            ("audio/wav", StatusCode::OK),
        ] {
            let staging = TempDir::new().unwrap();
            let model = Arc::new(StubModel::returning(transcript("ok", None, Vec::new())));
            let (status, _) = post(
                state_with(model, staging.path(), 1024),
                multipart_body("file", "a.wav", Some(content_type), b"RIFF"),
            )
            .await;

            assert_eq!(status, expected, "content-type {content_type}");
            assert_eq!(staged_files(staging.path()), 0);
        }
    }

    #[actix_web::test]
    async fn test_rejects_missing_content_type() {
        let staging = TempDir::new().unwrap();
        let model = Arc::new(StubModel::returning(Transcript::default()));
        let (status, _) = post(
            state_with(model.clone(), staging.path(), 1024),
            multipart_body("file", "a.wav", None, b"RIFF"),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(model.calls.lock().unwrap().is_empty());
    }

    #[actix_web::test]
    async fn test_rejects_missing_file_field() {
        let staging = TempDir::new().unwrap();
        let model = Arc::new(StubModel::returning(Transcript::default()));
        let (status, json) = post(
            state_with(model.clone(), staging.path(), 1024),
            multipart_body("audio", "a.wav", Some("audio/wav"), b"RIFF"),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(json["error"]["message"].as_str().unwrap().contains("file"));
        assert!(model.calls.lock().unwrap().is_empty());
        assert_eq!(staged_files(staging.path()), 0);
    }

    #[actix_web::test]
    async fn test_model_failure_is_500_and_cleans_up() {
        let staging = TempDir::new().unwrap();
        let model = Arc::new(StubModel::failing("unsupported codec"));
        let state = state_with(model.clone(), staging.path(), 1024);

        let (status, json) = post(
            state.clone(),
            multipart_body("file", "a.ogg", Some("audio/ogg"), b"OggS"),
        )
        .await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json["error"]["type"], "transcription_error");
        assert!(json["error"]["message"]
            .as_str()
            .unwrap()
            .contains("unsupported codec"));
        assert!(model.calls.lock().unwrap()[0].1);
        assert_eq!(staged_files(staging.path()), 0);
        assert_eq!(state.get_metrics_snapshot().transcriptions_failed, 1);
    }

    #[actix_web::test]
    async fn test_non_finite_segment_end_is_500() {
        let staging = TempDir::new().unwrap();
        let model = Arc::new(StubModel::returning(transcript(
            "x",
            Some("pt"),
            vec![segment(0.0, f64::NAN, "x")],
        )));
        let (status, json) = post(
            state_with(model, staging.path(), 1024),
            multipart_body("file", "a.wav", Some("audio/wav"), b"RIFF"),
        )
        .await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(json["error"]["message"]
            .as_str()
            .unwrap()
            .contains("malformed result"));
        assert_eq!(staged_files(staging.path()), 0);
    }

    #[actix_web::test]
    async fn test_oversized_upload_is_500() {
        let staging = TempDir::new().unwrap();
        let model = Arc::new(StubModel::returning(Transcript::default()));
        let (status, json) = post(
            state_with(model.clone(), staging.path(), 4),
            multipart_body("file", "a.wav", Some("audio/wav"), b"0123456789"),
        )
        .await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(json["error"]["message"].as_str().unwrap().contains("exceeds"));
        assert!(model.calls.lock().unwrap().is_empty());
        assert_eq!(staged_files(staging.path()), 0);
    }

    #[test]
    fn test_response_mapping() {
        let response = TranscriptionResponse::from_transcript(transcript(
            "\n texto \t",
            None,
            vec![segment(0.0, 3.0, "a"), segment(3.0, 7.25, "b")],
        ))
        .unwrap();
        assert_eq!(response.text, "texto");
        assert_eq!(response.language, "pt");
        assert_eq!(response.duration_seconds, 7.25);

        assert!(TranscriptionResponse::from_transcript(transcript(
            "",
            None,
            vec![segment(0.0, f64::INFINITY, "")],
        ))
        .is_err());
    }
}

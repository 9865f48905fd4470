//! # Upload Validation and Staging
//!
//! The speech model reads audio from a filesystem path, so every accepted
//! upload is written to a uniquely named temporary file first.
//!
//! ## Lifecycle:
//! A [`StagedUpload`] owns its file. Dropping it deletes the file, whichever
//! way the request ends, and a file that is already gone is not an error.

use anyhow::{Context, Result};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Content-type accepted from clients that do not know the precise audio type.
pub const GENERIC_BINARY: &str = "application/octet-stream";

/// Message returned when an upload does not declare an audio content-type.
pub const AUDIO_REQUIRED: &str = "file must be audio (audio/* or application/octet-stream)";

/// Whether a declared content-type is acceptable for transcription.
///
/// `audio/*` is accepted, as is the generic binary type. Anything else,
/// including a missing content-type, is rejected.
pub fn is_accepted_content_type(content_type: Option<&str>) -> bool {
    match content_type {
        Some(ct) => ct.starts_with("audio/") || ct == GENERIC_BINARY,
        None => false,
    }
}

/// Reduce a client-supplied filename to something safe to embed in a temp
/// file name: the final path component, restricted to a conservative charset.
pub fn sanitize_filename(filename: Option<&str>) -> String {
    let name = filename
        .and_then(|f| f.rsplit(['/', '\\']).next())
        .unwrap_or("");

    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .take(100)
        .collect();

    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "upload".to_string()
    } else {
        cleaned.to_string()
    }
}

/// An upload written to a temporary file for the duration of one request.
#[derive(Debug)]
pub struct StagedUpload {
    file: NamedTempFile,
}

impl StagedUpload {
    /// Write `bytes` to a new temporary file named `upload-<random>_<filename>`.
    ///
    /// ## Parameters:
    /// - **dir**: staging directory, or the system temp dir when `None`
    /// - **filename**: client filename, sanitized before use
    pub fn create(dir: Option<&Path>, filename: Option<&str>, bytes: &[u8]) -> Result<Self> {
        let suffix = format!("_{}", sanitize_filename(filename));
        let mut builder = tempfile::Builder::new();
        builder.prefix("upload-").suffix(&suffix);

        let mut file = match dir {
            Some(dir) => builder.tempfile_in(dir),
            None => builder.tempfile(),
        }
        .context("cannot create staging file")?;

        file.write_all(bytes).context("cannot write staging file")?;
        file.flush().context("cannot flush staging file")?;

        tracing::debug!("Staged {} bytes at {}", bytes.len(), file.path().display());
        Ok(Self { file })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Remove the staged file now and report the outcome. Dropping the value
    /// has the same effect but swallows errors.
    pub fn cleanup(self) -> Result<()> {
        let path: PathBuf = self.file.path().to_path_buf();
        match self.file.close() {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("cannot remove {}", path.display())),
        }
    }
}

//! # Configuration Management
//!
//! Configuration is read once at startup and never mutated afterwards. Sources,
//! highest priority first:
//! 1. `WHISPER_MODEL`, `PORT` and `HOST` environment variables
//! 2. Environment variables with the `APP_` prefix (`APP_MODEL__DEVICE=cpu`)
//! 3. An optional `config.toml` in the working directory
//! 4. Default values (defined in the Default impl)

use crate::device::DevicePreference;
use crate::transcription::ModelVariant;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

/// Main application configuration.
///
/// ## Why separate config structs:
/// Grouping settings (server, model, upload) keeps each concern readable and
/// maps one-to-one onto the `[server]`, `[model]` and `[upload]` TOML tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub model: ModelConfig,
    pub upload: UploadConfig,
}

/// Where the HTTP server listens.
///
/// - `host = "0.0.0.0"`: accept connections on every interface (the default,
///   the service normally runs inside a container)
/// - `port = 8080`: overridden by `PORT`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Speech model settings.
///
/// ## Fields:
/// - `variant`: Whisper variant to load at startup ("tiny" ... "large-v3", "turbo").
///   Overridden by `WHISPER_MODEL`.
/// - `device`: compute device preference ("auto", "cpu", "cuda", "metal")
/// - `revision`: Hugging Face revision of the model repository
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub variant: String,
    pub device: String,
    pub revision: String,
}

/// Upload handling limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Largest accepted upload body, in bytes
    pub max_bytes: usize,
    /// Directory for staged uploads; the system temp dir when unset
    pub staging_dir: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
            },
            model: ModelConfig {
                variant: "medium".to_string(),  // Good accuracy on Portuguese clinical vocabulary
                device: "auto".to_string(),
                revision: "main".to_string(),
            },
            upload: UploadConfig {
                max_bytes: 100 * 1024 * 1024,
                staging_dir: None,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from every source in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `WHISPER_MODEL=large-v3`: model variant (plain name, as deployments set it)
    /// - `PORT=3000`: listening port
    /// - `APP_UPLOAD__MAX_BYTES=10485760`: nested key `upload.max_bytes`
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__"),
            );

        if let Ok(variant) = env::var("WHISPER_MODEL") {
            settings = settings.set_override("model.variant", variant)?;
        }

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// An unknown model variant is caught here so the process fails before any
    /// download starts.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        self.model_variant()?;

        self.model
            .device
            .parse::<DevicePreference>()
            .map_err(|e| anyhow::anyhow!(e))?;

        if self.upload.max_bytes == 0 {
            return Err(anyhow::anyhow!("Upload size limit must be greater than 0"));
        }

        Ok(())
    }

    /// The configured model variant, parsed.
    pub fn model_variant(&self) -> Result<ModelVariant> {
        self.model.variant.parse()
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

//! # ICU Whisper API - Main Application Entry Point
//!
//! HTTP service that transcribes Portuguese audio with a Whisper model.
//!
//! ## Startup order:
//! 1. Load `.env`, set up tracing
//! 2. Load and validate configuration
//! 3. Download (if needed) and load the Whisper model; any failure exits the
//!    process before the server binds
//! 4. Serve `/`, `/health`, `/metrics` and `/transcribe` until SIGINT/SIGTERM
//!
//! ## Application Architecture:
//! - **config**: configuration (defaults, `config.toml`, environment)
//! - **state**: shared state: config, the loaded model, metrics
//! - **health**: status and metrics endpoints
//! - **middleware**: request logging and per-endpoint metrics
//! - **handlers**: the transcription endpoint
//! - **upload**: upload validation and temp-file staging
//! - **device**: compute device selection
//! - **transcription**: the speech model (Whisper on Candle)
//! - **error**: error types and their HTTP responses

mod config;
mod device;
mod error;
mod handlers;
mod health;
mod middleware;
mod state;
mod transcription;
mod upload;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use config::AppConfig;
use device::DevicePreference;
use state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use transcription::WhisperModel;

/// Set once a shutdown signal arrives.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting icu-whisper-api v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Configuration loaded: {} (model {}, device {})",
        config.bind_addr(),
        config.model.variant,
        config.model.device
    );

    let preference: DevicePreference = config
        .model
        .device
        .parse()
        .map_err(|e: String| anyhow::anyhow!(e))?;
    let device = preference.resolve();
    info!("Using {} for inference", device::describe(&device));

    // The server must not accept requests before the model is ready
    let model = WhisperModel::load(&config.model.variant, &config.model.revision, device)
        .await
        .with_context(|| format!("failed to load Whisper model '{}'", config.model.variant))?;

    let bind_addr = config.bind_addr();
    let app_state = AppState::new(config, Arc::new(model));

    setup_signal_handlers();

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .wrap(TracingLogger::default())
            .route("/", web::get().to(health::root))
            .route("/health", web::get().to(health::health_check))
            .route("/metrics", web::get().to(health::detailed_metrics))
            .route("/transcribe", web::post().to(handlers::transcribe))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(Err(e)) => error!("Server error: {}", e),
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// `RUST_LOG` controls verbosity; defaults to
/// `icu_whisper_api=debug,actix_web=info`.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "icu_whisper_api=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .context("failed to initialise tracing")?;

    Ok(())
}

fn setup_signal_handlers() {
    tokio::spawn(async {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    error!("Failed to install SIGTERM handler: {}", e);
                    return;
                }
            };

            tokio::select! {
                _ = sigterm.recv() => info!("Received SIGTERM"),
                _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
            }
        }

        #[cfg(not(unix))]
        {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {}", e);
                return;
            }
            info!("Received Ctrl+C");
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}

//! # Service Status Endpoints
//!
//! Read-only endpoints that never touch the model:
//! - `GET /`: liveness banner
//! - `GET /health`: status plus the loaded model variant
//! - `GET /metrics`: request and transcription counters, uptime, memory

use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

/// Service name reported by `GET /`.
pub const SERVICE_NAME: &str = "icu-whisper-api";

pub async fn root() -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "service": SERVICE_NAME,
        "status": "running"
    }))
}

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "model": state.model.variant()
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();

    let mut endpoint_stats: Vec<_> = metrics
        .endpoint_metrics
        .iter()
        .map(|(endpoint, metric)| {
            json!({
                "endpoint": endpoint,
                "request_count": metric.request_count,
                "error_count": metric.error_count,
                "error_rate": metric.error_rate(),
                "average_duration_ms": metric.average_duration_ms(),
                "total_duration_ms": metric.total_duration_ms
            })
        })
        .collect();
    endpoint_stats.sort_by(|a, b| a["endpoint"].as_str().cmp(&b["endpoint"].as_str()));

    let finished = metrics.transcriptions_completed + metrics.transcriptions_failed;

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "service": {
            "name": SERVICE_NAME,
            "version": env!("CARGO_PKG_VERSION"),
            "model": state.model.variant()
        },
        "overall": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": if metrics.request_count > 0 {
                metrics.error_count as f64 / metrics.request_count as f64
            } else {
                0.0
            }
        },
        "transcriptions": {
            "active": metrics.active_transcriptions,
            "completed": metrics.transcriptions_completed,
            "failed": metrics.transcriptions_failed,
            "failure_rate": if finished > 0 {
                metrics.transcriptions_failed as f64 / finished as f64
            } else {
                0.0
            },
            "audio_seconds": metrics.audio_seconds_transcribed
        },
        "endpoints": endpoint_stats,
        "memory": get_memory_info()
    }))
}

fn get_memory_info() -> serde_json::Value {
    #[cfg(target_os = "linux")]
    {
        let status_path = format!("/proc/{}/status", std::process::id());
        if let Ok(status) = std::fs::read_to_string(status_path) {
            let read_kb = |prefix: &str| {
                status
                    .lines()
                    .find(|line| line.starts_with(prefix))
                    .and_then(|line| line.split_whitespace().nth(1))
                    .and_then(|kb| kb.parse::<u64>().ok())
                    .unwrap_or(0)
                    * 1024
            };

            return json!({
                "resident_memory_bytes": read_kb("VmRSS:"),
                "virtual_memory_bytes": read_kb("VmSize:"),
                "available": true
            });
        }
    }

    json!({
        "resident_memory_bytes": 0,
        "virtual_memory_bytes": 0,
        "available": false,
        "note": "Memory info not available on this platform"
    })
}

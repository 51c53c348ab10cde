use crate::audio::SourceOptions;
use crate::config::AppConfig;
use crate::state::{AppState, ConversationMetrics};
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = state.get_config();
    let uptime_seconds = state.get_uptime_seconds();

    let format = config.audio.format();
    let source = SourceOptions::from_settings(&config.audio);

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "conversations": {
            "active": metrics.active,
            "total": metrics.total,
            "rejected": metrics.rejected,
            "outcomes": &metrics.outcomes
        },
        "audio": {
            "format": format,
            "bytes_per_second": format.bytes_per_second(),
            "window_seconds": config.audio.window_seconds,
            "buffer_capacity_bytes": source.capacity
        },
        "system": get_system_status(config, &metrics)
    }))
}

fn get_system_status(config: &AppConfig, metrics: &ConversationMetrics) -> serde_json::Value {
    let max_sessions = config.performance.max_concurrent_sessions;
    let session_usage = if max_sessions > 0 {
        metrics.active as f64 / max_sessions as f64
    } else {
        0.0
    };

    let status = if session_usage >= 1.0 {
        "at_capacity"
    } else if session_usage > 0.7 {
        "moderate_load"
    } else {
        "normal"
    };

    json!({
        "status": status,
        "session_usage_percent": (session_usage * 100.0).round(),
        "max_sessions": max_sessions,
        "current_sessions": metrics.active
    })
}

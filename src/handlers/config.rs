use crate::{config::AppConfig, error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// Configuration as the API shows it: the credential is reported, never echoed.
fn redacted(config: &AppConfig) -> serde_json::Value {
    json!({
        "server": {
            "host": config.server.host,
            "port": config.server.port
        },
        "live": {
            "endpoint": config.live.endpoint,
            "api_key": {
                "configured": !config.live.api_key.is_empty()
            },
            "model": config.live.model,
            "voice_name": config.live.voice_name,
            "system_instruction": config.live.system_instruction,
            "connect_timeout_ms": config.live.connect_timeout_ms
        },
        "audio": {
            "capture_sample_rate": config.audio.capture_sample_rate,
            "capture_window": config.audio.capture_window,
            "playback_sample_rate": config.audio.playback_sample_rate,
            "volume_scale": config.audio.volume_scale,
            "volume_max": config.audio.volume_max
        }
    })
}

pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": redacted(&config)
    })))
}

/// Partial update; takes effect for the next session.
pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> Result<HttpResponse, AppError> {
    let json_str = serde_json::to_string(&body.into_inner())?;

    let mut current_config = state.get_config();
    current_config
        .update_from_json(&json_str)
        .map_err(|e| AppError::ValidationError(e.to_string()))?;

    state.update_config(current_config.clone())?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated successfully",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": redacted(&current_config)
    })))
}

use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let config = state.get_config();
    let session = state.sessions.snapshot();

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": state.get_uptime_seconds(),
        "service": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "metrics": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": metrics.error_rate(),
            "websocket_clients": metrics.websocket_clients
        },
        "memory": get_memory_info(),
        "live": {
            "model": config.live.model,
            "voice_name": config.live.voice_name,
            "api_key_configured": !config.live.api_key.is_empty()
        },
        "session": {
            "status": session.status,
            "session_id": session.session_id,
            "last_error": session.last_error
        }
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();
    let session = state.sessions.snapshot();

    let mut endpoint_stats = Vec::new();
    for (endpoint, metric) in metrics.endpoint_metrics.iter() {
        endpoint_stats.push(json!({
            "endpoint": endpoint,
            "request_count": metric.request_count,
            "error_count": metric.error_count,
            "error_rate": metric.error_rate(),
            "average_duration_ms": metric.average_duration_ms(),
            "total_duration_ms": metric.total_duration_ms
        }));
    }

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "overall": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": metrics.error_rate(),
            "websocket_clients": metrics.websocket_clients,
            "requests_per_second": if uptime_seconds > 0 {
                metrics.request_count as f64 / uptime_seconds as f64
            } else {
                0.0
            }
        },
        "endpoints": endpoint_stats,
        "memory": get_memory_info(),
        "session": {
            "status": session.status,
            "stats": session.stats
        }
    }))
}

#[cfg(target_os = "linux")]
fn get_memory_info() -> serde_json::Value {
    let pid = std::process::id();
    let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", pid)) else {
        return json!({ "available": false });
    };

    let mut vm_rss = 0;
    let mut vm_size = 0;
    for line in status.lines() {
        let kb = || {
            line.split_whitespace()
                .nth(1)
                .and_then(|kb_str| kb_str.parse::<u64>().ok())
                .unwrap_or(0)
                * 1024
        };
        if line.starts_with("VmRSS:") {
            vm_rss = kb();
        } else if line.starts_with("VmSize:") {
            vm_size = kb();
        }
    }

    json!({
        "resident_memory_bytes": vm_rss,
        "virtual_memory_bytes": vm_size,
        "available": true
    })
}

#[cfg(not(target_os = "linux"))]
fn get_memory_info() -> serde_json::Value {
    json!({
        "resident_memory_bytes": 0,
        "virtual_memory_bytes": 0,
        "available": false,
        "note": "Memory info not available on this platform"
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::testing::test_state;
    use actix_web::{test, App};

    #[actix_web::test]
    async fn test_health_reports_idle_session() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(test_state()))
                .route("/health", web::get().to(health_check)),
        )
        .await;

        let req = test::TestRequest::get().uri("/health").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["status"], "healthy");
        assert_eq!(body["session"]["status"], "idle");
        assert_eq!(body["live"]["api_key_configured"], false);
    }

    #[actix_web::test]
    async fn test_metrics_lists_session_stats() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(test_state()))
                .route("/api/v1/metrics", web::get().to(detailed_metrics)),
        )
        .await;

        let req = test::TestRequest::get().uri("/api/v1/metrics").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        assert_eq!(body["session"]["stats"]["frames_sent"], 0);
        assert!(body["endpoints"].as_array().unwrap().is_empty());
    }
}

//! REST control of the streaming session.
//!
//! The same operations are available on `/ws/session`; these endpoints suit scripts
//! and one-shot clients that do not want to hold a socket open.

use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use tracing::info;

/// `POST /api/v1/session/start`
///
/// Answers `202 Accepted` with the `connecting` snapshot. Whether the endpoint then
/// acknowledges shows up on `GET /api/v1/session` or the control WebSocket.
pub async fn start_session(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = state.get_config();
    let snapshot = state.sessions.start(&config).await?;

    info!(session_id = ?snapshot.session_id, "session start accepted");
    Ok(HttpResponse::Accepted().json(snapshot))
}

/// `POST /api/v1/session/stop`, safe to repeat.
pub async fn stop_session(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let snapshot = state.sessions.stop().await;
    Ok(HttpResponse::Ok().json(snapshot))
}

pub async fn get_session(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(state.sessions.snapshot())
}

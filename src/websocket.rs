//! # Session Control WebSocket
//!
//! Clients connect to `/ws/session` to drive the streaming session and watch it live:
//! every snapshot change (status, microphone level, traffic counters, last error) is
//! pushed as it happens, which is what a start/stop button with a level meter needs.
//!
//! ## WebSocket Protocol:
//! 1. **Connection**: the current snapshot is sent immediately
//! 2. **Commands**: `start_session`, `end_session`, `ping`
//! 3. **Updates**: `session_status` on every change, `error` when a command fails
//! 4. **Heartbeat**: server pings every 30s and drops clients silent for 60s
//!
//! ## Message Format:
//! JSON text frames tagged by `type`, e.g. `{"type": "start_session"}`.

use crate::audio::session::SessionSnapshot;
use crate::error::AppError;
use crate::state::AppState;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, error, info, warn};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Commands a client may send.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlRequest {
    /// Acquire the devices and connect to the live endpoint
    StartSession,
    /// Stop the running session (idempotent)
    EndSession,
    /// Latency check, answered with `pong`
    Ping { timestamp: u64 },
    /// Answer to a server heartbeat
    Pong { timestamp: u64 },
}

/// Messages the server pushes.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlEvent {
    /// The full session snapshot
    SessionStatus(SessionSnapshot),
    /// A command failed
    Error { code: String, message: String },
    Ping { timestamp: u64 },
    Pong { timestamp: u64 },
}

impl From<&AppError> for ControlEvent {
    fn from(err: &AppError) -> Self {
        ControlEvent::Error {
            code: err.kind().to_string(),
            message: err.message().to_string(),
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// One control connection.
///
/// ## Actor Model:
/// Each connection is an independent actor. Snapshot changes reach it as a stream
/// (`WatchStream`), so a slow client never holds up the session task.
pub struct SessionWebSocket {
    state: web::Data<AppState>,
    last_heartbeat: Instant,
}

impl SessionWebSocket {
    pub fn new(state: web::Data<AppState>) -> Self {
        Self {
            state,
            last_heartbeat: Instant::now(),
        }
    }

    fn send(&self, ctx: &mut ws::WebsocketContext<Self>, event: &ControlEvent) {
        match serde_json::to_string(event) {
            Ok(json) => ctx.text(json),
            Err(err) => error!(error = %err, "failed to serialize control event"),
        }
    }

    fn handle_request(&mut self, request: ControlRequest, ctx: &mut ws::WebsocketContext<Self>) {
        match request {
            ControlRequest::StartSession => {
                let sessions = self.state.sessions.clone();
                let config = self.state.get_config();
                let start = async move { sessions.start(&config).await }
                    .into_actor(self)
                    .map(|result, act, ctx| {
                        // Success is reported through the snapshot stream
                        if let Err(err) = result {
                            warn!(error = %err, "start_session rejected");
                            act.send(ctx, &ControlEvent::from(&err));
                        }
                    });
                ctx.spawn(start);
            }
            ControlRequest::EndSession => {
                let sessions = self.state.sessions.clone();
                let stop = async move {
                    sessions.stop().await;
                }
                .into_actor(self);
                ctx.spawn(stop);
            }
            ControlRequest::Ping { timestamp } => {
                self.send(ctx, &ControlEvent::Pong { timestamp });
            }
            ControlRequest::Pong { .. } => {
                self.last_heartbeat = Instant::now();
            }
        }
    }
}

impl Actor for SessionWebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!("control WebSocket connected");
        self.state.increment_websocket_clients();

        // Yields the current snapshot first, then every change
        ctx.add_stream(WatchStream::new(self.state.sessions.subscribe()));

        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!("control WebSocket heartbeat timeout, closing connection");
                ctx.stop();
                return;
            }
            ctx.ping(b"");
            act.send(ctx, &ControlEvent::Ping { timestamp: now_millis() });
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!("control WebSocket disconnected");
        self.state.decrement_websocket_clients();
    }
}

/// Snapshot updates from the session manager.
impl StreamHandler<SessionSnapshot> for SessionWebSocket {
    fn handle(&mut self, snapshot: SessionSnapshot, ctx: &mut Self::Context) {
        self.send(ctx, &ControlEvent::SessionStatus(snapshot));
    }

    // The snapshot stream only ends at shutdown; the socket decides its own lifetime
    fn finished(&mut self, _ctx: &mut Self::Context) {
        debug!("snapshot stream ended");
    }
}

/// Frames from the client.
impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for SessionWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => {
                self.last_heartbeat = Instant::now();
                match serde_json::from_str::<ControlRequest>(&text) {
                    Ok(request) => self.handle_request(request, ctx),
                    Err(err) => {
                        let err = AppError::BadRequest(format!("Invalid JSON: {}", err));
                        self.send(ctx, &ControlEvent::from(&err));
                    }
                }
            }
            Ok(ws::Message::Binary(_)) => {
                let err = AppError::BadRequest("binary frames are not accepted".to_string());
                self.send(ctx, &ControlEvent::from(&err));
            }
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(reason = ?reason, "control WebSocket closed by client");
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!("Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(error = %err, "WebSocket protocol error");
                ctx.stop();
            }
        }
    }
}

/// WebSocket endpoint handler.
///
/// ## HTTP to WebSocket Upgrade:
/// Upgrades the request and hands the connection to a `SessionWebSocket` actor.
pub async fn session_websocket(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    debug!(peer = ?req.connection_info().peer_addr(), "control WebSocket upgrade requested");
    ws::start(SessionWebSocket::new(state), &req, stream)
}

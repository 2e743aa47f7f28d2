//! # Live Wire Backend - Main Application Entry Point
//!
//! A local voice-link daemon: it captures the microphone, streams it to a live-audio
//! endpoint over a WebSocket and plays the spoken replies back gaplessly. A small
//! HTTP + WebSocket surface starts and stops the session and reports its state.
//!
//! ## Key Rust Concepts Used:
//! - **async/await**: HTTP handling and the session loop run on the tokio runtime
//! - **traits as seams**: audio devices and the live channel sit behind traits, so the
//!   pipeline runs against fakes in tests
//! - **Result<T, E>**: errors propagate with `?` up to `main`
//!
//! ## Application Architecture:
//! - **config**: layered configuration (defaults, `config.toml`, environment)
//! - **state**: shared configuration, request metrics and the session manager
//! - **health**: health and metrics endpoints
//! - **middleware**: per-endpoint request metrics
//! - **handlers**: configuration and session REST endpoints
//! - **websocket**: the `/ws/session` control socket
//! - **device**: cpal microphone and speaker streams
//! - **audio**: capture encoding, playback scheduling, the streaming session
//! - **live**: the remote live-audio protocol and channel
//! - **error**: error taxonomy and HTTP error responses

mod audio;
mod config;
mod device;
mod error;
mod handlers;
mod health;
mod live;
mod middleware;
mod state;
mod websocket;

use actix_cors::Cors;
use actix_web::dev::ServerHandle;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use audio::session::SessionManager;
use config::AppConfig;
use device::CpalBackend;
use live::channel::WebSocketConnector;
use state::AppState;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// The main application entry point.
///
/// ## What this function does:
/// 1. **Loads configuration** from files and environment variables
/// 2. **Sets up logging**
/// 3. **Wires the session manager** to the real sound card and live endpoint
/// 4. **Serves HTTP** until the server exits or a shutdown signal arrives
/// 5. **Stops the session** so the microphone and speaker are released
#[actix_web::main]
async fn main() -> Result<()> {
    // A missing .env file is fine
    dotenv::dotenv().ok();

    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting live-wire-backend v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);
    info!(model = %config.live.model, voice = %config.live.voice_name, "live endpoint configured");
    if config.live.api_key.is_empty() {
        warn!("No API key configured; set API_KEY or GEMINI_API_KEY before starting a session");
    }

    let sessions = SessionManager::new(Arc::new(CpalBackend), Arc::new(WebSocketConnector));
    let app_state = AppState::new(config.clone(), sessions);
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    info!("Starting HTTP server on {}", bind_addr);

    let server_state = app_state.clone();
    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(server_state.clone()))
            // Middleware runs in reverse order of registration for responses
            .wrap(cors)
            .wrap(TracingLogger::default())
            .wrap(middleware::MetricsMiddleware)
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::config::get_config))
                    .route("/config", web::put().to(handlers::config::update_config))
                    .route("/session", web::get().to(handlers::session::get_session))
                    .route("/session/start", web::post().to(handlers::session::start_session))
                    .route("/session/stop", web::post().to(handlers::session::stop_session)),
            )
            .route("/health", web::get().to(health::health_check))
            .route("/ws/session", web::get().to(websocket::session_websocket))
    })
    // Signals are handled below so the session can be stopped first
    .disable_signals()
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
            stop_session(&app_state.sessions).await;
        }
        signal = wait_for_shutdown() => {
            if let Err(e) = signal {
                error!("Signal handler failed: {}", e);
            }
            info!("Shutdown signal received, stopping session and server...");
            shutdown(&app_state.sessions, &server_handle).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Release the devices and close the live channel.
async fn stop_session(sessions: &SessionManager) {
    let snapshot = sessions.stop().await;
    info!(state = snapshot.status.as_str(), "session stopped");
}

/// Stop the session, then drain the server, so control sockets still see the final status.
async fn shutdown(sessions: &SessionManager, server: &ServerHandle) {
    stop_session(sessions).await;
    server.stop(true).await;
}

/// Initialize the tracing (logging) system.
///
/// ## Environment Variables:
/// - `RUST_LOG`: Controls what gets logged (e.g., "debug", "live_wire_backend=trace")
/// - If not set, defaults to "live_wire_backend=debug,actix_web=info"
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "live_wire_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Resolves on SIGTERM or SIGINT (Ctrl+C).
#[cfg(unix)]
async fn wait_for_shutdown() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C");
    Ok(())
}

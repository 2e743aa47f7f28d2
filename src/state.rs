//! # Application State Management
//!
//! Shared state that every HTTP handler and WebSocket actor can reach.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc (Atomically Reference Counted)
//! - **Purpose**: Lets many handlers share ownership of the same data
//! - **Memory safety**: The data is dropped when the last reference goes away
//!
//! ### RwLock (Reader-Writer Lock)
//! - **Purpose**: Many readers OR one writer at a time
//! - **Used for**: configuration and request metrics, which are read far more than written
//!
//! ### What is NOT behind a lock here
//! The streaming session keeps its own state inside a single task. `AppState` only holds
//! the `SessionManager` handle, which talks to that task through channels.

use crate::audio::session::SessionManager;
use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

/// The main application state shared across all HTTP request handlers.
///
/// ## Rust Concepts:
/// - **#[derive(Clone)]**: Cloning only bumps reference counts, every clone sees the same data
/// - **Arc<RwLock<T>>**: Thread-safe shared mutable data
#[derive(Clone)]
pub struct AppState {
    /// Application configuration (can be updated at runtime, applies to the next session)
    pub config: Arc<RwLock<AppConfig>>,

    /// Request metrics, updated by the metrics middleware on every request
    pub metrics: Arc<RwLock<AppMetrics>>,

    /// Starts and stops the streaming session
    pub sessions: Arc<SessionManager>,

    /// When the server started
    pub start_time: Instant,
}

/// Metrics collected across all HTTP requests.
#[derive(Debug, Default)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed since server start
    pub request_count: u64,

    /// Total number of error responses since server start
    pub error_count: u64,

    /// Control WebSocket connections currently open
    pub websocket_clients: u32,

    /// Detailed metrics per endpoint.
    /// Key: method and route pattern (e.g., "POST /api/v1/session/start")
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Performance metrics for a single endpoint.
///
/// ## Performance calculations:
/// - **Average response time**: total_duration_ms / request_count
/// - **Error rate**: error_count / request_count
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    pub fn new(config: AppConfig, sessions: SessionManager) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            sessions: Arc::new(sessions),
            start_time: Instant::now(),
        }
    }

    /// Get a copy of the current configuration.
    ///
    /// ## Why clone:
    /// Cloning releases the lock immediately, so other threads aren't blocked.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap().clone()
    }

    /// Replace the configuration after validating it.
    ///
    /// ## Error handling:
    /// An invalid configuration is rejected and the current one stays in place.
    pub fn update_config(&self, new_config: AppConfig) -> AppResult<()> {
        new_config
            .validate()
            .map_err(|e| AppError::ValidationError(e.to_string()))?;
        *self.config.write().unwrap() = new_config;
        Ok(())
    }

    pub fn increment_request_count(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.request_count += 1;
    }

    pub fn increment_error_count(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.error_count += 1;
    }

    /// Record one request against its endpoint.
    ///
    /// ## HashMap operations:
    /// The first request to an endpoint creates its entry with `or_default()`.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write().unwrap();

        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();
        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;

        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Called when a control WebSocket connects.
    pub fn increment_websocket_clients(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.websocket_clients += 1;
    }

    /// Called when a control WebSocket disconnects.
    ///
    /// ## Underflow protection:
    /// u32 would panic on underflow in debug builds, so we check first.
    pub fn decrement_websocket_clients(&self) {
        let mut metrics = self.metrics.write().unwrap();
        if metrics.websocket_clients > 0 {
            metrics.websocket_clients -= 1;
        }
    }

    /// Consistent copy of the metrics, taken under one read lock.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        let metrics = self.metrics.read().unwrap();
        AppMetrics {
            request_count: metrics.request_count,
            error_count: metrics.error_count,
            websocket_clients: metrics.websocket_clients,
            endpoint_metrics: metrics.endpoint_metrics.clone(),
        }
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl AppMetrics {
    /// Overall error rate (0.0 to 1.0).
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

impl EndpointMetric {
    /// Average response time in milliseconds.
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0 // No requests yet, so no average to calculate
        }
    }

    /// Error rate for this endpoint (0.0 to 1.0).
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use crate::device::testing::FakeBackend;
    use crate::live::channel::testing::{scripted_channel, ScriptedConnector};

    /// State wired to in-memory devices and a scripted remote that acknowledges at once.
    pub fn test_state() -> AppState {
        let (backend, _devices) = FakeBackend::new();
        let (channel, _remote) = scripted_channel();
        AppState::new(
            AppConfig::default(),
            SessionManager::new(Arc::new(backend), Arc::new(ScriptedConnector::new(channel))),
        )
    }

    /// State whose microphone is refused.
    pub fn denied_state() -> AppState {
        let (channel, _remote) = scripted_channel();
        AppState::new(
            AppConfig::default(),
            SessionManager::new(
                Arc::new(FakeBackend::denying_microphone()),
                Arc::new(ScriptedConnector::new(channel)),
            ),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::testing::test_state;
    use super::*;

    #[test]
    fn test_endpoint_metrics_accumulate() {
        let state = test_state();
        state.record_endpoint_request("GET /health", 10, false);
        state.record_endpoint_request("GET /health", 30, true);

        let metrics = state.get_metrics_snapshot();
        let health = &metrics.endpoint_metrics["GET /health"];
        assert_eq!(health.request_count, 2);
        assert_eq!(health.average_duration_ms(), 20.0);
        assert_eq!(health.error_rate(), 0.5);
    }

    #[test]
    fn test_websocket_clients_never_underflow() {
        let state = test_state();
        state.decrement_websocket_clients();
        state.increment_websocket_clients();
        assert_eq!(state.get_metrics_snapshot().websocket_clients, 1);
        state.decrement_websocket_clients();
        state.decrement_websocket_clients();
        assert_eq!(state.get_metrics_snapshot().websocket_clients, 0);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let state = test_state();
        let mut config = state.get_config();
        config.server.port = 0;

        assert!(matches!(state.update_config(config), Err(AppError::ValidationError(_))));
        assert_eq!(state.get_config().server.port, 8080);
    }
}

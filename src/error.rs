//! # Error Handling
//!
//! This module defines the error taxonomy of the voice link and how each error is
//! presented to HTTP clients.
//!
//! ## Key Rust Concepts for Error Handling:
//!
//! ### Result<T, E> Type
//! - **Purpose**: Forces you to handle both success and failure cases
//! - **No exceptions**: A failing microphone or a dropped socket is just a value
//!
//! ### Enums for Error Types
//! - **Variants**: Each variant is one failure class of the audio pipeline
//! - **Pattern matching**: Use `match` to decide how each failure is surfaced
//!
//! ### Traits for Error Conversion
//! - **From trait**: Lets `?` convert library errors (tungstenite, base64, config)
//! - **ResponseError trait**: Converts errors to HTTP responses
//! - **Display trait**: Defines how errors are formatted as strings
//!
//! ## Session errors are status, not panics:
//! The live session never lets one of these escape its task. Every failure is
//! recorded in the session snapshot (`last_error`) and the session moves to a
//! terminal state. Only the HTTP handlers turn them into responses.

use actix_web::{HttpResponse, ResponseError};  // Web framework error handling
use serde_json::json;                          // For creating JSON error responses
use std::fmt;                                  // For implementing Display trait

/// Error types for the voice link.
///
/// ## Error Categories:
/// - **PermissionDenied**: Microphone (or speaker) could not be acquired (403)
/// - **ChannelOpenFailed**: Remote rejected the handshake or the network failed (502)
/// - **ChannelFault**: Remote closed or errored in the middle of a session (502)
/// - **DecodeFailure**: One inbound audio payload was malformed (422)
/// - **SessionConflict**: A session is already active (409)
/// - **BadRequest / ValidationError**: Client sent invalid data (400)
/// - **ConfigError / Internal**: Server-side problems (500)
///
/// ## Usage Example:
/// ```rust
/// return Err(AppError::DecodeFailure("odd byte length".to_string()));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum AppError {
    /// Microphone access was refused or no usable device exists
    PermissionDenied(String),

    /// The remote endpoint did not acknowledge the session
    ChannelOpenFailed(String),

    /// The remote channel failed after it was established
    ChannelFault(String),

    /// An inbound audio payload could not be decoded
    DecodeFailure(String),

    /// A live session is already running
    SessionConflict(String),

    /// Client sent invalid or malformed data
    BadRequest(String),

    /// Configuration file or environment variable problems
    ConfigError(String),

    /// User input failed validation rules
    ValidationError(String),

    /// Anything else that went wrong on our side
    Internal(String),
}

impl AppError {
    /// Machine-readable error type, used in JSON bodies and session snapshots.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::PermissionDenied(_) => "permission_denied",
            AppError::ChannelOpenFailed(_) => "channel_open_failed",
            AppError::ChannelFault(_) => "channel_fault",
            AppError::DecodeFailure(_) => "decode_failure",
            AppError::SessionConflict(_) => "session_conflict",
            AppError::BadRequest(_) => "bad_request",
            AppError::ConfigError(_) => "config_error",
            AppError::ValidationError(_) => "validation_error",
            AppError::Internal(_) => "internal_error",
        }
    }

    /// The bare message without the category prefix.
    pub fn message(&self) -> &str {
        match self {
            AppError::PermissionDenied(msg)
            | AppError::ChannelOpenFailed(msg)
            | AppError::ChannelFault(msg)
            | AppError::DecodeFailure(msg)
            | AppError::SessionConflict(msg)
            | AppError::BadRequest(msg)
            | AppError::ConfigError(msg)
            | AppError::ValidationError(msg)
            | AppError::Internal(msg) => msg,
        }
    }
}

/// Implementation of the Display trait for AppError.
///
/// ## Trait Requirements:
/// The Display trait requires one method: `fmt`. This method writes
/// the formatted error message to a formatter.
impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::PermissionDenied(msg) => write!(f, "Permission denied: {}", msg),
            AppError::ChannelOpenFailed(msg) => write!(f, "Channel open failed: {}", msg),
            AppError::ChannelFault(msg) => write!(f, "Channel fault: {}", msg),
            AppError::DecodeFailure(msg) => write!(f, "Decode failure: {}", msg),
            AppError::SessionConflict(msg) => write!(f, "Session conflict: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for AppError {}

/// Implementation of the ResponseError trait for AppError.
///
/// ## JSON Response Format:
/// All errors return JSON with a consistent structure:
/// ```json
/// {
///   "error": {
///     "type": "session_conflict",
///     "message": "session 5d1c... is already live",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn status_code(&self) -> actix_web::http::StatusCode {
        use actix_web::http::StatusCode;

        match self {
            AppError::PermissionDenied(_) => StatusCode::FORBIDDEN,             // 403
            AppError::ChannelOpenFailed(_) => StatusCode::BAD_GATEWAY,          // 502
            AppError::ChannelFault(_) => StatusCode::BAD_GATEWAY,               // 502
            AppError::DecodeFailure(_) => StatusCode::UNPROCESSABLE_ENTITY,     // 422
            AppError::SessionConflict(_) => StatusCode::CONFLICT,               // 409
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,                 // 400
            AppError::ConfigError(_) => StatusCode::INTERNAL_SERVER_ERROR,      // 500
            AppError::ValidationError(_) => StatusCode::BAD_REQUEST,            // 400
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,         // 500
        }
    }

    fn error_response(&self) -> HttpResponse {
        // Build the HTTP response with JSON body
        HttpResponse::build(self.status_code()).json(json!({
            "error": {
                "type": self.kind(),          // Machine-readable error type
                "message": self.message(),    // Human-readable error message
                "timestamp": chrono::Utc::now().to_rfc3339()  // When the error occurred
            }
        }))
    }
}

/// Automatic conversion from anyhow::Error to AppError.
///
/// ## Usage:
/// When you use `?` with an anyhow::Error, it automatically becomes an AppError::Internal.
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// Automatic conversion from JSON parsing errors to AppError.
///
/// ## Why BadRequest:
/// JSON parsing errors on our side of the wire come from client payloads
/// (config updates, control messages). Remote frames are parsed by the
/// channel reader, which maps failures to `ChannelFault` itself.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

/// Automatic conversion from configuration errors to AppError.
impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

/// Transport errors on the remote WebSocket.
///
/// ## When this happens:
/// - The TCP connection is reset mid-session
/// - The remote sends an invalid frame
/// - A send is attempted after the socket closed
impl From<tokio_tungstenite::tungstenite::Error> for AppError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        AppError::ChannelFault(err.to_string())
    }
}

/// Malformed base64 in an inbound audio payload.
impl From<base64::DecodeError> for AppError {
    fn from(err: base64::DecodeError) -> Self {
        AppError::DecodeFailure(format!("invalid base64: {}", err))
    }
}

/// Resampler setup rejected the rate pair or chunk size.
impl From<rubato::ResamplerConstructionError> for AppError {
    fn from(err: rubato::ResamplerConstructionError) -> Self {
        AppError::Internal(format!("resampler setup failed: {}", err))
    }
}

impl From<rubato::ResampleError> for AppError {
    fn from(err: rubato::ResampleError) -> Self {
        AppError::Internal(format!("resampling failed: {}", err))
    }
}

/// Type alias for Results that use our custom error type.
///
/// ## Usage Example:
/// ```rust
/// fn decode(payload: &str) -> AppResult<PlaybackBuffer> {
///     // This is equivalent to: fn decode(..) -> Result<PlaybackBuffer, AppError>
/// }
/// ```
pub type AppResult<T> = Result<T, AppError>;

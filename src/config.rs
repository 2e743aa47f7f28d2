//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP__ prefix)
//! - Default values (built into the code)
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: Serialization/deserialization library for converting between Rust structs and data formats
//! - **derive macros**: Automatically generate code for common traits (Debug, Clone, Serialize, Deserialize)
//! - **impl blocks**: Add methods to structs
//! - **Result<T, E>**: Error handling that forces you to handle potential failures
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Deployment shortcuts (HOST, PORT, API_KEY / GEMINI_API_KEY)
//! 2. Environment variables (APP__SERVER__PORT, APP__LIVE__VOICE_NAME, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)

use anyhow::Result;              // Better error handling with context
use serde::{Deserialize, Serialize};  // For converting to/from TOML, JSON, etc.
use std::env;                    // For reading environment variables

/// Public endpoint of the bidirectional live-audio API.
pub const DEFAULT_LIVE_ENDPOINT: &str =
    "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Native-audio model used for live sessions.
pub const DEFAULT_LIVE_MODEL: &str = "gemini-2.5-flash-native-audio-preview-09-2025";

/// Persona given to the remote model at session setup.
pub const DEFAULT_SYSTEM_INSTRUCTION: &str = "You are Manus, a sovereign digital agent. You are helpful, precise, and have a slightly cyberpunk personality.";

/// Main application configuration that contains all settings.
///
/// ## Why separate config structs:
/// Breaking configuration into logical groups (server, live endpoint, audio)
/// makes it easier to understand and maintain as the application grows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub live: LiveConfig,
    pub audio: AudioConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept control connections from localhost (default)
/// - `port = 8080`: Common development port
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,  // u16 = unsigned 16-bit integer (0-65535), perfect for port numbers
}

/// Remote live-audio endpoint settings.
///
/// ## Fields:
/// - `endpoint`: WebSocket URL of the bidirectional streaming API (`ws://` or `wss://`)
/// - `api_key`: Credential appended as `?key=`; never echoed back by the HTTP API
/// - `model`: Model identifier, without the `models/` prefix
/// - `voice_name`: Prebuilt voice the remote speaks with
/// - `system_instruction`: Persona string sent with the session setup
/// - `connect_timeout_ms`: How long to wait for the remote acknowledgement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveConfig {
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    pub voice_name: String,
    pub system_instruction: String,
    pub connect_timeout_ms: u64,
}

/// Audio pipeline settings.
///
/// ## Fields:
/// - `capture_sample_rate`: Microphone rate, also advertised in the outbound mime type
/// - `capture_window`: Samples per outbound frame (4096 = 256ms at 16kHz)
/// - `playback_sample_rate`: Rate of the PCM the remote sends back
/// - `volume_scale` / `volume_max`: Level meter mapping, `min(mean|s| * scale, max)`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    pub capture_sample_rate: u32,
    pub capture_window: usize,
    pub playback_sample_rate: u32,
    pub volume_scale: f32,
    pub volume_max: f32,
}

/// Provides default configuration values.
///
/// ## Why defaults matter:
/// Default values ensure the application can start even if no configuration file exists.
/// They also serve as documentation of reasonable starting values.
impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),  // Localhost only (safe for development)
                port: 8080,                     // Common development port
            },
            live: LiveConfig {
                endpoint: DEFAULT_LIVE_ENDPOINT.to_string(),
                api_key: String::new(),         // Supplied through the environment
                model: DEFAULT_LIVE_MODEL.to_string(),
                voice_name: "Zephyr".to_string(),
                system_instruction: DEFAULT_SYSTEM_INSTRUCTION.to_string(),
                connect_timeout_ms: 15_000,
            },
            audio: AudioConfig {
                capture_sample_rate: 16_000,    // What the remote expects for input
                capture_window: 4096,           // One frame every 256ms
                playback_sample_rate: 24_000,   // What the remote sends back
                volume_scale: 500.0,
                volume_max: 100.0,
            },
        }
    }
}

/// Implementation block for AppConfig - adds methods to the struct.
impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP__SERVER__PORT=3000`: Override server port
    /// - `APP__LIVE__VOICE_NAME=Kore`: Override the remote voice
    /// - `APP__AUDIO__CAPTURE_WINDOW=2048`: Smaller outbound frames
    /// - `PORT=3000`: Special case for deployment platforms
    /// - `GEMINI_API_KEY=...`: Special case for the remote credential
    ///
    /// The double underscore separator keeps field names such as `voice_name` intact.
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            // 1. Start with defaults - converts our Default impl to config format
            .add_source(config::Config::try_from(&AppConfig::default())?)
            // 2. Load from config.toml file (if it exists) - required(false) means "don't error if missing"
            .add_source(config::File::with_name("config").required(false))
            // 3. Load from environment variables with APP__ prefix
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("__")
                    .separator("__"),
            );

        // Handle special environment variables used by deployment platforms
        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        if let Ok(key) = env::var("GEMINI_API_KEY").or_else(|_| env::var("API_KEY")) {
            settings = settings.set_override("live.api_key", key)?;
        }

        // Build the final configuration and convert it back to our AppConfig struct
        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Server port is not 0
    /// - The live endpoint is a WebSocket URL and a model is named
    /// - Sample rates and the capture window are non-zero
    /// - The volume meter mapping is positive
    ///
    /// An empty API key passes; it surfaces as `ChannelOpenFailed` on start.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.live.endpoint.trim().is_empty() {
            return Err(anyhow::anyhow!("Live endpoint cannot be empty"));
        }

        if !(self.live.endpoint.starts_with("ws://") || self.live.endpoint.starts_with("wss://")) {
            return Err(anyhow::anyhow!(
                "Live endpoint must be a ws:// or wss:// URL, got {}",
                self.live.endpoint
            ));
        }

        if self.live.model.trim().is_empty() {
            return Err(anyhow::anyhow!("Live model cannot be empty"));
        }

        if self.live.connect_timeout_ms == 0 {
            return Err(anyhow::anyhow!("Connect timeout must be greater than 0"));
        }

        if self.audio.capture_sample_rate == 0 || self.audio.playback_sample_rate == 0 {
            return Err(anyhow::anyhow!("Sample rates must be greater than 0"));
        }

        if self.audio.capture_window == 0 {
            return Err(anyhow::anyhow!("Capture window must be greater than 0"));
        }

        if self.audio.volume_scale <= 0.0 || self.audio.volume_max <= 0.0 {
            return Err(anyhow::anyhow!("Volume scale and maximum must be positive"));
        }

        Ok(())  // All validation passed
    }

    /// Update configuration from a JSON string (used for runtime config updates).
    ///
    /// ## Partial updates:
    /// Only the fields present are changed. For example, `{"live": {"voice_name": "Kore"}}`
    /// changes the voice of the next session and nothing else.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        // Parse the JSON string into a generic value
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;

        // Update server configuration if provided
        if let Some(server) = partial_config.get("server") {
            if let Some(host) = server.get("host").and_then(|v| v.as_str()) {
                self.server.host = host.to_string();
            }
            if let Some(port) = server.get("port").and_then(|v| v.as_u64()) {
                self.server.port = u16::try_from(port)
                    .map_err(|_| anyhow::anyhow!("Server port {} out of range", port))?;
            }
        }

        // Update live endpoint configuration if provided
        if let Some(live) = partial_config.get("live") {
            if let Some(endpoint) = live.get("endpoint").and_then(|v| v.as_str()) {
                self.live.endpoint = endpoint.to_string();
            }
            if let Some(key) = live.get("api_key").and_then(|v| v.as_str()) {
                self.live.api_key = key.to_string();
            }
            if let Some(model) = live.get("model").and_then(|v| v.as_str()) {
                self.live.model = model.to_string();
            }
            if let Some(voice) = live.get("voice_name").and_then(|v| v.as_str()) {
                self.live.voice_name = voice.to_string();
            }
            if let Some(instruction) = live.get("system_instruction").and_then(|v| v.as_str()) {
                self.live.system_instruction = instruction.to_string();
            }
            if let Some(timeout) = live.get("connect_timeout_ms").and_then(|v| v.as_u64()) {
                self.live.connect_timeout_ms = timeout;
            }
        }

        // Update audio configuration if provided
        if let Some(audio) = partial_config.get("audio") {
            if let Some(rate) = audio.get("capture_sample_rate").and_then(|v| v.as_u64()) {
                self.audio.capture_sample_rate = u32::try_from(rate)
                    .map_err(|_| anyhow::anyhow!("Capture sample rate {} out of range", rate))?;
            }
            if let Some(window) = audio.get("capture_window").and_then(|v| v.as_u64()) {
                self.audio.capture_window = usize::try_from(window)
                    .map_err(|_| anyhow::anyhow!("Capture window {} out of range", window))?;
            }
            if let Some(rate) = audio.get("playback_sample_rate").and_then(|v| v.as_u64()) {
                self.audio.playback_sample_rate = u32::try_from(rate)
                    .map_err(|_| anyhow::anyhow!("Playback sample rate {} out of range", rate))?;
            }
            if let Some(scale) = audio.get("volume_scale").and_then(|v| v.as_f64()) {
                self.audio.volume_scale = scale as f32;
            }
            if let Some(max) = audio.get("volume_max").and_then(|v| v.as_f64()) {
                self.audio.volume_max = max as f32;
            }
        }

        // Validate the updated configuration to ensure it's still valid
        self.validate()?;
        Ok(())
    }

    /// Full WebSocket URL including the credential query parameter.
    pub fn live_url(&self) -> String {
        if self.live.api_key.is_empty() {
            return self.live.endpoint.clone();
        }
        let separator = if self.live.endpoint.contains('?') { '&' } else { '?' };
        format!(
            "{}{}key={}",
            self.live.endpoint,
            separator,
            urlencoding::encode(&self.live.api_key)
        )
    }
}

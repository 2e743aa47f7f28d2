//! # Capture Encoder
//!
//! Turns fixed-size microphone windows into transport-ready frames.
//!
//! ## Per window:
//! 1. **Level readout**: mean absolute amplitude, scaled and clamped for the volume meter
//! 2. **Range map**: every float sample to 16-bit PCM (`round(s * 32768)`, see `pcm`)
//! 3. **Transport**: little-endian bytes, base64, wrapped in `{ data, mimeType }`
//!
//! ## Ordering:
//! Frames are numbered in capture order. The session hands each one to the channel as
//! soon as it is produced and never waits for the send to finish, so sends are
//! initiated in exactly this order.

use crate::audio::pcm::{encode_base64_pcm16, pcm_mime_type};
use crate::config::AudioConfig;
use serde::{Deserialize, Serialize};

/// Outbound transport envelope.
///
/// Serializes to exactly `{"data": "<base64>", "mimeType": "audio/pcm;rate=16000"}`,
/// which is what the remote endpoint expects inside a realtime input message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodedFrame {
    pub data: String,
    pub mime_type: String,
}

/// One encoded window plus its metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedFrame {
    /// Position in capture order, starting at 0
    pub sequence: u64,

    /// Ready to send
    pub frame: EncodedFrame,

    /// Level readout for this window, in `[0, volume_max]`
    pub volume: f32,

    /// Number of PCM bytes before base64
    pub pcm_bytes: usize,
}

/// Encodes capture windows into frames.
#[derive(Debug, Clone)]
pub struct CaptureEncoder {
    window_size: usize,
    volume_scale: f32,
    volume_max: f32,
    mime_type: String,
    next_sequence: u64,
}

impl CaptureEncoder {
    pub fn new(sample_rate: u32, window_size: usize, volume_scale: f32, volume_max: f32) -> Self {
        Self {
            window_size,
            volume_scale,
            volume_max,
            mime_type: pcm_mime_type(sample_rate),
            next_sequence: 0,
        }
    }

    /// Build an encoder from the audio section of the configuration.
    pub fn from_config(config: &AudioConfig) -> Self {
        Self::new(
            config.capture_sample_rate,
            config.capture_window,
            config.volume_scale,
            config.volume_max,
        )
    }

    /// Encode one capture window.
    ///
    /// ## Returns:
    /// - **Some(frame)**: the window had exactly `window_size` samples
    /// - **None**: a short (or oversized) read; nothing is emitted and the sequence does not advance
    pub fn encode_window(&mut self, window: &[f32]) -> Option<CapturedFrame> {
        if window.len() != self.window_size {
            return None;
        }

        let volume = self.volume_level(window);
        let data = encode_base64_pcm16(window);
        let sequence = self.next_sequence;
        self.next_sequence += 1;

        Some(CapturedFrame {
            sequence,
            frame: EncodedFrame {
                data,
                mime_type: self.mime_type.clone(),
            },
            volume,
            pcm_bytes: window.len() * 2,
        })
    }

    /// Mean absolute amplitude mapped to the meter range.
    pub fn volume_level(&self, window: &[f32]) -> f32 {
        if window.is_empty() {
            return 0.0;
        }
        let sum: f32 = window.iter().map(|s| s.abs()).sum();
        let mean = sum / window.len() as f32;
        (mean * self.volume_scale).min(self.volume_max)
    }

    /// Frames produced so far.
    pub fn frames_encoded(&self) -> u64 {
        self.next_sequence
    }
}

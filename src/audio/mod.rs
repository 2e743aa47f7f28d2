//! # Audio Pipeline
//!
//! Everything between the sound card and the live channel, free of any device or
//! network code so it can be driven by fakes in tests.
//!
//! ## Key Components:
//! - **pcm**: float ↔ PCM16 conversion, little-endian packing, base64 transport
//! - **buffer**: accumulates device callbacks into fixed-size capture windows
//! - **capture**: turns one window into an outbound frame plus a volume reading
//! - **playback**: decodes inbound audio and schedules it gaplessly on an output clock
//! - **session**: the streaming session state machine and its manager
//!
//! ## Audio Formats:
//! - **Outbound**: 16 kHz mono PCM16 little-endian, `audio/pcm;rate=16000`
//! - **Inbound**: 24 kHz mono PCM16 little-endian

pub mod buffer;
pub mod capture;
pub mod pcm;
pub mod playback;
pub mod session;

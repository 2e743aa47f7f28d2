//! # Live Endpoint Wire Messages
//!
//! JSON messages exchanged with the bidirectional live-audio endpoint.
//!
//! ## Client → Server:
//! - **setup**: first message; model, audio response modality, voice, persona
//! - **realtimeInput**: one captured frame per message (`mediaChunks: [{data, mimeType}]`)
//!
//! ## Server → Client:
//! - **setupComplete**: acknowledgement, the session is live
//! - **serverContent**: model audio (`modelTurn.parts[].inlineData`), `interrupted`, `turnComplete`
//! - **goAway**: the server will close soon
//!
//! The server sends JSON in both text and binary WebSocket frames.

use crate::audio::capture::EncodedFrame;
use crate::config::AppConfig;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Everything the remote needs to open a session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSetup {
    pub url: String,
    pub model: String,
    pub voice_name: String,
    pub system_instruction: String,
    pub connect_timeout_ms: u64,
}

impl SessionSetup {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            url: config.live_url(),
            model: config.live.model.clone(),
            voice_name: config.live.voice_name.clone(),
            system_instruction: config.live.system_instruction.clone(),
            connect_timeout_ms: config.live.connect_timeout_ms,
        }
    }

    /// Model name as the endpoint expects it (`models/<id>`).
    pub fn qualified_model(&self) -> String {
        if self.model.starts_with("models/") {
            self.model.clone()
        } else {
            format!("models/{}", self.model)
        }
    }

    pub fn to_message(&self) -> ClientMessage {
        ClientMessage::Setup(Setup {
            model: self.qualified_model(),
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: self.voice_name.clone(),
                        },
                    },
                },
            },
            system_instruction: Content {
                parts: vec![TextPart {
                    text: self.system_instruction.clone(),
                }],
            },
        })
    }
}

/// Messages we send. Externally tagged: `{"setup": {...}}` / `{"realtimeInput": {...}}`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(Setup),
    RealtimeInput(RealtimeInput),
}

impl ClientMessage {
    pub fn audio(frame: EncodedFrame) -> Self {
        ClientMessage::RealtimeInput(RealtimeInput {
            media_chunks: vec![frame],
        })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    pub generation_config: GenerationConfig,
    pub system_instruction: Content,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
    pub speech_config: SpeechConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<EncodedFrame>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Content {
    pub parts: Vec<TextPart>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TextPart {
    pub text: String,
}

/// Messages we receive. Unknown fields (usage metadata, transcriptions, tool calls) are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default)]
    pub setup_complete: Option<serde_json::Value>,
    #[serde(default)]
    pub server_content: Option<ServerContent>,
    #[serde(default)]
    pub go_away: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default)]
    pub model_turn: Option<ModelTurn>,
    #[serde(default)]
    pub interrupted: bool,
    #[serde(default)]
    pub turn_complete: bool,
}

/// Parts are kept raw so one bad part cannot take the rest of the turn down with it.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelTurn {
    #[serde(default)]
    pub parts: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundPart {
    #[serde(default)]
    pub inline_data: Option<InlineData>,
}

/// Inline media from the model. Both fields are optional on the wire.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub data: Option<String>,
}

impl InboundPart {
    /// Turn one raw part into at most one event.
    fn into_event(raw: serde_json::Value) -> Option<ServerEvent> {
        let part: InboundPart = match serde_json::from_value(raw) {
            Ok(part) => part,
            Err(err) => return Some(ServerEvent::Malformed(format!("unreadable part: {}", err))),
        };
        let inline = part.inline_data?;
        match inline.data {
            // The session runs with the audio modality only, so any payload is played
            Some(data) if !data.is_empty() => {
                if let Some(mime) = inline.mime_type.as_deref().filter(|m| !m.starts_with("audio/")) {
                    debug!(mime_type = mime, "inline data without an audio mime type, treating as audio");
                }
                Some(ServerEvent::Audio(data))
            }
            Some(_) => None,
            None => Some(ServerEvent::Malformed("inline data without a payload".to_string())),
        }
    }
}

/// What the session reacts to, flattened out of a server message.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    /// Remote acknowledged the setup
    SetupComplete,
    /// Base64 PCM16 at the playback rate
    Audio(String),
    /// User speech detected during playback: drop everything queued
    Interrupted,
    /// The model finished its turn
    TurnComplete,
    /// Remote announced it will disconnect
    GoAway,
    /// One part of a turn could not be read; the rest of the message still applies
    Malformed(String),
}

impl ServerMessage {
    /// Events in the order the session must apply them.
    ///
    /// ## Ordering:
    /// Audio parts first (in part order), then `Interrupted`, then `TurnComplete`.
    /// A message carrying both audio and an interruption therefore schedules the audio
    /// and immediately cancels it, so nothing stale is heard.
    pub fn into_events(self) -> Vec<ServerEvent> {
        let mut events = Vec::new();

        if self.setup_complete.is_some() {
            events.push(ServerEvent::SetupComplete);
        }

        if let Some(content) = self.server_content {
            if let Some(turn) = content.model_turn {
                events.extend(turn.parts.into_iter().filter_map(InboundPart::into_event));
            }
            if content.interrupted {
                events.push(ServerEvent::Interrupted);
            }
            if content.turn_complete {
                events.push(ServerEvent::TurnComplete);
            }
        }

        if self.go_away.is_some() {
            events.push(ServerEvent::GoAway);
        }

        events
    }
}

/// Parse one WebSocket payload (text or binary) into events.
pub fn parse_server_payload(payload: &[u8]) -> Result<Vec<ServerEvent>, serde_json::Error> {
    let message: ServerMessage = serde_json::from_slice(payload)?;
    Ok(message.into_events())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn setup() -> SessionSetup {
        SessionSetup::from_config(&AppConfig::default())
    }

    #[test]
    fn test_setup_message_shape() {
        let value = serde_json::to_value(setup().to_message()).unwrap();
        assert_eq!(
            value,
            json!({
                "setup": {
                    "model": "models/gemini-2.5-flash-native-audio-preview-09-2025",
                    "generationConfig": {
                        "responseModalities": ["AUDIO"],
                        "speechConfig": {
                            "voiceConfig": { "prebuiltVoiceConfig": { "voiceName": "Zephyr" } }
                        }
                    },
                    "systemInstruction": {
                        "parts": [{ "text": crate::config::DEFAULT_SYSTEM_INSTRUCTION }]
                    }
                }
            })
        );
    }

    #[test]
    fn test_realtime_input_envelope() {
        let frame = EncodedFrame {
            data: "AAAA".to_string(),
            mime_type: "audio/pcm;rate=16000".to_string(),
        };
        assert_eq!(
            serde_json::to_string(&ClientMessage::audio(frame)).unwrap(),
            r#"{"realtimeInput":{"mediaChunks":[{"data":"AAAA","mimeType":"audio/pcm;rate=16000"}]}}"#
        );
    }

    #[test]
    fn test_qualified_model_is_not_doubled() {
        let mut setup = setup();
        setup.model = "models/custom".to_string();
        assert_eq!(setup.qualified_model(), "models/custom");
    }

    #[test]
    fn test_parse_setup_complete() {
        assert_eq!(
            parse_server_payload(br#"{"setupComplete": {}}"#).unwrap(),
            vec![ServerEvent::SetupComplete]
        );
    }

    #[test]
    fn test_parse_audio_then_interrupt_order() {
        let payload = json!({
            "serverContent": {
                "modelTurn": { "parts": [
                    { "inlineData": { "mimeType": "audio/pcm;rate=24000", "data": "AQID" } },
                    { "text": "ignored" },
                    { "inlineData": { "mimeType": "audio/pcm;rate=24000", "data": "BAUG" } }
                ]},
                "interrupted": true,
                "turnComplete": true
            }
        })
        .to_string();

        assert_eq!(
            parse_server_payload(payload.as_bytes()).unwrap(),
            vec![
                ServerEvent::Audio("AQID".to_string()),
                ServerEvent::Audio("BAUG".to_string()),
                ServerEvent::Interrupted,
                ServerEvent::TurnComplete,
            ]
        );
    }

    #[test]
    fn test_inline_data_without_mime_type_is_played() {
        let payload = br#"{"serverContent":{"modelTurn":{"parts":[{"inlineData":{"data":"AAAA"}}]}}}"#;
        assert_eq!(
            parse_server_payload(payload).unwrap(),
            vec![ServerEvent::Audio("AAAA".to_string())]
        );
    }

    #[test]
    fn test_bad_part_is_reported_and_siblings_survive() {
        let payload = json!({
            "serverContent": {
                "modelTurn": { "parts": [
                    { "inlineData": { "mimeType": "audio/pcm;rate=24000", "data": 42 } },
                    { "inlineData": { "mimeType": "audio/pcm;rate=24000" } },
                    { "inlineData": { "mimeType": "audio/pcm;rate=24000", "data": "BAUG" } }
                ]},
                "turnComplete": true
            }
        })
        .to_string();

        let events = parse_server_payload(payload.as_bytes()).unwrap();
        assert_eq!(events.len(), 4);
        assert!(matches!(events[0], ServerEvent::Malformed(_)));
        assert!(matches!(events[1], ServerEvent::Malformed(_)));
        assert_eq!(events[2], ServerEvent::Audio("BAUG".to_string()));
        assert_eq!(events[3], ServerEvent::TurnComplete);
    }

    #[test]
    fn test_empty_inline_payload_is_skipped() {
        let payload = br#"{"serverContent":{"modelTurn":{"parts":[{"inlineData":{"mimeType":"audio/pcm","data":""}}]}}}"#;
        assert!(parse_server_payload(payload).unwrap().is_empty());
    }

    #[test]
    fn test_unknown_messages_yield_no_events() {
        let payload = br#"{"usageMetadata": {"totalTokenCount": 12}}"#;
        assert!(parse_server_payload(payload).unwrap().is_empty());
    }

    #[test]
    fn test_garbage_is_an_error() {
        assert!(parse_server_payload(b"not json").is_err());
    }
}

//! Gemini Live API protocol types
//!
//! JSON messages exchanged over the `BidiGenerateContent` WebSocket.
//!
//! # Protocol Overview
//!
//! 1. Connect to the endpoint with `?key=<api key>`
//! 2. Send `setup` (model, response modality, system instruction)
//! 3. Receive `setupComplete`
//! 4. Stream audio via `realtimeInput.mediaChunks`
//! 5. Receive `serverContent` (audio parts, `turnComplete`, `interrupted`)
//! 6. Close the socket to end the session

use serde::{Deserialize, Serialize};

use super::transport::{EncodedFrame, TransportEvent};
use crate::session_config::SessionConfig;

// ============================================================================
// Client Messages (sent TO the model)
// ============================================================================

/// Messages sent from client to the Live API
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    /// First message on the socket
    Setup(Setup),
    /// Streaming audio input
    RealtimeInput(RealtimeInput),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    /// Fully qualified model name, e.g. `models/gemini-...`
    pub model: String,
    pub generation_config: GenerationConfig,
    pub system_instruction: Content,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Content {
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<Blob>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub mime_type: String,
    /// Base64-encoded bytes
    pub data: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<Blob>,
}

impl ClientMessage {
    /// Build the setup message for a session
    pub fn setup(config: &SessionConfig) -> Self {
        let model = if config.model().starts_with("models/") {
            config.model().to_string()
        } else {
            format!("models/{}", config.model())
        };

        Self::Setup(Setup {
            model,
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
            },
            system_instruction: Content {
                parts: vec![Part {
                    text: Some(config.system_instruction().to_string()),
                    inline_data: None,
                }],
            },
        })
    }

    /// Wrap an encoded frame as realtime input
    pub fn audio(frame: EncodedFrame) -> Self {
        Self::RealtimeInput(RealtimeInput {
            media_chunks: vec![Blob {
                mime_type: frame.mime_type,
                data: frame.data,
            }],
        })
    }
}

// ============================================================================
// Server Messages (received FROM the model)
// ============================================================================

/// Messages received from the Live API.
///
/// The server does not tag its messages; exactly one of these fields is
/// normally present. Unknown fields (tool calls, usage metadata) are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default)]
    pub setup_complete: Option<serde_json::Value>,
    #[serde(default)]
    pub server_content: Option<ServerContent>,
    #[serde(default)]
    pub go_away: Option<GoAway>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default)]
    pub model_turn: Option<Content>,
    #[serde(default)]
    pub turn_complete: bool,
    #[serde(default)]
    pub interrupted: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoAway {
    #[serde(default)]
    pub time_left: Option<String>,
}

impl ServerMessage {
    pub fn is_setup_complete(&self) -> bool {
        self.setup_complete.is_some()
    }

    /// Translate into transport events, in the order they should be handled:
    /// audio first, then interruption, then end of turn.
    pub fn into_events(self) -> Vec<TransportEvent> {
        let mut events = Vec::new();

        if let Some(content) = self.server_content {
            if let Some(turn) = content.model_turn {
                for part in turn.parts {
                    match part.inline_data {
                        Some(blob) if blob.mime_type.starts_with("audio/") => {
                            events.push(TransportEvent::Frame { data: blob.data });
                        }
                        Some(blob) => {
                            log::debug!("Ignoring inline data of type {}", blob.mime_type);
                        }
                        None => {}
                    }
                }
            }
            if content.interrupted {
                events.push(TransportEvent::Interrupted);
            }
            if content.turn_complete {
                events.push(TransportEvent::TurnComplete);
            }
        }

        if let Some(go_away) = self.go_away {
            events.push(TransportEvent::GoAway {
                time_left: go_away.time_left,
            });
        }

        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SessionConfig {
        SessionConfig::new(
            "gemini-2.5-flash-native-audio-preview-09-2025",
            "Senior backend engineer interview",
            24_000,
        )
        .unwrap()
    }

    #[test]
    fn test_setup_serialization() {
        let json = serde_json::to_value(ClientMessage::setup(&config())).unwrap();

        assert_eq!(
            json["setup"]["model"],
            "models/gemini-2.5-flash-native-audio-preview-09-2025"
        );
        assert_eq!(
            json["setup"]["generationConfig"]["responseModalities"][0],
            "AUDIO"
        );
        let instruction = json["setup"]["systemInstruction"]["parts"][0]["text"]
            .as_str()
            .unwrap();
        assert!(instruction.contains("Senior backend engineer interview"));
    }

    #[test]
    fn test_setup_keeps_qualified_model_name() {
        let config = SessionConfig::new("models/custom", "context", 24_000).unwrap();
        let json = serde_json::to_value(ClientMessage::setup(&config)).unwrap();
        assert_eq!(json["setup"]["model"], "models/custom");
    }

    #[test]
    fn test_realtime_input_serialization() {
        let frame = EncodedFrame::pcm16("AAAA".to_string(), 24_000, 2);
        let json = serde_json::to_string(&ClientMessage::audio(frame)).unwrap();

        assert_eq!(
            json,
            r#"{"realtimeInput":{"mediaChunks":[{"mimeType":"audio/pcm;rate=24000","data":"AAAA"}]}}"#
        );
    }

    #[test]
    fn test_setup_complete_deserialization() {
        let msg: ServerMessage = serde_json::from_str(r#"{"setupComplete": {}}"#).unwrap();
        assert!(msg.is_setup_complete());
        assert!(msg.into_events().is_empty());
    }

    #[test]
    fn test_server_content_audio_and_turn_complete() {
        let json = r#"{
            "serverContent": {
                "modelTurn": {
                    "parts": [
                        {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": "AAAA"}},
                        {"text": "hello"},
                        {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": "BBBB"}}
                    ]
                },
                "turnComplete": true
            }
        }"#;

        let msg: ServerMessage = serde_json::from_str(json).unwrap();
        assert!(!msg.is_setup_complete());
        assert_eq!(
            msg.into_events(),
            vec![
                TransportEvent::Frame {
                    data: "AAAA".to_string()
                },
                TransportEvent::Frame {
                    data: "BBBB".to_string()
                },
                TransportEvent::TurnComplete,
            ]
        );
    }

    #[test]
    fn test_interrupted_deserialization() {
        let msg: ServerMessage =
            serde_json::from_str(r#"{"serverContent": {"interrupted": true}}"#).unwrap();
        assert_eq!(msg.into_events(), vec![TransportEvent::Interrupted]);
    }

    #[test]
    fn test_go_away_deserialization() {
        let msg: ServerMessage =
            serde_json::from_str(r#"{"goAway": {"timeLeft": "10s"}}"#).unwrap();
        assert_eq!(
            msg.into_events(),
            vec![TransportEvent::GoAway {
                time_left: Some("10s".to_string())
            }]
        );
    }

    #[test]
    fn test_unknown_message_is_ignored() {
        let msg: ServerMessage =
            serde_json::from_str(r#"{"toolCall": {"functionCalls": []}}"#).unwrap();
        assert!(msg.into_events().is_empty());
    }
}

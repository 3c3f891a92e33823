//! Wire protocol for the Gemini Live session
//!
//! Inbound JSON is decoded exactly once, here, into [`Inbound`] variants.
//! Everything downstream matches on the tagged enum and never looks at raw
//! JSON again.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::pcm::{self, OUTPUT_SAMPLE_RATE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    User,
    Assistant,
}

/// Base64 PCM from the model plus the rate it was produced at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioPayload {
    pub data: String,
    pub sample_rate: u32,
}

/// One semantic event from the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    SetupComplete,
    /// The user started talking over the model.
    Interruption,
    Transcript { role: Role, text: String },
    Audio(AudioPayload),
    TurnComplete,
    /// The server is about to close the connection.
    GoAway,
}

/// One outbound message. Serialized only at the transport boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Audio {
        data: String,
        mime_type: String,
        sample_rate: u32,
    },
    Video {
        data: String,
        mime_type: String,
    },
}

impl Outbound {
    /// Microphone audio at the input rate.
    pub fn audio(samples: &[f32]) -> Self {
        Outbound::Audio {
            data: pcm::encode_base64(samples),
            mime_type: pcm::pcm_mime_type(pcm::INPUT_SAMPLE_RATE),
            sample_rate: pcm::INPUT_SAMPLE_RATE,
        }
    }

    pub fn jpeg(data: String) -> Self {
        Outbound::Video {
            data,
            mime_type: "image/jpeg".to_string(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Outbound::Text(_) => "text",
            Outbound::Audio { .. } => "audio",
            Outbound::Video { .. } => "video",
        }
    }

    /// Build the JSON frame for this message.
    pub fn to_client_message(&self) -> ClientMessage {
        match self {
            Outbound::Text(text) => ClientMessage::ClientContent(ClientContent {
                turns: vec![Content {
                    role: Some("user".to_string()),
                    parts: vec![Part { text: text.clone() }],
                }],
                turn_complete: true,
            }),
            Outbound::Audio {
                data, mime_type, ..
            } => ClientMessage::RealtimeInput(RealtimeInput {
                audio: Some(Blob {
                    data: data.clone(),
                    mime_type: mime_type.clone(),
                }),
                video: None,
            }),
            Outbound::Video { data, mime_type } => ClientMessage::RealtimeInput(RealtimeInput {
                audio: None,
                video: Some(Blob {
                    data: data.clone(),
                    mime_type: mime_type.clone(),
                }),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Client frames

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(Setup),
    ClientContent(ClientContent),
    RealtimeInput(RealtimeInput),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    pub generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<Empty>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_audio_transcription: Option<Empty>,
}

impl Setup {
    /// Audio replies with transcripts in both directions.
    pub fn new(model: &str, system_instruction: &str, voice: Option<&str>) -> Self {
        let model = if model.starts_with("models/") {
            model.to_string()
        } else {
            format!("models/{}", model)
        };
        Self {
            model,
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
                speech_config: voice.map(|name| SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: name.to_string(),
                        },
                    },
                }),
            },
            system_instruction: (!system_instruction.is_empty()).then(|| Content {
                role: None,
                parts: vec![Part {
                    text: system_instruction.to_string(),
                }],
            }),
            input_audio_transcription: Some(Empty {}),
            output_audio_transcription: Some(Empty {}),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speech_config: Option<SpeechConfig>,
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

#[derive(Debug, Clone, Default, Serialize)]
pub struct Empty {}

#[derive(Debug, Clone, Serialize)]
pub struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Part {
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientContent {
    pub turns: Vec<Content>,
    pub turn_complete: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RealtimeInput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<Blob>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video: Option<Blob>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub data: String,
    pub mime_type: String,
}

// ---------------------------------------------------------------------------
// Server frames

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerFrame {
    setup_complete: Option<serde_json::Value>,
    server_content: Option<ServerContent>,
    go_away: Option<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    #[serde(default)]
    interrupted: bool,
    #[serde(default)]
    turn_complete: bool,
    model_turn: Option<ModelTurn>,
    input_transcription: Option<Transcription>,
    output_transcription: Option<Transcription>,
}

#[derive(Debug, Default, Deserialize)]
struct ModelTurn {
    #[serde(default)]
    parts: Vec<ServerPart>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerPart {
    text: Option<String>,
    inline_data: Option<InlineData>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: Option<String>,
    data: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Transcription {
    text: Option<String>,
}

/// Decode one server frame into zero or more events.
///
/// An interruption is always emitted first so that stale audio later in the
/// same frame is never scheduled ahead of the flush. Parts that are present
/// but malformed are skipped with a warning.
pub fn decode_frame(text: &str) -> Result<Vec<Inbound>, serde_json::Error> {
    let frame: ServerFrame = serde_json::from_str(text)?;
    let mut events = Vec::new();

    if frame.setup_complete.is_some() {
        events.push(Inbound::SetupComplete);
    }

    if let Some(content) = frame.server_content {
        if content.interrupted {
            events.push(Inbound::Interruption);
        }

        if let Some(text) = content.input_transcription.and_then(|t| t.text) {
            if !text.trim().is_empty() {
                events.push(Inbound::Transcript {
                    role: Role::User,
                    text,
                });
            }
        }

        if let Some(turn) = content.model_turn {
            for part in turn.parts {
                if let Some(inline) = part.inline_data {
                    match inline.data {
                        Some(data) if !data.is_empty() => {
                            let sample_rate = inline
                                .mime_type
                                .as_deref()
                                .and_then(pcm::parse_rate)
                                .unwrap_or(OUTPUT_SAMPLE_RATE);
                            events.push(Inbound::Audio(AudioPayload { data, sample_rate }));
                        }
                        _ => warn!("Skipping inline data part without payload"),
                    }
                }
                if let Some(text) = part.text {
                    if !text.trim().is_empty() {
                        events.push(Inbound::Transcript {
                            role: Role::Assistant,
                            text,
                        });
                    }
                }
            }
        }

        if let Some(text) = content.output_transcription.and_then(|t| t.text) {
            if !text.trim().is_empty() {
                events.push(Inbound::Transcript {
                    role: Role::Assistant,
                    text,
                });
            }
        }

        if content.turn_complete {
            events.push(Inbound::TurnComplete);
        }
    }

    if frame.go_away.is_some() {
        events.push(Inbound::GoAway);
    }

    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_setup_serialization() {
        let setup = Setup::new("gemini-2.0-flash-live-001", "Guide the user.", Some("Puck"));
        let value = serde_json::to_value(ClientMessage::Setup(setup)).unwrap();

        let setup = &value["setup"];
        assert_eq!(setup["model"], "models/gemini-2.0-flash-live-001");
        assert_eq!(setup["generationConfig"]["responseModalities"][0], "AUDIO");
        assert_eq!(
            setup["generationConfig"]["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]["voiceName"],
            "Puck"
        );
        assert_eq!(setup["systemInstruction"]["parts"][0]["text"], "Guide the user.");
        assert_eq!(setup["inputAudioTranscription"], json!({}));
        assert_eq!(setup["outputAudioTranscription"], json!({}));
    }

    #[test]
    fn test_setup_without_voice_or_instruction() {
        let setup = Setup::new("models/custom", "", None);
        let value = serde_json::to_value(ClientMessage::Setup(setup)).unwrap();
        assert_eq!(value["setup"]["model"], "models/custom");
        assert!(value["setup"]["generationConfig"].get("speechConfig").is_none());
        assert!(value["setup"].get("systemInstruction").is_none());
    }

    #[test]
    fn test_outbound_shapes() {
        let audio = Outbound::Audio {
            data: "AAAA".to_string(),
            mime_type: "audio/pcm;rate=16000".to_string(),
            sample_rate: 16000,
        };
        let value = serde_json::to_value(audio.to_client_message()).unwrap();
        assert_eq!(
            value,
            json!({"realtimeInput": {"audio": {"data": "AAAA", "mimeType": "audio/pcm;rate=16000"}}})
        );

        let video = Outbound::jpeg("/9j/".to_string());
        let value = serde_json::to_value(video.to_client_message()).unwrap();
        assert_eq!(
            value,
            json!({"realtimeInput": {"video": {"data": "/9j/", "mimeType": "image/jpeg"}}})
        );

        let text = Outbound::Text("Describe what you see".to_string());
        let value = serde_json::to_value(text.to_client_message()).unwrap();
        assert_eq!(value["clientContent"]["turnComplete"], true);
        assert_eq!(value["clientContent"]["turns"][0]["role"], "user");
        assert_eq!(value["clientContent"]["turns"][0]["parts"][0]["text"], "Describe what you see");
    }

    #[test]
    fn test_microphone_audio_uses_input_rate() {
        match Outbound::audio(&[0.0; 4]) {
            Outbound::Audio {
                mime_type,
                sample_rate,
                ..
            } => {
                assert_eq!(mime_type, "audio/pcm;rate=16000");
                assert_eq!(sample_rate, 16000);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_setup_complete_and_go_away() {
        assert_eq!(decode_frame(r#"{"setupComplete":{}}"#).unwrap(), vec![Inbound::SetupComplete]);
        assert_eq!(
            decode_frame(r#"{"goAway":{"timeLeft":"10s"}}"#).unwrap(),
            vec![Inbound::GoAway]
        );
    }

    #[test]
    fn test_interruption_precedes_audio_in_same_frame() {
        let frame = json!({
            "serverContent": {
                "modelTurn": {"parts": [{"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": "AAAA"}}]},
                "interrupted": true
            }
        });
        let events = decode_frame(&frame.to_string()).unwrap();
        assert_eq!(events[0], Inbound::Interruption);
        assert_eq!(
            events[1],
            Inbound::Audio(AudioPayload {
                data: "AAAA".to_string(),
                sample_rate: 24000
            })
        );
    }

    #[test]
    fn test_transcripts_and_turn_complete() {
        let frame = json!({
            "serverContent": {
                "inputTranscription": {"text": "what's ahead"},
                "outputTranscription": {"text": "A chair two meters ahead."},
                "turnComplete": true
            }
        });
        let events = decode_frame(&frame.to_string()).unwrap();
        assert_eq!(
            events,
            vec![
                Inbound::Transcript {
                    role: Role::User,
                    text: "what's ahead".to_string()
                },
                Inbound::Transcript {
                    role: Role::Assistant,
                    text: "A chair two meters ahead.".to_string()
                },
                Inbound::TurnComplete,
            ]
        );
    }

    #[test]
    fn test_malformed_parts_are_skipped() {
        let frame = json!({
            "serverContent": {
                "modelTurn": {"parts": [
                    {"inlineData": {"mimeType": "audio/pcm"}},
                    {"inlineData": {"data": "BBBB"}},
                    {"text": "   "}
                ]},
                "outputTranscription": {}
            }
        });
        let events = decode_frame(&frame.to_string()).unwrap();
        assert_eq!(
            events,
            vec![Inbound::Audio(AudioPayload {
                data: "BBBB".to_string(),
                sample_rate: OUTPUT_SAMPLE_RATE
            })]
        );
    }

    #[test]
    fn test_unknown_frames_decode_to_nothing() {
        assert!(decode_frame(r#"{"usageMetadata":{"totalTokenCount":5}}"#).unwrap().is_empty());
        assert!(decode_frame("not json").is_err());
    }
}

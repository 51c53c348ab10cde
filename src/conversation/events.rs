//! # Realtime Wire Events
//!
//! JSON events exchanged with the realtime conversation service. Every event is
//! an object tagged by its `type` field.
//!
//! ## Client Events:
//! - `session.update`: voice, instructions, audio formats, VAD and tools
//! - `input_audio_buffer.append`: one base64 chunk of pcm16 input audio
//!
//! ## Server Events:
//! Only the events the relay reacts to are modelled; anything else parses as
//! [`ServerEvent::Other`] and is skipped.

use crate::conversation::{ConversationUpdate, SessionOptions};
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionConfig },

    #[serde(rename = "input_audio_buffer.append")]
    InputAudioAppend { audio: String },
}

impl ClientEvent {
    pub fn session_update(options: &SessionOptions) -> Self {
        ClientEvent::SessionUpdate {
            session: SessionConfig::from_options(options),
        }
    }

    pub fn append_audio(pcm: &[u8]) -> Self {
        ClientEvent::InputAudioAppend {
            audio: STANDARD.encode(pcm),
        }
    }
}

/// `session` object of a `session.update` event.
#[derive(Debug, Clone, Serialize)]
pub struct SessionConfig {
    pub modalities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    pub voice: String,
    pub input_audio_format: String,
    pub output_audio_format: String,
    pub input_audio_transcription: TranscriptionConfig,
    pub turn_detection: TurnDetectionConfig,
    pub tools: Vec<ToolConfig>,
    pub tool_choice: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TranscriptionConfig {
    pub model: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TurnDetectionConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub threshold: f32,
    pub silence_duration_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl SessionConfig {
    pub fn from_options(options: &SessionOptions) -> Self {
        Self {
            modalities: vec!["text".to_string(), "audio".to_string()],
            instructions: options.instructions.clone(),
            voice: options.voice.clone(),
            input_audio_format: "pcm16".to_string(),
            output_audio_format: "pcm16".to_string(),
            input_audio_transcription: TranscriptionConfig {
                model: options.transcription_model.clone(),
            },
            turn_detection: TurnDetectionConfig {
                kind: "server_vad".to_string(),
                threshold: options.turn_detection.threshold,
                silence_duration_ms: options.turn_detection.silence_duration.as_millis() as u64,
            },
            tools: vec![ToolConfig {
                kind: "function".to_string(),
                name: options.finish_tool.name.clone(),
                description: options.finish_tool.description.clone(),
                parameters: json!({ "type": "object", "properties": {} }),
            }],
            tool_choice: "auto".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "session.created")]
    SessionCreated {
        #[serde(default)]
        session: SessionInfo,
    },

    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted,

    #[serde(rename = "input_audio_buffer.speech_stopped")]
    SpeechStopped,

    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    InputTranscriptionCompleted {
        #[serde(default)]
        transcript: String,
    },

    #[serde(rename = "response.audio.delta")]
    AudioDelta { delta: String },

    #[serde(rename = "response.text.delta")]
    TextDelta { delta: String },

    #[serde(rename = "response.audio_transcript.delta")]
    AudioTranscriptDelta { delta: String },

    #[serde(rename = "response.output_item.done")]
    OutputItemDone { item: OutputItem },

    #[serde(rename = "error")]
    Error { error: ErrorDetail },

    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionInfo {
    pub id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutputItem {
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ErrorDetail {
    #[serde(default)]
    pub message: String,
    pub code: Option<String>,
}

impl ServerEvent {
    /// Map a wire event to the update the dispatcher handles.
    ///
    /// ## Returns:
    /// `None` for events the relay ignores, and for audio deltas whose payload is
    /// not valid base64.
    pub fn into_update(self) -> Option<ConversationUpdate> {
        match self {
            ServerEvent::SessionCreated { session } => Some(ConversationUpdate::Started {
                session_id: session.id,
            }),
            ServerEvent::SpeechStarted => Some(ConversationUpdate::SpeechStarted),
            ServerEvent::SpeechStopped => Some(ConversationUpdate::SpeechStopped),
            ServerEvent::InputTranscriptionCompleted { transcript } => {
                Some(ConversationUpdate::InputTranscriptionCompleted { transcript })
            }
            ServerEvent::AudioDelta { delta } => match STANDARD.decode(delta.as_bytes()) {
                Ok(audio) => Some(ConversationUpdate::OutputDelta {
                    audio: Some(audio),
                    text: None,
                }),
                Err(err) => {
                    warn!(error = %err, "Skipping audio delta with invalid base64");
                    None
                }
            },
            ServerEvent::TextDelta { delta } | ServerEvent::AudioTranscriptDelta { delta } => {
                Some(ConversationUpdate::OutputDelta {
                    audio: None,
                    text: Some(delta),
                })
            }
            ServerEvent::OutputItemDone { item } => {
                let function_name = match item.kind.as_deref() {
                    Some("function_call") => item.name,
                    _ => None,
                };
                Some(ConversationUpdate::OutputItemFinished {
                    item_id: item.id,
                    function_name,
                })
            }
            ServerEvent::Error { error } => Some(ConversationUpdate::Error {
                message: error.message,
                code: error.code,
            }),
            ServerEvent::Other => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioFormat;
    use crate::conversation::{ToolDefinition, TurnDetection};
    use std::time::Duration;

    fn parse(json: &str) -> Option<ConversationUpdate> {
        serde_json::from_str::<ServerEvent>(json).unwrap().into_update()
    }

    #[test]
    fn test_session_update_carries_finish_tool_and_vad() {
        let options = SessionOptions {
            instructions: Some("Be brief.".to_string()),
            voice: "alloy".to_string(),
            audio_format: AudioFormat::default(),
            transcription_model: "whisper-1".to_string(),
            turn_detection: TurnDetection {
                threshold: 0.5,
                silence_duration: Duration::from_millis(700),
            },
            finish_tool: ToolDefinition {
                name: "finish_conversation".to_string(),
                description: "End the call".to_string(),
            },
        };

        let value = serde_json::to_value(ClientEvent::session_update(&options)).unwrap();
        assert_eq!(value["type"], "session.update");
        let session = &value["session"];
        assert_eq!(session["instructions"], "Be brief.");
        assert_eq!(session["input_audio_format"], "pcm16");
        assert_eq!(session["turn_detection"]["type"], "server_vad");
        assert_eq!(session["turn_detection"]["silence_duration_ms"], 700);
        assert_eq!(session["input_audio_transcription"]["model"], "whisper-1");
        assert_eq!(session["tools"][0]["type"], "function");
        assert_eq!(session["tools"][0]["name"], "finish_conversation");
        assert_eq!(session["tools"][0]["parameters"]["type"], "object");
    }

    #[test]
    fn test_append_audio_is_base64() {
        let value = serde_json::to_value(ClientEvent::append_audio(&[0, 1, 2, 255])).unwrap();
        assert_eq!(value["type"], "input_audio_buffer.append");
        assert_eq!(value["audio"], "AAEC/w==");
    }

    #[test]
    fn test_server_events_map_to_updates() {
        assert_eq!(
            parse(r#"{"type":"session.created","event_id":"e1","session":{"id":"sess_1","voice":"alloy"}}"#),
            Some(ConversationUpdate::Started {
                session_id: Some("sess_1".to_string())
            })
        );
        assert_eq!(
            parse(r#"{"type":"input_audio_buffer.speech_started","audio_start_ms":120,"item_id":"i1"}"#),
            Some(ConversationUpdate::SpeechStarted)
        );
        assert_eq!(
            parse(r#"{"type":"response.audio.delta","response_id":"r1","delta":"AQI="}"#),
            Some(ConversationUpdate::OutputDelta {
                audio: Some(vec![1, 2]),
                text: None
            })
        );
        assert_eq!(
            parse(r#"{"type":"response.audio_transcript.delta","delta":"Hel"}"#),
            Some(ConversationUpdate::OutputDelta {
                audio: None,
                text: Some("Hel".to_string())
            })
        );
        assert_eq!(
            parse(r#"{"type":"error","error":{"type":"invalid_request_error","code":"bad_value","message":"nope"}}"#),
            Some(ConversationUpdate::Error {
                message: "nope".to_string(),
                code: Some("bad_value".to_string())
            })
        );
    }

    #[test]
    fn test_only_function_calls_carry_a_function_name() {
        assert_eq!(
            parse(r#"{"type":"response.output_item.done","item":{"id":"i2","type":"function_call","name":"finish_conversation","arguments":"{}"}}"#),
            Some(ConversationUpdate::OutputItemFinished {
                item_id: Some("i2".to_string()),
                function_name: Some("finish_conversation".to_string())
            })
        );
        assert_eq!(
            parse(r#"{"type":"response.output_item.done","item":{"id":"i3","type":"message","role":"assistant"}}"#),
            Some(ConversationUpdate::OutputItemFinished {
                item_id: Some("i3".to_string()),
                function_name: None
            })
        );
    }

    #[test]
    fn test_unknown_and_malformed_events_are_skipped() {
        assert_eq!(parse(r#"{"type":"rate_limits.updated","rate_limits":[]}"#), None);
        assert_eq!(parse(r#"{"type":"response.audio.delta","delta":"not base64!"}"#), None);
    }
}

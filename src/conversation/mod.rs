//! # Conversation Sessions
//!
//! Everything the relay needs from the conversational-audio service, expressed
//! as a closed set of updates and three small traits:
//!
//! - **ConversationClient**: opens a session with a fixed [`SessionOptions`]
//! - **ConversationSession**: yields [`ConversationUpdate`]s in order until the
//!   service is done, and can be closed
//! - **AudioUplink**: accepts an [`AudioSource`] and streams it to the service
//!   until the source ends
//!
//! The [`dispatcher`] drives one session per client connection; [`realtime`]
//! implements the traits over the service's WebSocket event protocol.

pub mod dispatcher; // Session update state machine
pub mod events; // Wire-level realtime events
pub mod realtime; // WebSocket client for the realtime service

pub use dispatcher::{ConnectionContext, TerminationCause};

use crate::audio::{AudioFormat, AudioSource};
use crate::config::AppConfig;
use std::future::Future;
use std::time::Duration;

/// One typed event from a conversation session.
///
/// Matching on this enum is exhaustive on purpose: a new kind of update has to
/// be handled by the dispatcher before the crate builds.
#[derive(Debug, Clone, PartialEq)]
pub enum ConversationUpdate {
    /// The service accepted the session and is ready for audio
    Started { session_id: Option<String> },

    /// Voice activity detection heard the user start talking
    SpeechStarted,

    /// Voice activity detection heard the user stop talking
    SpeechStopped,

    /// Transcript of what the user said
    InputTranscriptionCompleted { transcript: String },

    /// Streamed response fragment; either part may be missing
    OutputDelta {
        audio: Option<Vec<u8>>,
        text: Option<String>,
    },

    /// A response item is complete; `function_name` is set for tool calls
    OutputItemFinished {
        item_id: Option<String>,
        function_name: Option<String>,
    },

    /// The service reported a failure
    Error {
        message: String,
        code: Option<String>,
    },
}

/// Server-side voice activity detection settings.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnDetection {
    /// Activation threshold in `[0, 1]`; higher needs louder speech
    pub threshold: f32,

    /// Trailing silence that ends a user turn
    pub silence_duration: Duration,
}

/// A no-argument tool the model can call.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
}

/// Fixed per-session configuration, applied once at session start.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOptions {
    pub instructions: Option<String>,
    pub voice: String,
    pub audio_format: AudioFormat,
    pub transcription_model: String,
    pub turn_detection: TurnDetection,

    /// Calling this tool ends the conversation
    pub finish_tool: ToolDefinition,
}

impl SessionOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        let conversation = &config.conversation;
        Self {
            instructions: conversation.instructions.clone(),
            voice: conversation.voice.clone(),
            audio_format: config.audio.format(),
            transcription_model: conversation.transcription_model.clone(),
            turn_detection: TurnDetection {
                threshold: conversation.vad_threshold,
                silence_duration: Duration::from_millis(conversation.silence_duration_ms),
            },
            finish_tool: ToolDefinition {
                name: conversation.finish_tool_name.clone(),
                description: conversation.finish_tool_description.clone(),
            },
        }
    }
}

/// Opens conversation sessions.
pub trait ConversationClient: Send + Sync + 'static {
    type Session: ConversationSession;

    fn start_session(
        &self,
        options: &SessionOptions,
    ) -> impl Future<Output = anyhow::Result<Self::Session>> + Send;
}

/// A live session: an ordered, finite, non-restartable stream of updates.
pub trait ConversationSession: Send + 'static {
    type Uplink: AudioUplink;

    /// Next update, or `None` once the session has nothing more to say.
    fn next_update(&mut self) -> impl Future<Output = Option<ConversationUpdate>> + Send;

    /// Handle for streaming client audio into this session.
    fn uplink(&self) -> Self::Uplink;

    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

/// Input-audio sink of a session.
pub trait AudioUplink: Send + 'static {
    /// Stream `source` to the service until it reaches end of stream.
    fn send_input_audio(
        self,
        source: AudioSource,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_options_follow_config() {
        let mut config = AppConfig::default();
        config.audio.sample_rate = 16000;
        config.conversation.vad_threshold = 0.6;
        config.conversation.silence_duration_ms = 800;
        config.conversation.finish_tool_name = "hang_up".to_string();

        let options = SessionOptions::from_config(&config);
        assert_eq!(options.audio_format.sample_rate, 16000);
        assert_eq!(options.turn_detection.threshold, 0.6);
        assert_eq!(options.turn_detection.silence_duration, Duration::from_millis(800));
        assert_eq!(options.finish_tool.name, "hang_up");
    }
}

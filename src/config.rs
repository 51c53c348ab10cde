//! # Configuration Management
//!
//! This module handles loading and validating the relay's configuration from
//! multiple sources:
//! - TOML configuration file (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Deployment variables (HOST, PORT, REALTIME_API_KEY)
//! 2. Environment variables (APP_SERVER__PORT, APP_AUDIO__SAMPLE_RATE, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)
//!
//! ## Sections:
//! - **server**: where the HTTP/WebSocket listener binds
//! - **audio**: PCM format of the client stream and how it is buffered
//! - **conversation**: realtime service endpoint and session behavior
//! - **performance**: concurrency limit and socket heartbeat

use crate::audio::AudioFormat;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Main application configuration that contains all settings.
///
/// ## Why separate config structs:
/// Each section maps to one `[section]` table in config.toml and one
/// `APP_<SECTION>__` family of environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub audio: AudioSettings,
    pub conversation: ConversationConfig,
    pub performance: PerformanceConfig,
}

/// Server-specific configuration settings.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Client audio format and buffering.
///
/// ## Fields:
/// - `sample_rate` / `channels` / `bit_depth`: PCM layout of the client's binary
///   frames, also declared to the conversation service
/// - `window_seconds`: how much audio the ring buffer holds before the oldest
///   unread bytes are overwritten
/// - `receive_chunk_ms`: largest slice copied into the ring per receive event
/// - `uplink_chunk_ms`: size of each audio chunk sent to the service
/// - `read_poll_interval_ms`: longest a blocked reader sleeps between checks of
///   the socket state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioSettings {
    pub sample_rate: u32,
    pub channels: u16,
    pub bit_depth: u16,
    pub window_seconds: u32,
    pub receive_chunk_ms: u64,
    pub uplink_chunk_ms: u64,
    pub read_poll_interval_ms: u64,
}

impl AudioSettings {
    pub fn format(&self) -> AudioFormat {
        AudioFormat {
            sample_rate: self.sample_rate,
            channels: self.channels,
            bit_depth: self.bit_depth,
        }
    }
}

/// Realtime conversation service settings.
///
/// ## Authentication:
/// `api_key` is usually left out of config.toml and supplied through the
/// `REALTIME_API_KEY` environment variable instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationConfig {
    /// WebSocket URL of the realtime service (ws:// or wss://)
    pub endpoint: String,

    /// Azure deployment name, appended as a `deployment` query parameter
    pub deployment: Option<String>,
    pub api_key: Option<String>,
    pub voice: String,
    pub instructions: Option<String>,
    pub transcription_model: String,

    /// Server VAD activation threshold, between 0 and 1
    pub vad_threshold: f32,
    pub silence_duration_ms: u64,

    /// Tool the model calls to end the conversation
    pub finish_tool_name: String,
    pub finish_tool_description: String,

    /// Reason sent with the normal-closure frame at the end of a conversation
    pub close_reason: String,
    pub connect_timeout_secs: u64,

    /// How long teardown waits for the uplink before aborting it
    pub uplink_grace_ms: u64,
}

/// Performance tuning configuration.
///
/// ## Tuning guidelines:
/// - Each conversation holds one ring buffer (`window_seconds` of audio) and one
///   service connection, so the session limit bounds both memory and upstream
///   connections
/// - The client is dropped after `client_timeout_secs` without a ping or pong
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub max_concurrent_sessions: usize,
    pub heartbeat_interval_secs: u64,
    pub client_timeout_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(), // Localhost only (safe for development)
                port: 8080,
            },
            audio: AudioSettings {
                sample_rate: 24000, // pcm16 at the service's native rate
                channels: 1,
                bit_depth: 16,
                window_seconds: 10,
                receive_chunk_ms: 1000,
                uplink_chunk_ms: 100,
                read_poll_interval_ms: 100,
            },
            conversation: ConversationConfig {
                endpoint: "wss://api.openai.com/v1/realtime?model=gpt-4o-realtime-preview".to_string(),
                deployment: None,
                api_key: None,
                voice: "alloy".to_string(),
                instructions: None,
                transcription_model: "whisper-1".to_string(),
                vad_threshold: 0.5,
                silence_duration_ms: 500,
                finish_tool_name: "finish_conversation".to_string(),
                finish_tool_description: "Call this when the user says goodbye or the conversation is complete.".to_string(),
                close_reason: "Conversation finished".to_string(),
                connect_timeout_secs: 10,
                uplink_grace_ms: 2000,
            },
            performance: PerformanceConfig {
                max_concurrent_sessions: 10,
                heartbeat_interval_secs: 5,
                client_timeout_secs: 30,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`: Override server port
    /// - `APP_AUDIO__SAMPLE_RATE=16000`: Override the client sample rate
    /// - `APP_CONVERSATION__VOICE=verse`: Override the response voice
    /// - `HOST=0.0.0.0` / `PORT=3000`: Special cases for deployment platforms
    /// - `REALTIME_API_KEY=...`: Service key, kept out of config files
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            // 1. Start with defaults - converts our Default impl to config format
            .add_source(config::Config::try_from(&AppConfig::default())?)
            // 2. Load from config.toml file (if it exists)
            .add_source(config::File::with_name("config").required(false))
            // 3. APP_<SECTION>__<FIELD>; field names contain single underscores
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        // Handle special environment variables used by deployment platforms
        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        if let Ok(key) = env::var("REALTIME_API_KEY") {
            settings = settings.set_override("conversation.api_key", key)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Server port is not 0
    /// - The audio format describes at least one whole byte per sample, and the
    ///   ring buffer window is not empty
    /// - A blocked reader wakes up periodically (poll interval above 0)
    /// - VAD threshold lies in `[0, 1]` and a finish tool is named
    /// - At least one conversation may run
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        let audio = &self.audio;
        if audio.sample_rate == 0 || audio.channels == 0 {
            return Err(anyhow::anyhow!("Sample rate and channel count must be greater than 0"));
        }

        if audio.bit_depth == 0 || audio.bit_depth % 8 != 0 {
            return Err(anyhow::anyhow!(
                "Bit depth must be a non-zero multiple of 8, got {}",
                audio.bit_depth
            ));
        }

        if audio.window_seconds == 0 {
            return Err(anyhow::anyhow!("Audio window must be at least 1 second"));
        }

        if audio.read_poll_interval_ms == 0 {
            return Err(anyhow::anyhow!("Read poll interval must be greater than 0"));
        }

        // Uplink reads are exact-size, so a chunk has to fit in the ring.
        let format = audio.format();
        let window = format.window_capacity(audio.window_seconds);
        let uplink_chunk = format.bytes_for(Duration::from_millis(audio.uplink_chunk_ms));
        if audio.uplink_chunk_ms == 0 {
            return Err(anyhow::anyhow!("Uplink chunk must be at least 1 ms"));
        }
        if uplink_chunk > window {
            return Err(anyhow::anyhow!(
                "Uplink chunk of {} bytes exceeds the {} byte audio window",
                uplink_chunk,
                window
            ));
        }

        let receive_chunk = format.bytes_for(Duration::from_millis(audio.receive_chunk_ms));
        if receive_chunk > window {
            return Err(anyhow::anyhow!(
                "Receive chunk of {} bytes exceeds the {} byte audio window",
                receive_chunk,
                window
            ));
        }

        let conversation = &self.conversation;
        if !(0.0..=1.0).contains(&conversation.vad_threshold) {
            return Err(anyhow::anyhow!(
                "VAD threshold must be between 0 and 1, got {}",
                conversation.vad_threshold
            ));
        }

        if conversation.finish_tool_name.trim().is_empty() {
            return Err(anyhow::anyhow!("Finish tool name cannot be empty"));
        }

        if self.performance.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }

        Ok(())
    }
}

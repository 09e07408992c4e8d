//! Engine configuration.
//!
//! Defaults mirror what the backend expects for a voice session: pcm16 audio
//! both ways, whisper-1 input transcription and server-side voice activity
//! detection. Callers override fields before `connect()`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::audio::DEFAULT_SAMPLE_RATE;
use crate::protocol::{InputTranscription, MaxTokens, SessionConfig, TurnDetection};

/// Default backend endpoint.
pub const DEFAULT_REALTIME_URL: &str = "wss://api.openai.com/v1/realtime";

/// Default model.
pub const DEFAULT_MODEL: &str = "gpt-4o-mini-realtime-preview";

/// Default caller inactivity timeout in seconds.
pub const DEFAULT_SILENCE_TIMEOUT_SECS: u64 = 30;

/// Configuration for a realtime session engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Backend WebSocket endpoint
    pub url: String,

    /// API key for bearer authentication
    pub api_key: String,

    /// Model to request
    pub model: String,

    /// Initial session configuration pushed on connect
    pub session: SessionConfig,

    /// Caller inactivity period before the session is terminated
    #[serde(with = "duration_secs")]
    pub silence_timeout: Duration,

    /// Sample rate for input audio buffers (Hz)
    pub sample_rate: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            url: DEFAULT_REALTIME_URL.to_string(),
            api_key: String::new(),
            model: DEFAULT_MODEL.to_string(),
            session: default_session_config(),
            silence_timeout: Duration::from_secs(DEFAULT_SILENCE_TIMEOUT_SECS),
            sample_rate: DEFAULT_SAMPLE_RATE,
        }
    }
}

impl EngineConfig {
    /// Build a config from the environment.
    ///
    /// Reads `OPENAI_API_KEY` and optionally `OPENAI_REALTIME_URL`; loads a
    /// `.env` file first when one is present.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        let mut config = EngineConfig::default();
        if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            config.api_key = key;
        }
        if let Ok(url) = std::env::var("OPENAI_REALTIME_URL") {
            config.url = url;
        }
        config
    }

    /// Endpoint URL with the model query parameter.
    pub fn endpoint(&self) -> String {
        format!("{}?model={}", self.url, self.model)
    }
}

/// The session configuration a fresh engine starts from.
pub fn default_session_config() -> SessionConfig {
    SessionConfig {
        modalities: Some(vec!["text".to_string(), "audio".to_string()]),
        instructions: None,
        voice: Some("alloy".to_string()),
        input_audio_format: Some("pcm16".to_string()),
        output_audio_format: Some("pcm16".to_string()),
        input_audio_transcription: Some(InputTranscription {
            model: "whisper-1".to_string(),
        }),
        turn_detection: Some(TurnDetection::ServerVad {
            threshold: Some(0.5),
            prefix_padding_ms: Some(300),
            silence_duration_ms: Some(200),
        }),
        tools: Some(Vec::new()),
        tool_choice: Some("auto".to_string()),
        temperature: Some(0.8),
        max_response_output_tokens: Some(MaxTokens::Number(4096)),
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

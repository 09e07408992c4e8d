//! Wire protocol for the realtime backend.
//!
//! The backend speaks small JSON events over one duplex WebSocket. Client and
//! server events are closed tagged unions keyed on the `type` field, so an
//! unknown event fails at decode time instead of at a runtime table lookup.
//!
//! Client events: `session.update`, `input_audio_buffer.append` /
//! `.commit` / `.clear`, `conversation.item.create` / `.truncate` /
//! `.delete`, `response.create`, `response.cancel`.
//!
//! Server events: session lifecycle, speech detection, conversation item
//! lifecycle, and the incremental `response.*` delta stream the
//! [`ConversationStore`](crate::conversation::ConversationStore) folds.

use serde::{Deserialize, Serialize};

use crate::audio;

// =============================================================================
// Session configuration (wire shape)
// =============================================================================

/// Session configuration pushed with `session.update`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Response modalities (text, audio)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modalities: Option<Vec<String>>,

    /// System instructions for the assistant
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,

    /// Voice for audio output
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,

    /// Input audio format
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_format: Option<String>,

    /// Output audio format
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_audio_format: Option<String>,

    /// Input audio transcription configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<InputTranscription>,

    /// Turn detection configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn_detection: Option<TurnDetection>,

    /// Tool definitions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolDef>>,

    /// Tool choice strategy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<String>,

    /// Temperature for response generation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    /// Maximum response output tokens
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_response_output_tokens: Option<MaxTokens>,
}

/// Maximum tokens: a number or the string `"inf"`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MaxTokens {
    /// Specific number of tokens
    Number(i32),
    /// Infinite tokens ("inf")
    Infinite(String),
}

/// Input audio transcription configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputTranscription {
    /// Transcription model (e.g. "whisper-1")
    pub model: String,
}

/// Turn detection configuration.
///
/// `None` means turn-taking is caller-controlled: the caller commits the
/// input buffer and requests responses explicitly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TurnDetection {
    /// Server-side voice activity detection
    #[serde(rename = "server_vad")]
    ServerVad {
        /// Activation threshold (0.0 to 1.0)
        #[serde(skip_serializing_if = "Option::is_none")]
        threshold: Option<f32>,
        /// Audio to include before detected speech (ms)
        #[serde(skip_serializing_if = "Option::is_none")]
        prefix_padding_ms: Option<u32>,
        /// Silence duration that ends a turn (ms)
        #[serde(skip_serializing_if = "Option::is_none")]
        silence_duration_ms: Option<u32>,
    },
    /// No server-side turn detection
    #[serde(rename = "none")]
    None {},
}

/// Tool definition advertised to the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDef {
    /// Tool type (always "function")
    #[serde(rename = "type")]
    pub tool_type: String,
    /// Function name
    pub name: String,
    /// Function description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON schema for the function parameters
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,
}

impl ToolDef {
    /// Build a function tool definition.
    pub fn function(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        ToolDef {
            tool_type: "function".to_string(),
            name: name.into(),
            description: Some(description.into()),
            parameters: Some(parameters),
        }
    }
}

// =============================================================================
// Conversation items (wire shape)
// =============================================================================

/// A conversation item as it appears on the wire.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ItemPayload {
    /// Item ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Item type (message, function_call, function_call_output)
    #[serde(rename = "type")]
    pub item_type: String,
    /// Item status (in_progress, completed, incomplete)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Item role (user, assistant, system)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Content parts
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<Vec<ContentPart>>,
    /// Call ID for function calls and their outputs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    /// Function name for function calls
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Raw JSON arguments for function calls
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
    /// Result payload for function call outputs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

impl ItemPayload {
    /// Build a user message item with text content.
    pub fn user_text(text: impl Into<String>) -> Self {
        ItemPayload {
            item_type: "message".to_string(),
            role: Some("user".to_string()),
            content: Some(vec![ContentPart {
                part_type: "input_text".to_string(),
                text: Some(text.into()),
                audio: None,
                transcript: None,
            }]),
            ..Default::default()
        }
    }

    /// Build a user message item from arbitrary content parts. Input-audio
    /// parts are expected to already be base64 encoded.
    pub fn user_message(content: Vec<ContentPart>) -> Self {
        ItemPayload {
            item_type: "message".to_string(),
            role: Some("user".to_string()),
            content: Some(content),
            ..Default::default()
        }
    }

    /// Build a function call output item answering `call_id`.
    pub fn function_call_output(call_id: impl Into<String>, output: impl Into<String>) -> Self {
        ItemPayload {
            item_type: "function_call_output".to_string(),
            call_id: Some(call_id.into()),
            output: Some(output.into()),
            ..Default::default()
        }
    }
}

/// One content part within a conversation item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentPart {
    /// Content type (input_text, input_audio, text, audio)
    #[serde(rename = "type")]
    pub part_type: String,
    /// Text content
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Audio content (base64 encoded on the wire)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<String>,
    /// Transcript of audio content
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transcript: Option<String>,
}

impl ContentPart {
    /// An input-audio content part, encoding raw PCM at the wire boundary.
    pub fn input_audio(pcm: &[u8]) -> Self {
        ContentPart {
            part_type: "input_audio".to_string(),
            text: None,
            audio: Some(audio::bytes_to_base64(pcm)),
            transcript: None,
        }
    }
}

// =============================================================================
// Client events
// =============================================================================

/// Events sent to the backend.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    /// Update session configuration
    #[serde(rename = "session.update")]
    SessionUpdate {
        /// Session configuration
        session: SessionConfig,
    },

    /// Append audio to the input buffer
    #[serde(rename = "input_audio_buffer.append")]
    InputAudioBufferAppend {
        /// Base64-encoded audio
        audio: String,
    },

    /// Commit the input audio buffer as a user item
    #[serde(rename = "input_audio_buffer.commit")]
    InputAudioBufferCommit,

    /// Clear the input audio buffer
    #[serde(rename = "input_audio_buffer.clear")]
    InputAudioBufferClear,

    /// Create a conversation item
    #[serde(rename = "conversation.item.create")]
    ConversationItemCreate {
        /// Item to create
        item: ItemPayload,
    },

    /// Truncate a conversation item's audio
    #[serde(rename = "conversation.item.truncate")]
    ConversationItemTruncate {
        /// Item ID
        item_id: String,
        /// Index of the audio content part
        content_index: u32,
        /// Audio end in ms
        audio_end_ms: u64,
    },

    /// Delete a conversation item
    #[serde(rename = "conversation.item.delete")]
    ConversationItemDelete {
        /// Item ID
        item_id: String,
    },

    /// Request a response generation
    #[serde(rename = "response.create")]
    ResponseCreate,

    /// Cancel the in-flight response
    #[serde(rename = "response.cancel")]
    ResponseCancel,
}

impl ClientEvent {
    /// Create an audio append event, encoding raw bytes at the wire boundary.
    pub fn audio_append(data: &[u8]) -> Self {
        ClientEvent::InputAudioBufferAppend {
            audio: audio::bytes_to_base64(data),
        }
    }
}

// =============================================================================
// Server events
// =============================================================================

/// Events received from the backend.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    /// Error reported in-stream
    #[serde(rename = "error")]
    Error {
        /// Error details
        error: ApiError,
    },

    /// Session created
    #[serde(rename = "session.created")]
    SessionCreated {
        /// Session information
        session: SessionInfo,
    },

    /// Session configuration acknowledged
    #[serde(rename = "session.updated")]
    SessionUpdated {
        /// Session information
        session: SessionInfo,
    },

    /// Voice activity detected in the input buffer
    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted {
        /// Offset into the input audio in ms
        audio_start_ms: u64,
        /// Item the speech will become
        item_id: String,
    },

    /// End of voice activity in the input buffer
    #[serde(rename = "input_audio_buffer.speech_stopped")]
    SpeechStopped {
        /// Offset into the input audio in ms
        audio_end_ms: u64,
        /// Item the speech will become
        item_id: String,
    },

    /// Input audio buffer committed
    #[serde(rename = "input_audio_buffer.committed")]
    InputAudioBufferCommitted {
        /// Previous item ID
        previous_item_id: Option<String>,
        /// New item ID
        item_id: String,
    },

    /// Input audio buffer cleared
    #[serde(rename = "input_audio_buffer.cleared")]
    InputAudioBufferCleared,

    /// Conversation item created
    #[serde(rename = "conversation.item.created")]
    ItemCreated {
        /// Previous item ID
        previous_item_id: Option<String>,
        /// Created item
        item: ItemPayload,
    },

    /// User audio transcription completed
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    TranscriptionCompleted {
        /// Item ID
        item_id: String,
        /// Index of the transcribed content part
        content_index: u32,
        /// Transcript text
        transcript: String,
    },

    /// User audio transcription failed
    #[serde(rename = "conversation.item.input_audio_transcription.failed")]
    TranscriptionFailed {
        /// Item ID
        item_id: String,
        /// Index of the content part
        content_index: u32,
        /// Error details
        error: ApiError,
    },

    /// Conversation item audio truncated
    #[serde(rename = "conversation.item.truncated")]
    ItemTruncated {
        /// Item ID
        item_id: String,
        /// Index of the audio content part
        content_index: u32,
        /// Audio end in ms
        audio_end_ms: u64,
    },

    /// Conversation item deleted
    #[serde(rename = "conversation.item.deleted")]
    ItemDeleted {
        /// Item ID
        item_id: String,
    },

    /// Response generation started
    #[serde(rename = "response.created")]
    ResponseCreated {
        /// Response information
        response: ResponseInfo,
    },

    /// Response generation finished
    #[serde(rename = "response.done")]
    ResponseDone {
        /// Response information
        response: ResponseInfo,
    },

    /// Output item added to a response
    #[serde(rename = "response.output_item.added")]
    OutputItemAdded {
        /// Response ID
        response_id: String,
        /// Output index
        output_index: u32,
        /// Item
        item: ItemPayload,
    },

    /// Output item reached a terminal state
    #[serde(rename = "response.output_item.done")]
    OutputItemDone {
        /// Response ID
        response_id: String,
        /// Output index
        output_index: u32,
        /// Item with final status
        item: ItemPayload,
    },

    /// Content part added to an item
    #[serde(rename = "response.content_part.added")]
    ContentPartAdded {
        /// Response ID
        response_id: String,
        /// Item ID
        item_id: String,
        /// Output index
        output_index: u32,
        /// Content index
        content_index: u32,
        /// Content part
        part: ContentPart,
    },

    /// Text delta
    #[serde(rename = "response.text.delta")]
    TextDelta {
        /// Response ID
        response_id: String,
        /// Item ID
        item_id: String,
        /// Output index
        output_index: u32,
        /// Content index
        content_index: u32,
        /// Text fragment
        delta: String,
    },

    /// Text complete
    #[serde(rename = "response.text.done")]
    TextDone {
        /// Response ID
        response_id: String,
        /// Item ID
        item_id: String,
        /// Output index
        output_index: u32,
        /// Content index
        content_index: u32,
        /// Full text
        text: String,
    },

    /// Assistant audio transcript delta
    #[serde(rename = "response.audio_transcript.delta")]
    AudioTranscriptDelta {
        /// Response ID
        response_id: String,
        /// Item ID
        item_id: String,
        /// Output index
        output_index: u32,
        /// Content index
        content_index: u32,
        /// Transcript fragment
        delta: String,
    },

    /// Assistant audio transcript complete
    #[serde(rename = "response.audio_transcript.done")]
    AudioTranscriptDone {
        /// Response ID
        response_id: String,
        /// Item ID
        item_id: String,
        /// Output index
        output_index: u32,
        /// Content index
        content_index: u32,
        /// Full transcript
        transcript: String,
    },

    /// Audio delta (base64 PCM chunk)
    #[serde(rename = "response.audio.delta")]
    AudioDelta {
        /// Response ID
        response_id: String,
        /// Item ID
        item_id: String,
        /// Output index
        output_index: u32,
        /// Content index
        content_index: u32,
        /// Base64-encoded audio fragment
        delta: String,
    },

    /// Audio generation complete
    #[serde(rename = "response.audio.done")]
    AudioDone {
        /// Response ID
        response_id: String,
        /// Item ID
        item_id: String,
        /// Output index
        output_index: u32,
        /// Content index
        content_index: u32,
    },

    /// Function call arguments delta
    #[serde(rename = "response.function_call_arguments.delta")]
    FunctionCallArgumentsDelta {
        /// Response ID
        response_id: String,
        /// Item ID
        item_id: String,
        /// Output index
        output_index: u32,
        /// Call ID
        call_id: String,
        /// Arguments fragment
        delta: String,
    },

    /// Function call arguments complete
    #[serde(rename = "response.function_call_arguments.done")]
    FunctionCallArgumentsDone {
        /// Response ID
        response_id: String,
        /// Item ID
        item_id: String,
        /// Output index
        output_index: u32,
        /// Call ID
        call_id: String,
        /// Full arguments
        arguments: String,
    },

    /// Rate limits updated
    #[serde(rename = "rate_limits.updated")]
    RateLimitsUpdated {
        /// Rate limit information
        rate_limits: Vec<RateLimit>,
    },
}

impl ServerEvent {
    /// Wire name of the event (the `type` tag).
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::Error { .. } => "error",
            ServerEvent::SessionCreated { .. } => "session.created",
            ServerEvent::SessionUpdated { .. } => "session.updated",
            ServerEvent::SpeechStarted { .. } => "input_audio_buffer.speech_started",
            ServerEvent::SpeechStopped { .. } => "input_audio_buffer.speech_stopped",
            ServerEvent::InputAudioBufferCommitted { .. } => "input_audio_buffer.committed",
            ServerEvent::InputAudioBufferCleared => "input_audio_buffer.cleared",
            ServerEvent::ItemCreated { .. } => "conversation.item.created",
            ServerEvent::TranscriptionCompleted { .. } => {
                "conversation.item.input_audio_transcription.completed"
            }
            ServerEvent::TranscriptionFailed { .. } => {
                "conversation.item.input_audio_transcription.failed"
            }
            ServerEvent::ItemTruncated { .. } => "conversation.item.truncated",
            ServerEvent::ItemDeleted { .. } => "conversation.item.deleted",
            ServerEvent::ResponseCreated { .. } => "response.created",
            ServerEvent::ResponseDone { .. } => "response.done",
            ServerEvent::OutputItemAdded { .. } => "response.output_item.added",
            ServerEvent::OutputItemDone { .. } => "response.output_item.done",
            ServerEvent::ContentPartAdded { .. } => "response.content_part.added",
            ServerEvent::TextDelta { .. } => "response.text.delta",
            ServerEvent::TextDone { .. } => "response.text.done",
            ServerEvent::AudioTranscriptDelta { .. } => "response.audio_transcript.delta",
            ServerEvent::AudioTranscriptDone { .. } => "response.audio_transcript.done",
            ServerEvent::AudioDelta { .. } => "response.audio.delta",
            ServerEvent::AudioDone { .. } => "response.audio.done",
            ServerEvent::FunctionCallArgumentsDelta { .. } => {
                "response.function_call_arguments.delta"
            }
            ServerEvent::FunctionCallArgumentsDone { .. } => {
                "response.function_call_arguments.done"
            }
            ServerEvent::RateLimitsUpdated { .. } => "rate_limits.updated",
        }
    }
}

// =============================================================================
// Supporting types
// =============================================================================

/// In-stream error details.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    /// Error type
    #[serde(rename = "type")]
    pub error_type: String,
    /// Error code
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Error message
    pub message: String,
    /// Parameter that caused the error
    #[serde(skip_serializing_if = "Option::is_none")]
    pub param: Option<String>,
    /// Event ID that caused the error
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
}

/// Server-side session information.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionInfo {
    /// Session ID
    pub id: String,
    /// Model in use
    #[serde(default)]
    pub model: Option<String>,
    /// Expiry timestamp
    #[serde(default)]
    pub expires_at: Option<u64>,
}

/// Response metadata.
#[derive(Debug, Clone, Deserialize)]
pub struct ResponseInfo {
    /// Response ID
    pub id: String,
    /// Response status
    #[serde(default)]
    pub status: Option<String>,
    /// Output items
    #[serde(default)]
    pub output: Vec<ItemPayload>,
    /// Token usage
    #[serde(default)]
    pub usage: Option<Usage>,
}

/// Token usage for a response.
#[derive(Debug, Clone, Deserialize)]
pub struct Usage {
    /// Total tokens
    pub total_tokens: u32,
    /// Input tokens
    pub input_tokens: u32,
    /// Output tokens
    pub output_tokens: u32,
}

/// One rate limit bucket.
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimit {
    /// Bucket name
    pub name: String,
    /// Limit value
    pub limit: u32,
    /// Remaining value
    pub remaining: u32,
    /// Seconds until reset
    pub reset_seconds: f64,
}

// =============================================================================
// Tests
// =============================================================================

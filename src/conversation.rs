//! Conversation state machine.
//!
//! Folds the interleaved server event stream into an ordered set of
//! conversation items and responses. The store is the exclusive owner of
//! item and response state; nothing else mutates items.
//!
//! Deltas addressed to an item that the store has not seen are surfaced as
//! [`SessionError::NotFound`] except for `response.audio.delta`, which can
//! legitimately race item completion and is tolerated (logged, no-op).
//!
//! Speech segments and user transcripts can arrive before the item they
//! belong to exists; they are queued by item id and consumed at most once,
//! at item creation.

use std::collections::HashMap;

use bytes::Bytes;
use serde::Serialize;
use tracing::debug;

use crate::audio::ms_to_samples;
use crate::error::{SessionError, SessionResult};
use crate::protocol::{ContentPart, ItemPayload, ServerEvent};

// =============================================================================
// Item model
// =============================================================================

/// Kind of conversation item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    /// A user/assistant/system message
    Message,
    /// A function call requested by the model
    FunctionCall,
    /// The result answering a function call
    FunctionCallOutput,
}

impl ItemKind {
    fn from_wire(s: &str) -> Option<Self> {
        match s {
            "message" => Some(ItemKind::Message),
            "function_call" => Some(ItemKind::FunctionCall),
            "function_call_output" => Some(ItemKind::FunctionCallOutput),
            _ => None,
        }
    }
}

/// Speaker role of a message item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// End user
    User,
    /// The model
    Assistant,
    /// System-injected content
    System,
}

impl Role {
    fn from_wire(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "system" => Some(Role::System),
            _ => None,
        }
    }
}

/// Item status. Monotonic: once completed, never regresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    /// Still being produced
    InProgress,
    /// Terminal
    Completed,
}

impl ItemStatus {
    fn from_wire(s: &str) -> Self {
        if s == "completed" {
            ItemStatus::Completed
        } else {
            ItemStatus::InProgress
        }
    }
}

/// Tool descriptor accumulated on a function call item.
#[derive(Debug, Clone, Serialize)]
pub struct FormattedTool {
    /// Tool type (always "function")
    #[serde(rename = "type")]
    pub tool_type: String,
    /// Function name
    pub name: String,
    /// Call id the output must answer
    pub call_id: String,
    /// Raw JSON arguments, accumulated from deltas
    pub arguments: String,
}

/// Reconstructed, caller-friendly view of an item's content.
///
/// `audio` is raw PCM bytes and is append-only except under an explicit
/// truncation event. Snapshots serialize it as a sample count; raw audio
/// stays off the bus (base64 belongs to the wire boundary only).
#[derive(Debug, Clone, Default, Serialize)]
pub struct Formatted {
    /// Concatenated text parts and text deltas
    pub text: String,
    /// Accumulated transcript (single space = completed but empty)
    pub transcript: String,
    /// Raw audio bytes
    #[serde(rename = "audio_samples", serialize_with = "audio_as_len")]
    pub audio: Vec<u8>,
    /// Function call descriptor, when the item is a function call
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<FormattedTool>,
    /// Function call output payload
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
}

fn audio_as_len<S: serde::Serializer>(audio: &[u8], s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(audio.len() as u64)
}

/// One conversation item owned by the store.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationItem {
    /// Unique item id
    pub id: String,
    /// Item kind
    #[serde(rename = "type")]
    pub kind: ItemKind,
    /// Role, for message items
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    /// Current status
    pub status: ItemStatus,
    /// Wire content parts
    pub content: Vec<ContentPart>,
    /// Call id, for function calls and outputs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    /// Raw accumulated function call arguments
    #[serde(skip_serializing_if = "String::is_empty")]
    pub arguments: String,
    /// Reconstructed content
    pub formatted: Formatted,
}

impl ConversationItem {
    /// Status update that never regresses from completed.
    fn update_status(&mut self, status: ItemStatus) {
        if self.status != ItemStatus::Completed {
            self.status = status;
        }
    }
}

/// A generated turn referencing its output items in order.
#[derive(Debug, Clone, Serialize)]
pub struct ResponseState {
    /// Response id
    pub id: String,
    /// Ordered output item ids
    pub output: Vec<String>,
}

/// A provisional audio span queued before its item exists.
#[derive(Debug, Clone)]
pub struct SpeechSegment {
    /// Speech start offset into the input audio (ms)
    pub audio_start_ms: u64,
    /// Speech end offset (ms), set by speech_stopped
    pub audio_end_ms: Option<u64>,
    /// Slice of the live input buffer covering the span
    pub audio: Option<Vec<u8>>,
}

/// Incremental change produced by folding one event.
#[derive(Debug, Clone)]
pub enum StoreDelta {
    /// Text fragment appended
    Text(String),
    /// Transcript fragment appended (or completed user transcript)
    Transcript(String),
    /// Raw audio bytes appended
    Audio(Bytes),
    /// Function call arguments fragment appended
    Arguments(String),
}

impl StoreDelta {
    /// Bus-friendly JSON view. Audio reports its byte count; raw bytes stay
    /// inside the engine.
    pub fn to_value(&self) -> serde_json::Value {
        match self {
            StoreDelta::Text(t) => serde_json::json!({ "text": t }),
            StoreDelta::Transcript(t) => serde_json::json!({ "transcript": t }),
            StoreDelta::Audio(a) => serde_json::json!({ "audio_samples": a.len() }),
            StoreDelta::Arguments(a) => serde_json::json!({ "arguments": a }),
        }
    }
}

/// Result of folding one event: the affected item (if any) and the delta.
#[derive(Debug, Default)]
pub struct Outcome {
    /// Id of the item the event touched
    pub item_id: Option<String>,
    /// Incremental change, when the event carried one
    pub delta: Option<StoreDelta>,
}

impl Outcome {
    fn item(id: impl Into<String>) -> Self {
        Outcome {
            item_id: Some(id.into()),
            delta: None,
        }
    }

    fn with_delta(id: impl Into<String>, delta: StoreDelta) -> Self {
        Outcome {
            item_id: Some(id.into()),
            delta: Some(delta),
        }
    }

    fn none() -> Self {
        Outcome::default()
    }
}

// =============================================================================
// Store
// =============================================================================

/// State machine folding protocol events into conversation state.
pub struct ConversationStore {
    sample_rate: u32,
    items: HashMap<String, ConversationItem>,
    item_order: Vec<String>,
    responses: HashMap<String, ResponseState>,
    response_order: Vec<String>,
    queued_speech: HashMap<String, SpeechSegment>,
    queued_transcripts: HashMap<String, String>,
    queued_input_audio: Option<Vec<u8>>,
}

impl ConversationStore {
    /// Create an empty store folding audio offsets at `sample_rate` Hz.
    pub fn new(sample_rate: u32) -> Self {
        ConversationStore {
            sample_rate,
            items: HashMap::new(),
            item_order: Vec::new(),
            responses: HashMap::new(),
            response_order: Vec::new(),
            queued_speech: HashMap::new(),
            queued_transcripts: HashMap::new(),
            queued_input_audio: None,
        }
    }

    /// Reset all indices and queues. Called on disconnect and session reset.
    pub fn clear(&mut self) {
        self.items.clear();
        self.item_order.clear();
        self.responses.clear();
        self.response_order.clear();
        self.queued_speech.clear();
        self.queued_transcripts.clear();
        self.queued_input_audio = None;
    }

    /// Queue the committed input-audio buffer for merge into the next user
    /// message item.
    pub fn queue_input_audio(&mut self, audio: Vec<u8>) {
        self.queued_input_audio = Some(audio);
    }

    /// Look up an item by id.
    pub fn get_item(&self, id: &str) -> Option<&ConversationItem> {
        self.items.get(id)
    }

    /// Ordered snapshot of all items.
    pub fn items(&self) -> Vec<&ConversationItem> {
        self.item_order
            .iter()
            .filter_map(|id| self.items.get(id))
            .collect()
    }

    /// Look up a response by id.
    pub fn get_response(&self, id: &str) -> Option<&ResponseState> {
        self.responses.get(id)
    }

    /// Sample rate used for ms-to-sample arithmetic.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Fold one server event into the store.
    ///
    /// `input_audio` is the live input buffer, supplied for
    /// `speech_stopped` so the detected span can be sliced out of it.
    pub fn process_event(
        &mut self,
        event: &ServerEvent,
        input_audio: Option<&[u8]>,
    ) -> SessionResult<Outcome> {
        match event {
            ServerEvent::ItemCreated { item, .. } => self.on_item_created(item),
            ServerEvent::ItemTruncated {
                item_id,
                audio_end_ms,
                ..
            } => self.on_item_truncated(item_id, *audio_end_ms),
            ServerEvent::ItemDeleted { item_id } => self.on_item_deleted(item_id),
            ServerEvent::TranscriptionCompleted {
                item_id,
                content_index,
                transcript,
            } => self.on_transcription_completed(item_id, *content_index as usize, transcript),
            ServerEvent::SpeechStarted {
                audio_start_ms,
                item_id,
            } => {
                self.queued_speech.insert(
                    item_id.clone(),
                    SpeechSegment {
                        audio_start_ms: *audio_start_ms,
                        audio_end_ms: None,
                        audio: None,
                    },
                );
                Ok(Outcome::none())
            }
            ServerEvent::SpeechStopped {
                audio_end_ms,
                item_id,
            } => self.on_speech_stopped(item_id, *audio_end_ms, input_audio),
            ServerEvent::ResponseCreated { response } => {
                if !self.responses.contains_key(&response.id) {
                    self.responses.insert(
                        response.id.clone(),
                        ResponseState {
                            id: response.id.clone(),
                            output: Vec::new(),
                        },
                    );
                    self.response_order.push(response.id.clone());
                }
                Ok(Outcome::none())
            }
            ServerEvent::OutputItemAdded {
                response_id, item, ..
            } => self.on_output_item_added(response_id, item),
            ServerEvent::OutputItemDone { item, .. } => self.on_output_item_done(item),
            ServerEvent::ContentPartAdded { item_id, part, .. } => {
                let item = self.item_mut(item_id)?;
                item.content.push(part.clone());
                Ok(Outcome::item(item_id.clone()))
            }
            ServerEvent::TextDelta {
                item_id,
                content_index,
                delta,
                ..
            } => {
                let item = self.item_mut(item_id)?;
                if let Some(part) = item.content.get_mut(*content_index as usize) {
                    let text = part.text.get_or_insert_with(String::new);
                    text.push_str(delta);
                }
                item.formatted.text.push_str(delta);
                Ok(Outcome::with_delta(
                    item_id.clone(),
                    StoreDelta::Text(delta.clone()),
                ))
            }
            ServerEvent::AudioTranscriptDelta {
                item_id,
                content_index,
                delta,
                ..
            } => {
                let item = self.item_mut(item_id)?;
                if let Some(part) = item.content.get_mut(*content_index as usize) {
                    let transcript = part.transcript.get_or_insert_with(String::new);
                    transcript.push_str(delta);
                }
                item.formatted.transcript.push_str(delta);
                Ok(Outcome::with_delta(
                    item_id.clone(),
                    StoreDelta::Transcript(delta.clone()),
                ))
            }
            ServerEvent::AudioDelta { item_id, delta, .. } => self.on_audio_delta(item_id, delta),
            ServerEvent::FunctionCallArgumentsDelta { item_id, delta, .. } => {
                let item = self.item_mut(item_id)?;
                item.arguments.push_str(delta);
                if let Some(tool) = item.formatted.tool.as_mut() {
                    tool.arguments.push_str(delta);
                }
                Ok(Outcome::with_delta(
                    item_id.clone(),
                    StoreDelta::Arguments(delta.clone()),
                ))
            }
            other => Err(SessionError::ProtocolViolation(format!(
                "no conversation processor for \"{}\"",
                other.name()
            ))),
        }
    }

    fn item_mut(&mut self, id: &str) -> SessionResult<&mut ConversationItem> {
        self.items
            .get_mut(id)
            .ok_or_else(|| SessionError::not_found("item", id))
    }

    fn on_item_created(&mut self, payload: &ItemPayload) -> SessionResult<Outcome> {
        let id = payload
            .id
            .clone()
            .ok_or_else(|| SessionError::ProtocolViolation("item created without id".into()))?;

        if self.items.contains_key(&id) {
            // Duplicate create: keep existing state, queues stay untouched.
            return Ok(Outcome::item(id));
        }

        let kind = ItemKind::from_wire(&payload.item_type).ok_or_else(|| {
            SessionError::ProtocolViolation(format!("unknown item type \"{}\"", payload.item_type))
        })?;
        let role = payload.role.as_deref().and_then(Role::from_wire);

        let mut formatted = Formatted::default();

        // A speech segment queued for this id is consumed exactly once.
        if let Some(segment) = self.queued_speech.remove(&id) {
            if let Some(audio) = segment.audio {
                formatted.audio = audio;
            }
        }

        for part in payload.content.iter().flatten() {
            if part.part_type == "text" || part.part_type == "input_text" {
                if let Some(text) = &part.text {
                    formatted.text.push_str(text);
                }
            }
        }

        if let Some(transcript) = self.queued_transcripts.remove(&id) {
            formatted.transcript = transcript;
        }

        let status = match kind {
            ItemKind::Message => {
                if role == Some(Role::User) {
                    if let Some(audio) = self.queued_input_audio.take() {
                        formatted.audio = audio;
                    }
                    ItemStatus::Completed
                } else {
                    ItemStatus::InProgress
                }
            }
            ItemKind::FunctionCall => {
                formatted.tool = Some(FormattedTool {
                    tool_type: "function".to_string(),
                    name: payload.name.clone().unwrap_or_default(),
                    call_id: payload.call_id.clone().unwrap_or_default(),
                    arguments: String::new(),
                });
                ItemStatus::InProgress
            }
            ItemKind::FunctionCallOutput => {
                formatted.output = payload.output.clone();
                ItemStatus::Completed
            }
        };

        let item = ConversationItem {
            id: id.clone(),
            kind,
            role,
            status,
            content: payload.content.clone().unwrap_or_default(),
            call_id: payload.call_id.clone(),
            arguments: payload.arguments.clone().unwrap_or_default(),
            formatted,
        };
        self.items.insert(id.clone(), item);
        self.item_order.push(id.clone());
        Ok(Outcome::item(id))
    }

    fn on_item_truncated(&mut self, item_id: &str, audio_end_ms: u64) -> SessionResult<Outcome> {
        let sample_rate = self.sample_rate;
        let item = self.item_mut(item_id)?;
        let end_index = ms_to_samples(audio_end_ms, sample_rate);
        item.formatted.audio.truncate(end_index);
        item.formatted.transcript.clear();
        Ok(Outcome::item(item_id))
    }

    fn on_item_deleted(&mut self, item_id: &str) -> SessionResult<Outcome> {
        self.items
            .remove(item_id)
            .ok_or_else(|| SessionError::not_found("item", item_id))?;
        self.item_order.retain(|id| id != item_id);
        Ok(Outcome::item(item_id))
    }

    fn on_transcription_completed(
        &mut self,
        item_id: &str,
        content_index: usize,
        transcript: &str,
    ) -> SessionResult<Outcome> {
        // Single space marks "completed but empty", distinct from "not yet
        // received".
        let formatted_transcript = if transcript.is_empty() {
            " ".to_string()
        } else {
            transcript.to_string()
        };

        let Some(item) = self.items.get_mut(item_id) else {
            self.queued_transcripts
                .insert(item_id.to_string(), formatted_transcript);
            return Ok(Outcome::none());
        };

        if let Some(part) = item.content.get_mut(content_index) {
            part.transcript = Some(transcript.to_string());
        }
        item.formatted.transcript = formatted_transcript;
        Ok(Outcome::with_delta(
            item_id,
            StoreDelta::Transcript(transcript.to_string()),
        ))
    }

    fn on_speech_stopped(
        &mut self,
        item_id: &str,
        audio_end_ms: u64,
        input_audio: Option<&[u8]>,
    ) -> SessionResult<Outcome> {
        let sample_rate = self.sample_rate;
        let segment = self
            .queued_speech
            .get_mut(item_id)
            .ok_or_else(|| SessionError::not_found("speech segment", item_id))?;
        segment.audio_end_ms = Some(audio_end_ms);
        if let Some(buffer) = input_audio {
            let start = ms_to_samples(segment.audio_start_ms, sample_rate).min(buffer.len());
            let end = ms_to_samples(audio_end_ms, sample_rate).min(buffer.len());
            segment.audio = Some(buffer[start..end].to_vec());
        }
        Ok(Outcome::none())
    }

    fn on_output_item_added(
        &mut self,
        response_id: &str,
        item: &ItemPayload,
    ) -> SessionResult<Outcome> {
        let response = self
            .responses
            .get_mut(response_id)
            .ok_or_else(|| SessionError::not_found("response", response_id))?;
        if let Some(id) = &item.id {
            response.output.push(id.clone());
        }
        Ok(Outcome::none())
    }

    fn on_output_item_done(&mut self, payload: &ItemPayload) -> SessionResult<Outcome> {
        let id = payload.id.as_deref().ok_or_else(|| {
            SessionError::ProtocolViolation("output_item.done without item id".into())
        })?;
        let status = payload
            .status
            .as_deref()
            .map(ItemStatus::from_wire)
            .unwrap_or(ItemStatus::Completed);
        let item = self.item_mut(id)?;
        item.update_status(status);
        Ok(Outcome::item(id))
    }

    fn on_audio_delta(&mut self, item_id: &str, delta: &str) -> SessionResult<Outcome> {
        // Audio deltas race item completion; a missing item is tolerated.
        let Some(item) = self.items.get_mut(item_id) else {
            debug!(item_id, "audio delta for unknown item, skipping");
            return Ok(Outcome::none());
        };
        let bytes = crate::audio::base64_to_bytes(delta)
            .map_err(|e| SessionError::SerializationError(format!("audio delta: {e}")))?;
        item.formatted.audio.extend_from_slice(&bytes);
        Ok(Outcome::with_delta(
            item_id,
            StoreDelta::Audio(Bytes::from(bytes)),
        ))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::bytes_to_base64;
    use crate::protocol::ResponseInfo;

    const RATE: u32 = 16_000;

    fn store() -> ConversationStore {
        ConversationStore::new(RATE)
    }

    fn message_payload(id: &str, role: &str) -> ItemPayload {
        ItemPayload {
            id: Some(id.to_string()),
            item_type: "message".to_string(),
            role: Some(role.to_string()),
            content: Some(Vec::new()),
            ..Default::default()
        }
    }

    fn created(id: &str, role: &str) -> ServerEvent {
        ServerEvent::ItemCreated {
            previous_item_id: None,
            item: message_payload(id, role),
        }
    }

    fn response_created(id: &str) -> ServerEvent {
        let info: ResponseInfo =
            serde_json::from_value(serde_json::json!({ "id": id, "output": [] })).unwrap();
        ServerEvent::ResponseCreated { response: info }
    }

    fn text_delta(item_id: &str, delta: &str) -> ServerEvent {
        ServerEvent::TextDelta {
            response_id: "resp_1".to_string(),
            item_id: item_id.to_string(),
            output_index: 0,
            content_index: 0,
            delta: delta.to_string(),
        }
    }

    #[test]
    fn test_user_message_created_completed() {
        let mut s = store();
        let outcome = s.process_event(&created("item_1", "user"), None).unwrap();
        assert_eq!(outcome.item_id.as_deref(), Some("item_1"));
        let item = s.get_item("item_1").unwrap();
        assert_eq!(item.status, ItemStatus::Completed);
        assert_eq!(item.role, Some(Role::User));
    }

    #[test]
    fn test_assistant_message_in_progress() {
        let mut s = store();
        s.process_event(&created("item_1", "assistant"), None).unwrap();
        assert_eq!(
            s.get_item("item_1").unwrap().status,
            ItemStatus::InProgress
        );
    }

    #[test]
    fn test_text_deltas_concatenate_in_order() {
        let mut s = store();
        s.process_event(&created("item_1", "assistant"), None).unwrap();
        for piece in ["Hel", "lo ", "there"] {
            s.process_event(&text_delta("item_1", piece), None).unwrap();
        }
        assert_eq!(s.get_item("item_1").unwrap().formatted.text, "Hello there");
    }

    #[test]
    fn test_text_delta_unknown_item_is_not_found() {
        let mut s = store();
        let err = s.process_event(&text_delta("ghost", "x"), None).unwrap_err();
        assert!(matches!(err, SessionError::NotFound { .. }));
    }

    #[test]
    fn test_audio_delta_unknown_item_tolerated() {
        let mut s = store();
        let event = ServerEvent::AudioDelta {
            response_id: "resp_1".to_string(),
            item_id: "ghost".to_string(),
            output_index: 0,
            content_index: 0,
            delta: bytes_to_base64(&[1, 2, 3]),
        };
        let outcome = s.process_event(&event, None).unwrap();
        assert!(outcome.item_id.is_none());
    }

    #[test]
    fn test_audio_delta_appends_decoded_bytes() {
        let mut s = store();
        s.process_event(&created("item_1", "assistant"), None).unwrap();
        for chunk in [&[1u8, 2][..], &[3, 4][..]] {
            let event = ServerEvent::AudioDelta {
                response_id: "resp_1".to_string(),
                item_id: "item_1".to_string(),
                output_index: 0,
                content_index: 0,
                delta: bytes_to_base64(chunk),
            };
            s.process_event(&event, None).unwrap();
        }
        assert_eq!(s.get_item("item_1").unwrap().formatted.audio, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_truncate_clamps_and_clears_transcript() {
        let mut s = store();
        s.process_event(&created("item_1", "assistant"), None).unwrap();
        {
            let item = s.items.get_mut("item_1").unwrap();
            item.formatted.audio = vec![0u8; 8000];
            item.formatted.transcript = "something".to_string();
        }
        // 100 ms at 16 kHz = 1600 samples
        let event = ServerEvent::ItemTruncated {
            item_id: "item_1".to_string(),
            content_index: 0,
            audio_end_ms: 100,
        };
        s.process_event(&event, None).unwrap();
        let item = s.get_item("item_1").unwrap();
        assert_eq!(item.formatted.audio.len(), 1600);
        assert!(item.formatted.transcript.is_empty());

        // Truncating beyond the buffer keeps everything
        let event = ServerEvent::ItemTruncated {
            item_id: "item_1".to_string(),
            content_index: 0,
            audio_end_ms: 10_000,
        };
        s.process_event(&event, None).unwrap();
        assert_eq!(s.get_item("item_1").unwrap().formatted.audio.len(), 1600);
    }

    #[test]
    fn test_truncate_missing_item_is_not_found() {
        let mut s = store();
        let event = ServerEvent::ItemTruncated {
            item_id: "ghost".to_string(),
            content_index: 0,
            audio_end_ms: 10,
        };
        assert!(matches!(
            s.process_event(&event, None),
            Err(SessionError::NotFound { .. })
        ));
    }

    #[test]
    fn test_delete_removes_from_order() {
        let mut s = store();
        s.process_event(&created("item_1", "user"), None).unwrap();
        s.process_event(&created("item_2", "assistant"), None).unwrap();
        s.process_event(
            &ServerEvent::ItemDeleted {
                item_id: "item_1".to_string(),
            },
            None,
        )
        .unwrap();
        let ids: Vec<_> = s.items().iter().map(|i| i.id.clone()).collect();
        assert_eq!(ids, vec!["item_2"]);
    }

    #[test]
    fn test_speech_segment_sliced_and_merged_once() {
        let mut s = store();
        // 16 kHz buffer, speech from 100 ms to 400 ms -> samples [1600, 6400)
        let buffer: Vec<u8> = (0..8000u32).map(|i| (i % 251) as u8).collect();
        s.process_event(
            &ServerEvent::SpeechStarted {
                audio_start_ms: 100,
                item_id: "item_1".to_string(),
            },
            None,
        )
        .unwrap();
        s.process_event(
            &ServerEvent::SpeechStopped {
                audio_end_ms: 400,
                item_id: "item_1".to_string(),
            },
            Some(&buffer),
        )
        .unwrap();

        s.process_event(&created("item_1", "user"), None).unwrap();
        let item = s.get_item("item_1").unwrap();
        assert_eq!(item.formatted.audio.len(), 4800);
        assert_eq!(item.formatted.audio[..], buffer[1600..6400]);
        // Segment consumed at creation
        assert!(s.queued_speech.is_empty());
    }

    #[test]
    fn test_speech_stopped_without_segment_is_not_found() {
        let mut s = store();
        let err = s
            .process_event(
                &ServerEvent::SpeechStopped {
                    audio_end_ms: 400,
                    item_id: "item_1".to_string(),
                },
                Some(&[0u8; 100]),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::NotFound {
                kind: "speech segment",
                ..
            }
        ));
    }

    #[test]
    fn test_transcript_queued_before_item_exists() {
        let mut s = store();
        let event = ServerEvent::TranscriptionCompleted {
            item_id: "item_1".to_string(),
            content_index: 0,
            transcript: "hello world".to_string(),
        };
        let outcome = s.process_event(&event, None).unwrap();
        assert!(outcome.item_id.is_none());

        s.process_event(&created("item_1", "user"), None).unwrap();
        assert_eq!(
            s.get_item("item_1").unwrap().formatted.transcript,
            "hello world"
        );
        assert!(s.queued_transcripts.is_empty());
    }

    #[test]
    fn test_empty_transcript_placeholder() {
        let mut s = store();
        let event = ServerEvent::TranscriptionCompleted {
            item_id: "item_1".to_string(),
            content_index: 0,
            transcript: String::new(),
        };
        s.process_event(&event, None).unwrap();
        s.process_event(&created("item_1", "user"), None).unwrap();
        // Completed-but-empty is a single space, not the empty string
        assert_eq!(s.get_item("item_1").unwrap().formatted.transcript, " ");
    }

    #[test]
    fn test_function_call_item_and_arguments_accumulation() {
        let mut s = store();
        let payload = ItemPayload {
            id: Some("item_fc".to_string()),
            item_type: "function_call".to_string(),
            call_id: Some("call_1".to_string()),
            name: Some("lookup".to_string()),
            ..Default::default()
        };
        s.process_event(
            &ServerEvent::ItemCreated {
                previous_item_id: None,
                item: payload,
            },
            None,
        )
        .unwrap();

        for piece in ["{\"city\":", "\"Lyon\"}"] {
            s.process_event(
                &ServerEvent::FunctionCallArgumentsDelta {
                    response_id: "resp_1".to_string(),
                    item_id: "item_fc".to_string(),
                    output_index: 0,
                    call_id: "call_1".to_string(),
                    delta: piece.to_string(),
                },
                None,
            )
            .unwrap();
        }

        let item = s.get_item("item_fc").unwrap();
        assert_eq!(item.status, ItemStatus::InProgress);
        assert_eq!(item.arguments, "{\"city\":\"Lyon\"}");
        let tool = item.formatted.tool.as_ref().unwrap();
        assert_eq!(tool.name, "lookup");
        assert_eq!(tool.call_id, "call_1");
        assert_eq!(tool.arguments, "{\"city\":\"Lyon\"}");
    }

    #[test]
    fn test_response_output_tracking() {
        let mut s = store();
        s.process_event(&response_created("resp_1"), None).unwrap();
        s.process_event(
            &ServerEvent::OutputItemAdded {
                response_id: "resp_1".to_string(),
                output_index: 0,
                item: message_payload("item_1", "assistant"),
            },
            None,
        )
        .unwrap();
        assert_eq!(s.get_response("resp_1").unwrap().output, vec!["item_1"]);
    }

    #[test]
    fn test_output_item_added_unknown_response() {
        let mut s = store();
        let err = s
            .process_event(
                &ServerEvent::OutputItemAdded {
                    response_id: "ghost".to_string(),
                    output_index: 0,
                    item: message_payload("item_1", "assistant"),
                },
                None,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::NotFound {
                kind: "response",
                ..
            }
        ));
    }

    #[test]
    fn test_status_is_monotonic() {
        let mut s = store();
        s.process_event(&created("item_1", "user"), None).unwrap();
        let mut done = message_payload("item_1", "user");
        done.status = Some("in_progress".to_string());
        s.process_event(
            &ServerEvent::OutputItemDone {
                response_id: "resp_1".to_string(),
                output_index: 0,
                item: done,
            },
            None,
        )
        .unwrap();
        // User messages complete at creation; a late in_progress never
        // regresses the status.
        assert_eq!(s.get_item("item_1").unwrap().status, ItemStatus::Completed);
    }

    #[test]
    fn test_pending_input_audio_merged_into_user_message() {
        let mut s = store();
        s.queue_input_audio(vec![9u8; 320]);
        s.process_event(&created("item_1", "user"), None).unwrap();
        assert_eq!(s.get_item("item_1").unwrap().formatted.audio, vec![9u8; 320]);
        assert!(s.queued_input_audio.is_none());
    }

    #[test]
    fn test_unrouted_event_is_protocol_violation() {
        let mut s = store();
        let err = s
            .process_event(&ServerEvent::InputAudioBufferCleared, None)
            .unwrap_err();
        assert!(matches!(err, SessionError::ProtocolViolation(_)));
    }

    #[test]
    fn test_clear_resets_everything() {
        let mut s = store();
        s.process_event(&created("item_1", "user"), None).unwrap();
        s.process_event(&response_created("resp_1"), None).unwrap();
        s.queue_input_audio(vec![1, 2, 3]);
        s.clear();
        assert!(s.items().is_empty());
        assert!(s.get_response("resp_1").is_none());
        assert!(s.queued_input_audio.is_none());
    }

    #[test]
    fn test_content_text_concatenated_at_creation() {
        let mut s = store();
        let payload = ItemPayload {
            id: Some("item_1".to_string()),
            item_type: "message".to_string(),
            role: Some("user".to_string()),
            content: Some(vec![
                ContentPart {
                    part_type: "input_text".to_string(),
                    text: Some("Hello ".to_string()),
                    audio: None,
                    transcript: None,
                },
                ContentPart {
                    part_type: "input_audio".to_string(),
                    text: None,
                    audio: Some(String::new()),
                    transcript: None,
                },
                ContentPart {
                    part_type: "input_text".to_string(),
                    text: Some("world".to_string()),
                    audio: None,
                    transcript: None,
                },
            ]),
            ..Default::default()
        };
        s.process_event(
            &ServerEvent::ItemCreated {
                previous_item_id: None,
                item: payload,
            },
            None,
        )
        .unwrap();
        assert_eq!(s.get_item("item_1").unwrap().formatted.text, "Hello world");
    }
}

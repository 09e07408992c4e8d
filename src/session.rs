//! Session orchestration.
//!
//! The controller wires the transport, conversation store, silence watchdog
//! and tool bridge together. All protocol events are folded on one driver
//! task, so store mutation is sequential and race-free; callers interact
//! through the controller's methods and the event bus. Termination requests
//! travel over a channel into the driver rather than through shared flags.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{default_session_config, EngineConfig};
use crate::conversation::{ConversationItem, ConversationStore, ItemKind, ItemStatus, Role};
use crate::error::{SessionError, SessionResult};
use crate::events::{BusEvent, EventBus};
use crate::protocol::{
    ClientEvent, ContentPart, ItemPayload, ServerEvent, SessionConfig, ToolDef, TurnDetection,
};
use crate::tools::{ToolBridge, ToolHandler};
use crate::transport::TransportChannel;
use crate::watchdog::{DeadlineOutcome, SilenceWatchdog};
use crate::{audio, events};

/// Channel capacity for decoded inbound events.
const INBOUND_CHANNEL_CAPACITY: usize = 256;

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    /// The silence watchdog fired
    Inactivity,
    /// Explicit `disconnect()` call
    Disconnect,
    /// The backend closed the stream
    TransportClosed,
    /// Posted through an [`EndHandle`], e.g. by an end-call tool
    Requested(String),
}

impl EndReason {
    /// Stable tag used in lifecycle event payloads.
    pub fn as_str(&self) -> &str {
        match self {
            EndReason::Inactivity => "inactivity",
            EndReason::Disconnect => "disconnect",
            EndReason::TransportClosed => "transport_closed",
            EndReason::Requested(reason) => reason,
        }
    }
}

/// Cloneable handle that asks the running session to terminate.
///
/// The request is a message to the driver task; posting is non-blocking and
/// safe from any context, including a tool handler ending the call.
#[derive(Clone)]
pub struct EndHandle {
    tx: Arc<Mutex<Option<mpsc::Sender<EndReason>>>>,
}

impl EndHandle {
    /// Request termination. No-op when no session is running.
    pub fn end(&self, reason: impl Into<String>) {
        let guard = self.tx.lock();
        if let Some(tx) = guard.as_ref() {
            if tx.try_send(EndReason::Requested(reason.into())).is_err() {
                debug!("termination request dropped, driver already stopping");
            }
        }
    }
}

struct Inner {
    config: RwLock<EngineConfig>,
    bus: Arc<EventBus>,
    transport: TransportChannel,
    store: Mutex<ConversationStore>,
    watchdog: Mutex<SilenceWatchdog>,
    tools: ToolBridge,
    /// Locally buffered input audio, mirrored to the backend buffer.
    input_audio: Mutex<Vec<u8>>,
    end_tx: Arc<Mutex<Option<mpsc::Sender<EndReason>>>>,
    driver: Mutex<Option<JoinHandle<()>>>,
    /// Latched once per session; exactly one teardown takes effect.
    ending: AtomicBool,
}

/// Orchestrator for one realtime session.
#[derive(Clone)]
pub struct SessionController {
    inner: Arc<Inner>,
}

impl SessionController {
    pub fn new(config: EngineConfig) -> Self {
        let bus = Arc::new(EventBus::new());
        let sample_rate = config.sample_rate;
        let silence_timeout = config.silence_timeout;
        SessionController {
            inner: Arc::new(Inner {
                config: RwLock::new(config),
                bus: bus.clone(),
                transport: TransportChannel::new(bus),
                store: Mutex::new(ConversationStore::new(sample_rate)),
                watchdog: Mutex::new(SilenceWatchdog::new(silence_timeout)),
                tools: ToolBridge::new(),
                input_audio: Mutex::new(Vec::new()),
                end_tx: Arc::new(Mutex::new(None)),
                driver: Mutex::new(None),
                ending: AtomicBool::new(true),
            }),
        }
    }

    /// The session's event bus, for `conversation.*` / `server.*` /
    /// `client.*` subscriptions.
    pub fn bus(&self) -> Arc<EventBus> {
        self.inner.bus.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.transport.is_connected()
    }

    /// Snapshot of one conversation item.
    pub fn item(&self, id: &str) -> Option<ConversationItem> {
        self.inner.store.lock().get_item(id).cloned()
    }

    /// Snapshot of all conversation items in creation order.
    pub fn items(&self) -> Vec<ConversationItem> {
        self.inner.store.lock().items().into_iter().cloned().collect()
    }

    /// Connect to the backend, push the initial session configuration and
    /// start the driver task.
    pub async fn connect(&self) -> SessionResult<()> {
        if self.is_connected() {
            return Err(SessionError::StateConflict(
                "session already connected".into(),
            ));
        }
        let (endpoint, api_key) = {
            let config = self.inner.config.read();
            if config.api_key.is_empty() {
                return Err(SessionError::InvalidConfiguration(
                    "api_key is empty".into(),
                ));
            }
            (config.endpoint(), config.api_key.clone())
        };

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
        let (end_tx, end_rx) = mpsc::channel(8);

        self.inner
            .transport
            .connect(&endpoint, &api_key, inbound_tx)
            .await?;
        self.inner.ending.store(false, Ordering::SeqCst);
        *self.inner.end_tx.lock() = Some(end_tx);

        if let Err(e) = self.push_session_update().await {
            // Failed mid-connect: unwind so the controller is cleanly
            // disconnected and a retry is possible.
            self.inner.ending.store(true, Ordering::SeqCst);
            *self.inner.end_tx.lock() = None;
            self.inner.transport.disconnect().await;
            return Err(e);
        }

        let driver = self.clone();
        let handle = tokio::spawn(async move { driver.drive(inbound_rx, end_rx).await });
        *self.inner.driver.lock() = Some(handle);
        Ok(())
    }

    /// Merge overrides into the session configuration; re-push when
    /// connected.
    pub async fn update_session(&self, session: SessionConfig) -> SessionResult<()> {
        self.inner.config.write().session = session;
        if self.is_connected() {
            self.push_session_update().await?;
        }
        Ok(())
    }

    /// Append raw PCM to the input buffer. Empty input is a no-op.
    pub async fn append_input_audio(&self, data: &[u8]) -> SessionResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.inner.input_audio.lock().extend_from_slice(data);
        self.touch();
        self.inner
            .transport
            .send(&ClientEvent::audio_append(data))
            .await
    }

    /// Ask the backend to generate a response.
    ///
    /// When turn detection is caller-controlled and locally buffered audio
    /// exists, the buffer is committed first and handed to the store so the
    /// resulting user item carries it.
    pub async fn create_response(&self) -> SessionResult<()> {
        if self.caller_controls_turns() {
            let pending = {
                let mut buffer = self.inner.input_audio.lock();
                if buffer.is_empty() {
                    None
                } else {
                    Some(std::mem::take(&mut *buffer))
                }
            };
            if let Some(audio) = pending {
                self.inner
                    .transport
                    .send(&ClientEvent::InputAudioBufferCommit)
                    .await?;
                self.inner.store.lock().queue_input_audio(audio);
            }
        }
        self.touch();
        self.inner.transport.send(&ClientEvent::ResponseCreate).await
    }

    /// Send a user message built from `content` and request a response.
    pub async fn send_user_message(&self, content: Vec<ContentPart>) -> SessionResult<()> {
        self.touch();
        self.inner
            .transport
            .send(&ClientEvent::ConversationItemCreate {
                item: ItemPayload::user_message(content),
            })
            .await?;
        self.create_response().await
    }

    /// Send a plain-text user message and request a response.
    pub async fn send_user_text(&self, text: impl Into<String>) -> SessionResult<()> {
        self.touch();
        self.inner
            .transport
            .send(&ClientEvent::ConversationItemCreate {
                item: ItemPayload::user_text(text),
            })
            .await?;
        self.create_response().await
    }

    /// Cancel the in-flight response.
    ///
    /// With an item id, the interrupted assistant audio is also truncated to
    /// what the caller reports having played (`sample_count` samples).
    pub async fn cancel_response(
        &self,
        item_id: Option<&str>,
        sample_count: usize,
    ) -> SessionResult<()> {
        let truncate = match item_id {
            None => None,
            Some(id) => {
                let store = self.inner.store.lock();
                let item = store
                    .get_item(id)
                    .ok_or_else(|| SessionError::not_found("item", id))?;
                if item.kind != ItemKind::Message || item.role != Some(Role::Assistant) {
                    return Err(SessionError::StateConflict(format!(
                        "item \"{id}\" is not an assistant message"
                    )));
                }
                let content_index = item
                    .content
                    .iter()
                    .position(|part| part.part_type == "audio")
                    .ok_or_else(|| {
                        SessionError::StateConflict(format!(
                            "item \"{id}\" has no audio content to truncate"
                        ))
                    })?;
                let sample_rate = store.sample_rate();
                Some(ClientEvent::ConversationItemTruncate {
                    item_id: id.to_string(),
                    content_index: content_index as u32,
                    audio_end_ms: audio::samples_to_ms(sample_count, sample_rate),
                })
            }
        };

        self.touch();
        self.inner.transport.send(&ClientEvent::ResponseCancel).await?;
        if let Some(event) = truncate {
            self.inner.transport.send(&event).await?;
        }
        Ok(())
    }

    /// Register a tool. When connected, the new definition is advertised
    /// immediately via `session.update`.
    pub async fn add_tool(&self, definition: ToolDef, handler: ToolHandler) -> SessionResult<()> {
        self.inner.tools.add_tool(definition, handler)?;
        if self.is_connected() {
            self.push_session_update().await?;
        }
        Ok(())
    }

    /// Remove a registered tool.
    pub fn remove_tool(&self, name: &str) -> SessionResult<()> {
        self.inner.tools.remove_tool(name)
    }

    /// Delete a conversation item on the backend.
    pub async fn delete_item(&self, item_id: &str) -> SessionResult<()> {
        self.touch();
        self.inner
            .transport
            .send(&ClientEvent::ConversationItemDelete {
                item_id: item_id.to_string(),
            })
            .await
    }

    /// Resolve on the next appended conversation item.
    pub async fn wait_for_next_item(&self) -> Option<BusEvent> {
        self.inner.bus.wait_for_next(events::ITEM_APPENDED).await
    }

    /// Resolve on the next completed conversation item.
    pub async fn wait_for_next_completed_item(&self) -> Option<BusEvent> {
        self.inner.bus.wait_for_next(events::ITEM_COMPLETED).await
    }

    /// Handle for requesting termination from elsewhere (tool handlers,
    /// supervisors). Valid across reconnects.
    pub fn end_handle(&self) -> EndHandle {
        EndHandle {
            tx: self.inner.end_tx.clone(),
        }
    }

    /// Tear the session down. Idempotent; concurrent calls collapse into one
    /// effective teardown.
    pub async fn disconnect(&self) {
        self.shutdown(EndReason::Disconnect).await;
    }

    /// Tear down and restore the controller to its initial state: bus
    /// subscriptions dropped, tool registry emptied, session configuration
    /// back to defaults.
    pub async fn reset(&self) {
        self.shutdown(EndReason::Disconnect).await;
        self.inner.bus.clear_event_handlers();
        self.inner.tools.clear();
        self.inner.config.write().session = default_session_config();
    }

    // ------------------------------------------------------------------
    // Driver
    // ------------------------------------------------------------------

    async fn drive(
        self,
        mut inbound_rx: mpsc::Receiver<ServerEvent>,
        mut end_rx: mpsc::Receiver<EndReason>,
    ) {
        loop {
            let deadline = self.inner.watchdog.lock().deadline();
            tokio::select! {
                event = inbound_rx.recv() => match event {
                    Some(event) => self.handle_server_event(event).await,
                    None => {
                        info!("transport stream ended");
                        self.shutdown(EndReason::TransportClosed).await;
                        break;
                    }
                },

                reason = end_rx.recv() => {
                    let reason = reason.unwrap_or(EndReason::Disconnect);
                    info!(reason = reason.as_str(), "termination requested");
                    self.shutdown(reason).await;
                    break;
                }

                _ = sleep_until_deadline(deadline) => {
                    let outcome = self.inner.watchdog.lock().on_deadline(Instant::now());
                    match outcome {
                        DeadlineOutcome::Fired { elapsed_ms } => {
                            warn!(elapsed_ms, "silence timeout reached");
                            self.dispatch(
                                events::TIMEOUT,
                                serde_json::json!({
                                    "reason": "inactivity",
                                    "elapsed_ms": elapsed_ms,
                                }),
                            );
                            self.shutdown(EndReason::Inactivity).await;
                            break;
                        }
                        // Activity raced the deadline; the loop re-reads it.
                        DeadlineOutcome::Rearmed | DeadlineOutcome::Idle => {}
                    }
                }
            }
        }
        debug!("session driver stopped");
    }

    async fn handle_server_event(&self, event: ServerEvent) {
        self.touch();

        match &event {
            ServerEvent::Error { error } => {
                error!(code = ?error.code, "backend error: {}", error.message);
                return;
            }
            ServerEvent::SessionCreated { session } => {
                info!(session_id = %session.id, "session established");
                self.inner.watchdog.lock().start(Instant::now());
                return;
            }
            ServerEvent::SessionUpdated { .. } => {
                debug!("session configuration acknowledged");
                return;
            }
            ServerEvent::InputAudioBufferCommitted { item_id, .. } => {
                debug!(%item_id, "input audio committed");
                return;
            }
            ServerEvent::InputAudioBufferCleared => {
                self.inner.input_audio.lock().clear();
                return;
            }
            ServerEvent::TranscriptionFailed { item_id, error, .. } => {
                warn!(%item_id, "input transcription failed: {}", error.message);
                return;
            }
            ServerEvent::RateLimitsUpdated { .. }
            | ServerEvent::ResponseDone { .. }
            | ServerEvent::TextDone { .. }
            | ServerEvent::AudioTranscriptDone { .. }
            | ServerEvent::AudioDone { .. }
            | ServerEvent::FunctionCallArgumentsDone { .. } => {
                // Terminal acknowledgements; state was accumulated from the
                // deltas.
                debug!(event = event.name(), "acknowledged");
                return;
            }
            _ => {}
        }

        let outcome = {
            let mut store = self.inner.store.lock();
            let buffer = self.inner.input_audio.lock();
            let input = if buffer.is_empty() {
                None
            } else {
                Some(buffer.as_slice())
            };
            store.process_event(&event, input)
        };

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(event = event.name(), "event rejected: {e}");
                return;
            }
        };

        if let ServerEvent::SpeechStarted { .. } = &event {
            self.dispatch(events::INTERRUPTED, serde_json::json!({}));
        }

        let item = outcome
            .item_id
            .as_deref()
            .and_then(|id| self.inner.store.lock().get_item(id).cloned());

        if let Some(item) = &item {
            match &event {
                ServerEvent::ItemCreated { .. } => {
                    self.dispatch_item(events::ITEM_APPENDED, item);
                    if item.status == ItemStatus::Completed {
                        self.dispatch_item(events::ITEM_COMPLETED, item);
                    }
                }
                ServerEvent::OutputItemDone { .. } => {
                    if item.status == ItemStatus::Completed {
                        self.dispatch_item(events::ITEM_COMPLETED, item);
                        self.maybe_invoke_tool(item);
                    }
                }
                _ => {}
            }

            let payload = match serde_json::to_value(item) {
                Ok(snapshot) => serde_json::json!({
                    "item": snapshot,
                    "delta": outcome.delta.as_ref().map(|d| d.to_value()),
                }),
                Err(e) => {
                    error!("item snapshot failed: {e}");
                    return;
                }
            };
            self.dispatch(events::UPDATED, payload);
        }
    }

    /// A completed function call gets its handler run off the driver task;
    /// the answer flows back through the transport.
    fn maybe_invoke_tool(&self, item: &ConversationItem) {
        if item.kind != ItemKind::FunctionCall {
            return;
        }
        let Some(tool) = item.formatted.tool.clone() else {
            warn!(item_id = %item.id, "function call item without tool descriptor");
            return;
        };

        let controller = self.clone();
        tokio::spawn(async move {
            let result = controller
                .inner
                .tools
                .invoke(
                    &controller.inner.transport,
                    &tool.call_id,
                    &tool.name,
                    &tool.arguments,
                )
                .await;
            if let Err(e) = result {
                error!(tool = %tool.name, "tool bridge failed to answer call: {e}");
            }
        });
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    /// Record caller/backend activity.
    fn touch(&self) {
        self.inner.watchdog.lock().reset(Instant::now());
    }

    fn caller_controls_turns(&self) -> bool {
        matches!(
            self.inner.config.read().session.turn_detection,
            None | Some(TurnDetection::None {})
        )
    }

    async fn push_session_update(&self) -> SessionResult<()> {
        let mut session = self.inner.config.read().session.clone();
        let mut tools = session.tools.take().unwrap_or_default();
        tools.extend(self.inner.tools.definitions());
        session.tools = Some(tools);
        self.inner
            .transport
            .send(&ClientEvent::SessionUpdate { session })
            .await
    }

    async fn shutdown(&self, reason: EndReason) {
        if self.inner.ending.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(reason = reason.as_str(), "session ending");

        self.inner.watchdog.lock().stop();
        self.inner.store.lock().clear();
        self.inner.input_audio.lock().clear();
        *self.inner.end_tx.lock() = None;
        self.inner.transport.disconnect().await;

        // The watchdog announces itself via `conversation.timeout`.
        if reason != EndReason::Inactivity {
            self.dispatch(
                events::ENDED,
                serde_json::json!({ "reason": reason.as_str() }),
            );
        }

        // Disconnecting dropped the inbound sender; a driver that did not
        // initiate this teardown sees its channel close and stops on its own.
        drop(self.inner.driver.lock().take());
    }

    fn dispatch(&self, name: &str, payload: serde_json::Value) {
        self.inner.bus.dispatch(name, BusEvent::new(name, payload));
    }

    fn dispatch_item(&self, name: &str, item: &ConversationItem) {
        match serde_json::to_value(item) {
            Ok(snapshot) => self.dispatch(name, serde_json::json!({ "item": snapshot })),
            Err(e) => error!("item snapshot failed: {e}"),
        }
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}

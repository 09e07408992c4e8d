//! Realtime session engine for bidirectional streaming conversations.
//!
//! One persistent WebSocket session against an OpenAI-style realtime
//! backend: deltas are folded into a local conversation store, function
//! calls are bridged to local async handlers, and caller inactivity ends
//! the session through a cooperative watchdog.

pub mod audio;
pub mod config;
pub mod conversation;
pub mod error;
pub mod events;
pub mod protocol;
pub mod session;
pub mod tools;
pub mod transport;
pub mod watchdog;

// Re-export commonly used items for convenience
pub use config::EngineConfig;
pub use conversation::{ConversationItem, ConversationStore, ItemKind, ItemStatus, Role};
pub use error::{SessionError, SessionResult};
pub use events::{BusEvent, EventBus};
pub use protocol::{ClientEvent, ContentPart, ItemPayload, ServerEvent, SessionConfig, ToolDef};
pub use session::{EndHandle, EndReason, SessionController};
pub use tools::{tool_handler, ToolBridge, ToolHandler};
pub use transport::TransportChannel;
pub use watchdog::SilenceWatchdog;

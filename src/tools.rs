//! Local tool registry and function-call bridge.
//!
//! Maps backend function calls onto locally registered async handlers. An
//! invocation ALWAYS produces exactly one `function_call_output` item plus
//! one `response.create`, whether the handler succeeded, failed, or was never
//! registered. Anything else stalls the model turn on the backend side.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::error::{SessionError, SessionResult};
use crate::protocol::{ClientEvent, ItemPayload, ToolDef};
use crate::transport::TransportChannel;

/// Async handler for one registered tool. Receives the decoded call
/// arguments, returns a JSON result or an error message.
pub type ToolHandler = Arc<
    dyn Fn(
            serde_json::Value,
        ) -> Pin<Box<dyn Future<Output = Result<serde_json::Value, String>> + Send>>
        + Send
        + Sync,
>;

struct RegisteredTool {
    definition: ToolDef,
    handler: ToolHandler,
}

/// Registry of local tools, keyed by function name.
#[derive(Default)]
pub struct ToolBridge {
    registry: DashMap<String, RegisteredTool>,
}

impl ToolBridge {
    pub fn new() -> Self {
        ToolBridge {
            registry: DashMap::new(),
        }
    }

    /// Register a tool. The definition must carry a name; duplicate names
    /// are a state conflict.
    pub fn add_tool(&self, definition: ToolDef, handler: ToolHandler) -> SessionResult<()> {
        if definition.name.is_empty() {
            return Err(SessionError::InvalidConfiguration(
                "tool definition has no name".into(),
            ));
        }
        let name = definition.name.clone();
        if self.registry.contains_key(&name) {
            return Err(SessionError::StateConflict(format!(
                "tool \"{name}\" is already registered"
            )));
        }
        self.registry.insert(
            name,
            RegisteredTool {
                definition,
                handler,
            },
        );
        Ok(())
    }

    /// Remove a tool by name. Fails with not-found for unknown names.
    pub fn remove_tool(&self, name: &str) -> SessionResult<()> {
        self.registry
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| SessionError::not_found("tool", name))
    }

    pub fn has_tool(&self, name: &str) -> bool {
        self.registry.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    /// Drop every registered tool. Used on reset.
    pub fn clear(&self) {
        self.registry.clear();
    }

    /// Wire definitions of every registered tool, for `session.update`.
    pub fn definitions(&self) -> Vec<ToolDef> {
        self.registry
            .iter()
            .map(|entry| entry.value().definition.clone())
            .collect()
    }

    /// Run the named tool and answer the call on the transport.
    ///
    /// Exactly one `function_call_output` and one `response.create` go out
    /// regardless of outcome. A failed or unknown handler answers with an
    /// `{"error": ...}` payload instead of leaving the call dangling.
    pub async fn invoke(
        &self,
        transport: &TransportChannel,
        call_id: &str,
        name: &str,
        arguments: &str,
    ) -> SessionResult<()> {
        let output = match self.run_handler(name, arguments).await {
            Ok(result) => result.to_string(),
            Err(e) => {
                warn!(tool = name, call_id, "tool invocation failed: {e}");
                serde_json::json!({ "error": e.to_string() }).to_string()
            }
        };

        transport
            .send(&ClientEvent::ConversationItemCreate {
                item: ItemPayload::function_call_output(call_id, output),
            })
            .await?;
        transport.send(&ClientEvent::ResponseCreate).await
    }

    async fn run_handler(&self, name: &str, arguments: &str) -> SessionResult<serde_json::Value> {
        // Clone the handler out so the shard lock is not held across await.
        let handler = self
            .registry
            .get(name)
            .map(|entry| entry.value().handler.clone())
            .ok_or_else(|| SessionError::not_found("tool", name))?;

        let args: serde_json::Value = if arguments.trim().is_empty() {
            serde_json::json!({})
        } else {
            serde_json::from_str(arguments).map_err(|e| {
                SessionError::ToolFailure(format!("malformed arguments for \"{name}\": {e}"))
            })?
        };

        debug!(tool = name, "invoking tool handler");
        handler(args)
            .await
            .map_err(SessionError::ToolFailure)
    }
}

/// Wrap a plain async function into a [`ToolHandler`].
pub fn tool_handler<F, Fut>(f: F) -> ToolHandler
where
    F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value, String>> + Send + 'static,
{
    Arc::new(move |args| Box::pin(f(args)))
}

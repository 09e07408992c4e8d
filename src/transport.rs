//! Duplex transport to the realtime backend.
//!
//! Owns exactly one persistent WebSocket connection. Every inbound frame is
//! decoded and mirrored on the bus as `server.<type>` and `server.*`; the
//! typed event is forwarded on a channel so the session driver processes
//! frames sequentially, in arrival order. Outbound sends are stamped with a
//! fresh `event_id` and mirrored as `client.<type>` / `client.*` before
//! transmission, so local observers see traffic symmetrically.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, info, warn};

use crate::error::{SessionError, SessionResult};
use crate::events::{self, BusEvent, EventBus};
use crate::protocol::{ClientEvent, ServerEvent};

/// Channel capacity for outbound WebSocket frames.
const WS_CHANNEL_CAPACITY: usize = 256;

/// One persistent duplex connection, framed onto the event bus.
#[derive(Clone)]
pub struct TransportChannel {
    bus: Arc<EventBus>,
    connected: Arc<AtomicBool>,
    outbound: Arc<Mutex<Option<mpsc::Sender<String>>>>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl TransportChannel {
    /// Create a disconnected transport publishing on `bus`.
    pub fn new(bus: Arc<EventBus>) -> Self {
        TransportChannel {
            bus,
            connected: Arc::new(AtomicBool::new(false)),
            outbound: Arc::new(Mutex::new(None)),
            task: Arc::new(Mutex::new(None)),
        }
    }

    /// Whether the duplex stream is open.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Open the duplex stream and spawn the inbound loop.
    ///
    /// Decoded events are forwarded on `inbound_tx` in arrival order.
    /// Fails with a state conflict when already connected.
    pub async fn connect(
        &self,
        endpoint: &str,
        api_key: &str,
        inbound_tx: mpsc::Sender<ServerEvent>,
    ) -> SessionResult<()> {
        if self.is_connected() {
            return Err(SessionError::StateConflict(
                "already connected, disconnect first".into(),
            ));
        }

        let request = build_ws_request(endpoint, api_key)?;
        let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| SessionError::ConnectionFailed(e.to_string()))?;
        info!(endpoint, "connected to realtime backend");

        let (mut ws_sink, mut ws_source) = ws_stream.split();
        let (tx, mut rx) = mpsc::channel::<String>(WS_CHANNEL_CAPACITY);
        *self.outbound.lock() = Some(tx);
        self.connected.store(true, Ordering::SeqCst);

        let bus = self.bus.clone();
        let connected = self.connected.clone();
        let outbound = self.outbound.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(frame) = rx.recv() => {
                        if let Err(e) = ws_sink.send(Message::Text(frame.into())).await {
                            warn!("failed to send frame: {e}");
                            break;
                        }
                    }

                    msg = ws_source.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                dispatch_inbound(&bus, &text, &inbound_tx).await;
                            }
                            Some(Ok(Message::Ping(data))) => {
                                if let Err(e) = ws_sink.send(Message::Pong(data)).await {
                                    warn!("failed to send pong: {e}");
                                }
                            }
                            Some(Ok(Message::Close(_))) => {
                                info!("stream closed by server");
                                break;
                            }
                            Some(Err(e)) => {
                                warn!("stream error: {e}");
                                break;
                            }
                            None => break,
                            _ => {}
                        }
                    }

                    else => break,
                }
            }

            connected.store(false, Ordering::SeqCst);
            *outbound.lock() = None;
            bus.dispatch(
                events::TRANSPORT_CLOSED,
                BusEvent::new(events::TRANSPORT_CLOSED, serde_json::json!({})),
            );
            debug!("inbound loop ended");
        });
        *self.task.lock() = Some(handle);

        Ok(())
    }

    /// Stamp, mirror and transmit one client event.
    pub async fn send(&self, event: &ClientEvent) -> SessionResult<()> {
        if !self.is_connected() {
            return Err(SessionError::StateConflict("not connected".into()));
        }

        let mut value = serde_json::to_value(event)?;
        let event_id = format!("evt_{}", uuid::Uuid::new_v4().simple());
        let event_type = value
            .get("type")
            .and_then(|t| t.as_str())
            .unwrap_or("unknown")
            .to_string();
        if let Some(map) = value.as_object_mut() {
            map.insert("event_id".to_string(), event_id.clone().into());
        }

        // Local observers see outbound traffic symmetrically with inbound.
        let bus_event = BusEvent {
            id: event_id,
            event_type: event_type.clone(),
            payload: value.clone(),
        };
        self.bus
            .dispatch(&format!("client.{event_type}"), bus_event.clone());
        self.bus.dispatch("client.*", bus_event);
        observe(&self.bus, "client", &value);

        let frame = serde_json::to_string(&value)?;
        let sender = self.outbound.lock().clone();
        match sender {
            Some(tx) => tx
                .send(frame)
                .await
                .map_err(|e| SessionError::WebSocketError(e.to_string())),
            None => Err(SessionError::StateConflict("not connected".into())),
        }
    }

    /// Close the stream if open, otherwise no-op. Idempotent.
    pub async fn disconnect(&self) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            // Already released, possibly by a concurrent caller.
            return;
        }
        *self.outbound.lock() = None;
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
        info!("disconnected from realtime backend");
    }
}

/// Decode one inbound frame: mirror the raw payload on the bus, forward the
/// typed event for sequential processing. An undecodable frame is fatal to
/// that frame only.
async fn dispatch_inbound(bus: &EventBus, text: &str, inbound_tx: &mpsc::Sender<ServerEvent>) {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            warn!("undecodable frame: {e}");
            return;
        }
    };
    let event_type = value
        .get("type")
        .and_then(|t| t.as_str())
        .unwrap_or("unknown")
        .to_string();
    let event_id = value
        .get("event_id")
        .and_then(|t| t.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| format!("evt_{}", uuid::Uuid::new_v4().simple()));

    let bus_event = BusEvent {
        id: event_id,
        event_type: event_type.clone(),
        payload: value.clone(),
    };
    bus.dispatch(&format!("server.{event_type}"), bus_event.clone());
    bus.dispatch("server.*", bus_event);
    observe(bus, "server", &value);

    match serde_json::from_value::<ServerEvent>(value) {
        Ok(event) => {
            if inbound_tx.send(event).await.is_err() {
                debug!("session driver gone, dropping inbound event");
            }
        }
        Err(e) => {
            // Protocol violation: no known processor for this event type.
            warn!(%event_type, "unhandled server event: {e}");
        }
    }
}

/// Mirror one frame in the observation envelope, for traffic taps.
fn observe(bus: &EventBus, source: &str, value: &serde_json::Value) {
    let time_ms = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    bus.dispatch(
        events::REALTIME_EVENT,
        BusEvent::new(
            events::REALTIME_EVENT,
            serde_json::json!({
                "time": time_ms,
                "source": source,
                "event": value,
            }),
        ),
    );
}

fn build_ws_request(endpoint: &str, api_key: &str) -> SessionResult<http::Request<()>> {
    let url = url::Url::parse(endpoint)
        .map_err(|e| SessionError::InvalidConfiguration(format!("bad endpoint: {e}")))?;
    let host = url
        .host_str()
        .ok_or_else(|| SessionError::InvalidConfiguration("endpoint has no host".into()))?;
    let host = match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };

    // The parsed URL normalizes a missing path to "/"; the raw endpoint
    // string would yield an invalid request line for host-only URLs.
    http::Request::builder()
        .uri(url.as_str())
        .header("Authorization", format!("Bearer {api_key}"))
        .header("OpenAI-Beta", "realtime=v1")
        .header(
            "Sec-WebSocket-Key",
            tungstenite::handshake::client::generate_key(),
        )
        .header("Sec-WebSocket-Version", "13")
        .header("Connection", "Upgrade")
        .header("Upgrade", "websocket")
        .header("Host", host)
        .body(())
        .map_err(|e| SessionError::ConnectionFailed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_requires_connection() {
        let transport = TransportChannel::new(Arc::new(EventBus::new()));
        let result = transport.send(&ClientEvent::ResponseCreate).await;
        assert!(matches!(result, Err(SessionError::StateConflict(_))));
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let transport = TransportChannel::new(Arc::new(EventBus::new()));
        transport.disconnect().await;
        transport.disconnect().await;
        assert!(!transport.is_connected());
    }

    #[test]
    fn test_ws_request_host_includes_port() {
        let request = build_ws_request("ws://127.0.0.1:9090/realtime", "key").unwrap();
        assert_eq!(request.headers()["Host"], "127.0.0.1:9090");
        assert_eq!(request.headers()["Authorization"], "Bearer key");
    }

    #[test]
    fn test_ws_request_default_port_host() {
        let request = build_ws_request("wss://api.openai.com/v1/realtime?model=m", "key").unwrap();
        assert_eq!(request.headers()["Host"], "api.openai.com");
    }

    #[test]
    fn test_ws_request_normalizes_pathless_endpoint() {
        let request = build_ws_request("ws://127.0.0.1:9090?model=gpt-4o-realtime", "key").unwrap();
        assert_eq!(request.uri().path(), "/");
        assert_eq!(request.uri().query(), Some("model=gpt-4o-realtime"));
    }

    #[test]
    fn test_ws_request_rejects_bad_endpoint() {
        assert!(matches!(
            build_ws_request("not a url", "key"),
            Err(SessionError::InvalidConfiguration(_))
        ));
    }
}

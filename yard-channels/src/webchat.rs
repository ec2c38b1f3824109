use crate::traits::ChannelAdapter;
use crate::types::{InboundMessage, OutboundMessage};
use anyhow::Result;
use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use chrono::Utc;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

const WEBCHAT_CHANNEL_ID: &str = "webchat";

#[derive(Clone)]
struct WebChatState {
    inbound_tx: Arc<tokio::sync::RwLock<Option<mpsc::Sender<InboundMessage>>>>,
    connections: Arc<DashMap<String, mpsc::UnboundedSender<Message>>>,
}

/// Local browser chat over a WebSocket. Each socket is its own conversation.
#[derive(Clone)]
pub struct WebChatAdapter {
    state: WebChatState,
}

impl Default for WebChatAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl WebChatAdapter {
    pub fn new() -> Self {
        Self {
            state: WebChatState {
                inbound_tx: Arc::new(tokio::sync::RwLock::new(None)),
                connections: Arc::new(DashMap::new()),
            },
        }
    }

    /// Router that serves the WebChat WebSocket at `/ws`.
    pub fn router(self: Arc<Self>) -> Router {
        Router::new().route("/ws", get(ws_upgrade)).with_state(self)
    }

    pub fn connection_count(&self) -> usize {
        self.state.connections.len()
    }

    fn push(&self, recipient_id: &str, payload: serde_json::Value) -> Result<()> {
        let Some(conn) = self.state.connections.get(recipient_id) else {
            return Err(anyhow::anyhow!(
                "webchat connection not found for recipient_id={recipient_id}"
            ));
        };
        conn.send(Message::Text(payload.to_string().into()))
            .map_err(|_| anyhow::anyhow!("webchat send failed: socket closed"))
    }
}

async fn ws_upgrade(
    State(adapter): State<Arc<WebChatAdapter>>,
    upgrade: WebSocketUpgrade,
) -> impl IntoResponse {
    upgrade.on_upgrade(move |socket| handle_socket(adapter, socket))
}

#[tracing::instrument(level = "info", skip_all)]
async fn handle_socket(adapter: Arc<WebChatAdapter>, socket: WebSocket) {
    let sender_id = Uuid::new_v4().to_string();
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
    adapter
        .state
        .connections
        .insert(sender_id.clone(), outbound_tx);

    let hello = serde_json::json!({ "type": "hello", "sender_id": sender_id });
    if ws_sender
        .send(Message::Text(hello.to_string().into()))
        .await
        .is_err()
    {
        adapter.state.connections.remove(&sender_id);
        return;
    }

    let adapter_out = adapter.clone();
    let sender_id_out = sender_id.clone();
    let outbound_task = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            if ws_sender.send(msg).await.is_err() {
                break;
            }
        }
        adapter_out.state.connections.remove(&sender_id_out);
    });

    while let Some(Ok(msg)) = ws_receiver.next().await {
        let Message::Text(text) = msg else {
            continue;
        };

        let inbound = match parse_client_payload(&text, &sender_id) {
            Ok(inbound) => inbound,
            Err(e) => {
                tracing::error!(%e, sender_id = %sender_id, "webchat invalid payload");
                break;
            }
        };

        let tx = adapter.state.inbound_tx.read().await.clone();
        if let Some(tx) = tx {
            if let Err(e) = tx.send(inbound).await {
                tracing::error!(%e, sender_id = %sender_id, "webchat inbound queue closed");
                break;
            }
        } else {
            tracing::error!(sender_id = %sender_id, "webchat adapter started without inbound queue");
            break;
        }
    }

    outbound_task.abort();
    adapter.state.connections.remove(&sender_id);
}

/// Client frames look like `{"type":"message","content":"...","media":["path"]}`.
fn parse_client_payload(text: &str, sender_id: &str) -> Result<InboundMessage> {
    let parsed: serde_json::Value = serde_json::from_str(text)?;
    let msg_type = parsed
        .get("type")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow::anyhow!("webchat payload missing type"))?;
    if msg_type != "message" {
        return Err(anyhow::anyhow!("webchat unsupported message type: {msg_type}"));
    }
    let content = parsed
        .get("content")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow::anyhow!("webchat message missing content"))?
        .to_string();
    let media = parsed
        .get("media")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    Ok(InboundMessage {
        message_id: Uuid::new_v4().to_string().into(),
        channel_id: WEBCHAT_CHANNEL_ID.into(),
        sender_id: sender_id.into(),
        thread_id: Some(sender_id.into()),
        is_group: false,
        content,
        media,
        metadata: parsed,
        received_at: Utc::now(),
    })
}

fn outbound_payload(message: &OutboundMessage) -> serde_json::Value {
    serde_json::json!({
        "type": "message",
        "content": message.content,
        "is_progress": message.is_progress,
        "reply_to": message.reply_to_message_id,
        "attachments": message.attachments,
    })
}

#[async_trait::async_trait]
impl ChannelAdapter for WebChatAdapter {
    fn channel_id(&self) -> &str {
        WEBCHAT_CHANNEL_ID
    }

    async fn start(&self, tx: mpsc::Sender<InboundMessage>) -> Result<()> {
        *self.state.inbound_tx.write().await = Some(tx);
        Ok(())
    }

    async fn send(&self, recipient_id: &str, message: OutboundMessage) -> Result<()> {
        self.push(recipient_id, outbound_payload(&message))
    }

    async fn send_typing(&self, recipient_id: &str, active: bool) -> Result<()> {
        self.push(
            recipient_id,
            serde_json::json!({ "type": "typing", "active": active }),
        )
    }
}

use crate::types::{InboundMessage, OutboundMessage};
use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Unique channel identifier: "webchat", "telegram".
    fn channel_id(&self) -> &str;

    /// Start receiving messages. Push to tx for each inbound message.
    async fn start(&self, tx: mpsc::Sender<InboundMessage>) -> Result<()>;

    /// Send a message to a specific user/thread on this platform.
    async fn send(&self, recipient_id: &str, message: OutboundMessage) -> Result<()>;

    /// Typing indicator while a turn runs. Adapters without one keep the default.
    async fn send_typing(&self, _recipient_id: &str, _active: bool) -> Result<()> {
        Ok(())
    }

    /// Whether intermediate updates (plans, notices) should be delivered at all.
    fn delivers_progress(&self) -> bool {
        true
    }
}

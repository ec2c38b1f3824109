//! Channel adapters for Switchyard.
//!
//! Adapters are pure I/O: they convert platform messages to and from
//! `InboundMessage` / `OutboundMessage` and never see model or routing state.

mod telegram;
mod traits;
mod types;
mod webchat;

pub use telegram::TelegramAdapter;
pub use traits::ChannelAdapter;
pub use types::{
    Attachment, ChannelId, InboundMessage, MessageId, OutboundMessage, SenderId, ThreadId,
};
pub use webchat::WebChatAdapter;

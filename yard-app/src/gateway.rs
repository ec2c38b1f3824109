//! Session multiplexer: all channel adapters feed into a single inbound queue,
//! and each inbound message is handled on its own task.

use crate::commands::{self, Command, CommandContext};
use crate::orchestrator::{Orchestrator, ProgressUpdate, TurnError, TurnRequest};
use crate::turns::CancelOutcome;
use crate::usage::UsageLedger;
use anyhow::Result;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use ulid::Ulid;
use yard_channels::{Attachment, ChannelAdapter, InboundMessage, OutboundMessage};

const BUSY_REPLY: &str = "Still working on your previous message. Send /stop to cancel it.";

pub struct Gateway {
    started_at: Instant,
    orchestrator: Arc<Orchestrator>,
    ledger: Option<Arc<UsageLedger>>,
    channels: HashMap<String, Arc<dyn ChannelAdapter>>,
    channel_names: Vec<String>,
    inbound_rx: tokio::sync::Mutex<mpsc::Receiver<InboundMessage>>,
}

impl Gateway {
    pub fn new(
        started_at: Instant,
        orchestrator: Arc<Orchestrator>,
        ledger: Option<Arc<UsageLedger>>,
        channels: HashMap<String, Arc<dyn ChannelAdapter>>,
        inbound_rx: mpsc::Receiver<InboundMessage>,
    ) -> Self {
        let mut channel_names: Vec<String> = channels.keys().cloned().collect();
        channel_names.sort();
        Self {
            started_at,
            orchestrator,
            ledger,
            channels,
            channel_names,
            inbound_rx: tokio::sync::Mutex::new(inbound_rx),
        }
    }

    pub fn channel_names(&self) -> &[String] {
        &self.channel_names
    }

    pub fn start(self: Arc<Self>, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run_loop(shutdown).await;
            tracing::info!("gateway loop exited");
        })
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn run_loop(self: &Arc<Self>, shutdown: CancellationToken) {
        let mut rx = self.inbound_rx.lock().await;
        loop {
            let inbound = tokio::select! {
                _ = shutdown.cancelled() => return,
                msg = rx.recv() => match msg {
                    Some(inbound) => inbound,
                    None => return,
                },
            };
            let this = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = this.handle_inbound(inbound).await {
                    tracing::warn!(error = %e, "handle_inbound failed");
                }
            });
        }
    }

    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(channel_id = %inbound.channel_id, session_key = tracing::field::Empty)
    )]
    pub async fn handle_inbound(&self, inbound: InboundMessage) -> Result<()> {
        let Some(channel) = self.channels.get(inbound.channel_id.as_str()).cloned() else {
            tracing::warn!("inbound message for unknown channel");
            return Ok(());
        };
        let session_key = inbound.session_key();
        tracing::Span::current().record("session_key", session_key.as_str());
        let text = inbound.content.trim();
        if text.is_empty() && inbound.media.is_empty() {
            return Ok(());
        }

        let command = commands::parse_command(text);
        if command == Some(Command::Stop) {
            let reply = match self.orchestrator.cancel(&session_key) {
                CancelOutcome::Cancelled => "Stopped.",
                CancelOutcome::NothingToCancel => "Nothing running to stop.",
            };
            return reply_to(channel.as_ref(), &inbound, reply).await;
        }

        let router = self.orchestrator.router();
        if let Some(reply) = router.handle_user_switchback_decision(text).reply() {
            return reply_to(channel.as_ref(), &inbound, reply).await;
        }

        if let Some(command) = command {
            let ctx = CommandContext {
                router: router.as_ref(),
                history: self.orchestrator.history().as_ref(),
                ledger: self.ledger.as_deref(),
                session_key: &session_key,
                uptime: self.started_at.elapsed(),
                channels: &self.channel_names,
            };
            let reply = commands::execute(&command, &ctx).await;
            return reply_to(channel.as_ref(), &inbound, &reply).await;
        }

        self.spawn_probe(channel.clone(), inbound.reply_target().to_string());
        self.run_turn(channel, &inbound, session_key).await
    }

    /// Probes the primary in the background when one is due. Whatever the
    /// probe wants to tell the user goes to the chat that triggered it.
    fn spawn_probe(&self, channel: Arc<dyn ChannelAdapter>, target: String) {
        let router = Arc::clone(self.orchestrator.router());
        if !router.should_probe() {
            return;
        }
        tokio::spawn(async move {
            let outcome = router.run_probe().await;
            let Some(text) = outcome.switchback_notice.or(outcome.prompt) else {
                return;
            };
            let message = OutboundMessage {
                content: text,
                ..OutboundMessage::default()
            };
            if let Err(e) = channel.send(&target, message).await {
                tracing::warn!(error = %e, "probe notice delivery failed");
            }
        });
    }

    async fn run_turn(
        &self,
        channel: Arc<dyn ChannelAdapter>,
        inbound: &InboundMessage,
        session_key: String,
    ) -> Result<()> {
        let target = inbound.reply_target().to_string();
        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        let forwarder = tokio::spawn(forward_progress(
            channel.clone(),
            target.clone(),
            progress_rx,
        ));
        if let Err(e) = channel.send_typing(&target, true).await {
            tracing::debug!(error = %e, "typing indicator failed");
        }

        let request = TurnRequest {
            session_key,
            channel: inbound.channel_id.to_string(),
            chat_id: target.clone(),
            correlation_id: Ulid::new().to_string(),
            content: inbound.content.clone(),
            media: inbound.media.clone(),
            progress: Some(progress_tx),
        };
        let result = self.orchestrator.run_turn(request).await;

        // The request (and its sender) is gone, so the forwarder drains and ends.
        if let Err(e) = forwarder.await {
            tracing::warn!(error = %e, "progress forwarder panicked");
        }
        if let Err(e) = channel.send_typing(&target, false).await {
            tracing::debug!(error = %e, "typing indicator failed");
        }

        match result {
            Ok(outcome) => reply_to(channel.as_ref(), inbound, &outcome.text).await,
            Err(TurnError::Cancelled) => Ok(()),
            Err(TurnError::Busy(_)) => reply_to(channel.as_ref(), inbound, BUSY_REPLY).await,
            Err(e) => reply_to(channel.as_ref(), inbound, &format!("Error: {e}")).await,
        }
    }
}

async fn reply_to(channel: &dyn ChannelAdapter, inbound: &InboundMessage, text: &str) -> Result<()> {
    channel
        .send(
            inbound.reply_target(),
            OutboundMessage::reply(text, &inbound.message_id),
        )
        .await
}

async fn forward_progress(
    channel: Arc<dyn ChannelAdapter>,
    target: String,
    mut rx: mpsc::UnboundedReceiver<ProgressUpdate>,
) {
    let deliver = channel.delivers_progress();
    while let Some(update) = rx.recv().await {
        if !deliver {
            continue;
        }
        let mut message = OutboundMessage::progress(update.content);
        message.attachments = update.images.iter().map(|p| image_attachment(p)).collect();
        if let Err(e) = channel.send(&target, message).await {
            tracing::warn!(error = %e, "progress delivery failed");
        }
    }
}

fn image_attachment(path: &Path) -> Attachment {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    let content_type = match extension.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        _ => "application/octet-stream",
    };
    Attachment {
        name: path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("image")
            .to_string(),
        content_type: content_type.to_string(),
        location: path.display().to_string(),
    }
}

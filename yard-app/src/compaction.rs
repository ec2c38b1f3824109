//! Folds old history into the session summary once a conversation grows past
//! the configured size.

use crate::config::AgentConfig;
use crate::failover::FailoverRouter;
use crate::session::HistoryStore;
use crate::usage::{UsageRecord, UsageSink};
use anyhow::{Result, anyhow};
use dashmap::DashSet;
use std::sync::Arc;
use std::time::Instant;
use yard_llm::{ChatMessage, ChatOptions, Role};

const TRANSCRIPT_MAX_CHARS: usize = 24_000;
const SUMMARY_MAX_TOKENS: u32 = 1024;

const SUMMARY_SYSTEM_PROMPT: &str = "You maintain a running summary of a chat between a user and \
an assistant. Merge the existing summary with the new transcript. Keep facts, decisions, open tasks \
and user preferences. Drop pleasantries. Reply with the updated summary only.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionPolicy {
    pub message_threshold: usize,
    pub token_percent: usize,
    pub context_window: usize,
    pub keep_recent: usize,
}

impl From<&AgentConfig> for CompactionPolicy {
    fn from(cfg: &AgentConfig) -> Self {
        Self {
            message_threshold: cfg.summarize_message_threshold,
            token_percent: cfg.summarize_token_percent,
            context_window: cfg.context_window,
            keep_recent: cfg.summarize_keep_recent,
        }
    }
}

impl CompactionPolicy {
    fn token_budget(&self) -> usize {
        self.context_window.saturating_mul(self.token_percent) / 100
    }

    pub fn needs_compaction(&self, history: &[ChatMessage]) -> bool {
        if history.len() <= self.keep_recent {
            return false;
        }
        history.len() > self.message_threshold
            || estimate_history_tokens(history) > self.token_budget()
    }
}

pub fn estimate_tokens(message: &ChatMessage) -> usize {
    let mut chars = message.content.chars().count();
    for tc in &message.tool_calls {
        chars = chars.saturating_add(tc.name.chars().count());
        chars = chars.saturating_add(tc.arguments.chars().count());
    }
    // ~4 chars per token.
    (chars / 4).max(1)
}

pub fn estimate_history_tokens(history: &[ChatMessage]) -> usize {
    history.iter().map(estimate_tokens).sum()
}

/// One `[role] text` line per message, cut at `max_chars`.
pub fn render_transcript(history: &[ChatMessage], max_chars: usize) -> String {
    let mut out = String::new();
    for msg in history {
        if !out.is_empty() {
            out.push('\n');
        }
        out.push('[');
        out.push_str(msg.role.as_str());
        out.push_str("] ");
        out.push_str(msg.content.trim());
        if msg.role == Role::Assistant && !msg.tool_calls.is_empty() {
            let names: Vec<&str> = msg.tool_calls.iter().map(|tc| tc.name.as_str()).collect();
            out.push_str(&format!(" (called: {})", names.join(", ")));
        }

        if out.chars().count() >= max_chars {
            let truncated: String = out.chars().take(max_chars).collect();
            return format!("{truncated}\n...[transcript truncated]");
        }
    }
    out
}

pub fn summary_messages(existing: Option<&str>, transcript: &str) -> Vec<ChatMessage> {
    let existing = existing
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or("(none)");
    vec![
        ChatMessage::system(SUMMARY_SYSTEM_PROMPT),
        ChatMessage::user(format!(
            "Existing summary:\n{existing}\n\nNew transcript:\n{transcript}"
        )),
    ]
}

/// Removes the in-flight marker for a session when compaction ends.
struct InFlight<'a> {
    running: &'a DashSet<String>,
    session_key: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.running.remove(&self.session_key);
    }
}

pub struct Compactor {
    policy: CompactionPolicy,
    router: Arc<FailoverRouter>,
    history: Arc<dyn HistoryStore>,
    usage: Option<Arc<dyn UsageSink>>,
    running: DashSet<String>,
}

impl Compactor {
    pub fn new(
        policy: CompactionPolicy,
        router: Arc<FailoverRouter>,
        history: Arc<dyn HistoryStore>,
        usage: Option<Arc<dyn UsageSink>>,
    ) -> Self {
        Self {
            policy,
            router,
            history,
            usage,
            running: DashSet::new(),
        }
    }

    pub fn policy(&self) -> &CompactionPolicy {
        &self.policy
    }

    /// Compacts `session_key` in the background. A session already being
    /// compacted is left alone.
    pub fn spawn(self: &Arc<Self>, session_key: &str) {
        if self.running.contains(session_key) {
            tracing::debug!(session_key, "compaction already running");
            return;
        }
        let this = Arc::clone(self);
        let session_key = session_key.to_string();
        tokio::spawn(async move {
            if let Err(e) = this.compact(&session_key).await {
                tracing::warn!(session_key = %session_key, error = %e, "history compaction failed");
            }
        });
    }

    /// Returns `Ok(false)` when nothing was compacted.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn compact(&self, session_key: &str) -> Result<bool> {
        if !self.running.insert(session_key.to_string()) {
            return Ok(false);
        }
        let _in_flight = InFlight {
            running: &self.running,
            session_key: session_key.to_string(),
        };

        let history = self.history.history(session_key).await?;
        if !self.policy.needs_compaction(&history) {
            return Ok(false);
        }
        let mut split = history.len() - self.policy.keep_recent;
        // Tool results travel with the call that produced them.
        while split < history.len() && history[split].role == Role::Tool {
            split += 1;
        }
        let archived = &history[..split];
        let existing = self.history.summary(session_key).await?;
        let messages = summary_messages(
            existing.as_deref(),
            &render_transcript(archived, TRANSCRIPT_MAX_CHARS),
        );

        let route = self.router.resolve_route()?;
        let options = ChatOptions {
            max_tokens: Some(SUMMARY_MAX_TOKENS),
            temperature: Some(0.2),
        };
        let started = Instant::now();
        let response = match route.backend.chat(&messages, &[], &options).await {
            Ok(response) => response,
            Err(e) => {
                if e.is_rate_limited() {
                    self.router.on_rate_limited(&route.model, &e);
                }
                return Err(e.into());
            }
        };
        self.router.on_success(&route.model);
        if let Some(usage) = &self.usage {
            let mut record =
                UsageRecord::for_call(&route.model, response.usage.as_ref(), "summarize");
            record.session_key = session_key.to_string();
            record.finish_reason = Some(response.finish_reason.clone()).filter(|r| !r.is_empty());
            if let Err(e) = usage.record(record) {
                tracing::warn!(error = %e, "usage record failed");
            }
        }

        let summary = response.message.content.trim().to_string();
        if summary.is_empty() {
            return Err(anyhow!("summarizer returned an empty summary"));
        }

        // Turns may have appended while the summary was being written.
        let current_len = self.history.history(session_key).await?.len();
        if current_len < split {
            tracing::info!(session_key, "history reset during compaction; discarding summary");
            return Ok(false);
        }
        self.history.set_summary(session_key, Some(summary)).await?;
        self.history
            .truncate(session_key, current_len - split)
            .await?;
        self.history.save(session_key).await?;

        tracing::info!(
            model = %route.model,
            archived_messages = split,
            retained_messages = current_len - split,
            latency_ms = started.elapsed().as_millis() as u64,
            "session history compacted"
        );
        Ok(true)
    }
}

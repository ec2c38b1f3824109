//! The turn loop: route, call, run tools, repeat.
//!
//! One [`Orchestrator`] serves every session. Each turn holds its session's
//! slot in the [`TurnRegistry`] for its whole life, so a session never has two
//! turns in flight and `/stop` always finds the token to cancel.

use crate::compaction::Compactor;
use crate::config::{PlanConfig, SwitchyardConfig};
use crate::failover::{FailoverRouter, Route, SwitchEvent, SwitchReason};
use crate::plan::{
    ExecutionPlan, PlanMetadata, PlanStore, format_announcement, format_update, parse_plan_steps,
    planner_messages,
};
use crate::session::HistoryStore;
use crate::turns::{CancelOutcome, TurnRegistry};
use crate::usage::{UsageRecord, UsageSink};
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use yard_llm::{
    ChatMessage, ChatOptions, ChatResponse, LlmError, Role, ToolCall, ToolDefinition,
};
use yard_tools::ToolExecutor;

const EMPTY_RESPONSE_TEXT: &str = "I've completed processing but have no response to give.";
const PLANNER_MAX_TOKENS: u32 = 512;

/// Something to show the user before the final answer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressUpdate {
    pub content: String,
    pub images: Vec<PathBuf>,
}

impl ProgressUpdate {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            images: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TurnRequest {
    /// `<channel>:<chat id>`.
    pub session_key: String,
    pub channel: String,
    pub chat_id: String,
    pub correlation_id: String,
    pub content: String,
    pub media: Vec<String>,
    pub progress: Option<UnboundedSender<ProgressUpdate>>,
}

impl TurnRequest {
    fn progress(&self, update: ProgressUpdate) {
        if let Some(tx) = &self.progress {
            // The receiver is gone once the gateway stopped listening.
            let _ = tx.send(update);
        }
    }

    fn user_message(&self) -> ChatMessage {
        let mut content = self.content.clone();
        for path in self.media.iter().filter(|p| !p.trim().is_empty()) {
            if !content.is_empty() {
                content.push('\n');
            }
            content.push_str(&format!("[media: {path}]"));
        }
        ChatMessage::user(content)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnOutcome {
    pub text: String,
    pub iterations: usize,
    pub model: String,
}

#[derive(Debug, Error)]
pub enum TurnError {
    #[error("turn cancelled")]
    Cancelled,

    #[error("a turn is already running for {0}")]
    Busy(String),

    #[error("no usable backend: {0}")]
    Route(#[source] LlmError),

    #[error("rate limited and no fallback model is available ({reason}): {source}")]
    FallbackExhausted {
        reason: SwitchReason,
        #[source]
        source: LlmError,
    },

    #[error("backend call failed: {0}")]
    Backend(#[source] LlmError),

    #[error("history store: {0}")]
    History(anyhow::Error),
}

impl TurnError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub system_prompt: String,
    pub max_iterations: usize,
    pub max_tokens: u32,
    pub temperature: f32,
    pub notify_on_switch: bool,
    pub plan: PlanConfig,
}

impl From<&SwitchyardConfig> for OrchestratorConfig {
    fn from(cfg: &SwitchyardConfig) -> Self {
        Self {
            system_prompt: cfg.general.system_prompt.clone(),
            max_iterations: cfg.agent.max_tool_iterations.max(1),
            max_tokens: cfg.agent.max_tokens,
            temperature: cfg.agent.temperature,
            notify_on_switch: cfg.failover.notify_on_switch,
            plan: cfg.plan.clone(),
        }
    }
}

pub struct Orchestrator {
    cfg: OrchestratorConfig,
    router: Arc<FailoverRouter>,
    tools: Arc<dyn ToolExecutor>,
    history: Arc<dyn HistoryStore>,
    turns: Arc<TurnRegistry>,
    usage: Option<Arc<dyn UsageSink>>,
    plans: Option<PlanStore>,
    compactor: Option<Arc<Compactor>>,
    /// Highest switch epoch the user has been told about.
    notified_epoch: AtomicU64,
}

impl Orchestrator {
    pub fn new(
        cfg: OrchestratorConfig,
        router: Arc<FailoverRouter>,
        tools: Arc<dyn ToolExecutor>,
        history: Arc<dyn HistoryStore>,
        turns: Arc<TurnRegistry>,
    ) -> Self {
        let notified_epoch = AtomicU64::new(router.snapshot().switch_epoch);
        Self {
            cfg,
            router,
            tools,
            history,
            turns,
            usage: None,
            plans: None,
            compactor: None,
            notified_epoch,
        }
    }

    pub fn with_usage_sink(mut self, usage: Arc<dyn UsageSink>) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn with_plan_store(mut self, plans: PlanStore) -> Self {
        self.plans = Some(plans);
        self
    }

    pub fn with_compactor(mut self, compactor: Arc<Compactor>) -> Self {
        self.compactor = Some(compactor);
        self
    }

    pub fn router(&self) -> &Arc<FailoverRouter> {
        &self.router
    }

    pub fn turns(&self) -> &Arc<TurnRegistry> {
        &self.turns
    }

    pub fn history(&self) -> &Arc<dyn HistoryStore> {
        &self.history
    }

    pub fn cancel(&self, session_key: &str) -> CancelOutcome {
        let outcome = self.turns.cancel(session_key);
        tracing::info!(session_key, outcome = ?outcome, "turn cancel requested");
        outcome
    }

    #[tracing::instrument(
        level = "info",
        skip_all,
        fields(session_key = %req.session_key, correlation_id = %req.correlation_id)
    )]
    pub async fn run_turn(&self, req: TurnRequest) -> Result<TurnOutcome, TurnError> {
        let Some(guard) = self.turns.acquire(&req.session_key).await else {
            tracing::info!("session busy; turn rejected");
            return Err(TurnError::Busy(req.session_key.clone()));
        };
        let token = guard.token().clone();
        let started = Instant::now();
        let user_message = req.user_message();

        let result = tokio::select! {
            biased;
            _ = token.cancelled() => Err(TurnError::Cancelled),
            result = self.drive(&req, user_message.clone()) => result,
        };

        let (result, exchange) = match result {
            Ok((outcome, exchange)) => (Ok(outcome), exchange),
            Err(e) => (Err(e), vec![user_message]),
        };
        let stored = self.store_exchange(&req.session_key, exchange).await;
        drop(guard);

        match &result {
            Ok(outcome) => {
                tracing::info!(
                    iterations = outcome.iterations,
                    model = %outcome.model,
                    response_len = outcome.text.len(),
                    latency_ms = started.elapsed().as_millis() as u64,
                    "turn completed"
                );
                if stored {
                    if let Some(compactor) = &self.compactor {
                        compactor.spawn(&req.session_key);
                    }
                }
            }
            Err(TurnError::Cancelled) => tracing::info!(
                latency_ms = started.elapsed().as_millis() as u64,
                "turn cancelled"
            ),
            Err(e) => tracing::warn!(error = %e, "turn failed"),
        }
        result
    }

    async fn store_exchange(&self, session_key: &str, exchange: Vec<ChatMessage>) -> bool {
        let stored = match self.history.append(session_key, exchange).await {
            Ok(()) => self.history.save(session_key).await,
            Err(e) => Err(e),
        };
        match stored {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(session_key, error = %e, "history write failed");
                false
            }
        }
    }

    /// Runs the loop; on success also returns the messages this turn added.
    async fn drive(
        &self,
        req: &TurnRequest,
        user_message: ChatMessage,
    ) -> Result<(TurnOutcome, Vec<ChatMessage>), TurnError> {
        let summary = self
            .history
            .summary(&req.session_key)
            .await
            .map_err(TurnError::History)?;
        let history = self
            .history
            .history(&req.session_key)
            .await
            .map_err(TurnError::History)?;

        // A tool result whose call was compacted away is rejected by providers.
        let orphaned = history.iter().take_while(|m| m.role == Role::Tool).count();
        if orphaned > 0 {
            tracing::debug!(orphaned, "dropping leading tool results from history");
        }

        let mut messages = Vec::with_capacity(history.len() - orphaned + 2);
        messages.push(ChatMessage::system(self.system_prompt(summary.as_deref())));
        messages.extend(history.into_iter().skip(orphaned));
        let exchange_start = messages.len();
        messages.push(user_message);
        tracing::debug!(prompt_messages = messages.len(), "turn context assembled");

        let tool_defs = self.tools.definitions();
        let options = ChatOptions {
            max_tokens: Some(self.cfg.max_tokens),
            temperature: Some(self.cfg.temperature),
        };
        let mut plan = ExecutionPlan::new(self.cfg.plan.max_steps);
        let mut last_text = String::new();
        let mut model = String::new();

        for iteration in 1..=self.cfg.max_iterations {
            let (route, response) = self
                .call_backend(req, &messages, &tool_defs, &options, iteration)
                .await?;
            model = route.model;
            let message = response.message;

            if message.tool_calls.is_empty() {
                let text = if message.content.trim().is_empty() {
                    EMPTY_RESPONSE_TEXT.to_string()
                } else {
                    message.content
                };
                messages.push(ChatMessage::assistant(text.clone()));
                let outcome = TurnOutcome {
                    text,
                    iterations: iteration,
                    model,
                };
                return Ok((outcome, messages.split_off(exchange_start)));
            }

            if !message.content.trim().is_empty() {
                last_text = message.content.clone();
            }
            tracing::info!(
                iteration,
                tool_calls = message.tool_calls.len(),
                "model requested tool calls"
            );
            self.track_plan(req, &mut plan, &message.tool_calls, &model)
                .await;
            let calls = message.tool_calls.clone();
            messages.push(message);
            for call in &calls {
                let content = self.execute_tool(req, call).await;
                messages.push(ChatMessage::tool_result(&call.id, content));
            }
        }

        tracing::warn!(
            max_iterations = self.cfg.max_iterations,
            "tool iteration limit reached"
        );
        let text = if last_text.is_empty() {
            format!(
                "I reached the tool iteration limit ({}) before finishing.",
                self.cfg.max_iterations
            )
        } else {
            last_text
        };
        messages.push(ChatMessage::assistant(text.clone()));
        let outcome = TurnOutcome {
            text,
            iterations: self.cfg.max_iterations,
            model,
        };
        Ok((outcome, messages.split_off(exchange_start)))
    }

    fn system_prompt(&self, summary: Option<&str>) -> String {
        match summary.map(str::trim).filter(|s| !s.is_empty()) {
            Some(summary) => format!(
                "{}\n\n## Summary of Previous Conversation\n{summary}",
                self.cfg.system_prompt
            ),
            None => self.cfg.system_prompt.clone(),
        }
    }

    /// One backend call, retried once on a new route after a rate-limit switch.
    async fn call_backend(
        &self,
        req: &TurnRequest,
        messages: &[ChatMessage],
        tool_defs: &[ToolDefinition],
        options: &ChatOptions,
        iteration: usize,
    ) -> Result<(Route, ChatResponse), TurnError> {
        let route = self.router.resolve_route().map_err(TurnError::Route)?;
        let started = Instant::now();
        let error = match route.backend.chat(messages, tool_defs, options).await {
            Ok(response) => {
                self.after_success(req, &route, &response, iteration, started);
                return Ok((route, response));
            }
            Err(e) if e.is_rate_limited() => e,
            Err(e) => return Err(TurnError::Backend(e)),
        };

        let event = self.router.on_rate_limited(&route.model, &error);
        if !event.switched {
            return Err(TurnError::FallbackExhausted {
                reason: event.reason,
                source: error,
            });
        }
        self.notify_switch(req, &event);

        let retry = self.router.resolve_route().map_err(TurnError::Route)?;
        tracing::info!(from = %route.model, to = %retry.model, "retrying call on new route");
        let started = Instant::now();
        match retry.backend.chat(messages, tool_defs, options).await {
            Ok(response) => {
                self.after_success(req, &retry, &response, iteration, started);
                Ok((retry, response))
            }
            Err(e) => {
                if e.is_rate_limited() {
                    // Move the route along for the next turn; this one is over.
                    let event = self.router.on_rate_limited(&retry.model, &e);
                    if event.switched {
                        self.notify_switch(req, &event);
                    }
                }
                Err(TurnError::Backend(e))
            }
        }
    }

    fn after_success(
        &self,
        req: &TurnRequest,
        route: &Route,
        response: &ChatResponse,
        iteration: usize,
        started: Instant,
    ) {
        self.router.on_success(&route.model);
        tracing::info!(
            iteration,
            model = %route.model,
            latency_ms = started.elapsed().as_millis() as u64,
            finish_reason = %response.finish_reason,
            tool_calls = response.message.tool_calls.len(),
            "backend call completed"
        );
        let reason = if response.finish_reason.trim().is_empty() {
            "normal_call".to_string()
        } else {
            response.finish_reason.clone()
        };
        let mut record = UsageRecord::for_call(&route.model, response.usage.as_ref(), reason);
        record.iteration = Some(iteration);
        record.finish_reason = Some(response.finish_reason.clone()).filter(|r| !r.is_empty());
        self.record_usage(req, record);
    }

    fn record_usage(&self, req: &TurnRequest, mut record: UsageRecord) {
        let Some(usage) = &self.usage else {
            return;
        };
        record.session_key = req.session_key.clone();
        record.channel = req.channel.clone();
        record.chat_id = req.chat_id.clone();
        record.correlation_id = req.correlation_id.clone();
        if let Err(e) = usage.record(record) {
            tracing::warn!(error = %e, "usage record failed");
        }
    }

    /// At most one notice per switch epoch across all sessions.
    fn notify_switch(&self, req: &TurnRequest, event: &SwitchEvent) {
        if !self.cfg.notify_on_switch {
            return;
        }
        let previous = self.notified_epoch.fetch_max(event.epoch, Ordering::AcqRel);
        if previous >= event.epoch {
            return;
        }
        req.progress(ProgressUpdate::text(format!(
            "Failover active: switched from {} to {} due to provider rate limits.",
            event.from, event.to
        )));
    }

    async fn track_plan(
        &self,
        req: &TurnRequest,
        plan: &mut ExecutionPlan,
        calls: &[ToolCall],
        model: &str,
    ) {
        if !self.cfg.plan.enabled {
            return;
        }
        if !plan.is_announced() {
            let planned = self.planner_steps(req, calls).await;
            plan.announce(calls, planned);
            let shown = plan.display_steps(self.cfg.plan.min_steps);
            let path = self.persist_plan(req, &shown, model);
            tracing::info!(steps = shown.len(), "execution plan announced");
            req.progress(ProgressUpdate::text(format_announcement(
                &shown,
                path.as_deref(),
            )));
            return;
        }
        for call in calls {
            if let Some(step) = plan.append_deviation(call) {
                tracing::info!(tool_name = %call.name, step = %step, "plan deviation");
                req.progress(ProgressUpdate::text(format_update(&step)));
            }
        }
    }

    fn persist_plan(&self, req: &TurnRequest, steps: &[String], model: &str) -> Option<PathBuf> {
        if !self.cfg.plan.persist {
            return None;
        }
        let store = self.plans.as_ref()?;
        let meta = PlanMetadata {
            session_key: req.session_key.clone(),
            correlation_id: req.correlation_id.clone(),
            model: model.to_string(),
        };
        match store.persist(steps, &meta, Utc::now()) {
            Ok(path) => Some(path),
            Err(e) => {
                tracing::warn!(error = %e, "plan artifact write failed");
                None
            }
        }
    }

    /// Steps from the planner model, or `None` to fall back to derived steps.
    async fn planner_steps(&self, req: &TurnRequest, calls: &[ToolCall]) -> Option<Vec<String>> {
        let model = self
            .cfg
            .plan
            .planner_model
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())?;
        let backend = match self.router.backend_for(model) {
            Ok(backend) => backend,
            Err(e) => {
                tracing::warn!(planner_model = model, error = %e, "planner backend unavailable");
                return None;
            }
        };
        let options = ChatOptions {
            max_tokens: Some(PLANNER_MAX_TOKENS),
            temperature: Some(0.2),
        };
        let response = match backend
            .chat(&planner_messages(&req.content, calls), &[], &options)
            .await
        {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(planner_model = model, error = %e, "planner call failed");
                return None;
            }
        };
        self.record_usage(
            req,
            UsageRecord::for_call(model, response.usage.as_ref(), "planner"),
        );
        let steps = parse_plan_steps(&response.message.content);
        if steps.is_empty() {
            tracing::debug!(planner_model = model, "planner reply had no steps");
            return None;
        }
        Some(steps)
    }

    async fn execute_tool(&self, req: &TurnRequest, call: &ToolCall) -> String {
        let started = Instant::now();
        match self.tools.execute(&call.name, &call.arguments).await {
            Ok(output) => {
                tracing::info!(
                    tool_call_id = %call.id,
                    tool_name = %call.name,
                    latency_ms = started.elapsed().as_millis() as u64,
                    output_len = output.for_model.len(),
                    "tool call executed"
                );
                if !output.silent {
                    let content = output
                        .for_user
                        .filter(|t| !t.trim().is_empty())
                        .unwrap_or_default();
                    if !content.is_empty() || !output.images.is_empty() {
                        req.progress(ProgressUpdate {
                            content,
                            images: output.images,
                        });
                    }
                }
                output.for_model
            }
            Err(e) => {
                tracing::warn!(
                    tool_call_id = %call.id,
                    tool_name = %call.name,
                    error = %e,
                    "tool call failed"
                );
                format!("Error: {e}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failover::FailoverPolicy;
    use crate::session::FileSessionStore;
    use crate::testing::{
        FakeFactory, MemoryUsage, ScriptedBackend, rate_limited, text_response, tool_response,
    };
    use async_trait::async_trait;
    use tokio::sync::Notify;
    use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};
    use yard_llm::Role;
    use yard_tools::{ToolError, ToolOutput};

    struct FakeTools {
        entered: Arc<Notify>,
    }

    #[async_trait]
    impl ToolExecutor for FakeTools {
        fn definitions(&self) -> Vec<ToolDefinition> {
            Vec::new()
        }

        async fn execute(&self, name: &str, _arguments: &str) -> yard_tools::Result<ToolOutput> {
            match name {
                "read_file" => Ok(ToolOutput::text("file body").with_user_text("read it")),
                "sleep" => Ok(ToolOutput::text("slept").silenced()),
                "block" => {
                    self.entered.notify_one();
                    std::future::pending().await
                }
                other => Err(ToolError::UnknownTool(other.to_string())),
            }
        }
    }

    struct Harness {
        orchestrator: Arc<Orchestrator>,
        store: Arc<FileSessionStore>,
        usage: Arc<MemoryUsage>,
        entered: Arc<Notify>,
        tmp: tempfile::TempDir,
    }

    fn config() -> OrchestratorConfig {
        OrchestratorConfig {
            system_prompt: "be brief".to_string(),
            max_iterations: 5,
            max_tokens: 256,
            temperature: 0.0,
            notify_on_switch: true,
            plan: PlanConfig::default(),
        }
    }

    fn harness(
        cfg: OrchestratorConfig,
        backends: Vec<Arc<ScriptedBackend>>,
        fallbacks: &[&str],
    ) -> Harness {
        let tmp = tempfile::tempdir().unwrap();
        let fallbacks: Vec<String> = fallbacks.iter().map(|m| m.to_string()).collect();
        let router = Arc::new(FailoverRouter::new(
            "m-primary",
            &fallbacks,
            FailoverPolicy::default(),
            FakeFactory::with(backends),
            None,
        ));
        let store = Arc::new(FileSessionStore::new(tmp.path().join("sessions")));
        let usage = Arc::new(MemoryUsage::default());
        let entered = Arc::new(Notify::new());
        let tools = Arc::new(FakeTools {
            entered: entered.clone(),
        });
        let orchestrator = Orchestrator::new(cfg, router, tools, store.clone(), TurnRegistry::new())
            .with_usage_sink(usage.clone())
            .with_plan_store(PlanStore::new(tmp.path().join("plans")));
        Harness {
            orchestrator: Arc::new(orchestrator),
            store,
            usage,
            entered,
            tmp,
        }
    }

    fn request(content: &str) -> (TurnRequest, UnboundedReceiver<ProgressUpdate>) {
        request_for("42", content)
    }

    fn request_for(chat_id: &str, content: &str) -> (TurnRequest, UnboundedReceiver<ProgressUpdate>) {
        let (tx, rx) = unbounded_channel();
        let req = TurnRequest {
            session_key: format!("telegram:{chat_id}"),
            channel: "telegram".to_string(),
            chat_id: chat_id.to_string(),
            correlation_id: "01HZX".to_string(),
            content: content.to_string(),
            media: Vec::new(),
            progress: Some(tx),
        };
        (req, rx)
    }

    fn drain(rx: &mut UnboundedReceiver<ProgressUpdate>) -> Vec<ProgressUpdate> {
        let mut out = Vec::new();
        while let Ok(update) = rx.try_recv() {
            out.push(update);
        }
        out
    }

    #[tokio::test]
    async fn direct_answer_records_usage_and_history() {
        let primary = ScriptedBackend::new("m-primary", vec![text_response("hello there")]);
        let h = harness(config(), vec![primary.clone()], &[]);
        let (req, _rx) = request("hi");

        let outcome = h.orchestrator.run_turn(req).await.unwrap();
        assert_eq!(outcome.text, "hello there");
        assert_eq!(outcome.iterations, 1);
        assert_eq!(outcome.model, "m-primary");

        let sent = primary.calls.lock().unwrap()[0].clone();
        assert_eq!(sent[0].role, Role::System);
        assert_eq!(sent[0].content, "be brief");
        assert_eq!(sent.last().unwrap().content, "hi");

        let history = h.store.history("telegram:42").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].content, "hello there");

        let records = h.usage.records.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].reason, "stop");
        assert_eq!(records[0].iteration, Some(1));
        assert_eq!(records[0].session_key, "telegram:42");
        assert_eq!(records[0].total_tokens, 15);
        assert!(!h.orchestrator.turns().is_active("telegram:42"));
    }

    #[tokio::test]
    async fn summary_and_media_shape_the_context() {
        let primary = ScriptedBackend::new("m-primary", vec![text_response("ok")]);
        let h = harness(config(), vec![primary.clone()], &[]);
        h.store
            .set_summary("telegram:42", Some("user prefers tea".to_string()))
            .await
            .unwrap();
        let (mut req, _rx) = request("what is this?");
        req.media = vec!["/tmp/photo.jpg".to_string()];

        h.orchestrator.run_turn(req).await.unwrap();
        let sent = primary.calls.lock().unwrap()[0].clone();
        assert!(sent[0].content.contains("## Summary of Previous Conversation\nuser prefers tea"));
        assert_eq!(sent[1].content, "what is this?\n[media: /tmp/photo.jpg]");
    }

    #[tokio::test]
    async fn tool_batch_announces_plan_and_feeds_results_back() {
        let primary = ScriptedBackend::new(
            "m-primary",
            vec![
                tool_response(&[("c1", "read_file", r#"{"path":"notes/a.txt"}"#)]),
                text_response("the file says hi"),
            ],
        );
        let h = harness(config(), vec![primary.clone()], &[]);
        let (req, mut rx) = request("what is in a.txt?");

        let outcome = h.orchestrator.run_turn(req).await.unwrap();
        assert_eq!(outcome.text, "the file says hi");
        assert_eq!(outcome.iterations, 2);

        let updates = drain(&mut rx);
        assert!(updates[0].content.starts_with("Execution plan:\n1. Read a.txt\n"));
        assert!(updates[0].content.contains("Plan file: `"));
        assert_eq!(updates[1].content, "read it");

        let second_call = primary.calls.lock().unwrap()[1].clone();
        let tool_msg = second_call.last().unwrap();
        assert_eq!(tool_msg.role, Role::Tool);
        assert_eq!(tool_msg.tool_call_id.as_deref(), Some("c1"));
        assert_eq!(tool_msg.content, "file body");

        // user, assistant tool call, tool result, final answer
        assert_eq!(h.store.history("telegram:42").await.unwrap().len(), 4);
        let plans: Vec<_> = std::fs::read_dir(h.tmp.path().join("plans"))
            .unwrap()
            .collect();
        assert_eq!(plans.len(), 1);
    }

    #[tokio::test]
    async fn unannounced_tool_is_reported_as_plan_update() {
        let primary = ScriptedBackend::new(
            "m-primary",
            vec![
                tool_response(&[("c1", "read_file", r#"{"path":"a.txt"}"#)]),
                tool_response(&[("c2", "sleep", r#"{"seconds":1}"#)]),
                tool_response(&[("c3", "sleep", r#"{"seconds":1}"#)]),
                text_response("done waiting"),
            ],
        );
        let h = harness(config(), vec![primary], &[]);
        let (req, mut rx) = request("read then wait");

        h.orchestrator.run_turn(req).await.unwrap();
        let updates: Vec<String> = drain(&mut rx).into_iter().map(|u| u.content).collect();
        let plan_updates: Vec<&String> =
            updates.iter().filter(|u| u.starts_with("Plan update:")).collect();
        assert_eq!(plan_updates, vec!["Plan update:\n- Wait before continuing"]);
        // silent tool output is not forwarded
        assert!(!updates.iter().any(|u| u == "slept"));
    }

    #[tokio::test]
    async fn tool_errors_become_tool_results() {
        let primary = ScriptedBackend::new(
            "m-primary",
            vec![
                tool_response(&[("c1", "teleport", "{}")]),
                text_response("could not do that"),
            ],
        );
        let h = harness(config(), vec![primary.clone()], &[]);
        let (req, _rx) = request("teleport me");

        let outcome = h.orchestrator.run_turn(req).await.unwrap();
        assert_eq!(outcome.text, "could not do that");
        let second_call = primary.calls.lock().unwrap()[1].clone();
        assert_eq!(
            second_call.last().unwrap().content,
            "Error: unknown tool: teleport"
        );
    }

    #[tokio::test]
    async fn rate_limit_switches_and_retries_once() {
        let primary = ScriptedBackend::new("m-primary", vec![rate_limited(Some("30"))]);
        let fallback = ScriptedBackend::new("m-fallback", vec![text_response("from fallback")]);
        let h = harness(config(), vec![primary.clone(), fallback.clone()], &["m-fallback"]);
        let (req, mut rx) = request("hi");

        let outcome = h.orchestrator.run_turn(req).await.unwrap();
        assert_eq!(outcome.text, "from fallback");
        assert_eq!(outcome.model, "m-fallback");
        assert_eq!(primary.call_count(), 1);
        assert_eq!(fallback.call_count(), 1);

        let updates = drain(&mut rx);
        assert_eq!(
            updates[0].content,
            "Failover active: switched from m-primary to m-fallback due to provider rate limits."
        );
        assert_eq!(h.orchestrator.router().snapshot().active_model, "m-fallback");

        // The same epoch is never announced twice.
        let (req, mut rx) = request("again");
        h.orchestrator.run_turn(req).await.unwrap();
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn exhausted_chain_fails_turn_and_keeps_user_message() {
        let primary = ScriptedBackend::new("m-primary", vec![rate_limited(None)]);
        let h = harness(config(), vec![primary], &[]);
        let (req, _rx) = request("hi");

        let err = h.orchestrator.run_turn(req).await.unwrap_err();
        assert!(matches!(
            err,
            TurnError::FallbackExhausted {
                reason: SwitchReason::NoFallbackConfigured,
                ..
            }
        ));
        let history = h.store.history("telegram:42").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].content, "hi");
    }

    #[tokio::test]
    async fn iteration_cap_returns_fallback_text() {
        let primary = ScriptedBackend::new(
            "m-primary",
            vec![
                tool_response(&[("c1", "sleep", "{}")]),
                tool_response(&[("c2", "sleep", "{}")]),
            ],
        );
        let cfg = OrchestratorConfig {
            max_iterations: 2,
            ..config()
        };
        let h = harness(cfg, vec![primary], &[]);
        let (req, _rx) = request("loop forever");

        let outcome = h.orchestrator.run_turn(req).await.unwrap();
        assert_eq!(
            outcome.text,
            "I reached the tool iteration limit (2) before finishing."
        );
        assert_eq!(outcome.iterations, 2);
    }

    #[tokio::test]
    async fn empty_answer_gets_placeholder() {
        let primary = ScriptedBackend::new("m-primary", vec![text_response("  ")]);
        let h = harness(config(), vec![primary], &[]);
        let (req, _rx) = request("hi");
        let outcome = h.orchestrator.run_turn(req).await.unwrap();
        assert_eq!(outcome.text, EMPTY_RESPONSE_TEXT);
    }

    #[tokio::test]
    async fn second_turn_for_busy_session_is_rejected() {
        let primary = ScriptedBackend::new("m-primary", vec![]);
        let h = harness(config(), vec![primary.clone()], &[]);
        let _held = h.orchestrator.turns().begin("telegram:42").unwrap();
        let (req, _rx) = request("hi");

        let err = h.orchestrator.run_turn(req).await.unwrap_err();
        assert!(matches!(err, TurnError::Busy(_)));
        assert_eq!(primary.call_count(), 0);
    }

    #[tokio::test]
    async fn cancel_interrupts_a_running_tool() {
        let primary = ScriptedBackend::new("m-primary", vec![tool_response(&[("c1", "block", "{}")])]);
        let h = harness(config(), vec![primary], &[]);
        let (req, _rx) = request("block please");

        let orchestrator = h.orchestrator.clone();
        let turn = tokio::spawn(async move { orchestrator.run_turn(req).await });
        h.entered.notified().await;

        assert_eq!(h.orchestrator.cancel("telegram:42"), CancelOutcome::Cancelled);
        let err = turn.await.unwrap().unwrap_err();
        assert!(err.is_cancelled());
        assert!(!h.orchestrator.turns().is_active("telegram:42"));
        assert_eq!(
            h.orchestrator.cancel("telegram:42"),
            CancelOutcome::NothingToCancel
        );
        assert_eq!(h.store.history("telegram:42").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn leading_tool_results_in_history_are_not_sent() {
        let primary = ScriptedBackend::new("m-primary", vec![text_response("ok")]);
        let h = harness(config(), vec![primary.clone()], &[]);
        h.store
            .append(
                "telegram:42",
                vec![
                    ChatMessage::tool_result("c0", "stale output"),
                    ChatMessage::assistant("earlier answer"),
                ],
            )
            .await
            .unwrap();
        let (req, _rx) = request("next");

        h.orchestrator.run_turn(req).await.unwrap();
        let sent = primary.calls.lock().unwrap()[0].clone();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[1].role, Role::Assistant);
        assert_eq!(sent[1].content, "earlier answer");
        assert!(sent.iter().all(|m| m.role != Role::Tool));
    }

    #[tokio::test]
    async fn rate_limited_retry_fails_the_turn() {
        let primary = ScriptedBackend::new("m-primary", vec![rate_limited(None)]);
        let fallback = ScriptedBackend::new("m-fallback", vec![rate_limited(None)]);
        let h = harness(config(), vec![primary.clone(), fallback.clone()], &["m-fallback"]);
        let (req, _rx) = request("hi");

        let err = h.orchestrator.run_turn(req).await.unwrap_err();
        match err {
            TurnError::Backend(e) => assert!(e.is_rate_limited()),
            other => panic!("expected backend error, got {other:?}"),
        }
        assert_eq!(primary.call_count(), 1);
        assert_eq!(fallback.call_count(), 1);
        assert!(h.usage.records.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn other_backend_errors_do_not_switch_routes() {
        let primary = ScriptedBackend::new("m-primary", vec![Err(LlmError::Http("boom".into()))]);
        let fallback = ScriptedBackend::new("m-fallback", vec![]);
        let h = harness(config(), vec![primary.clone(), fallback.clone()], &["m-fallback"]);
        let before = h.orchestrator.router().snapshot();
        let (req, mut rx) = request("hi");

        let err = h.orchestrator.run_turn(req).await.unwrap_err();
        assert!(matches!(err, TurnError::Backend(LlmError::Http(_))));
        assert_eq!(primary.call_count(), 1);
        assert_eq!(fallback.call_count(), 0);
        assert!(drain(&mut rx).is_empty());

        let after = h.orchestrator.router().snapshot();
        assert_eq!(after.active_model, "m-primary");
        assert_eq!(after.switch_epoch, before.switch_epoch);
    }

    fn planner_config() -> OrchestratorConfig {
        OrchestratorConfig {
            plan: PlanConfig {
                planner_model: Some("m-planner".to_string()),
                ..PlanConfig::default()
            },
            ..config()
        }
    }

    #[tokio::test]
    async fn planner_model_supplies_the_announced_steps() {
        let primary = ScriptedBackend::new(
            "m-primary",
            vec![
                tool_response(&[("c1", "read_file", r#"{"path":"notes/a.txt"}"#)]),
                text_response("done reading"),
            ],
        );
        let planner = ScriptedBackend::new(
            "m-planner",
            vec![text_response("Here you go:\n1. Open the notes\n2. Report back")],
        );
        let h = harness(planner_config(), vec![primary, planner.clone()], &[]);
        let (req, mut rx) = request("what is in a.txt?");

        h.orchestrator.run_turn(req).await.unwrap();
        assert_eq!(planner.call_count(), 1);
        let updates = drain(&mut rx);
        assert!(
            updates[0]
                .content
                .starts_with("Execution plan:\n1. Open the notes\n2. Report back\n")
        );

        let records = h.usage.records.lock().unwrap();
        let planner_records: Vec<_> = records.iter().filter(|r| r.reason == "planner").collect();
        assert_eq!(planner_records.len(), 1);
        assert_eq!(planner_records[0].model, "m-planner");
        assert_eq!(planner_records[0].total_tokens, 15);
    }

    #[tokio::test]
    async fn failed_planner_falls_back_to_derived_steps() {
        let primary = ScriptedBackend::new(
            "m-primary",
            vec![
                tool_response(&[("c1", "read_file", r#"{"path":"notes/a.txt"}"#)]),
                text_response("done reading"),
            ],
        );
        let planner = ScriptedBackend::new("m-planner", vec![Err(LlmError::Http("down".into()))]);
        let h = harness(planner_config(), vec![primary, planner.clone()], &[]);
        let (req, mut rx) = request("what is in a.txt?");

        let outcome = h.orchestrator.run_turn(req).await.unwrap();
        assert_eq!(outcome.text, "done reading");
        assert_eq!(planner.call_count(), 1);
        let updates = drain(&mut rx);
        assert!(updates[0].content.starts_with("Execution plan:\n1. Read a.txt\n"));
        assert!(
            !h.usage
                .records
                .lock()
                .unwrap()
                .iter()
                .any(|r| r.reason == "planner")
        );
    }

    #[tokio::test]
    async fn sessions_run_independently() {
        let primary = ScriptedBackend::new(
            "m-primary",
            vec![
                tool_response(&[("c1", "block", "{}")]),
                text_response("b done"),
            ],
        );
        let h = harness(config(), vec![primary], &[]);
        let (req_a, _rx_a) = request_for("1", "block please");
        let (req_b, _rx_b) = request_for("2", "quick one");

        let orchestrator = h.orchestrator.clone();
        let turn_a = tokio::spawn(async move { orchestrator.run_turn(req_a).await });
        h.entered.notified().await;
        assert!(h.orchestrator.turns().is_active("telegram:1"));

        let outcome = h.orchestrator.run_turn(req_b).await.unwrap();
        assert_eq!(outcome.text, "b done");
        assert!(!h.orchestrator.turns().is_active("telegram:2"));
        assert!(h.orchestrator.turns().is_active("telegram:1"));

        assert_eq!(h.orchestrator.cancel("telegram:1"), CancelOutcome::Cancelled);
        assert!(turn_a.await.unwrap().unwrap_err().is_cancelled());
        assert_eq!(h.orchestrator.turns().active_count(), 0);
        assert_eq!(h.store.history("telegram:2").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn message_after_cancel_waits_for_the_slot() {
        let primary = ScriptedBackend::new("m-primary", vec![text_response("fresh start")]);
        let h = harness(config(), vec![primary.clone()], &[]);
        let held = h.orchestrator.turns().begin("telegram:42").unwrap();
        assert_eq!(h.orchestrator.cancel("telegram:42"), CancelOutcome::Cancelled);

        let orchestrator = h.orchestrator.clone();
        let (req, _rx) = request("hello again");
        let turn = tokio::spawn(async move { orchestrator.run_turn(req).await });
        tokio::task::yield_now().await;
        assert_eq!(primary.call_count(), 0);

        drop(held);
        let outcome = turn.await.unwrap().unwrap();
        assert_eq!(outcome.text, "fresh start");
    }

    #[tokio::test]
    async fn full_plan_still_reports_new_tools() {
        let primary = ScriptedBackend::new(
            "m-primary",
            vec![
                tool_response(&[("c1", "read_file", r#"{"path":"a.txt"}"#)]),
                tool_response(&[("c2", "sleep", r#"{"seconds":1}"#)]),
                text_response("done"),
            ],
        );
        let cfg = OrchestratorConfig {
            plan: PlanConfig {
                min_steps: 1,
                max_steps: 1,
                ..PlanConfig::default()
            },
            ..config()
        };
        let h = harness(cfg, vec![primary], &[]);
        let (req, mut rx) = request("read then wait");

        h.orchestrator.run_turn(req).await.unwrap();
        let updates: Vec<String> = drain(&mut rx).into_iter().map(|u| u.content).collect();
        assert!(updates.contains(&"Plan update:\n- Wait before continuing".to_string()));
    }
}

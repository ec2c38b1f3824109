//! Process-wide model routing with rate-limit failover.
//!
//! Every turn asks the router which backend to call. A rate-limited call moves
//! the route one step down the fallback chain; background probes against the
//! primary decide when it is safe to offer (or apply) a switch back.
//!
//! All state transitions happen under one lock and are persisted before the
//! lock is released.

pub mod rate_signal;
pub mod state;

use crate::config::FailoverConfig;
use crate::usage::{UsageRecord, UsageSink};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use state::{RouteMode, RouteState, RouteStateStore};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use yard_llm::{ChatBackend, ChatMessage, ChatOptions, LlmError};

const PROBE_PROMPT: &str = "health_check: reply with OK";

/// Builds a backend handle for a model identifier.
pub trait BackendFactory: Send + Sync {
    fn build(&self, model: &str) -> yard_llm::Result<Arc<dyn ChatBackend>>;
}

#[derive(Debug, Clone)]
pub struct FailoverPolicy {
    pub enabled: bool,
    pub hold: chrono::Duration,
    pub probe_interval: chrono::Duration,
    pub probe_success_threshold: u32,
    pub probe_failure_backoff: chrono::Duration,
    pub switchback_requires_approval: bool,
    pub prompt_cooldown: chrono::Duration,
    pub probe_timeout: Duration,
}

impl From<&FailoverConfig> for FailoverPolicy {
    fn from(cfg: &FailoverConfig) -> Self {
        Self {
            enabled: cfg.enabled,
            hold: cfg.hold(),
            probe_interval: cfg.probe_interval(),
            probe_success_threshold: cfg.probe_success_threshold.max(1),
            probe_failure_backoff: cfg.probe_failure_backoff(),
            switchback_requires_approval: cfg.switchback_requires_approval,
            prompt_cooldown: cfg.prompt_cooldown(),
            probe_timeout: cfg.probe_timeout(),
        }
    }
}

impl Default for FailoverPolicy {
    fn default() -> Self {
        Self::from(&FailoverConfig::default())
    }
}

/// The backend a call should go to right now.
#[derive(Clone)]
pub struct Route {
    pub model: String,
    pub backend: Arc<dyn ChatBackend>,
    pub is_primary: bool,
    pub mode: RouteMode,
    pub epoch: u64,
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("model", &self.model)
            .field("is_primary", &self.is_primary)
            .field("mode", &self.mode)
            .field("epoch", &self.epoch)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchReason {
    RateLimited,
    /// Another turn already moved the route off the model this call used.
    AlreadySwitched,
    FallbackExhausted,
    NoFallbackConfigured,
    FailoverDisabled,
}

impl SwitchReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RateLimited => "rate_limited",
            Self::AlreadySwitched => "already_switched",
            Self::FallbackExhausted => "fallback_exhausted",
            Self::NoFallbackConfigured => "no_fallback_configured",
            Self::FailoverDisabled => "failover_disabled",
        }
    }
}

impl std::fmt::Display for SwitchReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchEvent {
    pub from: String,
    pub to: String,
    pub reason: SwitchReason,
    pub switched: bool,
    pub epoch: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOutcome {
    /// False when another probe was in flight or no probe was due.
    pub ran: bool,
    pub success: bool,
    pub mode: RouteMode,
    pub next_probe_at: Option<DateTime<Utc>>,
    /// Switchback question for the user, at most once per cooldown window.
    pub prompt: Option<String>,
    /// Set when the probe applied an automatic switchback.
    pub switchback_notice: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecisionOutcome {
    /// Not a decision, or no decision pending. Treat the text as a normal message.
    NotHandled,
    SwitchedBack { reply: String },
    StayedOnFallback { reply: String },
}

impl DecisionOutcome {
    pub fn reply(&self) -> Option<&str> {
        match self {
            Self::NotHandled => None,
            Self::SwitchedBack { reply } | Self::StayedOnFallback { reply } => Some(reply),
        }
    }
}

/// Clears the probe flag when the probe future completes or is dropped.
struct ProbeGuard<'a>(&'a AtomicBool);

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct FailoverRouter {
    policy: FailoverPolicy,
    primary: String,
    chain: Vec<String>,
    factory: Arc<dyn BackendFactory>,
    store: Option<RouteStateStore>,
    usage: Option<Arc<dyn UsageSink>>,
    state: Mutex<RouteState>,
    backends: DashMap<String, Arc<dyn ChatBackend>>,
    probe_running: AtomicBool,
}

impl FailoverRouter {
    /// Restores persisted state from `store` when it still matches the configured chain.
    pub fn new(
        primary: &str,
        fallbacks: &[String],
        policy: FailoverPolicy,
        factory: Arc<dyn BackendFactory>,
        store: Option<RouteStateStore>,
    ) -> Self {
        let primary = primary.trim().to_string();
        let chain = normalize_chain(&primary, fallbacks);
        let now = Utc::now();

        let restored = store.as_ref().and_then(|store| match store.load() {
            Ok(Some(state)) if state.matches_chain(&primary, &chain) => Some(state),
            Ok(Some(state)) => {
                tracing::info!(
                    persisted_primary = %state.primary_model,
                    persisted_active = %state.active_model,
                    "discarding persisted route state that no longer matches the model chain"
                );
                None
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(error = %e, "route state unreadable; starting on primary");
                None
            }
        });
        let state = match restored {
            Some(state) => {
                tracing::info!(
                    mode = state.mode.as_str(),
                    active_model = %state.active_model,
                    switch_epoch = state.switch_epoch,
                    "restored route state"
                );
                state
            }
            None => RouteState::on_primary(&primary, now),
        };

        Self {
            policy,
            primary,
            chain,
            factory,
            store,
            usage: None,
            state: Mutex::new(state),
            backends: DashMap::new(),
            probe_running: AtomicBool::new(false),
        }
    }

    pub fn with_usage_sink(mut self, usage: Arc<dyn UsageSink>) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn primary_model(&self) -> &str {
        &self.primary
    }

    pub fn fallback_chain(&self) -> &[String] {
        &self.chain
    }

    pub fn policy(&self) -> &FailoverPolicy {
        &self.policy
    }

    pub fn snapshot(&self) -> RouteState {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, RouteState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, state: &RouteState) {
        let Some(store) = &self.store else {
            return;
        };
        if let Err(e) = store.save(state) {
            tracing::warn!(path = %store.path().display(), error = %e, "route state persist failed");
        }
    }

    /// Cached handle for `model`; built through the factory on first use.
    pub fn backend_for(&self, model: &str) -> yard_llm::Result<Arc<dyn ChatBackend>> {
        if let Some(backend) = self.backends.get(model) {
            return Ok(backend.clone());
        }
        let backend = self.factory.build(model)?;
        self.backends.insert(model.to_string(), backend.clone());
        Ok(backend)
    }

    pub fn resolve_route(&self) -> yard_llm::Result<Route> {
        let (model, mode, epoch) = {
            let state = self.lock();
            (state.active_model.clone(), state.mode, state.switch_epoch)
        };
        let backend = self.backend_for(&model)?;
        Ok(Route {
            is_primary: model == self.primary,
            model,
            backend,
            mode,
            epoch,
        })
    }

    pub fn on_rate_limited(&self, called_model: &str, error: &LlmError) -> SwitchEvent {
        self.on_rate_limited_at(Utc::now(), called_model, error)
    }

    pub fn on_rate_limited_at(
        &self,
        now: DateTime<Utc>,
        called_model: &str,
        error: &LlmError,
    ) -> SwitchEvent {
        let mut state = self.lock();
        let from = state.active_model.clone();
        let unchanged = |reason: SwitchReason, switched: bool, epoch: u64| SwitchEvent {
            from: called_model.to_string(),
            to: from.clone(),
            reason,
            switched,
            epoch,
        };

        if !self.policy.enabled {
            return unchanged(SwitchReason::FailoverDisabled, false, state.switch_epoch);
        }
        if called_model != state.active_model {
            return unchanged(SwitchReason::AlreadySwitched, true, state.switch_epoch);
        }
        if self.chain.is_empty() {
            tracing::warn!(model = %called_model, "rate limited with no fallback configured");
            return unchanged(SwitchReason::NoFallbackConfigured, false, state.switch_epoch);
        }
        let next_index = state.fallback_index.map_or(0, |i| i + 1);
        let Some(to) = self.chain.get(next_index).cloned() else {
            tracing::warn!(model = %called_model, "rate limited and fallback chain exhausted");
            return unchanged(SwitchReason::FallbackExhausted, false, state.switch_epoch);
        };

        let mut hold_until = now + self.policy.hold;
        if let Some(hinted) = error
            .rate_limit()
            .and_then(|info| rate_signal::resume_at(now, info))
        {
            hold_until = hold_until.max(hinted);
        }

        state.mode = RouteMode::Degraded;
        state.active_model = to.clone();
        state.fallback_index = Some(next_index);
        state.degraded_at.get_or_insert(now);
        state.hold_until = Some(hold_until);
        state.next_probe_at = Some(hold_until);
        state.consecutive_probe_successes = 0;
        state.switch_epoch += 1;
        state.last_switch_reason = Some(SwitchReason::RateLimited.as_str().to_string());
        state.switchback_prompt_sent = false;
        state.updated_at = now;
        self.persist(&state);

        tracing::warn!(
            from = %from,
            to = %to,
            switch_epoch = state.switch_epoch,
            hold_until = %hold_until,
            "rate limited; switched to fallback model"
        );
        SwitchEvent {
            from,
            to,
            reason: SwitchReason::RateLimited,
            switched: true,
            epoch: state.switch_epoch,
        }
    }

    /// Only fills in an unknown active model. Success on a fallback never ends
    /// degraded mode; probing does.
    pub fn on_success(&self, model: &str) {
        let mut state = self.lock();
        if state.active_model.trim().is_empty() {
            state.active_model = model.to_string();
            state.updated_at = Utc::now();
            self.persist(&state);
            return;
        }
        tracing::debug!(model = %model, active_model = %state.active_model, "backend call succeeded");
    }

    pub fn should_probe(&self) -> bool {
        self.should_probe_at(Utc::now())
    }

    pub fn should_probe_at(&self, now: DateTime<Utc>) -> bool {
        if !self.policy.enabled {
            return false;
        }
        let state = self.lock();
        if state.is_on_primary() {
            return false;
        }
        state.hold_until.is_none_or(|t| now >= t) && state.next_probe_at.is_none_or(|t| now >= t)
    }

    /// Health-checks the primary when a probe is due. At most one probe runs at a time.
    #[tracing::instrument(level = "info", skip_all, fields(primary = %self.primary))]
    pub async fn run_probe(&self) -> ProbeOutcome {
        if self
            .probe_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return self.skipped_probe();
        }
        let _guard = ProbeGuard(&self.probe_running);
        if !self.should_probe() {
            return self.skipped_probe();
        }

        let backend = match self.backend_for(&self.primary) {
            Ok(backend) => backend,
            Err(e) => return self.record_probe_result_at(Utc::now(), Err(&e)),
        };
        let messages = [ChatMessage::user(PROBE_PROMPT)];
        let options = ChatOptions {
            max_tokens: Some(8),
            temperature: Some(0.0),
        };
        let started = Instant::now();
        let result = match tokio::time::timeout(
            self.policy.probe_timeout,
            backend.chat(&messages, &[], &options),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(LlmError::Http(format!(
                "probe timed out after {}s",
                self.policy.probe_timeout.as_secs()
            ))),
        };
        let latency_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(response) => {
                tracing::info!(latency_ms, "primary probe succeeded");
                self.record_usage(UsageRecord::for_call(
                    &self.primary,
                    response.usage.as_ref(),
                    "probe",
                ));
            }
            Err(e) => tracing::warn!(latency_ms, error = %e, "primary probe failed"),
        }
        self.record_probe_result_at(Utc::now(), result.as_ref().map(|_| ()))
    }

    fn skipped_probe(&self) -> ProbeOutcome {
        let state = self.lock();
        ProbeOutcome {
            ran: false,
            success: false,
            mode: state.mode,
            next_probe_at: state.next_probe_at,
            prompt: None,
            switchback_notice: None,
        }
    }

    fn record_usage(&self, record: UsageRecord) {
        if let Some(usage) = &self.usage {
            if let Err(e) = usage.record(record) {
                tracing::warn!(error = %e, "usage record failed");
            }
        }
    }

    pub fn record_probe_result_at(
        &self,
        now: DateTime<Utc>,
        result: Result<(), &LlmError>,
    ) -> ProbeOutcome {
        let mut state = self.lock();
        let mut outcome = ProbeOutcome {
            ran: true,
            success: result.is_ok(),
            mode: state.mode,
            next_probe_at: state.next_probe_at,
            prompt: None,
            switchback_notice: None,
        };
        if state.is_on_primary() {
            // The route went back to primary while the probe was in flight.
            return outcome;
        }
        state.last_probe_at = Some(now);
        state.updated_at = now;

        match result {
            Ok(()) => {
                state.consecutive_probe_successes += 1;
                state.next_probe_at = Some(now + self.policy.probe_interval);
                if state.consecutive_probe_successes >= self.policy.probe_success_threshold {
                    if state.mode == RouteMode::Degraded {
                        state.mode = RouteMode::AwaitingSwitchback;
                        state.switch_epoch += 1;
                        state.last_switch_reason = Some("primary_healthy".to_string());
                        tracing::info!(
                            switch_epoch = state.switch_epoch,
                            successes = state.consecutive_probe_successes,
                            "primary passed health probes; awaiting switchback"
                        );
                    }
                    if !self.policy.switchback_requires_approval {
                        let from = state.active_model.clone();
                        self.switch_back_locked(&mut state, now, "auto_switchback");
                        outcome.switchback_notice = Some(format!(
                            "Switched back to primary model {} from {from}.",
                            self.primary
                        ));
                    } else if self.prompt_due(&state, now) {
                        state.switchback_prompt_sent = true;
                        state.last_switchback_prompt_at = Some(now);
                        outcome.prompt = Some(format!(
                            "Primary model {} looks healthy (probe at {}). Currently using fallback {}. \
                             Reply 'yes' to switch back to primary or 'no' to stay on fallback.",
                            self.primary,
                            now.format("%Y-%m-%d %H:%M:%S UTC"),
                            state.active_model
                        ));
                    }
                }
            }
            Err(error) => {
                if state.mode == RouteMode::AwaitingSwitchback {
                    state.switch_epoch += 1;
                }
                state.mode = RouteMode::Degraded;
                state.consecutive_probe_successes = 0;
                state.switchback_prompt_sent = false;
                let mut next = now + self.policy.probe_failure_backoff;
                if let Some(info) = error.rate_limit() {
                    let mut hold_until = now + self.policy.hold;
                    if let Some(hinted) = rate_signal::resume_at(now, info) {
                        hold_until = hold_until.max(hinted);
                    }
                    state.hold_until = Some(hold_until);
                    next = hold_until;
                }
                state.next_probe_at = Some(next);
            }
        }
        self.persist(&state);

        outcome.mode = state.mode;
        outcome.next_probe_at = state.next_probe_at;
        outcome
    }

    fn prompt_due(&self, state: &RouteState, now: DateTime<Utc>) -> bool {
        !state.switchback_prompt_sent
            && state
                .last_switchback_prompt_at
                .is_none_or(|last| now - last >= self.policy.prompt_cooldown)
    }

    fn switch_back_locked(&self, state: &mut RouteState, now: DateTime<Utc>, reason: &str) {
        let from = state.active_model.clone();
        state.reset_to_primary(now);
        state.switch_epoch += 1;
        state.last_switch_reason = Some(reason.to_string());
        state.last_switchback_prompt_at = None;
        tracing::info!(
            from = %from,
            to = %self.primary,
            switch_epoch = state.switch_epoch,
            reason,
            "switched back to primary model"
        );
    }

    pub fn handle_user_switchback_decision(&self, text: &str) -> DecisionOutcome {
        self.handle_user_switchback_decision_at(Utc::now(), text)
    }

    pub fn handle_user_switchback_decision_at(
        &self,
        now: DateTime<Utc>,
        text: &str,
    ) -> DecisionOutcome {
        let Some(approve) = parse_decision(text) else {
            return DecisionOutcome::NotHandled;
        };
        let mut state = self.lock();
        if state.mode != RouteMode::AwaitingSwitchback {
            return DecisionOutcome::NotHandled;
        }

        if approve {
            let from = state.active_model.clone();
            self.switch_back_locked(&mut state, now, "user_switchback");
            self.persist(&state);
            return DecisionOutcome::SwitchedBack {
                reply: format!("Switched back to primary model {} from {from}.", self.primary),
            };
        }

        state.switchback_prompt_sent = false;
        state.last_switchback_prompt_at = Some(now);
        state.last_switch_reason = Some("switchback_declined".to_string());
        state.updated_at = now;
        self.persist(&state);
        DecisionOutcome::StayedOnFallback {
            reply: format!(
                "Staying on fallback model {}. I will remind you again later if primary stays healthy.",
                state.active_model
            ),
        }
    }
}

/// `Some(true)` for an affirmative reply, `Some(false)` for a negative one.
fn parse_decision(text: &str) -> Option<bool> {
    let normalized = text
        .trim()
        .trim_end_matches(|c: char| c.is_ascii_punctuation())
        .trim()
        .to_lowercase();
    match normalized.as_str() {
        "yes" | "y" | "switch" | "switch back" => Some(true),
        "no" | "n" | "stay" | "stay fallback" | "stay on fallback" => Some(false),
        _ => None,
    }
}

/// Trimmed, primary and empty entries removed, case-insensitive duplicates dropped.
fn normalize_chain(primary: &str, fallbacks: &[String]) -> Vec<String> {
    let mut seen = vec![primary.to_ascii_lowercase()];
    let mut chain = Vec::new();
    for model in fallbacks {
        let model = model.trim();
        if model.is_empty() {
            continue;
        }
        let key = model.to_ascii_lowercase();
        if seen.contains(&key) {
            continue;
        }
        seen.push(key);
        chain.push(model.to_string());
    }
    chain
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeFactory, MemoryUsage, ScriptedBackend, rate_limited, text_response};

    fn rl() -> LlmError {
        rate_limited(None).unwrap_err()
    }

    fn policy() -> FailoverPolicy {
        FailoverPolicy {
            hold: chrono::Duration::minutes(30),
            probe_interval: chrono::Duration::minutes(10),
            probe_failure_backoff: chrono::Duration::minutes(5),
            prompt_cooldown: chrono::Duration::minutes(60),
            ..FailoverPolicy::default()
        }
    }

    fn router_with(policy: FailoverPolicy, store: Option<RouteStateStore>) -> FailoverRouter {
        let factory = FakeFactory::with(vec![
            ScriptedBackend::new("M0", vec![]),
            ScriptedBackend::new("M1", vec![]),
            ScriptedBackend::new("M2", vec![]),
        ]);
        FailoverRouter::new(
            "M0",
            &["M1".to_string(), "M2".to_string()],
            policy,
            factory,
            store,
        )
    }

    fn router() -> FailoverRouter {
        router_with(policy(), None)
    }

    /// Degrade to M1 and run enough successful probes to await switchback.
    fn awaiting(router: &FailoverRouter, now: DateTime<Utc>) -> ProbeOutcome {
        router.on_rate_limited_at(now, "M0", &rl());
        router.record_probe_result_at(now, Ok(()));
        router.record_probe_result_at(now, Ok(()))
    }

    #[test]
    fn chain_is_normalized() {
        let chain = normalize_chain(
            "gpt-4o",
            &[" claude-3 ".into(), "GPT-4o".into(), "".into(), "Claude-3".into(), "o3".into()],
        );
        assert_eq!(chain, vec!["claude-3".to_string(), "o3".to_string()]);
    }

    #[test]
    fn walks_the_chain_then_reports_exhaustion() {
        let router = router();
        let now = Utc::now();

        let ev = router.on_rate_limited_at(now, "M0", &rl());
        assert!(ev.switched);
        assert_eq!((ev.from.as_str(), ev.to.as_str(), ev.epoch), ("M0", "M1", 1));

        let ev = router.on_rate_limited_at(now, "M1", &rl());
        assert_eq!((ev.to.as_str(), ev.epoch), ("M2", 2));

        let ev = router.on_rate_limited_at(now, "M2", &rl());
        assert!(!ev.switched);
        assert_eq!(ev.reason, SwitchReason::FallbackExhausted);
        let state = router.snapshot();
        assert_eq!(state.active_model, "M2");
        assert_eq!(state.switch_epoch, 2);
        assert_eq!(state.mode, RouteMode::Degraded);
    }

    #[test]
    fn resolve_route_is_stable_without_events() {
        let router = router();
        router.on_rate_limited_at(Utc::now(), "M0", &rl());
        let first = router.resolve_route().unwrap();
        for _ in 0..5 {
            let again = router.resolve_route().unwrap();
            assert_eq!((again.model.as_str(), again.epoch), (first.model.as_str(), first.epoch));
        }
        assert!(!first.is_primary);
        assert_eq!(first.backend.model(), "M1");
    }

    #[test]
    fn resolve_route_fails_for_unbuildable_backend() {
        let router = FailoverRouter::new("ghost", &[], policy(), FakeFactory::with(vec![]), None);
        assert!(matches!(router.resolve_route(), Err(LlmError::Config(_))));
    }

    #[test]
    fn stale_caller_does_not_skip_a_fallback() {
        let router = router();
        let now = Utc::now();
        router.on_rate_limited_at(now, "M0", &rl());
        let ev = router.on_rate_limited_at(now, "M0", &rl());
        assert!(ev.switched);
        assert_eq!(ev.reason, SwitchReason::AlreadySwitched);
        assert_eq!(ev.to, "M1");
        assert_eq!(router.snapshot().switch_epoch, 1);
    }

    #[test]
    fn no_fallback_and_disabled_do_not_switch() {
        let factory = FakeFactory::with(vec![ScriptedBackend::new("M0", vec![])]);
        let router = FailoverRouter::new("M0", &["m0".to_string()], policy(), factory, None);
        let ev = router.on_rate_limited("M0", &rl());
        assert_eq!(ev.reason, SwitchReason::NoFallbackConfigured);
        assert!(!ev.switched);

        let disabled = router_with(
            FailoverPolicy {
                enabled: false,
                ..policy()
            },
            None,
        );
        let ev = disabled.on_rate_limited("M0", &rl());
        assert_eq!(ev.reason, SwitchReason::FailoverDisabled);
        assert!(disabled.snapshot().is_on_primary());
    }

    #[test]
    fn hold_respects_longer_rate_limit_hint() {
        let router = router();
        let now = Utc::now();
        let hinted = rate_limited(Some("7200")).unwrap_err();
        router.on_rate_limited_at(now, "M0", &hinted);
        let state = router.snapshot();
        assert_eq!(state.hold_until, Some(now + chrono::Duration::seconds(7200)));
        assert_eq!(state.next_probe_at, state.hold_until);
        assert_eq!(state.degraded_at, Some(now));
    }

    #[test]
    fn probe_eligibility_waits_for_hold() {
        let router = router();
        let now = Utc::now();
        assert!(!router.should_probe_at(now));
        router.on_rate_limited_at(now, "M0", &rl());
        assert!(!router.should_probe_at(now + chrono::Duration::minutes(29)));
        assert!(router.should_probe_at(now + chrono::Duration::minutes(30)));
    }

    #[test]
    fn threshold_successes_await_switchback_and_failure_resets() {
        let router = router();
        let now = Utc::now();
        router.on_rate_limited_at(now, "M0", &rl());

        let out = router.record_probe_result_at(now, Ok(()));
        assert_eq!(out.mode, RouteMode::Degraded);
        assert_eq!(router.snapshot().consecutive_probe_successes, 1);

        let out = router.record_probe_result_at(now, Err(&LlmError::Http("boom".into())));
        assert_eq!(out.mode, RouteMode::Degraded);
        assert_eq!(out.next_probe_at, Some(now + chrono::Duration::minutes(5)));
        assert_eq!(router.snapshot().consecutive_probe_successes, 0);

        router.record_probe_result_at(now, Ok(()));
        let out = router.record_probe_result_at(now, Ok(()));
        assert_eq!(out.mode, RouteMode::AwaitingSwitchback);
        assert!(out.prompt.as_deref().unwrap().contains("Primary model M0 looks healthy"));
        assert_eq!(router.snapshot().switch_epoch, 2);
    }

    #[test]
    fn rate_limited_probe_extends_hold() {
        let router = router();
        let now = Utc::now();
        router.on_rate_limited_at(now, "M0", &rl());
        let later = now + chrono::Duration::hours(1);
        let out = router.record_probe_result_at(later, Err(&rl()));
        assert_eq!(out.next_probe_at, Some(later + chrono::Duration::minutes(30)));
        assert_eq!(router.snapshot().hold_until, out.next_probe_at);
    }

    #[test]
    fn probe_failure_while_awaiting_returns_to_degraded() {
        let router = router();
        let now = Utc::now();
        awaiting(&router, now);
        let epoch = router.snapshot().switch_epoch;
        let out = router.record_probe_result_at(now, Err(&LlmError::Http("down".into())));
        assert_eq!(out.mode, RouteMode::Degraded);
        assert_eq!(router.snapshot().switch_epoch, epoch + 1);
        assert_eq!(
            router.handle_user_switchback_decision_at(now, "yes"),
            DecisionOutcome::NotHandled
        );
    }

    #[test]
    fn prompt_is_not_repeated_until_cooldown() {
        let router = router();
        let now = Utc::now();
        assert!(awaiting(&router, now).prompt.is_some());
        assert!(router.record_probe_result_at(now, Ok(())).prompt.is_none());

        // Declining restarts the cooldown window.
        let declined = router.handle_user_switchback_decision_at(now, "No.");
        assert!(matches!(declined, DecisionOutcome::StayedOnFallback { .. }));
        assert_eq!(router.snapshot().mode, RouteMode::AwaitingSwitchback);
        assert_eq!(router.snapshot().active_model, "M1");
        let soon = now + chrono::Duration::minutes(30);
        assert!(router.record_probe_result_at(soon, Ok(())).prompt.is_none());
        let later = now + chrono::Duration::minutes(61);
        assert!(router.record_probe_result_at(later, Ok(())).prompt.is_some());
    }

    #[test]
    fn affirmative_decision_switches_back() {
        let router = router();
        let now = Utc::now();
        awaiting(&router, now);
        let epoch = router.snapshot().switch_epoch;

        assert_eq!(
            router.handle_user_switchback_decision_at(now, "maybe later"),
            DecisionOutcome::NotHandled
        );
        let out = router.handle_user_switchback_decision_at(now, "  Switch Back! ");
        assert_eq!(out.reply(), Some("Switched back to primary model M0 from M1."));

        let state = router.snapshot();
        assert_eq!(state.mode, RouteMode::Normal);
        assert_eq!(state.active_model, "M0");
        assert_eq!(state.fallback_index, None);
        assert_eq!(state.consecutive_probe_successes, 0);
        assert_eq!(state.switch_epoch, epoch + 1);
        assert!(router.resolve_route().unwrap().is_primary);
    }

    #[test]
    fn decision_is_ignored_unless_awaiting() {
        let router = router();
        assert_eq!(
            router.handle_user_switchback_decision("yes"),
            DecisionOutcome::NotHandled
        );
    }

    #[test]
    fn auto_switchback_without_approval() {
        let router = router_with(
            FailoverPolicy {
                switchback_requires_approval: false,
                ..policy()
            },
            None,
        );
        let now = Utc::now();
        let out = awaiting(&router, now);
        assert_eq!(out.mode, RouteMode::Normal);
        assert!(out.prompt.is_none());
        assert_eq!(
            out.switchback_notice.as_deref(),
            Some("Switched back to primary model M0 from M1.")
        );
        // degrade (1), awaiting (2), switched back (3)
        assert_eq!(router.snapshot().switch_epoch, 3);
    }

    #[test]
    fn success_never_ends_degraded_mode() {
        let router = router();
        router.on_rate_limited("M0", &rl());
        router.on_success("M1");
        router.on_success("M0");
        let state = router.snapshot();
        assert_eq!(state.mode, RouteMode::Degraded);
        assert_eq!(state.active_model, "M1");
    }

    #[test]
    fn state_survives_restart_and_is_dropped_on_chain_change() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("state").join("failover.json");
        let router = router_with(policy(), Some(RouteStateStore::new(&path)));
        router.on_rate_limited("M0", &rl());
        router.on_rate_limited("M1", &rl());

        let restored = router_with(policy(), Some(RouteStateStore::new(&path)));
        let state = restored.snapshot();
        assert_eq!(state.active_model, "M2");
        assert_eq!(state.switch_epoch, 2);

        let factory = FakeFactory::with(vec![ScriptedBackend::new("M9", vec![])]);
        let other = FailoverRouter::new(
            "M9",
            &["M1".to_string()],
            policy(),
            factory,
            Some(RouteStateStore::new(&path)),
        );
        assert!(other.snapshot().is_on_primary());
    }

    #[tokio::test]
    async fn run_probe_calls_primary_and_records_usage() {
        let primary = ScriptedBackend::new("M0", vec![text_response("OK")]);
        let factory = FakeFactory::with(vec![
            primary.clone(),
            ScriptedBackend::new("M1", vec![]),
        ]);
        let usage = Arc::new(MemoryUsage::default());
        let router = FailoverRouter::new(
            "M0",
            &["M1".to_string()],
            FailoverPolicy {
                hold: chrono::Duration::zero(),
                ..policy()
            },
            factory,
            None,
        )
        .with_usage_sink(usage.clone());

        assert!(!router.run_probe().await.ran);
        router.on_rate_limited_at(Utc::now() - chrono::Duration::seconds(1), "M0", &rl());
        let out = router.run_probe().await;
        assert!(out.ran && out.success);
        assert_eq!(primary.call_count(), 1);
        let sent = &primary.calls.lock().unwrap()[0];
        assert_eq!(sent[0].content, PROBE_PROMPT);
        assert_eq!(usage.records.lock().unwrap()[0].reason, "probe");

        // Next probe is an interval away.
        assert!(!router.run_probe().await.ran);
    }

    #[tokio::test]
    async fn only_one_probe_runs_at_a_time() {
        let router = router();
        router.probe_running.store(true, Ordering::Release);
        router.on_rate_limited_at(Utc::now() - chrono::Duration::hours(1), "M0", &rl());
        assert!(!router.run_probe().await.ran);
        router.probe_running.store(false, Ordering::Release);
        assert!(router.run_probe().await.ran);
    }
}

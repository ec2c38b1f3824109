//! Slash commands answered without a model call.

use crate::failover::FailoverRouter;
use crate::session::HistoryStore;
use crate::usage::{
    UsageAggregate, UsageFilter, UsageLedger, aggregate, grouped_int, human_tokens,
    provider_breakdown, today_key,
};
use chrono::{DateTime, SecondsFormat, Utc};
use std::time::Duration;

const SESSION_USAGE_RECORDS_MAX: usize = 20;
const COMMAND_LIST: &str = "/stop /new /status /failover /usage [last|session|today|providers] /help";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageView {
    Dashboard,
    Last,
    Session,
    Today,
    Providers,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Stop,
    New,
    Status,
    Failover,
    Usage(UsageView),
    Help,
    Unknown(String),
}

/// `None` when `input` is not a slash command. `/cmd@botname` is accepted.
pub fn parse_command(input: &str) -> Option<Command> {
    let trimmed = input.trim();
    if !trimmed.starts_with('/') {
        return None;
    }
    let mut parts = trimmed.split_whitespace();
    let head = parts.next()?;
    let name = head
        .split_once('@')
        .map_or(head, |(name, _)| name)
        .to_ascii_lowercase();
    let arg = parts.next().map(str::to_ascii_lowercase);

    Some(match name.as_str() {
        "/stop" => Command::Stop,
        "/new" => Command::New,
        "/status" => Command::Status,
        "/failover" => Command::Failover,
        "/help" | "/start" => Command::Help,
        "/usage" => match arg.as_deref() {
            None => Command::Usage(UsageView::Dashboard),
            Some("last") => Command::Usage(UsageView::Last),
            Some("session") => Command::Usage(UsageView::Session),
            Some("today") => Command::Usage(UsageView::Today),
            Some("provider" | "providers") => Command::Usage(UsageView::Providers),
            Some(_) => Command::Unknown(trimmed.to_string()),
        },
        _ => Command::Unknown(trimmed.to_string()),
    })
}

pub struct CommandContext<'a> {
    pub router: &'a FailoverRouter,
    pub history: &'a dyn HistoryStore,
    pub ledger: Option<&'a UsageLedger>,
    pub session_key: &'a str,
    pub uptime: Duration,
    pub channels: &'a [String],
}

/// Runs everything but `/stop`, which the gateway owns.
pub async fn execute(command: &Command, ctx: &CommandContext<'_>) -> String {
    match command {
        Command::Stop => "Send /stop while a reply is in progress to cancel it.".to_string(),
        Command::New => match ctx.history.reset(ctx.session_key).await {
            Ok(()) => "Session reset.".to_string(),
            Err(e) => {
                tracing::warn!(session_key = ctx.session_key, error = %e, "session reset failed");
                format!("Error: could not reset session: {e}")
            }
        },
        Command::Status => status(ctx),
        Command::Failover => failover(ctx.router),
        Command::Usage(view) => match ctx.ledger {
            Some(ledger) => usage(*view, ledger, ctx.session_key),
            None => "Usage tracking is disabled.".to_string(),
        },
        Command::Help => format!(
            "Send any message to talk to the agent. Reply yes/no when asked about switching back \
             to the primary model.\nCommands: {COMMAND_LIST}"
        ),
        Command::Unknown(_) => format!("Unknown command. Supported: {COMMAND_LIST}"),
    }
}

fn opt_time(value: Option<DateTime<Utc>>) -> String {
    value.map_or_else(
        || "none".to_string(),
        |t| t.to_rfc3339_opts(SecondsFormat::Secs, true),
    )
}

fn status(ctx: &CommandContext<'_>) -> String {
    let state = ctx.router.snapshot();
    format!(
        "model={}\nactive_model={}\nmode={}\nswitch_epoch={}\nchannels={}\nuptime_seconds={}",
        ctx.router.primary_model(),
        state.active_model,
        state.mode.as_str(),
        state.switch_epoch,
        ctx.channels.join(","),
        ctx.uptime.as_secs()
    )
}

fn failover(router: &FailoverRouter) -> String {
    let state = router.snapshot();
    let chain = router.fallback_chain();
    let lines = [
        format!("enabled={}", router.policy().enabled),
        format!("mode={}", state.mode.as_str()),
        format!("primary_model={}", state.primary_model),
        format!("active_model={}", state.active_model),
        format!(
            "fallback_chain={}",
            if chain.is_empty() {
                "none".to_string()
            } else {
                chain.join(",")
            }
        ),
        format!(
            "fallback_index={}",
            state
                .fallback_index
                .map_or_else(|| "none".to_string(), |i| i.to_string())
        ),
        format!("degraded_at={}", opt_time(state.degraded_at)),
        format!("hold_until={}", opt_time(state.hold_until)),
        format!("next_probe_at={}", opt_time(state.next_probe_at)),
        format!("last_probe_at={}", opt_time(state.last_probe_at)),
        format!(
            "consecutive_probe_successes={}/{}",
            state.consecutive_probe_successes,
            router.policy().probe_success_threshold
        ),
        format!("switch_epoch={}", state.switch_epoch),
        format!(
            "last_switch_reason={}",
            state.last_switch_reason.as_deref().unwrap_or("none")
        ),
        format!("switchback_prompt_sent={}", state.switchback_prompt_sent),
    ];
    lines.join("\n")
}

fn tokens(n: u64) -> String {
    format!("{} ({})", grouped_int(n), human_tokens(n))
}

fn aggregate_line(label: &str, agg: &UsageAggregate) -> String {
    format!(
        "{label}: calls={} known={} unknown={} in={} out={} total={}",
        agg.calls,
        agg.known_calls,
        agg.unknown_calls,
        tokens(agg.prompt_tokens),
        tokens(agg.completion_tokens),
        tokens(agg.total_tokens)
    )
}

fn usage(view: UsageView, ledger: &UsageLedger, session_key: &str) -> String {
    let day = today_key();
    let session_filter = UsageFilter {
        session_key: Some(session_key.to_string()),
        ..UsageFilter::default()
    };
    let today_filter = UsageFilter {
        day_key: Some(day.clone()),
        ..UsageFilter::default()
    };

    match view {
        UsageView::Last => match ledger.last_by_session(session_key) {
            Some(last) => format!(
                "Last usage ({}, {}): known={} in={} out={} total={} provider={} model={} reason={}",
                last.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
                last.day_key,
                last.usage_known,
                tokens(last.prompt_tokens),
                tokens(last.completion_tokens),
                tokens(last.total_tokens),
                last.provider,
                last.model,
                last.reason
            ),
            None => "No usage records found for this session yet.".to_string(),
        },
        UsageView::Session => {
            let records = ledger.query(&UsageFilter {
                limit: Some(SESSION_USAGE_RECORDS_MAX),
                ..session_filter
            });
            if records.is_empty() {
                return "No usage records found for this session yet.".to_string();
            }
            let mut lines = vec![
                format!("Session usage ({session_key}) latest {}:", records.len()),
                aggregate_line("Summary", &aggregate(&records)),
            ];
            lines.extend(records.iter().map(|r| {
                format!(
                    "- {} provider={} model={} known={} total={} reason={}",
                    r.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
                    r.provider,
                    r.model,
                    r.usage_known,
                    tokens(r.total_tokens),
                    r.reason
                )
            }));
            lines.join("\n")
        }
        UsageView::Today => {
            let records = ledger.query(&today_filter);
            if records.is_empty() {
                return format!("No usage records for today ({day}) yet.");
            }
            let mut lines = vec![
                format!("Today usage ({day}):"),
                aggregate_line("Summary", &aggregate(&records)),
                "By provider:".to_string(),
            ];
            for (provider, agg) in provider_breakdown(&records) {
                lines.push(format!("  {}", aggregate_line(&provider, &agg)));
            }
            lines.join("\n")
        }
        UsageView::Providers => {
            let today = ledger.query(&today_filter);
            let session = ledger.query(&session_filter);
            if today.is_empty() && session.is_empty() {
                return "No usage records found yet.".to_string();
            }
            let mut lines = vec![format!(
                "Provider usage (today {day} + session {session_key}):"
            )];
            for (label, records) in [("Today", &today), ("Session", &session)] {
                lines.push(format!("{label} by provider:"));
                let breakdown = provider_breakdown(records);
                if breakdown.is_empty() {
                    lines.push("  none".to_string());
                }
                for (provider, agg) in breakdown {
                    lines.push(format!("  {}", aggregate_line(&provider, &agg)));
                }
            }
            lines.join("\n")
        }
        UsageView::Dashboard => {
            let today = ledger.query(&today_filter);
            let session = ledger.query(&session_filter);
            let last = match ledger.last_by_session(session_key) {
                Some(last) => format!(
                    "Last call: {} ({}) {} in / {} out",
                    last.model,
                    last.provider,
                    human_tokens(last.prompt_tokens),
                    human_tokens(last.completion_tokens)
                ),
                None => "Last call: none".to_string(),
            };
            let mut lines = vec![
                format!("Usage {day} for {session_key}"),
                last,
                aggregate_line("This session", &aggregate(&session)),
                aggregate_line("Today", &aggregate(&today)),
            ];
            for (provider, agg) in provider_breakdown(&today) {
                lines.push(format!("  {}", aggregate_line(&provider, &agg)));
            }
            lines.push("/usage last | session | today | providers".to_string());
            lines.join("\n")
        }
    }
}

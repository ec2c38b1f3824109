//! Per-call token accounting.
//!
//! Every backend call (turn iterations, probes, planner and summary calls)
//! lands here as one [`UsageRecord`]. The ledger keeps a rolling window on disk
//! and answers the `/usage` views.

use crate::failover::state::write_atomic;
use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use yard_llm::{Usage, infer_provider};

const USAGE_STATE_VERSION: u32 = 1;
const USAGE_RETENTION_DAYS: i64 = 30;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub timestamp: DateTime<Utc>,
    pub day_key: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub session_key: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub channel: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub chat_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub correlation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration: Option<usize>,
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
    pub usage_known: bool,
    #[serde(default)]
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

impl UsageRecord {
    /// A record for one call against `model`. `usage == None` marks the counts unknown.
    pub fn for_call(model: &str, usage: Option<&Usage>, reason: impl Into<String>) -> Self {
        let now = Utc::now();
        let (prompt, completion, total) = usage
            .map(|u| {
                let prompt = u64::from(u.prompt_tokens);
                let completion = u64::from(u.completion_tokens);
                (prompt, completion, u64::from(u.total()))
            })
            .unwrap_or_default();
        Self {
            timestamp: now,
            day_key: day_key(now),
            provider: infer_provider(model),
            model: model.to_string(),
            prompt_tokens: prompt,
            completion_tokens: completion,
            total_tokens: total,
            usage_known: usage.is_some(),
            reason: reason.into(),
            ..Self::default()
        }
    }
}

/// Calendar day in local time, `YYYY-MM-DD`.
pub fn day_key(at: DateTime<Utc>) -> String {
    at.with_timezone(&Local).format("%Y-%m-%d").to_string()
}

pub fn today_key() -> String {
    day_key(Utc::now())
}

/// Where call accounting goes. Failures are the caller's to log; they never
/// abort the call being accounted.
pub trait UsageSink: Send + Sync {
    fn record(&self, record: UsageRecord) -> anyhow::Result<()>;
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct UsageAggregate {
    pub calls: u64,
    pub known_calls: u64,
    pub unknown_calls: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl UsageAggregate {
    fn add(&mut self, record: &UsageRecord) {
        self.calls += 1;
        if record.usage_known {
            self.known_calls += 1;
            self.prompt_tokens += record.prompt_tokens;
            self.completion_tokens += record.completion_tokens;
            self.total_tokens += record.total_tokens;
        } else {
            self.unknown_calls += 1;
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct UsageFilter {
    pub session_key: Option<String>,
    pub day_key: Option<String>,
    pub provider: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
struct UsageState {
    version: u32,
    #[serde(default)]
    records: Vec<UsageRecord>,
    /// Bumped on every append; orders snapshots that are written out of band.
    #[serde(skip)]
    seq: u64,
}

impl Default for UsageState {
    fn default() -> Self {
        Self {
            version: USAGE_STATE_VERSION,
            records: Vec::new(),
            seq: 0,
        }
    }
}

/// JSON-file ledger with a 30 day retention window.
///
/// Queries read the in-memory state, so a record is visible as soon as it is
/// appended even when the file write runs on the blocking pool.
pub struct UsageLedger {
    path: PathBuf,
    state: Mutex<UsageState>,
    written_seq: Arc<Mutex<u64>>,
}

impl UsageLedger {
    /// Opens the ledger at `path`. A corrupt file is logged and replaced on the next write.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let state = match std::fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str::<UsageState>(&raw).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), error = %e, "usage ledger unreadable; starting empty");
                UsageState::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => UsageState::default(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "usage ledger read failed; starting empty");
                UsageState::default()
            }
        };
        Self {
            path,
            state: Mutex::new(state),
            written_seq: Arc::new(Mutex::new(0)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends and writes the file before returning.
    pub fn append(&self, record: UsageRecord) -> anyhow::Result<()> {
        let (seq, raw) = self.stage(record)?;
        persist_snapshot(&self.path, &self.written_seq, seq, &raw)
    }

    /// Applies `record` in memory and returns the serialized snapshot to write.
    fn stage(&self, record: UsageRecord) -> anyhow::Result<(u64, Vec<u8>)> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.records.push(record);
        let cutoff = Utc::now() - chrono::Duration::days(USAGE_RETENTION_DAYS);
        state.records.retain(|r| r.timestamp >= cutoff);
        state.version = USAGE_STATE_VERSION;
        state.seq += 1;
        let raw = serde_json::to_vec_pretty(&*state)?;
        Ok((state.seq, raw))
    }

    pub fn last_by_session(&self, session_key: &str) -> Option<UsageRecord> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state
            .records
            .iter()
            .rev()
            .find(|r| r.session_key == session_key)
            .cloned()
    }

    /// Matching records, newest first.
    pub fn query(&self, filter: &UsageFilter) -> Vec<UsageRecord> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let mut matched: Vec<UsageRecord> = state
            .records
            .iter()
            .filter(|r| {
                filter.session_key.as_ref().is_none_or(|k| r.session_key == *k)
                    && filter.day_key.as_ref().is_none_or(|d| r.day_key == *d)
                    && filter.provider.as_ref().is_none_or(|p| r.provider == *p)
            })
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        if let Some(limit) = filter.limit.filter(|l| *l > 0) {
            matched.truncate(limit);
        }
        matched
    }
}

/// Writes `raw` unless a newer snapshot is already on disk.
fn persist_snapshot(
    path: &Path,
    written_seq: &Mutex<u64>,
    seq: u64,
    raw: &[u8],
) -> anyhow::Result<()> {
    let mut written = written_seq.lock().unwrap_or_else(PoisonError::into_inner);
    if seq <= *written {
        return Ok(());
    }
    write_atomic(path, raw)?;
    *written = seq;
    Ok(())
}

/// Inside a runtime the file write moves to the blocking pool; write errors
/// are logged there.
impl UsageSink for UsageLedger {
    fn record(&self, record: UsageRecord) -> anyhow::Result<()> {
        let (seq, raw) = self.stage(record)?;
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return persist_snapshot(&self.path, &self.written_seq, seq, &raw);
        };
        let path = self.path.clone();
        let written_seq = self.written_seq.clone();
        handle.spawn_blocking(move || {
            if let Err(e) = persist_snapshot(&path, &written_seq, seq, &raw) {
                tracing::warn!(path = %path.display(), error = %e, "usage ledger write failed");
            }
        });
        Ok(())
    }
}

pub fn aggregate(records: &[UsageRecord]) -> UsageAggregate {
    let mut out = UsageAggregate::default();
    for record in records {
        out.add(record);
    }
    out
}

pub fn provider_breakdown(records: &[UsageRecord]) -> BTreeMap<String, UsageAggregate> {
    let mut out: BTreeMap<String, UsageAggregate> = BTreeMap::new();
    for record in records {
        let provider = if record.provider.trim().is_empty() {
            "unknown".to_string()
        } else {
            record.provider.clone()
        };
        out.entry(provider).or_default().add(record);
    }
    out
}

/// `1234` -> `1.2K`, `2000000` -> `2M`.
pub fn human_tokens(n: u64) -> String {
    fn scaled(value: f64, suffix: &str) -> String {
        let s = format!("{value:.1}");
        format!("{}{suffix}", s.strip_suffix(".0").unwrap_or(&s))
    }
    if n >= 1_000_000 {
        scaled(n as f64 / 1_000_000.0, "M")
    } else if n >= 1_000 {
        scaled(n as f64 / 1_000.0, "K")
    } else {
        n.to_string()
    }
}

/// `1234567` -> `1,234,567`.
pub fn grouped_int(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(session: &str, provider: &str, known: bool, total: u64) -> UsageRecord {
        UsageRecord {
            timestamp: Utc::now(),
            day_key: today_key(),
            session_key: session.to_string(),
            provider: provider.to_string(),
            model: "m".to_string(),
            prompt_tokens: total / 2,
            completion_tokens: total - total / 2,
            total_tokens: total,
            usage_known: known,
            reason: "normal_call".to_string(),
            ..UsageRecord::default()
        }
    }

    #[test]
    fn for_call_fills_total_and_provider() {
        let usage = Usage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: None,
        };
        let r = UsageRecord::for_call("claude-sonnet-4-5", Some(&usage), "normal_call");
        assert_eq!(r.total_tokens, 15);
        assert!(r.usage_known);
        assert_eq!(r.provider, "anthropic");

        let r = UsageRecord::for_call("gpt-4o", None, "probe");
        assert!(!r.usage_known);
        assert_eq!(r.total_tokens, 0);
        assert_eq!(r.reason, "probe");
    }

    #[test]
    fn ledger_persists_and_queries_newest_first() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("state").join("usage.json");
        let ledger = UsageLedger::open(&path);

        let mut first = record("telegram:1", "openai", true, 100);
        first.timestamp -= chrono::Duration::minutes(5);
        ledger.append(first).unwrap();
        ledger.append(record("telegram:1", "anthropic", true, 40)).unwrap();
        ledger.append(record("webchat:x", "openai", false, 0)).unwrap();

        let reopened = UsageLedger::open(&path);
        let all = reopened.query(&UsageFilter::default());
        assert_eq!(all.len(), 3);
        assert!(all[0].timestamp >= all[1].timestamp);

        let session = reopened.query(&UsageFilter {
            session_key: Some("telegram:1".to_string()),
            limit: Some(1),
            ..UsageFilter::default()
        });
        assert_eq!(session.len(), 1);
        assert_eq!(session[0].provider, "anthropic");
        assert_eq!(
            reopened.last_by_session("telegram:1").map(|r| r.total_tokens),
            Some(40)
        );
        assert!(reopened.last_by_session("nobody").is_none());
    }

    #[test]
    fn old_records_are_pruned_on_append() {
        let tmp = tempfile::tempdir().unwrap();
        let ledger = UsageLedger::open(tmp.path().join("usage.json"));
        let mut stale = record("s", "openai", true, 10);
        stale.timestamp -= chrono::Duration::days(31);
        ledger.append(stale).unwrap();
        ledger.append(record("s", "openai", true, 10)).unwrap();
        assert_eq!(ledger.query(&UsageFilter::default()).len(), 1);
    }

    #[test]
    fn stale_snapshot_never_overwrites_a_newer_one() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("usage.json");
        let ledger = UsageLedger::open(&path);
        let (first_seq, first) = ledger.stage(record("s", "openai", true, 10)).unwrap();
        let (second_seq, second) = ledger.stage(record("s", "openai", true, 20)).unwrap();
        assert!(second_seq > first_seq);

        persist_snapshot(&path, &ledger.written_seq, second_seq, &second).unwrap();
        persist_snapshot(&path, &ledger.written_seq, first_seq, &first).unwrap();
        assert_eq!(UsageLedger::open(&path).query(&UsageFilter::default()).len(), 2);
    }

    #[test]
    fn sink_outside_a_runtime_writes_inline() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("usage.json");
        let ledger = UsageLedger::open(&path);
        ledger.record(record("s", "openai", true, 10)).unwrap();
        assert_eq!(UsageLedger::open(&path).query(&UsageFilter::default()).len(), 1);
    }

    #[tokio::test]
    async fn sink_inside_a_runtime_is_visible_before_the_write_lands() {
        let tmp = tempfile::tempdir().unwrap();
        let ledger = UsageLedger::open(tmp.path().join("usage.json"));
        ledger.record(record("telegram:1", "openai", true, 10)).unwrap();
        assert_eq!(
            ledger.last_by_session("telegram:1").map(|r| r.total_tokens),
            Some(10)
        );
    }

    #[test]
    fn corrupt_ledger_starts_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("usage.json");
        std::fs::write(&path, "[[[").unwrap();
        let ledger = UsageLedger::open(&path);
        assert!(ledger.query(&UsageFilter::default()).is_empty());
    }

    #[test]
    fn aggregates_only_sum_known_usage() {
        let records = vec![
            record("s", "openai", true, 100),
            record("s", "", false, 0),
            record("s", "anthropic", true, 50),
        ];
        let agg = aggregate(&records);
        assert_eq!((agg.calls, agg.known_calls, agg.unknown_calls), (3, 2, 1));
        assert_eq!(agg.total_tokens, 150);

        let by_provider = provider_breakdown(&records);
        assert_eq!(by_provider["unknown"].unknown_calls, 1);
        assert_eq!(by_provider["openai"].total_tokens, 100);
    }

    #[test]
    fn token_formatting() {
        assert_eq!(human_tokens(999), "999");
        assert_eq!(human_tokens(1_000), "1K");
        assert_eq!(human_tokens(1_240), "1.2K");
        assert_eq!(human_tokens(2_000_000), "2M");
        assert_eq!(grouped_int(0), "0");
        assert_eq!(grouped_int(999), "999");
        assert_eq!(grouped_int(1_234_567), "1,234,567");
    }
}

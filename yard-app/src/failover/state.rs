use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteMode {
    Normal,
    Degraded,
    AwaitingSwitchback,
}

impl RouteMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Degraded => "degraded",
            Self::AwaitingSwitchback => "awaiting_switchback",
        }
    }
}

/// Process-wide routing state. `active_model == primary_model` exactly when
/// `fallback_index` is `None` and `mode` is `Normal`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteState {
    pub mode: RouteMode,
    pub primary_model: String,
    pub active_model: String,
    #[serde(default)]
    pub fallback_index: Option<usize>,
    #[serde(default)]
    pub degraded_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub hold_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub next_probe_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub consecutive_probe_successes: u32,
    #[serde(default)]
    pub switch_epoch: u64,
    #[serde(default)]
    pub last_switch_reason: Option<String>,
    #[serde(default)]
    pub last_switchback_prompt_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub switchback_prompt_sent: bool,
    #[serde(default)]
    pub last_probe_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl RouteState {
    pub fn on_primary(primary_model: &str, now: DateTime<Utc>) -> Self {
        Self {
            mode: RouteMode::Normal,
            primary_model: primary_model.to_string(),
            active_model: primary_model.to_string(),
            fallback_index: None,
            degraded_at: None,
            hold_until: None,
            next_probe_at: None,
            consecutive_probe_successes: 0,
            switch_epoch: 0,
            last_switch_reason: None,
            last_switchback_prompt_at: None,
            switchback_prompt_sent: false,
            last_probe_at: None,
            updated_at: now,
        }
    }

    pub fn is_on_primary(&self) -> bool {
        self.fallback_index.is_none() && self.active_model == self.primary_model
    }

    /// Back to the primary. Epoch is left to the caller.
    pub(crate) fn reset_to_primary(&mut self, now: DateTime<Utc>) {
        self.mode = RouteMode::Normal;
        self.active_model = self.primary_model.clone();
        self.fallback_index = None;
        self.degraded_at = None;
        self.hold_until = None;
        self.next_probe_at = None;
        self.consecutive_probe_successes = 0;
        self.switchback_prompt_sent = false;
        self.updated_at = now;
    }

    /// Whether a persisted state still fits the configured chain.
    pub(crate) fn matches_chain(&self, primary: &str, chain: &[String]) -> bool {
        if self.primary_model != primary {
            return false;
        }
        match self.fallback_index {
            None => self.active_model == primary && self.mode == RouteMode::Normal,
            Some(i) => chain.get(i).is_some_and(|m| *m == self.active_model)
                && self.mode != RouteMode::Normal,
        }
    }
}

/// JSON file holding the last [`RouteState`], replaced atomically.
#[derive(Debug, Clone)]
pub struct RouteStateStore {
    path: PathBuf,
}

impl RouteStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> anyhow::Result<Option<RouteState>> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("read {}", self.path.display()));
            }
        };
        let state = serde_json::from_str(&raw)
            .with_context(|| format!("parse {}", self.path.display()))?;
        Ok(Some(state))
    }

    pub fn save(&self, state: &RouteState) -> anyhow::Result<()> {
        let raw = serde_json::to_vec_pretty(state)?;
        write_atomic(&self.path, &raw)
    }
}

/// Write to `<path>.tmp` then rename over `path`. The temp file is removed if the
/// rename fails so no partial file is ever visible under `path`.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create {}", parent.display()))?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, bytes).with_context(|| format!("write {}", tmp.display()))?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e).with_context(|| format!("rename {} -> {}", tmp.display(), path.display()));
    }
    Ok(())
}

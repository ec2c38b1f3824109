//! Conversation history per session key (`<channel>:<chat>`).

use crate::failover::state::write_atomic;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::one::RefMut;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use yard_llm::ChatMessage;

/// What the turn loop needs from history storage.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn history(&self, session_key: &str) -> Result<Vec<ChatMessage>>;

    async fn append(&self, session_key: &str, messages: Vec<ChatMessage>) -> Result<()>;

    async fn summary(&self, session_key: &str) -> Result<Option<String>>;

    async fn set_summary(&self, session_key: &str, summary: Option<String>) -> Result<()>;

    /// Keeps only the last `keep_last` messages.
    async fn truncate(&self, session_key: &str, keep_last: usize) -> Result<()>;

    /// Drops history and summary.
    async fn reset(&self, session_key: &str) -> Result<()>;

    async fn save(&self, session_key: &str) -> Result<()>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub key: String,
    #[serde(default)]
    pub history: Vec<ChatMessage>,
    #[serde(default)]
    pub summary: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

impl Session {
    fn new(key: &str) -> Self {
        let now = Utc::now();
        Self {
            key: key.to_string(),
            history: Vec::new(),
            summary: None,
            created_at: now,
            last_active: now,
        }
    }

    fn touch(&mut self) {
        self.last_active = Utc::now();
    }
}

/// Sessions cached in memory, one JSON file each under `sessions/`.
pub struct FileSessionStore {
    dir: PathBuf,
    sessions: DashMap<String, Session>,
}

impl FileSessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            sessions: DashMap::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn cached_count(&self) -> usize {
        self.sessions.len()
    }

    fn path_for(&self, session_key: &str) -> PathBuf {
        let name: String = session_key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{name}.json"))
    }

    fn load(&self, session_key: &str) -> Result<Session> {
        let path = self.path_for(session_key);
        match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<Session>(&raw) {
                Ok(session) => Ok(session),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "session file unreadable; starting fresh");
                    Ok(Session::new(session_key))
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Session::new(session_key)),
            Err(e) => Err(e).with_context(|| format!("read {}", path.display())),
        }
    }

    fn session_mut(&self, session_key: &str) -> Result<RefMut<'_, String, Session>> {
        if let Some(session) = self.sessions.get_mut(session_key) {
            return Ok(session);
        }
        let loaded = self.load(session_key)?;
        Ok(self
            .sessions
            .entry(session_key.to_string())
            .or_insert(loaded))
    }
}

#[async_trait]
impl HistoryStore for FileSessionStore {
    async fn history(&self, session_key: &str) -> Result<Vec<ChatMessage>> {
        Ok(self.session_mut(session_key)?.history.clone())
    }

    async fn append(&self, session_key: &str, messages: Vec<ChatMessage>) -> Result<()> {
        let mut session = self.session_mut(session_key)?;
        session.history.extend(messages);
        session.touch();
        Ok(())
    }

    async fn summary(&self, session_key: &str) -> Result<Option<String>> {
        Ok(self.session_mut(session_key)?.summary.clone())
    }

    async fn set_summary(&self, session_key: &str, summary: Option<String>) -> Result<()> {
        let mut session = self.session_mut(session_key)?;
        session.summary = summary.filter(|s| !s.trim().is_empty());
        session.touch();
        Ok(())
    }

    async fn truncate(&self, session_key: &str, keep_last: usize) -> Result<()> {
        let mut session = self.session_mut(session_key)?;
        let len = session.history.len();
        if len > keep_last {
            session.history.drain(..len - keep_last);
        }
        Ok(())
    }

    async fn reset(&self, session_key: &str) -> Result<()> {
        {
            let mut session = self.session_mut(session_key)?;
            session.history.clear();
            session.summary = None;
            session.touch();
        }
        self.save(session_key).await
    }

    async fn save(&self, session_key: &str) -> Result<()> {
        let raw = {
            let session = self.session_mut(session_key)?;
            serde_json::to_vec_pretty(&*session)?
        };
        write_atomic(&self.path_for(session_key), &raw)
    }
}

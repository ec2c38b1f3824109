//! One cancellable turn per session.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    NothingToCancel,
}

/// Session key -> (turn id, token) for every turn in flight.
#[derive(Default)]
pub struct TurnRegistry {
    active: DashMap<String, (u64, CancellationToken)>,
    next_id: AtomicU64,
    released: Notify,
}

impl TurnRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a turn for `session_key`, or `None` when one is already running.
    pub fn begin(self: &Arc<Self>, session_key: &str) -> Option<TurnGuard> {
        let turn_id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let token = CancellationToken::new();
        match self.active.entry(session_key.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert((turn_id, token.clone()));
                Some(TurnGuard {
                    registry: self.clone(),
                    session_key: session_key.to_string(),
                    turn_id,
                    token,
                })
            }
        }
    }

    /// Like [`begin`](Self::begin), but when the running turn has already been
    /// cancelled, waits for it to release the slot instead of failing.
    pub async fn acquire(self: &Arc<Self>, session_key: &str) -> Option<TurnGuard> {
        loop {
            let released = self.released.notified();
            if let Some(guard) = self.begin(session_key) {
                return Some(guard);
            }
            if !self.is_cancelling(session_key) {
                return None;
            }
            released.await;
        }
    }

    pub fn cancel(&self, session_key: &str) -> CancelOutcome {
        match self.active.get(session_key) {
            Some(entry) => {
                entry.value().1.cancel();
                CancelOutcome::Cancelled
            }
            None => CancelOutcome::NothingToCancel,
        }
    }

    /// True when a turn holds the slot but its token has been tripped.
    pub fn is_cancelling(&self, session_key: &str) -> bool {
        self.active
            .get(session_key)
            .is_some_and(|entry| entry.value().1.is_cancelled())
    }

    pub fn is_active(&self, session_key: &str) -> bool {
        self.active.contains_key(session_key)
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}

/// Holds a session's slot; dropping it frees the slot.
pub struct TurnGuard {
    registry: Arc<TurnRegistry>,
    session_key: String,
    turn_id: u64,
    token: CancellationToken,
}

impl TurnGuard {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn session_key(&self) -> &str {
        &self.session_key
    }
}

impl Drop for TurnGuard {
    fn drop(&mut self) {
        self.registry
            .active
            .remove_if(&self.session_key, |_, (id, _)| *id == self.turn_id);
        self.registry.released.notify_waiters();
    }
}

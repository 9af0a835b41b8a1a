//! Per-user conversation state store with TTL-based expiry.
//!
//! The store is the only shared mutable resource in the task core. `take` is
//! the atomic read-and-delete used by cancel and cleanup so that two racing
//! cleanup paths can never both claim the same state's blob handles.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

use crate::dialogue::{TaskState, UserId};

/// Keyed conversation-state storage. Implementations must tolerate `get`
/// racing with a concurrent `take` (the loser simply observes absence).
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, user: UserId) -> Option<TaskState>;

    /// Insert or replace the user's state, refreshing its TTL.
    async fn set(&self, user: UserId, state: TaskState);

    /// Atomically remove and return the user's state.
    async fn take(&self, user: UserId) -> Option<TaskState>;
}

struct Entry {
    state: TaskState,
    expires_at: DateTime<Utc>,
}

/// In-process implementation backed by a mutex-guarded map. Expired entries
/// are dropped lazily on access and eagerly by [`spawn_sweeper`].
///
/// [`spawn_sweeper`]: InMemoryStateStore::spawn_sweeper
pub struct InMemoryStateStore {
    ttl: ChronoDuration,
    entries: Mutex<HashMap<UserId, Entry>>,
}

impl InMemoryStateStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl: ChronoDuration::from_std(ttl).unwrap_or_else(|_| ChronoDuration::seconds(3600)),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Periodically drop expired entries so abandoned conversations do not
    /// accumulate between accesses.
    pub fn spawn_sweeper(self: Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        let store = self;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(every);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                let now = Utc::now();
                let mut entries = store.entries.lock().await;
                let before = entries.len();
                entries.retain(|_, entry| entry.expires_at > now);
                let dropped = before - entries.len();
                if dropped > 0 {
                    debug!(dropped, "swept expired conversation state");
                }
            }
        })
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn get(&self, user: UserId) -> Option<TaskState> {
        let mut entries = self.entries.lock().await;
        match entries.get(&user) {
            Some(entry) if entry.expires_at > Utc::now() => Some(entry.state.clone()),
            Some(_) => {
                entries.remove(&user);
                None
            }
            None => None,
        }
    }

    async fn set(&self, user: UserId, state: TaskState) {
        let entry = Entry {
            state,
            expires_at: Utc::now() + self.ttl,
        };
        self.entries.lock().await.insert(user, entry);
    }

    async fn take(&self, user: UserId) -> Option<TaskState> {
        let mut entries = self.entries.lock().await;
        let entry = entries.remove(&user)?;
        if entry.expires_at > Utc::now() {
            Some(entry.state)
        } else {
            None
        }
    }
}

use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::state::{ImportState, StateStore};
use crate::waiter::{CounterStore, WaiterKey};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;

#[derive(Debug, Clone)]
struct CounterEntry {
    remaining: u64,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct StateEntry {
    state: ImportState,
    expires_at: DateTime<Utc>,
}

/// In-process store
///
/// Decrements take the DashMap shard lock for the key, so they are atomic
/// with respect to each other. Cloning shares the underlying maps.
#[derive(Clone)]
pub struct MemoryStore {
    counters: Arc<DashMap<WaiterKey, CounterEntry>>,
    states: Arc<DashMap<String, StateEntry>>,
    waiter_ttl: Duration,
    state_ttl: Duration,
}

impl MemoryStore {
    pub fn new(waiter_ttl: Duration, state_ttl: Duration) -> Self {
        Self {
            counters: Arc::new(DashMap::new()),
            states: Arc::new(DashMap::new()),
            waiter_ttl,
            state_ttl,
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(config.waiter_ttl(), config.state_ttl())
    }

    /// Number of counters currently held, expired ones included
    pub fn counter_count(&self) -> usize {
        self.counters.len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::from_config(&PipelineConfig::default())
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn create(&self, initial: u64) -> Result<WaiterKey> {
        let key = WaiterKey::generate();
        self.counters.insert(
            key.clone(),
            CounterEntry {
                remaining: initial,
                expires_at: Utc::now() + self.waiter_ttl,
            },
        );
        Ok(key)
    }

    async fn decrement(&self, key: &WaiterKey) -> Result<()> {
        let now = Utc::now();
        if let Some(mut entry) = self.counters.get_mut(key) {
            if entry.expires_at > now && entry.remaining > 0 {
                entry.remaining -= 1;
            }
        }
        Ok(())
    }

    async fn remaining(&self, key: &WaiterKey) -> Result<u64> {
        let now = Utc::now();
        Ok(self
            .counters
            .get(key)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.remaining)
            .unwrap_or(0))
    }

    async fn discard(&self, key: &WaiterKey) -> Result<()> {
        self.counters.remove(key);
        Ok(())
    }

    async fn purge_expired(&self) -> Result<usize> {
        let now = Utc::now();
        let before = self.counters.len();
        self.counters.retain(|_, entry| entry.expires_at > now);
        Ok(before.saturating_sub(self.counters.len()))
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn insert(&self, state: &ImportState) -> Result<()> {
        let now = Utc::now();
        let fresh = StateEntry {
            state: state.clone(),
            expires_at: now + self.state_ttl,
        };

        match self.states.entry(state.subject_id.clone()) {
            Entry::Occupied(mut occupied) => {
                let existing = occupied.get();
                if existing.expires_at > now && existing.state.alive {
                    return Err(PipelineError::AlreadyRunning(state.subject_id.clone()));
                }
                occupied.insert(fresh);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(fresh);
            }
        }
        Ok(())
    }

    async fn load(&self, subject_id: &str) -> Result<Option<ImportState>> {
        let now = Utc::now();
        Ok(self
            .states
            .get(subject_id)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.state.clone()))
    }

    async fn save(&self, state: &ImportState) -> Result<()> {
        self.states.insert(
            state.subject_id.clone(),
            StateEntry {
                state: state.clone(),
                expires_at: Utc::now() + self.state_ttl,
            },
        );
        Ok(())
    }

    async fn compare_and_save(&self, state: &mut ImportState) -> Result<bool> {
        let now = Utc::now();
        let Some(mut entry) = self.states.get_mut(&state.subject_id) else {
            return Ok(false);
        };
        if entry.expires_at <= now || entry.state.revision != state.revision {
            return Ok(false);
        }

        state.revision += 1;
        entry.state = state.clone();
        entry.expires_at = now + self.state_ttl;
        Ok(true)
    }

    async fn refresh_deadline(&self, subject_id: &str, deadline: DateTime<Utc>) -> Result<()> {
        let now = Utc::now();
        match self.states.get_mut(subject_id) {
            Some(mut entry) if entry.expires_at > now => {
                entry.state.liveness_deadline = deadline;
                entry.expires_at = now + self.state_ttl;
                Ok(())
            }
            _ => Err(PipelineError::ImportNotFound(subject_id.to_string())),
        }
    }

    async fn stalled(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let mut stalled: Vec<String> = self
            .states
            .iter()
            .filter(|entry| entry.expires_at > now && entry.state.is_stalled(now))
            .map(|entry| entry.key().clone())
            .collect();
        stalled.sort();
        Ok(stalled)
    }

    async fn remove(&self, subject_id: &str) -> Result<()> {
        self.states.remove(subject_id);
        Ok(())
    }

    async fn purge_expired(&self) -> Result<usize> {
        let now = Utc::now();
        let before = self.states.len();
        self.states.retain(|_, entry| entry.expires_at > now);
        Ok(before.saturating_sub(self.states.len()))
    }
}

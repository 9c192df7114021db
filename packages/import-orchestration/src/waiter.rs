//! Synchronization counters ("waiters")
//!
//! A waiter counts the outstanding fan-out jobs of one phase importer. Jobs
//! decrement it when they finish; the advancement coordinator polls it. The
//! counter lives in a shared store so any worker process can touch it.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Opaque, unique waiter identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WaiterKey(String);

impl WaiterKey {
    pub fn generate() -> Self {
        Self(format!("import:waiter:{}", Uuid::new_v4()))
    }

    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WaiterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle returned by an importer that dispatched work it has not finished
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaiterHandle {
    pub key: WaiterKey,
    /// Snapshot at return time; only a hint for the coordinator
    pub jobs_remaining: u64,
}

/// `{key -> jobs_remaining}` collected by a stage handler
pub type WaiterMap = BTreeMap<WaiterKey, u64>;

/// Shared atomic counter store
///
/// Implementations must make `decrement` atomic under any number of
/// concurrent callers, never let a count go below zero, and treat missing or
/// expired keys as satisfied.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Allocate a counter starting at `initial`. Zero is immediately satisfied.
    async fn create(&self, initial: u64) -> Result<WaiterKey>;

    /// Decrement by one. Unknown keys and counters already at zero are left alone.
    async fn decrement(&self, key: &WaiterKey) -> Result<()>;

    /// Current count; unknown or expired keys read as 0.
    async fn remaining(&self, key: &WaiterKey) -> Result<u64>;

    /// Drop a consumed counter.
    async fn discard(&self, key: &WaiterKey) -> Result<()>;

    /// Remove expired counters, returning how many were dropped.
    async fn purge_expired(&self) -> Result<usize>;
}

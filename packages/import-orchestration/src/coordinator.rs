//! Advancement coordinator (fan-in barrier)
//!
//! One `check` is one poll. The coordinator never sleeps: the caller
//! re-enqueues the poll with the returned delay, so a waiting run holds no
//! worker between checks.

use crate::config::AdvanceConfig;
use crate::error::Result;
use crate::queue::AdvanceTask;
use crate::waiter::{CounterStore, WaiterMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub enum AdvanceDecision {
    /// Dispatch the next stage. `pending` lists counters that were still
    /// non-zero when the wait budget ran out; empty unless `timed_out`.
    Proceed { timed_out: bool, pending: WaiterMap },
    /// Re-check after `delay`, carrying only the unsatisfied keys
    Wait { pending: WaiterMap, delay: Duration },
}

pub struct AdvancementCoordinator {
    counters: Arc<dyn CounterStore>,
    config: AdvanceConfig,
}

impl AdvancementCoordinator {
    pub fn new(counters: Arc<dyn CounterStore>, config: AdvanceConfig) -> Self {
        Self { counters, config }
    }

    pub fn config(&self) -> &AdvanceConfig {
        &self.config
    }

    pub async fn check(&self, task: &AdvanceTask) -> Result<AdvanceDecision> {
        let mut pending = WaiterMap::new();

        // The hint in the map may be stale; the store is authoritative.
        for key in task.waiters.keys() {
            let remaining = self.counters.remaining(key).await?;
            if remaining == 0 {
                self.counters.discard(key).await?;
            } else {
                pending.insert(key.clone(), remaining);
            }
        }

        if pending.is_empty() {
            return Ok(AdvanceDecision::Proceed {
                timed_out: false,
                pending,
            });
        }

        let checks = task.unsatisfied_checks + 1;
        debug!(
            "Import {}: {} waiter(s) pending before {} (check {}/{})",
            task.subject_id,
            pending.len(),
            task.next_stage,
            checks,
            self.config.max_unsatisfied_checks
        );

        if checks >= self.config.max_unsatisfied_checks {
            return Ok(AdvanceDecision::Proceed {
                timed_out: true,
                pending,
            });
        }

        Ok(AdvanceDecision::Wait {
            pending,
            delay: self.config.delay_for(checks),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::Stage;
    use crate::store::MemoryStore;
    use crate::waiter::WaiterKey;

    fn coordinator(store: &MemoryStore, max_checks: u32) -> AdvancementCoordinator {
        AdvancementCoordinator::new(
            Arc::new(store.clone()),
            AdvanceConfig {
                poll_interval_ms: 10,
                max_poll_interval_ms: 40,
                max_unsatisfied_checks: max_checks,
            },
        )
    }

    fn task(waiters: WaiterMap, unsatisfied_checks: u32) -> AdvanceTask {
        AdvanceTask {
            subject_id: "project-1".to_string(),
            from_stage: Stage::PullRequests,
            next_stage: Stage::Collaborators,
            waiters,
            unsatisfied_checks,
        }
    }

    #[tokio::test]
    async fn test_empty_waiter_set_proceeds_on_first_check() {
        let store = MemoryStore::default();
        let decision = coordinator(&store, 3)
            .check(&task(WaiterMap::new(), 0))
            .await
            .unwrap();

        assert_eq!(
            decision,
            AdvanceDecision::Proceed {
                timed_out: false,
                pending: WaiterMap::new()
            }
        );
    }

    #[tokio::test]
    async fn test_stale_hint_is_ignored() {
        let store = MemoryStore::default();
        let key = store.create(1).await.unwrap();
        store.decrement(&key).await.unwrap();

        // Hint still says 1, store says 0
        let mut waiters = WaiterMap::new();
        waiters.insert(key.clone(), 1);
        let decision = coordinator(&store, 3).check(&task(waiters, 0)).await.unwrap();

        assert!(matches!(
            decision,
            AdvanceDecision::Proceed {
                timed_out: false,
                ..
            }
        ));
        assert_eq!(store.counter_count(), 0);
    }

    #[tokio::test]
    async fn test_prunes_satisfied_keys() {
        let store = MemoryStore::default();
        let done = store.create(0).await.unwrap();
        let busy = store.create(4).await.unwrap();

        let mut waiters = WaiterMap::new();
        waiters.insert(done.clone(), 0);
        waiters.insert(busy.clone(), 4);
        let decision = coordinator(&store, 3).check(&task(waiters, 0)).await.unwrap();

        match decision {
            AdvanceDecision::Wait { pending, delay } => {
                assert_eq!(pending.len(), 1);
                assert_eq!(pending.get(&busy), Some(&4));
                assert_eq!(delay, Duration::from_millis(10));
            }
            other => panic!("Expected Wait, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_counter_reads_as_satisfied() {
        let store = MemoryStore::default();
        let mut waiters = WaiterMap::new();
        waiters.insert(WaiterKey::new("import:waiter:expired"), 9);

        let decision = coordinator(&store, 3).check(&task(waiters, 0)).await.unwrap();
        assert!(matches!(
            decision,
            AdvanceDecision::Proceed {
                timed_out: false,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_budget_exhausted_after_max_unsatisfied_checks() {
        let store = MemoryStore::default();
        let stuck = store.create(1).await.unwrap();
        let coordinator = coordinator(&store, 3);

        let mut current = task([(stuck.clone(), 1)].into_iter().collect(), 0);
        let mut waits = Vec::new();
        loop {
            match coordinator.check(&current).await.unwrap() {
                AdvanceDecision::Wait { pending, delay } => {
                    waits.push(delay);
                    current.waiters = pending;
                    current.unsatisfied_checks += 1;
                }
                AdvanceDecision::Proceed { timed_out, pending } => {
                    assert!(timed_out);
                    assert_eq!(pending.get(&stuck), Some(&1));
                    break;
                }
            }
        }

        // Checks 1 and 2 wait, check 3 gives up
        assert_eq!(
            waits,
            vec![Duration::from_millis(10), Duration::from_millis(20)]
        );
        assert_eq!(current.unsatisfied_checks, 2);
    }
}

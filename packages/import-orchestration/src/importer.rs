//! Phase importer contract
//!
//! Importers are supplied by the embedding application. The pipeline only
//! calls `execute` and treats the call as finished once it returns; work an
//! importer fans out is tracked through the waiter it hands back.

use crate::context::RunContext;
use crate::error::{ImportError, Result};
use crate::queue::{JobFn, JobTask, Task, TaskQueue};
use crate::stage::Stage;
use crate::state::StateStore;
use crate::waiter::{CounterStore, WaiterHandle, WaiterKey};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Result of one importer call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportOutcome {
    /// All work completed inside the call
    Done,
    /// Work was dispatched and is still running
    Waiting(WaiterHandle),
}

#[async_trait]
pub trait PhaseImporter: Send + Sync {
    /// Importer name, used in failure records and logs
    fn name(&self) -> &str;

    async fn execute(
        &self,
        ctx: &ImporterContext,
    ) -> std::result::Result<ImportOutcome, ImportError>;
}

/// What an importer sees of the run
#[derive(Clone)]
pub struct ImporterContext {
    pub run: RunContext,
    pub stage: Stage,
    pub fan_out: FanOut,
    pub heartbeat: Heartbeat,
}

impl ImporterContext {
    pub fn subject_id(&self) -> &str {
        &self.run.subject_id
    }
}

/// Importers registered per stage, in registration order
#[derive(Clone, Default)]
pub struct ImporterRegistry {
    importers: HashMap<Stage, Vec<Arc<dyn PhaseImporter>>>,
}

impl ImporterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, stage: Stage, importer: Arc<dyn PhaseImporter>) {
        self.importers.entry(stage).or_default().push(importer);
    }

    pub fn for_stage(&self, stage: Stage) -> &[Arc<dyn PhaseImporter>] {
        self.importers
            .get(&stage)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.importers.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Fan-out helper handed to importers
#[derive(Clone)]
pub struct FanOut {
    counters: Arc<dyn CounterStore>,
    queue: TaskQueue,
    subject_id: String,
    stage: Stage,
}

impl FanOut {
    pub fn new(
        counters: Arc<dyn CounterStore>,
        queue: TaskQueue,
        subject_id: impl Into<String>,
        stage: Stage,
    ) -> Self {
        Self {
            counters,
            queue,
            subject_id: subject_id.into(),
            stage,
        }
    }

    /// Enqueue `jobs` on the shared queue behind a fresh counter sized to
    /// them. Each job decrements the counter once, when it finally completes.
    pub async fn spawn(&self, jobs: Vec<JobFn>) -> Result<WaiterHandle> {
        let total = jobs.len() as u64;
        let key = self.counters.create(total).await?;

        for run in jobs {
            let task = Task::Job(JobTask {
                subject_id: self.subject_id.clone(),
                stage: self.stage,
                waiter: key.clone(),
                attempt: 1,
                run,
            });
            if let Err(e) = self.queue.enqueue(task) {
                // Never ran, so nobody else will signal it
                warn!("Import {}: job not enqueued: {}", self.subject_id, e);
                self.counters.decrement(&key).await?;
            }
        }

        debug!(
            "Import {}: {} spawned {} jobs under {}",
            self.subject_id, self.stage, total, key
        );
        Ok(WaiterHandle {
            key,
            jobs_remaining: total,
        })
    }

    /// Counter for work dispatched outside the shared queue; signal each
    /// completion with `notify`.
    pub async fn waiter(&self, jobs: u64) -> Result<WaiterHandle> {
        let key = self.counters.create(jobs).await?;
        Ok(WaiterHandle {
            key,
            jobs_remaining: jobs,
        })
    }

    pub async fn notify(&self, key: &WaiterKey) -> Result<()> {
        self.counters.decrement(key).await
    }
}

/// Liveness heartbeat for long-running importers
#[derive(Clone)]
pub struct Heartbeat {
    states: Arc<dyn StateStore>,
    subject_id: String,
    timeout: Duration,
}

impl Heartbeat {
    pub fn new(
        states: Arc<dyn StateStore>,
        subject_id: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            states,
            subject_id: subject_id.into(),
            timeout,
        }
    }

    pub async fn beat(&self) -> Result<()> {
        self.states
            .refresh_deadline(&self.subject_id, Utc::now() + self.timeout)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::TaskReceiver;
    use crate::state::ImportState;
    use crate::store::MemoryStore;
    use futures::FutureExt;

    struct Labels;

    #[async_trait]
    impl PhaseImporter for Labels {
        fn name(&self) -> &str {
            "labels"
        }

        async fn execute(
            &self,
            _ctx: &ImporterContext,
        ) -> std::result::Result<ImportOutcome, ImportError> {
            Ok(ImportOutcome::Done)
        }
    }

    fn fan_out() -> (MemoryStore, FanOut, TaskReceiver) {
        let store = MemoryStore::default();
        let (queue, rx) = TaskQueue::new();
        let fan_out = FanOut::new(Arc::new(store.clone()), queue, "project-1", Stage::Notes);
        (store, fan_out, rx)
    }

    fn noop_job() -> JobFn {
        Arc::new(|| async { Ok::<(), ImportError>(()) }.boxed())
    }

    #[test]
    fn test_registry_keeps_registration_order() {
        let mut registry = ImporterRegistry::new();
        registry.register(Stage::BaseData, Arc::new(Labels));
        registry.register(Stage::BaseData, Arc::new(Labels));

        assert_eq!(registry.for_stage(Stage::BaseData).len(), 2);
        assert!(registry.for_stage(Stage::Notes).is_empty());
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn test_spawn_sizes_counter_and_enqueues_jobs() {
        let (store, fan_out, mut rx) = fan_out();

        let handle = fan_out
            .spawn(vec![noop_job(), noop_job(), noop_job()])
            .await
            .unwrap();

        assert_eq!(handle.jobs_remaining, 3);
        assert_eq!(store.remaining(&handle.key).await.unwrap(), 3);
        for _ in 0..3 {
            match rx.try_recv() {
                Some(Task::Job(job)) => {
                    assert_eq!(job.attempt, 1);
                    assert_eq!(job.waiter, handle.key);
                }
                other => panic!("Expected job task, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_spawn_with_closed_queue_releases_counter() {
        let (store, fan_out, rx) = fan_out();
        drop(rx);

        let handle = fan_out.spawn(vec![noop_job(), noop_job()]).await.unwrap();

        assert_eq!(store.remaining(&handle.key).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_spawn_nothing_is_immediately_satisfied() {
        let (store, fan_out, _rx) = fan_out();
        let handle = fan_out.spawn(Vec::new()).await.unwrap();
        assert_eq!(store.remaining(&handle.key).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_manual_waiter_and_notify() {
        let (store, fan_out, _rx) = fan_out();
        let handle = fan_out.waiter(2).await.unwrap();

        fan_out.notify(&handle.key).await.unwrap();
        assert_eq!(store.remaining(&handle.key).await.unwrap(), 1);
        fan_out.notify(&handle.key).await.unwrap();
        fan_out.notify(&handle.key).await.unwrap();
        assert_eq!(store.remaining(&handle.key).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_heartbeat_pushes_deadline() {
        let store = Arc::new(MemoryStore::default());
        let state = ImportState::new(RunContext::new("project-1"), Duration::seconds(1));
        let before = state.liveness_deadline;
        store.insert(&state).await.unwrap();

        Heartbeat::new(store.clone(), "project-1", Duration::hours(1))
            .beat()
            .await
            .unwrap();

        let loaded = store.load("project-1").await.unwrap().unwrap();
        assert!(loaded.liveness_deadline > before);
    }
}

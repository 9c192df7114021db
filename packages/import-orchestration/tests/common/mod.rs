//! Shared helpers for the pipeline integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use futures::FutureExt;
use import_orchestration::{
    AdvanceConfig, ImportError, ImportOutcome, ImportState, ImporterContext, JobFn, MemoryStore,
    PhaseImporter, Pipeline, PipelineConfig, Stage, StateStore,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Small intervals so whole runs finish in milliseconds
pub fn fast_config(max_unsatisfied_checks: u32) -> PipelineConfig {
    PipelineConfig {
        workers: 4,
        advance: AdvanceConfig {
            poll_interval_ms: 5,
            max_poll_interval_ms: 20,
            max_unsatisfied_checks,
        },
        job_retry_delay_ms: 2,
        ..Default::default()
    }
}

/// Poll until the run is no longer alive
pub async fn wait_until_settled(pipeline: &Pipeline, subject_id: &str) {
    for _ in 0..1_000 {
        if !pipeline.import_status(subject_id).await.unwrap().alive {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("import {} did not settle", subject_id);
}

/// Poll the store until `check` holds for the persisted state
pub async fn wait_for_state<F>(store: &MemoryStore, subject_id: &str, check: F) -> ImportState
where
    F: Fn(&ImportState) -> bool,
{
    for _ in 0..1_000 {
        if let Some(state) = store.load(subject_id).await.unwrap() {
            if check(&state) {
                return state;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("state of {} never matched", subject_id);
}

/// Push the stored heartbeat into the past, as if the owning worker died
pub async fn mark_stalled(store: &MemoryStore, subject_id: &str) {
    let mut state = store.load(subject_id).await.unwrap().unwrap();
    state.liveness_deadline = chrono::Utc::now() - chrono::Duration::seconds(1);
    store.save(&state).await.unwrap();
}

/// Completes synchronously and counts its calls
#[derive(Default)]
pub struct Quick {
    pub calls: AtomicUsize,
}

#[async_trait]
impl PhaseImporter for Quick {
    fn name(&self) -> &str {
        "quick"
    }

    async fn execute(&self, _ctx: &ImporterContext) -> Result<ImportOutcome, ImportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ImportOutcome::Done)
    }
}

/// Sleeps inside the call, keeping its stage running for a while
pub struct Slow {
    pub delay: Duration,
    pub calls: AtomicUsize,
}

impl Slow {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl PhaseImporter for Slow {
    fn name(&self) -> &str {
        "slow"
    }

    async fn execute(&self, _ctx: &ImporterContext) -> Result<ImportOutcome, ImportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(ImportOutcome::Done)
    }
}

/// Fans out `jobs` queued jobs; each sleeps a little and bumps `completed`
pub struct Fanning {
    pub jobs: usize,
    pub completed: Arc<AtomicUsize>,
}

impl Fanning {
    pub fn new(jobs: usize) -> Self {
        Self {
            jobs,
            completed: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl PhaseImporter for Fanning {
    fn name(&self) -> &str {
        "fanning"
    }

    async fn execute(&self, ctx: &ImporterContext) -> Result<ImportOutcome, ImportError> {
        let jobs: Vec<JobFn> = (0..self.jobs)
            .map(|i| {
                let completed = self.completed.clone();
                let delay = Duration::from_millis(((i * 7) % 20) as u64 + 1);
                let job: JobFn = Arc::new(move || {
                    let completed = completed.clone();
                    async move {
                        tokio::time::sleep(delay).await;
                        completed.fetch_add(1, Ordering::SeqCst);
                        Ok::<(), ImportError>(())
                    }
                    .boxed()
                });
                job
            })
            .collect();

        Ok(ImportOutcome::Waiting(ctx.fan_out.spawn(jobs).await?))
    }
}

/// Records the value of a shared counter at the moment it runs
pub struct Observer {
    pub watched: Arc<AtomicUsize>,
    pub seen: Mutex<Option<usize>>,
}

impl Observer {
    pub fn new(watched: Arc<AtomicUsize>) -> Self {
        Self {
            watched,
            seen: Mutex::new(None),
        }
    }
}

#[async_trait]
impl PhaseImporter for Observer {
    fn name(&self) -> &str {
        "observer"
    }

    async fn execute(&self, _ctx: &ImporterContext) -> Result<ImportOutcome, ImportError> {
        *self.seen.lock() = Some(self.watched.load(Ordering::SeqCst));
        Ok(ImportOutcome::Done)
    }
}

/// Creates a counter that nothing ever decrements
#[derive(Default)]
pub struct Stuck {
    pub calls: AtomicUsize,
}

#[async_trait]
impl PhaseImporter for Stuck {
    fn name(&self) -> &str {
        "stuck"
    }

    async fn execute(&self, ctx: &ImporterContext) -> Result<ImportOutcome, ImportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ImportOutcome::Waiting(ctx.fan_out.waiter(1).await?))
    }
}

/// Always fails with the given error
pub struct Failing {
    pub make: fn() -> ImportError,
}

#[async_trait]
impl PhaseImporter for Failing {
    fn name(&self) -> &str {
        "failing"
    }

    async fn execute(&self, _ctx: &ImporterContext) -> Result<ImportOutcome, ImportError> {
        Err((self.make)())
    }
}

/// Stages the run entered, read from the persisted state
pub async fn visited(store: &MemoryStore, subject_id: &str) -> Vec<Stage> {
    store
        .load(subject_id)
        .await
        .unwrap()
        .map(|state| state.visited)
        .unwrap_or_default()
}

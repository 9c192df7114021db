//! Task queue and worker pool
//!
//! Every unit of work (running a stage, one coordinator poll, one fan-out
//! job) is a message on a shared queue. Delayed messages sit on a timer, not
//! on a worker, so waiting never occupies a worker.

use crate::error::{ImportError, PipelineError, Result};
use crate::stage::Stage;
use crate::waiter::{WaiterKey, WaiterMap};
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Pipeline control messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StageTask {
    Run { subject_id: String, stage: Stage },
    Advance(AdvanceTask),
}

/// One coordinator poll
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdvanceTask {
    pub subject_id: String,
    /// Stage whose fan-out is being waited on
    pub from_stage: Stage,
    pub next_stage: Stage,
    /// Keys still believed pending, with the last observed count as a hint
    pub waiters: WaiterMap,
    pub unsatisfied_checks: u32,
}

/// Re-invocable body of a fan-out job; called once per attempt
pub type JobFn =
    Arc<dyn Fn() -> BoxFuture<'static, std::result::Result<(), ImportError>> + Send + Sync>;

/// One fan-out job of a phase importer
#[derive(Clone)]
pub struct JobTask {
    pub subject_id: String,
    pub stage: Stage,
    pub waiter: WaiterKey,
    pub attempt: u32,
    pub run: JobFn,
}

impl std::fmt::Debug for JobTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobTask")
            .field("subject_id", &self.subject_id)
            .field("stage", &self.stage)
            .field("waiter", &self.waiter)
            .field("attempt", &self.attempt)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub enum Task {
    Stage(StageTask),
    Job(JobTask),
}

impl Task {
    fn label(&self) -> &'static str {
        match self {
            Task::Stage(StageTask::Run { .. }) => "run_stage",
            Task::Stage(StageTask::Advance(_)) => "advance",
            Task::Job(_) => "job",
        }
    }
}

/// Sending side of the queue; cheap to clone
#[derive(Clone)]
pub struct TaskQueue {
    tx: mpsc::UnboundedSender<Task>,
}

/// Receiving side, consumed by `WorkerPool::start`
pub struct TaskReceiver {
    rx: mpsc::UnboundedReceiver<Task>,
}

impl TaskReceiver {
    /// Pop without waiting; `None` when nothing is queued
    pub fn try_recv(&mut self) -> Option<Task> {
        self.rx.try_recv().ok()
    }
}

impl TaskQueue {
    pub fn new() -> (Self, TaskReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, TaskReceiver { rx })
    }

    pub fn enqueue(&self, task: Task) -> Result<()> {
        self.tx.send(task).map_err(|_| PipelineError::QueueClosed)
    }

    /// Deliver `task` after `delay` without holding a worker meanwhile
    pub fn enqueue_in(&self, delay: Duration, task: Task) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = tx.send(task) {
                warn!("Dropping delayed {} task: queue closed", e.0.label());
            }
        });
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Whatever processes dequeued tasks
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, task: Task);
}

/// Fixed set of workers sharing one receiver
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    shutdown: CancellationToken,
}

impl WorkerPool {
    pub fn start(receiver: TaskReceiver, executor: Arc<dyn TaskExecutor>, workers: usize) -> Self {
        let rx = Arc::new(Mutex::new(receiver.rx));
        let shutdown = CancellationToken::new();

        let handles = (0..workers.max(1))
            .map(|worker_id| {
                let rx = rx.clone();
                let executor = executor.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(Self::worker_loop(worker_id, rx, executor, shutdown))
            })
            .collect();

        info!("WorkerPool started with {} workers", workers.max(1));
        Self { handles, shutdown }
    }

    async fn worker_loop(
        worker_id: usize,
        rx: Arc<Mutex<mpsc::UnboundedReceiver<Task>>>,
        executor: Arc<dyn TaskExecutor>,
        shutdown: CancellationToken,
    ) {
        loop {
            let task = tokio::select! {
                _ = shutdown.cancelled() => break,
                task = async { rx.lock().await.recv().await } => task,
            };

            let Some(task) = task else {
                debug!("Worker {}: queue closed", worker_id);
                break;
            };

            let label = task.label();
            let executor = executor.clone();
            // Run on its own task so a panic kills the task, not the worker
            if let Err(join_err) = tokio::spawn(async move { executor.execute(task).await }).await
            {
                error!("Worker {}: {} task panicked: {}", worker_id, label, join_err);
            }
        }
    }

    pub async fn shutdown(self) {
        self.shutdown.cancel();
        futures::future::join_all(self.handles).await;
        info!("WorkerPool stopped");
    }
}

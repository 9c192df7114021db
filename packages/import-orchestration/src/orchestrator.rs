use crate::config::PipelineConfig;
use crate::context::{FeatureGate, RunContext, StaticFeatureGate};
use crate::coordinator::{AdvanceDecision, AdvancementCoordinator};
use crate::error::{ErrorCategory, ImportError, PipelineError, Result};
use crate::failure::{DefaultFailurePolicy, FailurePolicy, FailureReporter};
use crate::importer::{ImporterRegistry, PhaseImporter};
use crate::pipeline::StageHandler;
use crate::queue::{AdvanceTask, JobTask, StageTask, Task, TaskExecutor, TaskQueue, WorkerPool};
use crate::sequencer::StageSequencer;
use crate::sink::{MetricsSink, TracingSink};
use crate::stage::Stage;
use crate::state::{ImportState, ImportStatus, RunPhase, StateStore};
use crate::store::MemoryStore;
use crate::waiter::CounterStore;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Drives import runs through the stage sequence
///
/// Every method that moves a run forward is invoked from a queued task; the
/// orchestrator itself holds no per-run state in memory.
pub struct ImportOrchestrator {
    config: PipelineConfig,
    sequencer: Arc<StageSequencer>,
    handler: StageHandler,
    coordinator: AdvancementCoordinator,
    counters: Arc<dyn CounterStore>,
    states: Arc<dyn StateStore>,
    queue: TaskQueue,
    feature_gate: Arc<dyn FeatureGate>,
    reporter: FailureReporter,
    sink: Arc<dyn MetricsSink>,
}

impl ImportOrchestrator {
    /// Create state for a new run at the first stage and dispatch it
    pub async fn start_import(&self, context: RunContext) -> Result<ImportStatus> {
        let subject_id = context.subject_id.trim().to_string();
        if subject_id.is_empty() {
            return Err(PipelineError::InvalidSubject(context.subject_id));
        }

        let context = RunContext {
            subject_id: subject_id.clone(),
            ..context
        }
        .resolve_features(self.feature_gate.as_ref());

        let state = ImportState::new(context, self.config.liveness_timeout());
        self.states.insert(&state).await?;

        info!(
            "Starting import {} (features: {:?})\nExecution plan:\n{}",
            subject_id,
            state.context.features,
            self.sequencer.execution_plan(&state.context)
        );
        self.sink.record(
            "import_started",
            json!({
                "subject_id": subject_id,
                "features": state.context.features,
                "push_access": state.context.push_access,
            }),
        );

        self.queue.enqueue(Task::Stage(StageTask::Run {
            subject_id,
            stage: self.sequencer.first(),
        }))?;

        Ok(state.status())
    }

    pub async fn import_status(&self, subject_id: &str) -> Result<ImportStatus> {
        Ok(self.load_existing(subject_id).await?.status())
    }

    /// Re-dispatch a stalled run from its persisted phase
    ///
    /// Runs whose heartbeat is still current belong to a live worker and are
    /// rejected with `AlreadyRunning`.
    pub async fn resume_import(&self, subject_id: &str) -> Result<ImportStatus> {
        let mut state = self.load_existing(subject_id).await?;
        if !state.alive || state.phase.is_terminal() {
            return Err(PipelineError::InvalidStateTransition {
                from: state.phase.phase_name().to_string(),
                to: "resumed".to_string(),
            });
        }
        if !state.is_stalled(Utc::now()) {
            return Err(PipelineError::AlreadyRunning(state.subject_id));
        }

        if state.phase == RunPhase::Running {
            state.redispatch()?;
        }
        let task = match &state.phase {
            RunPhase::Advancing {
                waiters,
                next_stage,
            } => StageTask::Advance(AdvanceTask {
                subject_id: state.subject_id.clone(),
                from_stage: state.current_stage,
                next_stage: *next_stage,
                waiters: waiters.clone(),
                unsatisfied_checks: 0,
            }),
            _ => StageTask::Run {
                subject_id: state.subject_id.clone(),
                stage: state.current_stage,
            },
        };

        state.refresh_deadline(self.config.liveness_timeout());
        if !self.states.compare_and_save(&mut state).await? {
            return Err(PipelineError::AlreadyRunning(state.subject_id));
        }

        info!(
            "Resuming import {} at {} ({})",
            state.subject_id,
            state.current_stage,
            state.phase.phase_name()
        );
        self.sink.record(
            "import_resumed",
            json!({
                "subject_id": state.subject_id,
                "stage": state.current_stage.as_str(),
                "phase": state.phase.phase_name(),
            }),
        );

        self.queue.enqueue(Task::Stage(task))?;
        Ok(state.status())
    }

    /// Alive runs whose heartbeat deadline has passed
    pub async fn stalled_imports(&self) -> Result<Vec<String>> {
        self.states.stalled(Utc::now()).await
    }

    /// Drop expired counters and states; returns how many records went
    pub async fn purge_expired(&self) -> Result<usize> {
        let counters = self.counters.purge_expired().await?;
        let states = self.states.purge_expired().await?;
        if counters + states > 0 {
            debug!("Purged {} counters and {} states", counters, states);
        }
        Ok(counters + states)
    }

    pub fn sequencer(&self) -> &StageSequencer {
        &self.sequencer
    }

    async fn load_existing(&self, subject_id: &str) -> Result<ImportState> {
        self.states
            .load(subject_id)
            .await?
            .ok_or_else(|| PipelineError::ImportNotFound(subject_id.to_string()))
    }

    async fn run_stage(&self, subject_id: &str, stage: Stage) -> Result<()> {
        let Some(mut state) = self.states.load(subject_id).await? else {
            warn!("Import {}: state gone, dropping {} run", subject_id, stage);
            return Ok(());
        };

        if !state.alive || state.current_stage != stage {
            debug!(
                "Import {}: ignoring stale run of {} (at {}, alive: {})",
                subject_id, stage, state.current_stage, state.alive
            );
            return Ok(());
        }
        if !matches!(state.phase, RunPhase::Pending | RunPhase::Dispatched) {
            debug!(
                "Import {}: {} already {}",
                subject_id,
                stage,
                state.phase.phase_name()
            );
            return Ok(());
        }
        state.claim()?;
        if !self.states.compare_and_save(&mut state).await? {
            debug!("Import {}: {} claimed by another worker", subject_id, stage);
            return Ok(());
        }

        info!("Import {}: running stage {}", subject_id, stage);
        self.sink.record(
            "stage_started",
            json!({ "subject_id": subject_id, "stage": stage.as_str() }),
        );

        let outcome = self.handler.run(&mut state).await?;

        if let RunPhase::Aborted { reason, .. } = &state.phase {
            error!("Import {} aborted in {}: {}", subject_id, stage, reason);
            self.sink.record(
                "import_aborted",
                json!({
                    "subject_id": subject_id,
                    "stage": stage.as_str(),
                    "reason": reason,
                }),
            );
            self.commit(&mut state).await?;
            return Ok(());
        }

        if stage.is_terminal() {
            state.finish()?;
            if !self.commit(&mut state).await? {
                return Ok(());
            }

            let duration_ms = (Utc::now() - state.started_at).num_milliseconds().max(0);
            info!(
                "Import {} finished: {} stages, {} non-fatal failures in {}ms",
                subject_id,
                state.visited.len(),
                state.failures,
                duration_ms
            );
            self.sink.record(
                "import_finished",
                json!({
                    "subject_id": subject_id,
                    "duration_ms": duration_ms,
                    "stages": state.visited.len(),
                    "failures": state.failures,
                }),
            );
            return Ok(());
        }

        let next_stage = self
            .sequencer
            .next_stage(stage, &state.context)
            .ok_or_else(|| PipelineError::config(format!("no successor for {}", stage)))?;
        state.begin_advance(outcome.waiters.clone(), next_stage)?;
        if !self.commit(&mut state).await? {
            return Ok(());
        }

        self.sink.record(
            "stage_completed",
            json!({
                "subject_id": subject_id,
                "stage": stage.as_str(),
                "next_stage": next_stage.as_str(),
                "waiters": outcome.waiters.len(),
                "skipped": outcome.skipped,
                "importers_run": outcome.metrics.importers_run,
                "importers_failed": outcome.metrics.importers_failed,
                "duration_ms": outcome.metrics.duration_ms,
            }),
        );

        self.queue
            .enqueue(Task::Stage(StageTask::Advance(AdvanceTask {
                subject_id: subject_id.to_string(),
                from_stage: stage,
                next_stage,
                waiters: outcome.waiters,
                unsatisfied_checks: 0,
            })))
    }

    async fn advance(&self, task: AdvanceTask) -> Result<()> {
        let Some(mut state) = self.states.load(&task.subject_id).await? else {
            warn!("Import {}: state gone, dropping advance", task.subject_id);
            return Ok(());
        };

        let expected = state.alive
            && state.current_stage == task.from_stage
            && matches!(
                &state.phase,
                RunPhase::Advancing { next_stage, .. } if *next_stage == task.next_stage
            );
        if !expected {
            debug!(
                "Import {}: ignoring stale advance {} -> {}",
                task.subject_id, task.from_stage, task.next_stage
            );
            return Ok(());
        }

        match self.coordinator.check(&task).await? {
            AdvanceDecision::Wait { pending, delay } => {
                let checks = task.unsatisfied_checks + 1;
                state.update_waiters(pending.clone())?;
                state.refresh_deadline(self.config.liveness_timeout());
                if !self.commit(&mut state).await? {
                    return Ok(());
                }
                self.record_waiting(&task, pending.len(), checks);

                self.queue.enqueue_in(
                    delay,
                    Task::Stage(StageTask::Advance(AdvanceTask {
                        waiters: pending,
                        unsatisfied_checks: checks,
                        ..task
                    })),
                );
            }
            AdvanceDecision::Proceed { timed_out, pending } => {
                if timed_out {
                    self.record_waiting(&task, pending.len(), task.unsatisfied_checks + 1);
                    self.reporter.report_timeout(
                        &mut state,
                        task.from_stage,
                        task.next_stage,
                        pending.len(),
                    );
                    // Late jobs decrement a missing key, which is a no-op
                    for key in pending.keys() {
                        self.counters.discard(key).await?;
                    }
                }

                state.enter_stage(task.next_stage)?;
                state.refresh_deadline(self.config.liveness_timeout());
                if !self.commit(&mut state).await? {
                    return Ok(());
                }

                info!(
                    "Import {}: {} -> {}",
                    task.subject_id, task.from_stage, task.next_stage
                );
                self.sink.record(
                    "stage_dispatched",
                    json!({
                        "subject_id": task.subject_id,
                        "stage": task.next_stage.as_str(),
                        "from_stage": task.from_stage.as_str(),
                        "unsatisfied_checks": task.unsatisfied_checks,
                        "timed_out": timed_out,
                    }),
                );
                self.queue.enqueue(Task::Stage(StageTask::Run {
                    subject_id: task.subject_id,
                    stage: task.next_stage,
                }))?;
            }
        }

        Ok(())
    }

    /// Persist `state` unless another worker wrote it since it was loaded,
    /// in which case the current task is dropped.
    async fn commit(&self, state: &mut ImportState) -> Result<bool> {
        let committed = self.states.compare_and_save(state).await?;
        if !committed {
            warn!(
                "Import {}: state changed concurrently at {} ({}), dropping task",
                state.subject_id,
                state.current_stage,
                state.phase.phase_name()
            );
        }
        Ok(committed)
    }

    fn record_waiting(&self, task: &AdvanceTask, pending: usize, check: u32) {
        self.sink.record(
            "advance_waiting",
            json!({
                "subject_id": task.subject_id,
                "stage": task.from_stage.as_str(),
                "next_stage": task.next_stage.as_str(),
                "pending": pending,
                "check": check,
            }),
        );
    }

    async fn run_job(&self, job: JobTask) -> Result<()> {
        let run = job.run.clone();
        // Own task, so a panicking job still releases its waiter
        let result = match tokio::spawn(async move { run().await }).await {
            Ok(result) => result,
            Err(join_err) => Err(ImportError::Panicked(join_err.to_string())),
        };

        match result {
            Ok(()) => self.counters.decrement(&job.waiter).await,
            Err(e)
                if e.category() == ErrorCategory::Transient
                    && job.attempt < self.config.job_max_attempts =>
            {
                let delay = self.config.job_retry_delay(job.attempt);
                warn!(
                    "Import {}: {} job attempt {} failed ({}), retrying in {:?}",
                    job.subject_id, job.stage, job.attempt, e, delay
                );
                self.sink.record(
                    "job_retried",
                    json!({
                        "subject_id": job.subject_id,
                        "stage": job.stage.as_str(),
                        "attempt": job.attempt,
                        "error": e.to_string(),
                    }),
                );
                self.queue.enqueue_in(
                    delay,
                    Task::Job(JobTask {
                        attempt: job.attempt + 1,
                        ..job
                    }),
                );
                Ok(())
            }
            Err(e) => {
                warn!(
                    "Import {}: {} job failed after {} attempt(s): {}",
                    job.subject_id, job.stage, job.attempt, e
                );
                self.sink.record(
                    "job_failed",
                    json!({
                        "subject_id": job.subject_id,
                        "stage": job.stage.as_str(),
                        "waiter": job.waiter.as_str(),
                        "attempt": job.attempt,
                        "error": e.to_string(),
                        "kind": e.kind(),
                        "category": e.category().as_str(),
                    }),
                );
                self.counters.decrement(&job.waiter).await
            }
        }
    }
}

#[async_trait]
impl TaskExecutor for ImportOrchestrator {
    async fn execute(&self, task: Task) {
        let result = match task {
            Task::Stage(StageTask::Run { subject_id, stage }) => {
                self.run_stage(&subject_id, stage).await
            }
            Task::Stage(StageTask::Advance(advance)) => self.advance(advance).await,
            Task::Job(job) => self.run_job(job).await,
        };

        if let Err(e) = result {
            error!("Task failed: {}", e);
        }
    }
}

/// Assembles an orchestrator and its worker pool
pub struct PipelineBuilder {
    config: PipelineConfig,
    sequencer: Option<StageSequencer>,
    importers: ImporterRegistry,
    counters: Option<Arc<dyn CounterStore>>,
    states: Option<Arc<dyn StateStore>>,
    feature_gate: Arc<dyn FeatureGate>,
    sink: Arc<dyn MetricsSink>,
    failure_policy: Arc<dyn FailurePolicy>,
}

impl PipelineBuilder {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            sequencer: None,
            importers: ImporterRegistry::new(),
            counters: None,
            states: None,
            feature_gate: Arc::new(StaticFeatureGate::default()),
            sink: Arc::new(TracingSink),
            failure_policy: Arc::new(DefaultFailurePolicy),
        }
    }

    pub fn sequencer(mut self, sequencer: StageSequencer) -> Self {
        self.sequencer = Some(sequencer);
        self
    }

    pub fn importer(mut self, stage: Stage, importer: Arc<dyn PhaseImporter>) -> Self {
        self.importers.register(stage, importer);
        self
    }

    /// One store backing both counters and states
    pub fn with_store<S>(self, store: S) -> Self
    where
        S: CounterStore + StateStore + Clone + 'static,
    {
        self.counters(Arc::new(store.clone())).states(Arc::new(store))
    }

    pub fn counters(mut self, counters: Arc<dyn CounterStore>) -> Self {
        self.counters = Some(counters);
        self
    }

    pub fn states(mut self, states: Arc<dyn StateStore>) -> Self {
        self.states = Some(states);
        self
    }

    pub fn feature_gate(mut self, gate: Arc<dyn FeatureGate>) -> Self {
        self.feature_gate = gate;
        self
    }

    pub fn sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn failure_policy(mut self, policy: Arc<dyn FailurePolicy>) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Build and start the workers. Must be called inside a tokio runtime.
    pub fn start(self) -> Result<Pipeline> {
        self.config.validate()?;

        let sequencer = Arc::new(match self.sequencer {
            Some(sequencer) => sequencer,
            None => StageSequencer::standard()?,
        });
        let memory = MemoryStore::from_config(&self.config);
        let counters: Arc<dyn CounterStore> = match self.counters {
            Some(counters) => counters,
            None => Arc::new(memory.clone()),
        };
        let states: Arc<dyn StateStore> = match self.states {
            Some(states) => states,
            None => Arc::new(memory),
        };

        let (queue, receiver) = TaskQueue::new();
        let reporter = FailureReporter::new(self.failure_policy, self.sink.clone());
        let handler = StageHandler::new(
            sequencer.clone(),
            Arc::new(self.importers),
            reporter.clone(),
            counters.clone(),
            states.clone(),
            queue.clone(),
            self.config.liveness_timeout(),
        );
        let coordinator =
            AdvancementCoordinator::new(counters.clone(), self.config.advance.clone());

        let workers = self.config.workers;
        let orchestrator = Arc::new(ImportOrchestrator {
            config: self.config,
            sequencer,
            handler,
            coordinator,
            counters,
            states,
            queue,
            feature_gate: self.feature_gate,
            reporter,
            sink: self.sink,
        });

        let workers = WorkerPool::start(receiver, orchestrator.clone(), workers);
        Ok(Pipeline {
            orchestrator,
            workers,
        })
    }
}

/// A running pipeline: the orchestrator plus the workers draining its queue
pub struct Pipeline {
    orchestrator: Arc<ImportOrchestrator>,
    workers: WorkerPool,
}

impl Pipeline {
    pub fn builder(config: PipelineConfig) -> PipelineBuilder {
        PipelineBuilder::new(config)
    }

    pub fn orchestrator(&self) -> &Arc<ImportOrchestrator> {
        &self.orchestrator
    }

    pub async fn start_import(&self, context: RunContext) -> Result<ImportStatus> {
        self.orchestrator.start_import(context).await
    }

    pub async fn import_status(&self, subject_id: &str) -> Result<ImportStatus> {
        self.orchestrator.import_status(subject_id).await
    }

    pub async fn resume_import(&self, subject_id: &str) -> Result<ImportStatus> {
        self.orchestrator.resume_import(subject_id).await
    }

    pub async fn stalled_imports(&self) -> Result<Vec<String>> {
        self.orchestrator.stalled_imports().await
    }

    /// Stop the workers. Delayed tasks still on a timer are dropped.
    pub async fn shutdown(self) {
        self.workers.shutdown().await;
    }
}

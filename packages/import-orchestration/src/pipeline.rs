use crate::error::{ImportError, Result};
use crate::failure::FailureReporter;
use crate::importer::{
    FanOut, Heartbeat, ImportOutcome, ImporterContext, ImporterRegistry, PhaseImporter,
};
use crate::queue::TaskQueue;
use crate::sequencer::{ImporterMode, StageSequencer};
use crate::state::{ImportState, StateStore};
use crate::waiter::{CounterStore, WaiterMap};
use chrono::Duration;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Stage metrics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageMetrics {
    pub importers_run: usize,
    pub importers_failed: usize,
    pub duration_ms: u64,
}

/// What a stage handed to the coordinator
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageOutcome {
    /// One entry per importer that fanned out
    pub waiters: WaiterMap,
    /// Set when the stage skipped its importers
    pub skipped: Option<&'static str>,
    pub metrics: StageMetrics,
}

/// Runs the importers of the run's current stage
///
/// Importer errors never escape: each one goes through the failure reporter,
/// which may abort the run. Waiters collected before a failure are kept.
pub struct StageHandler {
    sequencer: Arc<StageSequencer>,
    importers: Arc<ImporterRegistry>,
    reporter: FailureReporter,
    counters: Arc<dyn CounterStore>,
    states: Arc<dyn StateStore>,
    queue: TaskQueue,
    liveness_timeout: Duration,
}

impl StageHandler {
    pub fn new(
        sequencer: Arc<StageSequencer>,
        importers: Arc<ImporterRegistry>,
        reporter: FailureReporter,
        counters: Arc<dyn CounterStore>,
        states: Arc<dyn StateStore>,
        queue: TaskQueue,
        liveness_timeout: Duration,
    ) -> Self {
        Self {
            sequencer,
            importers,
            reporter,
            counters,
            states,
            queue,
            liveness_timeout,
        }
    }

    /// Run the current stage against `state`. The caller persists the state
    /// and schedules advancement unless the run was aborted.
    pub async fn run(&self, state: &mut ImportState) -> Result<StageOutcome> {
        let stage = state.current_stage;
        let descriptor = self.sequencer.descriptor(stage);
        let start = Instant::now();

        if let Some(reason) = descriptor.skip_reason(&state.context) {
            info!("Import {}: skipping {} ({})", state.subject_id, stage, reason);
            state.refresh_deadline(self.liveness_timeout);
            return Ok(StageOutcome {
                skipped: Some(reason),
                ..Default::default()
            });
        }

        let importers = self.importers.for_stage(stage);
        let ctx = ImporterContext {
            run: state.context.clone(),
            stage,
            fan_out: FanOut::new(
                self.counters.clone(),
                self.queue.clone(),
                state.subject_id.clone(),
                stage,
            ),
            heartbeat: Heartbeat::new(
                self.states.clone(),
                state.subject_id.clone(),
                self.liveness_timeout,
            ),
        };

        let results = match descriptor.mode {
            ImporterMode::Inline => self.run_inline(state, importers, &ctx).await?,
            ImporterMode::Concurrent => run_concurrent(importers, &ctx).await,
        };

        let mut outcome = StageOutcome::default();
        for (importer, result) in results {
            outcome.metrics.importers_run += 1;
            match result {
                Ok(ImportOutcome::Done) => {
                    debug!("Import {}: {} done", state.subject_id, importer);
                }
                Ok(ImportOutcome::Waiting(handle)) => {
                    debug!(
                        "Import {}: {} waiting on {} ({} jobs)",
                        state.subject_id, importer, handle.key, handle.jobs_remaining
                    );
                    outcome.waiters.insert(handle.key, handle.jobs_remaining);
                }
                Err(e) => {
                    outcome.metrics.importers_failed += 1;
                    // Inline failures were reported as they happened
                    if descriptor.mode == ImporterMode::Concurrent {
                        self.reporter.report(state, stage, &importer, &e)?;
                    }
                }
            }
        }

        state.refresh_deadline(self.liveness_timeout);
        outcome.metrics.duration_ms = start.elapsed().as_millis() as u64;

        info!(
            "Import {}: stage {} ran {} importer(s), {} failed, {} waiter(s) in {}ms",
            state.subject_id,
            stage,
            outcome.metrics.importers_run,
            outcome.metrics.importers_failed,
            outcome.waiters.len(),
            outcome.metrics.duration_ms
        );
        Ok(outcome)
    }

    /// One after another; stops at the first failure that aborts the run
    async fn run_inline(
        &self,
        state: &mut ImportState,
        importers: &[Arc<dyn PhaseImporter>],
        ctx: &ImporterContext,
    ) -> Result<Vec<(String, std::result::Result<ImportOutcome, ImportError>)>> {
        let mut results = Vec::with_capacity(importers.len());

        for importer in importers {
            let name = importer.name().to_string();
            let result = AssertUnwindSafe(importer.execute(ctx))
                .catch_unwind()
                .await
                .unwrap_or_else(|payload| Err(ImportError::Panicked(panic_message(payload))));

            if let Err(e) = &result {
                self.reporter.report(state, ctx.stage, &name, e)?;
            }
            results.push((name, result));

            if !state.alive {
                break;
            }
        }

        Ok(results)
    }
}

/// Each importer on its own task. Results come back in registration order.
async fn run_concurrent(
    importers: &[Arc<dyn PhaseImporter>],
    ctx: &ImporterContext,
) -> Vec<(String, std::result::Result<ImportOutcome, ImportError>)> {
    let handles: Vec<_> = importers
        .iter()
        .map(|importer| {
            let importer = importer.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move { importer.execute(&ctx).await })
        })
        .collect();

    let joined = futures::future::join_all(handles).await;

    importers
        .iter()
        .zip(joined)
        .map(|(importer, joined)| {
            let result = joined.unwrap_or_else(|e| Err(ImportError::Panicked(e.to_string())));
            (importer.name().to_string(), result)
        })
        .collect()
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

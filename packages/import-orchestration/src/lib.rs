/*
 * Import Orchestration - staged import pipeline
 *
 * Moves a large external repository into the system through an ordered set
 * of import stages, some of which fan out into many background jobs.
 *
 * Architecture:
 * - Stage Sequencer (closed stage enum, config-driven branches)
 * - Stage Handler (runs phase importers, collects waiters)
 * - Advancement Coordinator (re-scheduled fan-in barrier)
 * - Waiter counters + Import State (shared, TTL-bounded stores)
 * - Failure Policy (fatal vs recorded)
 * - Task queue + worker pool (tokio)
 */

// Public modules
pub mod config;
pub mod context;
pub mod coordinator;
pub mod error;
pub mod failure;
pub mod importer;
pub mod logging;
pub mod orchestrator;
pub mod pipeline;
pub mod queue;
pub mod sequencer;
pub mod sink;
pub mod stage;
pub mod state;
pub mod store;
pub mod waiter;

// Re-exports
pub use config::{AdvanceConfig, PipelineConfig};
pub use context::{features, FeatureGate, RunContext, StaticFeatureGate};
pub use coordinator::{AdvanceDecision, AdvancementCoordinator};
pub use error::{ErrorCategory, ImportError, PipelineError, Result};
pub use failure::{DefaultFailurePolicy, FailurePolicy, FailureRecord, FailureReporter};
pub use importer::{
    FanOut, Heartbeat, ImportOutcome, ImporterContext, ImporterRegistry, PhaseImporter,
};
pub use orchestrator::{ImportOrchestrator, Pipeline, PipelineBuilder};
pub use pipeline::{StageHandler, StageMetrics, StageOutcome};
pub use queue::{
    AdvanceTask, JobFn, JobTask, StageTask, Task, TaskExecutor, TaskQueue, WorkerPool,
};
pub use sequencer::{ImporterMode, StageDescriptor, StageSequencer};
pub use sink::{MetricsSink, RecordedEvent, RecordingSink, TracingSink};
pub use stage::Stage;
pub use state::{ImportState, ImportStatus, RunPhase, StateStore};
pub use store::{MemoryStore, SqliteStore};
pub use waiter::{CounterStore, WaiterHandle, WaiterKey, WaiterMap};

#[cfg(feature = "metrics")]
pub use sink::PrometheusSink;

use crate::context::RunContext;
use crate::error::{ErrorCategory, ImportError, Result};
use crate::sink::MetricsSink;
use crate::stage::Stage;
use crate::state::ImportState;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{error, warn};

/// One failure, handed straight to the sink and then dropped
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureRecord {
    pub subject_id: String,
    pub source: Stage,
    /// Importer that raised, if the failure came from one
    pub importer: Option<String>,
    pub error: String,
    pub category: ErrorCategory,
    pub fatal: bool,
    pub occurred_at: DateTime<Utc>,
}

impl FailureRecord {
    fn attributes(&self) -> Value {
        json!({
            "subject_id": self.subject_id,
            "stage": self.source.as_str(),
            "importer": self.importer,
            "error": self.error,
            "category": self.category.as_str(),
            "fatal": self.fatal,
        })
    }
}

/// Decides whether a failure aborts the run
pub trait FailurePolicy: Send + Sync {
    fn decide(&self, stage: Stage, error: &ImportError, ctx: &RunContext) -> bool;
}

/// Fatal when the error itself is fatal (authorization, corrupt data), or
/// when the stage cannot be partially completed (`repository`: nothing
/// downstream makes sense without the repository itself).
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultFailurePolicy;

impl DefaultFailurePolicy {
    pub fn aborts_on_any_failure(stage: Stage) -> bool {
        matches!(stage, Stage::Repository)
    }
}

impl FailurePolicy for DefaultFailurePolicy {
    fn decide(&self, stage: Stage, error: &ImportError, _ctx: &RunContext) -> bool {
        error.category() == ErrorCategory::Fatal || Self::aborts_on_any_failure(stage)
    }
}

/// Applies the policy: emits the record and updates the in-memory state.
/// The caller persists the state.
#[derive(Clone)]
pub struct FailureReporter {
    policy: Arc<dyn FailurePolicy>,
    sink: Arc<dyn MetricsSink>,
}

impl FailureReporter {
    pub fn new(policy: Arc<dyn FailurePolicy>, sink: Arc<dyn MetricsSink>) -> Self {
        Self { policy, sink }
    }

    pub fn report(
        &self,
        state: &mut ImportState,
        stage: Stage,
        importer: &str,
        err: &ImportError,
    ) -> Result<FailureRecord> {
        let fatal = self.policy.decide(stage, err, &state.context);
        let record = FailureRecord {
            subject_id: state.subject_id.clone(),
            source: stage,
            importer: Some(importer.to_string()),
            error: err.to_string(),
            category: err.category(),
            fatal,
            occurred_at: Utc::now(),
        };

        if fatal {
            error!(
                "Import {}: {} failed in stage {} (fatal): {}",
                state.subject_id, importer, stage, err
            );
            // A sibling importer may already have aborted the run
            if state.alive {
                state.abort(format!("{} failed in {}: {}", importer, stage, err))?;
            }
        } else {
            warn!(
                "Import {}: {} failed in stage {} ({}), continuing: {}",
                state.subject_id,
                importer,
                stage,
                record.category,
                err
            );
            state.record_failure();
        }

        self.sink.record("import_failure", record.attributes());
        Ok(record)
    }

    /// The advancement wait budget ran out with counters still pending
    pub fn report_timeout(
        &self,
        state: &mut ImportState,
        stage: Stage,
        next_stage: Stage,
        pending: usize,
    ) -> FailureRecord {
        let record = FailureRecord {
            subject_id: state.subject_id.clone(),
            source: stage,
            importer: None,
            error: format!(
                "wait budget exhausted before {} with {} waiter(s) pending",
                next_stage, pending
            ),
            category: ErrorCategory::Transient,
            fatal: false,
            occurred_at: Utc::now(),
        };

        warn!("Import {}: {}", state.subject_id, record.error);
        state.record_failure();

        let mut attributes = record.attributes();
        attributes["next_stage"] = json!(next_stage.as_str());
        attributes["pending"] = json!(pending);
        self.sink.record("advance_timeout", attributes);
        record
    }
}

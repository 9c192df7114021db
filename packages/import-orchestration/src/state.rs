use crate::context::RunContext;
use crate::error::{PipelineError, Result};
use crate::stage::Stage;
use crate::waiter::WaiterMap;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Where a run is inside its current stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunPhase {
    Pending,
    /// Handed to the queue; the worker that claims it moves it to `Running`
    Dispatched,
    Running,
    /// Stage handler finished; the coordinator is waiting on these counters.
    /// Persisted so an interrupted run can resume the barrier.
    Advancing {
        waiters: WaiterMap,
        next_stage: Stage,
    },
    Finished {
        finished_at: DateTime<Utc>,
    },
    Aborted {
        aborted_at: DateTime<Utc>,
        reason: String,
    },
}

impl RunPhase {
    pub fn phase_name(&self) -> &'static str {
        match self {
            RunPhase::Pending => "pending",
            RunPhase::Dispatched => "dispatched",
            RunPhase::Running => "running",
            RunPhase::Advancing { .. } => "advancing",
            RunPhase::Finished { .. } => "finished",
            RunPhase::Aborted { .. } => "aborted",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunPhase::Finished { .. } | RunPhase::Aborted { .. })
    }
}

/// Persistent record of one import run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportState {
    pub subject_id: String,
    pub current_stage: Stage,
    pub phase: RunPhase,
    pub alive: bool,
    pub liveness_deadline: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    /// When `current_stage` was entered
    pub stage_started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Stages entered so far, in order
    pub visited: Vec<Stage>,
    /// Non-fatal failures recorded during the run
    pub failures: u32,
    pub context: RunContext,
    /// Bumped by every `compare_and_save`
    #[serde(default)]
    pub revision: u64,
}

impl ImportState {
    /// New run parked in front of the first stage
    pub fn new(context: RunContext, liveness_timeout: Duration) -> Self {
        let now = Utc::now();
        Self {
            subject_id: context.subject_id.clone(),
            current_stage: Stage::first(),
            phase: RunPhase::Pending,
            alive: true,
            liveness_deadline: now + liveness_timeout,
            started_at: now,
            stage_started_at: now,
            updated_at: now,
            visited: Vec::new(),
            failures: 0,
            context,
            revision: 0,
        }
    }

    pub fn status(&self) -> ImportStatus {
        ImportStatus {
            subject_id: self.subject_id.clone(),
            current_stage: self.current_stage,
            alive: self.alive,
            since: self.stage_started_at,
            phase: self.phase.phase_name(),
        }
    }

    pub fn is_stalled(&self, now: DateTime<Utc>) -> bool {
        self.alive && self.liveness_deadline <= now
    }

    fn transition_error(&self, to: &str) -> PipelineError {
        PipelineError::InvalidStateTransition {
            from: format!("{}@{}", self.phase.phase_name(), self.current_stage),
            to: to.to_string(),
        }
    }

    /// Transition: PENDING → RUNNING (first stage)
    pub fn start(&mut self) -> Result<()> {
        match self.phase {
            RunPhase::Pending => {
                let now = Utc::now();
                self.phase = RunPhase::Running;
                self.stage_started_at = now;
                self.updated_at = now;
                self.visited.push(self.current_stage);
                Ok(())
            }
            _ => Err(self.transition_error("running")),
        }
    }

    /// Transition: PENDING | DISPATCHED → RUNNING
    ///
    /// Only the worker whose `compare_and_save` of this transition succeeds
    /// owns the stage.
    pub fn claim(&mut self) -> Result<()> {
        match self.phase {
            RunPhase::Pending => self.start(),
            RunPhase::Dispatched => {
                self.phase = RunPhase::Running;
                self.updated_at = Utc::now();
                Ok(())
            }
            _ => Err(self.transition_error("running")),
        }
    }

    /// Transition: RUNNING → DISPATCHED, handing a stalled stage back to the queue
    pub fn redispatch(&mut self) -> Result<()> {
        match self.phase {
            RunPhase::Running => {
                self.phase = RunPhase::Dispatched;
                self.updated_at = Utc::now();
                Ok(())
            }
            _ => Err(self.transition_error("dispatched")),
        }
    }

    /// Transition: RUNNING → ADVANCING
    pub fn begin_advance(&mut self, waiters: WaiterMap, next_stage: Stage) -> Result<()> {
        match self.phase {
            RunPhase::Running if next_stage > self.current_stage => {
                self.phase = RunPhase::Advancing {
                    waiters,
                    next_stage,
                };
                self.updated_at = Utc::now();
                Ok(())
            }
            _ => Err(self.transition_error(&format!("advancing to {}", next_stage))),
        }
    }

    /// Replace the pending waiter set while advancing (pruned by the coordinator)
    pub fn update_waiters(&mut self, pending: WaiterMap) -> Result<()> {
        if let RunPhase::Advancing { waiters, .. } = &mut self.phase {
            *waiters = pending;
            self.updated_at = Utc::now();
            return Ok(());
        }
        Err(self.transition_error("update_waiters"))
    }

    /// Transition: ADVANCING → DISPATCHED (next stage)
    pub fn enter_stage(&mut self, stage: Stage) -> Result<()> {
        let expected = matches!(
            &self.phase,
            RunPhase::Advancing { next_stage, .. } if *next_stage == stage
        );
        if !expected {
            return Err(self.transition_error(&format!("running@{}", stage)));
        }

        let now = Utc::now();
        self.current_stage = stage;
        self.phase = RunPhase::Dispatched;
        self.stage_started_at = now;
        self.updated_at = now;
        self.visited.push(stage);
        Ok(())
    }

    /// Transition: RUNNING (terminal stage) → FINISHED
    pub fn finish(&mut self) -> Result<()> {
        match self.phase {
            RunPhase::Running if self.current_stage.is_terminal() => {
                let now = Utc::now();
                self.phase = RunPhase::Finished { finished_at: now };
                self.alive = false;
                self.updated_at = now;
                Ok(())
            }
            _ => Err(self.transition_error("finished")),
        }
    }

    /// Transition: * → ABORTED
    pub fn abort(&mut self, reason: impl Into<String>) -> Result<()> {
        if self.phase.is_terminal() {
            return Err(self.transition_error("aborted"));
        }

        let now = Utc::now();
        self.phase = RunPhase::Aborted {
            aborted_at: now,
            reason: reason.into(),
        };
        self.alive = false;
        self.updated_at = now;
        Ok(())
    }

    pub fn record_failure(&mut self) {
        self.failures += 1;
        self.updated_at = Utc::now();
    }

    pub fn refresh_deadline(&mut self, liveness_timeout: Duration) {
        let now = Utc::now();
        self.liveness_deadline = now + liveness_timeout;
        self.updated_at = now;
    }
}

/// Read-only status returned to callers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImportStatus {
    pub subject_id: String,
    pub current_stage: Stage,
    pub alive: bool,
    pub since: DateTime<Utc>,
    pub phase: &'static str,
}

/// Shared, TTL-bounded store of import states keyed by subject id
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Create the record for a new run. Fails with `AlreadyRunning` if an
    /// alive, unexpired run exists for the same subject; dead runs are replaced.
    async fn insert(&self, state: &ImportState) -> Result<()>;

    async fn load(&self, subject_id: &str) -> Result<Option<ImportState>>;

    /// Overwrite the record and restart its TTL.
    async fn save(&self, state: &ImportState) -> Result<()>;

    /// Overwrite the record only if its stored revision still equals
    /// `state.revision`, bumping the revision on success. Returns false and
    /// writes nothing when another worker saved first. Heartbeats do not
    /// change the revision.
    async fn compare_and_save(&self, state: &mut ImportState) -> Result<bool>;

    /// Liveness heartbeat
    async fn refresh_deadline(&self, subject_id: &str, deadline: DateTime<Utc>) -> Result<()>;

    /// Alive runs whose liveness deadline has passed
    async fn stalled(&self, now: DateTime<Utc>) -> Result<Vec<String>>;

    async fn remove(&self, subject_id: &str) -> Result<()>;

    async fn purge_expired(&self) -> Result<usize>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::waiter::WaiterKey;

    fn new_state() -> ImportState {
        ImportState::new(RunContext::new("project-1"), Duration::minutes(15))
    }

    #[test]
    fn test_new_state_is_pending_at_first_stage() {
        let state = new_state();
        assert_eq!(state.current_stage, Stage::Repository);
        assert_eq!(state.phase, RunPhase::Pending);
        assert!(state.alive);
        assert!(state.visited.is_empty());
        assert!(state.liveness_deadline > Utc::now());
    }

    #[test]
    fn test_start_then_advance_then_enter() {
        let mut state = new_state();
        state.start().unwrap();
        assert_eq!(state.visited, vec![Stage::Repository]);

        let mut waiters = WaiterMap::new();
        waiters.insert(WaiterKey::new("w1"), 2);
        state.begin_advance(waiters, Stage::BaseData).unwrap();
        assert_eq!(state.status().phase, "advancing");

        state.enter_stage(Stage::BaseData).unwrap();
        assert_eq!(state.current_stage, Stage::BaseData);
        assert_eq!(state.phase, RunPhase::Dispatched);
        assert_eq!(state.visited, vec![Stage::Repository, Stage::BaseData]);

        state.claim().unwrap();
        assert_eq!(state.phase, RunPhase::Running);
        assert_eq!(state.visited, vec![Stage::Repository, Stage::BaseData]);
    }

    #[test]
    fn test_running_stage_cannot_be_claimed_again() {
        let mut state = new_state();
        state.claim().unwrap();
        assert_eq!(state.phase, RunPhase::Running);
        assert!(matches!(
            state.claim(),
            Err(PipelineError::InvalidStateTransition { .. })
        ));

        state.redispatch().unwrap();
        assert_eq!(state.status().phase, "dispatched");
        state.claim().unwrap();
        assert_eq!(state.visited, vec![Stage::Repository]);
    }

    #[test]
    fn test_only_running_stage_is_redispatched() {
        let mut state = new_state();
        assert!(state.redispatch().is_err());

        state.start().unwrap();
        state.begin_advance(WaiterMap::new(), Stage::BaseData).unwrap();
        assert!(state.redispatch().is_err());
    }

    #[test]
    fn test_cannot_advance_backwards() {
        let mut state = new_state();
        state.start().unwrap();
        state
            .begin_advance(WaiterMap::new(), Stage::PullRequests)
            .unwrap();
        state.enter_stage(Stage::PullRequests).unwrap();
        state.claim().unwrap();

        let result = state.begin_advance(WaiterMap::new(), Stage::BaseData);
        assert!(matches!(
            result,
            Err(PipelineError::InvalidStateTransition { .. })
        ));
    }

    #[test]
    fn test_enter_stage_must_match_pending_successor() {
        let mut state = new_state();
        state.start().unwrap();
        state.begin_advance(WaiterMap::new(), Stage::BaseData).unwrap();

        assert!(state.enter_stage(Stage::PullRequests).is_err());
        assert_eq!(state.current_stage, Stage::Repository);
    }

    #[test]
    fn test_update_waiters_only_while_advancing() {
        let mut state = new_state();
        assert!(state.update_waiters(WaiterMap::new()).is_err());

        state.start().unwrap();
        let mut waiters = WaiterMap::new();
        waiters.insert(WaiterKey::new("a"), 1);
        waiters.insert(WaiterKey::new("b"), 1);
        state.begin_advance(waiters, Stage::BaseData).unwrap();

        let mut pruned = WaiterMap::new();
        pruned.insert(WaiterKey::new("b"), 1);
        state.update_waiters(pruned.clone()).unwrap();

        match &state.phase {
            RunPhase::Advancing { waiters, .. } => assert_eq!(waiters, &pruned),
            other => panic!("Expected Advancing phase, got {:?}", other),
        }
    }

    #[test]
    fn test_finish_only_from_terminal_stage() {
        let mut state = new_state();
        state.start().unwrap();
        assert!(state.finish().is_err());

        state.current_stage = Stage::Finish;
        state.finish().unwrap();
        assert!(!state.alive);
        assert_eq!(state.status().phase, "finished");
    }

    #[test]
    fn test_abort_keeps_current_stage() {
        let mut state = new_state();
        state.start().unwrap();
        state.abort("unauthorized").unwrap();

        let status = state.status();
        assert!(!status.alive);
        assert_eq!(status.current_stage, Stage::Repository);
        assert_eq!(status.phase, "aborted");
    }

    #[test]
    fn test_cannot_abort_twice() {
        let mut state = new_state();
        state.abort("first").unwrap();
        assert!(state.abort("second").is_err());
    }

    #[test]
    fn test_stalled_detection() {
        let mut state = new_state();
        let later = Utc::now() + Duration::minutes(30);
        assert!(state.is_stalled(later));

        state.refresh_deadline(Duration::hours(1));
        assert!(!state.is_stalled(later));

        state.abort("gone").unwrap();
        assert!(!state.is_stalled(later + Duration::hours(2)));
    }

    #[test]
    fn test_state_serde_roundtrip() {
        let mut state = new_state();
        state.start().unwrap();
        let mut waiters = WaiterMap::new();
        waiters.insert(WaiterKey::new("import:waiter:x"), 4);
        state.begin_advance(waiters, Stage::BaseData).unwrap();

        let json = serde_json::to_string(&state).unwrap();
        let parsed: ImportState = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, state);
    }
}

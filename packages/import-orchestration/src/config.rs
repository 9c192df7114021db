use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Pipeline configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Worker tasks pulling from the shared queue
    pub workers: usize,
    pub advance: AdvanceConfig,
    /// Lifetime of a waiter counter; abandoned counters expire after this
    pub waiter_ttl_secs: u64,
    /// Lifetime of an import state record after its last write
    pub state_ttl_secs: u64,
    /// How far a heartbeat pushes the liveness deadline
    pub liveness_timeout_secs: u64,
    /// Attempts per fan-out job before it is counted as failed
    pub job_max_attempts: u32,
    /// Base delay between job attempts (multiplied by the attempt number)
    pub job_retry_delay_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: (num_cpus::get() * 3 / 4).max(2), // 75% of cores
            advance: AdvanceConfig::default(),
            waiter_ttl_secs: 6 * 60 * 60,
            state_ttl_secs: 24 * 60 * 60,
            liveness_timeout_secs: 15 * 60,
            job_max_attempts: 3,
            job_retry_delay_ms: 1_000,
        }
    }
}

impl PipelineConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).map_err(PipelineError::config)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(PipelineError::config("workers must be at least 1"));
        }
        if self.job_max_attempts == 0 {
            return Err(PipelineError::config("job_max_attempts must be at least 1"));
        }
        if self.waiter_ttl_secs == 0 || self.state_ttl_secs == 0 {
            return Err(PipelineError::config("TTLs must be non-zero"));
        }
        self.advance.validate()?;

        // Every poll refreshes the heartbeat, so the deadline must outlast the
        // longest gap between polls.
        if self.liveness_timeout_secs.saturating_mul(1_000) <= self.advance.max_poll_interval_ms {
            return Err(PipelineError::config(format!(
                "liveness_timeout_secs ({}) must exceed max_poll_interval_ms ({})",
                self.liveness_timeout_secs, self.advance.max_poll_interval_ms
            )));
        }
        Ok(())
    }

    pub fn waiter_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.waiter_ttl_secs as i64)
    }

    pub fn state_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.state_ttl_secs as i64)
    }

    pub fn liveness_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.liveness_timeout_secs as i64)
    }

    pub fn job_retry_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.job_retry_delay_ms.saturating_mul(attempt as u64))
    }
}

/// Advancement coordinator polling policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdvanceConfig {
    /// Delay before the re-check that follows the first unsatisfied check
    pub poll_interval_ms: u64,
    /// Upper bound for the doubling backoff
    pub max_poll_interval_ms: u64,
    /// Wait budget: after this many unsatisfied checks the next stage is
    /// dispatched anyway
    pub max_unsatisfied_checks: u32,
}

impl Default for AdvanceConfig {
    fn default() -> Self {
        // 30s, 60s, 120s, 240s, then every 5 minutes: ~6 hours in total,
        // which matches the default waiter TTL.
        Self {
            poll_interval_ms: 30_000,
            max_poll_interval_ms: 300_000,
            max_unsatisfied_checks: 72,
        }
    }
}

impl AdvanceConfig {
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(PipelineError::config("poll_interval_ms must be non-zero"));
        }
        if self.max_poll_interval_ms < self.poll_interval_ms {
            return Err(PipelineError::config(
                "max_poll_interval_ms must be >= poll_interval_ms",
            ));
        }
        if self.max_unsatisfied_checks == 0 {
            return Err(PipelineError::config(
                "max_unsatisfied_checks must be at least 1",
            ));
        }
        Ok(())
    }

    /// Delay after the n-th unsatisfied check (n starts at 1)
    pub fn delay_for(&self, unsatisfied_checks: u32) -> Duration {
        let factor = 1u64
            .checked_shl(unsatisfied_checks.saturating_sub(1))
            .unwrap_or(u64::MAX);
        let ms = self
            .poll_interval_ms
            .saturating_mul(factor)
            .min(self.max_poll_interval_ms);
        Duration::from_millis(ms)
    }

    /// Worst-case time spent waiting before the budget is exhausted
    pub fn total_budget(&self) -> Duration {
        (1..self.max_unsatisfied_checks)
            .map(|n| self.delay_for(n))
            .sum()
    }
}

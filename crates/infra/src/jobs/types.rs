//! Propagation job types and retry policy.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use stockroom_catalog::PropagationPlan;

/// Unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum JobStatus {
    /// Queued, waiting to be picked up
    Pending,
    /// Claimed by a worker; the lease says until when
    Running,
    /// Failed, will be retried once `scheduled_at` passes
    Failed { error: String },
    /// Exhausted retries, moved to the dead-letter table
    DeadLettered { error: String },
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Failed { .. } => "failed",
            JobStatus::DeadLettered { .. } => "dead_lettered",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::DeadLettered { .. })
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            JobStatus::Failed { error } | JobStatus::DeadLettered { error } => Some(error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// base * 2^(attempt-1)
    #[default]
    Exponential,
    /// base * attempt
    Linear,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts before dead-lettering (including the first)
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Jitter factor (0.0-1.0)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }

    /// Delay before the retry that follows `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;

        let delay_ms = match self.strategy {
            BackoffStrategy::Fixed => base_ms,
            BackoffStrategy::Exponential => {
                let exp = 2_f64.powi(attempt.saturating_sub(1).min(30) as i32);
                (base_ms * exp).min(max_ms)
            }
            BackoffStrategy::Linear => (base_ms * attempt as f64).min(max_ms),
        };

        // Deterministic spread so concurrent failures do not retry in lockstep.
        let jitter_range = delay_ms * self.jitter;
        let jitter = if jitter_range > 0.0 {
            let pseudo_random = ((attempt as f64 * 17.0) % 100.0) / 100.0;
            jitter_range * (pseudo_random - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + jitter).max(0.0) as u64)
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Outbox row: one catalog replacement's pending inventory edits.
///
/// Jobs run strictly in `catalog_version` order and the row is deleted in
/// the transaction that applies it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropagationJob {
    pub id: JobId,
    pub plan: PropagationPlan,
    pub status: JobStatus,
    /// Attempts started so far
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Not claimable before this instant (retry backoff)
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Running jobs whose lease has passed are claimable again
    pub lease_expires_at: Option<DateTime<Utc>>,
}

impl PropagationJob {
    pub fn new(plan: PropagationPlan) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            plan,
            status: JobStatus::Pending,
            attempt: 0,
            created_at: now,
            updated_at: now,
            scheduled_at: None,
            lease_expires_at: None,
        }
    }

    pub fn catalog_version(&self) -> u64 {
        self.plan.catalog_version
    }

    /// Whether a worker may claim this job at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match &self.status {
            JobStatus::Pending | JobStatus::Failed { .. } => {
                self.scheduled_at.is_none_or(|at| at <= now)
            }
            JobStatus::Running => self.lease_expires_at.is_some_and(|at| at < now),
            JobStatus::DeadLettered { .. } => false,
        }
    }

    pub fn mark_running(&mut self, now: DateTime<Utc>, lease: Duration) {
        self.status = JobStatus::Running;
        self.attempt += 1;
        self.lease_expires_at = Some(now + to_chrono(lease));
        self.updated_at = now;
    }

    /// Record a failed attempt: schedule a retry, or dead-letter once the
    /// policy is exhausted.
    pub fn mark_failed(&mut self, error: String, policy: &RetryPolicy, now: DateTime<Utc>) {
        self.lease_expires_at = None;
        self.updated_at = now;

        if policy.should_retry(self.attempt) {
            let delay = policy.delay_for_attempt(self.attempt);
            self.scheduled_at = Some(now + to_chrono(delay));
            self.status = JobStatus::Failed { error };
        } else {
            self.status = JobStatus::DeadLettered { error };
        }
    }

    /// Reset a dead-lettered job for another round of attempts.
    pub fn requeue(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Pending;
        self.attempt = 0;
        self.scheduled_at = None;
        self.lease_expires_at = None;
        self.updated_at = now;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub job: PropagationJob,
    pub dead_lettered_at: DateTime<Utc>,
    pub reason: String,
}

impl DeadLetterEntry {
    pub fn new(job: PropagationJob, reason: String) -> Self {
        Self {
            job,
            dead_lettered_at: Utc::now(),
            reason,
        }
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

//! Outbox queue abstraction.
//!
//! Enqueueing happens inside a store transaction ([`crate::store::StoreTx::enqueue_job`]),
//! so a job exists iff the catalog write that produced it committed. Everything
//! else about a job's lifecycle goes through this trait.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::types::{DeadLetterEntry, JobId, JobStatus, PropagationJob};

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn get_job(&self, job_id: JobId) -> Result<Option<PropagationJob>, JobStoreError>;

    /// Persist a job's status/attempt/schedule fields.
    async fn update_job(&self, job: &PropagationJob) -> Result<(), JobStoreError>;

    /// Claim the head of the queue, leasing it for `lease`.
    ///
    /// The head is the outstanding job with the lowest catalog version. Nothing
    /// is claimable while the head is leased or backing off, or while an older
    /// version sits in the dead-letter table.
    async fn claim_next(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Option<PropagationJob>, JobStoreError>;

    /// Claim one specific job if it is claimable and at the head of the queue.
    async fn claim(
        &self,
        job_id: JobId,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<Option<PropagationJob>, JobStoreError>;

    /// Move a job out of the queue into the dead-letter table.
    async fn dead_letter(&self, job: PropagationJob, reason: String) -> Result<(), JobStoreError>;

    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, JobStoreError>;

    /// Put a dead-lettered job back in the queue with a fresh attempt budget.
    async fn requeue_dead_letter(&self, job_id: JobId) -> Result<PropagationJob, JobStoreError>;

    async fn stats(&self) -> Result<JobStats, JobStoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("job storage error: {0}")]
    Storage(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct JobStats {
    pub pending: usize,
    pub running: usize,
    pub failed: usize,
    pub dead_lettered: usize,
}

impl JobStats {
    pub(crate) fn count(&mut self, status: &JobStatus) {
        match status {
            JobStatus::Pending => self.pending += 1,
            JobStatus::Running => self.running += 1,
            JobStatus::Failed { .. } => self.failed += 1,
            JobStatus::DeadLettered { .. } => self.dead_lettered += 1,
        }
    }

    /// Jobs that still need a worker.
    pub fn outstanding(&self) -> usize {
        self.pending + self.running + self.failed
    }
}

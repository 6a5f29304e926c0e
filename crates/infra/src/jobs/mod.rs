//! Catalog propagation outbox.
//!
//! ## Design
//!
//! - A catalog replacement enqueues one `PropagationJob` in the same
//!   transaction that writes the catalog
//! - Workers claim jobs with a lease; an expired lease makes the job
//!   claimable again (crash recovery)
//! - Failed attempts back off according to a `RetryPolicy`
//! - Jobs that exhaust their attempts move to a dead-letter table, where they
//!   can be inspected and requeued

pub mod store;
pub mod types;
pub mod worker;

pub use store::{JobStats, JobStore, JobStoreError};
pub use types::{BackoffStrategy, DeadLetterEntry, JobId, JobStatus, PropagationJob, RetryPolicy};
pub use worker::{JobRunOutcome, PropagationWorker, WorkerConfig, WorkerHandle, WorkerStats};

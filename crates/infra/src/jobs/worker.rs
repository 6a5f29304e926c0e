//! Propagation worker: drains the outbox with leases, retries and dead letters.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use stockroom_catalog::ArchetypeRef;
use stockroom_core::{DomainError, ProductId};
use stockroom_inventory::Product;

use super::store::JobStore;
use super::types::{DeadLetterEntry, JobId, JobStatus, PropagationJob, RetryPolicy};
use crate::config::PropagationSettings;
use crate::error::EngineError;
use crate::store::{Store, StoreTx};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Name for logging
    pub name: String,
    /// How often to poll when the queue is empty
    pub poll_interval: Duration,
    /// How long a claimed job stays invisible to other workers
    pub lease: Duration,
    pub retry_policy: RetryPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        PropagationSettings::default().into()
    }
}

impl From<PropagationSettings> for WorkerConfig {
    fn from(settings: PropagationSettings) -> Self {
        Self {
            name: "catalog-propagation".to_string(),
            poll_interval: settings.poll_interval,
            lease: settings.lease,
            retry_policy: RetryPolicy::exponential(
                settings.max_attempts,
                Duration::from_millis(500),
                Duration::from_secs(60),
            ),
        }
    }
}

impl WorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }
}

/// What happened to one claimed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobRunOutcome {
    Completed { job_id: JobId, edits: usize },
    Retrying { job_id: JobId, attempt: u32, error: String },
    DeadLettered { job_id: JobId, error: String },
}

impl JobRunOutcome {
    pub fn job_id(&self) -> JobId {
        match self {
            JobRunOutcome::Completed { job_id, .. }
            | JobRunOutcome::Retrying { job_id, .. }
            | JobRunOutcome::DeadLettered { job_id, .. } => *job_id,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, JobRunOutcome::Completed { .. })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct WorkerStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_retried: u64,
    pub jobs_dead_lettered: u64,
}

#[derive(Debug, Default)]
struct WorkerCounters {
    processed: AtomicU64,
    succeeded: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
}

impl WorkerCounters {
    fn record(&self, outcome: &JobRunOutcome) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        let counter = match outcome {
            JobRunOutcome::Completed { .. } => &self.succeeded,
            JobRunOutcome::Retrying { .. } => &self.retried,
            JobRunOutcome::DeadLettered { .. } => &self.dead_lettered,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> WorkerStats {
        WorkerStats {
            jobs_processed: self.processed.load(Ordering::Relaxed),
            jobs_succeeded: self.succeeded.load(Ordering::Relaxed),
            jobs_retried: self.retried.load(Ordering::Relaxed),
            jobs_dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
        }
    }
}

/// Handle to a spawned worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: Option<oneshot::Sender<()>>,
    join: Option<JoinHandle<()>>,
    counters: Arc<WorkerCounters>,
}

impl WorkerHandle {
    /// Request graceful shutdown and wait for the current job to finish.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(join) = self.join.take() {
            if let Err(err) = join.await {
                error!(error = %err, "propagation worker task failed");
            }
        }
    }

    pub fn stats(&self) -> WorkerStats {
        self.counters.snapshot()
    }
}

/// Applies outbox jobs to product rows.
///
/// Jobs run in catalog-version order. Each plan is applied in one store
/// transaction that also deletes the job and records its version as
/// propagated. A plan whose version is already propagated is dropped without
/// touching rows, so an older plan never overwrites a newer one.
pub struct PropagationWorker<S> {
    store: Arc<S>,
    config: WorkerConfig,
    counters: Arc<WorkerCounters>,
}

impl<S> Clone for PropagationWorker<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            config: self.config.clone(),
            counters: self.counters.clone(),
        }
    }
}

impl<S: Store + JobStore> PropagationWorker<S> {
    pub fn new(store: Arc<S>, config: WorkerConfig) -> Self {
        Self {
            store,
            config,
            counters: Arc::new(WorkerCounters::default()),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn stats(&self) -> WorkerStats {
        self.counters.snapshot()
    }

    /// Claim and process the oldest ready job, if any.
    pub async fn run_once(&self) -> Result<Option<JobRunOutcome>, EngineError> {
        let Some(job) = self.store.claim_next(Utc::now(), self.config.lease).await? else {
            return Ok(None);
        };
        self.process(job).await.map(Some)
    }

    /// Claim and process one specific job. `None` if it is not claimable
    /// right now (finished, leased by someone else, or backing off).
    pub async fn attempt(&self, job_id: JobId) -> Result<Option<JobRunOutcome>, EngineError> {
        let Some(job) = self.store.claim(job_id, Utc::now(), self.config.lease).await? else {
            return Ok(None);
        };
        self.process(job).await.map(Some)
    }

    /// Process jobs until none is ready. Returns how many were processed.
    pub async fn drain(&self) -> Result<usize, EngineError> {
        let mut processed = 0;
        while self.run_once().await?.is_some() {
            processed += 1;
        }
        Ok(processed)
    }

    pub async fn dead_letters(&self, limit: usize) -> Result<Vec<DeadLetterEntry>, EngineError> {
        Ok(self.store.list_dead_letters(limit).await?)
    }

    #[instrument(skip(self), fields(worker = %self.config.name), err)]
    pub async fn requeue(&self, job_id: JobId) -> Result<PropagationJob, EngineError> {
        let job = self.store.requeue_dead_letter(job_id).await?;
        info!(job_id = %job.id, catalog_version = job.catalog_version(), "dead-lettered job requeued");
        Ok(job)
    }

    #[instrument(
        skip(self, job),
        fields(
            worker = %self.config.name,
            job_id = %job.id,
            catalog_version = job.catalog_version(),
            attempt = job.attempt
        )
    )]
    async fn process(&self, job: PropagationJob) -> Result<JobRunOutcome, EngineError> {
        let result = apply_plan(&*self.store, &job).await;
        self.settle(job, result).await
    }

    /// Record the result of one attempt: completion, retry with backoff, or
    /// dead letter once the retry policy is exhausted.
    pub(crate) async fn settle(
        &self,
        mut job: PropagationJob,
        result: Result<usize, EngineError>,
    ) -> Result<JobRunOutcome, EngineError> {
        let outcome = match result {
            Ok(edits) => {
                info!(job_id = %job.id, patches = job.plan.len(), edits, "catalog propagation applied");
                JobRunOutcome::Completed {
                    job_id: job.id,
                    edits,
                }
            }
            Err(err) => {
                let failure = DomainError::propagation(err.to_string());
                job.mark_failed(failure.to_string(), &self.config.retry_policy, Utc::now());

                if let JobStatus::DeadLettered { error: message } = job.status.clone() {
                    error!(
                        job_id = %job.id,
                        attempts = job.attempt,
                        error = %message,
                        "catalog propagation dead-lettered"
                    );
                    let job_id = job.id;
                    self.store.dead_letter(job, message.clone()).await?;
                    JobRunOutcome::DeadLettered {
                        job_id,
                        error: message,
                    }
                } else {
                    warn!(
                        job_id = %job.id,
                        attempt = job.attempt,
                        retry_at = ?job.scheduled_at,
                        error = %failure,
                        "catalog propagation failed, will retry"
                    );
                    self.store.update_job(&job).await?;
                    JobRunOutcome::Retrying {
                        job_id: job.id,
                        attempt: job.attempt,
                        error: failure.to_string(),
                    }
                }
            }
        };

        self.counters.record(&outcome);
        Ok(outcome)
    }

    /// Poll until `shutdown` resolves.
    pub async fn run_until<F>(&self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        info!(worker = %self.config.name, "propagation worker started");

        loop {
            let idle = match self.run_once().await {
                Ok(Some(outcome)) => {
                    debug!(worker = %self.config.name, job_id = %outcome.job_id(), ?outcome, "job processed");
                    false
                }
                Ok(None) => true,
                Err(err) => {
                    error!(worker = %self.config.name, error = %err, "failed to process job");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = &mut shutdown => break,
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
            } else {
                tokio::select! {
                    biased;
                    _ = &mut shutdown => break,
                    _ = std::future::ready(()) => {}
                }
            }
        }

        info!(worker = %self.config.name, "propagation worker stopped");
    }

    /// Run on the tokio runtime until the handle is shut down.
    pub fn spawn(self) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let counters = self.counters.clone();

        let join = tokio::spawn(async move {
            self.run_until(async {
                let _ = shutdown_rx.await;
            })
            .await;
        });

        WorkerHandle {
            shutdown: Some(shutdown_tx),
            join: Some(join),
            counters,
        }
    }
}

/// Apply a job's plan and retire the job, all in one transaction.
async fn apply_plan<S: Store>(store: &S, job: &PropagationJob) -> Result<usize, EngineError> {
    let mut tx = store.begin().await?;

    let propagated = tx.propagated_version().await?;
    if job.catalog_version() <= propagated {
        debug!(
            job_id = %job.id,
            catalog_version = job.catalog_version(),
            propagated,
            "plan superseded by a newer propagation, skipped"
        );
        tx.complete_job(job.id, propagated).await?;
        tx.commit().await?;
        return Ok(0);
    }

    let mut targets: Vec<&ArchetypeRef> = Vec::new();
    for patch in &job.plan.patches {
        if !targets.contains(&patch.target()) {
            targets.push(patch.target());
        }
    }

    let mut rows: BTreeMap<ProductId, Product> = BTreeMap::new();
    for target in targets {
        for product in tx.products_referencing(target).await? {
            rows.entry(product.id_typed()).or_insert(product);
        }
    }

    let before = rows.clone();
    let edits = job.plan.apply_all(rows.values_mut());

    for (id, product) in &rows {
        if before.get(id) != Some(product) {
            tx.save_product(product).await?;
        }
    }

    tx.complete_job(job.id, job.catalog_version()).await?;
    tx.commit().await?;
    Ok(edits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use stockroom_catalog::{ArchetypeRef, ProductPatch, PropagationPlan};
    use stockroom_core::{ArchetypeId, Money};

    fn test_worker(store: Arc<InMemoryStore>, max_attempts: u32) -> PropagationWorker<InMemoryStore> {
        let config = WorkerConfig::default()
            .with_name("test-worker")
            .with_retry_policy(RetryPolicy::fixed(max_attempts, Duration::ZERO));
        PropagationWorker::new(store, config)
    }

    async fn enqueue(store: &InMemoryStore, plan: PropagationPlan) -> JobId {
        let job = PropagationJob::new(plan);
        let mut tx = store.begin().await.unwrap();
        tx.enqueue_job(&job).await.unwrap();
        tx.commit().await.unwrap();
        job.id
    }

    #[tokio::test]
    async fn applies_plan_and_completes_job() {
        let store = InMemoryStore::arc();
        let archetype = ArchetypeId::new();
        let product = Product::bulk(ProductId::new(), Money::new(40_000), 3, "Phone X")
            .with_archetype(archetype);
        let mut tx = store.begin().await.unwrap();
        tx.insert_product(&product).await.unwrap();
        tx.commit().await.unwrap();

        let job_id = enqueue(
            &store,
            PropagationPlan {
                catalog_version: 1,
                patches: vec![ProductPatch::SetBasePrice {
                    target: ArchetypeRef::new(archetype, "Phone X"),
                    price: Money::new(42_000),
                    except_storages: vec![],
                }],
            },
        )
        .await;

        let worker = test_worker(store.clone(), 3);
        let outcome = worker.run_once().await.unwrap().unwrap();
        assert_eq!(outcome, JobRunOutcome::Completed { job_id, edits: 1 });

        let updated = store.product(product.id_typed()).await.unwrap();
        assert_eq!(updated.price(), Money::new(42_000));
        assert!(store.get_job(job_id).await.unwrap().is_none());
        assert!(worker.run_once().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failures_retry_then_dead_letter_then_requeue() {
        let store = InMemoryStore::arc();
        let job_id = enqueue(&store, PropagationPlan::default()).await;
        let worker = test_worker(store.clone(), 2);

        let job = store.claim(job_id, Utc::now(), worker.config().lease).await.unwrap().unwrap();
        let outcome = worker
            .settle(job, Err(EngineError::storage("connection reset")))
            .await
            .unwrap();
        assert!(matches!(outcome, JobRunOutcome::Retrying { attempt: 1, .. }));

        let job = store.claim(job_id, Utc::now(), worker.config().lease).await.unwrap().unwrap();
        let outcome = worker
            .settle(job, Err(EngineError::storage("connection reset")))
            .await
            .unwrap();
        assert!(matches!(outcome, JobRunOutcome::DeadLettered { .. }));

        let dead = worker.dead_letters(10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert!(dead[0].reason.contains("catalog propagation failed"));

        worker.requeue(job_id).await.unwrap();
        let outcome = worker.run_once().await.unwrap().unwrap();
        assert!(outcome.is_completed());

        let stats = worker.stats();
        assert_eq!(stats.jobs_processed, 3);
        assert_eq!(stats.jobs_dead_lettered, 1);
    }

    #[tokio::test]
    async fn spawned_worker_drains_queue_and_stops() {
        let store = InMemoryStore::arc();
        let job_id = enqueue(&store, PropagationPlan::default()).await;

        let mut config = WorkerConfig::default().with_name("spawned");
        config.poll_interval = Duration::from_millis(10);
        let handle = PropagationWorker::new(store.clone(), config).spawn();

        for _ in 0..100 {
            if handle.stats().jobs_succeeded == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.shutdown().await;

        assert!(store.get_job(job_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn superseded_plan_leaves_rows_alone() {
        let store = InMemoryStore::arc();
        let archetype = ArchetypeId::new();
        let product = Product::bulk(ProductId::new(), Money::new(40_000), 3, "Phone X")
            .with_archetype(archetype);
        let mut tx = store.begin().await.unwrap();
        tx.insert_product(&product).await.unwrap();
        tx.commit().await.unwrap();

        let price_plan = |version: u64, price: u64| PropagationPlan {
            catalog_version: version,
            patches: vec![ProductPatch::SetBasePrice {
                target: ArchetypeRef::new(archetype, "Phone X"),
                price: Money::new(price),
                except_storages: vec![],
            }],
        };
        let worker = test_worker(store.clone(), 3);

        enqueue(&store, price_plan(3, 42_000)).await;
        assert!(worker.run_once().await.unwrap().unwrap().is_completed());

        // A plan from an older catalog that turns up late.
        let late = enqueue(&store, price_plan(2, 41_000)).await;
        let outcome = worker.run_once().await.unwrap().unwrap();
        assert_eq!(outcome, JobRunOutcome::Completed { job_id: late, edits: 0 });

        let row = store.product(product.id_typed()).await.unwrap();
        assert_eq!(row.price(), Money::new(42_000));
        assert!(store.get_job(late).await.unwrap().is_none());
    }
}
